//! Timeout supervisor
//!
//! Named, generation-scoped timers for one session. Each timer captures the
//! session generation it was scheduled under; when it fires after the session
//! has moved to another generation it is discarded without effect.
//!
//! Timers never touch session state. Their `on_fire` callback is expected to
//! post an event into the owning session's queue.

use crate::event::TimerName;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

struct ActiveTimer {
    token: u64,
    handle: JoinHandle<()>,
}

type TimerTable = HashMap<(u64, TimerName), ActiveTimer>;

/// Schedules and cancels named timers for a session
pub struct TimeoutSupervisor {
    live_generation: Arc<AtomicU64>,
    timers: Arc<Mutex<TimerTable>>,
    next_token: AtomicU64,
}

impl TimeoutSupervisor {
    /// Create a supervisor whose live generation is `generation`
    pub fn new(generation: u64) -> Self {
        Self {
            live_generation: Arc::new(AtomicU64::new(generation)),
            timers: Arc::new(Mutex::new(HashMap::new())),
            next_token: AtomicU64::new(0),
        }
    }

    /// Generation whose timers are allowed to fire
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.live_generation.load(Ordering::SeqCst)
    }

    /// Move to a new generation, cancelling every timer of other generations
    pub fn advance_to(&self, generation: u64) {
        self.live_generation.store(generation, Ordering::SeqCst);
        let mut timers = self.timers.lock();
        timers.retain(|(timer_generation, name), timer| {
            if *timer_generation == generation {
                true
            } else {
                tracing::trace!(generation = timer_generation, timer = %name, "Cancelling superseded timer");
                timer.handle.abort();
                false
            }
        });
    }

    /// Schedule `on_fire` to run after `delay`
    ///
    /// A timer already active under the same generation and name is replaced.
    /// Scheduling for a generation other than the live one is ignored.
    pub fn schedule<F>(&self, generation: u64, name: TimerName, delay: Duration, on_fire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if generation != self.generation() {
            tracing::trace!(generation, timer = %name, "Ignoring timer for stale generation");
            return;
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let live = Arc::clone(&self.live_generation);
        let table = Arc::clone(&self.timers);

        // Hold the table lock across spawn so the task cannot observe the
        // table before its own entry is inserted.
        let mut timers = self.timers.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut timers = table.lock();
                if timers.get(&(generation, name)).map(|t| t.token) == Some(token) {
                    timers.remove(&(generation, name));
                }
            }
            if live.load(Ordering::SeqCst) != generation {
                tracing::trace!(generation, timer = %name, "Discarding stale timer fire");
                return;
            }
            tracing::debug!(generation, timer = %name, "Timer fired");
            on_fire();
        });
        if let Some(previous) = timers.insert((generation, name), ActiveTimer { token, handle }) {
            tracing::trace!(generation, timer = %name, "Replacing active timer");
            previous.handle.abort();
        }
    }

    /// Cancel a named timer; returns whether one was active
    pub fn cancel(&self, generation: u64, name: TimerName) -> bool {
        match self.timers.lock().remove(&(generation, name)) {
            Some(timer) => {
                timer.handle.abort();
                tracing::trace!(generation, timer = %name, "Timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every timer of a generation; returns how many were active
    pub fn cancel_all(&self, generation: u64) -> usize {
        let mut timers = self.timers.lock();
        let before = timers.len();
        timers.retain(|(timer_generation, _), timer| {
            if *timer_generation == generation {
                timer.handle.abort();
                false
            } else {
                true
            }
        });
        before - timers.len()
    }

    /// Cancel every timer regardless of generation
    pub fn shutdown(&self) {
        for (_, timer) in self.timers.lock().drain() {
            timer.handle.abort();
        }
    }

    /// Whether a named timer is pending
    #[must_use]
    pub fn is_active(&self, generation: u64, name: TimerName) -> bool {
        self.timers.lock().contains_key(&(generation, name))
    }

    /// Number of pending timers
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.timers.lock().len()
    }
}

impl Drop for TimeoutSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let make = move || -> Box<dyn FnOnce() + Send> {
            let fired = Arc::clone(&fired_clone);
            Box::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        (fired, make)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let supervisor = TimeoutSupervisor::new(1);
        let (fired, make) = counter();
        supervisor.schedule(1, TimerName::RingTimeout, Duration::from_secs(30), make());

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(supervisor.is_active(1, TimerName::RingTimeout));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let supervisor = TimeoutSupervisor::new(1);
        let (fired, make) = counter();
        supervisor.schedule(1, TimerName::PeerPresence, Duration::from_secs(5), make());
        assert!(supervisor.cancel(1, TimerName::PeerPresence));
        assert!(!supervisor.cancel(1, TimerName::PeerPresence));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescheduling_same_name_replaces_timer() {
        let supervisor = TimeoutSupervisor::new(1);
        let (fired, make) = counter();
        supervisor.schedule(1, TimerName::PresenceGrace, Duration::from_secs(5), make());
        supervisor.schedule(1, TimerName::PresenceGrace, Duration::from_secs(20), make());
        assert_eq!(supervisor.active_count(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_names_run_concurrently() {
        let supervisor = TimeoutSupervisor::new(3);
        let (fired, make) = counter();
        supervisor.schedule(3, TimerName::RingTimeout, Duration::from_secs(30), make());
        supervisor.schedule(3, TimerName::PeerPresence, Duration::from_secs(5), make());
        assert_eq!(supervisor.active_count(), 2);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.cancel_all(3), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_from_superseded_generation_is_discarded() {
        let supervisor = TimeoutSupervisor::new(7);
        let (fired, make) = counter();
        supervisor.schedule(7, TimerName::RingTimeout, Duration::from_secs(1), make());
        supervisor.advance_to(8);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        supervisor.schedule(7, TimerName::RingTimeout, Duration::from_secs(1), make());
        assert_eq!(supervisor.active_count(), 0);
    }
}
