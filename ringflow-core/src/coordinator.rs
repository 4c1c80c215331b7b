//! Dual-channel event coordination
//!
//! Attaches a session to both the push channel and the status-poll fallback,
//! normalizes what they report into [`SessionEvent`]s, and drops effects that
//! were already delivered through the other channel.
//!
//! Neither channel is trusted on its own. The push listener degrades silently
//! when its stream ends, and the poll loop keeps running until the session has
//! been accepted or ended, plus a short overlap to catch late races.

use crate::event::{Envelope, SessionEvent};
use crate::registry::SharedRegistry;
use crate::session::SessionInput;
use crate::signaling::{PushChannel, StatusChannel};
use crate::types::CallId;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Deduplicating sink into one session's queue
///
/// Every producer outside the session (channel listeners, media callbacks)
/// posts through a feed, so an effect is delivered at most once per call.
#[derive(Clone)]
pub struct EventFeed {
    call_id: CallId,
    generation: u64,
    sink: mpsc::UnboundedSender<SessionInput>,
    registry: SharedRegistry,
}

impl EventFeed {
    /// Create a feed for a call under the given session generation
    pub fn new(
        call_id: CallId,
        generation: u64,
        sink: mpsc::UnboundedSender<SessionInput>,
        registry: SharedRegistry,
    ) -> Self {
        Self {
            call_id,
            generation,
            sink,
            registry,
        }
    }

    /// Call this feed is scoped to
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    /// Post an event unless its effect was already delivered
    ///
    /// Returns whether the event was posted.
    pub fn deliver(&self, event: SessionEvent) -> bool {
        if let Some(kind) = event.effect_kind() {
            if !self.registry.lock().mark_processed(&self.call_id, kind) {
                tracing::trace!(call_id = %self.call_id, event = event.name(), "Dropping duplicate event");
                return false;
            }
        }
        let envelope = Envelope::remote(self.call_id.clone(), self.generation, event);
        self.sink.send(SessionInput::Event(envelope)).is_ok()
    }

    /// Whether the session queue is gone
    pub fn is_closed(&self) -> bool {
        self.sink.is_closed()
    }
}

/// Channel subscriptions of one session
pub struct EventCoordinator {
    call_id: CallId,
    push_task: JoinHandle<()>,
    poll_task: JoinHandle<()>,
    wind_down: watch::Sender<bool>,
}

impl EventCoordinator {
    /// Subscribe to both channels for the feed's call
    pub fn attach(
        feed: EventFeed,
        push: Arc<dyn PushChannel>,
        status: Arc<dyn StatusChannel>,
        poll_interval: Duration,
        poll_overlap: Duration,
    ) -> Self {
        let call_id = feed.call_id().clone();
        tracing::debug!(call_id = %call_id, "Attaching push and poll channels");

        let push_task = tokio::spawn(listen_push(feed.clone(), push));
        let (wind_down, wind_down_rx) = watch::channel(false);
        let poll_task = tokio::spawn(poll_status(
            feed,
            status,
            poll_interval,
            poll_overlap,
            wind_down_rx,
        ));

        Self {
            call_id,
            push_task,
            poll_task,
            wind_down,
        }
    }

    /// Keep polling only for the overlap window from now on
    pub fn wind_down(&self) {
        let started = self.wind_down.send_if_modified(|winding| {
            let changed = !*winding;
            *winding = true;
            changed
        });
        if started {
            tracing::debug!(call_id = %self.call_id, "Poll fallback winding down");
        }
    }

    /// Unsubscribe from both channels
    pub fn detach(&self) {
        self.push_task.abort();
        self.poll_task.abort();
    }

    /// Whether the poll loop is still running
    #[must_use]
    pub fn is_polling(&self) -> bool {
        !self.poll_task.is_finished()
    }
}

impl Drop for EventCoordinator {
    fn drop(&mut self) {
        self.detach();
    }
}

async fn listen_push(feed: EventFeed, push: Arc<dyn PushChannel>) {
    let mut messages = push.subscribe_call(feed.call_id());
    while let Some(message) = messages.next().await {
        tracing::trace!(call_id = %feed.call_id(), kind = message.kind(), "Push message received");
        if let Some(event) = message.normalize() {
            if !feed.deliver(event) && feed.is_closed() {
                return;
            }
        }
    }
    tracing::warn!(call_id = %feed.call_id(), "Push channel closed, continuing with status polling only");
}

async fn poll_status(
    feed: EventFeed,
    status: Arc<dyn StatusChannel>,
    interval: Duration,
    overlap: Duration,
    wind_down: watch::Receiver<bool>,
) {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut deadline: Option<Instant> = None;

    loop {
        ticker.tick().await;

        if deadline.is_none() && *wind_down.borrow() {
            deadline = Some(Instant::now() + overlap);
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            tracing::debug!(call_id = %feed.call_id(), "Poll overlap elapsed, stopping status polling");
            return;
        }

        match status.get_status(feed.call_id()).await {
            Ok(remote) => {
                tracing::trace!(call_id = %feed.call_id(), status = %remote, "Polled call status");
                if let Some(event) = remote.normalize() {
                    feed.deliver(event);
                }
            }
            Err(e) => {
                tracing::warn!(call_id = %feed.call_id(), error = %e, "Status poll failed, retrying on next tick");
            }
        }

        if feed.is_closed() {
            return;
        }
    }
}
