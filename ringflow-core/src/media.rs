//! Media transport gate
//!
//! The media engine itself is external; this module only consumes its
//! join/leave/mute contract. [`MediaJoinGate`] makes sure the local camera and
//! microphone are activated at most once per session, and only when the
//! session asks for it.
//!
//! Transport callbacks are a closed set of [`MediaEvent`]s that are fed back
//! into the session queue like any other event.

use crate::coordinator::EventFeed;
use crate::event::SessionEvent;
use crate::types::MediaCredentials;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Transport could not be initialized
    #[error("Media transport initialization failed for app {0}")]
    InitFailed(String),

    /// Join was refused by the transport
    #[error("Join failed with code {0}")]
    JoinFailed(i32),
}

impl MediaError {
    /// Transport error code
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::InitFailed(_) => -1,
            Self::JoinFailed(code) => *code,
        }
    }
}

/// Asynchronous callbacks raised by the media transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaEvent {
    /// Remote user appeared in the channel
    PeerJoined {
        /// Transport handle of the peer
        handle: u32,
    },
    /// Remote user left the channel
    PeerLeft {
        /// Transport handle of the peer
        handle: u32,
        /// Transport reason code
        reason_code: i32,
    },
    /// Connection to the media service dropped
    ConnectionLost,
}

impl From<MediaEvent> for SessionEvent {
    fn from(event: MediaEvent) -> Self {
        match event {
            MediaEvent::PeerJoined { handle } => Self::PeerJoined {
                peer_handle: handle,
            },
            MediaEvent::PeerLeft { reason_code, .. } => Self::PeerLeft { reason_code },
            MediaEvent::ConnectionLost => Self::ConnectionLost,
        }
    }
}

/// External media transport provider
#[async_trait]
pub trait MediaTransport: Send + Sync {
    /// Initialize the engine; returns whether it is usable
    async fn initialize(&self, app_id: &str) -> bool;

    /// Join a channel; resolves once the join succeeded or failed
    async fn join(&self, channel: &str, token: &str) -> Result<(), MediaError>;

    /// Leave the current channel
    async fn leave(&self);

    /// Mute or unmute the local microphone
    async fn set_muted(&self, muted: bool);

    /// Route audio to the loudspeaker
    async fn set_speaker(&self, enabled: bool);

    /// Stream of transport callbacks
    fn events(&self) -> BoxStream<'static, MediaEvent>;
}

/// At-most-once media join for one session
pub struct MediaJoinGate {
    transport: Arc<dyn MediaTransport>,
    started: AtomicBool,
    left: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MediaJoinGate {
    /// Create a gate over the shared transport
    pub fn new(transport: Arc<dyn MediaTransport>) -> Self {
        Self {
            transport,
            started: AtomicBool::new(false),
            left: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Whether the join has been started
    #[must_use]
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Start the transport join unless it already started
    ///
    /// `MediaJoinStarted` is delivered first, followed by the join result and
    /// any transport callbacks. Returns `true` only for the call that actually
    /// started the join.
    pub fn try_join(&self, credentials: &MediaCredentials, feed: EventFeed) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::trace!(call_id = %feed.call_id(), "Media join already started");
            return false;
        }
        tracing::info!(call_id = %feed.call_id(), channel = %credentials.channel, "Joining media channel");
        feed.deliver(SessionEvent::MediaJoinStarted);

        // Subscribe before joining so an early PeerJoined is not missed
        let mut events = self.transport.events();
        let forward_feed = feed.clone();
        let forward = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                tracing::trace!(?event, "Media transport event");
                if !forward_feed.deliver(event.into()) && forward_feed.is_closed() {
                    break;
                }
            }
        });

        let transport = Arc::clone(&self.transport);
        let credentials = credentials.clone();
        let join = tokio::spawn(async move {
            match transport.join(&credentials.channel, &credentials.token).await {
                Ok(()) => {
                    tracing::debug!(call_id = %feed.call_id(), "Media join succeeded");
                    feed.deliver(SessionEvent::JoinSucceeded);
                }
                Err(e) => {
                    tracing::warn!(call_id = %feed.call_id(), error = %e, "Media join failed");
                    feed.deliver(SessionEvent::JoinFailed { code: e.code() });
                }
            }
        });

        self.tasks.lock().extend([forward, join]);
        true
    }

    /// Leave the channel; no-op if no join started or already left
    pub async fn leave(&self) {
        if !self.has_started() || self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::debug!("Leaving media channel");
        self.transport.leave().await;
    }

    /// Mute or unmute; no-op before the join
    pub async fn set_muted(&self, muted: bool) {
        if self.is_live() {
            self.transport.set_muted(muted).await;
        }
    }

    /// Toggle the loudspeaker; no-op before the join
    pub async fn set_speaker(&self, enabled: bool) {
        if self.is_live() {
            self.transport.set_speaker(enabled).await;
        }
    }

    fn is_live(&self) -> bool {
        self.has_started() && !self.left.load(Ordering::SeqCst)
    }
}

impl Drop for MediaJoinGate {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::event::Envelope;
    use crate::loopback::LoopbackMedia;
    use crate::registry::ProcessedEventRegistry;
    use crate::session::SessionInput;
    use crate::types::CallId;
    use tokio::sync::mpsc;

    fn credentials() -> MediaCredentials {
        MediaCredentials {
            channel: "room-1".to_string(),
            token: "secret".to_string(),
        }
    }

    fn feed() -> (EventFeed, mpsc::UnboundedReceiver<SessionInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = EventFeed::new(
            CallId::new("call-1"),
            1,
            tx,
            ProcessedEventRegistry::shared(16),
        );
        (feed, rx)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionInput>) -> SessionEvent {
        match rx.recv().await.unwrap() {
            SessionInput::Event(Envelope { event, .. }) => event,
            other => panic!("unexpected input {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_happens_once() {
        let media = Arc::new(LoopbackMedia::new());
        let gate = MediaJoinGate::new(media.clone());
        let (feed, mut rx) = feed();

        assert!(gate.try_join(&credentials(), feed.clone()));
        assert!(!gate.try_join(&credentials(), feed));

        assert_eq!(next_event(&mut rx).await, SessionEvent::MediaJoinStarted);
        assert_eq!(next_event(&mut rx).await, SessionEvent::JoinSucceeded);
        assert_eq!(media.join_count(), 1);
    }

    #[tokio::test]
    async fn test_controls_are_noops_before_join() {
        let media = Arc::new(LoopbackMedia::new());
        let gate = MediaJoinGate::new(media.clone());

        gate.set_muted(true).await;
        gate.set_speaker(true).await;
        gate.leave().await;

        assert_eq!(media.leave_count(), 0);
        assert_eq!(media.muted(), None);
        assert_eq!(media.speaker(), None);
    }

    #[tokio::test]
    async fn test_leave_once_after_join() {
        let media = Arc::new(LoopbackMedia::new());
        let gate = MediaJoinGate::new(media.clone());
        let (feed, _rx) = feed();

        gate.try_join(&credentials(), feed);
        gate.set_muted(true).await;
        gate.leave().await;
        gate.leave().await;
        gate.set_speaker(true).await;

        assert_eq!(media.leave_count(), 1);
        assert_eq!(media.muted(), Some(true));
        assert_eq!(media.speaker(), None);
    }

    #[tokio::test]
    async fn test_transport_events_are_forwarded() {
        let media = Arc::new(LoopbackMedia::new());
        media.fail_join_with(17);
        let gate = MediaJoinGate::new(media.clone());
        let (feed, mut rx) = feed();

        gate.try_join(&credentials(), feed);
        assert_eq!(next_event(&mut rx).await, SessionEvent::MediaJoinStarted);
        assert_eq!(
            next_event(&mut rx).await,
            SessionEvent::JoinFailed { code: 17 }
        );

        media.emit(MediaEvent::PeerJoined { handle: 42 });
        assert_eq!(
            next_event(&mut rx).await,
            SessionEvent::PeerJoined { peer_handle: 42 }
        );
    }
}
