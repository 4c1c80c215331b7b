//! Call signaling channels
//!
//! Two independent, unreliable paths carry the same logical call events: the
//! instant push channel and the periodic status poll. Both are consumed
//! through traits so any transport can be plugged in.

use crate::event::SessionEvent;
use crate::identity::PeerId;
use crate::types::{CallId, CallType};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Push channel is not connected
    #[error("Push channel not connected")]
    NotConnected,

    /// Message could not be delivered
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Status endpoint did not answer
    #[error("Status unavailable: {0}")]
    StatusUnavailable(String),

    /// Status string was not recognized
    #[error("Unknown call status: {0}")]
    UnknownStatus(String),
}

/// Message carried over the push channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// A call is ringing the local user
    Ring {
        /// Call ID
        call_id: CallId,
        /// Who is calling
        caller: PeerId,
        /// Media kind
        call_type: CallType,
        /// Media channel name
        channel: String,
        /// Media join token
        token: String,
    },

    /// Receiver accepted
    Accepted {
        /// Call ID
        call_id: CallId,
    },

    /// Receiver declined
    Rejected {
        /// Call ID
        call_id: CallId,
        /// Optional reason
        reason: Option<String>,
    },

    /// Receiver is in another call
    Busy {
        /// Call ID
        call_id: CallId,
    },

    /// Caller gave up or the backend cancelled the call
    Cancelled {
        /// Call ID
        call_id: CallId,
        /// Optional reason
        reason: Option<String>,
    },

    /// Other side hung up
    Ended {
        /// Call ID
        call_id: CallId,
    },

    /// Backend marked the call missed
    Missed {
        /// Call ID
        call_id: CallId,
    },

    /// Extra call budget granted
    BonusTime {
        /// Call ID
        call_id: CallId,
        /// Seconds granted
        seconds: u64,
    },
}

impl PushMessage {
    /// Get the call ID
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        match self {
            Self::Ring { call_id, .. }
            | Self::Accepted { call_id }
            | Self::Rejected { call_id, .. }
            | Self::Busy { call_id }
            | Self::Cancelled { call_id, .. }
            | Self::Ended { call_id }
            | Self::Missed { call_id }
            | Self::BonusTime { call_id, .. } => call_id,
        }
    }

    /// Canonical event for an existing session
    ///
    /// `Ring` creates a session rather than driving one, so it maps to `None`.
    #[must_use]
    pub fn normalize(&self) -> Option<SessionEvent> {
        match self {
            Self::Ring { .. } => None,
            Self::Accepted { .. } => Some(SessionEvent::Accepted),
            Self::Rejected { reason, .. } => Some(SessionEvent::Rejected {
                reason: reason.clone().unwrap_or_else(|| "declined".to_string()),
            }),
            Self::Busy { .. } => Some(SessionEvent::Busy),
            Self::Cancelled { reason, .. } => Some(SessionEvent::Cancelled {
                reason: reason.clone().unwrap_or_else(|| "cancelled".to_string()),
            }),
            Self::Ended { .. } => Some(SessionEvent::RemoteEnded),
            Self::Missed { .. } => Some(SessionEvent::Missed),
            Self::BonusTime { seconds, .. } => Some(SessionEvent::BonusTime { seconds: *seconds }),
        }
    }

    /// Message type for tracing
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ring { .. } => "ring",
            Self::Accepted { .. } => "accepted",
            Self::Rejected { .. } => "rejected",
            Self::Busy { .. } => "busy",
            Self::Cancelled { .. } => "cancelled",
            Self::Ended { .. } => "ended",
            Self::Missed { .. } => "missed",
            Self::BonusTime { .. } => "bonus_time",
        }
    }
}

/// Call status as reported by the poll endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteCallStatus {
    /// Still ringing
    Ringing,
    /// Receiver accepted
    Accepted,
    /// Call in progress
    Ongoing,
    /// Receiver declined
    Rejected,
    /// Caller cancelled
    Cancelled,
    /// Call ended
    Ended,
    /// Nobody answered
    Missed,
    /// Backend-side ring timeout
    Timeout,
}

impl RemoteCallStatus {
    /// Whether the backend considers the call over
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Cancelled | Self::Ended | Self::Missed | Self::Timeout
        )
    }

    /// Canonical event for this status; `Ringing` carries no news
    #[must_use]
    pub fn normalize(self) -> Option<SessionEvent> {
        match self {
            Self::Ringing => None,
            Self::Accepted | Self::Ongoing => Some(SessionEvent::Accepted),
            Self::Rejected => Some(SessionEvent::Rejected {
                reason: "declined".to_string(),
            }),
            Self::Cancelled => Some(SessionEvent::Cancelled {
                reason: "cancelled".to_string(),
            }),
            Self::Ended => Some(SessionEvent::RemoteEnded),
            Self::Missed | Self::Timeout => Some(SessionEvent::Missed),
        }
    }
}

impl fmt::Display for RemoteCallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ringing => "ringing",
            Self::Accepted => "accepted",
            Self::Ongoing => "ongoing",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Ended => "ended",
            Self::Missed => "missed",
            Self::Timeout => "timeout",
        };
        f.write_str(name)
    }
}

impl FromStr for RemoteCallStatus {
    type Err = SignalingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ringing" => Ok(Self::Ringing),
            "accepted" => Ok(Self::Accepted),
            "ongoing" => Ok(Self::Ongoing),
            "rejected" | "declined" => Ok(Self::Rejected),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            "ended" => Ok(Self::Ended),
            "missed" => Ok(Self::Missed),
            "timeout" => Ok(Self::Timeout),
            other => Err(SignalingError::UnknownStatus(other.to_string())),
        }
    }
}

/// Instant, best-effort push channel
///
/// Implement this for your specific transport (websocket, socket.io, etc.).
/// No delivery guarantee is assumed.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Connect to the push service
    async fn connect(&self) -> Result<(), SignalingError>;

    /// Send a message to the other participant
    async fn send(&self, message: PushMessage) -> Result<(), SignalingError>;

    /// Stream of every inbound message
    ///
    /// The stream ends when the channel disconnects.
    fn subscribe(&self) -> BoxStream<'static, PushMessage>;

    /// Stream of inbound messages for one call
    fn subscribe_call(&self, call_id: &CallId) -> BoxStream<'static, PushMessage> {
        let call_id = call_id.clone();
        self.subscribe()
            .filter(move |message| futures::future::ready(message.call_id() == &call_id))
            .boxed()
    }
}

/// Poll endpoint reporting the backend's view of a call
#[async_trait]
pub trait StatusChannel: Send + Sync {
    /// Current status of a call
    async fn get_status(&self, call_id: &CallId) -> Result<RemoteCallStatus, SignalingError>;
}
