//! Call session types and data structures

use crate::identity::PeerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Backend-assigned identifier of a call
///
/// Opaque to the coordinator. Assigned by the backend when a call is
/// initiated, or carried by the inbound ring notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    /// Wrap a backend identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local handle of a call session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local handle of a matching queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueId(pub Uuid);

impl QueueId {
    /// Create a new random queue ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueueId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of media a call carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    /// Audio only
    Audio,
    /// Video with audio
    Video,
}

impl CallType {
    /// Wire name of the call type
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the call this session represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Placed the call
    Caller,
    /// Was rung
    Receiver,
}

/// Call session state
///
/// ```text
/// Idle ─► Initiating ─► RingingOut ─┐
///   └───► RingingIn ────────────────┴─► Accepted ─► MediaJoining ─► Connected ─► Ended
///
/// any non-terminal ─► Cancelled | Rejected | Busy | TimedOut | Failed | Ended
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Not yet started
    Idle,
    /// Waiting for the backend to place the call
    Initiating,
    /// Peer is being rung
    RingingOut,
    /// We are being rung
    RingingIn,
    /// Handshake accepted, media join requested
    Accepted,
    /// Media join in progress
    MediaJoining,
    /// Both sides present in the media channel
    Connected,
    /// Call ended after acceptance or by the remote side
    Ended,
    /// Cancelled before acceptance
    Cancelled,
    /// Declined by either side
    Rejected,
    /// Peer busy or unavailable
    Busy,
    /// Nobody answered in time
    TimedOut,
    /// Unrecoverable failure
    Failed,
}

impl SessionState {
    /// Whether no further transition is permitted
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Ended | Self::Cancelled | Self::Rejected | Self::Busy | Self::TimedOut | Self::Failed
        )
    }

    /// Whether the handshake has been accepted and the call is still live
    #[must_use]
    pub fn has_accepted(self) -> bool {
        matches!(self, Self::Accepted | Self::MediaJoining | Self::Connected)
    }

    /// Whether either side is still ringing
    #[must_use]
    pub fn is_ringing(self) -> bool {
        matches!(self, Self::RingingOut | Self::RingingIn)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Initiating => "initiating",
            Self::RingingOut => "ringing-out",
            Self::RingingIn => "ringing-in",
            Self::Accepted => "accepted",
            Self::MediaJoining => "media-joining",
            Self::Connected => "connected",
            Self::Ended => "ended",
            Self::Cancelled => "cancelled",
            Self::Rejected => "rejected",
            Self::Busy => "busy",
            Self::TimedOut => "timed-out",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Credentials for joining the media channel of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaCredentials {
    /// Media channel name
    pub channel: String,
    /// Join token for the channel
    pub token: String,
}

/// Why a session reached its terminal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum TerminationReason {
    /// Local user hung up
    LocalHangup,
    /// Local side cancelled before the call was accepted
    LocalCancel(String),
    /// Local user declined the incoming call
    LocalReject(String),
    /// Remote side ended the call
    RemoteEnded,
    /// Peer left the media channel
    PeerLeft,
    /// Peer declined the call
    PeerDeclined(String),
    /// Peer is in another call
    PeerBusy,
    /// Peer is offline or cannot be reached
    PeerUnavailable(String),
    /// Caller gave up while we were ringing
    RemoteCancelled(String),
    /// Ring timeout fired without an answer
    NoAnswer,
    /// Incoming call was never answered
    Missed,
    /// Media transport refused to join
    MediaInit(i32),
    /// Peer never appeared in the media channel
    PeerNeverJoined,
    /// Media connection dropped
    ConnectionLost,
    /// Connected time used up the purchased budget
    BalanceExhausted,
    /// Backend refused a deduction or the call itself
    InsufficientFunds,
    /// Backend could not place the call
    InitiationFailed(String),
}

impl TerminationReason {
    /// Whether the local user caused the termination
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Self::LocalHangup | Self::LocalCancel(_) | Self::LocalReject(_)
        )
    }

    /// User-facing error for this termination, if it is one
    #[must_use]
    pub fn error(&self) -> Option<CallError> {
        match self {
            Self::PeerBusy => Some(CallError::PeerUnavailable("busy".to_string())),
            Self::PeerUnavailable(detail) => Some(CallError::PeerUnavailable(detail.clone())),
            Self::PeerDeclined(_) => Some(CallError::PeerDeclined),
            Self::NoAnswer | Self::Missed => Some(CallError::NoAnswer),
            Self::MediaInit(code) => Some(CallError::MediaInit(*code)),
            Self::PeerNeverJoined => Some(CallError::PeerNeverJoined),
            Self::ConnectionLost => Some(CallError::ConnectionLost),
            Self::BalanceExhausted | Self::InsufficientFunds => Some(CallError::InsufficientFunds),
            Self::InitiationFailed(detail) => Some(CallError::InitiationFailed(detail.clone())),
            Self::LocalHangup
            | Self::LocalCancel(_)
            | Self::LocalReject(_)
            | Self::RemoteEnded
            | Self::PeerLeft
            | Self::RemoteCancelled(_) => None,
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalHangup => f.write_str("call ended"),
            Self::LocalCancel(reason) => write!(f, "cancelled: {reason}"),
            Self::LocalReject(reason) => write!(f, "declined: {reason}"),
            Self::RemoteEnded => f.write_str("peer ended the call"),
            Self::PeerLeft => f.write_str("peer left the call"),
            Self::PeerDeclined(_) => f.write_str("call declined"),
            Self::PeerBusy => f.write_str("peer is busy"),
            Self::PeerUnavailable(detail) => write!(f, "peer unavailable: {detail}"),
            Self::RemoteCancelled(_) => f.write_str("caller cancelled"),
            Self::NoAnswer => f.write_str("no answer"),
            Self::Missed => f.write_str("missed call"),
            Self::MediaInit(code) => write!(f, "media initialization failed (code {code})"),
            Self::PeerNeverJoined => f.write_str("peer did not join"),
            Self::ConnectionLost => f.write_str("connection lost"),
            Self::BalanceExhausted => f.write_str("balance exhausted"),
            Self::InsufficientFunds => f.write_str("insufficient funds"),
            Self::InitiationFailed(detail) => write!(f, "could not place call: {detail}"),
        }
    }
}

/// User-facing call errors
///
/// Duplicate and stale events are dropped silently and have no variant here.
/// Transient backend failures stay [`BackendError::Network`](crate::BackendError)
/// and are retried without surfacing.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallError {
    /// Peer busy or offline
    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    /// Peer declined
    #[error("Peer declined the call")]
    PeerDeclined,

    /// Ring timeout fired
    #[error("No answer")]
    NoAnswer,

    /// Media transport failed with the given code
    #[error("Media initialization failed with code {0}")]
    MediaInit(i32),

    /// Not enough balance
    #[error("Insufficient funds")]
    InsufficientFunds,

    /// Peer accepted but never reached the media channel
    #[error("Peer never joined the media channel")]
    PeerNeverJoined,

    /// Media connection dropped
    #[error("Connection lost")]
    ConnectionLost,

    /// Backend could not place the call
    #[error("Call initiation failed: {0}")]
    InitiationFailed(String),
}

/// Final accounting for a connected call, as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSummary {
    /// Billed duration in seconds
    pub duration_seconds: u64,
    /// Amount charged, in the backend's smallest currency unit
    pub amount_charged: u64,
}

/// How a session finished, from the owner's point of view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallOutcome {
    /// The peer was present at some point; show a call summary
    Connected {
        /// Connected seconds counted locally
        elapsed_seconds: u64,
        /// Backend accounting, once known
        summary: Option<CallSummary>,
    },
    /// Ended locally before the peer ever appeared; exit silently
    NeverConnected,
    /// Ended by an error or the remote side before connecting
    Error {
        /// Reason to render
        reason: TerminationReason,
    },
}

impl CallOutcome {
    /// Outcome for a session in `state`; `None` while it is still live
    #[must_use]
    pub fn resolve(
        state: SessionState,
        was_ever_connected: bool,
        elapsed_seconds: u64,
        summary: Option<CallSummary>,
        reason: Option<&TerminationReason>,
    ) -> Option<Self> {
        if !state.is_terminal() {
            return None;
        }
        if was_ever_connected {
            return Some(Self::Connected {
                elapsed_seconds,
                summary,
            });
        }
        match reason {
            Some(reason) if !reason.is_local() => Some(Self::Error {
                reason: reason.clone(),
            }),
            _ => Some(Self::NeverConnected),
        }
    }
}

/// Point-in-time view of a session, published to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Local session handle
    pub session_id: SessionId,
    /// Backend call identifier, once known
    pub call_id: Option<CallId>,
    /// Session role
    pub role: Role,
    /// Media kind
    pub call_type: CallType,
    /// Remote participant, when known
    pub peer: Option<PeerId>,
    /// Media channel credentials, once the backend has issued them
    pub credentials: Option<MediaCredentials>,
    /// Current state
    pub state: SessionState,
    /// Current generation
    pub generation: u64,
    /// Whether the peer was ever confirmed present in the media channel
    pub was_ever_connected: bool,
    /// Connected seconds
    pub elapsed_seconds: u64,
    /// Remaining budget in seconds, for metered sessions
    pub remaining_seconds: Option<u64>,
    /// Remaining budget is below the low-time threshold
    pub is_low_time: bool,
    /// Why the session ended
    pub termination_reason: Option<TerminationReason>,
    /// Backend accounting for the call
    pub summary: Option<CallSummary>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When the call connected
    pub connected_at: Option<DateTime<Utc>>,
    /// When the session reached a terminal state
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionSnapshot {
    /// Outcome of the session, once it is terminal
    #[must_use]
    pub fn outcome(&self) -> Option<CallOutcome> {
        CallOutcome::resolve(
            self.state,
            self.was_ever_connected,
            self.elapsed_seconds,
            self.summary,
            self.termination_reason.as_ref(),
        )
    }
}
