//! Canonical session events
//!
//! Everything that can move a session forward is normalized into a
//! [`SessionEvent`] and wrapped in an [`Envelope`] carrying the call id and
//! generation it was produced for. Push messages, poll results, media
//! callbacks, timer fires, backend replies and local commands all travel
//! through the same per-session queue as envelopes.

use crate::backend::DeductionOutcome;
use crate::signaling::RemoteCallStatus;
use crate::types::{CallId, CallSummary, MediaCredentials, TerminationReason};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named session timers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerName {
    /// Outbound ring went unanswered (caller) or inbound ring expired (receiver)
    RingTimeout,
    /// Peer has not appeared in the media channel yet
    PeerPresence,
    /// One-off extension after the presence recheck
    PresenceGrace,
    /// Delay between budget exhaustion and the forced end
    ExhaustionGrace,
}

impl TimerName {
    /// Stable name used in logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RingTimeout => "ring-timeout",
            Self::PeerPresence => "peer-presence",
            Self::PresenceGrace => "presence-grace",
            Self::ExhaustionGrace => "exhaustion-grace",
        }
    }
}

impl fmt::Display for TimerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effects that may arrive through both channels and must apply once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EffectKind {
    /// Peer accepted
    Accept,
    /// Peer declined
    Reject,
    /// Peer busy
    Busy,
    /// Call cancelled
    Cancel,
    /// Call ended remotely
    End,
    /// Call missed or timed out on the backend
    Missed,
}

/// Canonical session event
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Backend placed the call and the peer is being rung
    Rang {
        /// Backend-assigned call id
        call_id: CallId,
        /// Media channel credentials for this call
        credentials: MediaCredentials,
        /// Purchased call budget
        max_duration_seconds: u64,
    },
    /// Backend refused to place the call
    InitiationFailed {
        /// Classified cause
        reason: TerminationReason,
    },
    /// Peer accepted
    Accepted,
    /// Peer declined
    Rejected {
        /// Reason given by the peer
        reason: String,
    },
    /// Peer is busy
    Busy,
    /// Call cancelled by the other side or the backend
    Cancelled {
        /// Reason given
        reason: String,
    },
    /// Remote side ended the call
    RemoteEnded,
    /// Backend marked the call missed or timed out
    Missed,
    /// Extra call budget granted
    BonusTime {
        /// Seconds added to the budget
        seconds: u64,
    },
    /// Media gate started the transport join
    MediaJoinStarted,
    /// Local media join completed
    JoinSucceeded,
    /// Local media join failed
    JoinFailed {
        /// Transport error code
        code: i32,
    },
    /// Peer appeared in the media channel
    PeerJoined {
        /// Transport handle of the peer
        peer_handle: u32,
    },
    /// Peer left the media channel
    PeerLeft {
        /// Transport reason code
        reason_code: i32,
    },
    /// Media connection dropped
    ConnectionLost,
    /// A named timer fired
    TimerFired(TimerName),
    /// Result of the one-off presence recheck; `None` when the check failed
    StatusChecked {
        /// Backend status
        status: Option<RemoteCallStatus>,
    },
    /// One second of connected time elapsed
    Tick,
    /// Result of a per-minute deduction
    Deducted {
        /// Billed minute
        minute: u64,
        /// Backend verdict; `None` when every retry failed
        outcome: Option<DeductionOutcome>,
    },
    /// Backend accounting for the finished call
    Summary(CallSummary),
    /// Local user accepted the incoming call
    LocalAccept,
    /// Local user declined the incoming call
    LocalReject {
        /// Reason sent to the backend
        reason: String,
    },
}

impl SessionEvent {
    /// Dedup key for effects that may arrive through both channels
    #[must_use]
    pub fn effect_kind(&self) -> Option<EffectKind> {
        match self {
            Self::Accepted => Some(EffectKind::Accept),
            Self::Rejected { .. } => Some(EffectKind::Reject),
            Self::Busy => Some(EffectKind::Busy),
            Self::Cancelled { .. } => Some(EffectKind::Cancel),
            Self::RemoteEnded => Some(EffectKind::End),
            Self::Missed => Some(EffectKind::Missed),
            _ => None,
        }
    }

    /// Short name used in logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rang { .. } => "rang",
            Self::InitiationFailed { .. } => "initiation-failed",
            Self::Accepted => "accepted",
            Self::Rejected { .. } => "rejected",
            Self::Busy => "busy",
            Self::Cancelled { .. } => "cancelled",
            Self::RemoteEnded => "remote-ended",
            Self::Missed => "missed",
            Self::BonusTime { .. } => "bonus-time",
            Self::MediaJoinStarted => "media-join-started",
            Self::JoinSucceeded => "join-succeeded",
            Self::JoinFailed { .. } => "join-failed",
            Self::PeerJoined { .. } => "peer-joined",
            Self::PeerLeft { .. } => "peer-left",
            Self::ConnectionLost => "connection-lost",
            Self::TimerFired(_) => "timer-fired",
            Self::StatusChecked { .. } => "status-checked",
            Self::Tick => "tick",
            Self::Deducted { .. } => "deducted",
            Self::Summary(_) => "summary",
            Self::LocalAccept => "local-accept",
            Self::LocalReject { .. } => "local-reject",
        }
    }
}

/// An event addressed to one session instance
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Call the event belongs to; `None` for locally produced events
    pub call_id: Option<CallId>,
    /// Session generation the producer captured
    pub generation: u64,
    /// The event
    pub event: SessionEvent,
}

impl Envelope {
    /// Event produced inside this process for the given generation
    pub fn local(generation: u64, event: SessionEvent) -> Self {
        Self {
            call_id: None,
            generation,
            event,
        }
    }

    /// Event that arrived for a specific call
    pub fn remote(call_id: CallId, generation: u64, event: SessionEvent) -> Self {
        Self {
            call_id: Some(call_id),
            generation,
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_channel_effects_are_deduplicated() {
        assert_eq!(SessionEvent::Accepted.effect_kind(), Some(EffectKind::Accept));
        assert_eq!(
            SessionEvent::Rejected {
                reason: "no".into()
            }
            .effect_kind(),
            Some(EffectKind::Reject)
        );
        assert_eq!(SessionEvent::Tick.effect_kind(), None);
        assert_eq!(SessionEvent::JoinSucceeded.effect_kind(), None);
        assert_eq!(
            SessionEvent::TimerFired(TimerName::RingTimeout).effect_kind(),
            None
        );
    }

    #[test]
    fn test_timer_names() {
        assert_eq!(TimerName::RingTimeout.to_string(), "ring-timeout");
        assert_eq!(TimerName::PeerPresence.as_str(), "peer-presence");
    }
}
