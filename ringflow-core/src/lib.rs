//! Ringflow - two-party call signaling coordinator
//!
//! This library coordinates the lifecycle of audio/video call sessions between
//! two participants. The media engine, the billing backend and the push
//! channel are external; the core decides what happens when. It features:
//!
//! - **Session state machine**: a pure transition function per call, driven by
//!   one serialized event queue
//! - **Dual-channel signaling**: push notifications backed by a status-poll
//!   fallback, deduplicated per call and effect
//! - **Generation-scoped timers**: ring, peer-presence and exhaustion timers
//!   that cannot fire into a reset or disposed session
//! - **Media gating**: the local camera and microphone activate only after the
//!   call has been accepted, and at most once
//! - **Per-minute billing** with bonus time and low-balance handling
//! - **Candidate matching**: ring a list of candidates one at a time until
//!   one accepts
//!
//! # Examples
//!
//! ```rust,no_run
//! use ringflow_core::loopback::{LoopbackBackend, LoopbackMedia, LoopbackPush, Script};
//! use ringflow_core::{CallService, CallType, PeerId, SessionState};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let push = Arc::new(LoopbackPush::new());
//! let backend = Arc::new(LoopbackBackend::new().linked_to(push.clone()));
//! backend.script(&PeerId::new("bob"), Script::AnswerAfter(Duration::from_secs(3)));
//!
//! let service = CallService::builder()
//!     .local_user(PeerId::new("alice"))
//!     .backend(backend.clone())
//!     .status(backend)
//!     .push(push)
//!     .media(Arc::new(LoopbackMedia::new()))
//!     .build()?;
//! service.start().await?;
//!
//! let session = service.start_outbound(PeerId::new("bob"), CallType::Video)?;
//! session.wait_until(|s| s.state == SessionState::Accepted).await?;
//! let outcome = service.end_locally(session.id()).await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and data structures
pub mod types;

/// Peer identity
pub mod identity;

/// Coordinator configuration
pub mod config;

/// Canonical session events
pub mod event;

/// Processed-event registry for cross-channel dedup
pub mod registry;

/// Generation-scoped named timers
pub mod timeout;

/// Connected-time billing
pub mod billing;

/// Media transport seam and join gate
pub mod media;

/// Call session state machine
pub mod machine;

/// Push and status-poll channels
pub mod signaling;

/// Call-control and billing backend seam
pub mod backend;

/// Dual-channel event coordination
pub mod coordinator;

/// Per-session actor and handles
pub mod session;

/// Candidate matching
pub mod matching;

/// Call service orchestration
pub mod service;

/// In-memory collaborators for tests and demos
pub mod loopback;

// Re-export main types at crate root
pub use backend::{
    BackendError, CallBackend, DeductionOutcome, InitiatedCall, PeerCapabilities, RetryPolicy,
};
pub use billing::{BillingTicker, Deduction, TickOutcome};
pub use config::{ConfigError, CoordinatorConfig};
pub use coordinator::{EventCoordinator, EventFeed};
pub use event::{EffectKind, Envelope, SessionEvent, TimerName};
pub use identity::PeerId;
pub use machine::{BackendNotice, CallSession, SessionTimings, SideEffect};
pub use matching::{
    CandidateQueue, MatchController, MatchOutcome, MatchQueueScheduler, MatchReport, MatchStatus,
    MatchedCall,
};
pub use media::{MediaError, MediaEvent, MediaJoinGate, MediaTransport};
pub use registry::{ProcessedEventRegistry, SharedRegistry};
pub use service::{CallService, CallServiceBuilder, ServiceError, ServiceEvent};
pub use session::{InboundRing, SessionContext, SessionError, SessionHandle};
pub use signaling::{PushChannel, PushMessage, RemoteCallStatus, SignalingError, StatusChannel};
pub use timeout::TimeoutSupervisor;
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::{CallBackend, PeerCapabilities};
    pub use crate::config::CoordinatorConfig;
    pub use crate::identity::PeerId;
    pub use crate::matching::{MatchController, MatchOutcome, MatchReport};
    pub use crate::media::{MediaEvent, MediaTransport};
    pub use crate::service::{CallService, ServiceError, ServiceEvent};
    pub use crate::session::SessionHandle;
    pub use crate::signaling::{PushChannel, PushMessage, StatusChannel};
    pub use crate::types::{
        CallId, CallOutcome, CallType, SessionId, SessionSnapshot, SessionState,
        TerminationReason,
    };
}
