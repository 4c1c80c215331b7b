//! In-memory collaborators
//!
//! Scripted stand-ins for the backend, push channel and media transport.
//! They let the whole coordinator run inside one process: the tests drive them
//! under tokio's paused clock and the CLI uses them to demonstrate call flows.
//! Every request is recorded so callers can assert on it afterwards.

use crate::backend::{
    BackendError, CallBackend, DeductionOutcome, InitiatedCall, PeerCapabilities,
};
use crate::identity::PeerId;
use crate::media::{MediaError, MediaEvent, MediaTransport};
use crate::signaling::{PushChannel, PushMessage, RemoteCallStatus, SignalingError, StatusChannel};
use crate::types::{CallId, CallSummary, CallType, MediaCredentials};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Amount charged per started minute by [`LoopbackBackend::end_call`]
pub const RATE_PER_MINUTE: u64 = 10;

/// How a scripted peer reacts to being rung
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Accept after the delay
    AnswerAfter(Duration),
    /// Decline after the delay
    RejectAfter(Duration),
    /// Already in a call; initiation is refused
    Busy,
    /// Let it ring
    NeverAnswer,
    /// Offline; initiation is refused
    Unreachable,
    /// The initiation request never gets a reply
    Unresponsive,
}

/// A request the loopback backend received
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    /// `initiate_call`
    Initiate {
        /// Target
        target: PeerId,
        /// Media kind
        call_type: CallType,
    },
    /// `accept_call`
    Accept(CallId),
    /// `reject_call`
    Reject {
        /// Call
        call_id: CallId,
        /// Reason
        reason: String,
    },
    /// `cancel_call`
    Cancel {
        /// Call
        call_id: CallId,
        /// Reason
        reason: String,
    },
    /// `end_call`
    End {
        /// Call
        call_id: CallId,
        /// Connected seconds
        elapsed_seconds: u64,
    },
    /// `deduct`
    Deduct {
        /// Call
        call_id: CallId,
        /// Connected seconds
        elapsed_seconds: u64,
    },
    /// `get_remaining_budget`
    Budget(PeerId),
    /// `fetch_capabilities`
    Capabilities(PeerId),
}

struct BackendState {
    next_call: u64,
    scripts: HashMap<PeerId, Script>,
    capabilities: HashMap<PeerId, Option<PeerCapabilities>>,
    budget: Result<u64, BackendError>,
    max_duration_seconds: u64,
    funded_minutes: Option<u64>,
    statuses: HashMap<CallId, RemoteCallStatus>,
    status_polls: HashMap<CallId, usize>,
    failing_polls: usize,
    log: Vec<BackendCall>,
}

impl BackendState {
    fn record(&mut self, call: BackendCall) {
        self.log.push(call);
    }

    /// Move a ringing call on; a call that already left `Ringing` keeps its status
    fn resolve_ringing(&mut self, call_id: &CallId, status: RemoteCallStatus) -> bool {
        match self.statuses.get_mut(call_id) {
            Some(current) if *current == RemoteCallStatus::Ringing => {
                *current = status;
                true
            }
            _ => false,
        }
    }
}

/// Scripted call-control backend and status endpoint
pub struct LoopbackBackend {
    state: Arc<Mutex<BackendState>>,
    push: Option<Arc<LoopbackPush>>,
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackBackend {
    /// Backend where every peer lets it ring and every balance is ample
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BackendState {
                next_call: 1,
                scripts: HashMap::new(),
                capabilities: HashMap::new(),
                budget: Ok(3_600),
                max_duration_seconds: 3_600,
                funded_minutes: None,
                statuses: HashMap::new(),
                status_polls: HashMap::new(),
                failing_polls: 0,
                log: Vec::new(),
            })),
            push: None,
        }
    }

    /// Mirror scripted peer reactions onto a push channel
    #[must_use]
    pub fn linked_to(mut self, push: Arc<LoopbackPush>) -> Self {
        self.push = Some(push);
        self
    }

    /// Script how `peer` reacts to being rung
    pub fn script(&self, peer: &PeerId, script: Script) {
        self.state.lock().scripts.insert(peer.clone(), script);
    }

    /// Set the call-type toggles of a candidate
    pub fn set_capabilities(&self, peer: &PeerId, capabilities: PeerCapabilities) {
        self.state
            .lock()
            .capabilities
            .insert(peer.clone(), Some(capabilities));
    }

    /// Make capability lookups for `peer` fail
    pub fn fail_capabilities(&self, peer: &PeerId) {
        self.state.lock().capabilities.insert(peer.clone(), None);
    }

    /// Remaining budget reported for the local user
    pub fn set_budget(&self, seconds: u64) {
        self.state.lock().budget = Ok(seconds);
    }

    /// Make budget lookups fail
    pub fn fail_budget(&self, error: BackendError) {
        self.state.lock().budget = Err(error);
    }

    /// Budget granted to newly placed calls
    pub fn set_max_duration(&self, seconds: u64) {
        self.state.lock().max_duration_seconds = seconds;
    }

    /// Number of minutes deductions succeed for; `None` is unlimited
    pub fn fund_minutes(&self, minutes: Option<u64>) {
        self.state.lock().funded_minutes = minutes;
    }

    /// Force the status reported for a call
    pub fn set_status(&self, call_id: &CallId, status: RemoteCallStatus) {
        self.state.lock().statuses.insert(call_id.clone(), status);
    }

    /// Status currently reported for a call
    #[must_use]
    pub fn status(&self, call_id: &CallId) -> Option<RemoteCallStatus> {
        self.state.lock().statuses.get(call_id).copied()
    }

    /// Fail the next `count` status polls
    pub fn fail_status_polls(&self, count: usize) {
        self.state.lock().failing_polls = count;
    }

    /// Status polls received for a call, failed ones included
    #[must_use]
    pub fn status_polls(&self, call_id: &CallId) -> usize {
        self.state
            .lock()
            .status_polls
            .get(call_id)
            .copied()
            .unwrap_or(0)
    }

    /// Register an inbound call from `caller` and ring the local user over push
    pub fn place_inbound(&self, caller: &PeerId, call_type: CallType) -> CallId {
        let (call_id, credentials) = {
            let mut state = self.state.lock();
            let n = state.next_call;
            state.next_call += 1;
            let call_id = CallId::new(format!("in-{n}"));
            state
                .statuses
                .insert(call_id.clone(), RemoteCallStatus::Ringing);
            (call_id, credentials_for(n))
        };
        if let Some(push) = &self.push {
            push.publish(PushMessage::Ring {
                call_id: call_id.clone(),
                caller: caller.clone(),
                call_type,
                channel: credentials.channel,
                token: credentials.token,
            });
        }
        call_id
    }

    /// Caller hangs up an inbound call before it is answered
    pub fn cancel_inbound(&self, call_id: &CallId) {
        let cancelled = self
            .state
            .lock()
            .resolve_ringing(call_id, RemoteCallStatus::Cancelled);
        if cancelled {
            if let Some(push) = &self.push {
                push.publish(PushMessage::Cancelled {
                    call_id: call_id.clone(),
                    reason: Some("caller hung up".to_string()),
                });
            }
        }
    }

    /// Every request received so far
    #[must_use]
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().log.clone()
    }

    /// Targets rung, in order
    #[must_use]
    pub fn initiated_targets(&self) -> Vec<PeerId> {
        self.state
            .lock()
            .log
            .iter()
            .filter_map(|call| match call {
                BackendCall::Initiate { target, .. } => Some(target.clone()),
                _ => None,
            })
            .collect()
    }

    /// Capability lookups made for `peer`
    #[must_use]
    pub fn capability_lookups(&self, peer: &PeerId) -> usize {
        self.count(|call| matches!(call, BackendCall::Capabilities(p) if p == peer))
    }

    /// Cancellations received for a call
    #[must_use]
    pub fn cancel_count(&self, call_id: &CallId) -> usize {
        self.count(|call| matches!(call, BackendCall::Cancel { call_id: c, .. } if c == call_id))
    }

    /// Rejections received for a call
    #[must_use]
    pub fn reject_count(&self, call_id: &CallId) -> usize {
        self.count(|call| matches!(call, BackendCall::Reject { call_id: c, .. } if c == call_id))
    }

    /// Acceptances received for a call
    #[must_use]
    pub fn accept_count(&self, call_id: &CallId) -> usize {
        self.count(|call| matches!(call, BackendCall::Accept(c) if c == call_id))
    }

    /// End notices received for a call
    #[must_use]
    pub fn end_count(&self, call_id: &CallId) -> usize {
        self.count(|call| matches!(call, BackendCall::End { call_id: c, .. } if c == call_id))
    }

    /// Deductions received for a call
    #[must_use]
    pub fn deduction_count(&self, call_id: &CallId) -> usize {
        self.count(|call| matches!(call, BackendCall::Deduct { call_id: c, .. } if c == call_id))
    }

    fn count(&self, predicate: impl Fn(&BackendCall) -> bool) -> usize {
        self.state.lock().log.iter().filter(|call| predicate(call)).count()
    }

    fn run_script(&self, call_id: CallId, script: Script) {
        let (delay, status, message) = match script {
            Script::AnswerAfter(delay) => (
                delay,
                RemoteCallStatus::Accepted,
                PushMessage::Accepted {
                    call_id: call_id.clone(),
                },
            ),
            Script::RejectAfter(delay) => (
                delay,
                RemoteCallStatus::Rejected,
                PushMessage::Rejected {
                    call_id: call_id.clone(),
                    reason: Some("declined".to_string()),
                },
            ),
            Script::NeverAnswer | Script::Busy | Script::Unreachable | Script::Unresponsive => {
                return
            }
        };
        let state = Arc::clone(&self.state);
        let push = self.push.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !state.lock().resolve_ringing(&call_id, status) {
                return;
            }
            tracing::debug!(call_id = %call_id, %status, "Scripted peer reacted");
            if let Some(push) = push {
                push.publish(message);
            }
        });
    }
}

fn credentials_for(n: u64) -> MediaCredentials {
    MediaCredentials {
        channel: format!("room-{n}"),
        token: format!("token-{n}"),
    }
}

#[async_trait]
impl CallBackend for LoopbackBackend {
    async fn initiate_call(
        &self,
        target: &PeerId,
        call_type: CallType,
    ) -> Result<InitiatedCall, BackendError> {
        let placed = {
            let mut state = self.state.lock();
            state.record(BackendCall::Initiate {
                target: target.clone(),
                call_type,
            });
            let script = state
                .scripts
                .get(target)
                .copied()
                .unwrap_or(Script::NeverAnswer);
            match script {
                Script::Busy => return Err(BackendError::PeerUnavailable("busy".to_string())),
                Script::Unreachable => {
                    return Err(BackendError::PeerUnavailable("offline".to_string()))
                }
                Script::Unresponsive => None,
                _ => {
                    let n = state.next_call;
                    state.next_call += 1;
                    let call_id = CallId::new(format!("call-{n}"));
                    state
                        .statuses
                        .insert(call_id.clone(), RemoteCallStatus::Ringing);
                    let initiated = InitiatedCall {
                        call_id,
                        credentials: credentials_for(n),
                        max_duration_seconds: state.max_duration_seconds,
                    };
                    Some((initiated, script))
                }
            }
        };
        let Some((initiated, script)) = placed else {
            tracing::debug!(target = %target, "Scripted backend is not answering");
            return std::future::pending().await;
        };
        self.run_script(initiated.call_id.clone(), script);
        Ok(initiated)
    }

    async fn accept_call(&self, call_id: &CallId) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(BackendCall::Accept(call_id.clone()));
        state.resolve_ringing(call_id, RemoteCallStatus::Accepted);
        Ok(())
    }

    async fn reject_call(&self, call_id: &CallId, reason: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(BackendCall::Reject {
            call_id: call_id.clone(),
            reason: reason.to_string(),
        });
        state.resolve_ringing(call_id, RemoteCallStatus::Rejected);
        Ok(())
    }

    async fn cancel_call(&self, call_id: &CallId, reason: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.record(BackendCall::Cancel {
            call_id: call_id.clone(),
            reason: reason.to_string(),
        });
        state.resolve_ringing(call_id, RemoteCallStatus::Cancelled);
        Ok(())
    }

    async fn end_call(
        &self,
        call_id: &CallId,
        elapsed_seconds: u64,
    ) -> Result<CallSummary, BackendError> {
        let mut state = self.state.lock();
        state.record(BackendCall::End {
            call_id: call_id.clone(),
            elapsed_seconds,
        });
        state
            .statuses
            .insert(call_id.clone(), RemoteCallStatus::Ended);
        Ok(CallSummary {
            duration_seconds: elapsed_seconds,
            amount_charged: elapsed_seconds.div_ceil(60) * RATE_PER_MINUTE,
        })
    }

    async fn deduct(
        &self,
        call_id: &CallId,
        elapsed_seconds: u64,
    ) -> Result<DeductionOutcome, BackendError> {
        let mut state = self.state.lock();
        state.record(BackendCall::Deduct {
            call_id: call_id.clone(),
            elapsed_seconds,
        });
        match state.funded_minutes {
            None => Ok(DeductionOutcome::Charged),
            Some(0) => Ok(DeductionOutcome::InsufficientFunds),
            Some(minutes) => {
                state.funded_minutes = Some(minutes - 1);
                Ok(DeductionOutcome::Charged)
            }
        }
    }

    async fn get_remaining_budget(
        &self,
        user: &PeerId,
        _call_type: CallType,
    ) -> Result<u64, BackendError> {
        let mut state = self.state.lock();
        state.record(BackendCall::Budget(user.clone()));
        state.budget.clone()
    }

    async fn fetch_capabilities(
        &self,
        candidate: &PeerId,
    ) -> Result<PeerCapabilities, BackendError> {
        let mut state = self.state.lock();
        state.record(BackendCall::Capabilities(candidate.clone()));
        match state.capabilities.get(candidate) {
            Some(Some(capabilities)) => Ok(*capabilities),
            Some(None) => Err(BackendError::Network("capability lookup failed".to_string())),
            None => Ok(PeerCapabilities {
                audio_enabled: true,
                video_enabled: true,
            }),
        }
    }
}

#[async_trait]
impl StatusChannel for LoopbackBackend {
    async fn get_status(&self, call_id: &CallId) -> Result<RemoteCallStatus, SignalingError> {
        let mut state = self.state.lock();
        *state.status_polls.entry(call_id.clone()).or_insert(0) += 1;
        if state.failing_polls > 0 {
            state.failing_polls -= 1;
            return Err(SignalingError::StatusUnavailable("injected failure".to_string()));
        }
        state
            .statuses
            .get(call_id)
            .copied()
            .ok_or_else(|| SignalingError::StatusUnavailable(format!("unknown call {call_id}")))
    }
}

/// Broadcast-backed push channel
pub struct LoopbackPush {
    tx: Mutex<Option<broadcast::Sender<PushMessage>>>,
    sent: Mutex<Vec<PushMessage>>,
    refuse_connect: AtomicBool,
    dropping: AtomicBool,
    duplicating: AtomicBool,
}

impl Default for LoopbackPush {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackPush {
    /// Connected push channel
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            tx: Mutex::new(Some(tx)),
            sent: Mutex::new(Vec::new()),
            refuse_connect: AtomicBool::new(false),
            dropping: AtomicBool::new(false),
            duplicating: AtomicBool::new(false),
        }
    }

    /// Deliver a message to every subscriber
    pub fn publish(&self, message: PushMessage) {
        if self.dropping.load(Ordering::SeqCst) {
            tracing::trace!(kind = message.kind(), "Loopback push dropping message");
            return;
        }
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            return;
        };
        if self.duplicating.load(Ordering::SeqCst) {
            let _ = tx.send(message.clone());
        }
        let _ = tx.send(message);
    }

    /// Drop the connection; subscriber streams end
    pub fn disconnect(&self) {
        self.tx.lock().take();
    }

    /// Silently lose every published message
    pub fn drop_messages(&self, dropping: bool) {
        self.dropping.store(dropping, Ordering::SeqCst);
    }

    /// Deliver every published message twice
    pub fn duplicate_messages(&self, duplicating: bool) {
        self.duplicating.store(duplicating, Ordering::SeqCst);
    }

    /// Make `connect` fail
    pub fn refuse_connect(&self) {
        self.refuse_connect.store(true, Ordering::SeqCst);
    }

    /// Messages sent by the local side
    #[must_use]
    pub fn sent(&self) -> Vec<PushMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl PushChannel for LoopbackPush {
    async fn connect(&self) -> Result<(), SignalingError> {
        if self.refuse_connect.load(Ordering::SeqCst) || self.tx.lock().is_none() {
            return Err(SignalingError::NotConnected);
        }
        Ok(())
    }

    async fn send(&self, message: PushMessage) -> Result<(), SignalingError> {
        if self.tx.lock().is_none() {
            return Err(SignalingError::NotConnected);
        }
        self.sent.lock().push(message);
        Ok(())
    }

    fn subscribe(&self) -> BoxStream<'static, PushMessage> {
        match self.tx.lock().as_ref() {
            Some(tx) => BroadcastStream::new(tx.subscribe())
                .filter_map(|message| futures::future::ready(message.ok()))
                .boxed(),
            None => stream::empty().boxed(),
        }
    }
}

struct MediaState {
    initialized: Option<String>,
    init_ok: bool,
    join_failure: Option<i32>,
    join_delay: Duration,
    peer_joins_after: Option<Duration>,
    joins: usize,
    leaves: usize,
    muted: Option<bool>,
    speaker: Option<bool>,
}

/// Media transport whose join result and peer presence are scripted
pub struct LoopbackMedia {
    events: broadcast::Sender<MediaEvent>,
    state: Mutex<MediaState>,
}

impl Default for LoopbackMedia {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackMedia {
    /// Transport whose joins succeed at once; the peer never shows up
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            state: Mutex::new(MediaState {
                initialized: None,
                init_ok: true,
                join_failure: None,
                join_delay: Duration::ZERO,
                peer_joins_after: None,
                joins: 0,
                leaves: 0,
                muted: None,
                speaker: None,
            }),
        }
    }

    /// Make `initialize` report failure
    pub fn fail_initialize(&self) {
        self.state.lock().init_ok = false;
    }

    /// Make joins fail with `code`
    pub fn fail_join_with(&self, code: i32) {
        self.state.lock().join_failure = Some(code);
    }

    /// Delay every join
    pub fn set_join_delay(&self, delay: Duration) {
        self.state.lock().join_delay = delay;
    }

    /// Have the peer appear this long after each successful join
    pub fn peer_joins_after(&self, delay: Duration) {
        self.state.lock().peer_joins_after = Some(delay);
    }

    /// Raise a transport callback
    pub fn emit(&self, event: MediaEvent) {
        let _ = self.events.send(event);
    }

    /// App id passed to `initialize`
    #[must_use]
    pub fn initialized_with(&self) -> Option<String> {
        self.state.lock().initialized.clone()
    }

    /// Joins attempted
    #[must_use]
    pub fn join_count(&self) -> usize {
        self.state.lock().joins
    }

    /// Leaves performed
    #[must_use]
    pub fn leave_count(&self) -> usize {
        self.state.lock().leaves
    }

    /// Last mute setting
    #[must_use]
    pub fn muted(&self) -> Option<bool> {
        self.state.lock().muted
    }

    /// Last speaker setting
    #[must_use]
    pub fn speaker(&self) -> Option<bool> {
        self.state.lock().speaker
    }
}

#[async_trait]
impl MediaTransport for LoopbackMedia {
    async fn initialize(&self, app_id: &str) -> bool {
        let mut state = self.state.lock();
        state.initialized = Some(app_id.to_string());
        state.init_ok
    }

    async fn join(&self, channel: &str, _token: &str) -> Result<(), MediaError> {
        let (delay, failure, peer_joins_after) = {
            let mut state = self.state.lock();
            state.joins += 1;
            (state.join_delay, state.join_failure, state.peer_joins_after)
        };
        tracing::trace!(channel, "Loopback media join");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(code) = failure {
            return Err(MediaError::JoinFailed(code));
        }
        if let Some(after) = peer_joins_after {
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = events.send(MediaEvent::PeerJoined { handle: 2 });
            });
        }
        Ok(())
    }

    async fn leave(&self) {
        self.state.lock().leaves += 1;
    }

    async fn set_muted(&self, muted: bool) {
        self.state.lock().muted = Some(muted);
    }

    async fn set_speaker(&self, enabled: bool) {
        self.state.lock().speaker = Some(enabled);
    }

    fn events(&self) -> BoxStream<'static, MediaEvent> {
        BroadcastStream::new(self.events.subscribe())
            .filter_map(|event| futures::future::ready(event.ok()))
            .boxed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_scripted_answer_updates_status_and_push() {
        let push = Arc::new(LoopbackPush::new());
        let mut messages = push.subscribe();
        let backend = LoopbackBackend::new().linked_to(Arc::clone(&push));
        let bob = PeerId::new("bob");
        backend.script(&bob, Script::AnswerAfter(Duration::from_secs(4)));

        let call = backend.initiate_call(&bob, CallType::Audio).await.unwrap();
        assert_eq!(backend.status(&call.call_id), Some(RemoteCallStatus::Ringing));

        let message = messages.next().await.unwrap();
        assert_eq!(
            message,
            PushMessage::Accepted {
                call_id: call.call_id.clone()
            }
        );
        assert_eq!(backend.status(&call.call_id), Some(RemoteCallStatus::Accepted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_beats_scripted_answer() {
        let backend = LoopbackBackend::new();
        let bob = PeerId::new("bob");
        backend.script(&bob, Script::AnswerAfter(Duration::from_secs(4)));

        let call = backend.initiate_call(&bob, CallType::Audio).await.unwrap();
        backend.cancel_call(&call.call_id, "no answer").await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(backend.status(&call.call_id), Some(RemoteCallStatus::Cancelled));
        assert_eq!(backend.cancel_count(&call.call_id), 1);
    }

    #[tokio::test]
    async fn test_busy_and_unreachable_refuse_initiation() {
        let backend = LoopbackBackend::new();
        backend.script(&PeerId::new("busy"), Script::Busy);
        backend.script(&PeerId::new("gone"), Script::Unreachable);

        let busy = backend
            .initiate_call(&PeerId::new("busy"), CallType::Video)
            .await
            .unwrap_err();
        assert_eq!(busy, BackendError::PeerUnavailable("busy".to_string()));
        assert!(backend
            .initiate_call(&PeerId::new("gone"), CallType::Video)
            .await
            .is_err());
        assert_eq!(backend.initiated_targets().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_initiation_never_returns() {
        let backend = LoopbackBackend::new();
        let mute = PeerId::new("mute");
        backend.script(&mute, Script::Unresponsive);

        let reply = tokio::time::timeout(
            Duration::from_secs(3600),
            backend.initiate_call(&mute, CallType::Audio),
        )
        .await;
        assert!(reply.is_err());
        assert_eq!(backend.initiated_targets(), vec![mute]);
    }

    #[tokio::test]
    async fn test_deductions_follow_funding() {
        let backend = LoopbackBackend::new();
        backend.fund_minutes(Some(1));
        let call_id = CallId::new("c");
        assert_eq!(
            backend.deduct(&call_id, 60).await.unwrap(),
            DeductionOutcome::Charged
        );
        assert_eq!(
            backend.deduct(&call_id, 120).await.unwrap(),
            DeductionOutcome::InsufficientFunds
        );
        let summary = backend.end_call(&call_id, 121).await.unwrap();
        assert_eq!(summary.amount_charged, 3 * RATE_PER_MINUTE);
    }

    #[tokio::test]
    async fn test_push_duplicates_and_drops() {
        let push = LoopbackPush::new();
        let mut messages = push.subscribe();
        let call_id = CallId::new("c");

        push.drop_messages(true);
        push.publish(PushMessage::Busy {
            call_id: call_id.clone(),
        });
        push.drop_messages(false);
        push.duplicate_messages(true);
        push.publish(PushMessage::Missed {
            call_id: call_id.clone(),
        });
        push.disconnect();

        let received: Vec<_> = messages.collect().await;
        assert_eq!(
            received,
            vec![
                PushMessage::Missed {
                    call_id: call_id.clone()
                },
                PushMessage::Missed { call_id }
            ]
        );
        assert!(push.connect().await.is_err());
    }
}
