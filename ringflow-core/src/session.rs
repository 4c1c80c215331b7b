//! Per-session actor
//!
//! Each call session runs as a single task that owns its [`CallSession`] and
//! drains one queue of [`SessionInput`]s. Channel listeners, timers, media
//! callbacks and backend replies only ever post into that queue, so the state
//! machine is never touched concurrently.
//!
//! The actor executes the side effects returned by the machine and publishes a
//! [`SessionSnapshot`] after every input. A finished session can be redialed,
//! which moves it to the next generation. It stops on
//! [`SessionHandle::dispose`] or once every handle is gone, tearing everything
//! down on the way out. Backend requests still outstanding at that point get
//! a bounded time to settle and are aborted after it.

use crate::backend::{with_retry, CallBackend, DeductionOutcome, BackendError, InitiatedCall};
use crate::config::CoordinatorConfig;
use crate::coordinator::{EventCoordinator, EventFeed};
use crate::event::{Envelope, SessionEvent};
use crate::identity::PeerId;
use crate::machine::{BackendNotice, CallSession, SessionTimings, SideEffect};
use crate::media::{MediaJoinGate, MediaTransport};
use crate::registry::SharedRegistry;
use crate::signaling::{PushChannel, PushMessage, StatusChannel};
use crate::timeout::TimeoutSupervisor;
use crate::types::{
    CallId, CallOutcome, CallType, MediaCredentials, Role, SessionId, SessionSnapshot,
    SessionState,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The session actor has exited
    #[error("Session {0} is closed")]
    Closed(SessionId),
}

/// Local command for a session
#[derive(Debug)]
pub enum SessionCommand {
    /// Accept the incoming call
    Accept,
    /// Decline the incoming call
    Reject {
        /// Reason sent to the backend
        reason: String,
    },
    /// Cancel, decline or hang up depending on the state
    End {
        /// Reason sent to the backend
        reason: String,
        /// Receives the outcome once the session is terminal
        reply: oneshot::Sender<CallOutcome>,
    },
    /// Mute or unmute the microphone
    SetMuted(bool),
    /// Toggle the loudspeaker
    SetSpeaker(bool),
    /// Grant extra call budget
    ExtendBudget(u64),
    /// Call the same peer again from a finished session
    Redial {
        /// Receives whether a new attempt was started
        reply: oneshot::Sender<bool>,
    },
}

/// Item in a session's queue
#[derive(Debug)]
pub enum SessionInput {
    /// Event for the state machine
    Event(Envelope),
    /// Local command
    Command(SessionCommand),
    /// Stop the actor
    Dispose,
}

/// An inbound ring, as delivered by the push channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRing {
    /// Backend call id
    pub call_id: CallId,
    /// Who is calling
    pub caller: PeerId,
    /// Media kind
    pub call_type: CallType,
    /// Media channel credentials
    pub credentials: MediaCredentials,
}

impl InboundRing {
    /// Extract a ring from a push message
    #[must_use]
    pub fn from_push(message: &PushMessage) -> Option<Self> {
        match message {
            PushMessage::Ring {
                call_id,
                caller,
                call_type,
                channel,
                token,
            } => Some(Self {
                call_id: call_id.clone(),
                caller: caller.clone(),
                call_type: *call_type,
                credentials: MediaCredentials {
                    channel: channel.clone(),
                    token: token.clone(),
                },
            }),
            _ => None,
        }
    }
}

/// Collaborators shared by every session
#[derive(Clone)]
pub struct SessionContext {
    /// Coordinator configuration
    pub config: Arc<CoordinatorConfig>,
    /// Local user
    pub local_user: PeerId,
    /// Call-control and billing backend
    pub backend: Arc<dyn CallBackend>,
    /// Status-poll endpoint
    pub status: Arc<dyn StatusChannel>,
    /// Push channel
    pub push: Arc<dyn PushChannel>,
    /// Media transport
    pub media: Arc<dyn MediaTransport>,
    /// Processed-event registry
    pub registry: SharedRegistry,
}

impl SessionContext {
    /// Start an outbound call to `target`
    pub fn spawn_outbound(&self, target: PeerId, call_type: CallType) -> SessionHandle {
        let machine = CallSession::create(
            Role::Caller,
            call_type,
            None,
            SessionTimings::from_config(&self.config),
        )
        .with_peer(target);
        self.spawn(machine)
    }

    /// Start ringing locally for an inbound call
    pub fn spawn_inbound(&self, ring: InboundRing) -> SessionHandle {
        let machine = CallSession::create(
            Role::Receiver,
            ring.call_type,
            Some(ring.call_id),
            SessionTimings::from_config(&self.config),
        )
        .with_peer(ring.caller)
        .with_credentials(ring.credentials);
        self.spawn(machine)
    }

    fn spawn(&self, machine: CallSession) -> SessionHandle {
        let id = SessionId::new();
        let (inputs, queue) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshots) = watch::channel(machine.snapshot(id));

        let redial_pending = Arc::new(AtomicBool::new(false));
        let actor = SessionActor {
            id,
            timers: TimeoutSupervisor::new(machine.generation()),
            machine,
            ctx: self.clone(),
            inputs: inputs.clone(),
            gate: Arc::new(MediaJoinGate::new(Arc::clone(&self.media))),
            coordinator: None,
            billing: None,
            pending: Vec::new(),
            snapshots: snapshot_tx,
            redial_pending: Arc::clone(&redial_pending),
        };
        let task = tokio::spawn(actor.run(queue));

        SessionHandle {
            id,
            inputs,
            snapshots,
            redial_pending,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

/// Handle to a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    inputs: mpsc::UnboundedSender<SessionInput>,
    snapshots: watch::Receiver<SessionSnapshot>,
    redial_pending: Arc<AtomicBool>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionHandle {
    /// Session id
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Latest snapshot
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.snapshots.borrow().state
    }

    /// Stream of snapshots, starting with the current one
    pub fn subscribe(&self) -> WatchStream<SessionSnapshot> {
        WatchStream::new(self.snapshots.clone())
    }

    /// Accept an incoming call
    ///
    /// # Errors
    ///
    /// Returns error if the session has exited
    pub fn accept(&self) -> Result<(), SessionError> {
        self.command(SessionCommand::Accept)
    }

    /// Decline an incoming call
    ///
    /// # Errors
    ///
    /// Returns error if the session has exited
    pub fn reject(&self, reason: impl Into<String>) -> Result<(), SessionError> {
        self.command(SessionCommand::Reject {
            reason: reason.into(),
        })
    }

    /// End the session locally and wait for its outcome
    ///
    /// # Errors
    ///
    /// Returns error if the session has exited
    pub async fn end(&self, reason: impl Into<String>) -> Result<CallOutcome, SessionError> {
        let (reply, outcome) = oneshot::channel();
        self.command(SessionCommand::End {
            reason: reason.into(),
            reply,
        })?;
        outcome.await.map_err(|_| SessionError::Closed(self.id))
    }

    /// Mute or unmute the microphone
    ///
    /// # Errors
    ///
    /// Returns error if the session has exited
    pub fn set_muted(&self, muted: bool) -> Result<(), SessionError> {
        self.command(SessionCommand::SetMuted(muted))
    }

    /// Toggle the loudspeaker
    ///
    /// # Errors
    ///
    /// Returns error if the session has exited
    pub fn set_speaker(&self, enabled: bool) -> Result<(), SessionError> {
        self.command(SessionCommand::SetSpeaker(enabled))
    }

    /// Grant extra call budget
    ///
    /// # Errors
    ///
    /// Returns error if the session has exited
    pub fn extend_budget(&self, seconds: u64) -> Result<(), SessionError> {
        self.command(SessionCommand::ExtendBudget(seconds))
    }

    /// Call the same peer again once this session has finished
    ///
    /// Returns `false` when the session is still live, or when its previous
    /// initiation request has not been answered yet.
    ///
    /// # Errors
    ///
    /// Returns error if the session has exited
    pub async fn redial(&self) -> Result<bool, SessionError> {
        let started = self.request_redial()?;
        started.await.map_err(|_| SessionError::Closed(self.id))
    }

    /// Queue a redial; the session counts as live until the actor has
    /// applied it
    pub(crate) fn request_redial(&self) -> Result<oneshot::Receiver<bool>, SessionError> {
        let (reply, started) = oneshot::channel();
        self.redial_pending.store(true, Ordering::SeqCst);
        if let Err(e) = self.command(SessionCommand::Redial { reply }) {
            self.redial_pending.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(started)
    }

    /// Whether the session holds a call slot: it is not terminal, or a
    /// redial has been requested and not yet applied
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.state().is_terminal() || self.redial_pending.load(Ordering::SeqCst)
    }

    /// Wait until a snapshot satisfies `predicate`
    ///
    /// # Errors
    ///
    /// Returns error if the session exits first
    pub async fn wait_until<F>(&self, mut predicate: F) -> Result<SessionSnapshot, SessionError>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut snapshots = self.snapshots.clone();
        let snapshot = snapshots
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| SessionError::Closed(self.id))?;
        Ok(snapshot.clone())
    }

    /// Stop the session and wait for its teardown to finish
    ///
    /// A live session is ended first. Safe to call more than once.
    pub async fn dispose(&self) {
        let _ = self.inputs.send(SessionInput::Dispose);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(session = %self.id, error = %e, "Session task did not finish cleanly");
            }
        }
    }

    /// Whether the actor has exited
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inputs.is_closed()
    }

    fn command(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.inputs
            .send(SessionInput::Command(command))
            .map_err(|_| SessionError::Closed(self.id))
    }
}

struct SessionActor {
    id: SessionId,
    machine: CallSession,
    ctx: SessionContext,
    inputs: mpsc::UnboundedSender<SessionInput>,
    timers: TimeoutSupervisor,
    gate: Arc<MediaJoinGate>,
    coordinator: Option<EventCoordinator>,
    billing: Option<JoinHandle<()>>,
    pending: Vec<JoinHandle<()>>,
    snapshots: watch::Sender<SessionSnapshot>,
    redial_pending: Arc<AtomicBool>,
}

impl SessionActor {
    #[tracing::instrument(name = "session", skip_all, fields(session = %self.id, role = ?self.machine.role()))]
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<SessionInput>) {
        let effects = self.machine.start();
        self.execute(effects);
        self.publish();

        loop {
            tokio::select! {
                input = queue.recv() => match input {
                    Some(SessionInput::Dispose) | None => break,
                    Some(input) => self.handle(input),
                },
                () = self.snapshots.closed() => {
                    tracing::debug!("All session handles dropped");
                    break;
                }
            }
            self.publish();
        }

        self.shutdown(&mut queue).await;
    }

    fn handle(&mut self, input: SessionInput) {
        match input {
            SessionInput::Event(envelope) => {
                let effects = self.machine.apply(envelope);
                self.execute(effects);
            }
            SessionInput::Command(command) => self.command(command),
            SessionInput::Dispose => {}
        }
    }

    fn command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Accept => self.apply_local(SessionEvent::LocalAccept),
            SessionCommand::Reject { reason } => {
                self.apply_local(SessionEvent::LocalReject { reason });
            }
            SessionCommand::End { reason, reply } => {
                let effects = self.machine.force_end(&reason);
                self.execute(effects);
                if let Some(outcome) = self.machine.outcome() {
                    let _ = reply.send(outcome);
                }
            }
            SessionCommand::SetMuted(muted) => {
                let gate = Arc::clone(&self.gate);
                self.track(tokio::spawn(async move { gate.set_muted(muted).await }));
            }
            SessionCommand::SetSpeaker(enabled) => {
                let gate = Arc::clone(&self.gate);
                self.track(tokio::spawn(async move { gate.set_speaker(enabled).await }));
            }
            SessionCommand::ExtendBudget(seconds) => {
                self.apply_local(SessionEvent::BonusTime { seconds });
            }
            SessionCommand::Redial { reply } => {
                let started = self.redial();
                self.publish();
                self.redial_pending.store(false, Ordering::SeqCst);
                let _ = reply.send(started);
            }
        }
    }

    fn redial(&mut self) -> bool {
        let previous_call = self.machine.call_id().cloned();
        if !self.machine.reset() {
            tracing::debug!(state = %self.machine.state(), "Session cannot be redialed now");
            return false;
        }
        if let Some(coordinator) = self.coordinator.take() {
            coordinator.detach();
        }
        if let Some(task) = self.billing.take() {
            task.abort();
        }
        if let Some(call_id) = previous_call {
            let evicted = self.ctx.registry.lock().evict_call(&call_id);
            tracing::trace!(call_id = %call_id, evicted, "Registry entries of the previous attempt evicted");
        }
        // The previous gate was already asked to leave when the call ended
        self.gate = Arc::new(MediaJoinGate::new(Arc::clone(&self.ctx.media)));
        self.timers.advance_to(self.machine.generation());
        tracing::info!(generation = self.machine.generation(), "Redialing");
        let effects = self.machine.start();
        self.execute(effects);
        true
    }

    fn apply_local(&mut self, event: SessionEvent) {
        let envelope = Envelope::local(self.machine.generation(), event);
        let effects = self.machine.apply(envelope);
        self.execute(effects);
    }

    fn execute(&mut self, effects: Vec<SideEffect>) {
        for effect in effects {
            tracing::trace!(?effect, "Executing side effect");
            self.execute_one(effect);
        }
    }

    fn execute_one(&mut self, effect: SideEffect) {
        let generation = self.machine.generation();
        match effect {
            SideEffect::Initiate => self.initiate(),
            SideEffect::AttachChannels => {
                if self.coordinator.is_some() {
                    return;
                }
                let Some(feed) = self.feed() else {
                    tracing::warn!("Cannot attach channels before the call id is known");
                    return;
                };
                self.coordinator = Some(EventCoordinator::attach(
                    feed,
                    Arc::clone(&self.ctx.push),
                    Arc::clone(&self.ctx.status),
                    self.ctx.config.poll_interval(),
                    self.ctx.config.poll_overlap(),
                ));
            }
            SideEffect::WindDownPolling => {
                if let Some(coordinator) = &self.coordinator {
                    coordinator.wind_down();
                }
            }
            SideEffect::ScheduleTimer { name, delay } => {
                let inputs = self.inputs.clone();
                self.timers.schedule(generation, name, delay, move || {
                    let envelope = Envelope::local(generation, SessionEvent::TimerFired(name));
                    let _ = inputs.send(SessionInput::Event(envelope));
                });
            }
            SideEffect::CancelTimer(name) => {
                self.timers.cancel(generation, name);
            }
            SideEffect::CancelAllTimers => {
                self.timers.cancel_all(generation);
            }
            SideEffect::JoinMedia(credentials) => match self.feed() {
                Some(feed) => {
                    self.gate.try_join(&credentials, feed);
                }
                None => tracing::warn!("Cannot join media before the call id is known"),
            },
            SideEffect::LeaveMedia => {
                let gate = Arc::clone(&self.gate);
                self.track(tokio::spawn(async move { gate.leave().await }));
            }
            SideEffect::StartBilling => self.start_billing(),
            SideEffect::StopBilling => {
                if let Some(task) = self.billing.take() {
                    task.abort();
                }
            }
            SideEffect::Deduct {
                minute,
                elapsed_seconds,
            } => self.deduct(minute, elapsed_seconds),
            SideEffect::Notify(notice) => self.notify(notice),
            SideEffect::CheckStatus => self.check_status(),
        }
    }

    fn feed(&self) -> Option<EventFeed> {
        let call_id = self.machine.call_id()?.clone();
        Some(EventFeed::new(
            call_id,
            self.machine.generation(),
            self.inputs.clone(),
            Arc::clone(&self.ctx.registry),
        ))
    }

    fn post(inputs: &mpsc::UnboundedSender<SessionInput>, generation: u64, event: SessionEvent) {
        let _ = inputs.send(SessionInput::Event(Envelope::local(generation, event)));
    }

    fn track(&mut self, task: JoinHandle<()>) {
        self.pending.retain(|task| !task.is_finished());
        self.pending.push(task);
    }

    fn initiate(&mut self) {
        let Some(target) = self.machine.peer().cloned() else {
            tracing::warn!("Outbound session has no target");
            return;
        };
        let backend = Arc::clone(&self.ctx.backend);
        let inputs = self.inputs.clone();
        let generation = self.machine.generation();
        let call_type = self.machine.call_type();

        self.track(tokio::spawn(async move {
            tracing::info!(target = %target, call_type = %call_type, "Placing call");
            let event = match backend.initiate_call(&target, call_type).await {
                Ok(InitiatedCall {
                    call_id,
                    credentials,
                    max_duration_seconds,
                }) => SessionEvent::Rang {
                    call_id,
                    credentials,
                    max_duration_seconds,
                },
                Err(e) => {
                    tracing::warn!(target = %target, error = %e, "Backend refused to place the call");
                    SessionEvent::InitiationFailed {
                        reason: e.initiation_failure(),
                    }
                }
            };
            Self::post(&inputs, generation, event);
        }));
    }

    fn start_billing(&mut self) {
        if self.billing.is_some() {
            return;
        }
        let inputs = self.inputs.clone();
        let generation = self.machine.generation();
        let period = self.ctx.config.tick_interval();
        self.billing = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let envelope = Envelope::local(generation, SessionEvent::Tick);
                if inputs.send(SessionInput::Event(envelope)).is_err() {
                    return;
                }
            }
        }));
    }

    fn deduct(&mut self, minute: u64, elapsed_seconds: u64) {
        let Some(call_id) = self.machine.call_id().cloned() else {
            return;
        };
        let backend = Arc::clone(&self.ctx.backend);
        let inputs = self.inputs.clone();
        let generation = self.machine.generation();
        let policy = self.ctx.config.retry_policy();

        self.track(tokio::spawn(async move {
            let outcome = match with_retry(policy, "deduct", || {
                backend.deduct(&call_id, elapsed_seconds)
            })
            .await
            {
                Ok(outcome) => Some(outcome),
                Err(BackendError::InsufficientFunds) => Some(DeductionOutcome::InsufficientFunds),
                Err(_) => None,
            };
            Self::post(&inputs, generation, SessionEvent::Deducted { minute, outcome });
        }));
    }

    fn check_status(&mut self) {
        let Some(call_id) = self.machine.call_id().cloned() else {
            return;
        };
        let status = Arc::clone(&self.ctx.status);
        let inputs = self.inputs.clone();
        let generation = self.machine.generation();

        self.track(tokio::spawn(async move {
            let status = match status.get_status(&call_id).await {
                Ok(status) => Some(status),
                Err(e) => {
                    tracing::warn!(call_id = %call_id, error = %e, "Presence recheck failed");
                    None
                }
            };
            Self::post(&inputs, generation, SessionEvent::StatusChecked { status });
        }));
    }

    fn notify(&mut self, notice: BackendNotice) {
        let Some(call_id) = self.machine.call_id().cloned() else {
            tracing::trace!(?notice, "No call id yet, notice deferred to the initiation reply");
            return;
        };
        let backend = Arc::clone(&self.ctx.backend);
        let push = Arc::clone(&self.ctx.push);
        let inputs = self.inputs.clone();
        let generation = self.machine.generation();
        let policy = self.ctx.config.retry_policy();

        self.track(tokio::spawn(async move {
            tracing::debug!(call_id = %call_id, ?notice, "Notifying backend");
            let mirror = match notice {
                BackendNotice::Accept => {
                    let _ = with_retry(policy, "accept_call", || backend.accept_call(&call_id)).await;
                    PushMessage::Accepted {
                        call_id: call_id.clone(),
                    }
                }
                BackendNotice::Reject { reason } => {
                    let _ = with_retry(policy, "reject_call", || {
                        backend.reject_call(&call_id, &reason)
                    })
                    .await;
                    PushMessage::Rejected {
                        call_id: call_id.clone(),
                        reason: Some(reason),
                    }
                }
                BackendNotice::Cancel { reason } => {
                    let _ = with_retry(policy, "cancel_call", || {
                        backend.cancel_call(&call_id, &reason)
                    })
                    .await;
                    PushMessage::Cancelled {
                        call_id: call_id.clone(),
                        reason: Some(reason),
                    }
                }
                BackendNotice::End { elapsed_seconds } => {
                    if let Ok(summary) = with_retry(policy, "end_call", || {
                        backend.end_call(&call_id, elapsed_seconds)
                    })
                    .await
                    {
                        Self::post(&inputs, generation, SessionEvent::Summary(summary));
                    }
                    PushMessage::Ended {
                        call_id: call_id.clone(),
                    }
                }
            };
            if let Err(e) = push.send(mirror).await {
                tracing::warn!(call_id = %call_id, error = %e, "Could not mirror notice over push");
            }
        }));
    }

    fn publish(&self) {
        let next = self.machine.snapshot(self.id);
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    async fn shutdown(mut self, queue: &mut mpsc::UnboundedReceiver<SessionInput>) {
        let deadline = Instant::now() + self.ctx.config.teardown_timeout();
        let effects = self.machine.force_end("disposed");
        self.execute(effects);
        self.teardown(deadline).await;

        // Late backend replies (the call summary, an initiation reply that
        // still needs a cancel) keep arriving until every task has settled or
        // the deadline passes.
        let mut abandoned = 0usize;
        while !self.pending.is_empty() {
            for mut task in std::mem::take(&mut self.pending) {
                match tokio::time::timeout_at(deadline, &mut task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        if !e.is_cancelled() {
                            tracing::warn!(error = %e, "Session task failed during shutdown");
                        }
                    }
                    Err(_) => {
                        task.abort();
                        abandoned += 1;
                    }
                }
            }
            while let Ok(input) = queue.try_recv() {
                if let SessionInput::Event(envelope) = input {
                    let effects = self.machine.apply(envelope);
                    self.execute(effects);
                }
            }
        }
        if abandoned > 0 {
            tracing::warn!(abandoned, "Backend requests still outstanding at teardown, aborted");
        }
        self.publish();
        self.redial_pending.store(false, Ordering::SeqCst);
        tracing::debug!(state = %self.machine.state(), "Session disposed");
    }

    async fn teardown(&mut self, deadline: Instant) {
        self.timers.shutdown();
        if let Some(coordinator) = self.coordinator.take() {
            coordinator.detach();
        }
        if let Some(task) = self.billing.take() {
            task.abort();
        }
        if tokio::time::timeout_at(deadline, self.gate.leave()).await.is_err() {
            tracing::warn!("Media leave did not finish before the teardown deadline");
        }
        if let Some(call_id) = self.machine.call_id() {
            let evicted = self.ctx.registry.lock().evict_call(call_id);
            tracing::trace!(call_id = %call_id, evicted, "Registry entries evicted");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackBackend, LoopbackMedia, LoopbackPush, Script};
    use crate::registry::ProcessedEventRegistry;
    use std::time::Duration;

    struct Fixture {
        ctx: SessionContext,
        backend: Arc<LoopbackBackend>,
        media: Arc<LoopbackMedia>,
    }

    fn fixture() -> Fixture {
        let push = Arc::new(LoopbackPush::new());
        let backend = Arc::new(LoopbackBackend::new().linked_to(Arc::clone(&push)));
        let media = Arc::new(LoopbackMedia::new());
        media.peer_joins_after(Duration::from_millis(500));
        let ctx = SessionContext {
            config: Arc::new(CoordinatorConfig::default()),
            local_user: PeerId::new("alice"),
            backend: backend.clone(),
            status: backend.clone(),
            push,
            media: media.clone(),
            registry: ProcessedEventRegistry::shared(64),
        };
        Fixture {
            ctx,
            backend,
            media,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_call_connects_and_ends() {
        let fx = fixture();
        fx.backend
            .script(&PeerId::new("bob"), Script::AnswerAfter(Duration::from_secs(2)));

        let session = fx.ctx.spawn_outbound(PeerId::new("bob"), CallType::Audio);
        let connected = session
            .wait_until(|s| s.state == SessionState::Connected)
            .await
            .unwrap();
        assert!(connected.was_ever_connected);
        assert_eq!(fx.media.join_count(), 1);

        tokio::time::sleep(Duration::from_secs(65)).await;
        let outcome = session.end("hangup").await.unwrap();
        assert!(matches!(
            outcome,
            CallOutcome::Connected { elapsed_seconds, .. } if elapsed_seconds >= 64
        ));

        session.dispose().await;
        assert_eq!(fx.media.leave_count(), 1);
        let call_id = connected.call_id.unwrap();
        assert_eq!(fx.backend.deduction_count(&call_id), 1);
        assert_eq!(fx.backend.end_count(&call_id), 1);
        assert!(session.snapshot().summary.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_is_idempotent() {
        let fx = fixture();
        fx.backend.script(&PeerId::new("bob"), Script::NeverAnswer);

        let session = fx.ctx.spawn_outbound(PeerId::new("bob"), CallType::Video);
        let ringing = session
            .wait_until(|s| s.state == SessionState::RingingOut)
            .await
            .unwrap();

        session.dispose().await;
        session.dispose().await;
        assert!(session.is_closed());
        assert_eq!(session.state(), SessionState::Cancelled);
        assert_eq!(fx.backend.cancel_count(&ringing.call_id.unwrap()), 1);
        assert_eq!(fx.media.join_count(), 0);
        assert_eq!(fx.media.leave_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_gives_up_on_unanswered_initiation() {
        let fx = fixture();
        fx.backend.script(&PeerId::new("bob"), Script::Unresponsive);

        let session = fx.ctx.spawn_outbound(PeerId::new("bob"), CallType::Audio);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(session.state(), SessionState::Initiating);

        let started = Instant::now();
        let disposed = tokio::time::timeout(Duration::from_secs(3600), session.dispose()).await;
        assert!(disposed.is_ok());
        assert!(started.elapsed() < fx.ctx.config.teardown_timeout() + Duration::from_secs(1));
        assert!(session.is_closed());
        assert_eq!(session.state(), SessionState::Cancelled);
        assert_eq!(fx.backend.initiated_targets(), vec![PeerId::new("bob")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redial_starts_next_generation() {
        let fx = fixture();
        let bob = PeerId::new("bob");
        fx.backend
            .script(&bob, Script::RejectAfter(Duration::from_secs(1)));

        let session = fx.ctx.spawn_outbound(bob.clone(), CallType::Audio);
        let ringing = session
            .wait_until(|s| s.state == SessionState::RingingOut)
            .await
            .unwrap();
        assert_eq!(ringing.generation, 1);
        assert!(!session.redial().await.unwrap());
        assert!(session.is_live());

        session
            .wait_until(|s| s.state == SessionState::Rejected)
            .await
            .unwrap();
        assert!(!session.is_live());

        fx.backend
            .script(&bob, Script::AnswerAfter(Duration::from_secs(2)));
        assert!(session.redial().await.unwrap());
        assert!(session.is_live());
        assert_eq!(session.snapshot().generation, 2);

        let connected = session
            .wait_until(|s| s.state == SessionState::Connected)
            .await
            .unwrap();
        assert_eq!(connected.generation, 2);
        assert_eq!(connected.call_id, Some(CallId::new("call-2")));
        assert_eq!(connected.peer, Some(bob.clone()));
        assert_eq!(fx.backend.initiated_targets(), vec![bob.clone(), bob]);

        // Nothing scheduled by the first attempt reaches the new one
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(session.state(), SessionState::Connected);

        session.dispose().await;
        assert_eq!(fx.backend.end_count(&CallId::new("call-2")), 1);
        assert_eq!(fx.backend.end_count(&CallId::new("call-1")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_after_exit_fail() {
        let fx = fixture();
        let session = fx.ctx.spawn_outbound(PeerId::new("carol"), CallType::Audio);
        session.dispose().await;
        assert_eq!(session.accept(), Err(SessionError::Closed(session.id())));
        assert!(session.end("bye").await.is_err());
        assert_eq!(session.redial().await, Err(SessionError::Closed(session.id())));
        assert!(!session.is_live());
    }
}
