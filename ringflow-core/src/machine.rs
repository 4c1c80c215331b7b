//! Call session state machine
//!
//! [`CallSession`] holds the state of one call attempt and is driven purely by
//! [`Envelope`]s. It performs no I/O: every transition returns the
//! [`SideEffect`]s the owner must execute (timers, media join, billing,
//! backend notices), and their results come back as further events.
//!
//! Guards applied before any transition:
//!
//! - an envelope from another generation is stale and ignored
//! - an envelope for another call id is ignored
//! - nothing leaves a terminal state, except that a late initiation reply is
//!   recorded so the call can still be cancelled on the backend

use crate::billing::BillingTicker;
use crate::backend::DeductionOutcome;
use crate::config::CoordinatorConfig;
use crate::event::{Envelope, SessionEvent, TimerName};
use crate::identity::PeerId;
use crate::types::{
    CallId, CallOutcome, CallSummary, CallType, MediaCredentials, Role, SessionId,
    SessionSnapshot, SessionState, TerminationReason,
};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Timer durations and thresholds a session works with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    /// Outbound ring timeout, and inbound ring expiry
    pub ring_timeout: Duration,
    /// Wait for the peer to appear in the media channel
    pub peer_presence: Duration,
    /// One-off extension after the presence recheck
    pub presence_grace: Duration,
    /// Delay between budget exhaustion and the forced end
    pub exhaustion_grace: Duration,
    /// Low-time threshold in seconds
    pub low_time_threshold: u64,
    /// Join failure code that is tolerated
    pub soft_timeout_code: i32,
}

impl SessionTimings {
    /// Timings from the coordinator configuration
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            ring_timeout: config.ring_timeout(),
            peer_presence: Duration::from_millis(config.timers.peer_presence_timeout_ms),
            presence_grace: Duration::from_millis(config.timers.presence_grace_ms),
            exhaustion_grace: Duration::from_millis(config.timers.exhaustion_grace_ms),
            low_time_threshold: config.billing.low_time_threshold_secs,
            soft_timeout_code: config.media.soft_timeout_code,
        }
    }
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

/// Notice the backend must receive about this call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendNotice {
    /// Receiver accepted
    Accept,
    /// Receiver declined
    Reject {
        /// Reason sent along
        reason: String,
    },
    /// Stop ringing the peer
    Cancel {
        /// Reason sent along
        reason: String,
    },
    /// Close the call and settle billing
    End {
        /// Connected seconds
        elapsed_seconds: u64,
    },
}

/// Work requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// Ask the backend to place the call
    Initiate,
    /// Subscribe to push and poll channels for the call
    AttachChannels,
    /// Let polling run only for the overlap window
    WindDownPolling,
    /// Schedule a named timer under the current generation
    ScheduleTimer {
        /// Timer name
        name: TimerName,
        /// Delay until it fires
        delay: Duration,
    },
    /// Cancel a named timer
    CancelTimer(TimerName),
    /// Cancel every timer of the current generation
    CancelAllTimers,
    /// Request the media join through the gate
    JoinMedia(MediaCredentials),
    /// Leave the media channel
    LeaveMedia,
    /// Start the one-second connected tick
    StartBilling,
    /// Stop the connected tick
    StopBilling,
    /// Bill a minute
    Deduct {
        /// Minute being billed
        minute: u64,
        /// Connected seconds
        elapsed_seconds: u64,
    },
    /// Send a notice to the backend
    Notify(BackendNotice),
    /// Ask the backend for the call status once
    CheckStatus,
}

/// State of one call attempt
#[derive(Debug, Clone)]
pub struct CallSession {
    role: Role,
    call_type: CallType,
    call_id: Option<CallId>,
    peer: Option<PeerId>,
    state: SessionState,
    generation: u64,
    credentials: Option<MediaCredentials>,
    has_started_media_join: bool,
    local_joined: bool,
    peer_present: bool,
    was_ever_connected: bool,
    presence_rechecked: bool,
    grace_extended: bool,
    initiation_in_flight: bool,
    soft_join_failure: Option<i32>,
    pending_exhaustion: Option<TerminationReason>,
    billing: BillingTicker,
    termination_reason: Option<TerminationReason>,
    summary: Option<CallSummary>,
    timings: SessionTimings,
    created_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Create a session: callers start initiating, receivers start ringing
    pub fn create(
        role: Role,
        call_type: CallType,
        call_id: Option<CallId>,
        timings: SessionTimings,
    ) -> Self {
        let state = match role {
            Role::Caller => SessionState::Initiating,
            Role::Receiver => SessionState::RingingIn,
        };
        Self {
            role,
            call_type,
            call_id,
            peer: None,
            state,
            generation: 1,
            credentials: None,
            has_started_media_join: false,
            local_joined: false,
            peer_present: false,
            was_ever_connected: false,
            presence_rechecked: false,
            grace_extended: false,
            initiation_in_flight: false,
            soft_join_failure: None,
            pending_exhaustion: None,
            billing: BillingTicker::unmetered(timings.low_time_threshold),
            termination_reason: None,
            summary: None,
            timings,
            created_at: Utc::now(),
            connected_at: None,
            ended_at: None,
        }
    }

    /// Set the remote participant
    #[must_use]
    pub fn with_peer(mut self, peer: PeerId) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Set the media credentials carried by an inbound ring
    #[must_use]
    pub fn with_credentials(mut self, credentials: MediaCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Effects that bring a fresh session to life
    pub fn start(&mut self) -> Vec<SideEffect> {
        match (self.role, self.state) {
            (Role::Caller, SessionState::Initiating) => {
                self.initiation_in_flight = true;
                vec![SideEffect::Initiate]
            }
            (Role::Receiver, SessionState::RingingIn) => vec![
                SideEffect::AttachChannels,
                SideEffect::ScheduleTimer {
                    name: TimerName::RingTimeout,
                    delay: self.timings.ring_timeout,
                },
            ],
            _ => Vec::new(),
        }
    }

    /// Whether a finished session may be reused for another attempt
    ///
    /// Not before the backend has answered the initiation request: a late
    /// reply must still reach this generation so the call can be cancelled.
    #[must_use]
    pub fn can_reset(&self) -> bool {
        self.state.is_terminal() && !self.initiation_in_flight && self.peer.is_some()
    }

    /// Reuse a finished session to call the same peer again
    ///
    /// The session becomes an initiating caller under the next generation, so
    /// timers and callbacks captured by the previous attempt become stale.
    /// Returns `false`, leaving the session untouched, when
    /// [`can_reset`](Self::can_reset) does not hold.
    pub fn reset(&mut self) -> bool {
        if !self.can_reset() {
            return false;
        }
        let generation = self.generation + 1;
        let peer = self.peer.take();
        *self = Self::create(Role::Caller, self.call_type, None, self.timings);
        self.peer = peer;
        self.generation = generation;
        tracing::debug!(generation, "Session reset for another attempt");
        true
    }

    /// Apply one event and return the effects to execute
    pub fn apply(&mut self, envelope: Envelope) -> Vec<SideEffect> {
        let Envelope {
            call_id,
            generation,
            event,
        } = envelope;

        if generation != self.generation {
            tracing::trace!(
                event = event.name(),
                event_generation = generation,
                generation = self.generation,
                "Dropping stale event"
            );
            return Vec::new();
        }
        if let Some(call_id) = &call_id {
            if self.call_id.as_ref() != Some(call_id) {
                tracing::trace!(event = event.name(), call_id = %call_id, "Dropping event for another call");
                return Vec::new();
            }
        }
        if matches!(
            event,
            SessionEvent::Rang { .. } | SessionEvent::InitiationFailed { .. }
        ) {
            self.initiation_in_flight = false;
        }
        if self.state.is_terminal() {
            return self.apply_after_termination(event);
        }

        match event {
            SessionEvent::Rang {
                call_id,
                credentials,
                max_duration_seconds,
            } => self.on_rang(call_id, credentials, max_duration_seconds),
            SessionEvent::InitiationFailed { reason } => self.on_initiation_failed(reason),
            SessionEvent::Accepted => self.on_remote_accepted(),
            SessionEvent::LocalAccept => self.on_local_accept(),
            SessionEvent::LocalReject { reason } => {
                if self.state != SessionState::RingingIn {
                    return Vec::new();
                }
                let mut effects = vec![SideEffect::Notify(BackendNotice::Reject {
                    reason: reason.clone(),
                })];
                effects.extend(self.terminate(
                    SessionState::Rejected,
                    TerminationReason::LocalReject(reason),
                ));
                effects
            }
            SessionEvent::Rejected { reason } if self.state.is_ringing() => self.terminate(
                SessionState::Rejected,
                TerminationReason::PeerDeclined(reason),
            ),
            SessionEvent::Busy if self.state == SessionState::RingingOut => {
                self.terminate(SessionState::Busy, TerminationReason::PeerBusy)
            }
            SessionEvent::Cancelled { reason }
                if self.state.is_ringing() || self.is_joining() =>
            {
                self.terminate(
                    SessionState::Cancelled,
                    TerminationReason::RemoteCancelled(reason),
                )
            }
            SessionEvent::Missed if self.state.is_ringing() => {
                let reason = match self.role {
                    Role::Caller => TerminationReason::NoAnswer,
                    Role::Receiver => TerminationReason::Missed,
                };
                self.terminate(SessionState::TimedOut, reason)
            }
            SessionEvent::RemoteEnded if self.state != SessionState::Initiating => {
                self.terminate(SessionState::Ended, TerminationReason::RemoteEnded)
            }
            SessionEvent::BonusTime { seconds } => self.on_bonus_time(seconds),
            SessionEvent::MediaJoinStarted => {
                if self.state == SessionState::Accepted {
                    self.transition(SessionState::MediaJoining);
                }
                Vec::new()
            }
            SessionEvent::JoinSucceeded if self.state.has_accepted() => {
                self.local_joined = true;
                self.soft_join_failure = None;
                self.maybe_connect()
            }
            SessionEvent::JoinFailed { code } => self.on_join_failed(code),
            SessionEvent::PeerJoined { peer_handle } if self.state.has_accepted() => {
                tracing::debug!(call_id = ?self.call_id, peer_handle, "Peer present in media channel");
                self.peer_present = true;
                self.was_ever_connected = true;
                self.maybe_connect()
            }
            SessionEvent::PeerLeft { reason_code } if self.state.has_accepted() => {
                tracing::debug!(call_id = ?self.call_id, reason_code, "Peer left media channel");
                self.terminate(SessionState::Ended, TerminationReason::PeerLeft)
            }
            SessionEvent::ConnectionLost if self.state.has_accepted() => {
                let state = if self.state == SessionState::Connected {
                    SessionState::Ended
                } else {
                    SessionState::Failed
                };
                self.terminate(state, TerminationReason::ConnectionLost)
            }
            SessionEvent::TimerFired(name) => self.on_timer(name),
            SessionEvent::StatusChecked { status } => {
                if !self.presence_rechecked || self.grace_extended || !self.is_joining() {
                    return Vec::new();
                }
                match status {
                    Some(status) if !status.is_terminal() => {
                        tracing::debug!(call_id = ?self.call_id, %status, "Peer not present yet, extending once");
                        self.grace_extended = true;
                        vec![SideEffect::ScheduleTimer {
                            name: TimerName::PresenceGrace,
                            delay: self.timings.presence_grace,
                        }]
                    }
                    _ => {
                        let reason = self.presence_failure();
                        self.terminate(SessionState::Failed, reason)
                    }
                }
            }
            SessionEvent::Tick => self.on_tick(),
            SessionEvent::Deducted { minute, outcome } => self.on_deducted(minute, outcome),
            SessionEvent::Summary(summary) => {
                self.summary = Some(summary);
                Vec::new()
            }
            other => {
                tracing::trace!(event = other.name(), state = %self.state, "Event has no effect in this state");
                Vec::new()
            }
        }
    }

    /// End the session on local request
    ///
    /// Cancels while ringing out, declines while ringing in, hangs up once
    /// accepted. A no-op once the session is terminal.
    pub fn force_end(&mut self, reason: &str) -> Vec<SideEffect> {
        match self.state {
            state if state.is_terminal() => Vec::new(),
            SessionState::Idle | SessionState::Initiating => self.terminate(
                SessionState::Cancelled,
                TerminationReason::LocalCancel(reason.to_string()),
            ),
            SessionState::RingingOut => {
                let mut effects = vec![SideEffect::Notify(BackendNotice::Cancel {
                    reason: reason.to_string(),
                })];
                effects.extend(self.terminate(
                    SessionState::Cancelled,
                    TerminationReason::LocalCancel(reason.to_string()),
                ));
                effects
            }
            SessionState::RingingIn => {
                let mut effects = vec![SideEffect::Notify(BackendNotice::Reject {
                    reason: reason.to_string(),
                })];
                effects.extend(self.terminate(
                    SessionState::Rejected,
                    TerminationReason::LocalReject(reason.to_string()),
                ));
                effects
            }
            _ => self.terminate(SessionState::Ended, TerminationReason::LocalHangup),
        }
    }

    fn apply_after_termination(&mut self, event: SessionEvent) -> Vec<SideEffect> {
        match event {
            // Cancelled while the initiation request was in flight: the call
            // now exists on the backend and must be cancelled there too.
            SessionEvent::Rang { call_id, .. } if self.call_id.is_none() => {
                let reason = match &self.termination_reason {
                    Some(TerminationReason::LocalCancel(reason)) => reason.clone(),
                    _ => "cancelled".to_string(),
                };
                tracing::debug!(call_id = %call_id, "Cancelling call placed after local cancel");
                self.call_id = Some(call_id);
                vec![SideEffect::Notify(BackendNotice::Cancel { reason })]
            }
            SessionEvent::Summary(summary) => {
                self.summary = Some(summary);
                Vec::new()
            }
            other => {
                tracing::trace!(event = other.name(), state = %self.state, "Ignoring event after termination");
                Vec::new()
            }
        }
    }

    fn on_rang(
        &mut self,
        call_id: CallId,
        credentials: MediaCredentials,
        max_duration_seconds: u64,
    ) -> Vec<SideEffect> {
        if self.role != Role::Caller || self.state != SessionState::Initiating {
            return Vec::new();
        }
        tracing::info!(call_id = %call_id, max_duration_seconds, "Call placed, ringing peer");
        self.call_id = Some(call_id);
        self.credentials = Some(credentials);
        self.billing.set_budget(max_duration_seconds);
        self.transition(SessionState::RingingOut);
        vec![
            SideEffect::AttachChannels,
            SideEffect::ScheduleTimer {
                name: TimerName::RingTimeout,
                delay: self.timings.ring_timeout,
            },
        ]
    }

    fn on_initiation_failed(&mut self, reason: TerminationReason) -> Vec<SideEffect> {
        if self.state != SessionState::Initiating {
            return Vec::new();
        }
        let state = match reason {
            TerminationReason::PeerBusy | TerminationReason::PeerUnavailable(_) => {
                SessionState::Busy
            }
            TerminationReason::PeerDeclined(_) => SessionState::Rejected,
            _ => SessionState::Failed,
        };
        self.terminate(state, reason)
    }

    fn on_remote_accepted(&mut self) -> Vec<SideEffect> {
        if self.state != SessionState::RingingOut {
            return Vec::new();
        }
        self.transition(SessionState::Accepted);
        let mut effects = vec![
            SideEffect::CancelTimer(TimerName::RingTimeout),
            SideEffect::WindDownPolling,
        ];
        effects.extend(self.begin_media());
        effects
    }

    fn on_local_accept(&mut self) -> Vec<SideEffect> {
        if self.state != SessionState::RingingIn {
            return Vec::new();
        }
        self.transition(SessionState::Accepted);
        let mut effects = vec![
            SideEffect::CancelTimer(TimerName::RingTimeout),
            SideEffect::Notify(BackendNotice::Accept),
            SideEffect::WindDownPolling,
        ];
        effects.extend(self.begin_media());
        effects
    }

    fn begin_media(&mut self) -> Vec<SideEffect> {
        let mut effects = Vec::new();
        if !self.has_started_media_join {
            match self.credentials.clone() {
                Some(credentials) => {
                    self.has_started_media_join = true;
                    effects.push(SideEffect::JoinMedia(credentials));
                }
                None => {
                    tracing::warn!(call_id = ?self.call_id, "Accepted without media credentials");
                    return self.terminate(
                        SessionState::Failed,
                        TerminationReason::MediaInit(self.timings.soft_timeout_code),
                    );
                }
            }
        }
        effects.push(SideEffect::ScheduleTimer {
            name: TimerName::PeerPresence,
            delay: self.timings.peer_presence,
        });
        effects
    }

    fn on_join_failed(&mut self, code: i32) -> Vec<SideEffect> {
        if !self.is_joining() {
            return Vec::new();
        }
        if code == self.timings.soft_timeout_code {
            tracing::debug!(call_id = ?self.call_id, code, "Soft join timeout, waiting on presence timer");
            self.soft_join_failure = Some(code);
            return Vec::new();
        }
        self.terminate(SessionState::Failed, TerminationReason::MediaInit(code))
    }

    fn maybe_connect(&mut self) -> Vec<SideEffect> {
        if !self.is_joining() || !self.local_joined || !self.peer_present {
            return Vec::new();
        }
        self.connected_at = Some(Utc::now());
        self.transition(SessionState::Connected);
        vec![
            SideEffect::CancelTimer(TimerName::PeerPresence),
            SideEffect::CancelTimer(TimerName::PresenceGrace),
            SideEffect::StartBilling,
        ]
    }

    fn on_timer(&mut self, name: TimerName) -> Vec<SideEffect> {
        match name {
            TimerName::RingTimeout => match self.state {
                SessionState::RingingOut => {
                    let mut effects = vec![SideEffect::Notify(BackendNotice::Cancel {
                        reason: "no answer".to_string(),
                    })];
                    effects.extend(self.terminate(SessionState::TimedOut, TerminationReason::NoAnswer));
                    effects
                }
                SessionState::RingingIn => {
                    self.terminate(SessionState::TimedOut, TerminationReason::Missed)
                }
                _ => Vec::new(),
            },
            TimerName::PeerPresence => {
                if !self.is_joining() || self.is_fully_joined() || self.presence_rechecked {
                    return Vec::new();
                }
                tracing::debug!(
                    call_id = ?self.call_id,
                    local_joined = self.local_joined,
                    peer_present = self.peer_present,
                    "Media not connected, rechecking call status"
                );
                self.presence_rechecked = true;
                vec![SideEffect::CheckStatus]
            }
            TimerName::PresenceGrace => {
                if !self.is_joining() || self.is_fully_joined() {
                    return Vec::new();
                }
                let reason = self.presence_failure();
                self.terminate(SessionState::Failed, reason)
            }
            TimerName::ExhaustionGrace => {
                if self.state != SessionState::Connected {
                    return Vec::new();
                }
                match self.pending_exhaustion.take() {
                    Some(reason) => self.terminate(SessionState::Ended, reason),
                    None => Vec::new(),
                }
            }
        }
    }

    fn on_tick(&mut self) -> Vec<SideEffect> {
        if self.state != SessionState::Connected {
            return Vec::new();
        }
        let outcome = self.billing.on_second_tick();
        let mut effects = Vec::new();
        if let Some(deduction) = outcome.deduction {
            effects.push(SideEffect::Deduct {
                minute: deduction.minute,
                elapsed_seconds: deduction.elapsed_seconds,
            });
        }
        if outcome.entered_low_time {
            tracing::info!(call_id = ?self.call_id, remaining = ?self.billing.remaining_seconds(), "Call time running low");
        }
        if outcome.exhausted {
            effects.extend(self.schedule_exhaustion(TerminationReason::BalanceExhausted));
        }
        effects
    }

    fn on_deducted(&mut self, minute: u64, outcome: Option<DeductionOutcome>) -> Vec<SideEffect> {
        match outcome {
            Some(DeductionOutcome::Charged) => {
                tracing::trace!(call_id = ?self.call_id, minute, "Minute billed");
                Vec::new()
            }
            Some(DeductionOutcome::InsufficientFunds) if self.state == SessionState::Connected => {
                tracing::info!(call_id = ?self.call_id, minute, "Deduction refused, ending call");
                self.schedule_exhaustion(TerminationReason::InsufficientFunds)
            }
            Some(DeductionOutcome::InsufficientFunds) => Vec::new(),
            None => {
                tracing::warn!(call_id = ?self.call_id, minute, "Deduction did not reach the backend");
                Vec::new()
            }
        }
    }

    fn schedule_exhaustion(&mut self, reason: TerminationReason) -> Vec<SideEffect> {
        if self.pending_exhaustion.is_some() {
            return Vec::new();
        }
        self.pending_exhaustion = Some(reason);
        vec![SideEffect::ScheduleTimer {
            name: TimerName::ExhaustionGrace,
            delay: self.timings.exhaustion_grace,
        }]
    }

    fn on_bonus_time(&mut self, seconds: u64) -> Vec<SideEffect> {
        let Some(remaining) = self.billing.extend_budget(seconds) else {
            return Vec::new();
        };
        tracing::info!(call_id = ?self.call_id, seconds, remaining, "Bonus time granted");
        if remaining > 0 && self.pending_exhaustion.take().is_some() {
            return vec![SideEffect::CancelTimer(TimerName::ExhaustionGrace)];
        }
        Vec::new()
    }

    fn terminate(&mut self, state: SessionState, reason: TerminationReason) -> Vec<SideEffect> {
        let was_accepted = self.state.has_accepted();
        self.transition(state);
        tracing::info!(call_id = ?self.call_id, state = %state, reason = %reason, "Session terminated");
        self.termination_reason = Some(reason);
        self.ended_at = Some(Utc::now());
        self.pending_exhaustion = None;

        let mut effects = vec![SideEffect::CancelAllTimers, SideEffect::StopBilling];
        if self.has_started_media_join {
            effects.push(SideEffect::LeaveMedia);
        }
        effects.push(SideEffect::WindDownPolling);
        if was_accepted {
            effects.push(SideEffect::Notify(BackendNotice::End {
                elapsed_seconds: self.billing.elapsed_seconds(),
            }));
        }
        effects
    }

    fn transition(&mut self, next: SessionState) {
        let old_state = self.state;
        if !Self::is_valid_transition(old_state, next) {
            tracing::warn!(call_id = ?self.call_id, old_state = %old_state, new_state = %next, "Unexpected state transition");
        }
        self.state = next;
        tracing::debug!(
            call_id = ?self.call_id,
            old_state = %old_state,
            new_state = %next,
            "Session state transition"
        );
    }

    /// Whether `to` follows `from` in the session graph
    #[must_use]
    pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
        if from.is_terminal() {
            return false;
        }
        matches!(
            (from, to),
            (SessionState::Idle, SessionState::Initiating)
                | (SessionState::Idle, SessionState::RingingIn)
                | (SessionState::Initiating, SessionState::RingingOut)
                | (SessionState::RingingOut, SessionState::Accepted)
                | (SessionState::RingingIn, SessionState::Accepted)
                | (SessionState::Accepted, SessionState::MediaJoining)
                | (SessionState::Accepted, SessionState::Connected)
                | (SessionState::MediaJoining, SessionState::Connected)
                | (_, SessionState::Ended)
                | (_, SessionState::Cancelled)
                | (_, SessionState::Rejected)
                | (_, SessionState::Busy)
                | (_, SessionState::TimedOut)
                | (_, SessionState::Failed)
        )
    }

    fn is_fully_joined(&self) -> bool {
        self.local_joined && self.peer_present
    }

    /// Why a session that ran out of presence time failed: the peer never
    /// showed up, or it did and our own join never completed.
    fn presence_failure(&self) -> TerminationReason {
        if self.peer_present {
            TerminationReason::MediaInit(
                self.soft_join_failure
                    .unwrap_or(self.timings.soft_timeout_code),
            )
        } else {
            TerminationReason::PeerNeverJoined
        }
    }

    fn is_joining(&self) -> bool {
        matches!(
            self.state,
            SessionState::Accepted | SessionState::MediaJoining
        )
    }

    /// Session role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Media kind
    #[must_use]
    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    /// Backend call id, once known
    #[must_use]
    pub fn call_id(&self) -> Option<&CallId> {
        self.call_id.as_ref()
    }

    /// Remote participant
    #[must_use]
    pub fn peer(&self) -> Option<&PeerId> {
        self.peer.as_ref()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current generation
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether the media join was requested
    #[must_use]
    pub fn has_started_media_join(&self) -> bool {
        self.has_started_media_join
    }

    /// Whether the peer was ever present in the media channel
    #[must_use]
    pub fn was_ever_connected(&self) -> bool {
        self.was_ever_connected
    }

    /// Billing state
    #[must_use]
    pub fn billing(&self) -> &BillingTicker {
        &self.billing
    }

    /// Why the session ended
    #[must_use]
    pub fn termination_reason(&self) -> Option<&TerminationReason> {
        self.termination_reason.as_ref()
    }

    /// Outcome, once terminal
    #[must_use]
    pub fn outcome(&self) -> Option<CallOutcome> {
        CallOutcome::resolve(
            self.state,
            self.was_ever_connected,
            self.billing.elapsed_seconds(),
            self.summary,
            self.termination_reason.as_ref(),
        )
    }

    /// Snapshot for subscribers
    #[must_use]
    pub fn snapshot(&self, session_id: SessionId) -> SessionSnapshot {
        SessionSnapshot {
            session_id,
            call_id: self.call_id.clone(),
            role: self.role,
            call_type: self.call_type,
            peer: self.peer.clone(),
            credentials: self.credentials.clone(),
            state: self.state,
            generation: self.generation,
            was_ever_connected: self.was_ever_connected,
            elapsed_seconds: self.billing.elapsed_seconds(),
            remaining_seconds: self.billing.remaining_seconds(),
            is_low_time: self.billing.is_low_time(),
            termination_reason: self.termination_reason.clone(),
            summary: self.summary,
            created_at: self.created_at,
            connected_at: self.connected_at,
            ended_at: self.ended_at,
        }
    }
}
