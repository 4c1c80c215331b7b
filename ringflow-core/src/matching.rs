//! Candidate matching
//!
//! Rings an ordered list of candidates one at a time until one accepts. Each
//! attempt is an ordinary outbound session, driven by the same channels and
//! timers as a directly placed call. Attempts never overlap: the previous
//! session is fully disposed before the next candidate is rung.

use crate::backend::{with_retry, BackendError};
use crate::identity::PeerId;
use crate::session::{SessionContext, SessionHandle};
use crate::types::{CallId, CallType, MediaCredentials, QueueId, SessionId, SessionState};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;

/// Ordered, deduplicated candidate list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateQueue {
    pending: VecDeque<PeerId>,
    total: usize,
}

impl CandidateQueue {
    /// Build a queue, dropping blanks and repeated candidates
    pub fn new<I>(candidates: I) -> Self
    where
        I: IntoIterator<Item = PeerId>,
    {
        let mut seen = HashSet::new();
        let pending: VecDeque<PeerId> = candidates
            .into_iter()
            .map(|candidate| PeerId::new(candidate.as_str()))
            .filter(|candidate| !candidate.is_blank())
            .filter(|candidate| seen.insert(candidate.clone()))
            .collect();
        let total = pending.len();
        Self { pending, total }
    }

    /// Next candidate to try
    pub fn next_candidate(&mut self) -> Option<PeerId> {
        self.pending.pop_front()
    }

    /// Candidates after deduplication
    #[must_use]
    pub fn len(&self) -> usize {
        self.total
    }

    /// Whether no usable candidate was given
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Candidates not yet tried
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

/// Accepted match
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedCall {
    /// Candidate who accepted
    pub candidate: PeerId,
    /// Session carrying the call
    pub session: SessionId,
    /// Backend call id
    pub call_id: CallId,
    /// Media channel credentials
    pub credentials: Option<MediaCredentials>,
}

/// How a matching run finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchOutcome {
    /// A candidate accepted
    Matched(MatchedCall),
    /// Every candidate was skipped or did not answer
    NoCandidateAnswered,
    /// Balance below the minimum; nobody was rung
    InsufficientBalance,
    /// Balance could not be checked; nobody was rung
    BalanceUnavailable(String),
    /// Cancelled by the caller
    Cancelled,
}

/// Progress of a matching run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchStatus {
    /// Verifying the balance precondition
    CheckingBalance,
    /// Looking up a candidate's capabilities
    Checking(PeerId),
    /// Ringing a candidate
    Ringing {
        /// Candidate being rung
        candidate: PeerId,
        /// Session of the attempt
        session: SessionId,
    },
    /// Run is over
    Finished(MatchOutcome),
}

/// Final report of a matching run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchReport {
    /// Queue id
    pub queue_id: QueueId,
    /// Outcome
    pub outcome: MatchOutcome,
    /// Candidates rung, in order
    pub rung: Vec<PeerId>,
    /// Candidates skipped as ineligible or unreachable
    pub skipped: Vec<PeerId>,
}

/// Handle to cancel and observe a matching run
#[derive(Debug, Clone)]
pub struct MatchController {
    id: QueueId,
    cancel: Arc<watch::Sender<bool>>,
    status: watch::Receiver<MatchStatus>,
}

impl MatchController {
    /// Queue id
    #[must_use]
    pub fn id(&self) -> QueueId {
        self.id
    }

    /// Cancel the run; the in-flight attempt is cancelled too
    pub fn cancel(&self) {
        self.cancel.send_if_modified(|cancelled| {
            let changed = !*cancelled;
            *cancelled = true;
            changed
        });
    }

    /// Whether cancel was requested
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Current progress
    #[must_use]
    pub fn status(&self) -> MatchStatus {
        self.status.borrow().clone()
    }

    /// Progress updates
    pub fn subscribe(&self) -> watch::Receiver<MatchStatus> {
        self.status.clone()
    }
}

enum Attempt {
    Accepted,
    Resolved(SessionState),
    Expired,
    Cancelled,
}

/// Sequential candidate ringer
pub struct MatchQueueScheduler {
    id: QueueId,
    ctx: SessionContext,
    candidates: CandidateQueue,
    call_type: CallType,
    cancel: watch::Receiver<bool>,
    status: watch::Sender<MatchStatus>,
    rung: Vec<PeerId>,
    skipped: Vec<PeerId>,
}

impl MatchQueueScheduler {
    /// Create a scheduler and the controller for it
    pub fn new<I>(ctx: SessionContext, candidates: I, call_type: CallType) -> (Self, MatchController)
    where
        I: IntoIterator<Item = PeerId>,
    {
        let id = QueueId::new();
        let (cancel_tx, cancel) = watch::channel(false);
        let (status, status_rx) = watch::channel(MatchStatus::CheckingBalance);
        let scheduler = Self {
            id,
            ctx,
            candidates: CandidateQueue::new(candidates),
            call_type,
            cancel,
            status,
            rung: Vec::new(),
            skipped: Vec::new(),
        };
        let controller = MatchController {
            id,
            cancel: Arc::new(cancel_tx),
            status: status_rx,
        };
        (scheduler, controller)
    }

    /// Run the queue to completion
    ///
    /// Returns the report and, on a match, the accepted session.
    #[tracing::instrument(name = "match_queue", skip(self), fields(queue = %self.id, candidates = self.candidates.len()))]
    pub async fn run(mut self) -> (MatchReport, Option<SessionHandle>) {
        let (outcome, session) = self.drive().await;
        tracing::info!(?outcome, rung = self.rung.len(), skipped = self.skipped.len(), "Matching finished");
        self.status.send_replace(MatchStatus::Finished(outcome.clone()));
        let report = MatchReport {
            queue_id: self.id,
            outcome,
            rung: self.rung,
            skipped: self.skipped,
        };
        (report, session)
    }

    async fn drive(&mut self) -> (MatchOutcome, Option<SessionHandle>) {
        if let Err(outcome) = self.check_balance().await {
            return (outcome, None);
        }

        while let Some(candidate) = self.candidates.next_candidate() {
            if self.is_cancelled() {
                return (MatchOutcome::Cancelled, None);
            }

            self.status
                .send_replace(MatchStatus::Checking(candidate.clone()));
            match self.ctx.backend.fetch_capabilities(&candidate).await {
                Ok(capabilities) if capabilities.allows(self.call_type) => {}
                Ok(_) => {
                    tracing::debug!(candidate = %candidate, "Candidate has this call type disabled, skipping");
                    self.skipped.push(candidate);
                    continue;
                }
                Err(e) => {
                    tracing::debug!(candidate = %candidate, error = %e, "Capability lookup failed, skipping");
                    self.skipped.push(candidate);
                    continue;
                }
            }
            if self.is_cancelled() {
                return (MatchOutcome::Cancelled, None);
            }

            let session = self.ctx.spawn_outbound(candidate.clone(), self.call_type);
            self.rung.push(candidate.clone());
            self.status.send_replace(MatchStatus::Ringing {
                candidate: candidate.clone(),
                session: session.id(),
            });
            tracing::info!(candidate = %candidate, session = %session.id(), "Ringing candidate");

            match self.attempt(&session).await {
                Attempt::Accepted => {
                    let snapshot = session.snapshot();
                    let Some(call_id) = snapshot.call_id else {
                        session.dispose().await;
                        continue;
                    };
                    let matched = MatchedCall {
                        candidate,
                        session: session.id(),
                        call_id,
                        credentials: snapshot.credentials,
                    };
                    return (MatchOutcome::Matched(matched), Some(session));
                }
                Attempt::Resolved(state) => {
                    tracing::debug!(candidate = %candidate, state = %state, "Attempt resolved without acceptance");
                    self.cancel_resolved(&session, state).await;
                }
                Attempt::Expired => {
                    tracing::debug!(candidate = %candidate, "Attempt window elapsed");
                    // The candidate may have accepted at the last moment
                    if session.state().has_accepted() {
                        let snapshot = session.snapshot();
                        if let Some(call_id) = snapshot.call_id {
                            let matched = MatchedCall {
                                candidate,
                                session: session.id(),
                                call_id,
                                credentials: snapshot.credentials,
                            };
                            return (MatchOutcome::Matched(matched), Some(session));
                        }
                    }
                    let _ = session.end("no answer").await;
                }
                Attempt::Cancelled => {
                    let _ = session.end("matching cancelled").await;
                    session.dispose().await;
                    return (MatchOutcome::Cancelled, None);
                }
            }
            session.dispose().await;
        }

        if self.is_cancelled() {
            return (MatchOutcome::Cancelled, None);
        }
        (MatchOutcome::NoCandidateAnswered, None)
    }

    async fn check_balance(&mut self) -> Result<(), MatchOutcome> {
        self.status.send_replace(MatchStatus::CheckingBalance);
        let minimum = self.ctx.config.matching.min_budget_seconds;
        let user = self.ctx.local_user.clone();
        let backend = Arc::clone(&self.ctx.backend);
        let call_type = self.call_type;
        let budget = with_retry(self.ctx.config.retry_policy(), "get_remaining_budget", || {
            backend.get_remaining_budget(&user, call_type)
        })
        .await;

        match budget {
            Ok(seconds) if seconds >= minimum => Ok(()),
            Ok(seconds) => {
                tracing::info!(seconds, minimum, "Balance too low to start matching");
                Err(MatchOutcome::InsufficientBalance)
            }
            Err(BackendError::InsufficientFunds) => Err(MatchOutcome::InsufficientBalance),
            Err(e) => Err(MatchOutcome::BalanceUnavailable(e.to_string())),
        }
    }

    async fn attempt(&mut self, session: &SessionHandle) -> Attempt {
        let window = self.ctx.config.attempt_window();
        let resolved = {
            let session = session.clone();
            async move {
                session
                    .wait_until(|s| s.state.has_accepted() || s.state.is_terminal())
                    .await
            }
        };

        tokio::select! {
            biased;
            () = cancelled(&mut self.cancel) => Attempt::Cancelled,
            result = resolved => match result {
                Ok(snapshot) if snapshot.state.has_accepted() => Attempt::Accepted,
                Ok(snapshot) => Attempt::Resolved(snapshot.state),
                // Actor gone; treat like any other dead attempt
                Err(_) => Attempt::Resolved(SessionState::Failed),
            },
            () = tokio::time::sleep(window) => Attempt::Expired,
        }
    }

    /// Cancellation notice for an attempt that ended on its own
    ///
    /// Sent for every terminal state, including a ring timeout that already
    /// cancelled the call from inside the session.
    async fn cancel_resolved(&self, session: &SessionHandle, state: SessionState) {
        let Some(call_id) = session.snapshot().call_id else {
            return;
        };
        tracing::debug!(call_id = %call_id, state = %state, "Cancelling resolved attempt");
        let backend = Arc::clone(&self.ctx.backend);
        let _ = with_retry(self.ctx.config.retry_policy(), "cancel_call", || {
            backend.cancel_call(&call_id, "matching advanced")
        })
        .await;
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// Resolves once cancel is requested; never if the controller is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let controller_gone = cancel.wait_for(|cancelled| *cancelled).await.is_err();
    if controller_gone {
        std::future::pending::<()>().await;
    }
}
