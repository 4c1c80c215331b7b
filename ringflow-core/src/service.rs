//! Call service orchestration
//!
//! [`CallService`] is the surface the UI layer talks to. It owns the session
//! registry (replacing any global "in a call" flag), turns inbound ring
//! notifications into receiver sessions, and runs candidate matching.

use crate::backend::{with_retry, CallBackend};
use crate::config::CoordinatorConfig;
use crate::identity::PeerId;
use crate::matching::{MatchController, MatchQueueScheduler, MatchReport, MatchStatus};
use crate::media::{MediaError, MediaTransport};
use crate::registry::ProcessedEventRegistry;
use crate::session::{InboundRing, SessionContext, SessionError, SessionHandle};
use crate::signaling::{PushChannel, PushMessage, StatusChannel};
use crate::types::{CallId, CallOutcome, CallType, QueueId, SessionId, SessionSnapshot};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

/// Service errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    InitError(String),

    /// No such session
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// No such matching queue
    #[error("Matching queue not found: {0}")]
    QueueNotFound(QueueId),

    /// Concurrent call limit reached
    #[error("Too many concurrent sessions (limit {0})")]
    TooManySessions(usize),

    /// Session actor has exited
    #[error("Session closed: {0}")]
    SessionClosed(SessionId),

    /// Target is blank
    #[error("Invalid call target: {0:?}")]
    InvalidTarget(String),

    /// Builder is missing a collaborator
    #[error("Missing collaborator: {0}")]
    MissingCollaborator(&'static str),
}

impl From<SessionError> for ServiceError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Closed(id) => Self::SessionClosed(id),
        }
    }
}

/// Service-level notifications
#[derive(Debug, Clone)]
pub enum ServiceEvent {
    /// An inbound call is ringing
    IncomingCall {
        /// Receiver session
        session: SessionId,
        /// Backend call id
        call_id: CallId,
        /// Who is calling
        caller: PeerId,
        /// Media kind
        call_type: CallType,
    },
    /// An inbound call was answered busy
    BusyRejected {
        /// Backend call id
        call_id: CallId,
        /// Who was calling
        caller: PeerId,
    },
    /// A matching run finished
    MatchFinished {
        /// Queue id
        queue: QueueId,
        /// Final report
        report: MatchReport,
    },
}

/// Builder for [`CallService`]
#[derive(Default)]
pub struct CallServiceBuilder {
    config: CoordinatorConfig,
    local_user: Option<PeerId>,
    backend: Option<Arc<dyn CallBackend>>,
    status: Option<Arc<dyn StatusChannel>>,
    push: Option<Arc<dyn PushChannel>>,
    media: Option<Arc<dyn MediaTransport>>,
}

impl CallServiceBuilder {
    /// Create a builder with the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration
    #[must_use]
    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the local user
    #[must_use]
    pub fn local_user(mut self, user: PeerId) -> Self {
        self.local_user = Some(user);
        self
    }

    /// Set the call-control backend
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn CallBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the status-poll endpoint
    #[must_use]
    pub fn status(mut self, status: Arc<dyn StatusChannel>) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the push channel
    #[must_use]
    pub fn push(mut self, push: Arc<dyn PushChannel>) -> Self {
        self.push = Some(push);
        self
    }

    /// Set the media transport
    #[must_use]
    pub fn media(mut self, media: Arc<dyn MediaTransport>) -> Self {
        self.media = Some(media);
        self
    }

    /// Build the service
    ///
    /// # Errors
    ///
    /// Returns error if a collaborator is missing or the config is invalid
    pub fn build(self) -> Result<CallService, ServiceError> {
        self.config
            .validate()
            .map_err(|e| ServiceError::InitError(e.to_string()))?;
        let local_user = self
            .local_user
            .ok_or(ServiceError::MissingCollaborator("local user"))?;
        if local_user.is_blank() {
            return Err(ServiceError::InvalidTarget(local_user.to_string()));
        }

        let (events, _) = broadcast::channel(256);
        let ctx = SessionContext {
            registry: ProcessedEventRegistry::shared(self.config.registry_capacity),
            config: Arc::new(self.config),
            local_user,
            backend: self.backend.ok_or(ServiceError::MissingCollaborator("backend"))?,
            status: self.status.ok_or(ServiceError::MissingCollaborator("status channel"))?,
            push: self.push.ok_or(ServiceError::MissingCollaborator("push channel"))?,
            media: self.media.ok_or(ServiceError::MissingCollaborator("media transport"))?,
        };

        Ok(CallService {
            inner: Arc::new(Inner {
                ctx,
                sessions: RwLock::new(HashMap::new()),
                matches: Mutex::new(HashMap::new()),
                events,
                intake: Mutex::new(None),
            }),
        })
    }
}

struct MatchEntry {
    controller: MatchController,
    report: watch::Receiver<Option<MatchReport>>,
}

struct Inner {
    ctx: SessionContext,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    matches: Mutex<HashMap<QueueId, MatchEntry>>,
    events: broadcast::Sender<ServiceEvent>,
    intake: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.intake.get_mut().take() {
            task.abort();
        }
    }
}

/// Call coordinator service
#[derive(Clone)]
pub struct CallService {
    inner: Arc<Inner>,
}

impl CallService {
    /// Start building a service
    pub fn builder() -> CallServiceBuilder {
        CallServiceBuilder::new()
    }

    /// Initialize media, connect push and start listening for inbound rings
    ///
    /// A push connection failure is not fatal: outbound calls still work
    /// through status polling.
    ///
    /// # Errors
    ///
    /// Returns error if the media transport cannot be initialized
    #[tracing::instrument(skip(self), fields(user = %self.inner.ctx.local_user))]
    pub async fn start(&self) -> Result<(), ServiceError> {
        tracing::info!("Starting call service");
        let ctx = &self.inner.ctx;

        if !ctx.media.initialize(&ctx.config.media.app_id).await {
            let error = MediaError::InitFailed(ctx.config.media.app_id.clone());
            return Err(ServiceError::InitError(error.to_string()));
        }
        if let Err(e) = ctx.push.connect().await {
            tracing::warn!(error = %e, "Push channel unavailable, continuing with status polling only");
        }

        let mut intake = self.inner.intake.lock();
        if intake.is_none() {
            let rings = ctx.push.subscribe();
            *intake = Some(tokio::spawn(ring_intake(Arc::downgrade(&self.inner), rings)));
        }
        drop(intake);

        tracing::info!("Call service started");
        Ok(())
    }

    /// Place an outbound call
    ///
    /// # Errors
    ///
    /// Returns error if the target is blank or the call limit is reached
    #[tracing::instrument(skip(self), fields(target = %target, call_type = %call_type))]
    pub fn start_outbound(
        &self,
        target: PeerId,
        call_type: CallType,
    ) -> Result<SessionHandle, ServiceError> {
        if target.is_blank() {
            return Err(ServiceError::InvalidTarget(target.to_string()));
        }

        let mut sessions = self.inner.sessions.write();
        self.ensure_capacity(&sessions)?;
        let handle = self.inner.ctx.spawn_outbound(target, call_type);
        sessions.insert(handle.id(), handle.clone());
        drop(sessions);
        tracing::info!(session = %handle.id(), "Outbound session started");
        Ok(handle)
    }

    /// Handle an inbound ring
    ///
    /// Returns the receiver session, or `None` when the ring was a duplicate
    /// or was answered busy.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for transports that validate rings
    #[tracing::instrument(skip(self, ring), fields(call_id = %ring.call_id, caller = %ring.caller))]
    pub async fn receive_ring(&self, ring: InboundRing) -> Result<Option<SessionHandle>, ServiceError> {
        let InboundRing {
            call_id,
            caller,
            call_type,
            ..
        } = ring.clone();

        let admitted = {
            let mut sessions = self.inner.sessions.write();
            let duplicate = sessions
                .values()
                .any(|handle| handle.snapshot().call_id.as_ref() == Some(&call_id));
            if duplicate {
                tracing::trace!("Dropping duplicate ring");
                return Ok(None);
            }
            if self.ensure_capacity(&sessions).is_ok() {
                let handle = self.inner.ctx.spawn_inbound(ring.clone());
                sessions.insert(handle.id(), handle.clone());
                Some(handle)
            } else {
                None
            }
        };
        let Some(handle) = admitted else {
            tracing::info!("Already in a call, answering busy");
            self.answer_busy(&ring).await;
            return Ok(None);
        };
        tracing::info!(session = %handle.id(), "Incoming call ringing");
        let _ = self.inner.events.send(ServiceEvent::IncomingCall {
            session: handle.id(),
            call_id,
            caller,
            call_type,
        });
        Ok(Some(handle))
    }

    async fn answer_busy(&self, ring: &InboundRing) {
        let ctx = &self.inner.ctx;
        let backend = Arc::clone(&ctx.backend);
        let _ = with_retry(ctx.config.retry_policy(), "reject_call", || {
            backend.reject_call(&ring.call_id, "busy")
        })
        .await;
        if let Err(e) = ctx
            .push
            .send(PushMessage::Busy {
                call_id: ring.call_id.clone(),
            })
            .await
        {
            tracing::warn!(error = %e, "Could not send busy over push");
        }
        let _ = self.inner.events.send(ServiceEvent::BusyRejected {
            call_id: ring.call_id.clone(),
            caller: ring.caller.clone(),
        });
    }

    /// Accept an inbound call
    ///
    /// # Errors
    ///
    /// Returns error if the session does not exist or has exited
    #[tracing::instrument(skip(self), fields(session = %session))]
    pub fn accept_inbound(&self, session: SessionId) -> Result<(), ServiceError> {
        self.handle(session)?.accept()?;
        Ok(())
    }

    /// Decline an inbound call
    ///
    /// # Errors
    ///
    /// Returns error if the session does not exist or has exited
    #[tracing::instrument(skip(self), fields(session = %session))]
    pub fn reject_inbound(&self, session: SessionId, reason: &str) -> Result<(), ServiceError> {
        self.handle(session)?.reject(reason)?;
        Ok(())
    }

    /// Cancel a session with a reason
    ///
    /// # Errors
    ///
    /// Returns error if the session does not exist or has exited
    #[tracing::instrument(skip(self), fields(session = %session))]
    pub async fn cancel(&self, session: SessionId, reason: &str) -> Result<CallOutcome, ServiceError> {
        let handle = self.handle(session)?;
        Ok(handle.end(reason).await?)
    }

    /// Hang up
    ///
    /// # Errors
    ///
    /// Returns error if the session does not exist or has exited
    #[tracing::instrument(skip(self), fields(session = %session))]
    pub async fn end_locally(&self, session: SessionId) -> Result<CallOutcome, ServiceError> {
        let handle = self.handle(session)?;
        Ok(handle.end("hangup").await?)
    }

    /// Call the same peer again from a finished session
    ///
    /// The session keeps its id and moves to its next generation. Returns
    /// `false` when the session is still live or its previous initiation has
    /// not been answered yet.
    ///
    /// # Errors
    ///
    /// Returns error if the session does not exist or has exited, or the call
    /// limit is reached
    #[tracing::instrument(skip(self), fields(session = %session))]
    pub async fn redial(&self, session: SessionId) -> Result<bool, ServiceError> {
        let redial = {
            let sessions = self.inner.sessions.write();
            let handle = sessions
                .get(&session)
                .cloned()
                .ok_or(ServiceError::SessionNotFound(session))?;
            if handle.is_live() {
                return Ok(false);
            }
            self.ensure_capacity(&sessions)?;
            // Takes the slot before the lock is released
            handle.request_redial()?
        };
        redial.await.map_err(|_| ServiceError::SessionClosed(session))
    }

    /// Mute or unmute the microphone
    ///
    /// # Errors
    ///
    /// Returns error if the session does not exist or has exited
    pub fn set_muted(&self, session: SessionId, muted: bool) -> Result<(), ServiceError> {
        self.handle(session)?.set_muted(muted)?;
        Ok(())
    }

    /// Toggle the loudspeaker
    ///
    /// # Errors
    ///
    /// Returns error if the session does not exist or has exited
    pub fn set_speaker(&self, session: SessionId, enabled: bool) -> Result<(), ServiceError> {
        self.handle(session)?.set_speaker(enabled)?;
        Ok(())
    }

    /// Grant extra call budget
    ///
    /// # Errors
    ///
    /// Returns error if the session does not exist or has exited
    pub fn extend_budget(&self, session: SessionId, seconds: u64) -> Result<(), ServiceError> {
        self.handle(session)?.extend_budget(seconds)?;
        Ok(())
    }

    /// Snapshot stream of a session
    ///
    /// # Errors
    ///
    /// Returns error if the session does not exist
    pub fn subscribe(&self, session: SessionId) -> Result<WatchStream<SessionSnapshot>, ServiceError> {
        Ok(self.handle(session)?.subscribe())
    }

    /// Latest snapshot of a session
    ///
    /// # Errors
    ///
    /// Returns error if the session does not exist
    pub fn snapshot(&self, session: SessionId) -> Result<SessionSnapshot, ServiceError> {
        Ok(self.handle(session)?.snapshot())
    }

    /// Session handle
    ///
    /// # Errors
    ///
    /// Returns error if the session does not exist
    pub fn handle(&self, session: SessionId) -> Result<SessionHandle, ServiceError> {
        self.inner
            .sessions
            .read()
            .get(&session)
            .cloned()
            .ok_or(ServiceError::SessionNotFound(session))
    }

    /// Stop a session and release everything it holds
    ///
    /// # Errors
    ///
    /// Returns error if the session does not exist
    #[tracing::instrument(skip(self), fields(session = %session))]
    pub async fn dispose(&self, session: SessionId) -> Result<(), ServiceError> {
        let handle = self
            .inner
            .sessions
            .write()
            .remove(&session)
            .ok_or(ServiceError::SessionNotFound(session))?;
        handle.dispose().await;
        tracing::debug!("Session disposed");
        Ok(())
    }

    /// The live session, if any
    #[must_use]
    pub fn active_session(&self) -> Option<SessionSnapshot> {
        self.inner
            .sessions
            .read()
            .values()
            .map(SessionHandle::snapshot)
            .find(|snapshot| !snapshot.state.is_terminal())
    }

    /// Ids of every registered session, live or finished
    #[must_use]
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.sessions.read().keys().copied().collect()
    }

    /// Ring candidates one at a time until one accepts
    ///
    /// # Errors
    ///
    /// Returns error if the call limit is reached
    #[tracing::instrument(skip(self, candidates), fields(call_type = %call_type))]
    pub fn start_matching(
        &self,
        candidates: Vec<PeerId>,
        call_type: CallType,
    ) -> Result<MatchController, ServiceError> {
        let (scheduler, controller) =
            MatchQueueScheduler::new(self.inner.ctx.clone(), candidates, call_type);
        let queue = controller.id();
        let (report_tx, report) = watch::channel(None);
        {
            let sessions = self.inner.sessions.read();
            let mut matches = self.inner.matches.lock();
            self.ensure_capacity_locked(&sessions, &matches)?;
            matches.insert(
                queue,
                MatchEntry {
                    controller: controller.clone(),
                    report,
                },
            );
        }

        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let (report, session) = scheduler.run().await;
            let Some(inner) = inner.upgrade() else {
                if let Some(session) = session {
                    session.dispose().await;
                }
                return;
            };
            if let Some(session) = session {
                inner.sessions.write().insert(session.id(), session);
            }
            report_tx.send_replace(Some(report.clone()));
            inner.matches.lock().remove(&queue);
            let _ = inner.events.send(ServiceEvent::MatchFinished { queue, report });
        });

        tracing::info!(queue = %queue, "Matching started");
        Ok(controller)
    }

    /// Cancel a matching run
    ///
    /// # Errors
    ///
    /// Returns error if the queue does not exist
    #[tracing::instrument(skip(self), fields(queue = %queue))]
    pub fn cancel_matching(&self, queue: QueueId) -> Result<(), ServiceError> {
        let matches = self.inner.matches.lock();
        let entry = matches.get(&queue).ok_or(ServiceError::QueueNotFound(queue))?;
        entry.controller.cancel();
        Ok(())
    }

    /// Progress of a matching run
    ///
    /// # Errors
    ///
    /// Returns error if the queue does not exist
    pub fn subscribe_matching(&self, queue: QueueId) -> Result<watch::Receiver<MatchStatus>, ServiceError> {
        let matches = self.inner.matches.lock();
        let entry = matches.get(&queue).ok_or(ServiceError::QueueNotFound(queue))?;
        Ok(entry.controller.subscribe())
    }

    /// Wait for a matching run to finish
    ///
    /// A matched session is registered before this returns. A run is released
    /// as soon as it finishes, so a caller that may arrive late should watch
    /// for [`ServiceEvent::MatchFinished`] instead.
    ///
    /// # Errors
    ///
    /// Returns error if the queue does not exist or was already released
    pub async fn wait_matching(&self, queue: QueueId) -> Result<MatchReport, ServiceError> {
        let mut report = self
            .inner
            .matches
            .lock()
            .get(&queue)
            .map(|entry| entry.report.clone())
            .ok_or(ServiceError::QueueNotFound(queue))?;
        let finished = report
            .wait_for(Option::is_some)
            .await
            .map(|report| report.clone())
            .map_err(|_| ServiceError::QueueNotFound(queue))?;
        finished.ok_or(ServiceError::QueueNotFound(queue))
    }

    /// Service-level notifications
    pub fn subscribe_events(&self) -> broadcast::Receiver<ServiceEvent> {
        self.inner.events.subscribe()
    }

    /// Stop intake, cancel matching and dispose every session
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down call service");
        if let Some(task) = self.inner.intake.lock().take() {
            task.abort();
        }
        for entry in self.inner.matches.lock().values() {
            entry.controller.cancel();
        }
        let sessions: Vec<SessionHandle> = self.inner.sessions.write().drain().map(|(_, h)| h).collect();
        for session in sessions {
            session.dispose().await;
        }
    }

    /// Capacity check against a session map the caller holds locked, so
    /// that the check and the following insert cannot interleave with another
    /// admission
    fn ensure_capacity(&self, sessions: &HashMap<SessionId, SessionHandle>) -> Result<(), ServiceError> {
        let matches = self.inner.matches.lock();
        self.ensure_capacity_locked(sessions, &matches)
    }

    fn ensure_capacity_locked(
        &self,
        sessions: &HashMap<SessionId, SessionHandle>,
        matches: &HashMap<QueueId, MatchEntry>,
    ) -> Result<(), ServiceError> {
        let limit = self.inner.ctx.config.max_concurrent_calls;
        let live = sessions.values().filter(|handle| handle.is_live()).count()
            + matches
                .values()
                .filter(|entry| entry.report.borrow().is_none())
                .count();
        if live >= limit {
            return Err(ServiceError::TooManySessions(limit));
        }
        Ok(())
    }
}

async fn ring_intake(
    inner: Weak<Inner>,
    mut rings: futures::stream::BoxStream<'static, PushMessage>,
) {
    while let Some(message) = rings.next().await {
        let Some(ring) = InboundRing::from_push(&message) else {
            continue;
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let service = CallService { inner };
        if let Err(e) = service.receive_ring(ring).await {
            tracing::warn!(error = %e, "Inbound ring could not be handled");
        }
    }
    tracing::warn!("Push channel closed, inbound rings will no longer arrive");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackBackend, LoopbackMedia, LoopbackPush, Script};
    use crate::types::SessionState;
    use std::time::Duration;

    fn service() -> (CallService, Arc<LoopbackBackend>, Arc<LoopbackMedia>) {
        let push = Arc::new(LoopbackPush::new());
        let backend = Arc::new(LoopbackBackend::new().linked_to(Arc::clone(&push)));
        let media = Arc::new(LoopbackMedia::new());
        let service = CallService::builder()
            .local_user(PeerId::new("alice"))
            .backend(backend.clone())
            .status(backend.clone())
            .push(push)
            .media(media.clone())
            .build()
            .unwrap();
        (service, backend, media)
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = CallService::builder()
            .local_user(PeerId::new("alice"))
            .build()
            .err()
            .unwrap();
        assert_eq!(err, ServiceError::MissingCollaborator("backend"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fails_when_media_refuses() {
        let (service, _, media) = service();
        media.fail_initialize();
        assert!(matches!(service.start().await, Err(ServiceError::InitError(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_outbound_call_is_refused() {
        let (service, _, media) = service();
        service.start().await.unwrap();
        assert_eq!(media.initialized_with().as_deref(), Some("ringflow"));

        let first = service
            .start_outbound(PeerId::new("bob"), CallType::Audio)
            .unwrap();
        assert_eq!(
            service
                .start_outbound(PeerId::new("carol"), CallType::Audio)
                .err(),
            Some(ServiceError::TooManySessions(1))
        );
        assert_eq!(
            service.start_outbound(PeerId::new("  "), CallType::Audio).err(),
            Some(ServiceError::InvalidTarget(String::new()))
        );

        service.dispose(first.id()).await.unwrap();
        assert!(service.session_ids().is_empty());
        assert!(service
            .start_outbound(PeerId::new("carol"), CallType::Audio)
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_session_errors() {
        let (service, _, _) = service();
        let missing = SessionId::new();
        assert_eq!(
            service.accept_inbound(missing),
            Err(ServiceError::SessionNotFound(missing))
        );
        assert!(service.dispose(missing).await.is_err());
        assert!(service.cancel_matching(QueueId::new()).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_outbound_calls_admit_one() {
        let (service, _, _) = service();
        let barrier = Arc::new(tokio::sync::Barrier::new(4));

        let attempts: Vec<_> = (0..4)
            .map(|n| {
                let service = service.clone();
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    service
                        .start_outbound(PeerId::new(format!("peer-{n}")), CallType::Audio)
                        .is_ok()
                })
            })
            .collect();
        let mut admitted = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 1);
        assert_eq!(service.session_ids().len(), 1);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_redial_takes_a_call_slot() {
        let (service, backend, _) = service();
        backend.script(&PeerId::new("bob"), Script::Busy);

        let bob = service
            .start_outbound(PeerId::new("bob"), CallType::Audio)
            .unwrap();
        bob.wait_until(|s| s.state == SessionState::Busy).await.unwrap();

        let carol = service
            .start_outbound(PeerId::new("carol"), CallType::Audio)
            .unwrap();
        assert_eq!(
            service.redial(bob.id()).await,
            Err(ServiceError::TooManySessions(1))
        );

        service.dispose(carol.id()).await.unwrap();
        backend.script(&PeerId::new("bob"), Script::NeverAnswer);
        assert_eq!(service.redial(bob.id()).await, Ok(true));
        assert_eq!(bob.snapshot().generation, 2);
        assert_eq!(service.active_session().map(|s| s.session_id), Some(bob.id()));
        assert_eq!(service.redial(bob.id()).await, Ok(false));
        assert_eq!(
            service
                .start_outbound(PeerId::new("dave"), CallType::Audio)
                .err(),
            Some(ServiceError::TooManySessions(1))
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(bob.state(), SessionState::RingingOut);
    }
}
