//! End-to-end call flows against the loopback collaborators
//!
//! Every test runs on tokio's paused clock, so ring timeouts and billing
//! minutes elapse instantly and deterministically.

use ringflow_core::loopback::{BackendCall, LoopbackBackend, LoopbackMedia, LoopbackPush, Script};
use ringflow_core::{
    CallError, CallOutcome, CallService, CallType, CoordinatorConfig, MediaEvent, PeerId, PushMessage,
    ServiceEvent, SessionHandle, SessionId, SessionSnapshot, SessionState, TerminationReason,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

struct Harness {
    service: CallService,
    backend: Arc<LoopbackBackend>,
    push: Arc<LoopbackPush>,
    media: Arc<LoopbackMedia>,
}

async fn started() -> Harness {
    let push = Arc::new(LoopbackPush::new());
    let backend = Arc::new(LoopbackBackend::new().linked_to(Arc::clone(&push)));
    let media = Arc::new(LoopbackMedia::new());
    let service = CallService::builder()
        .with_config(CoordinatorConfig::default())
        .local_user(PeerId::new("alice"))
        .backend(backend.clone())
        .status(backend.clone())
        .push(push.clone())
        .media(media.clone())
        .build()
        .unwrap();
    service.start().await.unwrap();
    Harness {
        service,
        backend,
        push,
        media,
    }
}

fn bob() -> PeerId {
    PeerId::new("bob")
}

async fn finished(session: &SessionHandle) -> SessionSnapshot {
    session
        .wait_until(|s| s.state.is_terminal())
        .await
        .unwrap()
}

async fn reached(session: &SessionHandle, state: SessionState) -> SessionSnapshot {
    session.wait_until(|s| s.state == state).await.unwrap()
}

async fn next_incoming(events: &mut broadcast::Receiver<ServiceEvent>) -> SessionId {
    loop {
        if let ServiceEvent::IncomingCall { session, .. } = events.recv().await.unwrap() {
            return session;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out_and_cancels_once() {
    let h = started().await;
    let began = Instant::now();

    let session = h.service.start_outbound(bob(), CallType::Audio).unwrap();
    let timed_out = finished(&session).await;

    let waited = began.elapsed();
    assert!(waited >= Duration::from_secs(30) && waited < Duration::from_secs(31));
    assert_eq!(timed_out.state, SessionState::TimedOut);
    assert_eq!(timed_out.termination_reason, Some(TerminationReason::NoAnswer));
    assert_eq!(
        timed_out.outcome(),
        Some(CallOutcome::Error {
            reason: TerminationReason::NoAnswer
        })
    );

    h.service.dispose(session.id()).await.unwrap();
    let call_id = timed_out.call_id.unwrap();
    assert_eq!(h.backend.cancel_count(&call_id), 1);
    assert_eq!(h.media.join_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn decline_seen_on_both_channels_is_applied_once() {
    let h = started().await;
    h.push.duplicate_messages(true);
    h.backend
        .script(&bob(), Script::RejectAfter(Duration::from_secs(3)));

    let session = h.service.start_outbound(bob(), CallType::Video).unwrap();
    let rejected = finished(&session).await;
    assert_eq!(rejected.state, SessionState::Rejected);
    assert!(matches!(
        rejected.termination_reason,
        Some(TerminationReason::PeerDeclined(_))
    ));

    // Let the poll fallback report the same decline
    tokio::time::sleep(Duration::from_secs(5)).await;
    let later = session.snapshot();
    assert_eq!(later.state, SessionState::Rejected);
    assert_eq!(later.termination_reason, rejected.termination_reason);

    h.service.dispose(session.id()).await.unwrap();
    let call_id = rejected.call_id.unwrap();
    assert_eq!(h.backend.cancel_count(&call_id), 0);
    assert_eq!(h.backend.end_count(&call_id), 0);
    assert_eq!(h.media.join_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn status_polling_carries_the_call_when_push_is_silent() {
    let h = started().await;
    h.push.drop_messages(true);
    h.media.peer_joins_after(Duration::from_millis(500));
    h.backend
        .script(&bob(), Script::AnswerAfter(Duration::from_secs(2)));

    let session = h.service.start_outbound(bob(), CallType::Audio).unwrap();
    let connected = reached(&session, SessionState::Connected).await;
    let call_id = connected.call_id.clone().unwrap();
    assert!(h.backend.status_polls(&call_id) >= 2);
    assert_eq!(h.media.join_count(), 1);

    let outcome = h.service.end_locally(session.id()).await.unwrap();
    assert!(matches!(outcome, CallOutcome::Connected { .. }));
}

#[tokio::test(start_paused = true)]
async fn soft_join_timeout_with_peer_present_fails_after_presence_window() {
    let h = started().await;
    h.media.fail_join_with(10);
    h.backend
        .script(&bob(), Script::AnswerAfter(Duration::from_secs(2)));

    let session = h.service.start_outbound(bob(), CallType::Audio).unwrap();
    reached(&session, SessionState::MediaJoining).await;
    let joining_at = Instant::now();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.media.emit(MediaEvent::PeerJoined { handle: 2 });

    let failed = finished(&session).await;
    assert_eq!(failed.state, SessionState::Failed);
    assert_eq!(failed.termination_reason, Some(TerminationReason::MediaInit(10)));
    assert!(failed.was_ever_connected);
    // Presence timeout plus the one-off grace after the status recheck
    assert!(joining_at.elapsed() >= Duration::from_secs(24));

    let call_id = failed.call_id.unwrap();
    assert!(h.backend.status_polls(&call_id) >= 1);
    h.service.dispose(session.id()).await.unwrap();
    assert_eq!(h.media.leave_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn local_cancel_before_answer_exits_silently() {
    let h = started().await;

    let session = h.service.start_outbound(bob(), CallType::Audio).unwrap();
    let ringing = reached(&session, SessionState::RingingOut).await;
    let outcome = h
        .service
        .cancel(session.id(), "changed my mind")
        .await
        .unwrap();
    assert_eq!(outcome, CallOutcome::NeverConnected);

    h.service.dispose(session.id()).await.unwrap();
    let call_id = ringing.call_id.unwrap();
    assert!(h.backend.calls().contains(&BackendCall::Cancel {
        call_id: call_id.clone(),
        reason: "changed my mind".to_string(),
    }));
    assert_eq!(h.backend.cancel_count(&call_id), 1);
    assert_eq!(h.media.leave_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn busy_peer_fails_the_call_up_front() {
    let h = started().await;
    h.backend.script(&bob(), Script::Busy);

    let session = h.service.start_outbound(bob(), CallType::Audio).unwrap();
    let busy = finished(&session).await;
    assert_eq!(busy.state, SessionState::Busy);
    assert_eq!(busy.call_id, None);
    let reason = busy.termination_reason.unwrap();
    assert_eq!(
        reason.error(),
        Some(CallError::PeerUnavailable("busy".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn incoming_call_accepted_then_ended_by_the_caller() {
    let h = started().await;
    h.media.peer_joins_after(Duration::from_secs(1));
    let mut events = h.service.subscribe_events();

    let call_id = h.backend.place_inbound(&PeerId::new("carol"), CallType::Video);
    let id = next_incoming(&mut events).await;
    let session = h.service.handle(id).unwrap();
    let ringing = session.snapshot();
    assert_eq!(ringing.state, SessionState::RingingIn);
    assert_eq!(ringing.call_id.as_ref(), Some(&call_id));

    // Nothing to mute before the media join
    h.service.set_muted(id, true).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.media.muted(), None);
    assert_eq!(h.media.join_count(), 0);

    h.service.accept_inbound(id).unwrap();
    reached(&session, SessionState::Connected).await;
    h.service.set_muted(id, true).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.media.muted(), Some(true));

    h.push.publish(PushMessage::Ended {
        call_id: call_id.clone(),
    });
    let ended = finished(&session).await;
    assert_eq!(ended.state, SessionState::Ended);
    assert_eq!(ended.termination_reason, Some(TerminationReason::RemoteEnded));
    assert!(ended.was_ever_connected);

    h.service.dispose(id).await.unwrap();
    assert_eq!(h.backend.accept_count(&call_id), 1);
    assert_eq!(h.backend.end_count(&call_id), 1);
    assert_eq!(h.media.join_count(), 1);
    assert_eq!(h.media.leave_count(), 1);
    assert!(session.snapshot().summary.is_some());
}

#[tokio::test(start_paused = true)]
async fn incoming_call_declined_locally() {
    let h = started().await;
    let mut events = h.service.subscribe_events();

    let call_id = h.backend.place_inbound(&PeerId::new("carol"), CallType::Audio);
    let id = next_incoming(&mut events).await;
    h.service.reject_inbound(id, "not now").unwrap();

    let session = h.service.handle(id).unwrap();
    let rejected = finished(&session).await;
    assert_eq!(rejected.state, SessionState::Rejected);
    assert_eq!(
        rejected.termination_reason,
        Some(TerminationReason::LocalReject("not now".to_string()))
    );
    assert_eq!(rejected.outcome(), Some(CallOutcome::NeverConnected));

    h.service.dispose(id).await.unwrap();
    assert_eq!(h.backend.reject_count(&call_id), 1);
    assert_eq!(h.media.join_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn caller_hanging_up_stops_the_ringing() {
    let h = started().await;
    let mut events = h.service.subscribe_events();

    let call_id = h.backend.place_inbound(&PeerId::new("carol"), CallType::Audio);
    let id = next_incoming(&mut events).await;
    h.backend.cancel_inbound(&call_id);

    let session = h.service.handle(id).unwrap();
    let cancelled = finished(&session).await;
    assert_eq!(cancelled.state, SessionState::Cancelled);
    assert!(matches!(
        cancelled.termination_reason,
        Some(TerminationReason::RemoteCancelled(_))
    ));
    assert_eq!(h.backend.reject_count(&call_id), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_incoming_call_is_missed() {
    let h = started().await;
    let mut events = h.service.subscribe_events();

    h.backend.place_inbound(&PeerId::new("carol"), CallType::Audio);
    let id = next_incoming(&mut events).await;
    let session = h.service.handle(id).unwrap();
    let missed = finished(&session).await;

    assert_eq!(missed.state, SessionState::TimedOut);
    assert_eq!(missed.termination_reason, Some(TerminationReason::Missed));
    assert!(h.service.active_session().is_none());
}

#[tokio::test(start_paused = true)]
async fn ring_during_a_call_is_answered_busy() {
    let h = started().await;
    let mut events = h.service.subscribe_events();

    let session = h.service.start_outbound(bob(), CallType::Audio).unwrap();
    reached(&session, SessionState::RingingOut).await;

    let carol = PeerId::new("carol");
    let inbound = h.backend.place_inbound(&carol, CallType::Audio);
    let (call_id, caller) = loop {
        if let ServiceEvent::BusyRejected { call_id, caller } = events.recv().await.unwrap() {
            break (call_id, caller);
        }
    };

    assert_eq!(call_id, inbound);
    assert_eq!(caller, carol);
    assert_eq!(h.backend.reject_count(&inbound), 1);
    assert!(h.push.sent().contains(&PushMessage::Busy { call_id: inbound }));
    assert_eq!(h.service.session_ids(), vec![session.id()]);
    assert_eq!(session.state(), SessionState::RingingOut);
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_ends_the_call_after_the_grace_period() {
    let h = started().await;
    h.backend.set_max_duration(130);
    h.media.peer_joins_after(Duration::from_millis(500));
    h.backend
        .script(&bob(), Script::AnswerAfter(Duration::from_secs(1)));

    let session = h.service.start_outbound(bob(), CallType::Audio).unwrap();
    reached(&session, SessionState::Connected).await;
    let low = session.wait_until(|s| s.is_low_time).await.unwrap();
    assert_eq!(low.state, SessionState::Connected);
    assert!(low.remaining_seconds.unwrap() < 120);

    let ended = finished(&session).await;
    assert_eq!(ended.state, SessionState::Ended);
    assert_eq!(
        ended.termination_reason,
        Some(TerminationReason::BalanceExhausted)
    );
    assert!(ended.elapsed_seconds >= 130);
    assert_eq!(ended.remaining_seconds, Some(0));

    h.service.dispose(session.id()).await.unwrap();
    let call_id = ended.call_id.unwrap();
    assert_eq!(h.backend.deduction_count(&call_id), 2);
    assert_eq!(h.backend.end_count(&call_id), 1);
    assert!(matches!(
        session.snapshot().outcome(),
        Some(CallOutcome::Connected {
            summary: Some(_),
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn refused_deduction_ends_the_call() {
    let h = started().await;
    h.backend.fund_minutes(Some(0));
    h.media.peer_joins_after(Duration::from_millis(500));
    h.backend
        .script(&bob(), Script::AnswerAfter(Duration::from_secs(1)));

    let session = h.service.start_outbound(bob(), CallType::Audio).unwrap();
    reached(&session, SessionState::Connected).await;
    let ended = finished(&session).await;

    assert_eq!(
        ended.termination_reason,
        Some(TerminationReason::InsufficientFunds)
    );
    assert!(ended.elapsed_seconds >= 60 && ended.elapsed_seconds < 70);
}

#[tokio::test(start_paused = true)]
async fn extending_the_budget_keeps_the_call_going() {
    let h = started().await;
    h.backend.set_max_duration(20);
    h.media.peer_joins_after(Duration::from_millis(500));
    h.backend
        .script(&bob(), Script::AnswerAfter(Duration::from_secs(1)));

    let session = h.service.start_outbound(bob(), CallType::Audio).unwrap();
    reached(&session, SessionState::Connected).await;
    session
        .wait_until(|s| s.elapsed_seconds >= 15)
        .await
        .unwrap();
    h.service.extend_budget(session.id(), 60).unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    let still = session.snapshot();
    assert_eq!(still.state, SessionState::Connected);
    assert!(still.remaining_seconds.unwrap() > 0);

    let ended = finished(&session).await;
    assert_eq!(
        ended.termination_reason,
        Some(TerminationReason::BalanceExhausted)
    );
    assert!(ended.elapsed_seconds >= 80);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_live_calls() {
    let h = started().await;

    let session = h.service.start_outbound(bob(), CallType::Audio).unwrap();
    let ringing = reached(&session, SessionState::RingingOut).await;
    h.service.shutdown().await;

    assert!(session.is_closed());
    assert_eq!(session.state(), SessionState::Cancelled);
    assert!(h.service.session_ids().is_empty());
    assert_eq!(h.backend.cancel_count(&ringing.call_id.unwrap()), 1);
}
