//! Candidate matching against the loopback collaborators

use ringflow_core::loopback::{BackendCall, LoopbackBackend, LoopbackMedia, LoopbackPush, Script};
use ringflow_core::{
    BackendError, CallId, CallService, CallType, CoordinatorConfig, MatchOutcome, MatchStatus,
    PeerCapabilities, PeerId, ServiceError, ServiceEvent, SessionState,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    service: CallService,
    backend: Arc<LoopbackBackend>,
}

async fn started() -> Harness {
    started_with(CoordinatorConfig::default()).await
}

async fn started_with(config: CoordinatorConfig) -> Harness {
    let push = Arc::new(LoopbackPush::new());
    let backend = Arc::new(LoopbackBackend::new().linked_to(Arc::clone(&push)));
    let media = Arc::new(LoopbackMedia::new());
    media.peer_joins_after(Duration::from_millis(500));
    let service = CallService::builder()
        .with_config(config)
        .local_user(PeerId::new("alice"))
        .backend(backend.clone())
        .status(backend.clone())
        .push(push)
        .media(media)
        .build()
        .unwrap();
    service.start().await.unwrap();
    Harness { service, backend }
}

fn peers(names: &[&str]) -> Vec<PeerId> {
    names.iter().map(|name| PeerId::new(*name)).collect()
}

fn position(calls: &[BackendCall], wanted: &BackendCall) -> usize {
    calls.iter().position(|call| call == wanted).unwrap()
}

#[tokio::test(start_paused = true)]
async fn skips_ineligible_and_advances_past_silence() {
    let h = started().await;
    let [a, b, c] = [PeerId::new("a"), PeerId::new("b"), PeerId::new("c")];
    h.backend.set_capabilities(
        &a,
        PeerCapabilities {
            audio_enabled: true,
            video_enabled: false,
        },
    );
    h.backend.script(&b, Script::NeverAnswer);
    h.backend
        .script(&c, Script::AnswerAfter(Duration::from_secs(4)));

    let controller = h
        .service
        .start_matching(vec![a.clone(), b.clone(), c.clone()], CallType::Video)
        .unwrap();
    let report = h.service.wait_matching(controller.id()).await.unwrap();

    assert_eq!(report.rung, vec![b.clone(), c.clone()]);
    assert_eq!(report.skipped, vec![a.clone()]);
    assert_eq!(h.backend.initiated_targets(), vec![b.clone(), c.clone()]);
    assert_eq!(h.backend.capability_lookups(&a), 1);

    let MatchOutcome::Matched(matched) = report.outcome else {
        unreachable!("expected a match, got {:?}", report.outcome);
    };
    assert_eq!(matched.candidate, c);
    assert!(matched.credentials.is_some());

    // B was cancelled before C was rung
    let calls = h.backend.calls();
    let b_call = CallId::new("call-1");
    let cancel_b = position(
        &calls,
        &BackendCall::Cancel {
            call_id: b_call.clone(),
            reason: "no answer".to_string(),
        },
    );
    let ring_c = position(
        &calls,
        &BackendCall::Initiate {
            target: c,
            call_type: CallType::Video,
        },
    );
    assert!(cancel_b < ring_c);
    assert_eq!(h.backend.cancel_count(&b_call), 1);

    // The matched session is registered and carries on into the call
    let session = h.service.handle(matched.session).unwrap();
    session
        .wait_until(|s| s.state == SessionState::Connected)
        .await
        .unwrap();
    assert_eq!(h.service.session_ids(), vec![matched.session]);
    assert_eq!(h.backend.cancel_count(&matched.call_id), 0);
}

#[tokio::test(start_paused = true)]
async fn decline_moves_on_to_the_next_candidate() {
    let h = started().await;
    let [b, c] = [PeerId::new("b"), PeerId::new("c")];
    h.backend
        .script(&b, Script::RejectAfter(Duration::from_secs(2)));
    h.backend
        .script(&c, Script::AnswerAfter(Duration::from_secs(1)));

    let controller = h
        .service
        .start_matching(vec![b, c.clone()], CallType::Audio)
        .unwrap();
    let report = h.service.wait_matching(controller.id()).await.unwrap();

    assert!(matches!(report.outcome, MatchOutcome::Matched(ref m) if m.candidate == c));
    assert_eq!(report.rung.len(), 2);
    assert_eq!(h.backend.cancel_count(&CallId::new("call-1")), 1);
}

#[tokio::test(start_paused = true)]
async fn nobody_answering_exhausts_the_queue() {
    let h = started().await;
    let mut events = h.service.subscribe_events();

    let controller = h
        .service
        .start_matching(peers(&["b", "c"]), CallType::Audio)
        .unwrap();
    let queue = controller.id();
    let report = loop {
        if let ServiceEvent::MatchFinished { queue: q, report } = events.recv().await.unwrap() {
            assert_eq!(q, queue);
            break report;
        }
    };

    assert_eq!(report.outcome, MatchOutcome::NoCandidateAnswered);
    assert_eq!(report.rung, peers(&["b", "c"]));
    assert_eq!(
        controller.status(),
        MatchStatus::Finished(MatchOutcome::NoCandidateAnswered)
    );
    assert!(h.service.active_session().is_none());
    assert!(h.service.session_ids().is_empty());
}

#[tokio::test(start_paused = true)]
async fn low_balance_rings_nobody() {
    let h = started().await;
    h.backend.set_budget(30);

    let controller = h
        .service
        .start_matching(peers(&["b"]), CallType::Audio)
        .unwrap();
    let report = h.service.wait_matching(controller.id()).await.unwrap();

    assert_eq!(report.outcome, MatchOutcome::InsufficientBalance);
    assert!(report.rung.is_empty());
    assert!(h.backend.initiated_targets().is_empty());
}

#[tokio::test(start_paused = true)]
async fn balance_lookup_failure_is_reported() {
    let h = started().await;
    h.backend
        .fail_budget(BackendError::Network("timeout".to_string()));

    let controller = h
        .service
        .start_matching(peers(&["b"]), CallType::Audio)
        .unwrap();
    let report = h.service.wait_matching(controller.id()).await.unwrap();

    assert!(matches!(report.outcome, MatchOutcome::BalanceUnavailable(_)));
    assert!(h.backend.initiated_targets().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelling_stops_the_ringing_attempt() {
    let h = started().await;

    let controller = h
        .service
        .start_matching(peers(&["b", "c"]), CallType::Audio)
        .unwrap();
    let mut status = controller.subscribe();
    status
        .wait_for(|s| matches!(s, MatchStatus::Ringing { .. }))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    h.service.cancel_matching(controller.id()).unwrap();

    let report = h.service.wait_matching(controller.id()).await.unwrap();
    assert_eq!(report.outcome, MatchOutcome::Cancelled);
    assert_eq!(report.rung, peers(&["b"]));
    assert_eq!(h.backend.initiated_targets(), peers(&["b"]));
    assert_eq!(h.backend.cancel_count(&CallId::new("call-1")), 1);
    assert_eq!(
        h.service.cancel_matching(controller.id()),
        Err(ServiceError::QueueNotFound(controller.id()))
    );
}

#[tokio::test(start_paused = true)]
async fn matching_counts_as_a_live_call() {
    let h = started().await;

    let controller = h
        .service
        .start_matching(peers(&["b"]), CallType::Audio)
        .unwrap();
    assert_eq!(
        h.service
            .start_outbound(PeerId::new("carol"), CallType::Audio)
            .err(),
        Some(ServiceError::TooManySessions(1))
    );
    controller.cancel();
    h.service.wait_matching(controller.id()).await.unwrap();
    assert!(h
        .service
        .start_outbound(PeerId::new("carol"), CallType::Audio)
        .is_ok());
}

#[tokio::test(start_paused = true)]
async fn unresponsive_backend_does_not_stall_the_queue() {
    let h = started().await;
    let [mute, c] = [PeerId::new("mute"), PeerId::new("c")];
    h.backend.script(&mute, Script::Unresponsive);
    h.backend
        .script(&c, Script::AnswerAfter(Duration::from_secs(1)));

    let controller = h
        .service
        .start_matching(vec![mute.clone(), c.clone()], CallType::Audio)
        .unwrap();
    let report = tokio::time::timeout(
        Duration::from_secs(3600),
        h.service.wait_matching(controller.id()),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(matches!(report.outcome, MatchOutcome::Matched(ref m) if m.candidate == c));
    assert_eq!(report.rung, vec![mute.clone(), c.clone()]);
    assert_eq!(h.backend.initiated_targets(), vec![mute, c]);
}

#[tokio::test(start_paused = true)]
async fn attempt_that_times_out_is_still_cancelled_by_matching() {
    let mut config = CoordinatorConfig::default();
    config.timers.ring_timeout_ms = 4_000;
    let h = started_with(config).await;

    let controller = h
        .service
        .start_matching(peers(&["b"]), CallType::Audio)
        .unwrap();
    let report = h.service.wait_matching(controller.id()).await.unwrap();
    assert_eq!(report.outcome, MatchOutcome::NoCandidateAnswered);

    let call_id = CallId::new("call-1");
    let calls = h.backend.calls();
    assert!(calls.contains(&BackendCall::Cancel {
        call_id: call_id.clone(),
        reason: "no answer".to_string(),
    }));
    assert!(calls.contains(&BackendCall::Cancel {
        call_id: call_id.clone(),
        reason: "matching advanced".to_string(),
    }));
    assert_eq!(h.backend.cancel_count(&call_id), 2);
}

#[tokio::test(start_paused = true)]
async fn finished_run_releases_its_queue() {
    let h = started().await;
    let mut events = h.service.subscribe_events();
    h.backend.set_budget(30);

    let controller = h
        .service
        .start_matching(peers(&["b"]), CallType::Audio)
        .unwrap();
    let queue = controller.id();
    loop {
        if let ServiceEvent::MatchFinished { queue: q, .. } = events.recv().await.unwrap() {
            assert_eq!(q, queue);
            break;
        }
    }

    assert_eq!(
        h.service.subscribe_matching(queue).err(),
        Some(ServiceError::QueueNotFound(queue))
    );
    assert_eq!(
        h.service.cancel_matching(queue),
        Err(ServiceError::QueueNotFound(queue))
    );
    assert_eq!(
        controller.status(),
        MatchStatus::Finished(MatchOutcome::InsufficientBalance)
    );
    assert_eq!(
        h.service.wait_matching(queue).await.err(),
        Some(ServiceError::QueueNotFound(queue))
    );
}
