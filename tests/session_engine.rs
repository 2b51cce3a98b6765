mod common;

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use drivewatch_lib::{
    db::SessionStatus,
    session::SessionState,
    transport::TransportStatus,
    EngineError,
};

use common::{
    answer_on_hangup, attentive, engine, engine_with, eventually, eyes_closed, send_frames, serve,
    spawn_backend, wait_for_status, BACKEND_CLIENT_ID,
};

#[tokio::test]
async fn full_session_persists_ordered_metrics_and_alerts() {
    let mut t = engine();
    let _backend = spawn_backend(t.incoming.take().unwrap(), Arc::new(|_| eyes_closed()));

    let session = t.controller.start().await.unwrap();
    wait_for_status(&t.controller, "active", |s| s.session_state == SessionState::Active).await;

    let base = Utc::now();
    send_frames(&t.frames, base, 10, 250).await;
    let status = wait_for_status(&t.controller, "ten results", |s| s.results_processed == 10).await;
    assert_eq!(status.client_id.as_deref(), Some(BACKEND_CLIENT_ID));
    assert_eq!(status.transport_status, Some(TransportStatus::Connected));

    let latest = t.controller.latest_metric().unwrap();
    assert_eq!(latest.sequence_number, 9);
    assert!(latest.derived.eye_closed_alert);
    assert_eq!(latest.derived.eye_closed_sustained_ms, 2_250);

    let closed = t.controller.stop().await.unwrap();
    assert_eq!(closed.id, session.id);
    assert_eq!(closed.status, SessionStatus::Completed);
    assert!(closed.ended_at.is_some());

    let recorder = t.controller.recorder();
    let metrics = recorder.get_metrics_for_session(&session.id).await.unwrap();
    let seqs: Vec<u64> = metrics.iter().map(|m| m.sequence_number).collect();
    assert_eq!(seqs, (0..10).collect::<Vec<_>>());
    assert!(metrics.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

    // Default eye-closed threshold is 1000ms; frames are 250ms apart.
    let alerts: Vec<bool> = metrics.iter().map(|m| m.derived.eye_closed_alert).collect();
    assert_eq!(alerts, [vec![false; 4], vec![true; 6]].concat());

    let summary = recorder.summarize_session(&session.id).await.unwrap();
    assert_eq!(summary.record_count, 10);
    assert_eq!(summary.eye_closed_ratio, 1.0);
    assert_eq!(summary.face_missing_ratio, 0.0);
    assert_eq!(summary.ear_trend.len(), 10);

    let counters = t.controller.metrics().get_snapshot().await;
    assert_eq!(counters.dispatch.sent, 10);
    assert_eq!(counters.metrics_persisted, 10);
    assert_eq!(counters.correlation.delivered, 10);
    assert_eq!(counters.correlation.discarded(), 0);
}

#[tokio::test]
async fn exhausted_retries_fail_the_session() {
    let mut t = engine_with(|config| config.transport.max_retries = 1);
    // Nobody accepts: every connect attempt is refused.
    drop(t.incoming.take());

    let session = t.controller.start().await.unwrap();
    let status = wait_for_status(&t.controller, "error", |s| s.session_state == SessionState::Error).await;
    let last_error = status.last_error.unwrap();
    assert!(last_error.starts_with("transport error"), "{last_error}");

    let recorder = t.controller.recorder().clone();
    let id = session.id.clone();
    eventually("session marked failed", || {
        let recorder = recorder.clone();
        let id = id.clone();
        async move {
            recorder
                .get_session(&id)
                .await
                .unwrap()
                .is_some_and(|s| s.status == SessionStatus::Failed)
        }
    })
    .await;
    let failed = recorder.get_session(&session.id).await.unwrap().unwrap();
    assert_eq!(failed.ended_at, Some(failed.started_at));

    assert_eq!(
        t.controller.stop().await.unwrap_err(),
        EngineError::invalid_state("stop", "error")
    );
    assert_eq!(
        t.controller.start().await.unwrap_err(),
        EngineError::invalid_state("start", "error")
    );

    t.controller.reset().await.unwrap();
    let status = t.controller.status().await;
    assert_eq!(status.session_state, SessionState::Idle);
    assert!(status.session_id.is_none());
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn backend_drop_reconnects_and_resumes() {
    let mut t = engine();
    let mut incoming = t.incoming.take().unwrap();

    t.controller.start().await.unwrap();
    let first = incoming.recv().await.unwrap();
    wait_for_status(&t.controller, "active", |s| s.session_state == SessionState::Active).await;
    drop(first);

    let _backend = spawn_backend(incoming, Arc::new(|_| attentive()));
    let metrics = t.controller.metrics().clone();
    eventually("reconnect counted", || {
        let metrics = metrics.clone();
        async move { metrics.get_snapshot().await.reconnects == 1 }
    })
    .await;
    wait_for_status(&t.controller, "active again", |s| s.session_state == SessionState::Active).await;

    send_frames(&t.frames, Utc::now(), 3, 200).await;
    wait_for_status(&t.controller, "results after reconnect", |s| s.results_processed == 3).await;

    let closed = t.controller.stop().await.unwrap();
    assert_eq!(closed.status, SessionStatus::Completed);
}

#[tokio::test]
async fn clear_all_data_mid_session_resets_derivation_state() {
    let mut t = engine();
    let _backend = spawn_backend(t.incoming.take().unwrap(), Arc::new(|_| eyes_closed()));

    t.controller.start().await.unwrap();
    wait_for_status(&t.controller, "active", |s| s.session_state == SessionState::Active).await;
    let base = Utc::now();
    send_frames(&t.frames, base, 6, 250).await;
    wait_for_status(&t.controller, "six results", |s| s.results_processed == 6).await;
    assert!(t.controller.latest_metric().unwrap().derived.eye_closed_alert);

    assert_eq!(t.controller.clear_all_data().await.unwrap(), 1);
    let status = t.controller.status().await;
    assert_eq!(status.session_state, SessionState::Idle);
    assert_eq!(status.results_processed, 0);
    assert!(t.controller.latest_metric().is_none());
    assert!(t.controller.recorder().list_sessions().await.unwrap().is_empty());

    // A fresh session starts from zero, not from the cleared episode.
    let session = t.controller.start().await.unwrap();
    wait_for_status(&t.controller, "active", |s| s.session_state == SessionState::Active).await;
    send_frames(&t.frames, base + chrono::Duration::seconds(10), 1, 250).await;
    wait_for_status(&t.controller, "first result", |s| s.results_processed == 1).await;

    let first = t.controller.latest_metric().unwrap();
    assert_eq!(first.session_id, session.id);
    assert_eq!(first.sequence_number, 0);
    assert_eq!(first.derived.eye_closed_sustained_ms, 0);
    assert!(!first.derived.eye_closed_alert);
    t.controller.stop().await.unwrap();
}

#[tokio::test]
async fn frames_are_held_back_until_connected() {
    let mut t = engine_with(|config| {
        config.transport.backoff_base_ms = 1_000;
        config.transport.backoff_max_ms = 1_000;
    });
    // Refused connects keep the session in connecting through the backoff.
    drop(t.incoming.take());

    let session = t.controller.start().await.unwrap();
    assert_eq!(t.controller.status().await.session_state, SessionState::Connecting);
    send_frames(&t.frames, Utc::now(), 3, 200).await;

    let metrics = t.controller.metrics().clone();
    eventually("paused frames counted", || {
        let metrics = metrics.clone();
        async move { metrics.get_snapshot().await.dispatch.paused == 3 }
    })
    .await;
    assert_eq!(t.controller.metrics().get_snapshot().await.dispatch.sent, 0);

    let closed = t.controller.stop().await.unwrap();
    assert_eq!(closed.id, session.id);
    assert_eq!(closed.status, SessionStatus::Completed);
    assert!(t
        .controller
        .recorder()
        .get_metrics_for_session(&closed.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn failed_metric_writes_are_reported_while_derivation_continues() {
    let mut t = engine();
    let _backend = spawn_backend(t.incoming.take().unwrap(), Arc::new(|_| eyes_closed()));

    let session = t.controller.start().await.unwrap();
    wait_for_status(&t.controller, "active", |s| s.session_state == SessionState::Active).await;
    let base = Utc::now();
    send_frames(&t.frames, base, 2, 250).await;
    wait_for_status(&t.controller, "two results", |s| s.results_processed == 2).await;

    // Closing the row underneath the engine makes every later append fail.
    let recorder = t.controller.recorder().clone();
    recorder
        .close_session(&session.id, Utc::now(), SessionStatus::Completed)
        .await
        .unwrap();

    send_frames(&t.frames, base + chrono::Duration::milliseconds(500), 4, 250).await;
    let status = wait_for_status(&t.controller, "six results", |s| s.results_processed == 6).await;
    assert_eq!(status.session_state, SessionState::Active);
    let last_error = status.last_error.unwrap();
    assert!(last_error.contains("not open"), "{last_error}");

    let latest = t.controller.latest_metric().unwrap();
    assert_eq!(latest.sequence_number, 5);
    assert!(latest.id.is_none());
    assert_eq!(latest.derived.eye_closed_sustained_ms, 1_250);
    assert!(latest.derived.eye_closed_alert);

    let counters = t.controller.metrics().get_snapshot().await;
    assert_eq!(counters.metrics_persisted, 2);
    assert_eq!(counters.persistence_failures, 4);
    assert_eq!(recorder.get_metrics_for_session(&session.id).await.unwrap().len(), 2);

    // The record is already closed, so stopping reports it.
    assert!(matches!(
        t.controller.stop().await,
        Err(EngineError::Persistence(_))
    ));
    assert_eq!(t.controller.status().await.session_state, SessionState::Idle);
}

#[tokio::test]
async fn frames_are_dropped_while_reconnecting() {
    let mut t = engine_with(|config| {
        config.transport.backoff_base_ms = 100;
        config.transport.backoff_max_ms = 100;
        config.transport.max_retries = 100;
    });
    let mut incoming = t.incoming.take().unwrap();

    t.controller.start().await.unwrap();
    let first = incoming.recv().await.unwrap();
    wait_for_status(&t.controller, "active", |s| s.session_state == SessionState::Active).await;

    t.backend.refuse();
    drop(first);
    let status = wait_for_status(&t.controller, "reconnecting", |s| {
        s.session_state == SessionState::Reconnecting
    })
    .await;
    assert_eq!(status.transport_status, Some(TransportStatus::Reconnecting));

    send_frames(&t.frames, Utc::now(), 3, 200).await;
    let metrics = t.controller.metrics().clone();
    eventually("frames paused", || {
        let metrics = metrics.clone();
        async move { metrics.get_snapshot().await.dispatch.paused == 3 }
    })
    .await;
    assert_eq!(metrics.get_snapshot().await.dispatch.sent, 0);
    assert_eq!(
        t.controller.status().await.session_state,
        SessionState::Reconnecting
    );

    t.backend.accept();
    let _backend = spawn_backend(incoming, Arc::new(|_| attentive()));
    wait_for_status(&t.controller, "active again", |s| s.session_state == SessionState::Active).await;
    send_frames(&t.frames, Utc::now() + chrono::Duration::seconds(5), 2, 200).await;
    wait_for_status(&t.controller, "results after reconnect", |s| s.results_processed == 2).await;

    let counters = metrics.get_snapshot().await;
    assert_eq!(counters.reconnects, 1);
    assert_eq!(counters.dispatch.paused, 3);
    assert_eq!(counters.dispatch.sent, 2);
    t.controller.stop().await.unwrap();
}

#[tokio::test]
async fn losing_an_active_backend_fails_at_last_activity() {
    let mut t = engine_with(|config| config.transport.max_retries = 1);
    let mut incoming = t.incoming.take().unwrap();

    let session = t.controller.start().await.unwrap();
    let stream = incoming.recv().await.unwrap();
    let backend = tokio::spawn(serve(stream, Arc::new(|_| eyes_closed())));
    wait_for_status(&t.controller, "active", |s| s.session_state == SessionState::Active).await;

    send_frames(&t.frames, Utc::now(), 2, 250).await;
    wait_for_status(&t.controller, "two results", |s| s.results_processed == 2).await;
    let last_result_seen = Utc::now();

    tokio::time::sleep(Duration::from_millis(300)).await;
    t.backend.refuse();
    backend.abort();
    let status = wait_for_status(&t.controller, "error", |s| s.session_state == SessionState::Error).await;
    assert_eq!(status.transport_status, Some(TransportStatus::Disconnected));
    assert!(status.last_error.unwrap().starts_with("transport error"));

    let recorder = t.controller.recorder().clone();
    let id = session.id.clone();
    eventually("session marked failed", || {
        let recorder = recorder.clone();
        let id = id.clone();
        async move {
            recorder
                .get_session(&id)
                .await
                .unwrap()
                .is_some_and(|s| s.status == SessionStatus::Failed)
        }
    })
    .await;

    let failed = recorder.get_session(&session.id).await.unwrap().unwrap();
    let ended_at = failed.ended_at.unwrap();
    assert!(ended_at > failed.started_at);
    assert!(ended_at <= last_result_seen, "{ended_at} > {last_result_seen}");
    assert_eq!(recorder.get_metrics_for_session(&session.id).await.unwrap().len(), 2);

    t.controller.reset().await.unwrap();
}

#[tokio::test]
async fn results_arriving_during_stop_are_discarded() {
    let mut t = engine();
    let mut incoming = t.incoming.take().unwrap();

    let session = t.controller.start().await.unwrap();
    let stream = incoming.recv().await.unwrap();
    let _backend = tokio::spawn(answer_on_hangup(stream, Arc::new(|_| eyes_closed())));
    wait_for_status(&t.controller, "active", |s| s.session_state == SessionState::Active).await;

    send_frames(&t.frames, Utc::now(), 3, 250).await;
    let metrics = t.controller.metrics().clone();
    eventually("frames sent", || {
        let metrics = metrics.clone();
        async move { metrics.get_snapshot().await.dispatch.sent == 3 }
    })
    .await;

    let closed = t.controller.stop().await.unwrap();
    assert_eq!(closed.status, SessionStatus::Completed);
    assert!(t.controller.latest_metric().is_none());
    assert!(t
        .controller
        .recorder()
        .get_metrics_for_session(&session.id)
        .await
        .unwrap()
        .is_empty());

    let counters = metrics.get_snapshot().await;
    assert_eq!(counters.correlation.delivered, 0);
    assert_eq!(counters.metrics_persisted, 0);
}
