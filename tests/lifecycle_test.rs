//! Graceful shutdown integration tests.
//!
//! Drives [`JobLifecycleManager::initiate_shutdown`] against a running server
//! and checks drain timing, refusal of new work and callback ordering.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use tower::ServiceExt;

use common::{test_config, TestHarness};
use mf_server::lifecycle::{JobType, LifecycleState};
use mf_server::transcode::TranscodeRequest;

#[tokio::test]
async fn shutdown_with_no_jobs_is_immediate() {
    let (h, addr, server) = TestHarness::with_server().await;

    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "running");
    assert_eq!(body["storage"]["uploads_writable"], true);
    assert_eq!(body["storage"]["streams_writable"], true);

    let outcome = h.ctx.lifecycle.initiate_shutdown().await.unwrap();
    assert!(outcome.drained);
    assert!(outcome.abandoned.is_empty());
    assert!(outcome.waited < Duration::from_millis(500));
    assert_eq!(h.ctx.lifecycle.state(), LifecycleState::Stopped);

    let result = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn shutdown_waits_for_running_transcode() {
    let (h, _addr, server) = TestHarness::with_server().await;
    *h.encoder.tick_delay.lock() = Duration::from_millis(200);

    let source = h.write_source("movie.mp4");
    let request = TranscodeRequest::for_file(source, &h.streams_dir(), "movie");
    let video_id = request.video_id;
    let _job = h.ctx.orchestrator.submit(request).unwrap();
    assert_eq!(h.ctx.lifecycle.active_count(), 1);

    let outcome = h.ctx.lifecycle.initiate_shutdown().await.unwrap();
    assert!(outcome.drained, "transcode should finish inside the drain window");
    assert!(outcome.waited >= Duration::from_millis(800));
    assert!(outcome.waited < Duration::from_secs(5));

    // Both presets were written before the server stopped.
    assert!(h.ctx.catalog.get(video_id).is_some());
    let dir = h.streams_dir().join(video_id.to_string());
    assert!(dir.join("360p.mp4").exists());
    assert!(dir.join("720p.mp4").exists());

    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn shutdown_timeout_abandons_remaining_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.shutdown.drain_timeout_secs = 1;
    let h = TestHarness::with_config(config, dir);

    h.ctx
        .lifecycle
        .register("transcode:stuck", JobType::Transcode, "never finishes")
        .unwrap();

    let outcome = h.ctx.lifecycle.initiate_shutdown().await.unwrap();
    assert!(!outcome.drained);
    assert_eq!(outcome.abandoned.len(), 1);
    assert_eq!(outcome.abandoned[0].id, "transcode:stuck");
    assert!(outcome.waited >= Duration::from_secs(1));
    assert!(outcome.waited < Duration::from_secs(3));
    assert_eq!(h.ctx.lifecycle.state(), LifecycleState::Stopped);
}

#[tokio::test]
async fn draining_refuses_new_work() {
    let h = TestHarness::new();
    h.ctx
        .lifecycle
        .register("upload:held", JobType::Upload, "keeps the drain open")
        .unwrap();

    let lifecycle = Arc::clone(&h.ctx.lifecycle);
    let shutdown = tokio::spawn(async move { lifecycle.initiate_shutdown().await });
    assert!(h.wait_for(|| h.ctx.lifecycle.state() == LifecycleState::Draining).await);

    let resp = h
        .router()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let resp = h
        .router()
        .oneshot(
            Request::builder()
                .method(Method::PUT)
                .uri(format!("/api/uploads/{}", mf_core::UploadId::new()))
                .body(Body::from("data"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let source = h.write_source("late.mp4");
    let resp = h
        .router()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/api/transcodes")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({ "input_path": source }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(h.ctx.lifecycle.active_count(), 1);

    h.ctx.lifecycle.unregister("upload:held");
    let outcome = shutdown.await.unwrap().unwrap();
    assert!(outcome.drained);
}

#[tokio::test]
async fn second_shutdown_request_is_rejected() {
    let h = TestHarness::new();
    h.ctx
        .lifecycle
        .register("upload:held", JobType::Upload, "keeps the drain open")
        .unwrap();

    let lifecycle = Arc::clone(&h.ctx.lifecycle);
    let first = tokio::spawn(async move { lifecycle.initiate_shutdown().await });
    assert!(h.wait_for(|| h.ctx.lifecycle.state() == LifecycleState::Draining).await);

    let err = h.ctx.lifecycle.initiate_shutdown().await.unwrap_err();
    assert_eq!(err.http_status(), 503);

    h.ctx.lifecycle.unregister("upload:held");
    assert!(first.await.unwrap().unwrap().drained);
}

#[tokio::test]
async fn shutdown_callbacks_run_in_order_after_drain() {
    let h = TestHarness::new();
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));

    for name in ["flush", "broken", "close"] {
        let order = Arc::clone(&order);
        let calls = Arc::clone(&calls);
        h.ctx.lifecycle.on_shutdown(name, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            order.lock().push(name);
            if name == "broken" {
                Err(mf_core::Error::Internal("callback failed".into()))
            } else {
                Ok(())
            }
        });
    }

    let outcome = h.ctx.lifecycle.initiate_shutdown().await.unwrap();
    assert_eq!(outcome.cleanup_failures, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(*order.lock(), vec!["flush", "broken", "close"]);
}

#[tokio::test]
async fn background_loops_stop_when_draining() {
    let h = TestHarness::new();
    let handles = mf_server::spawn_background(&h.ctx);

    h.ctx.lifecycle.initiate_shutdown().await.unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("background loop did not stop")
            .unwrap();
    }
}
