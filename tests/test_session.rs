//! Session behaviour: dispatch, readiness, output draining, reset and reaping


use std::time::Duration;
use streamtask::pipeline::Http1Pipeline;
use streamtask::protocol::{OutboundItem, RequestHead};
use streamtask::session::Ownership;
use streamtask::testing::{fast_config, FailingPipeline, ScriptedPipeline, StallingPipeline};
use streamtask::{TaskError, TaskState, TaskStatus};
use test_helpers::{test_session, test_session_with, wait_until};

#[tokio::test]
async fn test_get_request_round_trip() {
    let mut session = test_session(Http1Pipeline::echo());
    let request = RequestHead::new("GET", "/x").with_authority("example.com");

    let handle = session.open_stream(7, &request, Ownership::Explicit).unwrap();
    assert_eq!(session.active_streams(), vec![7]);
    session.end_stream(7).await.unwrap();

    let response = session.collect_response(7).await.unwrap();
    assert_eq!(response.status, Some(200));
    assert_eq!(&response.body[..], b"GET /x\n");
    assert!(!response.is_reset());
    let head = response.head.unwrap();
    assert_eq!(head.headers.get("content-length"), Some("7"));

    assert_eq!(session.reap(7).await.unwrap(), TaskStatus::Completed);
    assert!(handle.is_destroyed());
    assert!(session.active_streams().is_empty());
}

#[tokio::test]
async fn test_post_body_reaches_pipeline() {
    let mut session = test_session(Http1Pipeline::echo());
    let request = RequestHead::new("POST", "/upload").with_header("content-length", "11");

    session.open_stream(1, &request, Ownership::Explicit).unwrap();
    session.push_data(1, "hello ").await.unwrap();
    session.push_data(1, "world").await.unwrap();
    session.end_stream(1).await.unwrap();

    let response = session.collect_response(1).await.unwrap();
    assert_eq!(&response.body[..], b"POST /upload\nhello world");
    assert_eq!(session.reap(1).await.unwrap(), TaskStatus::Completed);
}

#[tokio::test]
async fn test_malformed_request_gets_400() {
    let mut session = test_session(Http1Pipeline::echo());
    let request = RequestHead::new("GET", "/has space");

    session.open_stream(3, &request, Ownership::Explicit).unwrap();
    session.end_stream(3).await.unwrap();

    let response = session.collect_response(3).await.unwrap();
    assert_eq!(response.status, Some(400));
    assert_eq!(session.reap(3).await.unwrap(), TaskStatus::Completed);
}

#[tokio::test]
async fn test_oversized_head_gets_431() {
    let mut session = test_session(Http1Pipeline::echo());
    let long_value = "v".repeat(2 * 1024 * 1024);
    let long_path = format!("/{}", "p".repeat(128 * 1024));

    session
        .open_stream(
            23,
            &RequestHead::new("GET", "/").with_header("x-big", long_value),
            Ownership::Explicit,
        )
        .unwrap();
    session
        .open_stream(25, &RequestHead::new("GET", long_path), Ownership::Explicit)
        .unwrap();

    for id in [23, 25] {
        session.end_stream(id).await.unwrap();
        let response = session.collect_response(id).await.unwrap();
        assert_eq!(response.status, Some(431));
        assert_eq!(session.reap(id).await.unwrap(), TaskStatus::Completed);
    }
}

#[tokio::test]
async fn test_duplicate_and_unknown_streams() {
    let mut session = test_session(Http1Pipeline::echo());
    let request = RequestHead::new("GET", "/");

    session.open_stream(1, &request, Ownership::Explicit).unwrap();
    let err = session
        .open_stream(1, &request, Ownership::Explicit)
        .unwrap_err();
    assert!(matches!(err, TaskError::StreamExists { stream_id: 1 }));

    assert!(matches!(
        session.push_data(9, "x").await,
        Err(TaskError::UnknownStream { stream_id: 9 })
    ));
    assert!(matches!(
        session.reap(9).await,
        Err(TaskError::UnknownStream { .. })
    ));
    assert!(session.reset_stream(9).is_err());

    session.end_stream(1).await.unwrap();
    session.collect_response(1).await.unwrap();
    session.reap(1).await.unwrap();
}

#[tokio::test]
async fn test_header_line_breaks_are_refused_at_open() {
    let mut session = test_session(Http1Pipeline::echo());
    let request = RequestHead::new("GET", "/").with_header("x-a", "1\r\nX-Injected: evil");

    let err = session
        .open_stream(21, &request, Ownership::Explicit)
        .unwrap_err();
    assert!(matches!(err, TaskError::Setup { stream_id: 21, .. }));
    assert!(session.active_streams().is_empty());

    // The stream id stays usable for a well-formed request
    session
        .open_stream(21, &RequestHead::new("GET", "/"), Ownership::Explicit)
        .unwrap();
    session.end_stream(21).await.unwrap();
    assert_eq!(session.collect_response(21).await.unwrap().status, Some(200));
    session.reap(21).await.unwrap();
}

#[tokio::test]
async fn test_readiness_is_observed_once() {
    let mut session = test_session(ScriptedPipeline::new(202));
    session
        .open_stream(5, &RequestHead::new("GET", "/"), Ownership::Explicit)
        .unwrap();
    session.end_stream(5).await.unwrap();

    let event = session.wait_ready(5).await.unwrap();
    assert_eq!(event.response().map(|head| head.status), Some(202));
    assert!(matches!(
        session.wait_ready(5).await,
        Err(TaskError::ReadinessTaken { stream_id: 5 })
    ));

    // collect_response tolerates readiness already being consumed
    let response = session.collect_response(5).await.unwrap();
    assert_eq!(response.status, Some(202));
    session.reap(5).await.unwrap();
}

#[tokio::test]
async fn test_reset_aborts_stalled_task() {
    let pipeline = StallingPipeline::new();
    let mut session = test_session(pipeline.clone());
    let handle = session
        .open_stream(11, &RequestHead::new("GET", "/slow"), Ownership::Explicit)
        .unwrap();

    assert!(wait_until(|| pipeline.entered(), Duration::from_secs(5)).await);
    session.reset_stream(11).unwrap();
    assert!(handle.is_aborted());

    let response = session.collect_response(11).await.unwrap();
    assert!(response.is_reset());
    assert_eq!(response.status, None);

    assert_eq!(session.reap(11).await.unwrap(), TaskStatus::Aborted);
    assert!(pipeline.saw_cancellation());
    assert_eq!(handle.state(), TaskState::Done);
}

#[tokio::test]
async fn test_failed_pipeline_surfaces_as_reset() {
    let mut session = test_session(FailingPipeline::error("bad handler"));
    session
        .open_stream(13, &RequestHead::new("GET", "/"), Ownership::Explicit)
        .unwrap();

    let event = session.wait_ready(13).await.unwrap();
    assert!(event.response().is_none());

    let mut items = Vec::new();
    while let Some(item) = session.next_output(13).await.unwrap() {
        items.push(item);
    }
    assert!(matches!(items.as_slice(), [OutboundItem::Reset { reason }] if reason.contains("bad handler")));

    match session.reap(13).await.unwrap() {
        TaskStatus::Failed { reason } => assert!(reason.contains("bad handler")),
        other => panic!("unexpected status {other:?}"),
    }
}

#[tokio::test]
async fn test_auto_destroy_tasks_release_themselves() {
    let mut session = test_session(Http1Pipeline::echo());
    let handle = session
        .open_stream(15, &RequestHead::new("GET", "/auto"), Ownership::AutoDestroy)
        .unwrap();
    session.end_stream(15).await.unwrap();

    let response = session.collect_response(15).await.unwrap();
    assert_eq!(response.status, Some(200));
    assert!(wait_until(|| handle.is_destroyed(), Duration::from_secs(5)).await);

    assert_eq!(session.reap(15).await.unwrap(), TaskStatus::Completed);
    // Abort after destruction is a no-op
    handle.abort();
    assert!(!handle.is_aborted());
}

#[tokio::test]
async fn test_worker_pool_bounds_concurrency() {
    let mut config = fast_config();
    config.session.max_workers = 2;
    let mut session = test_session_with(config, Http1Pipeline::echo());

    let ids: Vec<u32> = (0..8).map(|i| i * 2 + 1).collect();
    for &id in &ids {
        session
            .open_stream(id, &RequestHead::new("GET", format!("/s{id}")), Ownership::Explicit)
            .unwrap();
    }
    for &id in &ids {
        session.end_stream(id).await.unwrap();
    }
    for &id in &ids {
        let response = session.collect_response(id).await.unwrap();
        assert_eq!(response.body, format!("GET /s{id}\n").into_bytes());
        assert_eq!(session.reap(id).await.unwrap(), TaskStatus::Completed);
    }
}

#[tokio::test]
async fn test_concurrent_draining_with_saturated_pool() {
    let mut config = fast_config();
    config.session.max_workers = 1;
    config.session.output_capacity = 1;
    let mut pipeline = ScriptedPipeline::new(200);
    for i in 0..4 {
        pipeline = pipeline.with_chunk(format!("c{i}"));
    }
    let mut session = test_session_with(config, pipeline);

    for id in [1, 3] {
        session
            .open_stream(id, &RequestHead::new("GET", "/"), Ownership::Explicit)
            .unwrap();
        session.end_stream(id).await.unwrap();
    }

    let session_ref = &session;
    let drain = |stream_id: u32| async move {
        let mut chunks = 0;
        while let Some(item) = session_ref.next_output(stream_id).await.unwrap() {
            if matches!(item, OutboundItem::Data(_)) {
                chunks += 1;
            }
        }
        chunks
    };
    let (first, second) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(drain(1), drain(3))
    })
    .await
    .expect("draining both streams stalled");
    assert_eq!((first, second), (4, 4));

    for id in [1, 3] {
        assert_eq!(session.reap(id).await.unwrap(), TaskStatus::Completed);
    }
}

#[tokio::test]
async fn test_input_after_completion_is_dropped() {
    let mut session = test_session(Http1Pipeline::echo());
    session
        .open_stream(17, &RequestHead::new("GET", "/"), Ownership::Explicit)
        .unwrap();
    session.end_stream(17).await.unwrap();
    session.collect_response(17).await.unwrap();

    let handle = session.handle(17).unwrap();
    assert!(wait_until(|| handle.is_done(), Duration::from_secs(5)).await);
    assert!(session.push_data(17, "late").await.is_ok());
    session.reap(17).await.unwrap();
}

#[tokio::test]
async fn test_shutdown_aborts_and_reaps_everything() {
    let pipeline = StallingPipeline::new();
    let mut session = test_session(pipeline.clone());
    for id in [1, 3, 5] {
        session
            .open_stream(id, &RequestHead::new("GET", "/"), Ownership::Explicit)
            .unwrap();
    }

    let results = session.shutdown().await;
    assert_eq!(results.len(), 3);
    for (_, result) in results {
        assert_eq!(result.unwrap(), TaskStatus::Aborted);
    }
}
