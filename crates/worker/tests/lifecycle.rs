//! Request lifecycle tests against a scripted engine

mod common;

use common::{greedy, worker_with, ScriptedEngine, FAIL_MARKER};
use futures::StreamExt;
use llmops_common::config::MAX_REQUEST_TIMEOUT_SECS;
use llmops_common::LlmOpsError;
use llmops_proto::{decode_frames, ErrorCode, GenerateParams, StreamUnit};
use llmops_worker::RequestState;
use std::sync::Arc;
use std::time::Duration;

async fn collect_units(request: llmops_worker::GenerationRequest) -> Vec<StreamUnit> {
    let mut body = Vec::new();
    let mut frames = request.into_frames();
    while let Some(frame) = frames.next().await {
        body.extend_from_slice(&frame.unwrap());
    }
    decode_frames(&body).unwrap()
}

#[tokio::test]
async fn test_capacity_one_serializes_submissions() {
    let engine = Arc::new(ScriptedEngine::five_tokens());
    let worker = worker_with(engine.clone(), 1);

    let first = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.generate(&greedy("first")).await })
    };
    let second = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.generate(&greedy("second")).await })
    };
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();

    let submissions = engine.submissions();
    let ended = engine.ended();
    assert_eq!(submissions.len(), 2);
    assert_eq!(engine.peak_running(), 1);

    let (earlier, later) = (&submissions[0], &submissions[1]);
    let earlier_end = ended
        .iter()
        .find(|(id, _)| id == &earlier.request_id)
        .map(|(_, at)| *at)
        .unwrap();
    assert!(later.at >= earlier_end);
}

#[tokio::test]
async fn test_disconnect_mid_stream_aborts_once_and_releases_slot() {
    let engine = Arc::new(ScriptedEngine::five_tokens());
    let worker = worker_with(engine.clone(), 1);

    let request = worker.generate_stream(&greedy("hello")).await.unwrap();
    let request_id = request.id().to_string();
    let mut frames = request.into_frames();

    for _ in 0..2 {
        frames.next().await.unwrap().unwrap();
    }
    assert_eq!(worker.slot_stats().load, 1);

    // Client hangs up
    drop(frames);

    assert_eq!(engine.aborts(), vec![request_id]);
    let stats = worker.slot_stats();
    assert_eq!(stats.load, 0);
    assert_eq!(stats.acquired, 1);
    assert_eq!(stats.released, 1);
    assert_eq!(worker.in_flight(), 0);
    assert_eq!(engine.running(), 0);
}

#[tokio::test]
async fn test_streaming_and_non_streaming_converge() {
    let engine = Arc::new(ScriptedEngine::five_tokens());
    let worker = worker_with(engine.clone(), 4);

    let request = worker.generate_stream(&greedy("tell me")).await.unwrap();
    let units = collect_units(request).await;
    let complete = worker.generate(&greedy("tell me")).await.unwrap();

    assert_eq!(units.len(), 5);
    assert!(units.iter().all(|u| !u.is_error()));
    assert_eq!(units.last().unwrap(), &complete);
    assert_eq!(complete.text, "The quick brown fox jumps");
    assert_eq!(complete.usage.completion_tokens, Some(5));
    assert_eq!(complete.usage.total_tokens, Some(7));

    // Completed requests are never aborted
    assert!(engine.aborts().is_empty());
}

#[tokio::test]
async fn test_stream_units_arrive_in_generation_order() {
    let engine = Arc::new(ScriptedEngine::five_tokens());
    let worker = worker_with(engine, 1);

    let request = worker.generate_stream(&greedy("count")).await.unwrap();
    let units = collect_units(request).await;

    for pair in units.windows(2) {
        assert!(pair[1].text.starts_with(&pair[0].text));
        assert!(pair[1].text.len() > pair[0].text.len());
    }
}

#[tokio::test]
async fn test_echo_prefixes_prompt() {
    let engine = Arc::new(ScriptedEngine::new(&["!"], Duration::ZERO));
    let worker = worker_with(engine, 1);

    let params = GenerateParams {
        echo: Some(true),
        ..greedy("Hi")
    };
    let unit = worker.generate(&params).await.unwrap();
    assert_eq!(unit.text, "Hi!");
}

#[tokio::test]
async fn test_engine_failure_is_terminal_and_releases_slot() {
    let engine = Arc::new(ScriptedEngine::five_tokens());
    let worker = worker_with(engine.clone(), 1);
    let prompt = format!("{} please", FAIL_MARKER);

    let result = worker.generate(&greedy(&prompt)).await;
    assert!(matches!(result, Err(LlmOpsError::Engine(_))));

    let request = worker.generate_stream(&greedy(&prompt)).await.unwrap();
    let units = collect_units(request).await;
    assert_eq!(units.len(), 2);
    assert!(!units[0].is_error());
    assert_eq!(units[1].error_code, ErrorCode::InternalError.as_i32());

    assert_eq!(engine.aborts().len(), 2);
    let stats = worker.slot_stats();
    assert_eq!(stats.load, 0);
    assert_eq!(stats.released, 2);
}

#[tokio::test]
async fn test_explicit_abort_ends_stream_without_error() {
    let engine = Arc::new(ScriptedEngine::new(
        &["a", "b", "c", "d", "e"],
        Duration::from_millis(20),
    ));
    let worker = worker_with(engine.clone(), 1);

    let mut request = worker.generate_stream(&greedy("go")).await.unwrap();
    let request_id = request.id().to_string();

    let first = request.next_unit().await.unwrap().unwrap();
    assert_eq!(first.text, "a");

    assert!(worker.abort(&request_id));
    assert!(request.next_unit().await.is_none());
    assert_eq!(request.state(), RequestState::Aborted);
    assert_eq!(engine.aborts(), vec![request_id.clone()]);
    assert_eq!(worker.slot_stats().load, 0);

    // Second abort is a no-op
    assert!(!worker.abort(&request_id));
    drop(request);
    assert_eq!(engine.aborts().len(), 1);
}

#[tokio::test]
async fn test_aborted_non_streaming_request_reports_cancelled() {
    let engine = Arc::new(ScriptedEngine::new(&["a", "b", "c"], Duration::from_millis(50)));
    let worker = worker_with(engine, 1);

    let request = worker.admit(&greedy("go")).await.unwrap();
    let request_id = request.id().to_string();
    let handle = tokio::spawn(request.run_to_completion());

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(worker.abort(&request_id));

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(LlmOpsError::Cancelled(_))));
}

#[tokio::test(start_paused = true)]
async fn test_deadline_cancels_with_timeout() {
    let engine = Arc::new(ScriptedEngine::new(&["slow", "er"], Duration::from_secs(10)));
    let worker = worker_with(engine.clone(), 1);

    let params = GenerateParams {
        timeout_secs: Some(1),
        ..greedy("wait")
    };
    let result = worker.generate(&params).await;

    assert!(matches!(result, Err(LlmOpsError::Timeout(_))));
    assert_eq!(engine.aborts().len(), 1);
    assert_eq!(worker.slot_stats().load, 0);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_fires_while_submission_pending() {
    let engine = Arc::new(ScriptedEngine::unresponsive());
    let worker = worker_with(engine.clone(), 1);

    let params = GenerateParams {
        timeout_secs: Some(1),
        ..greedy("never answered")
    };
    let result = worker.generate(&params).await;

    assert!(matches!(result, Err(LlmOpsError::Timeout(_))));
    let submissions = engine.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(engine.aborts(), vec![submissions[0].request_id.clone()]);
    assert_eq!(worker.slot_stats().load, 0);
    assert_eq!(worker.in_flight(), 0);
}

#[tokio::test]
async fn test_shutdown_and_abort_reach_pending_submissions() {
    let engine = Arc::new(ScriptedEngine::unresponsive());
    let worker = worker_with(engine.clone(), 2);

    let mut first = worker.generate_stream(&greedy("one")).await.unwrap();
    let first_id = first.id().to_string();
    let first = tokio::spawn(async move { first.next_unit().await });

    let mut second = worker.generate_stream(&greedy("two")).await.unwrap();
    let second_id = second.id().to_string();
    let second = tokio::spawn(async move { second.next_unit().await });

    while engine.submissions().len() < 2 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(worker.abort(&first_id));
    let first = tokio::time::timeout(Duration::from_secs(1), first)
        .await
        .unwrap()
        .unwrap();
    assert!(first.is_none());

    worker.shutdown();
    let second = tokio::time::timeout(Duration::from_secs(1), second)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        second.unwrap().unwrap_err().error_code(),
        ErrorCode::AbortedByServer
    );

    let mut aborts = engine.aborts();
    aborts.sort();
    let mut expected = vec![first_id, second_id];
    expected.sort();
    assert_eq!(aborts, expected);
    assert_eq!(worker.slot_stats().load, 0);
    assert_eq!(worker.in_flight(), 0);
}

#[tokio::test]
async fn test_oversized_timeout_rejected_before_admission() {
    let engine = Arc::new(ScriptedEngine::five_tokens());
    let worker = worker_with(engine.clone(), 1);

    let params = GenerateParams {
        timeout_secs: Some(u64::MAX),
        ..greedy("forever")
    };
    assert!(matches!(
        worker.generate(&params).await,
        Err(LlmOpsError::ParamOutOfRange(_))
    ));
    assert_eq!(worker.in_flight(), 0);
    assert_eq!(worker.slot_stats().acquired, 0);

    let params = GenerateParams {
        timeout_secs: Some(MAX_REQUEST_TIMEOUT_SECS),
        ..greedy("long but fine")
    };
    assert!(!worker.generate(&params).await.unwrap().is_error());
    assert_eq!(worker.in_flight(), 0);
}

#[tokio::test]
async fn test_validation_failures_take_no_slot() {
    let engine = Arc::new(ScriptedEngine::five_tokens());
    let worker = worker_with(engine.clone(), 1);

    let bad_temperature = GenerateParams {
        temperature: Some(-1.0),
        ..greedy("x")
    };
    assert!(matches!(
        worker.generate(&bad_temperature).await,
        Err(LlmOpsError::ParamOutOfRange(_))
    ));

    let empty = GenerateParams::default();
    assert!(matches!(
        worker.generate(&empty).await,
        Err(LlmOpsError::Validation(_))
    ));

    // Context length is 4096 tokens
    let too_long = GenerateParams {
        max_new_tokens: Some(4096),
        ..greedy("one two three")
    };
    let err = worker.generate(&too_long).await.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::ContextOverflow);

    assert_eq!(worker.slot_stats().acquired, 0);
    assert!(engine.submissions().is_empty());
}

#[tokio::test]
async fn test_shutdown_aborts_in_flight_and_rejects_waiters() {
    let engine = Arc::new(ScriptedEngine::new(
        &["a", "b", "c", "d"],
        Duration::from_millis(50),
    ));
    let worker = worker_with(engine.clone(), 1);

    let mut running = worker.generate_stream(&greedy("first")).await.unwrap();
    running.next_unit().await.unwrap().unwrap();

    let waiter = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.generate(&greedy("second")).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(worker.status().queue_length, 2);

    worker.shutdown();

    let last = running.next_unit().await.unwrap();
    let err = last.unwrap_err();
    assert_eq!(err.error_code(), ErrorCode::AbortedByServer);
    assert!(running.next_unit().await.is_none());

    assert!(matches!(waiter.await.unwrap(), Err(LlmOpsError::Shutdown)));
    assert!(matches!(
        worker.generate(&greedy("late")).await,
        Err(LlmOpsError::Shutdown)
    ));
    assert_eq!(engine.submissions().len(), 1);
}

#[tokio::test]
async fn test_slot_accounting_under_mixed_outcomes() {
    for capacity in [1usize, 3] {
        let engine = Arc::new(ScriptedEngine::new(
            &["a", "b", "c", "d"],
            Duration::from_millis(2),
        ));
        let worker = worker_with(engine.clone(), capacity);

        let tasks: Vec<_> = (0..12)
            .map(|i| {
                let worker = worker.clone();
                tokio::spawn(async move {
                    match i % 3 {
                        0 => {
                            let _ = worker.generate(&greedy("ok")).await;
                        }
                        1 => {
                            let prompt = format!("{} now", FAIL_MARKER);
                            let _ = worker.generate(&greedy(&prompt)).await;
                        }
                        _ => {
                            let mut frames = worker
                                .generate_stream(&greedy("leave"))
                                .await
                                .unwrap()
                                .into_frames();
                            frames.next().await;
                        }
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert!(engine.peak_running() <= capacity);
        let stats = worker.slot_stats();
        assert_eq!(stats.acquired, 12);
        assert_eq!(stats.released, 12);
        assert_eq!(stats.load, 0);
        assert_eq!(worker.in_flight(), 0);
    }
}
