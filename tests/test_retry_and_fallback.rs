//! Retry, fallback promotion, timeouts and deadlines


use chrono::Utc;
use federation_router::error::FederationError;
use federation_router::protocol::{AttemptOutcome, ErrorCode, TaskRequest, TaskState};
use serde_json::json;
use std::time::Duration;
use test_helpers::*;

#[tokio::test(start_paused = true)]
async fn test_execution_error_promotes_first_fallback() {
    let (federation, link) = federation();
    for id in ["w1", "w2", "w3"] {
        federation.register_worker(worker(id, &["summarize"])).unwrap();
    }

    let task_id = federation
        .submit(TaskRequest::new("summarize", json!({})))
        .unwrap();
    federation.tick().await;
    assert_eq!(assigned_worker(&federation, task_id).as_deref(), Some("w1"));

    fail(&federation, "w1", task_id, "upstream rate limited").await;

    // Fallback dispatch happens without waiting for the next tick
    let status = federation.status(task_id).unwrap();
    assert_eq!(status.worker_id.as_deref(), Some("w2"));
    assert_eq!(status.state, TaskState::Running);
    assert_eq!(status.retry_count, 1);
    assert_eq!(status.decision.unwrap().fallbacks, vec!["w3"]);
    assert_eq!(link.assignment_order().await, vec!["w1", "w2"]);

    complete(&federation, "w2", task_id).await;
    let result = federation.wait_for_outcome(task_id).await.unwrap();
    assert_eq!(result.worker_id, "w2");
    assert_eq!(federation.metrics().snapshot().scheduler.fallbacks_used, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_carries_full_history() {
    let (federation, _link) = federation();
    for id in ["w1", "w2", "w3"] {
        federation.register_worker(worker(id, &["summarize"])).unwrap();
    }

    let task_id = federation
        .submit(TaskRequest::new("summarize", json!({})).with_max_retries(2))
        .unwrap();
    federation.tick().await;

    fail(&federation, "w1", task_id, "first failure").await;
    fail(&federation, "w2", task_id, "second failure").await;
    fail(&federation, "w3", task_id, "token=abc123 leaked").await;

    match federation.wait_for_outcome(task_id).await {
        Err(FederationError::RetriesExhausted {
            attempts,
            last_error,
            ..
        }) => {
            let workers: Vec<_> = attempts.iter().map(|a| a.worker_id.as_str()).collect();
            assert_eq!(workers, vec!["w1", "w2", "w3"]);
            assert!(attempts.iter().all(|a| matches!(
                a.outcome,
                AttemptOutcome::Failed {
                    code: ErrorCode::ExecutionError,
                    ..
                }
            )));
            assert!(!last_error.contains("abc123"));
        }
        other => panic!("Expected RetriesExhausted, got {other:?}"),
    }

    let status = federation.status(task_id).unwrap();
    assert_eq!(status.state, TaskState::FailedPermanent);
    assert_eq!(status.retry_count, 2);
    for id in ["w1", "w2", "w3"] {
        assert_eq!(federation.registry().get(id).unwrap().in_flight, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_refused_send_falls_back_without_learning() {
    let (federation, link) = federation();
    federation.register_worker(worker("w1", &["summarize"])).unwrap();
    federation.register_worker(worker("w2", &["summarize"])).unwrap();
    link.refuse("w1").await;

    let task_id = federation
        .submit(TaskRequest::new("summarize", json!({})))
        .unwrap();
    federation.tick().await;

    let status = federation.status(task_id).unwrap();
    assert_eq!(status.worker_id.as_deref(), Some("w2"));
    assert_eq!(status.state, TaskState::Running);
    assert!(matches!(
        status.attempts[0].outcome,
        AttemptOutcome::Failed {
            code: ErrorCode::WorkerUnavailable,
            ..
        }
    ));

    let w1 = federation.registry().get("w1").unwrap();
    assert_eq!(w1.in_flight, 0);
    assert_eq!(w1.consecutive_failures, 1);
    assert_eq!(w1.stats.samples, 0);
    assert!(federation.learning().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_requeue_waits_for_backoff() {
    let (federation, link) = federation();
    federation.register_worker(worker("solo", &["summarize"])).unwrap();

    let task_id = federation
        .submit(TaskRequest::new("summarize", json!({})))
        .unwrap();
    federation.tick().await;
    fail(&federation, "solo", task_id, "transient").await;

    let status = federation.status(task_id).unwrap();
    assert_eq!(status.state, TaskState::Pending);
    assert_eq!(status.retry_count, 1);

    // Base backoff is 100ms in the test configuration
    federation.tick().await;
    assert_eq!(link.assignments().await.len(), 1);

    tokio::time::advance(Duration::from_millis(100)).await;
    federation.tick().await;
    assert_eq!(link.assignments().await.len(), 2);
    assert_eq!(federation.state(task_id).unwrap(), TaskState::Running);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_cancels_and_moves_to_fallback() {
    let (federation, link) = federation();
    federation.register_worker(worker("w1", &["summarize"])).unwrap();
    federation.register_worker(worker("w2", &["summarize"])).unwrap();

    let task_id = federation
        .submit(TaskRequest::new("summarize", json!({})))
        .unwrap();
    federation.tick().await;

    // Task timeout is 10s in the test configuration
    tokio::time::advance(Duration::from_secs(11)).await;
    federation.tick().await;

    let status = federation.status(task_id).unwrap();
    assert_eq!(status.worker_id.as_deref(), Some("w2"));
    assert!(matches!(
        status.attempts[0].outcome,
        AttemptOutcome::Failed {
            code: ErrorCode::Timeout,
            ..
        }
    ));

    settle().await;
    let cancels = link.cancels().await;
    assert_eq!(cancels.len(), 1);
    assert_eq!(cancels[0].worker_id, "w1");
    assert_eq!(cancels[0].task_id, task_id);
    assert_eq!(cancels[0].reason, "timeout");

    // A late result from the timed-out worker is ignored
    complete(&federation, "w1", task_id).await;
    assert_eq!(federation.state(task_id).unwrap(), TaskState::Running);
    assert_eq!(federation.metrics().snapshot().scheduler.timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_bounds_attempt_timeout() {
    let (federation, _link) = federation();
    federation.register_worker(worker("w1", &["summarize"])).unwrap();
    federation.register_worker(worker("w2", &["summarize"])).unwrap();

    let deadline = Utc::now() + chrono::Duration::seconds(2);
    let task_id = federation
        .submit(TaskRequest::new("summarize", json!({})).with_deadline(deadline))
        .unwrap();
    federation.tick().await;

    tokio::time::advance(Duration::from_secs(3)).await;
    federation.tick().await;

    assert!(matches!(
        federation.wait_for_outcome(task_id).await,
        Err(FederationError::DeadlineExceeded { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_pending_task_past_deadline_fails() {
    let (federation, link) = federation();
    federation.register_worker(worker("w1", &["summarize"])).unwrap();
    federation.pause_worker("w1");

    let deadline = Utc::now() + chrono::Duration::seconds(2);
    let task_id = federation
        .submit(TaskRequest::new("summarize", json!({})).with_deadline(deadline))
        .unwrap();
    federation.tick().await;
    assert_eq!(federation.state(task_id).unwrap(), TaskState::Pending);

    tokio::time::advance(Duration::from_secs(3)).await;
    federation.tick().await;

    match federation.wait_for_outcome(task_id).await {
        Err(FederationError::DeadlineExceeded { attempts, .. }) => assert!(attempts.is_empty()),
        other => panic!("Expected DeadlineExceeded, got {other:?}"),
    }
    assert!(link.assignments().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unschedulable_pool_exhausts_retries() {
    let (federation, _link) = federation();
    federation.register_worker(worker("w1", &["summarize"])).unwrap();
    federation.pause_worker("w1");

    let task_id = federation
        .submit(TaskRequest::new("summarize", json!({})).with_max_retries(1))
        .unwrap();
    federation.tick().await;
    assert_eq!(federation.status(task_id).unwrap().retry_count, 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    federation.tick().await;

    match federation.wait_for_outcome(task_id).await {
        Err(FederationError::RetriesExhausted { last_error, .. }) => {
            assert!(last_error.contains("No schedulable worker"));
        }
        other => panic!("Expected RetriesExhausted, got {other:?}"),
    }
}
