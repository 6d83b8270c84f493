
use std::sync::Arc;

use queuectl::config::{BACKOFF_BASE_KEY, MAX_RETRIES_KEY};
use queuectl::queue::{JobQueue, JobSpec, JobState, StateFilter};
use queuectl::QueueError;
use test_harness::TestQueue;

#[tokio::test]
async fn test_enqueue_defaults() {
    let queue = JobQueue::in_memory();

    let job = queue.enqueue(JobSpec::new("echo hi")).await.unwrap();

    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_retries, 3);
    assert_eq!(job.command, "echo hi");
    assert!(!job.id.is_empty());

    let listed = queue.list_jobs(StateFilter::All).await.unwrap();
    assert_eq!(listed, vec![job]);
}

#[tokio::test]
async fn test_enqueue_keeps_given_id_and_retries() {
    let queue = JobQueue::in_memory();

    let job = queue
        .enqueue(JobSpec::new("sleep 2").with_id("job1").with_max_retries(5))
        .await
        .unwrap();

    assert_eq!(job.id, "job1");
    assert_eq!(job.max_retries, 5);
}

#[tokio::test]
async fn test_enqueue_rejects_missing_command() {
    let queue = JobQueue::in_memory();

    let result = queue.enqueue(JobSpec::default()).await;

    assert!(matches!(result, Err(QueueError::InvalidSpec(_))));
    assert!(queue.list_jobs(StateFilter::All).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_enqueue_rejects_duplicate_id() {
    let queue = JobQueue::in_memory();
    queue
        .enqueue(JobSpec::new("true").with_id("dup"))
        .await
        .unwrap();

    let result = queue.enqueue(JobSpec::new("false").with_id("dup")).await;

    assert!(matches!(result, Err(QueueError::DuplicateJob(id)) if id == "dup"));
    let jobs = queue.list_jobs(StateFilter::All).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].command, "true");
}

#[tokio::test]
async fn test_enqueue_rejects_id_held_by_dlq() {
    let queue = JobQueue::in_memory();
    queue
        .enqueue(JobSpec::new("false").with_id("dead1"))
        .await
        .unwrap();
    queue.move_to_dlq("dead1").await.unwrap();

    let result = queue.enqueue(JobSpec::new("true").with_id("dead1")).await;

    assert!(matches!(result, Err(QueueError::DuplicateJob(_))));
}

#[tokio::test]
async fn test_next_pending_is_insertion_order() {
    let queue = JobQueue::in_memory();
    for id in ["a", "b", "c"] {
        queue.enqueue(JobSpec::new("true").with_id(id)).await.unwrap();
    }

    assert_eq!(queue.next_pending().await.unwrap().unwrap().id, "a");

    queue
        .transition_state("a", JobState::Processing, None)
        .await
        .unwrap();
    assert_eq!(queue.next_pending().await.unwrap().unwrap().id, "b");

    // next_pending does not claim
    assert_eq!(queue.next_pending().await.unwrap().unwrap().id, "b");
}

#[tokio::test]
async fn test_next_pending_empty_queue() {
    let queue = JobQueue::in_memory();
    assert!(queue.next_pending().await.unwrap().is_none());
}

#[tokio::test]
async fn test_transition_state_updates_job() {
    let queue = JobQueue::in_memory();
    let created = queue
        .enqueue(JobSpec::new("false").with_id("j1"))
        .await
        .unwrap();

    let failed = queue
        .transition_state("j1", JobState::Failed, Some("boom".to_string()))
        .await
        .unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("boom"));
    assert!(failed.updated_at >= created.updated_at);

    // No message given: the previous one is kept
    let pending = queue
        .transition_state("j1", JobState::Pending, None)
        .await
        .unwrap();
    assert_eq!(pending.error_message.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_transition_state_unknown_job() {
    let queue = JobQueue::in_memory();

    let result = queue
        .transition_state("missing", JobState::Completed, None)
        .await;

    assert!(matches!(result, Err(QueueError::NotFound(id)) if id == "missing"));
}

#[tokio::test]
async fn test_transition_to_dead_is_rejected() {
    let queue = JobQueue::in_memory();
    queue.enqueue(JobSpec::new("true").with_id("j1")).await.unwrap();

    let result = queue.transition_state("j1", JobState::Dead, None).await;

    assert!(matches!(result, Err(QueueError::InvalidSpec(_))));
    assert_eq!(queue.get_job("j1").await.unwrap().state, JobState::Pending);
}

#[tokio::test]
async fn test_increment_attempts() {
    let queue = JobQueue::in_memory();
    queue.enqueue(JobSpec::new("false").with_id("j1")).await.unwrap();

    assert_eq!(queue.increment_attempts("j1").await.unwrap(), 1);
    assert_eq!(queue.increment_attempts("j1").await.unwrap(), 2);
    assert_eq!(queue.get_job("j1").await.unwrap().attempts, 2);

    assert!(matches!(
        queue.increment_attempts("nope").await,
        Err(QueueError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_dlq_round_trip() {
    let queue = JobQueue::in_memory();
    queue.enqueue(JobSpec::new("false").with_id("j1")).await.unwrap();
    queue.increment_attempts("j1").await.unwrap();
    queue
        .transition_state("j1", JobState::Failed, Some("exit 1".to_string()))
        .await
        .unwrap();

    let dead = queue.move_to_dlq("j1").await.unwrap();
    assert_eq!(dead.state, JobState::Dead);
    assert_eq!(dead.attempts, 1);
    assert_eq!(dead.error_message.as_deref(), Some("exit 1"));
    assert!(queue.list_jobs(StateFilter::All).await.unwrap().is_empty());
    assert_eq!(queue.list_dlq().await.unwrap().len(), 1);

    let revived = queue.retry_from_dlq("j1").await.unwrap();
    assert_eq!(revived.state, JobState::Pending);
    assert_eq!(revived.attempts, 0);
    assert!(revived.error_message.is_none());
    assert!(queue.list_dlq().await.unwrap().is_empty());
    assert_eq!(queue.next_pending().await.unwrap().unwrap().id, "j1");
}

#[tokio::test]
async fn test_move_to_dlq_unknown_job() {
    let queue = JobQueue::in_memory();
    assert!(matches!(
        queue.move_to_dlq("ghost").await,
        Err(QueueError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_retry_from_dlq_unknown_leaves_sets_unchanged() {
    let queue = JobQueue::in_memory();
    queue.enqueue(JobSpec::new("true").with_id("live")).await.unwrap();
    queue.enqueue(JobSpec::new("false").with_id("dead")).await.unwrap();
    queue.move_to_dlq("dead").await.unwrap();

    let jobs_before = queue.list_jobs(StateFilter::All).await.unwrap();
    let dlq_before = queue.list_dlq().await.unwrap();

    // "live" is in the main set, not the DLQ
    for id in ["nope", "live"] {
        let result = queue.retry_from_dlq(id).await;
        assert!(matches!(result, Err(QueueError::NotFound(_))));
    }

    assert_eq!(queue.list_jobs(StateFilter::All).await.unwrap(), jobs_before);
    assert_eq!(queue.list_dlq().await.unwrap(), dlq_before);
}

#[tokio::test]
async fn test_list_jobs_filters_by_state() {
    let queue = JobQueue::in_memory();
    for id in ["a", "b", "c"] {
        queue.enqueue(JobSpec::new("true").with_id(id)).await.unwrap();
    }
    queue
        .transition_state("b", JobState::Completed, None)
        .await
        .unwrap();

    let completed = queue
        .list_jobs(StateFilter::Only(JobState::Completed))
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, "b");

    let pending = queue.list_jobs(JobState::Pending.into()).await.unwrap();
    let ids: Vec<_> = pending.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "c"]);

    assert_eq!(queue.list_jobs(StateFilter::All).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_get_job_searches_dlq() {
    let queue = JobQueue::in_memory();
    queue.enqueue(JobSpec::new("false").with_id("j1")).await.unwrap();
    queue.move_to_dlq("j1").await.unwrap();

    let job = queue.get_job("j1").await.unwrap();
    assert_eq!(job.state, JobState::Dead);

    assert!(matches!(
        queue.get_job("j2").await,
        Err(QueueError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_config_defaults_and_updates() {
    let queue = JobQueue::in_memory();

    let config = queue.get_config().await.unwrap();
    assert_eq!(config.get(MAX_RETRIES_KEY), Some("3"));
    assert_eq!(config.get(BACKOFF_BASE_KEY), Some("2"));

    queue.set_config(MAX_RETRIES_KEY, "5").await.unwrap();
    queue.set_config("custom-key", "anything").await.unwrap();

    let config = queue.get_config().await.unwrap();
    assert_eq!(config.max_retries(), 5);
    assert_eq!(config.get("custom-key"), Some("anything"));
    assert_eq!(config.get(BACKOFF_BASE_KEY), Some("2"));
}

#[tokio::test]
async fn test_status_counts() {
    let queue = JobQueue::in_memory();
    for id in ["p1", "p2", "run", "done", "bad", "gone"] {
        queue.enqueue(JobSpec::new("true").with_id(id)).await.unwrap();
    }
    queue
        .transition_state("run", JobState::Processing, None)
        .await
        .unwrap();
    queue
        .transition_state("done", JobState::Completed, None)
        .await
        .unwrap();
    queue
        .transition_state("bad", JobState::Failed, Some("x".to_string()))
        .await
        .unwrap();
    queue.move_to_dlq("gone").await.unwrap();
    queue.set_config(BACKOFF_BASE_KEY, "3").await.unwrap();

    let status = queue.status(4).await.unwrap();

    assert_eq!(status.pending, 2);
    assert_eq!(status.processing, 1);
    assert_eq!(status.completed, 1);
    assert_eq!(status.failed, 1);
    assert_eq!(status.dead, 1);
    assert_eq!(status.max_retries, "3");
    assert_eq!(status.backoff_base, "3");
    assert_eq!(status.active_workers, 4);
}

#[tokio::test]
async fn test_file_queue_persists_across_handles() {
    let fixture = TestQueue::new();
    fixture
        .queue
        .enqueue(JobSpec::new("echo persisted").with_id("keep"))
        .await
        .unwrap();
    fixture.queue.set_config(MAX_RETRIES_KEY, "7").await.unwrap();

    let other = fixture.reopen();
    let job = other.get_job("keep").await.unwrap();
    assert_eq!(job.command, "echo persisted");
    assert_eq!(other.get_config().await.unwrap().max_retries(), 7);

    // Writes through the second handle are visible to the first
    other.move_to_dlq("keep").await.unwrap();
    assert_eq!(fixture.queue.list_dlq().await.unwrap().len(), 1);
    assert!(fixture.data.snapshot_path().exists());
}

#[tokio::test]
async fn test_concurrent_enqueues_are_not_lost() {
    let fixture = TestQueue::new();
    let handles: Vec<Arc<JobQueue>> = (0..4).map(|_| fixture.reopen()).collect();

    let mut tasks = Vec::new();
    for (h, queue) in handles.into_iter().enumerate() {
        tasks.push(tokio::spawn(async move {
            for i in 0..10 {
                queue
                    .enqueue(JobSpec::new("true").with_id(format!("h{h}-j{i}")))
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let jobs = fixture.queue.list_jobs(StateFilter::All).await.unwrap();
    assert_eq!(jobs.len(), 40);
}
