//! End-to-end flows: real workers, real subprocesses, one SQLite file as the
//! only coordination point.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use quern_core::{
    config, Job, JobState, JobUpdate, Store, StoreError, WorkerConfig, WorkerLoop,
};
use quern_store_sqlite::SqliteStore;

async fn open_store(dir: &TempDir) -> Arc<SqliteStore> {
    let store = SqliteStore::open(dir.path().join("queue.db"))
        .await
        .expect("open store");
    store.init().await.expect("init");
    Arc::new(store)
}

fn fast_worker(store: Arc<SqliteStore>, shutdown: CancellationToken) -> WorkerLoop {
    WorkerLoop::with_config(
        store,
        shutdown,
        WorkerConfig {
            poll_interval: Duration::from_millis(50),
            post_job_pause: Duration::from_millis(10),
        },
    )
}

async fn wait_for_state(store: &dyn Store, id: &str, state: JobState, deadline: Duration) -> Job {
    let started = Instant::now();
    loop {
        match store.get_job(id).await {
            Ok(job) if job.state == state => return job,
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(err) => panic!("store failed while waiting: {err}"),
        }
        assert!(
            started.elapsed() < deadline,
            "job {id} did not reach {state} within {deadline:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn event_types(events: &[quern_core::JobEvent]) -> Vec<&str> {
    events.iter().map(|e| e.event_type.as_str()).collect()
}

#[tokio::test]
async fn happy_path_completes_without_counting_attempts() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    store.save_job(&Job::new("j1", "echo hi")).await.unwrap();

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(fast_worker(store.clone(), shutdown.clone()).run());

    let job = wait_for_state(store.as_ref(), "j1", JobState::Completed, Duration::from_secs(5)).await;
    shutdown.cancel();
    worker.await.unwrap().unwrap();

    assert_eq!(job.last_stdout.as_deref(), Some("hi"));
    assert_eq!(job.last_stderr.as_deref(), Some(""));
    assert_eq!(job.attempts, 0);

    let events = store.get_job_events("j1", 100).await.unwrap();
    let types = event_types(&events);
    assert!(types.contains(&"claimed"));
    assert!(types.contains(&"state:completed"));
}

#[tokio::test]
async fn failing_job_retries_with_backoff_then_succeeds() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    store
        .set_config(config::BACKOFF_BASE_KEY, "1")
        .await
        .unwrap();

    let flag = dir.path().join("flag");
    let mut job = Job::new(
        "j2",
        format!(
            "test ! -f {flag} && (touch {flag}; exit 1) || echo ok",
            flag = flag.display()
        ),
    );
    job.max_retries = 2;
    store.save_job(&job).await.unwrap();

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(fast_worker(store.clone(), shutdown.clone()).run());

    let job = wait_for_state(
        store.as_ref(),
        "j2",
        JobState::Completed,
        Duration::from_secs(10),
    )
    .await;
    shutdown.cancel();
    worker.await.unwrap().unwrap();

    // One failed execution, then success; success itself is not counted.
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_stdout.as_deref(), Some("ok"));

    let events = store.get_job_events("j2", 100).await.unwrap();
    let types = event_types(&events);
    assert!(types.contains(&"state:pending"));
    assert!(types.contains(&"state:completed"));
}

#[tokio::test]
async fn exhausted_job_goes_dead_and_runs_again_after_requeue() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    store
        .set_config(config::BACKOFF_BASE_KEY, "1")
        .await
        .unwrap();

    // Fails until the third execution, but max_retries = 1 kills it after
    // two; a DLQ requeue grants a fresh run that succeeds.
    let counter = dir.path().join("count");
    let mut job = Job::new(
        "j3",
        format!(
            "echo x >> {c}; test $(wc -l < {c}) -gt 2 && echo ok || exit 1",
            c = counter.display()
        ),
    );
    job.max_retries = 1;
    store.save_job(&job).await.unwrap();

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(fast_worker(store.clone(), shutdown.clone()).run());

    let dead = wait_for_state(store.as_ref(), "j3", JobState::Dead, Duration::from_secs(10)).await;
    assert_eq!(dead.attempts, dead.max_retries + 1);
    assert!(dead.last_error.is_some());

    store
        .update_job_state("j3", &JobUpdate::requeue())
        .await
        .unwrap();

    let job = wait_for_state(
        store.as_ref(),
        "j3",
        JobState::Completed,
        Duration::from_secs(10),
    )
    .await;
    shutdown.cancel();
    worker.await.unwrap().unwrap();

    assert_eq!(job.attempts, 0);
    assert_eq!(job.last_stdout.as_deref(), Some("ok"));

    let events = store.get_job_events("j3", 100).await.unwrap();
    let types = event_types(&events);
    assert!(types.contains(&"state:dead"));
    assert!(types.contains(&"state:pending"));
    assert!(types.contains(&"state:completed"));
}

#[tokio::test]
async fn timed_out_job_is_killed_and_dead_lettered() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let mut job = Job::new("j4", "sleep 30");
    job.timeout = Some(1);
    job.max_retries = 0;
    store.save_job(&job).await.unwrap();

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(fast_worker(store.clone(), shutdown.clone()).run());

    let job = wait_for_state(store.as_ref(), "j4", JobState::Dead, Duration::from_secs(10)).await;
    shutdown.cancel();
    worker.await.unwrap().unwrap();

    assert_eq!(job.attempts, 1);
    let last_error = job.last_error.expect("timeout recorded");
    assert!(
        last_error.starts_with("timeout after 1s"),
        "unexpected last_error: {last_error}"
    );
}

#[tokio::test]
async fn higher_priority_job_is_claimed_first() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let mut low = Job::new("low", "echo L");
    low.created_at = "2026-01-01T00:00:00Z".to_string();
    store.save_job(&low).await.unwrap();
    let mut hi = Job::new("hi", "echo H");
    hi.priority = 5;
    hi.created_at = "2026-01-01T00:00:01Z".to_string();
    store.save_job(&hi).await.unwrap();

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn(fast_worker(store.clone(), shutdown.clone()).run());

    wait_for_state(store.as_ref(), "low", JobState::Completed, Duration::from_secs(5)).await;
    wait_for_state(store.as_ref(), "hi", JobState::Completed, Duration::from_secs(5)).await;
    shutdown.cancel();
    worker.await.unwrap().unwrap();

    // Claim events share a global sequence: the high-priority job must have
    // been claimed before the older low-priority one.
    let claimed_seq = |events: &[quern_core::JobEvent]| {
        events
            .iter()
            .find(|e| e.event_type == "claimed")
            .expect("claimed event")
            .seq
    };
    let hi_events = store.get_job_events("hi", 100).await.unwrap();
    let low_events = store.get_job_events("low", 100).await.unwrap();
    assert!(claimed_seq(&hi_events) < claimed_seq(&low_events));
}

#[tokio::test]
async fn concurrent_workers_execute_every_job_exactly_once() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let total: i64 = 100;
    for i in 0..total {
        let mut job = Job::new(format!("job-{i}"), "true");
        job.priority = fastrand::i64(0..4);
        store.save_job(&job).await.unwrap();
    }

    // Eight workers, each with its own pool on the same file, exactly as
    // separate worker processes would share it.
    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let worker_store = SqliteStore::open(dir.path().join("queue.db"))
            .await
            .unwrap();
        handles.push(tokio::spawn(
            fast_worker(Arc::new(worker_store), shutdown.clone()).run(),
        ));
    }

    let started = Instant::now();
    loop {
        let summary = store.stats_summary().await.unwrap();
        if summary.get("completed").copied().unwrap_or(0) == total {
            break;
        }
        assert!(
            started.elapsed() < Duration::from_secs(60),
            "queue not drained: {summary:?}"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    shutdown.cancel();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    for i in 0..total {
        let id = format!("job-{i}");
        let events = store.get_job_events(&id, 1000).await.unwrap();
        let claims = events.iter().filter(|e| e.event_type == "claimed").count();
        assert_eq!(claims, 1, "job {id} claimed {claims} times");
        assert_eq!(store.get_job(&id).await.unwrap().state, JobState::Completed);
    }
}

#[tokio::test]
async fn claims_are_mutually_exclusive_across_tasks() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let total: usize = 40;
    for i in 0..total {
        store
            .save_job(&Job::new(format!("c{i}"), "true"))
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let claim_store = store.clone();
        tasks.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                match claim_store.claim_one_pending(quern_core::now_ts()).await {
                    Ok(Some(id)) => claimed.push(id),
                    Ok(None) => break claimed,
                    Err(err) => panic!("claim failed: {err}"),
                }
            }
        }));
    }

    let mut all = Vec::new();
    for task in tasks {
        all.extend(task.await.unwrap());
    }
    all.sort();
    let before_dedup = all.len();
    all.dedup();
    assert_eq!(before_dedup, all.len(), "a job was claimed twice");
    assert_eq!(all.len(), total, "some jobs were never claimed");
}
