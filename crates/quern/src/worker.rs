//! The worker loop: claim, execute, persist, repeat.
//!
//! One loop instance runs per worker. Loops hold no job state between
//! iterations; the store is the only source of truth, so any number of
//! loops (in this process or another) can run against the same database
//! file.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock;
use crate::config;
use crate::error::{StoreError, StoreResult};
use crate::exec::{ExecOutcome, Executor};
use crate::job::{Job, JobState, JobUpdate};
use crate::retry::{self, RetryDecision};
use crate::store::Store;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Pause after each executed job, so a stream of instantly-failing jobs
    /// cannot spin the loop.
    pub post_job_pause: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            post_job_pause: Duration::from_millis(200),
        }
    }
}

pub struct WorkerLoop {
    store: Arc<dyn Store>,
    executor: Executor,
    shutdown: CancellationToken,
    config: WorkerConfig,
    worker_id: String,
}

impl WorkerLoop {
    pub fn new(store: Arc<dyn Store>, shutdown: CancellationToken) -> Self {
        Self::with_config(store, shutdown, WorkerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn Store>,
        shutdown: CancellationToken,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            executor: Executor::default(),
            shutdown,
            config,
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until the shutdown token fires. Execution failures are absorbed
    /// into job outcomes; store failures terminate the loop and surface to
    /// the supervisor.
    pub async fn run(self) -> StoreResult<()> {
        info!(worker_id = %self.worker_id, "worker started");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let claimed = self.store.claim_one_pending(clock::now_ts()).await?;
            let Some(job_id) = claimed else {
                self.idle(self.config.poll_interval).await;
                continue;
            };
            let job = match self.store.get_job(&job_id).await {
                Ok(job) => job,
                // Claimed row vanished out from under us; nothing to run.
                Err(StoreError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            self.process(job).await?;
            self.idle(self.config.post_job_pause).await;
        }
        info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }

    async fn idle(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }

    async fn process(&self, job: Job) -> StoreResult<()> {
        info!(
            worker_id = %self.worker_id,
            job_id = %job.id,
            priority = job.priority,
            timeout = ?job.timeout,
            command = %job.command,
            "executing job"
        );
        match self.executor.run(&job.command, job.timeout).await {
            ExecOutcome::Success { stdout, stderr } => {
                info!(worker_id = %self.worker_id, job_id = %job.id, "job completed");
                // attempts counts failed executions, so a success persists
                // the pre-run count unchanged.
                self.store
                    .update_job_state(
                        &job.id,
                        &JobUpdate::new()
                            .state(JobState::Completed)
                            .attempts(job.attempts)
                            .last_stdout(Some(stdout))
                            .last_stderr(Some(stderr)),
                    )
                    .await
            }
            ExecOutcome::Failure {
                stdout,
                stderr,
                exit_code,
            } => {
                warn!(worker_id = %self.worker_id, job_id = %job.id, exit_code, "job failed");
                let message = if stderr.is_empty() { stdout } else { stderr };
                self.handle_retry(&job, message).await
            }
            ExecOutcome::Timeout { stdout, stderr } => {
                let secs = job.timeout.unwrap_or_default();
                warn!(worker_id = %self.worker_id, job_id = %job.id, timeout = secs, "job timed out");
                self.handle_retry(&job, format!("timeout after {secs}s"))
                    .await?;
                // Auxiliary update: keep whatever the pipes yielded before
                // the kill.
                let mut partial = JobUpdate::new();
                if let Some(out) = stdout {
                    partial = partial.last_stdout(Some(out));
                }
                if let Some(err) = stderr {
                    partial = partial.last_stderr(Some(err));
                }
                self.store.update_job_state(&job.id, &partial).await
            }
            ExecOutcome::SpawnError { message } => {
                warn!(worker_id = %self.worker_id, job_id = %job.id, error = %message, "job spawn failed");
                self.handle_retry(&job, message).await
            }
        }
    }

    async fn handle_retry(&self, job: &Job, message: String) -> StoreResult<()> {
        let base = config::backoff_base(self.store.as_ref()).await;
        match retry::decide(job.attempts, job.max_retries, base, clock::now_ts()) {
            RetryDecision::Retry {
                attempts,
                next_run_at,
            } => {
                info!(
                    worker_id = %self.worker_id,
                    job_id = %job.id,
                    attempts,
                    max_retries = job.max_retries,
                    next_run_at,
                    "retry scheduled"
                );
                self.store
                    .update_job_state(
                        &job.id,
                        &JobUpdate::new()
                            .state(JobState::Pending)
                            .attempts(attempts)
                            .next_run_at(next_run_at)
                            .last_error(Some(message.clone()))
                            .last_stderr(Some(message)),
                    )
                    .await
            }
            RetryDecision::Dead { attempts } => {
                warn!(
                    worker_id = %self.worker_id,
                    job_id = %job.id,
                    attempts,
                    "retries exhausted, job moved to dead letter queue"
                );
                self.store
                    .update_job_state(
                        &job.id,
                        &JobUpdate::new()
                            .state(JobState::Dead)
                            .attempts(attempts)
                            .last_error(Some(message.clone()))
                            .last_stderr(Some(message)),
                    )
                    .await
            }
        }
    }
}
