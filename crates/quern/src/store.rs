//! The `Store` trait: sole arbiter of persistent state.
//!
//! Implementations own all persistence and the cross-worker claim
//! serialization; everything above this seam (worker loop, dashboard, CLI)
//! talks to `Arc<dyn Store>` and never caches job state across the claim
//! boundary.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::job::{Job, JobEvent, JobState, JobUpdate};

/// State-name → count mapping plus a `total` entry, as served by
/// `/api/status` and the CLI `status` command.
pub type StatsSummary = BTreeMap<String, i64>;

#[async_trait]
pub trait Store: Send + Sync {
    /// Ensure schema and default config keys exist. Idempotent.
    async fn init(&self) -> StoreResult<()>;

    /// Insert a new job. Fails with [`StoreError::DuplicateId`] when the id
    /// is taken; the existing record is left untouched. Empty timestamps are
    /// stamped with the current time.
    ///
    /// [`StoreError::DuplicateId`]: crate::error::StoreError::DuplicateId
    async fn save_job(&self, job: &Job) -> StoreResult<()>;

    /// All jobs, optionally filtered by state, ordered by
    /// `priority DESC, created_at ASC`.
    async fn list_jobs(&self, state: Option<JobState>) -> StoreResult<Vec<Job>>;

    /// One page of jobs plus the total matching count. `page` is 1-based;
    /// both arguments are clamped to at least 1.
    async fn list_jobs_paginated(
        &self,
        state: Option<JobState>,
        page: i64,
        per_page: i64,
    ) -> StoreResult<(Vec<Job>, i64)>;

    /// Single record by id, or [`StoreError::NotFound`].
    ///
    /// [`StoreError::NotFound`]: crate::error::StoreError::NotFound
    async fn get_job(&self, id: &str) -> StoreResult<Job>;

    async fn get_config(&self, key: &str) -> StoreResult<Option<String>>;

    /// Upsert a config key.
    async fn set_config(&self, key: &str, value: &str) -> StoreResult<()>;

    async fn stats_summary(&self) -> StoreResult<StatsSummary>;

    /// Most recent `limit` events for a job, newest first.
    async fn get_job_events(&self, job_id: &str, limit: i64) -> StoreResult<Vec<JobEvent>>;

    /// Apply the supplied fields, bump `updated_at`, and append a matching
    /// [`JobEvent`] in the same transaction. The event insert is best-effort:
    /// its failure is logged and never poisons the primary update.
    async fn update_job_state(&self, id: &str, update: &JobUpdate) -> StoreResult<()>;

    /// Atomically claim the single best eligible pending job (highest
    /// priority, then earliest created, with `next_run_at <= now_ts`),
    /// moving it to `processing` and recording a `claimed` event.
    ///
    /// Returns `None` when nothing is eligible or another worker won the
    /// race. Implementations must guarantee that a given `pending →
    /// processing` transition is observed by exactly one caller, and that any
    /// mid-protocol failure leaves the job `pending`.
    async fn claim_one_pending(&self, now_ts: i64) -> StoreResult<Option<String>>;
}
