//! # Quern
//!
//! Core engine of a persistent background job queue: clients submit shell
//! commands with retry, priority, scheduled-run and timeout attributes; a
//! pool of workers claims and executes them concurrently, retrying failures
//! with exponential backoff and parking unrecoverable jobs in a dead-letter
//! queue.
//!
//! ## Architecture
//!
//! ```text
//! Supervisor
//!     │ spawns N
//!     ▼
//! WorkerLoop ──► Store.claim_one_pending()   (atomic, cross-worker safe)
//!     │
//!     ▼
//! Executor.run(command, timeout)             (subshell, output capture)
//!     │
//!     ▼
//! retry::decide(attempts, max_retries, ...)  (pure)
//!     │
//!     ▼
//! Store.update_job_state(...)                (update + JobEvent, atomic)
//! ```
//!
//! The store, a single database file, is the only shared state. Workers
//! never exchange job state in memory, so the same loops can run as tasks in
//! one process or be spread across several processes pointed at the same
//! file.
//!
//! ## Key Invariants
//!
//! 1. **One claim, one worker**: a `pending → processing` transition is
//!    observed by exactly one claimer.
//! 2. **Failures are counted, successes are not**: `attempts` tracks failed
//!    executions; `attempts <= max_retries + 1` in every terminal state.
//! 3. **Every state change leaves a trail**: each update commits with a
//!    matching [`JobEvent`] (best-effort: a lost event never blocks the
//!    update).
//! 4. **Shutdown is sticky and cooperative**: the token is observed at
//!    polling ticks; in-flight jobs finish unless the grace period lapses.
//!
//! Store implementations live in their own crates (see
//! `quern-store-sqlite`); this crate defines the [`Store`] trait they
//! implement.

mod clock;
mod error;
mod exec;
mod job;
mod retry;
mod store;
mod supervisor;
mod worker;

// Config keys and typed accessors
pub mod config;

// Re-export the job model
pub use crate::job::{Job, JobEvent, JobState, JobSubmission, JobUpdate, UnknownState};

// Re-export error types
pub use crate::error::{StoreError, StoreResult};

// Re-export the store seam
pub use crate::store::{StatsSummary, Store};

// Re-export the execution envelope
pub use crate::exec::{ExecOutcome, Executor};

// Re-export the retry policy
pub use crate::retry::{decide as retry_decide, RetryDecision};

// Re-export worker machinery
pub use crate::supervisor::{wait_for_signal, Supervisor};
pub use crate::worker::{WorkerConfig, WorkerLoop};

// Re-export clock helpers used by every layer
pub use crate::clock::{now_iso, now_ts, parse_run_at, to_iso, TimeParseError};

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
