//! Job data model: the `jobs` row, its lifecycle states, the append-only
//! event record, and the partial-update descriptor used by
//! [`Store::update_job_state`](crate::store::Store::update_job_state).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::clock;

/// Lifecycle state of a job.
///
/// The engine only ever writes `pending`, `processing`, `completed` and
/// `dead`. `Failed` is reserved for a future terminal-but-not-dead-lettered
/// state and must never be persisted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

/// Error returned when parsing an unrecognised state string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown job state `{0}`")]
pub struct UnknownState(pub String);

/// One unit of work: a shell command plus its scheduling and retry
/// attributes.
///
/// `attempts` counts **failed** executions, not total executions: a job that
/// succeeds on its first run completes with `attempts = 0`. Field order here
/// is the wire order of the dashboard snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: i64,
    pub max_retries: i64,
    pub priority: i64,
    pub timeout: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
    pub next_run_at: i64,
    pub last_error: Option<String>,
    pub last_stdout: Option<String>,
    pub last_stderr: Option<String>,
}

impl Job {
    /// Build a new pending job with default attributes. Timestamps are left
    /// empty; the store stamps them at insert time.
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries: crate::config::DEFAULT_MAX_RETRIES,
            priority: 0,
            timeout: None,
            created_at: String::new(),
            updated_at: String::new(),
            next_run_at: 0,
            last_error: None,
            last_stdout: None,
            last_stderr: None,
        }
    }
}

/// Append-only audit record. `seq` is assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub seq: i64,
    pub job_id: String,
    pub event_type: String,
    pub message: Option<String>,
    pub created_at: String,
}

/// Partial update applied by `update_job_state`. Unset fields are left
/// untouched; `updated_at` is always bumped by the store.
///
/// The nullable text columns are tri-state: calling the setter with `Some`
/// writes the value, calling it with `None` writes SQL NULL, and not calling
/// it leaves the column alone. DLQ requeue relies on the NULL case to clear
/// stale error output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub state: Option<JobState>,
    pub attempts: Option<i64>,
    pub next_run_at: Option<i64>,
    pub timeout: Option<i64>,
    pub priority: Option<i64>,
    pub last_error: Option<Option<String>>,
    pub last_stdout: Option<Option<String>>,
    pub last_stderr: Option<Option<String>>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn attempts(mut self, attempts: i64) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn next_run_at(mut self, ts: i64) -> Self {
        self.next_run_at = Some(ts);
        self
    }

    pub fn timeout(mut self, secs: i64) -> Self {
        self.timeout = Some(secs);
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn last_error(mut self, value: Option<String>) -> Self {
        self.last_error = Some(value);
        self
    }

    pub fn last_stdout(mut self, value: Option<String>) -> Self {
        self.last_stdout = Some(value);
        self
    }

    pub fn last_stderr(mut self, value: Option<String>) -> Self {
        self.last_stderr = Some(value);
        self
    }

    /// The update applied when a dead job is sent back to the queue: pending,
    /// zero attempts, immediately eligible, error and output cleared.
    pub fn requeue() -> Self {
        Self::new()
            .state(JobState::Pending)
            .attempts(0)
            .next_run_at(0)
            .last_error(None)
            .last_stdout(None)
            .last_stderr(None)
    }

    /// Event type recorded alongside this update.
    pub fn event_type(&self) -> String {
        match self.state {
            Some(state) => format!("state:{state}"),
            None => "updated".to_string(),
        }
    }

    /// Event message recorded alongside this update: the supplied
    /// `last_error`, else the supplied `last_stderr`.
    pub fn event_message(&self) -> Option<String> {
        self.last_error
            .clone()
            .flatten()
            .or_else(|| self.last_stderr.clone().flatten())
    }
}

/// Fields accepted from a JSON job submission, before config defaults are
/// applied. `run_at` is an ISO-8601 string; `next_run_at` wins if both are
/// given.
#[derive(Debug, Clone, Deserialize)]
pub struct JobSubmission {
    pub id: String,
    pub command: String,
    pub max_retries: Option<i64>,
    pub priority: Option<i64>,
    pub timeout: Option<i64>,
    pub run_at: Option<String>,
    pub next_run_at: Option<i64>,
}

impl JobSubmission {
    /// Resolve into a [`Job`], filling `max_retries` from the supplied
    /// default and converting `run_at` to epoch seconds.
    pub fn into_job(self, default_max_retries: i64) -> Result<Job, crate::clock::TimeParseError> {
        let next_run_at = match (self.next_run_at, self.run_at.as_deref()) {
            (Some(ts), _) => ts,
            (None, Some(run_at)) => clock::parse_run_at(run_at)?,
            (None, None) => 0,
        };
        let mut job = Job::new(self.id, self.command);
        job.max_retries = self.max_retries.unwrap_or(default_max_retries);
        job.priority = self.priority.unwrap_or(0);
        job.timeout = self.timeout;
        job.next_run_at = next_run_at;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_strings() {
        for state in [
            JobState::Pending,
            JobState::Processing,
            JobState::Completed,
            JobState::Failed,
            JobState::Dead,
        ] {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("zombie".parse::<JobState>().is_err());
    }

    #[test]
    fn update_event_type_tracks_state_field() {
        assert_eq!(JobUpdate::new().event_type(), "updated");
        assert_eq!(
            JobUpdate::new().state(JobState::Dead).event_type(),
            "state:dead"
        );
    }

    #[test]
    fn update_event_message_prefers_last_error() {
        let update = JobUpdate::new()
            .last_error(Some("boom".into()))
            .last_stderr(Some("noise".into()));
        assert_eq!(update.event_message().as_deref(), Some("boom"));

        let update = JobUpdate::new().last_stderr(Some("noise".into()));
        assert_eq!(update.event_message().as_deref(), Some("noise"));

        // Clearing a column does not produce an event message.
        let update = JobUpdate::requeue();
        assert_eq!(update.event_message(), None);
    }

    #[test]
    fn requeue_clears_error_columns() {
        let update = JobUpdate::requeue();
        assert_eq!(update.state, Some(JobState::Pending));
        assert_eq!(update.attempts, Some(0));
        assert_eq!(update.next_run_at, Some(0));
        assert_eq!(update.last_error, Some(None));
        assert_eq!(update.last_stdout, Some(None));
        assert_eq!(update.last_stderr, Some(None));
    }

    #[test]
    fn submission_applies_defaults() {
        let submission: JobSubmission =
            serde_json::from_str(r#"{"id": "j1", "command": "echo hi"}"#).unwrap();
        let job = submission.into_job(3).unwrap();
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.priority, 0);
        assert_eq!(job.next_run_at, 0);
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn submission_converts_run_at() {
        let submission: JobSubmission = serde_json::from_str(
            r#"{"id": "j2", "command": "true", "run_at": "2026-01-01T00:00:10Z"}"#,
        )
        .unwrap();
        let job = submission.into_job(3).unwrap();
        assert_eq!(job.next_run_at, 1_767_225_610);
    }
}
