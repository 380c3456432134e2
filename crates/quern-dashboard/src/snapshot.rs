//! Full-queue snapshots for the dashboard stream.

use serde_json::{json, Map, Value};

use quern_core::{now_ts, Job, Store, StoreResult};

/// Complete serialised view of the jobs table plus summary metrics.
///
/// The struct holds everything that participates in broadcast deduplication:
/// the job rows and the summary counts with `avg_attempts`. The status
/// timestamp changes every second and would defeat the dedup, so it is
/// stamped at serialisation time instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub jobs: Vec<Job>,
    pub status: Value,
}

impl Snapshot {
    pub async fn build(store: &dyn Store) -> StoreResult<Self> {
        let jobs = store.list_jobs(None).await?;
        let mut status = Map::new();
        for (state, count) in store.stats_summary().await? {
            status.insert(state, count.into());
        }
        let avg_attempts = if jobs.is_empty() {
            0.0
        } else {
            let sum: i64 = jobs.iter().map(|job| job.attempts).sum();
            let avg = sum as f64 / jobs.len() as f64;
            (avg * 100.0).round() / 100.0
        };
        status.insert("avg_attempts".to_string(), json!(avg_attempts));
        Ok(Self {
            jobs,
            status: Value::Object(status),
        })
    }

    /// Summary metrics with the current timestamp, as served by
    /// `/api/status`.
    pub fn status_now(&self) -> Value {
        let mut status = self.status.clone();
        if let Value::Object(map) = &mut status {
            map.insert("timestamp".to_string(), json!(now_ts()));
        }
        status
    }

    /// The wire frame pushed to WebSocket clients.
    pub fn to_frame(&self) -> String {
        json!({
            "type": "snapshot",
            "jobs": self.jobs,
            "status": self.status_now(),
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quern_core::{Job, JobUpdate, Store};
    use quern_store_sqlite::SqliteStore;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> SqliteStore {
        let store = SqliteStore::open(dir.path().join("queue.db")).await.unwrap();
        store.init().await.unwrap();
        store
    }

    #[tokio::test]
    async fn empty_queue_snapshot() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let snapshot = Snapshot::build(&store).await.unwrap();
        assert!(snapshot.jobs.is_empty());
        assert_eq!(snapshot.status["total"], 0);
        assert_eq!(snapshot.status["avg_attempts"], 0.0);
    }

    #[tokio::test]
    async fn avg_attempts_is_rounded_mean() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        for (id, attempts) in [("a", 1), ("b", 2), ("c", 1)] {
            let mut job = Job::new(id, "true");
            job.attempts = attempts;
            store.save_job(&job).await.unwrap();
        }
        let snapshot = Snapshot::build(&store).await.unwrap();
        assert_eq!(snapshot.status["avg_attempts"], 1.33);
        assert_eq!(snapshot.status["pending"], 3);
    }

    #[tokio::test]
    async fn dedup_payload_ignores_time_but_not_state() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        store.save_job(&Job::new("a", "true")).await.unwrap();

        let first = Snapshot::build(&store).await.unwrap();
        let second = Snapshot::build(&store).await.unwrap();
        assert_eq!(first, second);

        store
            .update_job_state("a", &JobUpdate::new().attempts(1))
            .await
            .unwrap();
        let third = Snapshot::build(&store).await.unwrap();
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn frame_carries_type_and_timestamp() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        let snapshot = Snapshot::build(&store).await.unwrap();
        let frame: Value = serde_json::from_str(&snapshot.to_frame()).unwrap();
        assert_eq!(frame["type"], "snapshot");
        assert!(frame["status"]["timestamp"].is_i64());
        assert!(frame["jobs"].is_array());
    }
}
