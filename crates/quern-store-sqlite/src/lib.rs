//! SQLite implementation of the quern job store.
//!
//! A single database file is the only coordination point between workers,
//! whether they run in this process or any other pointed at the same path.
//! Claiming relies on
//! SQLite's exclusive write slot (`BEGIN IMMEDIATE`) plus a guarded update,
//! so a given `pending → processing` transition is observed by exactly one
//! claimer.
//!
//! # Features
//!
//! - Atomic claim under `BEGIN IMMEDIATE` with a state-guarded update
//! - Partial updates with a transactional (best-effort) event trail
//! - WAL journal mode so dashboard reads never block worker writes
//! - 30 s busy timeout: transient write contention retries instead of failing
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id TEXT PRIMARY KEY,
//!     command TEXT NOT NULL,
//!     state TEXT NOT NULL DEFAULT 'pending',
//!     attempts INTEGER NOT NULL DEFAULT 0,
//!     max_retries INTEGER NOT NULL DEFAULT 3,
//!     priority INTEGER NOT NULL DEFAULT 0,
//!     timeout INTEGER,
//!     created_at TEXT,
//!     updated_at TEXT,
//!     next_run_at INTEGER DEFAULT 0,
//!     last_error TEXT,
//!     last_stdout TEXT,
//!     last_stderr TEXT
//! );
//!
//! CREATE TABLE config (
//!     key TEXT PRIMARY KEY,
//!     value TEXT
//! );
//!
//! CREATE TABLE job_events (
//!     seq INTEGER PRIMARY KEY AUTOINCREMENT,
//!     job_id TEXT NOT NULL,
//!     event_type TEXT NOT NULL,
//!     message TEXT,
//!     created_at TEXT
//! );
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use quern_store_sqlite::SqliteStore;
//!
//! let store = SqliteStore::open("queue.db").await?;
//! store.init().await?;
//!
//! if let Some(job_id) = store.claim_one_pending(quern_core::now_ts()).await? {
//!     // run it
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use quern_core::{
    config, now_iso, Job, JobEvent, JobState, JobUpdate, StatsSummary, Store, StoreError,
    StoreResult,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// SQLite-backed [`Store`].
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database file at `path` with WAL
    /// journaling and the busy timeout configured.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        Ok(Self::new(pool))
    }

    /// Wrap an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn init(&self) -> StoreResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                command TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                priority INTEGER NOT NULL DEFAULT 0,
                timeout INTEGER,
                created_at TEXT,
                updated_at TEXT,
                next_run_at INTEGER DEFAULT 0,
                last_error TEXT,
                last_stdout TEXT,
                last_stderr TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS config (
                key TEXT PRIMARY KEY,
                value TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS job_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                message TEXT,
                created_at TEXT
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_ready
                ON jobs (priority DESC, created_at)
                WHERE state = 'pending'
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_job_events_job
                ON job_events (job_id, created_at)
            "#,
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await.map_err(db_err)?;
        }

        for (key, value) in [
            (config::BACKOFF_BASE_KEY, config::DEFAULT_BACKOFF_BASE),
            (
                config::DEFAULT_MAX_RETRIES_KEY,
                config::DEFAULT_MAX_RETRIES,
            ),
        ] {
            sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(value.to_string())
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }

    async fn save_job(&self, job: &Job) -> StoreResult<()> {
        let now = now_iso();
        let created_at = if job.created_at.is_empty() {
            now.clone()
        } else {
            job.created_at.clone()
        };
        let updated_at = if job.updated_at.is_empty() {
            now
        } else {
            job.updated_at.clone()
        };

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (
                id, command, state, attempts, max_retries, priority, timeout,
                created_at, updated_at, next_run_at, last_error, last_stdout, last_stderr
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(job.attempts)
        .bind(job.max_retries)
        .bind(job.priority)
        .bind(job.timeout)
        .bind(created_at)
        .bind(updated_at)
        .bind(job.next_run_at)
        .bind(&job.last_error)
        .bind(&job.last_stdout)
        .bind(&job.last_stderr)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateId(job.id.clone()))
            }
            Err(err) => Err(db_err(err)),
        }
    }

    async fn list_jobs(&self, state: Option<JobState>) -> StoreResult<Vec<Job>> {
        let rows = match state {
            Some(state) => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE state = ? ORDER BY priority DESC, created_at",
                )
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY priority DESC, created_at")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(db_err)?;
        rows.iter().map(job_from_row).collect()
    }

    async fn list_jobs_paginated(
        &self,
        state: Option<JobState>,
        page: i64,
        per_page: i64,
    ) -> StoreResult<(Vec<Job>, i64)> {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let offset = (page - 1) * per_page;

        let (total, rows) = match state {
            Some(state) => {
                let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state = ?")
                    .bind(state.as_str())
                    .fetch_one(&self.pool)
                    .await
                    .map_err(db_err)?;
                let rows = sqlx::query(
                    "SELECT * FROM jobs WHERE state = ? \
                     ORDER BY priority DESC, created_at LIMIT ? OFFSET ?",
                )
                .bind(state.as_str())
                .bind(per_page)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
                (total, rows)
            }
            None => {
                let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
                    .fetch_one(&self.pool)
                    .await
                    .map_err(db_err)?;
                let rows = sqlx::query(
                    "SELECT * FROM jobs ORDER BY priority DESC, created_at LIMIT ? OFFSET ?",
                )
                .bind(per_page)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
                (total, rows)
            }
        };

        let jobs = rows.iter().map(job_from_row).collect::<StoreResult<_>>()?;
        Ok((jobs, total))
    }

    async fn get_job(&self, id: &str) -> StoreResult<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn get_config(&self, key: &str) -> StoreResult<Option<String>> {
        let value: Option<Option<String>> =
            sqlx::query_scalar("SELECT value FROM config WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(value.flatten())
    }

    async fn set_config(&self, key: &str, value: &str) -> StoreResult<()> {
        sqlx::query("INSERT OR REPLACE INTO config (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn stats_summary(&self) -> StoreResult<StatsSummary> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS cnt FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let mut summary = BTreeMap::new();
        for row in &rows {
            summary.insert(row.get::<String, _>("state"), row.get::<i64, _>("cnt"));
        }
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        summary.insert("total".to_string(), total);
        Ok(summary)
    }

    async fn get_job_events(&self, job_id: &str, limit: i64) -> StoreResult<Vec<JobEvent>> {
        let rows = sqlx::query(
            "SELECT seq, job_id, event_type, message, created_at FROM job_events \
             WHERE job_id = ? ORDER BY created_at DESC, seq DESC LIMIT ?",
        )
        .bind(job_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows
            .iter()
            .map(|row| JobEvent {
                seq: row.get("seq"),
                job_id: row.get("job_id"),
                event_type: row.get("event_type"),
                message: row.get("message"),
                created_at: row.get::<Option<String>, _>("created_at").unwrap_or_default(),
            })
            .collect())
    }

    async fn update_job_state(&self, id: &str, update: &JobUpdate) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let now = now_iso();

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE jobs SET ");
        let mut fields = builder.separated(", ");
        if let Some(state) = update.state {
            fields.push("state = ");
            fields.push_bind_unseparated(state.as_str());
        }
        if let Some(attempts) = update.attempts {
            fields.push("attempts = ");
            fields.push_bind_unseparated(attempts);
        }
        if let Some(next_run_at) = update.next_run_at {
            fields.push("next_run_at = ");
            fields.push_bind_unseparated(next_run_at);
        }
        if let Some(timeout) = update.timeout {
            fields.push("timeout = ");
            fields.push_bind_unseparated(timeout);
        }
        if let Some(priority) = update.priority {
            fields.push("priority = ");
            fields.push_bind_unseparated(priority);
        }
        if let Some(last_error) = &update.last_error {
            fields.push("last_error = ");
            fields.push_bind_unseparated(last_error.clone());
        }
        if let Some(last_stdout) = &update.last_stdout {
            fields.push("last_stdout = ");
            fields.push_bind_unseparated(last_stdout.clone());
        }
        if let Some(last_stderr) = &update.last_stderr {
            fields.push("last_stderr = ");
            fields.push_bind_unseparated(last_stderr.clone());
        }
        fields.push("updated_at = ");
        fields.push_bind_unseparated(now.clone());
        builder.push(" WHERE id = ");
        builder.push_bind(id.to_string());

        builder
            .build()
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        // Best-effort: a lost event must never poison the primary update.
        let event = sqlx::query(
            "INSERT INTO job_events (job_id, event_type, message, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(id)
        .bind(update.event_type())
        .bind(update.event_message())
        .bind(&now)
        .execute(&mut *tx)
        .await;
        if let Err(err) = event {
            tracing::warn!(job_id = id, error = %err, "job event insert failed");
        }

        tx.commit().await.map_err(db_err)
    }

    async fn claim_one_pending(&self, now_ts: i64) -> StoreResult<Option<String>> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        // Take the exclusive write slot up front: the select-then-update pair
        // below must not interleave with another claimer.
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(db_err)?;

        match claim_in_tx(&mut conn, now_ts).await {
            Ok(Some(job_id)) => match sqlx::query("COMMIT").execute(&mut *conn).await {
                Ok(_) => Ok(Some(job_id)),
                Err(err) => {
                    rollback(&mut conn).await;
                    Err(db_err(err))
                }
            },
            Ok(None) => {
                rollback(&mut conn).await;
                Ok(None)
            }
            Err(err) => {
                rollback(&mut conn).await;
                Err(err)
            }
        }
    }
}

async fn claim_in_tx(conn: &mut SqliteConnection, now_ts: i64) -> StoreResult<Option<String>> {
    let row = sqlx::query(
        "SELECT id FROM jobs WHERE state = 'pending' AND next_run_at <= ? \
         ORDER BY priority DESC, created_at LIMIT 1",
    )
    .bind(now_ts)
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;
    let Some(row) = row else {
        return Ok(None);
    };
    let job_id: String = row.get("id");

    let now = now_iso();
    let updated = sqlx::query(
        "UPDATE jobs SET state = 'processing', updated_at = ? WHERE id = ? AND state = 'pending'",
    )
    .bind(&now)
    .bind(&job_id)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;
    // The guard must stay even under serialized writers: if the row changed
    // since the select, losing the race means walking away, not clobbering.
    if updated.rows_affected() != 1 {
        return Ok(None);
    }

    sqlx::query(
        "INSERT INTO job_events (job_id, event_type, message, created_at) \
         VALUES (?, 'claimed', NULL, ?)",
    )
    .bind(&job_id)
    .bind(&now)
    .execute(&mut *conn)
    .await
    .map_err(db_err)?;

    Ok(Some(job_id))
}

async fn rollback(conn: &mut SqliteConnection) {
    if let Err(err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
        tracing::warn!(error = %err, "claim rollback failed");
    }
}

fn db_err(err: sqlx::Error) -> StoreError {
    StoreError::unavailable(err)
}

fn job_from_row(row: &SqliteRow) -> StoreResult<Job> {
    let state: String = row.get("state");
    Ok(Job {
        id: row.get("id"),
        command: row.get("command"),
        state: state.parse().map_err(StoreError::unavailable)?,
        attempts: row.get("attempts"),
        max_retries: row.get("max_retries"),
        priority: row.get("priority"),
        timeout: row.get("timeout"),
        created_at: row.get::<Option<String>, _>("created_at").unwrap_or_default(),
        updated_at: row.get::<Option<String>, _>("updated_at").unwrap_or_default(),
        next_run_at: row.get::<Option<i64>, _>("next_run_at").unwrap_or(0),
        last_error: row.get("last_error"),
        last_stdout: row.get("last_stdout"),
        last_stderr: row.get("last_stderr"),
    })
}
