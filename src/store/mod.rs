//! Durable run store over SQLite.
//!
//! Every state transition is a single conditional UPDATE whose WHERE clause
//! enumerates the expected columns; `rows_affected == 1` is the sole success
//! signal. A miss is a normal concurrency outcome: the caller re-reads and
//! decides, it never retries the same update blindly.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Result, TaskherdError};
use crate::model::{
    ConcurrencyPolicy, ContinuationState, Event, JobDefinition, JobKind, JobRun, RunState,
};
use crate::schedule::Schedule;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS job_definitions (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        enabled INTEGER NOT NULL DEFAULT 1,
        kind TEXT NOT NULL,
        command_name TEXT NOT NULL,
        default_args TEXT NOT NULL DEFAULT '{}',
        schedule TEXT NOT NULL DEFAULT '{}',
        timeout_seconds INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 0,
        retry_backoff_seconds INTEGER NOT NULL DEFAULT 0,
        concurrency_policy TEXT NOT NULL DEFAULT 'forbid',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_jobdef_enabled ON job_definitions(enabled)",
    "CREATE INDEX IF NOT EXISTS idx_jobdef_kind ON job_definitions(kind)",
    r#"
    CREATE TABLE IF NOT EXISTS job_runs (
        id TEXT PRIMARY KEY,
        job_definition_id TEXT NOT NULL REFERENCES job_definitions(id),
        scheduled_for TEXT,
        state TEXT NOT NULL DEFAULT 'PENDING',
        attempt INTEGER NOT NULL DEFAULT 1,
        version INTEGER NOT NULL DEFAULT 0,
        leader_epoch INTEGER,
        assigned_worker_id TEXT,
        assigned_at TEXT,
        started_at TEXT,
        finished_at TEXT,
        exit_code INTEGER,
        error_summary TEXT NOT NULL DEFAULT '',
        log_ref TEXT NOT NULL DEFAULT '',
        idempotency_key TEXT,
        continuation_state TEXT NOT NULL DEFAULT 'NONE',
        continuation_check_started_at TEXT,
        continuation_check_deadline_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobrun_idempotency ON job_runs(idempotency_key) WHERE idempotency_key IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_jobrun_state_scheduled ON job_runs(state, scheduled_for)",
    "CREATE INDEX IF NOT EXISTS idx_jobrun_worker_state ON job_runs(assigned_worker_id, state)",
    "CREATE INDEX IF NOT EXISTS idx_jobrun_created_at ON job_runs(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobrun_definition ON job_runs(job_definition_id, scheduled_for)",
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        event_type TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT '{}',
        dedupe_key TEXT,
        created_at TEXT NOT NULL,
        processed_at TEXT
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_event_dedupe ON events(dedupe_key) WHERE dedupe_key IS NOT NULL",
    "CREATE INDEX IF NOT EXISTS idx_event_proc_created ON events(processed_at, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        is_secret INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        action TEXT NOT NULL,
        target TEXT NOT NULL DEFAULT '',
        detail TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_audit_created_at ON audit_log(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action)",
];

const TERMINAL_STATES: &str = "('SUCCEEDED','FAILED','CANCELED','TIMED_OUT','SKIPPED')";

/// Per-worker in-flight counts used for assignment scoring.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerLoad {
    pub assigned: i64,
    pub running: i64,
}

#[derive(Clone)]
pub struct RunStore {
    pool: SqlitePool,
}

impl RunStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(TaskherdError::Database)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database; used by tests and embedded setups. One
    /// connection, never recycled, so the database lives as long as the
    /// store.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(TaskherdError::Database)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // ----- job definitions -----

    pub async fn insert_definition(&self, def: &JobDefinition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_definitions
                (id, name, enabled, kind, command_name, default_args, schedule,
                 timeout_seconds, max_retries, retry_backoff_seconds,
                 concurrency_policy, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(def.enabled)
        .bind(def.kind.to_string())
        .bind(&def.command_name)
        .bind(def.default_args.to_string())
        .bind(serde_json::to_string(&def.schedule).unwrap_or_else(|_| "{}".to_string()))
        .bind(def.timeout_seconds)
        .bind(def.max_retries)
        .bind(def.retry_backoff_seconds)
        .bind(def.concurrency_policy.to_string())
        .bind(def.created_at)
        .bind(def.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_definition(&self, id: Uuid) -> Result<Option<JobDefinition>> {
        let row = sqlx::query("SELECT * FROM job_definitions WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row_to_definition(&row)?)),
            None => Ok(None),
        }
    }

    /// Enabled definitions of the given kind with a parseable schedule.
    /// Definitions whose schedule fails the closed grammar are skipped and
    /// recorded in the audit log, matching "unknown grammar is a disabled
    /// definition".
    pub async fn list_enabled_definitions(&self, kind: JobKind) -> Result<Vec<JobDefinition>> {
        let rows = sqlx::query("SELECT * FROM job_definitions WHERE enabled = 1 AND kind = ?1")
            .bind(kind.to_string())
            .fetch_all(&self.pool)
            .await?;
        let mut defs = Vec::with_capacity(rows.len());
        for row in &rows {
            match row_to_definition(row) {
                Ok(def) => {
                    if let Err(reason) = def.schedule.validate() {
                        self.audit("schedule_rejected", &def.id.to_string(), &reason)
                            .await?;
                        continue;
                    }
                    defs.push(def);
                }
                Err(err) => {
                    let id: String = row.try_get("id").unwrap_or_default();
                    self.audit("schedule_rejected", &id, &err.to_string()).await?;
                }
            }
        }
        Ok(defs)
    }

    // ----- run creation -----

    /// Idempotent creation: the unique `idempotency_key` index arbitrates
    /// concurrent creators. Returns the surviving row and whether this call
    /// created it.
    pub async fn create_run_if_absent(
        &self,
        definition_id: Uuid,
        scheduled_for: Option<DateTime<Utc>>,
        idempotency_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(JobRun, bool)> {
        let id = Uuid::new_v4();
        let result = sqlx::query(
            r#"
            INSERT INTO job_runs
                (id, job_definition_id, scheduled_for, state, attempt, version,
                 idempotency_key, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'PENDING', 1, 0, ?4, ?5, ?5)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(id.to_string())
        .bind(definition_id.to_string())
        .bind(scheduled_for)
        .bind(idempotency_key)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let created = result.rows_affected() == 1;
        let row = sqlx::query("SELECT * FROM job_runs WHERE idempotency_key = ?1")
            .bind(idempotency_key)
            .fetch_one(&self.pool)
            .await?;
        Ok((row_to_run(&row)?, created))
    }

    pub async fn get_run(&self, id: Uuid) -> Result<Option<JobRun>> {
        let row = sqlx::query("SELECT * FROM job_runs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(row_to_run(&row)?)),
            None => Ok(None),
        }
    }

    // ----- run queries for the leader tick -----

    /// PENDING or ORPHANED runs due within the assignment window, oldest
    /// schedule first.
    pub async fn assignable_runs(
        &self,
        window_end: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<JobRun>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM job_runs
            WHERE state IN ('PENDING','ORPHANED')
              AND scheduled_for IS NOT NULL
              AND scheduled_for <= ?1
            ORDER BY scheduled_for, id
            LIMIT ?2
            "#,
        )
        .bind(window_end)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_run).collect()
    }

    /// ASSIGNED runs not yet started, oldest schedule first.
    pub async fn dispatchable_runs(&self, limit: i64) -> Result<Vec<JobRun>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM job_runs
            WHERE state = 'ASSIGNED'
              AND assigned_worker_id IS NOT NULL
              AND started_at IS NULL
            ORDER BY scheduled_for, id
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_run).collect()
    }

    pub async fn runs_in_state(&self, state: RunState, limit: i64) -> Result<Vec<JobRun>> {
        let rows = sqlx::query(
            "SELECT * FROM job_runs WHERE state = ?1 ORDER BY scheduled_for, id LIMIT ?2",
        )
        .bind(state.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_run).collect()
    }

    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<JobRun>> {
        let rows = sqlx::query("SELECT * FROM job_runs ORDER BY created_at DESC, id LIMIT ?1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_run).collect()
    }

    /// Whether the definition has any non-terminal run (concurrency policy
    /// `forbid` gate).
    pub async fn has_live_run(&self, definition_id: Uuid) -> Result<bool> {
        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS c FROM job_runs \
             WHERE job_definition_id = ?1 AND state NOT IN {TERMINAL_STATES}"
        ))
        .bind(definition_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get("c")?;
        Ok(count > 0)
    }

    /// Non-terminal runs of a definition other than `exclude`, for the
    /// `replace` policy.
    pub async fn live_runs_for_definition(
        &self,
        definition_id: Uuid,
        exclude: Uuid,
    ) -> Result<Vec<JobRun>> {
        let rows = sqlx::query(&format!(
            "SELECT * FROM job_runs \
             WHERE job_definition_id = ?1 AND id != ?2 AND state NOT IN {TERMINAL_STATES} \
             ORDER BY created_at, id"
        ))
        .bind(definition_id.to_string())
        .bind(exclude.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_run).collect()
    }

    pub async fn load_by_worker(&self) -> Result<HashMap<String, WorkerLoad>> {
        let rows = sqlx::query(
            r#"
            SELECT assigned_worker_id AS worker_id, state, COUNT(*) AS c
            FROM job_runs
            WHERE state IN ('ASSIGNED','RUNNING') AND assigned_worker_id IS NOT NULL
            GROUP BY assigned_worker_id, state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut loads: HashMap<String, WorkerLoad> = HashMap::new();
        for row in rows {
            let worker_id: String = row.try_get("worker_id")?;
            let state: String = row.try_get("state")?;
            let count: i64 = row.try_get("c")?;
            let entry = loads.entry(worker_id).or_default();
            if state == "RUNNING" {
                entry.running = count;
            } else {
                entry.assigned = count;
            }
        }
        Ok(loads)
    }

    // ----- conditional transitions -----

    /// PENDING -> ASSIGNED. Version-checked so at most one caller wins.
    pub async fn assign_run(
        &self,
        run_id: Uuid,
        expected_version: i64,
        worker_id: &str,
        leader_epoch: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET state = 'ASSIGNED', assigned_worker_id = ?3, assigned_at = ?4,
                leader_epoch = ?5, version = version + 1, updated_at = ?4
            WHERE id = ?1 AND state = 'PENDING' AND version = ?2
            "#,
        )
        .bind(run_id.to_string())
        .bind(expected_version)
        .bind(worker_id)
        .bind(now)
        .bind(leader_epoch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// ORPHANED -> ASSIGNED on a fresh candidate; the attempt counter moves
    /// here, not at orphaning time.
    pub async fn reassign_orphaned_run(
        &self,
        run_id: Uuid,
        expected_version: i64,
        worker_id: &str,
        leader_epoch: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET state = 'ASSIGNED', assigned_worker_id = ?3, assigned_at = ?4,
                leader_epoch = ?5, attempt = attempt + 1, version = version + 1,
                updated_at = ?4
            WHERE id = ?1 AND state = 'ORPHANED' AND version = ?2
            "#,
        )
        .bind(run_id.to_string())
        .bind(expected_version)
        .bind(worker_id)
        .bind(now)
        .bind(leader_epoch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// ASSIGNED -> RUNNING, performed by the assigned worker. The epoch
    /// fence admits the dispatch epoch or newer; a row already bound to a
    /// newer epoch rejects the stale starter.
    pub async fn mark_running(
        &self,
        run_id: Uuid,
        worker_id: &str,
        request_epoch: i64,
        log_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET state = 'RUNNING', started_at = ?4, log_ref = ?5,
                version = version + 1, updated_at = ?4
            WHERE id = ?1 AND state = 'ASSIGNED' AND assigned_worker_id = ?2
              AND (leader_epoch IS NULL OR leader_epoch <= ?3)
            "#,
        )
        .bind(run_id.to_string())
        .bind(worker_id)
        .bind(request_epoch)
        .bind(now)
        .bind(log_ref)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// RUNNING -> SUCCEEDED | FAILED | TIMED_OUT | CANCELED, performed by
    /// the executing worker. Bound to the dispatch epoch stored on the row:
    /// a run re-dispatched under a newer epoch cannot be closed by the old
    /// executor.
    #[allow(clippy::too_many_arguments)]
    pub async fn finish_run(
        &self,
        run_id: Uuid,
        worker_id: &str,
        dispatch_epoch: i64,
        final_state: RunState,
        exit_code: Option<i32>,
        error_summary: &str,
        log_ref: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        debug_assert!(final_state.is_terminal());
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET state = ?4, finished_at = ?5, exit_code = ?6, error_summary = ?7,
                log_ref = ?8, continuation_state = 'NONE',
                continuation_check_started_at = NULL,
                continuation_check_deadline_at = NULL,
                version = version + 1, updated_at = ?5
            WHERE id = ?1 AND state = 'RUNNING' AND assigned_worker_id = ?2
              AND leader_epoch = ?3
            "#,
        )
        .bind(run_id.to_string())
        .bind(worker_id)
        .bind(dispatch_epoch)
        .bind(final_state.as_str())
        .bind(now)
        .bind(exit_code)
        .bind(truncate_summary(error_summary))
        .bind(log_ref)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Leader-initiated ASSIGNED/RUNNING -> CANCELED under the current
    /// epoch.
    pub async fn cancel_run(
        &self,
        run_id: Uuid,
        leader_epoch: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET state = 'CANCELED', finished_at = ?3,
                error_summary = CASE WHEN error_summary = '' THEN ?4
                                ELSE error_summary || char(10) || ?4 END,
                continuation_state = 'NONE',
                continuation_check_started_at = NULL,
                continuation_check_deadline_at = NULL,
                version = version + 1, updated_at = ?3
            WHERE id = ?1 AND state IN ('PENDING','ASSIGNED','RUNNING')
              AND (leader_epoch IS NULL OR leader_epoch <= ?2)
            "#,
        )
        .bind(run_id.to_string())
        .bind(leader_epoch)
        .bind(now)
        .bind(truncate_summary(reason))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// ASSIGNED -> ORPHANED when the assigned worker is gone. Gated on
    /// `continuation_state = NONE`: a run whose worker is mid-confirmation
    /// must not be stolen.
    pub async fn orphan_assigned_run(
        &self,
        run_id: Uuid,
        expected_version: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET state = 'ORPHANED', assigned_worker_id = NULL, assigned_at = NULL,
                error_summary = CASE WHEN error_summary = '' THEN ?3
                                ELSE error_summary || char(10) || ?3 END,
                version = version + 1, updated_at = ?4
            WHERE id = ?1 AND state = 'ASSIGNED' AND version = ?2
              AND continuation_state = 'NONE'
            "#,
        )
        .bind(run_id.to_string())
        .bind(expected_version)
        .bind(truncate_summary(reason))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// RUNNING -> ORPHANED after the continuation deadline lapsed without a
    /// verdict. Execution fields reset so the reassigned attempt starts
    /// clean.
    pub async fn orphan_unconfirmed_run(
        &self,
        run_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET state = 'ORPHANED', assigned_worker_id = NULL, assigned_at = NULL,
                started_at = NULL, finished_at = NULL, exit_code = NULL,
                continuation_state = 'NONE',
                continuation_check_started_at = NULL,
                continuation_check_deadline_at = NULL,
                error_summary = CASE WHEN error_summary = '' THEN ?2
                                ELSE error_summary || char(10) || ?2 END,
                version = version + 1, updated_at = ?3
            WHERE id = ?1 AND state = 'RUNNING'
              AND continuation_state = 'CONFIRMING'
              AND continuation_check_deadline_at IS NOT NULL
              AND continuation_check_deadline_at <= ?3
            "#,
        )
        .bind(run_id.to_string())
        .bind(truncate_summary(reason))
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// PENDING/ASSIGNED -> SKIPPED for runs behind the backlog cutoff.
    pub async fn skip_run(&self, run_id: Uuid, reason: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET state = 'SKIPPED', finished_at = ?2,
                error_summary = CASE WHEN error_summary = '' THEN ?3
                                ELSE error_summary || char(10) || ?3 END,
                version = version + 1, updated_at = ?2
            WHERE id = ?1 AND state IN ('PENDING','ASSIGNED') AND started_at IS NULL
            "#,
        )
        .bind(run_id.to_string())
        .bind(now)
        .bind(truncate_summary(reason))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Enter the continuation sub-state on a RUNNING row. Does not change
    /// `state`.
    pub async fn begin_confirming(
        &self,
        run_id: Uuid,
        deadline: DateTime<Utc>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET continuation_state = 'CONFIRMING',
                continuation_check_started_at = ?2,
                continuation_check_deadline_at = ?3,
                error_summary = CASE WHEN error_summary = '' THEN ?4
                                ELSE error_summary || char(10) || ?4 END,
                version = version + 1, updated_at = ?2
            WHERE id = ?1 AND state = 'RUNNING' AND continuation_state = 'NONE'
            "#,
        )
        .bind(run_id.to_string())
        .bind(now)
        .bind(deadline)
        .bind(truncate_summary(reason))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Leave the continuation sub-state after ALLOW_CONTINUE.
    pub async fn clear_confirming(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_runs
            SET continuation_state = 'NONE',
                continuation_check_started_at = NULL,
                continuation_check_deadline_at = NULL,
                version = version + 1, updated_at = ?2
            WHERE id = ?1 AND state = 'RUNNING' AND continuation_state = 'CONFIRMING'
            "#,
        )
        .bind(run_id.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // ----- events -----

    /// Insert an event; a duplicate `dedupe_key` returns the stored event
    /// with `deduped = true` and writes nothing.
    pub async fn insert_event(
        &self,
        event_type: &str,
        payload: serde_json::Value,
        dedupe_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(Event, bool)> {
        let id = Uuid::new_v4();
        let result = sqlx::query(
            r#"
            INSERT INTO events (id, event_type, payload, dedupe_key, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(id.to_string())
        .bind(event_type)
        .bind(payload.to_string())
        .bind(dedupe_key)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        let row = if inserted {
            sqlx::query("SELECT * FROM events WHERE id = ?1")
                .bind(id.to_string())
                .fetch_one(&self.pool)
                .await?
        } else {
            // Conflict implies a dedupe key was present and already stored.
            sqlx::query("SELECT * FROM events WHERE dedupe_key = ?1")
                .bind(dedupe_key)
                .fetch_one(&self.pool)
                .await?
        };
        Ok((row_to_event(&row)?, !inserted))
    }

    pub async fn unprocessed_events(&self, limit: i64) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT * FROM events WHERE processed_at IS NULL ORDER BY created_at, id LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    /// Consume one event: create a PENDING run per matching definition and
    /// mark the event processed, all in one transaction. The idempotency
    /// key anchors recovery if the leader dies between retries.
    pub async fn process_event(
        &self,
        event: &Event,
        matching: &[&JobDefinition],
        now: DateTime<Utc>,
    ) -> Result<Vec<Uuid>> {
        let anchor = event
            .dedupe_key
            .clone()
            .unwrap_or_else(|| event.id.to_string());

        let mut tx = self.pool.begin().await?;
        let mut created = Vec::new();
        for def in matching {
            let run_id = Uuid::new_v4();
            let result = sqlx::query(
                r#"
                INSERT INTO job_runs
                    (id, job_definition_id, scheduled_for, state, attempt, version,
                     idempotency_key, created_at, updated_at)
                VALUES (?1, ?2, ?3, 'PENDING', 1, 0, ?4, ?5, ?5)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(run_id.to_string())
            .bind(def.id.to_string())
            .bind(now)
            .bind(JobRun::event_key(&anchor, def.id))
            .bind(now)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 1 {
                created.push(run_id);
            }
        }
        sqlx::query("UPDATE events SET processed_at = ?2 WHERE id = ?1 AND processed_at IS NULL")
            .bind(event.id.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(created)
    }

    // ----- settings rows -----

    pub async fn settings_overrides(&self) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in rows {
            map.insert(row.try_get("key")?, row.try_get("value")?);
        }
        Ok(map)
    }

    pub async fn secret_setting_keys(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT key FROM settings WHERE is_secret = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("key").map_err(TaskherdError::Database))
            .collect()
    }

    pub async fn upsert_setting(
        &self,
        key: &str,
        value: &str,
        is_secret: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, is_secret, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE
            SET value = excluded.value, is_secret = excluded.is_secret,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(is_secret)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ----- audit -----

    /// Drop audit rows older than the retention horizon. Returns how many
    /// were removed.
    pub async fn prune_audit_log(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM audit_log WHERE created_at < ?1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn audit(&self, action: &str, target: &str, detail: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (action, target, detail, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(action)
        .bind(target)
        .bind(detail)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn truncate_summary(summary: &str) -> String {
    const MAX: usize = 2000;
    if summary.len() <= MAX {
        summary.to_string()
    } else {
        let mut cut = MAX;
        while !summary.is_char_boundary(cut) {
            cut -= 1;
        }
        summary[..cut].to_string()
    }
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| TaskherdError::Internal(format!("bad uuid {raw}: {e}")))
}

fn row_to_definition(row: &SqliteRow) -> Result<JobDefinition> {
    let id: String = row.try_get("id")?;
    let kind: String = row.try_get("kind")?;
    let schedule_raw: String = row.try_get("schedule")?;
    let default_args_raw: String = row.try_get("default_args")?;
    let policy: String = row.try_get("concurrency_policy")?;
    Ok(JobDefinition {
        id: parse_uuid(&id)?,
        name: row.try_get("name")?,
        enabled: row.try_get("enabled")?,
        kind: JobKind::from_str(&kind).map_err(TaskherdError::Internal)?,
        command_name: row.try_get("command_name")?,
        default_args: serde_json::from_str(&default_args_raw)
            .unwrap_or(serde_json::Value::Object(Default::default())),
        schedule: serde_json::from_str::<Schedule>(&schedule_raw)
            .map_err(|e| TaskherdError::InvalidSchedule(e.to_string()))?,
        timeout_seconds: row.try_get("timeout_seconds")?,
        max_retries: row.try_get("max_retries")?,
        retry_backoff_seconds: row.try_get("retry_backoff_seconds")?,
        concurrency_policy: ConcurrencyPolicy::from_str(&policy)
            .map_err(TaskherdError::Internal)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_run(row: &SqliteRow) -> Result<JobRun> {
    let id: String = row.try_get("id")?;
    let definition_id: String = row.try_get("job_definition_id")?;
    let state: String = row.try_get("state")?;
    let continuation: String = row.try_get("continuation_state")?;
    Ok(JobRun {
        id: parse_uuid(&id)?,
        job_definition_id: parse_uuid(&definition_id)?,
        scheduled_for: row.try_get("scheduled_for")?,
        state: RunState::from_str(&state).map_err(TaskherdError::Internal)?,
        attempt: row.try_get("attempt")?,
        version: row.try_get("version")?,
        leader_epoch: row.try_get("leader_epoch")?,
        assigned_worker_id: row.try_get("assigned_worker_id")?,
        assigned_at: row.try_get("assigned_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        exit_code: row.try_get("exit_code")?,
        error_summary: row.try_get("error_summary")?,
        log_ref: row.try_get("log_ref")?,
        idempotency_key: row.try_get("idempotency_key")?,
        continuation_state: ContinuationState::from_str(&continuation)
            .map_err(TaskherdError::Internal)?,
        continuation_check_started_at: row.try_get("continuation_check_started_at")?,
        continuation_check_deadline_at: row.try_get("continuation_check_deadline_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_event(row: &SqliteRow) -> Result<Event> {
    let id: String = row.try_get("id")?;
    let payload_raw: String = row.try_get("payload")?;
    Ok(Event {
        id: parse_uuid(&id)?,
        event_type: row.try_get("event_type")?,
        payload: serde_json::from_str(&payload_raw).unwrap_or(serde_json::Value::Null),
        dedupe_key: row.try_get("dedupe_key")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
    })
}
