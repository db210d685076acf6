use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fleetmon_core::{JobRecord, JobStatus, QueueCounts, RetryPolicy};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

pub const QUEUE_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// A job to persist into the queue.
#[derive(Debug, Clone)]
pub struct NewJob<'a> {
    pub id: &'a str,
    pub queue_name: &'a str,
    pub job_name: &'a str,
    pub agent_id: &'a str,
    pub payload: &'a Value,
    pub policy: RetryPolicy,
}

/// A due job handed to the worker; `attempts_made` counts finished attempts,
/// so the attempt about to run is `attempts_made + 1`.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    pub queue_name: String,
    pub job_name: String,
    pub payload: Value,
    pub attempts_made: u32,
    pub policy: RetryPolicy,
    pub created_at: DateTime<Utc>,
}

/// Durable job queue, attempt history, and agent credentials on SQLite.
pub struct QueueStore {
    conn: Connection,
}

impl QueueStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > QUEUE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: QUEUE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_queue_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn upsert_agent_credentials(
        &self,
        api_id: &str,
        api_key: &str,
        friendly_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO agents (api_id, api_key, friendly_name, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(api_id) DO UPDATE SET
                api_key=excluded.api_key,
                friendly_name=excluded.friendly_name
            ",
            params![api_id, api_key, friendly_name, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Credential check for the upgrade gatekeeper: true only when the id
    /// exists and the key matches. The caller must not distinguish the two
    /// failure cases.
    pub fn verify_credentials(&self, api_id: &str, api_key: &str) -> Result<bool, StorageError> {
        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT api_key FROM agents WHERE api_id = ?1",
                [api_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stored.is_some_and(|stored| stored == api_key))
    }

    pub fn enqueue(&self, job: &NewJob<'_>, now: DateTime<Utc>) -> Result<(), StorageError> {
        let payload_json = serde_json::to_string(job.payload)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;
        let now_text = now.to_rfc3339();

        self.conn.execute(
            "
            INSERT INTO jobs (
                id,
                queue_name,
                job_name,
                payload_json,
                state,
                attempts_made,
                max_attempts,
                base_delay_ms,
                backoff_multiplier,
                run_at,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, 'waiting', 0, ?5, ?6, ?7, ?8, ?8, ?8)
            ",
            params![
                job.id,
                job.queue_name,
                job.job_name,
                payload_json,
                job.policy.max_attempts,
                job.policy.base_delay_ms as i64,
                job.policy.backoff_multiplier,
                now_text,
            ],
        )?;

        // Seed the history row so enqueued-but-unprocessed jobs are visible.
        self.conn.execute(
            "
            INSERT OR IGNORE INTO job_history (
                job_id,
                queue_name,
                job_name,
                agent_id,
                status,
                attempt_number,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)
            ",
            params![job.id, job.queue_name, job.job_name, job.agent_id, now_text],
        )?;

        Ok(())
    }

    /// Atomically mark up to `limit` due jobs active and return them.
    pub fn claim_due(
        &mut self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ClaimedJob>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now_text = now.to_rfc3339();
        let tx = self.conn.transaction()?;

        let claimed = {
            let mut statement = tx.prepare(
                "
                SELECT id, queue_name, job_name, payload_json, attempts_made,
                       max_attempts, base_delay_ms, backoff_multiplier, created_at
                FROM jobs
                WHERE state IN ('waiting', 'delayed') AND run_at <= ?1
                ORDER BY run_at ASC, created_at ASC
                LIMIT ?2
                ",
            )?;

            let rows = statement.query_map(params![now_text, limit], |row| {
                let payload_json: String = row.get(3)?;
                let payload: Value = serde_json::from_str(&payload_json).map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        3,
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                })?;
                let created_at = parse_timestamp(row.get::<_, String>(8)?).map_err(|err| {
                    rusqlite::Error::FromSqlConversionFailure(
                        8,
                        rusqlite::types::Type::Text,
                        Box::new(err),
                    )
                })?;

                Ok(ClaimedJob {
                    id: row.get(0)?,
                    queue_name: row.get(1)?,
                    job_name: row.get(2)?,
                    payload,
                    attempts_made: row.get::<_, i64>(4)? as u32,
                    policy: RetryPolicy {
                        max_attempts: row.get::<_, i64>(5)? as u32,
                        base_delay_ms: row.get::<_, i64>(6)? as u64,
                        backoff_multiplier: row.get::<_, i64>(7)? as u32,
                    },
                    created_at,
                })
            })?;

            let mut claimed = Vec::new();
            for row in rows {
                claimed.push(row?);
            }
            claimed
        };

        for job in &claimed {
            tx.execute(
                "UPDATE jobs SET state = 'active', updated_at = ?2 WHERE id = ?1",
                params![job.id, now_text],
            )?;
        }

        tx.commit()?;
        Ok(claimed)
    }

    pub fn mark_completed(&self, job_id: &str, now: DateTime<Utc>) -> Result<(), StorageError> {
        self.conn.execute(
            "
            UPDATE jobs
            SET state = 'completed', attempts_made = attempts_made + 1, updated_at = ?2
            WHERE id = ?1
            ",
            params![job_id, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Push a failed job back into the delayed state for a later retry.
    pub fn mark_delayed(
        &self,
        job_id: &str,
        attempts_made: u32,
        run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            UPDATE jobs
            SET state = 'delayed', attempts_made = ?2, run_at = ?3, updated_at = ?4
            WHERE id = ?1
            ",
            params![job_id, attempts_made, run_at.to_rfc3339(), now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn mark_failed(
        &self,
        job_id: &str,
        attempts_made: u32,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            UPDATE jobs
            SET state = 'failed', attempts_made = ?2, updated_at = ?3
            WHERE id = ?1
            ",
            params![job_id, attempts_made, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn queue_counts(&self, queue_name: &str) -> Result<QueueCounts, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT state, COUNT(*)
            FROM jobs
            WHERE queue_name = ?1
            GROUP BY state
            ",
        )?;

        let rows = statement.query_map([queue_name], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let (state, count) = row?;
            let count = count as u64;
            match state.as_str() {
                "waiting" => counts.waiting = count,
                "active" => counts.active = count,
                "delayed" => counts.delayed = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    pub fn queue_names(&self) -> Result<Vec<String>, StorageError> {
        let mut statement = self
            .conn
            .prepare("SELECT DISTINCT queue_name FROM jobs ORDER BY queue_name ASC")?;
        let rows = statement.query_map([], |row| row.get(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    /// Write the latest attempt state for a job. One row per job id: the
    /// insert path runs once, every later attempt lands in the update arm
    /// and leaves `created_at` untouched.
    pub fn upsert_history(&self, record: &JobRecord) -> Result<(), StorageError> {
        let output_json = record
            .output
            .as_ref()
            .map(|output| {
                serde_json::to_string(output)
                    .map_err(|err| StorageError::Serialization(err.to_string()))
            })
            .transpose()?;

        self.conn.execute(
            "
            INSERT INTO job_history (
                job_id,
                queue_name,
                job_name,
                agent_id,
                status,
                attempt_number,
                error_message,
                output_json,
                created_at,
                updated_at,
                completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(job_id) DO UPDATE SET
                queue_name=excluded.queue_name,
                job_name=excluded.job_name,
                agent_id=excluded.agent_id,
                status=excluded.status,
                attempt_number=excluded.attempt_number,
                error_message=excluded.error_message,
                output_json=excluded.output_json,
                updated_at=excluded.updated_at,
                completed_at=excluded.completed_at
            ",
            params![
                record.job_id,
                record.queue_name,
                record.job_name,
                record.agent_id,
                record.status.as_str(),
                record.attempt_number,
                record.error_message,
                output_json,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
                record.completed_at.map(|value| value.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn job_history(&self, job_id: &str) -> Result<Option<JobRecord>, StorageError> {
        let record = self
            .conn
            .query_row(
                &format!("{HISTORY_SELECT} WHERE job_id = ?1"),
                [job_id],
                map_history_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn history_for_agent(
        &self,
        agent_id: &str,
        limit: u32,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "{HISTORY_SELECT} WHERE agent_id = ?1 ORDER BY updated_at DESC LIMIT ?2"
        ))?;
        let rows = statement.query_map(params![agent_id, limit], map_history_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn history_for_queue(
        &self,
        queue_name: &str,
        limit: u32,
    ) -> Result<Vec<JobRecord>, StorageError> {
        let mut statement = self.conn.prepare(&format!(
            "{HISTORY_SELECT} WHERE queue_name = ?1 ORDER BY updated_at DESC LIMIT ?2"
        ))?;
        let rows = statement.query_map(params![queue_name, limit], map_history_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn history_rows_for_job(&self, job_id: &str) -> Result<i64, StorageError> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM job_history WHERE job_id = ?1",
            [job_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Next retry time under the job's backoff policy after `attempt` failed.
    pub fn retry_at(job: &ClaimedJob, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = job.policy.delay_after(attempt);
        now + ChronoDuration::milliseconds(delay.as_millis() as i64)
    }
}

const HISTORY_SELECT: &str = "
    SELECT job_id, queue_name, job_name, agent_id, status, attempt_number,
           error_message, output_json, created_at, updated_at, completed_at
    FROM job_history
";

fn map_history_row(row: &rusqlite::Row<'_>) -> Result<JobRecord, rusqlite::Error> {
    let status_raw: String = row.get(4)?;
    let status: JobStatus = status_raw.parse().map_err(|err: String| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err)),
        )
    })?;

    let output_json: Option<String> = row.get(7)?;
    let output = output_json
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    7,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })
        })
        .transpose()?;

    let created_at = parse_timestamp(row.get::<_, String>(8)?).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let updated_at = parse_timestamp(row.get::<_, String>(9)?).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let completed_at = row
        .get::<_, Option<String>>(10)?
        .map(parse_timestamp)
        .transpose()
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                10,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })?;

    Ok(JobRecord {
        job_id: row.get(0)?,
        queue_name: row.get(1)?,
        job_name: row.get(2)?,
        agent_id: row.get(3)?,
        status,
        attempt_number: row.get::<_, i64>(5)? as u32,
        error_message: row.get(6)?,
        output,
        created_at,
        updated_at,
        completed_at,
    })
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::NamedTempFile;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn payload() -> Value {
        serde_json::json!({"agent_id": "host-42", "command_type": "report_now"})
    }

    fn new_job<'a>(id: &'a str, payload: &'a Value) -> NewJob<'a> {
        NewJob {
            id,
            queue_name: "agent-commands",
            job_name: "report_now",
            agent_id: "host-42",
            payload,
            policy: RetryPolicy::new(3, 2_000, 2),
        }
    }

    #[test]
    fn migration_creates_queue_tables() {
        let db = QueueStore::open_in_memory().expect("open db");

        for table in ["agents", "jobs", "job_history"] {
            assert!(db.table_exists(table).expect("table check"), "{table}");
        }
        assert_eq!(
            db.schema_version().expect("schema version"),
            QUEUE_SCHEMA_VERSION
        );
    }

    #[test]
    fn credentials_verify_only_on_exact_match() {
        let db = QueueStore::open_in_memory().expect("open db");
        db.upsert_agent_credentials("host-42", "s3cret", Some("web-01"), ts())
            .expect("upsert credentials");

        assert!(db.verify_credentials("host-42", "s3cret").expect("verify"));
        assert!(!db.verify_credentials("host-42", "wrong").expect("verify"));
        assert!(!db.verify_credentials("host-43", "s3cret").expect("verify"));
    }

    #[test]
    fn enqueue_then_claim_marks_active() {
        let file = NamedTempFile::new().expect("temp db");
        let mut db = QueueStore::open(file.path()).expect("open db");
        let payload = payload();
        db.enqueue(&new_job("job-1", &payload), ts()).expect("enqueue");

        let claimed = db.claim_due(ts(), 10).expect("claim");
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, "job-1");
        assert_eq!(claimed[0].attempts_made, 0);
        assert_eq!(claimed[0].policy.max_attempts, 3);

        // Active jobs must not be claimed again.
        assert!(db.claim_due(ts(), 10).expect("claim").is_empty());

        let counts = db.queue_counts("agent-commands").expect("counts");
        assert_eq!(counts.active, 1);
        assert_eq!(counts.waiting, 0);
    }

    #[test]
    fn delayed_job_stays_invisible_until_due() {
        let mut db = QueueStore::open_in_memory().expect("open db");
        let payload = payload();
        db.enqueue(&new_job("job-1", &payload), ts()).expect("enqueue");
        let claimed = db.claim_due(ts(), 10).expect("claim");
        assert_eq!(claimed.len(), 1);

        let run_at = QueueStore::retry_at(&claimed[0], 1, ts());
        assert_eq!(run_at, ts() + ChronoDuration::milliseconds(2_000));
        db.mark_delayed("job-1", 1, run_at, ts()).expect("delay");

        assert!(db.claim_due(ts(), 10).expect("claim early").is_empty());
        let reclaimed = db.claim_due(run_at, 10).expect("claim due");
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempts_made, 1);
    }

    #[test]
    fn history_upsert_keeps_one_row_per_job() {
        let db = QueueStore::open_in_memory().expect("open db");

        let mut record = JobRecord {
            job_id: "job-1".to_string(),
            queue_name: "agent-commands".to_string(),
            job_name: "report_now".to_string(),
            agent_id: "host-42".to_string(),
            status: JobStatus::Failed,
            attempt_number: 1,
            error_message: Some("agent not connected".to_string()),
            output: None,
            created_at: ts(),
            updated_at: ts(),
            completed_at: None,
        };
        db.upsert_history(&record).expect("first attempt");

        record.attempt_number = 2;
        record.status = JobStatus::Completed;
        record.error_message = None;
        record.output = Some(serde_json::json!({"delivered": true}));
        record.completed_at = Some(ts());
        db.upsert_history(&record).expect("second attempt");

        assert_eq!(db.history_rows_for_job("job-1").expect("rows"), 1);
        let loaded = db
            .job_history("job-1")
            .expect("load")
            .expect("record present");
        assert_eq!(loaded.attempt_number, 2);
        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(loaded.error_message, None);
        assert_eq!(loaded.output, Some(serde_json::json!({"delivered": true})));
        assert_eq!(loaded.created_at, ts());
    }

    #[test]
    fn enqueue_seeds_pending_history() {
        let db = QueueStore::open_in_memory().expect("open db");
        let payload = payload();
        db.enqueue(&new_job("job-1", &payload), ts()).expect("enqueue");

        let records = db.history_for_agent("host-42", 10).expect("history");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, JobStatus::Pending);
        assert_eq!(records[0].attempt_number, 0);
    }

    #[test]
    fn queue_counts_cover_terminal_states() {
        let mut db = QueueStore::open_in_memory().expect("open db");
        let payload = payload();
        for id in ["job-1", "job-2", "job-3"] {
            db.enqueue(&new_job(id, &payload), ts()).expect("enqueue");
        }

        let claimed = db.claim_due(ts(), 2).expect("claim");
        assert_eq!(claimed.len(), 2);
        db.mark_completed("job-1", ts()).expect("complete");
        db.mark_failed("job-2", 3, ts()).expect("fail");

        let counts = db.queue_counts("agent-commands").expect("counts");
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.active, 0);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 3);

        assert_eq!(
            db.queue_names().expect("names"),
            vec!["agent-commands".to_string()]
        );
    }

    #[test]
    fn history_for_queue_orders_newest_first() {
        let db = QueueStore::open_in_memory().expect("open db");
        let base = ts();
        for (idx, id) in ["job-1", "job-2"].iter().enumerate() {
            db.upsert_history(&JobRecord {
                job_id: id.to_string(),
                queue_name: "agent-commands".to_string(),
                job_name: "report_now".to_string(),
                agent_id: "host-42".to_string(),
                status: JobStatus::Completed,
                attempt_number: 1,
                error_message: None,
                output: None,
                created_at: base,
                updated_at: base + ChronoDuration::seconds(idx as i64),
                completed_at: None,
            })
            .expect("upsert");
        }

        let records = db.history_for_queue("agent-commands", 10).expect("history");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].job_id, "job-2");
        assert_eq!(records[1].job_id, "job-1");
    }
}
