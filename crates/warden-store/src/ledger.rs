//! Durable idempotency ledger.
//!
//! Each mutation is one SQL statement guarded by a state predicate, so
//! concurrent duplicate submissions (from this process or another one sharing
//! the database file) race on the database, never on application code.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::{debug, warn};
use warden_core::{
    ChangeNotification, Claim, ErrorKind, IdempotencyLedger, JobFailure, JobKey, JobState,
    JobStatus, LedgerEntry, NewJob, RepoRef, Stage, StageAttempts, WardenError,
};

use crate::db::{db_err, parse_timestamp, timestamp, Database};

const SELECT_COLUMNS: &str = "job_key, repo_owner, repo_name, number, url, notification, state,
    attempts, failure_stage, failure_kind, failure_message, post_claimed_at, comment_url,
    created_at, last_transition_at";

/// SQLite implementation of [`IdempotencyLedger`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use warden_store::{Database, SqliteLedger};
///
/// let ledger = SqliteLedger::new(Arc::new(Database::in_memory().unwrap()));
/// ```
pub struct SqliteLedger {
    db: Arc<Database>,
}

impl SqliteLedger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn fetch(&self, key: &JobKey) -> Result<Option<LedgerEntry>, WardenError> {
        let conn = self.db.conn()?;
        let raw = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM jobs WHERE job_key = ?1"),
                params![key.as_str()],
                raw_job,
            )
            .optional()
            .map_err(db_err)?;
        raw.map(RawJob::into_entry).transpose()
    }
}

#[async_trait]
impl IdempotencyLedger for SqliteLedger {
    async fn claim(&self, job: NewJob) -> Result<Claim, WardenError> {
        let notification = serde_json::to_string(&job.notification)?;
        let attempts = serde_json::to_string(&StageAttempts::default())?;
        let now = timestamp(Utc::now());

        // A failed entry is revived unless a post was attempted for it: the
        // comment may exist on the host, and a second one must never appear.
        let created = {
            let conn = self.db.conn()?;
            conn.execute(
                "INSERT INTO jobs (job_key, repo_owner, repo_name, number, url, notification,
                                   state, attempts, created_at, last_transition_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'received', ?7, ?8, ?8)
                 ON CONFLICT(job_key) DO UPDATE SET
                    notification = excluded.notification,
                    url = excluded.url,
                    state = 'received',
                    attempts = excluded.attempts,
                    failure_stage = NULL,
                    failure_kind = NULL,
                    failure_message = NULL,
                    comment_url = NULL,
                    last_transition_at = excluded.last_transition_at
                 WHERE jobs.state = 'failed' AND jobs.post_claimed_at IS NULL",
                params![
                    job.key.as_str(),
                    job.notification.repository.owner,
                    job.notification.repository.name,
                    job.notification.number as i64,
                    job.notification.url,
                    notification,
                    attempts,
                    now,
                ],
            )
            .map_err(db_err)?
                == 1
        };

        let entry = self.fetch(&job.key)?.ok_or_else(|| {
            WardenError::Internal(format!("ledger entry {} vanished after claim", job.key))
        })?;

        if created {
            debug!(job_key = job.key.short(), "ledger entry created");
            Ok(Claim::Created(entry))
        } else {
            debug!(job_key = job.key.short(), state = %entry.status.state, "ledger entry exists");
            Ok(Claim::Existing(entry))
        }
    }

    async fn advance(
        &self,
        key: &JobKey,
        state: JobState,
        attempts: &StageAttempts,
    ) -> Result<(), WardenError> {
        let attempts = serde_json::to_string(attempts)?;
        let conn = self.db.conn()?;
        let changed = conn
            .execute(
                "UPDATE jobs SET state = ?2, attempts = ?3, last_transition_at = ?4
                 WHERE job_key = ?1 AND state NOT IN ('posted', 'failed')",
                params![key.as_str(), state.as_str(), attempts, timestamp(Utc::now())],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(WardenError::Internal(format!(
                "job {key} is unknown or already finished"
            )));
        }
        Ok(())
    }

    async fn claim_post(&self, key: &JobKey) -> Result<bool, WardenError> {
        let conn = self.db.conn()?;
        let changed = conn
            .execute(
                "UPDATE jobs SET post_claimed_at = ?2
                 WHERE job_key = ?1 AND state = 'review_generated' AND post_claimed_at IS NULL",
                params![key.as_str(), timestamp(Utc::now())],
            )
            .map_err(db_err)?;
        Ok(changed == 1)
    }

    async fn release_post(&self, key: &JobKey) -> Result<(), WardenError> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE jobs SET post_claimed_at = NULL WHERE job_key = ?1 AND state != 'posted'",
            params![key.as_str()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn complete(
        &self,
        key: &JobKey,
        comment_url: Option<&str>,
        attempts: &StageAttempts,
    ) -> Result<(), WardenError> {
        let attempts = serde_json::to_string(attempts)?;
        let conn = self.db.conn()?;
        let changed = conn
            .execute(
                "UPDATE jobs SET state = 'posted', comment_url = ?2, attempts = ?3,
                                 last_transition_at = ?4
                 WHERE job_key = ?1 AND state = 'review_generated'
                   AND post_claimed_at IS NOT NULL",
                params![key.as_str(), comment_url, attempts, timestamp(Utc::now())],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(WardenError::Internal(format!(
                "job {key} cannot be marked posted without a post claim"
            )));
        }
        Ok(())
    }

    async fn fail(
        &self,
        key: &JobKey,
        failure: &JobFailure,
        attempts: &StageAttempts,
    ) -> Result<(), WardenError> {
        let attempts = serde_json::to_string(attempts)?;
        let conn = self.db.conn()?;
        let changed = conn
            .execute(
                "UPDATE jobs SET state = 'failed', failure_stage = ?2, failure_kind = ?3,
                                 failure_message = ?4, attempts = ?5, last_transition_at = ?6
                 WHERE job_key = ?1 AND state != 'posted'",
                params![
                    key.as_str(),
                    failure.stage.map(|s| s.as_str()),
                    failure.kind.as_str(),
                    failure.message,
                    attempts,
                    timestamp(Utc::now()),
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            warn!(job_key = key.short(), "fail() found no failable ledger entry");
        }
        Ok(())
    }

    async fn get(&self, key: &JobKey) -> Result<Option<LedgerEntry>, WardenError> {
        self.fetch(key)
    }

    async fn list_unfinished(&self) -> Result<Vec<LedgerEntry>, WardenError> {
        let raws = {
            let conn = self.db.conn()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM jobs
                     WHERE state NOT IN ('posted', 'failed')
                     ORDER BY created_at, job_key"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], raw_job)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows
        };
        raws.into_iter().map(RawJob::into_entry).collect()
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<JobStatus>, WardenError> {
        let raws = {
            let conn = self.db.conn()?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {SELECT_COLUMNS} FROM jobs
                     ORDER BY last_transition_at DESC, job_key
                     LIMIT ?1"
                ))
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![limit as i64], raw_job)
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows
        };
        raws.into_iter()
            .map(|raw| raw.into_entry().map(|entry| entry.status))
            .collect()
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, WardenError> {
        let conn = self.db.conn()?;
        conn.execute(
            "DELETE FROM jobs WHERE state IN ('posted', 'failed') AND last_transition_at < ?1",
            params![timestamp(cutoff)],
        )
        .map_err(db_err)
    }
}

struct RawJob {
    key: String,
    owner: String,
    name: String,
    number: i64,
    url: String,
    notification: String,
    state: String,
    attempts: String,
    failure_stage: Option<String>,
    failure_kind: Option<String>,
    failure_message: Option<String>,
    post_claimed_at: Option<String>,
    comment_url: Option<String>,
    created_at: String,
    last_transition_at: String,
}

fn raw_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        key: row.get(0)?,
        owner: row.get(1)?,
        name: row.get(2)?,
        number: row.get(3)?,
        url: row.get(4)?,
        notification: row.get(5)?,
        state: row.get(6)?,
        attempts: row.get(7)?,
        failure_stage: row.get(8)?,
        failure_kind: row.get(9)?,
        failure_message: row.get(10)?,
        post_claimed_at: row.get(11)?,
        comment_url: row.get(12)?,
        created_at: row.get(13)?,
        last_transition_at: row.get(14)?,
    })
}

impl RawJob {
    fn into_entry(self) -> Result<LedgerEntry, WardenError> {
        let state = JobState::parse(&self.state)
            .ok_or_else(|| WardenError::Database(format!("unknown job state '{}'", self.state)))?;
        let notification: ChangeNotification = serde_json::from_str(&self.notification)?;
        let attempts: StageAttempts = serde_json::from_str(&self.attempts)?;

        let failure = match self.failure_kind.as_deref() {
            Some(kind) => Some(JobFailure {
                stage: self.failure_stage.as_deref().and_then(Stage::parse),
                kind: ErrorKind::parse(kind).unwrap_or(ErrorKind::Internal),
                message: self.failure_message.unwrap_or_default(),
            }),
            None => None,
        };

        let post_claimed_at = self
            .post_claimed_at
            .as_deref()
            .map(parse_timestamp)
            .transpose()?;

        Ok(LedgerEntry {
            status: JobStatus {
                key: JobKey::from_raw(self.key),
                repository: RepoRef::new(self.owner, self.name),
                number: self.number as u64,
                url: self.url,
                state,
                attempts,
                failure,
                comment_url: self.comment_url,
                created_at: parse_timestamp(&self.created_at)?,
                last_transition_at: parse_timestamp(&self.last_transition_at)?,
            },
            notification,
            post_claimed_at,
        })
    }
}
