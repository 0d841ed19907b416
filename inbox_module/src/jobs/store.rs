use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use std::sync::Arc;

use super::{FailureOutcome, Job, JobKind, JobPointer};
use crate::clock::Clock;
use crate::db::{format_datetime, parse_datetime, Database, StoreError};

const JOB_COLUMNS: &str =
    "id, kind, key, payload, attempts, max_attempts, run_after, created_at, last_error";

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub job_id: i64,
    pub kind: JobKind,
    pub key: String,
    pub payload: Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub dead_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub id: i64,
    pub inserted: bool,
}

/// Durable side of the queue: one row per (kind, key).
#[derive(Clone)]
pub struct JobStore {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl JobStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Inserts the job unless (kind, key) already exists. An existing job that
    /// is parked for a delayed retry is made runnable again.
    pub fn register(
        &self,
        kind: JobKind,
        key: &str,
        payload: &Value,
        max_attempts: u32,
    ) -> Result<Registration, StoreError> {
        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let registration = register_in(&tx, kind, key, payload, max_attempts, self.clock.now())?;
        tx.commit()?;
        Ok(registration)
    }

    pub fn get(&self, id: i64) -> Result<Option<Job>, StoreError> {
        let conn = self.db.connection()?;
        let row = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                JobRow::from_row,
            )
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }

    /// Loads the job and stamps it as claimed, starting its lease.
    pub fn claim(&self, id: i64) -> Result<Option<Job>, StoreError> {
        let conn = self.db.connection()?;
        let row = conn
            .query_row(
                &format!("UPDATE jobs SET claimed_at = ?2 WHERE id = ?1 AND parked = 0 RETURNING {JOB_COLUMNS}"),
                params![id, format_datetime(self.clock.now())],
                JobRow::from_row,
            )
            .optional()?;
        row.map(JobRow::into_job).transpose()
    }

    pub fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.db.connection()?;
        Ok(conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])? > 0)
    }

    /// Bumps attempts and stores the error; at max_attempts the job moves to
    /// `dead_letters`. Otherwise the job is parked until `retry_at` in the
    /// same transaction.
    pub fn record_failure(
        &self,
        id: i64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<FailureOutcome, StoreError> {
        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            "UPDATE jobs SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
            params![id, error],
        )?;
        if updated == 0 {
            return Ok(FailureOutcome::Missing);
        }
        let (attempts, max_attempts): (u32, u32) = tx.query_row(
            "SELECT attempts, max_attempts FROM jobs WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let outcome = if attempts >= max_attempts {
            move_to_dead_letters(&tx, id, &format_datetime(self.clock.now()))?;
            FailureOutcome::DeadLettered { attempts }
        } else {
            tx.execute(
                "UPDATE jobs SET parked = 1, run_after = ?2, claimed_at = NULL WHERE id = ?1",
                params![id, format_datetime(retry_at)],
            )?;
            FailureOutcome::Retrying { attempts }
        };
        tx.commit()?;
        Ok(outcome)
    }

    /// Dead-letters a job regardless of its remaining attempts.
    pub fn bury(&self, id: i64, error: &str) -> Result<bool, StoreError> {
        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            "UPDATE jobs SET attempts = attempts + 1, last_error = ?2 WHERE id = ?1",
            params![id, error],
        )?;
        if updated == 0 {
            return Ok(false);
        }
        move_to_dead_letters(&tx, id, &format_datetime(self.clock.now()))?;
        tx.commit()?;
        Ok(true)
    }

    /// Unparks jobs whose retry time has passed and returns their pointers.
    pub fn take_due_parked(
        &self,
        kind: JobKind,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobPointer>, StoreError> {
        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let pointers = {
            let mut stmt = tx.prepare(
                "SELECT id, key FROM jobs
                 WHERE kind = ?1 AND parked = 1 AND run_after <= ?2
                 ORDER BY run_after ASC, id ASC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![kind.as_str(), format_datetime(now), limit as i64],
                |row| {
                    Ok(JobPointer {
                        id: row.get(0)?,
                        kind,
                        key: row.get(1)?,
                    })
                },
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let now = format_datetime(now);
        for pointer in &pointers {
            tx.execute(
                "UPDATE jobs SET parked = 0, run_after = ?2 WHERE id = ?1",
                params![pointer.id, now],
            )?;
        }
        tx.commit()?;
        Ok(pointers)
    }

    /// Runnable jobs nobody has picked up since `cutoff`: either claimed
    /// and never acked, or made runnable and never claimed. Each returned
    /// job gets a fresh `run_after` so the next sweep skips it.
    pub fn take_stale(
        &self,
        kind: JobKind,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobPointer>, StoreError> {
        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let pointers = {
            let mut stmt = tx.prepare(
                "SELECT id, key FROM jobs
                 WHERE kind = ?1 AND parked = 0 AND COALESCE(claimed_at, run_after) <= ?2
                 ORDER BY id ASC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![kind.as_str(), format_datetime(cutoff), limit as i64],
                |row| {
                    Ok(JobPointer {
                        id: row.get(0)?,
                        kind,
                        key: row.get(1)?,
                    })
                },
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let now = format_datetime(now);
        for pointer in &pointers {
            tx.execute(
                "UPDATE jobs SET run_after = ?2, claimed_at = NULL WHERE id = ?1",
                params![pointer.id, now],
            )?;
        }
        tx.commit()?;
        Ok(pointers)
    }

    pub fn runnable_pointers(&self, kind: JobKind, limit: usize) -> Result<Vec<JobPointer>, StoreError> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, key FROM jobs WHERE kind = ?1 AND parked = 0 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![kind.as_str(), limit as i64], |row| {
            Ok(JobPointer {
                id: row.get(0)?,
                kind,
                key: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn count(&self, kind: JobKind) -> Result<u64, StoreError> {
        let conn = self.db.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE kind = ?1",
            params![kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    pub fn dead_letters(&self, kind: JobKind, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(
            "SELECT job_id, kind, key, payload, attempts, max_attempts, last_error, created_at, dead_at
             FROM dead_letters WHERE kind = ?1 ORDER BY dead_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![kind.as_str(), limit as i64], DeadLetterRow::from_row)?;
        let mut letters = Vec::new();
        for row in rows {
            letters.push(row?.into_dead_letter()?);
        }
        Ok(letters)
    }

    /// Moves a dead letter back into `jobs` with a fresh attempt budget.
    /// Returns `None` when the letter does not exist or its (kind, key) has
    /// since been re-enqueued.
    pub fn revive_dead_letter(&self, job_id: i64) -> Result<Option<JobPointer>, StoreError> {
        let now = format_datetime(self.clock.now());
        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let letter = tx
            .query_row(
                "SELECT kind, key, payload, max_attempts FROM dead_letters WHERE job_id = ?1",
                params![job_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((kind_raw, key, payload, max_attempts)) = letter else {
            return Ok(None);
        };
        let kind = parse_kind(&kind_raw)?;
        let inserted = tx.execute(
            "INSERT INTO jobs (kind, key, payload, attempts, max_attempts, run_after, created_at, parked)
             VALUES (?1, ?2, ?3, 0, ?4, ?5, ?5, 0)
             ON CONFLICT(kind, key) DO NOTHING",
            params![kind_raw, key, payload, max_attempts, now],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        let id = tx.last_insert_rowid();
        tx.execute("DELETE FROM dead_letters WHERE job_id = ?1", params![job_id])?;
        tx.commit()?;
        Ok(Some(JobPointer { id, kind, key }))
    }
}

/// Registration inside a caller's transaction, so a job can commit together
/// with the rows that make it necessary.
pub(crate) fn register_in(
    conn: &Connection,
    kind: JobKind,
    key: &str,
    payload: &Value,
    max_attempts: u32,
    now: DateTime<Utc>,
) -> Result<Registration, StoreError> {
    let now = format_datetime(now);
    let payload = serde_json::to_string(payload)?;
    let inserted = conn.execute(
        "INSERT INTO jobs (kind, key, payload, attempts, max_attempts, run_after, created_at, parked)
         VALUES (?1, ?2, ?3, 0, ?4, ?5, ?5, 0)
         ON CONFLICT(kind, key) DO NOTHING",
        params![kind.as_str(), key, payload, max_attempts.max(1), now],
    )? == 1;
    if !inserted {
        conn.execute(
            "UPDATE jobs SET parked = 0, run_after = ?3
             WHERE kind = ?1 AND key = ?2 AND parked = 1",
            params![kind.as_str(), key, now],
        )?;
    }
    let id: i64 = conn.query_row(
        "SELECT id FROM jobs WHERE kind = ?1 AND key = ?2",
        params![kind.as_str(), key],
        |row| row.get(0),
    )?;
    Ok(Registration { id, inserted })
}

fn move_to_dead_letters(conn: &Connection, id: i64, dead_at: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT OR REPLACE INTO dead_letters
            (job_id, kind, key, payload, attempts, max_attempts, last_error, created_at, dead_at)
         SELECT id, kind, key, payload, attempts, max_attempts, last_error, created_at, ?2
         FROM jobs WHERE id = ?1",
        params![id, dead_at],
    )?;
    conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
    Ok(())
}

fn parse_kind(raw: &str) -> Result<JobKind, StoreError> {
    raw.parse().map_err(|_| StoreError::invalid("kind", raw))
}

struct JobRow {
    id: i64,
    kind: String,
    key: String,
    payload: String,
    attempts: u32,
    max_attempts: u32,
    run_after: String,
    created_at: String,
    last_error: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            key: row.get(2)?,
            payload: row.get(3)?,
            attempts: row.get(4)?,
            max_attempts: row.get(5)?,
            run_after: row.get(6)?,
            created_at: row.get(7)?,
            last_error: row.get(8)?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        Ok(Job {
            id: self.id,
            kind: parse_kind(&self.kind)?,
            key: self.key,
            payload: serde_json::from_str(&self.payload)?,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            run_after: parse_datetime(&self.run_after)?,
            created_at: parse_datetime(&self.created_at)?,
            last_error: self.last_error,
        })
    }
}

struct DeadLetterRow {
    job_id: i64,
    kind: String,
    key: String,
    payload: String,
    attempts: u32,
    max_attempts: u32,
    last_error: Option<String>,
    created_at: String,
    dead_at: String,
}

impl DeadLetterRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            job_id: row.get(0)?,
            kind: row.get(1)?,
            key: row.get(2)?,
            payload: row.get(3)?,
            attempts: row.get(4)?,
            max_attempts: row.get(5)?,
            last_error: row.get(6)?,
            created_at: row.get(7)?,
            dead_at: row.get(8)?,
        })
    }

    fn into_dead_letter(self) -> Result<DeadLetter, StoreError> {
        Ok(DeadLetter {
            job_id: self.job_id,
            kind: parse_kind(&self.kind)?,
            key: self.key,
            payload: serde_json::from_str(&self.payload)?,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            last_error: self.last_error,
            created_at: parse_datetime(&self.created_at)?,
            dead_at: parse_datetime(&self.dead_at)?,
        })
    }
}
