use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::sync::Arc;
use tracing::{info, warn};

use super::types::{NewShadowReply, ReplyStatus, ShadowReply, ShadowState, ShadowStatus};
use super::ShadowPolicy;
use crate::clock::Clock;
use crate::db::{format_datetime, parse_datetime, parse_optional_datetime, Database, StoreError};
use crate::retry::{retry_on_contention, ContentionPolicy};

const STATE_COLUMNS: &str = "conversation_id, status, last_inbound_timestamp_ms, next_attempt_at,
    postpone_count, escalation_reason, last_error, updated_at";

const REPLY_COLUMNS: &str =
    "id, conversation_id, reply_text, model, confidence, reason, attempt_no, status, created_at";

#[derive(Debug, thiserror::Error)]
pub enum ShadowError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("no shadow state for conversation {0}")]
    NotFound(i64),
    #[error("cannot {action} conversation {conversation_id} in status {from}")]
    InvalidTransition {
        conversation_id: i64,
        from: ShadowStatus,
        action: &'static str,
    },
}

impl From<rusqlite::Error> for ShadowError {
    fn from(err: rusqlite::Error) -> Self {
        ShadowError::Store(StoreError::Sqlite(err))
    }
}

/// Per-conversation debounce/postpone state machine.
///
/// ```text
/// pending -> running -> pending | paused | exhausted | error
/// paused  -> running
/// needs_link, needs_admin: parked until cleared
/// ```
pub struct ShadowScheduler {
    db: Database,
    clock: Arc<dyn Clock>,
    policy: ShadowPolicy,
    contention: ContentionPolicy,
}

impl ShadowScheduler {
    pub fn new(db: Database, clock: Arc<dyn Clock>, policy: ShadowPolicy, contention: ContentionPolicy) -> Self {
        Self {
            db,
            clock,
            policy,
            contention,
        }
    }

    pub fn policy(&self) -> &ShadowPolicy {
        &self.policy
    }

    /// Records an inbound message and pushes the next attempt out by the
    /// debounce (at least one second). A running attempt and the parked
    /// states keep their status; a running attempt also keeps its claim time.
    pub fn touch(
        &self,
        conversation_id: i64,
        inbound_timestamp_ms: Option<i64>,
        debounce_seconds: u64,
    ) -> Result<ShadowStatus, ShadowError> {
        let now = self.clock.now();
        let status = retry_on_contention(&self.contention, "shadow_touch", || {
            let conn = self.db.connection()?;
            touch_row(&conn, conversation_id, inbound_timestamp_ms, debounce_seconds, now)
        })?;
        Ok(status)
    }

    /// [`ShadowScheduler::touch`] with the policy debounce, inside the
    /// caller's transaction.
    pub(crate) fn touch_in(
        &self,
        conn: &Connection,
        conversation_id: i64,
        inbound_timestamp_ms: Option<i64>,
    ) -> Result<ShadowStatus, StoreError> {
        touch_row(
            conn,
            conversation_id,
            inbound_timestamp_ms,
            self.policy.debounce_seconds,
            self.clock.now(),
        )
    }

    /// Makes the conversation due immediately, ahead of anything scheduled
    /// for now, and clears escalation and postpone history.
    pub fn force_retry(&self, conversation_id: i64) -> Result<(), ShadowError> {
        let now = self.clock.now();
        let next_attempt = now - Duration::seconds(1);
        retry_on_contention(&self.contention, "shadow_force_retry", || {
            let conn = self.db.connection()?;
            conn.execute(
                "INSERT INTO shadow_states (conversation_id, status, next_attempt_at, postpone_count, updated_at)
                 VALUES (?1, 'pending', ?2, 0, ?3)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                    status = 'pending',
                    next_attempt_at = excluded.next_attempt_at,
                    postpone_count = 0,
                    escalation_reason = NULL,
                    last_error = NULL,
                    updated_at = excluded.updated_at",
                params![conversation_id, format_datetime(next_attempt), format_datetime(now)],
            )?;
            Ok(())
        })?;
        info!("shadow force retry conversation_id={}", conversation_id);
        Ok(())
    }

    pub fn escalate(&self, conversation_id: i64, reason: &str) -> Result<(), ShadowError> {
        let now = format_datetime(self.clock.now());
        retry_on_contention(&self.contention, "shadow_escalate", || {
            let conn = self.db.connection()?;
            conn.execute(
                "INSERT INTO shadow_states (conversation_id, status, postpone_count, escalation_reason, updated_at)
                 VALUES (?1, 'needs_admin', 0, ?2, ?3)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                    status = 'needs_admin',
                    next_attempt_at = NULL,
                    escalation_reason = excluded.escalation_reason,
                    updated_at = excluded.updated_at",
                params![conversation_id, reason, now],
            )?;
            Ok(())
        })?;
        info!("shadow escalated conversation_id={} reason={}", conversation_id, reason);
        Ok(())
    }

    pub fn resolve_escalation(&self, conversation_id: i64) -> Result<bool, ShadowError> {
        let now = format_datetime(self.clock.now());
        Ok(self.update_where(
            "shadow_resolve_escalation",
            "UPDATE shadow_states SET status = 'pending', next_attempt_at = ?2, postpone_count = 0,
                escalation_reason = NULL, updated_at = ?2
             WHERE conversation_id = ?1 AND status = 'needs_admin'",
            conversation_id,
            &now,
        )?)
    }

    /// Parks the conversation until a product/ad link is attached. An
    /// escalation takes precedence and is left alone.
    pub fn mark_needs_link(&self, conversation_id: i64) -> Result<bool, ShadowError> {
        let now = format_datetime(self.clock.now());
        let updated = retry_on_contention(&self.contention, "shadow_mark_needs_link", || {
            let conn = self.db.connection()?;
            Ok(conn.execute(
                "INSERT INTO shadow_states (conversation_id, status, postpone_count, updated_at)
                 VALUES (?1, 'needs_link', 0, ?2)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                    status = 'needs_link',
                    next_attempt_at = NULL,
                    updated_at = excluded.updated_at
                 WHERE shadow_states.status != 'needs_admin'",
                params![conversation_id, now],
            )?)
        })?;
        Ok(updated > 0)
    }

    pub fn clear_needs_link(&self, conversation_id: i64) -> Result<bool, ShadowError> {
        let now = format_datetime(self.clock.now());
        Ok(self.update_where(
            "shadow_clear_needs_link",
            "UPDATE shadow_states SET status = 'pending', next_attempt_at = ?2, updated_at = ?2
             WHERE conversation_id = ?1 AND status = 'needs_link'",
            conversation_id,
            &now,
        )?)
    }

    pub fn get(&self, conversation_id: i64) -> Result<Option<ShadowState>, ShadowError> {
        let conn = self.db.connection()?;
        let row = conn
            .query_row(
                &format!("SELECT {STATE_COLUMNS} FROM shadow_states WHERE conversation_id = ?1"),
                params![conversation_id],
                StateRow::from_row,
            )
            .optional()?;
        Ok(row.map(StateRow::into_state).transpose()?)
    }

    /// States ready for an attempt, oldest `next_attempt_at` first. A
    /// `running` state whose claim is older than the lease counts as
    /// abandoned and is due again.
    pub fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<ShadowState>, ShadowError> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM shadow_states
             WHERE (status IN ('pending', 'paused') AND next_attempt_at IS NOT NULL AND next_attempt_at <= ?1)
                OR (status = 'running' AND updated_at <= ?2)
             ORDER BY COALESCE(next_attempt_at, updated_at) ASC, conversation_id ASC
             LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![format_datetime(now), format_datetime(self.lease_cutoff(now)), limit as i64],
            StateRow::from_row,
        )?;
        let mut states = Vec::new();
        for row in rows {
            states.push(row?.into_state()?);
        }
        Ok(states)
    }

    /// Claims a due state for one worker. False when another worker (or an
    /// admin action) got there first. An abandoned `running` claim past the
    /// lease can be taken over.
    pub fn begin_attempt(&self, conversation_id: i64) -> Result<bool, ShadowError> {
        let now = self.clock.now();
        let cutoff = format_datetime(self.lease_cutoff(now));
        let now = format_datetime(now);
        let updated = retry_on_contention(&self.contention, "shadow_begin_attempt", || {
            let conn = self.db.connection()?;
            Ok(conn.execute(
                "UPDATE shadow_states SET status = 'running', next_attempt_at = NULL, updated_at = ?2
                 WHERE conversation_id = ?1
                   AND (status IN ('pending', 'paused') OR (status = 'running' AND updated_at <= ?3))",
                params![conversation_id, now, cutoff],
            )?)
        })?;
        Ok(updated > 0)
    }

    fn lease_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(self.policy.running_lease_seconds.max(1) as i64)
    }

    /// Soft failure: counts a postponement and schedules the next attempt
    /// from the backoff, or exhausts the state once the ceiling is exceeded.
    pub fn postpone(&self, conversation_id: i64) -> Result<ShadowStatus, ShadowError> {
        let now = self.clock.now();
        let ceiling = self.policy.postpone_ceiling;
        let backoff = self.policy.postpone_backoff;
        let outcome = retry_on_contention(&self.contention, "shadow_postpone", || {
            let mut conn = self.db.connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current: Option<(String, u32)> = tx
                .query_row(
                    "SELECT status, postpone_count FROM shadow_states WHERE conversation_id = ?1",
                    params![conversation_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((status_raw, count)) = current else {
                return Ok(Err(ShadowError::NotFound(conversation_id)));
            };
            let status = parse_status(&status_raw)?;
            if !matches!(
                status,
                ShadowStatus::Pending | ShadowStatus::Paused | ShadowStatus::Running
            ) {
                return Ok(Err(ShadowError::InvalidTransition {
                    conversation_id,
                    from: status,
                    action: "postpone",
                }));
            }
            // `ceiling` postponements are allowed; the next one exhausts.
            let (next_status, postponed, next_attempt) = if count >= ceiling {
                (ShadowStatus::Exhausted, count, None)
            } else {
                let delay = Duration::from_std(backoff.delay(count)).unwrap_or(Duration::zero());
                (ShadowStatus::Paused, count + 1, Some(format_datetime(now + delay)))
            };
            tx.execute(
                "UPDATE shadow_states SET status = ?2, postpone_count = ?3, next_attempt_at = ?4, updated_at = ?5
                 WHERE conversation_id = ?1",
                params![
                    conversation_id,
                    next_status.as_str(),
                    postponed,
                    next_attempt,
                    format_datetime(now),
                ],
            )?;
            tx.commit()?;
            Ok(Ok(next_status))
        })??;
        if outcome == ShadowStatus::Exhausted {
            warn!("shadow attempts exhausted conversation_id={}", conversation_id);
        }
        Ok(outcome)
    }

    /// Ends a running attempt. The optional reply is recorded; the state
    /// returns to pending and only a new inbound message (including one
    /// that arrived during the attempt) re-arms it. Returns the recorded
    /// reply id.
    pub fn complete_attempt(
        &self,
        conversation_id: i64,
        reply: Option<&NewShadowReply>,
    ) -> Result<Option<i64>, ShadowError> {
        let now = format_datetime(self.clock.now());
        Ok(retry_on_contention(&self.contention, "shadow_complete_attempt", || {
            let mut conn = self.db.connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let reply_id = match reply {
                Some(reply) => Some(insert_reply_in(&tx, conversation_id, reply, &now)?),
                None => None,
            };
            tx.execute(
                "UPDATE shadow_states SET status = 'pending', postpone_count = 0,
                    last_error = NULL, updated_at = ?2
                 WHERE conversation_id = ?1 AND status = 'running'",
                params![conversation_id, now],
            )?;
            tx.commit()?;
            Ok(reply_id)
        })?)
    }

    /// Hard failure of a running attempt.
    pub fn fail_attempt(&self, conversation_id: i64, error: &str) -> Result<bool, ShadowError> {
        let now = format_datetime(self.clock.now());
        let updated = retry_on_contention(&self.contention, "shadow_fail_attempt", || {
            let conn = self.db.connection()?;
            Ok(conn.execute(
                "UPDATE shadow_states SET status = 'error', last_error = ?2, next_attempt_at = NULL, updated_at = ?3
                 WHERE conversation_id = ?1 AND status = 'running'",
                params![conversation_id, error, now],
            )?)
        })?;
        Ok(updated > 0)
    }

    /// Parks a running attempt on a missing product link.
    pub fn park_needs_link(&self, conversation_id: i64) -> Result<bool, ShadowError> {
        let now = format_datetime(self.clock.now());
        Ok(self.update_where(
            "shadow_park_needs_link",
            "UPDATE shadow_states SET status = 'needs_link', next_attempt_at = NULL, updated_at = ?2
             WHERE conversation_id = ?1 AND status = 'running'",
            conversation_id,
            &now,
        )?)
    }

    pub fn record_reply(&self, conversation_id: i64, reply: &NewShadowReply) -> Result<i64, ShadowError> {
        let now = format_datetime(self.clock.now());
        Ok(retry_on_contention(&self.contention, "shadow_record_reply", || {
            let conn = self.db.connection()?;
            insert_reply_in(&conn, conversation_id, reply, &now)
        })?)
    }

    pub fn update_reply_status(&self, reply_id: i64, status: ReplyStatus) -> Result<bool, ShadowError> {
        let updated = retry_on_contention(&self.contention, "shadow_update_reply", || {
            let conn = self.db.connection()?;
            Ok(conn.execute(
                "UPDATE shadow_replies SET status = ?2 WHERE id = ?1",
                params![reply_id, status.as_str()],
            )?)
        })?;
        Ok(updated > 0)
    }

    pub fn latest_reply(&self, conversation_id: i64) -> Result<Option<ShadowReply>, ShadowError> {
        let conn = self.db.connection()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {REPLY_COLUMNS} FROM shadow_replies WHERE conversation_id = ?1 ORDER BY id DESC LIMIT 1"
                ),
                params![conversation_id],
                ReplyRow::from_row,
            )
            .optional()?;
        Ok(row.map(ReplyRow::into_reply).transpose()?)
    }

    fn update_where(
        &self,
        label: &str,
        sql: &str,
        conversation_id: i64,
        now: &str,
    ) -> Result<bool, StoreError> {
        let updated = retry_on_contention(&self.contention, label, || {
            let conn = self.db.connection()?;
            Ok(conn.execute(sql, params![conversation_id, now])?)
        })?;
        Ok(updated > 0)
    }
}

fn touch_row(
    conn: &Connection,
    conversation_id: i64,
    inbound_timestamp_ms: Option<i64>,
    debounce_seconds: u64,
    now: DateTime<Utc>,
) -> Result<ShadowStatus, StoreError> {
    let next_attempt = now + Duration::seconds(debounce_seconds.max(1) as i64);
    let status: String = conn.query_row(
        "INSERT INTO shadow_states
            (conversation_id, status, last_inbound_timestamp_ms, next_attempt_at, postpone_count, updated_at)
         VALUES (?1, 'pending', ?2, ?3, 0, ?4)
         ON CONFLICT(conversation_id) DO UPDATE SET
            last_inbound_timestamp_ms = COALESCE(excluded.last_inbound_timestamp_ms, shadow_states.last_inbound_timestamp_ms),
            next_attempt_at = excluded.next_attempt_at,
            postpone_count = 0,
            status = CASE
                WHEN shadow_states.status IN ('running', 'needs_link', 'needs_admin') THEN shadow_states.status
                ELSE 'pending'
            END,
            updated_at = CASE
                WHEN shadow_states.status = 'running' THEN shadow_states.updated_at
                ELSE excluded.updated_at
            END
         RETURNING status",
        params![
            conversation_id,
            inbound_timestamp_ms,
            format_datetime(next_attempt),
            format_datetime(now),
        ],
        |row| row.get(0),
    )?;
    parse_status(&status)
}

fn insert_reply_in(
    conn: &Connection,
    conversation_id: i64,
    reply: &NewShadowReply,
    now: &str,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO shadow_replies (conversation_id, reply_text, model, confidence, reason, attempt_no, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            conversation_id,
            reply.text,
            reply.model,
            reply.confidence,
            reply.reason,
            reply.attempt_no,
            reply.status.as_str(),
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn parse_status(raw: &str) -> Result<ShadowStatus, StoreError> {
    raw.parse().map_err(|raw: String| StoreError::invalid("status", raw))
}

struct StateRow {
    conversation_id: i64,
    status: String,
    last_inbound_timestamp_ms: Option<i64>,
    next_attempt_at: Option<String>,
    postpone_count: u32,
    escalation_reason: Option<String>,
    last_error: Option<String>,
    updated_at: String,
}

impl StateRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            conversation_id: row.get(0)?,
            status: row.get(1)?,
            last_inbound_timestamp_ms: row.get(2)?,
            next_attempt_at: row.get(3)?,
            postpone_count: row.get(4)?,
            escalation_reason: row.get(5)?,
            last_error: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_state(self) -> Result<ShadowState, StoreError> {
        Ok(ShadowState {
            conversation_id: self.conversation_id,
            status: parse_status(&self.status)?,
            last_inbound_timestamp_ms: self.last_inbound_timestamp_ms,
            next_attempt_at: parse_optional_datetime(self.next_attempt_at)?,
            postpone_count: self.postpone_count,
            escalation_reason: self.escalation_reason,
            last_error: self.last_error,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}

struct ReplyRow {
    id: i64,
    conversation_id: i64,
    text: String,
    model: Option<String>,
    confidence: Option<f64>,
    reason: Option<String>,
    attempt_no: u32,
    status: String,
    created_at: String,
}

impl ReplyRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            text: row.get(2)?,
            model: row.get(3)?,
            confidence: row.get(4)?,
            reason: row.get(5)?,
            attempt_no: row.get(6)?,
            status: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_reply(self) -> Result<ShadowReply, StoreError> {
        Ok(ShadowReply {
            id: self.id,
            conversation_id: self.conversation_id,
            text: self.text,
            model: self.model,
            confidence: self.confidence,
            reason: self.reason,
            attempt_no: self.attempt_no,
            status: self
                .status
                .parse()
                .map_err(|raw: String| StoreError::invalid("status", raw))?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}
