use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use std::env;
use std::sync::Arc;

use crate::clock::Clock;
use crate::db::{format_datetime, parse_datetime, Database, StoreError};
use crate::jobs::JobKind;

/// Who is running a worker loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub worker_id: String,
    pub host: String,
    pub pid: u32,
}

impl WorkerIdentity {
    pub fn current() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            host: resolve_host(),
            pid: std::process::id(),
        }
    }
}

fn resolve_host() -> String {
    env::var("HOSTNAME")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| format!("pid-{}", std::process::id()))
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerHeartbeat {
    pub worker_id: String,
    pub kind: JobKind,
    pub host: String,
    pub pid: u32,
    pub beat_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct HeartbeatStore {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl HeartbeatStore {
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    pub fn beat(&self, identity: &WorkerIdentity, kind: JobKind) -> Result<(), StoreError> {
        let conn = self.db.connection()?;
        conn.execute(
            "INSERT INTO worker_heartbeats (worker_id, kind, host, pid, beat_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(worker_id) DO UPDATE SET kind = excluded.kind, beat_at = excluded.beat_at",
            params![
                identity.worker_id,
                kind.as_str(),
                identity.host,
                identity.pid,
                format_datetime(self.clock.now()),
            ],
        )?;
        Ok(())
    }

    /// Most recent beats first.
    pub fn list(&self) -> Result<Vec<WorkerHeartbeat>, StoreError> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(
            "SELECT worker_id, kind, host, pid, beat_at FROM worker_heartbeats ORDER BY beat_at DESC",
        )?;
        let rows = stmt.query_map([], HeartbeatRow::from_row)?;
        let mut beats = Vec::new();
        for row in rows {
            beats.push(row?.into_heartbeat()?);
        }
        Ok(beats)
    }

    /// Drops beats older than `before`; returns how many went.
    pub fn prune(&self, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.db.connection()?;
        Ok(conn.execute(
            "DELETE FROM worker_heartbeats WHERE beat_at < ?1",
            params![format_datetime(before)],
        )?)
    }
}

struct HeartbeatRow {
    worker_id: String,
    kind: String,
    host: String,
    pid: u32,
    beat_at: String,
}

impl HeartbeatRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            worker_id: row.get(0)?,
            kind: row.get(1)?,
            host: row.get(2)?,
            pid: row.get(3)?,
            beat_at: row.get(4)?,
        })
    }

    fn into_heartbeat(self) -> Result<WorkerHeartbeat, StoreError> {
        Ok(WorkerHeartbeat {
            worker_id: self.worker_id,
            kind: self
                .kind
                .parse()
                .map_err(|_| StoreError::invalid("kind", self.kind.clone()))?,
            host: self.host,
            pid: self.pid,
            beat_at: parse_datetime(&self.beat_at)?,
        })
    }
}
