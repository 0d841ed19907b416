use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{JobKind, JobPointer};
use crate::db::{format_datetime, parse_datetime, Database, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("wake-list for {0} disconnected")]
    Disconnected(JobKind),
}

impl From<rusqlite::Error> for BrokerError {
    fn from(err: rusqlite::Error) -> Self {
        BrokerError::Store(StoreError::Sqlite(err))
    }
}

/// Wake-list plus the "oldest pending" lag index, one lane per job kind.
///
/// `pop` hands back the raw wire body so the queue decides what a malformed
/// pointer means.
pub trait QueueBroker: Send + Sync {
    fn push(&self, pointer: &JobPointer, enqueued_at: DateTime<Utc>) -> Result<(), BrokerError>;
    fn pop(&self, kind: JobKind, timeout: Duration) -> Result<Option<String>, BrokerError>;
    fn forget(&self, kind: JobKind, job_id: i64) -> Result<(), BrokerError>;
    fn depth(&self, kind: JobKind) -> Result<usize, BrokerError>;
    fn oldest_enqueued_at(&self, kind: JobKind) -> Result<Option<DateTime<Utc>>, BrokerError>;
}

#[derive(Default)]
struct LagIndex {
    by_job: HashMap<i64, DateTime<Utc>>,
    ordered: BTreeSet<(DateTime<Utc>, i64)>,
}

impl LagIndex {
    fn insert(&mut self, job_id: i64, at: DateTime<Utc>) {
        if self.by_job.contains_key(&job_id) {
            return;
        }
        self.by_job.insert(job_id, at);
        self.ordered.insert((at, job_id));
    }

    fn remove(&mut self, job_id: i64) {
        if let Some(at) = self.by_job.remove(&job_id) {
            self.ordered.remove(&(at, job_id));
        }
    }

    fn oldest(&self) -> Option<DateTime<Utc>> {
        self.ordered.iter().next().map(|(at, _)| *at)
    }
}

struct Lane {
    sender: Sender<String>,
    receiver: Receiver<String>,
}

/// In-process broker. Pointers live only as long as the process; after a
/// restart `JobQueue::recover_orphans` rebuilds them from the durable store.
pub struct MemoryBroker {
    lanes: HashMap<JobKind, Lane>,
    lag: Mutex<HashMap<JobKind, LagIndex>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let lanes = JobKind::ALL
            .iter()
            .map(|kind| {
                let (sender, receiver) = unbounded();
                (*kind, Lane { sender, receiver })
            })
            .collect();
        Self {
            lanes,
            lag: Mutex::new(HashMap::new()),
        }
    }

    fn lane(&self, kind: JobKind) -> Result<&Lane, BrokerError> {
        self.lanes.get(&kind).ok_or(BrokerError::Disconnected(kind))
    }

    fn with_lag<T>(&self, f: impl FnOnce(&mut HashMap<JobKind, LagIndex>) -> T) -> T {
        let mut guard = self.lag.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueBroker for MemoryBroker {
    fn push(&self, pointer: &JobPointer, enqueued_at: DateTime<Utc>) -> Result<(), BrokerError> {
        let body = pointer.encode()?;
        self.with_lag(|lag| lag.entry(pointer.kind).or_default().insert(pointer.id, enqueued_at));
        self.lane(pointer.kind)?
            .sender
            .send(body)
            .map_err(|_| BrokerError::Disconnected(pointer.kind))
    }

    fn pop(&self, kind: JobKind, timeout: Duration) -> Result<Option<String>, BrokerError> {
        match self.lane(kind)?.receiver.recv_timeout(timeout) {
            Ok(body) => Ok(Some(body)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(BrokerError::Disconnected(kind)),
        }
    }

    fn forget(&self, kind: JobKind, job_id: i64) -> Result<(), BrokerError> {
        self.with_lag(|lag| {
            if let Some(index) = lag.get_mut(&kind) {
                index.remove(job_id);
            }
        });
        Ok(())
    }

    fn depth(&self, kind: JobKind) -> Result<usize, BrokerError> {
        Ok(self.lane(kind)?.receiver.len())
    }

    fn oldest_enqueued_at(&self, kind: JobKind) -> Result<Option<DateTime<Utc>>, BrokerError> {
        Ok(self.with_lag(|lag| lag.get(&kind).and_then(LagIndex::oldest)))
    }
}

/// Broker backed by tables in the shared database, so the gateway and any
/// number of worker processes see the same wake-lists.
#[derive(Clone)]
pub struct SqliteBroker {
    db: Database,
    poll_interval: Duration,
}

impl SqliteBroker {
    pub fn new(db: Database, poll_interval: Duration) -> Self {
        Self {
            db,
            poll_interval: poll_interval.max(Duration::from_millis(10)),
        }
    }

    fn try_pop(&self, kind: JobKind) -> Result<Option<String>, StoreError> {
        let conn = self.db.connection()?;
        let body = conn
            .query_row(
                "DELETE FROM queue_pointers
                 WHERE seq = (SELECT seq FROM queue_pointers WHERE kind = ?1 ORDER BY seq ASC LIMIT 1)
                 RETURNING body",
                params![kind.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(body)
    }
}

impl QueueBroker for SqliteBroker {
    fn push(&self, pointer: &JobPointer, enqueued_at: DateTime<Utc>) -> Result<(), BrokerError> {
        let body = pointer.encode()?;
        let mut conn = self.db.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO queue_pointers (kind, body) VALUES (?1, ?2)",
            params![pointer.kind.as_str(), body],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO queue_enqueue_times (kind, job_id, enqueued_at) VALUES (?1, ?2, ?3)",
            params![pointer.kind.as_str(), pointer.id, format_datetime(enqueued_at)],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn pop(&self, kind: JobKind, timeout: Duration) -> Result<Option<String>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_pop(kind) {
                Ok(Some(body)) => return Ok(Some(body)),
                Ok(None) => {}
                Err(err) if err.is_contention() => {
                    debug!("queue pop contention kind={} err={}", kind, err);
                }
                Err(err) => return Err(err.into()),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn forget(&self, kind: JobKind, job_id: i64) -> Result<(), BrokerError> {
        let conn = self.db.connection()?;
        conn.execute(
            "DELETE FROM queue_enqueue_times WHERE kind = ?1 AND job_id = ?2",
            params![kind.as_str(), job_id],
        )?;
        Ok(())
    }

    fn depth(&self, kind: JobKind) -> Result<usize, BrokerError> {
        let conn = self.db.connection()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_pointers WHERE kind = ?1",
            params![kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as usize)
    }

    fn oldest_enqueued_at(&self, kind: JobKind) -> Result<Option<DateTime<Utc>>, BrokerError> {
        let conn = self.db.connection()?;
        let oldest: Option<String> = conn.query_row(
            "SELECT MIN(enqueued_at) FROM queue_enqueue_times WHERE kind = ?1",
            params![kind.as_str()],
            |row| row.get(0),
        )?;
        Ok(oldest.as_deref().map(parse_datetime).transpose()?)
    }
}
