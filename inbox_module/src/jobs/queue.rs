use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::store::register_in;
use super::{
    BrokerError, FailureOutcome, Job, JobKind, JobPointer, JobRequest, JobStore, QueueBroker,
};
use crate::clock::Clock;
use crate::db::StoreError;
use crate::retry::{retry_on_contention, ContentionPolicy};

const REDELIVER_BATCH: usize = 200;
const RECOVER_LIMIT: usize = 100_000;
const STALE_BATCH: usize = 500;
pub const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueStats {
    pub kind: JobKind,
    pub depth: usize,
    pub durable_jobs: u64,
    pub oldest_pending_age: Option<chrono::Duration>,
}

/// Enqueue/dequeue protocol over a [`JobStore`] and a [`QueueBroker`].
pub struct JobQueue {
    store: JobStore,
    broker: Arc<dyn QueueBroker>,
    clock: Arc<dyn Clock>,
    contention: ContentionPolicy,
    default_max_attempts: u32,
    claim_lease: Duration,
}

impl JobQueue {
    pub fn new(
        store: JobStore,
        broker: Arc<dyn QueueBroker>,
        clock: Arc<dyn Clock>,
        contention: ContentionPolicy,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
            contention,
            default_max_attempts: default_max_attempts.max(1),
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }

    /// How long a job may sit runnable or claimed before `recover_stale`
    /// pushes its pointer again.
    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn enqueue(
        &self,
        kind: JobKind,
        key: &str,
        payload: Value,
        max_attempts: u32,
    ) -> Result<i64, QueueError> {
        let registration = retry_on_contention(&self.contention, "enqueue", || {
            self.store.register(kind, key, &payload, max_attempts)
        })?;
        let pointer = JobPointer {
            id: registration.id,
            kind,
            key: key.to_string(),
        };
        self.broker.push(&pointer, self.clock.now())?;
        debug!(
            "enqueued job id={} kind={} key={} inserted={}",
            registration.id, kind, key, registration.inserted
        );
        Ok(registration.id)
    }

    pub fn enqueue_request(&self, request: JobRequest) -> Result<i64, QueueError> {
        self.enqueue(
            request.kind,
            &request.key,
            request.payload,
            self.default_max_attempts,
        )
    }

    /// Registers the job inside the caller's transaction. The pointer must
    /// be pushed with [`JobQueue::push_registered`] after commit; if that
    /// never happens `recover_stale` finds the job once its lease runs out.
    pub(crate) fn register_in(
        &self,
        conn: &rusqlite::Connection,
        request: &JobRequest,
    ) -> Result<JobPointer, StoreError> {
        let registration = register_in(
            conn,
            request.kind,
            &request.key,
            &request.payload,
            self.default_max_attempts,
            self.clock.now(),
        )?;
        Ok(JobPointer {
            id: registration.id,
            kind: request.kind,
            key: request.key.clone(),
        })
    }

    pub(crate) fn push_registered(&self, pointer: &JobPointer) -> Result<(), QueueError> {
        self.broker.push(pointer, self.clock.now())?;
        Ok(())
    }

    /// Blocks up to `timeout` for a pointer. Stale or malformed pointers
    /// yield `None`.
    pub fn dequeue(&self, kind: JobKind, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let Some(raw) = self.broker.pop(kind, timeout)? else {
            return Ok(None);
        };
        let pointer = match JobPointer::decode(&raw) {
            Ok(pointer) => pointer,
            Err(err) => {
                warn!("dropping malformed queue pointer kind={} err={} body={}", kind, err, raw);
                if let Some(id) = loose_pointer_id(&raw) {
                    self.broker.forget(kind, id)?;
                }
                return Ok(None);
            }
        };
        self.broker.forget(kind, pointer.id)?;
        if pointer.kind != kind {
            warn!(
                "dropping pointer for kind={} found on {} wake-list id={}",
                pointer.kind, kind, pointer.id
            );
            return Ok(None);
        }
        let job = retry_on_contention(&self.contention, "dequeue", || self.store.claim(pointer.id))?;
        if job.is_none() {
            debug!("pointer id={} kind={} has no durable job", pointer.id, kind);
        }
        Ok(job)
    }

    pub fn ack_success(&self, job_id: i64) -> Result<(), QueueError> {
        retry_on_contention(&self.contention, "ack_success", || self.store.delete(job_id))?;
        Ok(())
    }

    /// Records a failed attempt. The job is redelivered by the next
    /// `redeliver_due` sweep unless it ran out of attempts.
    pub fn ack_failure(&self, job_id: i64, error: &str) -> Result<FailureOutcome, QueueError> {
        self.ack_failure_until(job_id, error, self.clock.now())
    }

    /// Records a failed attempt and parks the job until `retry_at`, in one
    /// write.
    pub fn ack_failure_until(
        &self,
        job_id: i64,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<FailureOutcome, QueueError> {
        let outcome = retry_on_contention(&self.contention, "ack_failure", || {
            self.store.record_failure(job_id, error, retry_at)
        })?;
        if let FailureOutcome::DeadLettered { attempts } = outcome {
            warn!("job id={} dead-lettered after attempts={} error={}", job_id, attempts, error);
        }
        Ok(outcome)
    }

    /// Dead-letters at once, for failures another attempt cannot fix.
    pub fn bury(&self, job_id: i64, error: &str) -> Result<bool, QueueError> {
        let buried =
            retry_on_contention(&self.contention, "bury", || self.store.bury(job_id, error))?;
        if buried {
            warn!("job id={} dead-lettered as permanent error={}", job_id, error);
        }
        Ok(buried)
    }

    /// Pushes pointers for parked jobs whose retry time has passed.
    pub fn redeliver_due(&self, kind: JobKind) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let pointers = retry_on_contention(&self.contention, "redeliver_due", || {
            self.store.take_due_parked(kind, now, REDELIVER_BATCH)
        })?;
        for pointer in &pointers {
            self.broker.push(pointer, now)?;
        }
        if !pointers.is_empty() {
            debug!("redelivered {} parked jobs kind={}", pointers.len(), kind);
        }
        Ok(pointers.len())
    }

    /// Re-pushes every runnable job of the kind. Duplicated pointers are
    /// harmless because acked jobs resolve to `None`.
    pub fn recover_orphans(&self, kind: JobKind) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let pointers = retry_on_contention(&self.contention, "recover_orphans", || {
            self.store.runnable_pointers(kind, RECOVER_LIMIT)
        })?;
        for pointer in &pointers {
            self.broker.push(pointer, now)?;
        }
        info!("recovered {} orphaned jobs kind={}", pointers.len(), kind);
        Ok(pointers.len())
    }

    /// Re-pushes jobs whose pointer was lost: claimed by a worker that never
    /// acked, or registered without the pointer ever reaching the broker.
    pub fn recover_stale(&self, kind: JobKind) -> Result<usize, QueueError> {
        let now = self.clock.now();
        let lease = chrono::Duration::from_std(self.claim_lease).unwrap_or_else(|_| chrono::Duration::minutes(15));
        let pointers = retry_on_contention(&self.contention, "recover_stale", || {
            self.store.take_stale(kind, now - lease, now, STALE_BATCH)
        })?;
        for pointer in &pointers {
            self.broker.push(pointer, now)?;
        }
        if !pointers.is_empty() {
            warn!("re-pushed {} stale jobs kind={}", pointers.len(), kind);
        }
        Ok(pointers.len())
    }

    pub fn revive_dead_letter(&self, job_id: i64) -> Result<Option<i64>, QueueError> {
        let pointer = retry_on_contention(&self.contention, "revive_dead_letter", || {
            self.store.revive_dead_letter(job_id)
        })?;
        match pointer {
            Some(pointer) => {
                self.broker.push(&pointer, self.clock.now())?;
                Ok(Some(pointer.id))
            }
            None => Ok(None),
        }
    }

    pub fn stats(&self, kind: JobKind) -> Result<QueueStats, QueueError> {
        let depth = self.broker.depth(kind)?;
        let durable_jobs = self.store.count(kind)?;
        let oldest_pending_age = self
            .broker
            .oldest_enqueued_at(kind)?
            .map(|oldest| self.clock.now() - oldest);
        Ok(QueueStats {
            kind,
            depth,
            durable_jobs,
            oldest_pending_age,
        })
    }
}

fn loose_pointer_id(raw: &str) -> Option<i64> {
    serde_json::from_str::<Value>(raw).ok()?.get("id")?.as_i64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::Database;
    use crate::jobs::{MemoryBroker, SqliteBroker};
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        clock: ManualClock,
        broker: Arc<MemoryBroker>,
        queue: JobQueue,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().expect("tempdir");
        let db = Database::open(temp.path().join("queue.db")).expect("db");
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let broker = Arc::new(MemoryBroker::new());
        let queue = JobQueue::new(
            JobStore::new(db, shared.clone()),
            broker.clone(),
            shared,
            ContentionPolicy::default(),
            3,
        );
        Fixture {
            _temp: temp,
            clock,
            broker,
            queue,
        }
    }

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn enqueue_twice_yields_one_durable_job() {
        let fx = fixture();
        let a = fx.queue.enqueue(JobKind::Ingest, "42", json!({"raw_event_id": 42}), 3).unwrap();
        let b = fx.queue.enqueue(JobKind::Ingest, "42", json!({"raw_event_id": 42}), 3).unwrap();
        assert_eq!(a, b);
        assert_eq!(fx.queue.stats(JobKind::Ingest).unwrap().durable_jobs, 1);

        let job = fx.queue.dequeue(JobKind::Ingest, SHORT).unwrap().expect("job");
        assert_eq!(job.id, a);
        fx.queue.ack_success(job.id).unwrap();
        assert!(fx.queue.dequeue(JobKind::Ingest, SHORT).unwrap().is_none());
        assert!(fx.queue.dequeue(JobKind::Ingest, SHORT).unwrap().is_none());
    }

    #[test]
    fn pointer_without_durable_job_yields_none() {
        let fx = fixture();
        fx.broker
            .push(
                &JobPointer {
                    id: 999,
                    kind: JobKind::Ingest,
                    key: "999".into(),
                },
                fx.clock.now(),
            )
            .unwrap();
        assert!(fx.queue.dequeue(JobKind::Ingest, SHORT).unwrap().is_none());
    }

    #[test]
    fn stats_report_oldest_pending_age() {
        let fx = fixture();
        fx.queue.enqueue(JobKind::FetchMedia, "1:0", json!({}), 3).unwrap();
        fx.clock.advance(chrono::Duration::seconds(40));
        fx.queue.enqueue(JobKind::FetchMedia, "1:1", json!({}), 3).unwrap();
        fx.clock.advance(chrono::Duration::seconds(20));

        let stats = fx.queue.stats(JobKind::FetchMedia).unwrap();
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.oldest_pending_age, Some(chrono::Duration::seconds(60)));

        let job = fx.queue.dequeue(JobKind::FetchMedia, SHORT).unwrap().unwrap();
        assert_eq!(job.key, "1:0");
        let stats = fx.queue.stats(JobKind::FetchMedia).unwrap();
        assert_eq!(stats.oldest_pending_age, Some(chrono::Duration::seconds(20)));
    }

    #[test]
    fn retry_then_redeliver_then_dead_letter() {
        let fx = fixture();
        let id = fx.queue.enqueue(JobKind::Ingest, "5", json!({}), 2).unwrap();
        let job = fx.queue.dequeue(JobKind::Ingest, SHORT).unwrap().unwrap();

        let run_after = fx.clock.now() + chrono::Duration::seconds(30);
        assert_eq!(
            fx.queue.ack_failure_until(job.id, "upstream 502", run_after).unwrap(),
            FailureOutcome::Retrying { attempts: 1 }
        );
        assert_eq!(fx.queue.redeliver_due(JobKind::Ingest).unwrap(), 0);
        assert_eq!(fx.queue.store().get(id).unwrap().unwrap().attempts, 1);

        fx.clock.advance(chrono::Duration::seconds(30));
        assert_eq!(fx.queue.redeliver_due(JobKind::Ingest).unwrap(), 1);
        let job = fx.queue.dequeue(JobKind::Ingest, SHORT).unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("upstream 502"));

        assert_eq!(
            fx.queue.ack_failure(job.id, "upstream 502").unwrap(),
            FailureOutcome::DeadLettered { attempts: 2 }
        );
        assert_eq!(fx.queue.stats(JobKind::Ingest).unwrap().durable_jobs, 0);
        assert_eq!(fx.queue.store().dead_letters(JobKind::Ingest, 5).unwrap().len(), 1);
    }

    #[test]
    fn recover_orphans_repushes_runnable_jobs() {
        let fx = fixture();
        fx.queue.enqueue(JobKind::Ingest, "1", json!({}), 3).unwrap();
        fx.queue.dequeue(JobKind::Ingest, SHORT).unwrap().unwrap();
        // Worker died before acking: the pointer is gone but the row remains.
        assert_eq!(fx.queue.recover_orphans(JobKind::Ingest).unwrap(), 1);
        assert!(fx.queue.dequeue(JobKind::Ingest, SHORT).unwrap().is_some());
    }

    #[test]
    fn claimed_job_without_ack_is_pushed_again_after_the_lease() {
        let fx = fixture();
        let id = fx.queue.enqueue(JobKind::Ingest, "7", json!({}), 3).unwrap();
        fx.queue.dequeue(JobKind::Ingest, SHORT).unwrap().unwrap();

        fx.clock.advance(chrono::Duration::minutes(10));
        assert_eq!(fx.queue.recover_stale(JobKind::Ingest).unwrap(), 0);
        fx.clock.advance(chrono::Duration::minutes(6));
        assert_eq!(fx.queue.recover_stale(JobKind::Ingest).unwrap(), 1);
        assert_eq!(fx.queue.recover_stale(JobKind::Ingest).unwrap(), 0);

        let job = fx.queue.dequeue(JobKind::Ingest, SHORT).unwrap().expect("redelivered");
        assert_eq!(job.id, id);
        fx.queue.ack_success(job.id).unwrap();
        fx.clock.advance(chrono::Duration::hours(1));
        assert_eq!(fx.queue.recover_stale(JobKind::Ingest).unwrap(), 0);
    }

    #[test]
    fn dropped_pointers_leave_the_lag_index() {
        let temp = TempDir::new().expect("tempdir");
        let db = Database::open(temp.path().join("queue.db")).expect("db");
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let queue = JobQueue::new(
            JobStore::new(db.clone(), shared.clone()),
            Arc::new(SqliteBroker::new(db.clone(), Duration::from_millis(10))),
            shared,
            ContentionPolicy::default(),
            3,
        );
        {
            let conn = db.connection().unwrap();
            for (id, body) in [
                (5, r#"{"id":5,"kind":"bogus"}"#),
                (6, r#"{"id":6,"kind":"fetch_media","key":"6"}"#),
            ] {
                conn.execute(
                    "INSERT INTO queue_pointers (kind, body) VALUES ('ingest', ?1)",
                    rusqlite::params![body],
                )
                .unwrap();
                conn.execute(
                    "INSERT INTO queue_enqueue_times (kind, job_id, enqueued_at)
                     VALUES ('ingest', ?1, '2026-02-10T11:00:00.000Z')",
                    rusqlite::params![id],
                )
                .unwrap();
            }
        }
        assert!(queue.stats(JobKind::Ingest).unwrap().oldest_pending_age.is_some());

        assert!(queue.dequeue(JobKind::Ingest, SHORT).unwrap().is_none());
        assert!(queue.dequeue(JobKind::Ingest, SHORT).unwrap().is_none());
        let stats = queue.stats(JobKind::Ingest).unwrap();
        assert_eq!(stats.depth, 0);
        assert_eq!(stats.oldest_pending_age, None);
    }
}
