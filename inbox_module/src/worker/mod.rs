//! Per-kind job workers: pop, dispatch to the kind's handler, then ack,
//! retry with backoff, or dead-letter.

mod handlers;
mod heartbeat;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub use handlers::{HandlerError, InboxHandlers, JobHandler};
pub use heartbeat::{HeartbeatStore, WorkerHeartbeat, WorkerIdentity};

use crate::clock::Clock;
use crate::db::StoreError;
use crate::jobs::{FailureOutcome, JobKind, JobQueue, QueueError};
use crate::retry::Backoff;

const STALE_SWEEP_SECONDS: i64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Delay before a failed job is redelivered, by attempts already made.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Backoff::Exponential {
                base_seconds: 5,
                factor: 2,
                max_seconds: 600,
            },
        }
    }
}

impl RetryPolicy {
    pub fn run_after(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        let delay = self.backoff.delay(attempts.saturating_sub(1));
        now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed { job_id: i64 },
    Retrying { job_id: i64, attempts: u32, run_after: DateTime<Utc> },
    DeadLettered { job_id: i64 },
    /// The durable record vanished while the job ran.
    Missing { job_id: i64 },
}

pub struct JobWorker {
    kind: JobKind,
    queue: Arc<JobQueue>,
    handler: Arc<dyn JobHandler>,
    heartbeats: HeartbeatStore,
    identity: WorkerIdentity,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    dequeue_timeout: Duration,
    next_stale_sweep: Mutex<Option<DateTime<Utc>>>,
}

impl JobWorker {
    pub fn new(
        kind: JobKind,
        queue: Arc<JobQueue>,
        handler: Arc<dyn JobHandler>,
        heartbeats: HeartbeatStore,
        identity: WorkerIdentity,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        dequeue_timeout: Duration,
    ) -> Self {
        Self {
            kind,
            queue,
            handler,
            heartbeats,
            identity,
            clock,
            retry,
            dequeue_timeout,
            next_stale_sweep: Mutex::new(None),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// One heartbeat, one redelivery sweep and at most one job. Stale jobs
    /// are swept about once a minute.
    pub fn run_once(&self) -> Result<Option<JobOutcome>, WorkerError> {
        if let Err(err) = self.heartbeats.beat(&self.identity, self.kind) {
            warn!("heartbeat failed worker_id={} err={}", self.identity.worker_id, err);
        }
        let redelivered = self.queue.redeliver_due(self.kind)?;
        if redelivered > 0 {
            debug!("redelivered {} {} jobs", redelivered, self.kind);
        }
        self.sweep_stale()?;

        let Some(job) = self.queue.dequeue(self.kind, self.dequeue_timeout)? else {
            return Ok(None);
        };
        let job_id = job.id;
        let outcome = match self.handler.handle(&job) {
            Ok(()) => {
                self.queue.ack_success(job_id)?;
                JobOutcome::Completed { job_id }
            }
            Err(HandlerError::Permanent(err)) => {
                error!("job failed permanently kind={} job_id={} key={} err={}", job.kind, job_id, job.key, err);
                if self.queue.bury(job_id, &err)? {
                    JobOutcome::DeadLettered { job_id }
                } else {
                    JobOutcome::Missing { job_id }
                }
            }
            Err(HandlerError::Transient(err)) => {
                let run_after = self.retry.run_after(self.clock.now(), job.attempts + 1);
                match self.queue.ack_failure_until(job_id, &err, run_after)? {
                    FailureOutcome::Retrying { attempts } => {
                        warn!(
                            "job failed kind={} job_id={} attempts={} retry_at={} err={}",
                            job.kind, job_id, attempts, run_after, err
                        );
                        JobOutcome::Retrying {
                            job_id,
                            attempts,
                            run_after,
                        }
                    }
                    FailureOutcome::DeadLettered { attempts } => {
                        error!(
                            "job dead-lettered kind={} job_id={} attempts={} err={}",
                            job.kind, job_id, attempts, err
                        );
                        JobOutcome::DeadLettered { job_id }
                    }
                    FailureOutcome::Missing => JobOutcome::Missing { job_id },
                }
            }
        };
        Ok(Some(outcome))
    }

    fn sweep_stale(&self) -> Result<(), WorkerError> {
        let now = self.clock.now();
        {
            let mut next = self.next_stale_sweep.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if matches!(*next, Some(at) if now < at) {
                return Ok(());
            }
            *next = Some(now + ChronoDuration::seconds(STALE_SWEEP_SECONDS));
        }
        self.queue.recover_stale(self.kind)?;
        Ok(())
    }

    pub fn run(&self, stop_flag: &AtomicBool, error_backoff: Duration) {
        info!(
            "worker started kind={} worker_id={} host={}",
            self.kind, self.identity.worker_id, self.identity.host
        );
        while !stop_flag.load(Ordering::Relaxed) {
            if let Err(err) = self.run_once() {
                error!("worker loop error kind={} err={}", self.kind, err);
                thread::sleep(error_backoff);
            }
        }
        info!("worker stopped kind={} worker_id={}", self.kind, self.identity.worker_id);
    }
}
