//! Webhook intake: verify, persist the raw body once, hand it to a worker.

mod raw_events;
mod signature;
pub mod webhook;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use raw_events::{content_hash, NewRawEvent, RawEvent, RawEventStore};
pub use signature::{sign, verify_signature, verify_subscription, SignatureError, SIGNATURE_HEADER};

use crate::clock::Clock;
use crate::db::{Database, StoreError};
use crate::jobs::{JobQueue, JobRequest, QueueError};
use crate::messages::MessageUpsert;
use crate::retry::{retry_on_contention, ContentionPolicy};
use webhook::WebhookPayload;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("signature rejected: {0}")]
    Signature(#[from] SignatureError),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("ignored object type: {0}")]
    IgnoredObject(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("{failed} of {attempted} events failed; first error: {first_error}")]
    Partial {
        attempted: usize,
        failed: usize,
        first_error: String,
    },
}

impl IngestError {
    /// Errors a retry of the same raw event cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            IngestError::InvalidPayload(_) | IngestError::IgnoredObject(_) | IngestError::Signature(_)
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestionSettings {
    pub app_secret: Option<String>,
    /// Empty accepts every `object` value.
    pub accepted_objects: Vec<String>,
    pub contention: ContentionPolicy,
}

#[derive(Debug, Clone)]
pub struct Accepted {
    pub raw_event: RawEvent,
    pub duplicate: bool,
    pub job_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    pub events: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub skipped: usize,
}

pub struct IngestionPipeline {
    raw_events: RawEventStore,
    queue: Arc<JobQueue>,
    upsert: Arc<MessageUpsert>,
    clock: Arc<dyn Clock>,
    settings: IngestionSettings,
}

impl IngestionPipeline {
    pub fn new(
        db: Database,
        queue: Arc<JobQueue>,
        upsert: Arc<MessageUpsert>,
        clock: Arc<dyn Clock>,
        settings: IngestionSettings,
    ) -> Self {
        Self {
            raw_events: RawEventStore::new(db),
            queue,
            upsert,
            clock,
            settings,
        }
    }

    pub fn raw_events(&self) -> &RawEventStore {
        &self.raw_events
    }

    /// Verifies and stores a webhook body, then enqueues its processing.
    /// A body seen before returns the stored row; it is enqueued again only
    /// if it was never processed, which covers an earlier delivery that
    /// stored the body but failed to enqueue.
    pub fn accept(&self, body: &[u8], signature: Option<&str>) -> Result<Accepted, IngestError> {
        verify_signature(
            body,
            signature,
            self.settings.app_secret.as_deref().unwrap_or(""),
        )?;
        let payload: WebhookPayload =
            serde_json::from_slice(body).map_err(|err| IngestError::InvalidPayload(err.to_string()))?;
        let object = payload.object.clone().unwrap_or_default();
        if !self.settings.accepted_objects.is_empty()
            && !self.settings.accepted_objects.iter().any(|o| o == &object)
        {
            return Err(IngestError::IgnoredObject(object));
        }

        let new_event = NewRawEvent {
            object: &object,
            entry_id: payload.first_entry_id(),
            payload: body,
            signature: signature.unwrap_or(""),
            received_at: self.clock.now(),
        };
        let (raw_event, created) = retry_on_contention(&self.settings.contention, "raw_event_insert", || {
            self.raw_events.insert(&new_event)
        })?;
        if !created {
            let job_id = match raw_event.processed_at {
                Some(_) => None,
                None => Some(self.enqueue_ingest(raw_event.id)?),
            };
            debug!(
                "duplicate webhook delivery raw_event_id={} job_id={:?}",
                raw_event.id, job_id
            );
            return Ok(Accepted {
                raw_event,
                duplicate: true,
                job_id,
            });
        }

        let job_id = self.enqueue_ingest(raw_event.id)?;
        info!(
            "accepted webhook raw_event_id={} object={} job_id={}",
            raw_event.id, raw_event.object, job_id
        );
        Ok(Accepted {
            raw_event,
            duplicate: false,
            job_id: Some(job_id),
        })
    }

    fn enqueue_ingest(&self, raw_event_id: i64) -> Result<i64, IngestError> {
        let request = JobRequest::ingest(raw_event_id).map_err(QueueError::from)?;
        Ok(self.queue.enqueue_request(request)?)
    }

    /// Upserts every live message in a stored raw event. Safe to rerun.
    pub fn process(&self, raw_event_id: i64) -> Result<ProcessReport, IngestError> {
        let Some(raw_event) = self.raw_events.get(raw_event_id)? else {
            warn!("raw event not found raw_event_id={}", raw_event_id);
            return Ok(ProcessReport::default());
        };
        let payload: WebhookPayload = serde_json::from_slice(&raw_event.payload)
            .map_err(|err| IngestError::InvalidPayload(err.to_string()))?;

        let mut report = ProcessReport::default();
        let mut failed = 0usize;
        let mut first_error: Option<String> = None;
        for entry in &payload.entry {
            let Some(account_id) = entry.id.as_deref() else {
                report.skipped += entry.messaging_events().len();
                continue;
            };
            for event in entry.messaging_events() {
                report.events += 1;
                if !event.has_live_message() {
                    report.skipped += 1;
                    continue;
                }
                if event.sender_id().is_none() {
                    warn!(
                        "skipping event without sender id raw_event_id={} account_id={}",
                        raw_event_id, account_id
                    );
                    report.skipped += 1;
                    continue;
                }
                match self.upsert.upsert(&event, account_id) {
                    Ok(Some(_)) => report.inserted += 1,
                    Ok(None) => report.duplicates += 1,
                    Err(err) => {
                        warn!(
                            "message upsert failed raw_event_id={} account_id={} err={}",
                            raw_event_id, account_id, err
                        );
                        failed += 1;
                        first_error.get_or_insert_with(|| err.to_string());
                    }
                }
            }
        }

        if let Some(first_error) = first_error {
            return Err(IngestError::Partial {
                attempted: report.events,
                failed,
                first_error,
            });
        }
        retry_on_contention(&self.settings.contention, "raw_event_processed", || {
            self.raw_events.mark_processed(raw_event_id, self.clock.now())
        })?;
        debug!(
            "processed raw_event_id={} events={} inserted={} duplicates={} skipped={}",
            raw_event_id, report.events, report.inserted, report.duplicates, report.skipped
        );
        Ok(report)
    }

    /// Re-enqueues processing for raw events received at or after `since`.
    pub fn backfill(&self, since: DateTime<Utc>, limit: usize) -> Result<usize, IngestError> {
        let ids = self.raw_events.ids_received_since(since, limit)?;
        for id in &ids {
            self.enqueue_ingest(*id)?;
        }
        info!("backfill enqueued {} raw events since={}", ids.len(), since);
        Ok(ids.len())
    }
}
