use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::conversations::{ConversationResolver, ResolveError};
use crate::db::StoreError;
use crate::ingestion::{IngestError, IngestionPipeline};
use crate::jobs::{FetchMediaJob, HydrateConversationJob, IngestJob, Job, JobKind};
use crate::messages::{AttachmentStore, FetchStatus, MessageUpsert, UpsertError};
use crate::platform::{MediaFetcher, MessageHistory, PlatformError};

const DEFAULT_HYDRATE_MESSAGES: u32 = 200;
const MAX_HYDRATE_PAGES: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Retried with backoff until the job runs out of attempts.
    #[error("transient: {0}")]
    Transient(String),
    /// Dead-lettered without further attempts.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl From<IngestError> for HandlerError {
    fn from(err: IngestError) -> Self {
        if err.is_permanent() {
            HandlerError::Permanent(err.to_string())
        } else {
            HandlerError::Transient(err.to_string())
        }
    }
}

impl From<PlatformError> for HandlerError {
    fn from(err: PlatformError) -> Self {
        if err.is_transient() {
            HandlerError::Transient(err.to_string())
        } else {
            HandlerError::Permanent(err.to_string())
        }
    }
}

impl From<ResolveError> for HandlerError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Platform(inner) => inner.into(),
            ResolveError::Store(inner) => HandlerError::Transient(inner.to_string()),
            other => HandlerError::Permanent(other.to_string()),
        }
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError::Transient(err.to_string())
    }
}

impl From<UpsertError> for HandlerError {
    fn from(err: UpsertError) -> Self {
        match err {
            UpsertError::Resolve(inner) => inner.into(),
            other => HandlerError::Transient(other.to_string()),
        }
    }
}

fn bad_payload(job: &Job, err: serde_json::Error) -> HandlerError {
    HandlerError::Permanent(format!("invalid {} payload: {}", job.kind, err))
}

pub trait JobHandler: Send + Sync {
    fn handle(&self, job: &Job) -> Result<(), HandlerError>;
}

/// Handlers for every [`JobKind`].
pub struct InboxHandlers {
    pipeline: Arc<IngestionPipeline>,
    resolver: Arc<ConversationResolver>,
    upsert: Arc<MessageUpsert>,
    attachments: AttachmentStore,
    media: Arc<dyn MediaFetcher>,
    history: Arc<dyn MessageHistory>,
    media_root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl InboxHandlers {
    pub fn new(
        pipeline: Arc<IngestionPipeline>,
        resolver: Arc<ConversationResolver>,
        upsert: Arc<MessageUpsert>,
        attachments: AttachmentStore,
        media: Arc<dyn MediaFetcher>,
        history: Arc<dyn MessageHistory>,
        media_root: PathBuf,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pipeline,
            resolver,
            upsert,
            attachments,
            media,
            history,
            media_root,
            clock,
        }
    }

    fn ingest(&self, job: &Job) -> Result<(), HandlerError> {
        let payload: IngestJob = job.payload_as().map_err(|err| bad_payload(job, err))?;
        let report = self.pipeline.process(payload.raw_event_id)?;
        debug!(
            "ingest job done job_id={} raw_event_id={} inserted={}",
            job.id, payload.raw_event_id, report.inserted
        );
        Ok(())
    }

    fn fetch_media(&self, job: &Job) -> Result<(), HandlerError> {
        let payload: FetchMediaJob = job.payload_as().map_err(|err| bad_payload(job, err))?;
        let Some(attachment) = self.attachments.get(payload.message_id, payload.position)? else {
            return Err(HandlerError::Permanent(format!(
                "attachment {}:{} not found",
                payload.message_id, payload.position
            )));
        };
        if attachment.fetch_status == FetchStatus::Ok {
            return Ok(());
        }
        let Some(url) = attachment.source_url.as_deref() else {
            warn!(
                "attachment has no source url message_id={} position={}",
                payload.message_id, payload.position
            );
            self.attachments.mark_failed(
                payload.message_id,
                payload.position,
                "no source url",
                self.clock.now(),
            )?;
            return Ok(());
        };

        let bytes = match self.media.fetch_bytes(url) {
            Ok(bytes) => bytes,
            Err(err) => {
                if !err.is_transient() {
                    self.attachments.mark_failed(
                        payload.message_id,
                        payload.position,
                        &err.to_string(),
                        self.clock.now(),
                    )?;
                }
                return Err(err.into());
            }
        };

        let dir = self.media_root.join(payload.message_id.to_string());
        let path = dir.join(payload.position.to_string());
        fs::create_dir_all(&dir)
            .and_then(|_| fs::write(&path, &bytes))
            .map_err(|err| HandlerError::Transient(format!("media write failed: {err}")))?;
        self.attachments.mark_fetched(
            payload.message_id,
            payload.position,
            &path.to_string_lossy(),
            self.clock.now(),
        )?;
        debug!(
            "media stored message_id={} position={} bytes={}",
            payload.message_id,
            payload.position,
            bytes.len()
        );
        Ok(())
    }

    fn hydrate(&self, job: &Job) -> Result<(), HandlerError> {
        let payload: HydrateConversationJob = job.payload_as().map_err(|err| bad_payload(job, err))?;
        let conversation = self
            .resolver
            .find(payload.conversation_id)?
            .ok_or_else(|| {
                HandlerError::Permanent(format!("conversation {} not found", payload.conversation_id))
            })?;
        let external_id = self.resolver.discover_external_id(conversation.id, None)?;
        let wanted = payload.max_messages.unwrap_or(DEFAULT_HYDRATE_MESSAGES) as usize;

        let mut events = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_HYDRATE_PAGES {
            let page = self.history.list_messages(&external_id, cursor.as_deref())?;
            events.extend(page.messages);
            if events.len() >= wanted {
                events.truncate(wanted);
                break;
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let mut inserted = 0usize;
        for event in events.iter().rev() {
            if self.upsert.upsert(event, &conversation.account_id)?.is_some() {
                inserted += 1;
            }
        }
        self.resolver.mark_hydrated(conversation.id)?;
        info!(
            "conversation hydrated conversation_id={} external_id={} fetched={} inserted={}",
            conversation.id,
            external_id,
            events.len(),
            inserted
        );
        Ok(())
    }
}

impl JobHandler for InboxHandlers {
    fn handle(&self, job: &Job) -> Result<(), HandlerError> {
        match job.kind {
            JobKind::Ingest => self.ingest(job),
            JobKind::FetchMedia => self.fetch_media(job),
            JobKind::HydrateConversation => self.hydrate(job),
        }
    }
}
