//! Wiring of the inbox components around one database.

use std::sync::Arc;

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, InboxConfig, QueueBackend};
use crate::conversations::{ConversationDirectory, ConversationResolver};
use crate::db::{Database, StoreError};
use crate::ingestion::{IngestionPipeline, IngestionSettings};
use crate::jobs::{JobQueue, JobStore, MemoryBroker, QueueBroker, SqliteBroker};
use crate::messages::{AccountIdentities, AttachmentStore, MessageUpsert};
use crate::platform::{GraphClient, PlatformError};
use crate::shadow::ShadowScheduler;
use crate::worker::{HeartbeatStore, InboxHandlers};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

pub struct Inbox {
    pub config: InboxConfig,
    pub db: Database,
    pub clock: Arc<dyn Clock>,
    pub queue: Arc<JobQueue>,
    pub resolver: Arc<ConversationResolver>,
    pub shadow: Arc<ShadowScheduler>,
    pub upsert: Arc<MessageUpsert>,
    pub pipeline: Arc<IngestionPipeline>,
    pub platform: Option<Arc<GraphClient>>,
}

impl Inbox {
    /// Opens the configured database and queue backend. `with_platform`
    /// builds the blocking platform client; processes that never call the
    /// platform (the gateway) skip it.
    pub fn open(config: InboxConfig, with_platform: bool) -> Result<Self, AppError> {
        let db = Database::open(config.db_path.clone())?;
        let broker: Arc<dyn QueueBroker> = match config.queue_backend {
            QueueBackend::Sqlite => Arc::new(SqliteBroker::new(db.clone(), config.queue.poll_interval)),
            QueueBackend::Memory => Arc::new(MemoryBroker::new()),
        };
        let platform = if with_platform {
            Some(Arc::new(GraphClient::new(config.platform.clone())?))
        } else {
            None
        };
        let directory = platform
            .clone()
            .map(|client| client as Arc<dyn ConversationDirectory>);
        let mut inbox = Self::assemble(config, db, broker, Arc::new(SystemClock), directory);
        inbox.platform = platform;
        Ok(inbox)
    }

    /// Builds every component over already-open parts.
    pub fn assemble(
        config: InboxConfig,
        db: Database,
        broker: Arc<dyn QueueBroker>,
        clock: Arc<dyn Clock>,
        directory: Option<Arc<dyn ConversationDirectory>>,
    ) -> Self {
        let queue = Arc::new(JobQueue::new(
            JobStore::new(db.clone(), clock.clone()),
            broker,
            clock.clone(),
            config.contention,
            config.queue.max_attempts,
        )
        .with_claim_lease(config.queue.claim_lease));
        let mut resolver = ConversationResolver::new(db.clone(), clock.clone(), config.contention);
        if let Some(directory) = directory {
            resolver = resolver.with_directory(directory, config.directory_max_pages);
        }
        let resolver = Arc::new(resolver);
        let shadow = Arc::new(ShadowScheduler::new(
            db.clone(),
            clock.clone(),
            config.shadow,
            config.contention,
        ));
        let upsert = Arc::new(MessageUpsert::new(
            db.clone(),
            resolver.clone(),
            queue.clone(),
            shadow.clone(),
            AccountIdentities::new(config.platform.credentials.identity_ids()),
            clock.clone(),
        ));
        let pipeline = Arc::new(IngestionPipeline::new(
            db.clone(),
            queue.clone(),
            upsert.clone(),
            clock.clone(),
            IngestionSettings {
                app_secret: config.app_secret.clone(),
                accepted_objects: config.accepted_objects.clone(),
                contention: config.contention,
            },
        ));
        Self {
            config,
            db,
            clock,
            queue,
            resolver,
            shadow,
            upsert,
            pipeline,
            platform: None,
        }
    }

    pub fn heartbeats(&self) -> HeartbeatStore {
        HeartbeatStore::new(self.db.clone(), self.clock.clone())
    }

    /// Job handlers backed by the platform client, if one was built.
    pub fn handlers(&self) -> Result<InboxHandlers, AppError> {
        let client = match &self.platform {
            Some(client) => client.clone(),
            None => Arc::new(GraphClient::new(self.config.platform.clone())?),
        };
        Ok(InboxHandlers::new(
            self.pipeline.clone(),
            self.resolver.clone(),
            self.upsert.clone(),
            AttachmentStore::new(self.db.clone()),
            client.clone(),
            client,
            self.config.platform.media_root.clone(),
            self.clock.clone(),
        ))
    }
}
