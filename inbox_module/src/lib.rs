pub mod app;
pub mod clock;
pub mod config;
pub mod conversations;
pub mod db;
pub mod ingestion;
pub mod jobs;
pub mod messages;
pub mod platform;
pub mod retry;
pub mod shadow;
pub mod worker;

pub use app::{AppError, Inbox};
pub use config::{InboxConfig, QueueBackend};
pub use jobs::{Job, JobKind, JobQueue};
