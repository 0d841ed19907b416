//! Canonical conversation identity.
//!
//! Three identifier schemes point at the same conversation: the internal row
//! id, the legacy `dm:<counterparty>` string, and the platform's own thread
//! id. Every scheme goes through [`ConversationResolver::resolve`].

mod discovery;
mod legacy;
mod resolver;
mod summary;
pub mod thread_id;

use chrono::{DateTime, Utc};
use std::fmt;

pub use discovery::{ConversationDirectory, DirectoryConversation, DirectoryPage};
pub use legacy::{LegacyConversation, MigrationReport};
pub use resolver::{ConversationResolver, ReconcileReport};
pub use summary::ConversationSummary;

pub(crate) use resolver::resolve_or_create_in;
pub(crate) use summary::apply_summary_in;

use crate::db::StoreError;
use crate::platform::PlatformError;

pub const LEGACY_PREFIX: &str = "dm:";

pub fn legacy_id(counterparty_id: &str) -> String {
    format!("{LEGACY_PREFIX}{counterparty_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("conversation participant missing")]
    MissingParticipant,
    #[error("conversation not found: {0}")]
    NotFound(String),
    #[error("no external conversation id for account={account_id} counterparty={counterparty_id}")]
    Unresolved {
        account_id: String,
        counterparty_id: String,
    },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),
}

impl From<rusqlite::Error> for ResolveError {
    fn from(err: rusqlite::Error) -> Self {
        ResolveError::Store(StoreError::Sqlite(err))
    }
}

/// Any of the accepted conversation identifiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationRef {
    Internal(i64),
    Legacy(String),
    External(String),
}

impl ConversationRef {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let Ok(id) = raw.parse::<i64>() {
            return ConversationRef::Internal(id);
        }
        if raw.starts_with(LEGACY_PREFIX) {
            return ConversationRef::Legacy(raw.to_string());
        }
        ConversationRef::External(raw.to_string())
    }
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversationRef::Internal(id) => write!(f, "{id}"),
            ConversationRef::Legacy(raw) | ConversationRef::External(raw) => f.write_str(raw),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasKind {
    Legacy,
    External,
    Merged,
}

impl AliasKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AliasKind::Legacy => "legacy",
            AliasKind::External => "external",
            AliasKind::Merged => "merged",
        }
    }
}

pub(crate) fn merged_alias(conversation_id: i64) -> String {
    format!("conversation:{conversation_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    AlreadySet,
    /// A different id was attached first; it is kept.
    Conflict { existing: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: i64,
    pub account_id: String,
    pub counterparty_id: String,
    pub external_conversation_id: Option<String>,
    pub summary: ConversationSummary,
    pub hydrated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
