//! Idempotent message writes and the per-conversation summary projection.

mod attachments;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

pub use attachments::{Attachment, AttachmentKind, AttachmentStore, FetchStatus};

use crate::clock::Clock;
use crate::conversations::thread_id::decode_thread_id;
use crate::conversations::{
    apply_summary_in, resolve_or_create_in, ConversationResolver, ConversationSummary, ResolveError,
};
use crate::db::{format_datetime, parse_datetime, Database, StoreError};
use crate::ingestion::webhook::MessagingEvent;
use crate::jobs::{JobQueue, JobRequest};
use crate::retry::retry_on_contention;
use crate::shadow::ShadowScheduler;
use attachments::{insert_stub_in, AttachmentStub};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => Err(other.to_string()),
        }
    }
}

/// Ids under which the account itself may appear as sender, beyond the
/// webhook entry id (e.g. a page id and a user id for the same inbox).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountIdentities {
    aliases: HashSet<String>,
}

impl AccountIdentities {
    pub fn new<I, S>(aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            aliases: aliases
                .into_iter()
                .map(Into::into)
                .map(|alias: String| alias.trim().to_string())
                .filter(|alias| !alias.is_empty())
                .collect(),
        }
    }

    pub fn is_self(&self, account_id: &str, participant_id: &str) -> bool {
        participant_id == account_id || self.aliases.contains(participant_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpsertError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertedMessage {
    pub message_id: i64,
    pub conversation_id: i64,
    pub direction: Direction,
    pub timestamp_ms: i64,
    pub attachments: usize,
    pub media_jobs: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub external_message_id: String,
    pub conversation_id: Option<i64>,
    pub sender_id: Option<String>,
    pub recipient_id: Option<String>,
    pub direction: Direction,
    pub timestamp_ms: Option<i64>,
    pub text: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct MessageUpsert {
    db: Database,
    resolver: Arc<ConversationResolver>,
    queue: Arc<JobQueue>,
    shadow: Arc<ShadowScheduler>,
    identities: AccountIdentities,
    clock: Arc<dyn Clock>,
}

impl MessageUpsert {
    pub fn new(
        db: Database,
        resolver: Arc<ConversationResolver>,
        queue: Arc<JobQueue>,
        shadow: Arc<ShadowScheduler>,
        identities: AccountIdentities,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            resolver,
            queue,
            shadow,
            identities,
            clock,
        }
    }

    /// Stores the event's message once. Returns `None` when the message id
    /// was already stored or the event carries no usable message.
    pub fn upsert(
        &self,
        event: &MessagingEvent,
        account_id: &str,
    ) -> Result<Option<UpsertedMessage>, UpsertError> {
        let Some(message) = event.message.as_ref() else {
            return Ok(None);
        };
        let Some(mid) = message.mid() else {
            warn!("skipping message without id account_id={}", account_id);
            return Ok(None);
        };
        if self.exists(mid)? {
            debug!("message already stored mid={}", mid);
            return Ok(None);
        }

        let sender_id = event.sender_id();
        let recipient_id = event.recipient_id();
        let direction = match sender_id {
            Some(sender) if message.is_echo || self.identities.is_self(account_id, sender) => Direction::Out,
            None if message.is_echo => Direction::Out,
            _ => Direction::In,
        };
        let counterparty_id = [sender_id, recipient_id]
            .into_iter()
            .flatten()
            .find(|id| !self.identities.is_self(account_id, id))
            .ok_or(ResolveError::MissingParticipant)?;

        let now = self.clock.now();
        let timestamp_ms = event.timestamp.unwrap_or_else(|| now.timestamp_millis());
        let text = message.display_text();
        let attachments_json = message.attachments.as_ref().map(serde_json::to_string).transpose()?;
        let raw_json = serde_json::to_string(event)?;
        let stubs: Vec<AttachmentStub> = message
            .attachment_items()
            .into_iter()
            .enumerate()
            .map(|(idx, item)| AttachmentStub::from_item(idx as u32, item))
            .collect();

        let written = retry_on_contention(self.resolver.contention(), "message_upsert", || {
            let mut conn = self.db.connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let conversation_id = resolve_or_create_in(&tx, account_id, counterparty_id, now)?;
            let inserted = tx.execute(
                "INSERT INTO messages (external_message_id, conversation_id, sender_id, recipient_id,
                    direction, timestamp_ms, text, attachments_json, raw_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(external_message_id) DO NOTHING",
                params![
                    mid,
                    conversation_id,
                    sender_id,
                    recipient_id,
                    direction.as_str(),
                    timestamp_ms,
                    text,
                    attachments_json,
                    raw_json,
                    format_datetime(now),
                ],
            )?;
            if inserted == 0 {
                tx.commit()?;
                return Ok(None);
            }
            let message_id = tx.last_insert_rowid();
            let summary = ConversationSummary {
                last_message_id: Some(message_id),
                last_message_timestamp_ms: Some(timestamp_ms),
                last_message_text: text.clone(),
                last_message_direction: Some(direction),
                last_sender_id: sender_id.map(str::to_string),
                last_recipient_id: recipient_id.map(str::to_string),
                last_message_at: Utc.timestamp_millis_opt(timestamp_ms).single(),
            };
            apply_summary_in(&tx, conversation_id, &summary)?;
            let mut media = Vec::with_capacity(stubs.len());
            for stub in &stubs {
                insert_stub_in(&tx, message_id, stub, now)?;
                let request = JobRequest::fetch_media(message_id, stub.position)?;
                media.push(self.queue.register_in(&tx, &request)?);
            }
            if direction == Direction::In {
                self.shadow.touch_in(&tx, conversation_id, Some(timestamp_ms))?;
            }
            tx.commit()?;
            Ok(Some((conversation_id, message_id, media)))
        })?;
        let Some((conversation_id, message_id, media)) = written else {
            debug!("message lost insert race mid={}", mid);
            return Ok(None);
        };

        self.attach_decoded_thread(conversation_id, mid);
        let mut media_jobs = 0;
        for pointer in &media {
            match self.queue.push_registered(pointer) {
                Ok(()) => media_jobs += 1,
                Err(err) => warn!(
                    "media job registered but not pushed job_id={} key={} err={}",
                    pointer.id, pointer.key, err
                ),
            }
        }

        debug!(
            "stored message id={} mid={} conversation_id={} direction={}",
            message_id, mid, conversation_id, direction
        );
        Ok(Some(UpsertedMessage {
            message_id,
            conversation_id,
            direction,
            timestamp_ms,
            attachments: stubs.len(),
            media_jobs,
        }))
    }

    fn exists(&self, mid: &str) -> Result<bool, StoreError> {
        let conn = self.db.connection()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM messages WHERE external_message_id = ?1",
                params![mid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn attach_decoded_thread(&self, conversation_id: i64, mid: &str) {
        let Some(external_id) = decode_thread_id(mid) else {
            return;
        };
        match self.resolver.find(conversation_id) {
            Ok(Some(conversation)) if conversation.external_conversation_id.is_none() => {
                if let Err(err) = self.resolver.attach_external_id(conversation_id, &external_id) {
                    warn!(
                        "external id attach failed conversation_id={} err={}",
                        conversation_id, err
                    );
                }
            }
            Ok(_) => {}
            Err(err) => warn!("conversation lookup failed conversation_id={} err={}", conversation_id, err),
        }
    }

    /// Enqueues fetch jobs for attachments still pending. Job keys make
    /// this safe to repeat.
    pub fn requeue_pending_media(&self, limit: usize) -> Result<usize, UpsertError> {
        let pending = AttachmentStore::new(self.db.clone()).pending(limit)?;
        let mut enqueued = 0;
        for (message_id, position) in pending {
            let request = JobRequest::fetch_media(message_id, position)?;
            match self.queue.enqueue_request(request) {
                Ok(_) => enqueued += 1,
                Err(err) => warn!(
                    "media job enqueue failed message_id={} position={} err={}",
                    message_id, position, err
                ),
            }
        }
        Ok(enqueued)
    }

    pub fn find_by_external_id(&self, mid: &str) -> Result<Option<StoredMessage>, StoreError> {
        let conn = self.db.connection()?;
        let row = conn
            .query_row(
                "SELECT id, external_message_id, conversation_id, sender_id, recipient_id,
                        direction, timestamp_ms, text, created_at
                 FROM messages WHERE external_message_id = ?1",
                params![mid],
                MessageRow::from_row,
            )
            .optional()?;
        row.map(MessageRow::into_message).transpose()
    }
}

struct MessageRow {
    id: i64,
    external_message_id: String,
    conversation_id: Option<i64>,
    sender_id: Option<String>,
    recipient_id: Option<String>,
    direction: String,
    timestamp_ms: Option<i64>,
    text: Option<String>,
    created_at: String,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            external_message_id: row.get(1)?,
            conversation_id: row.get(2)?,
            sender_id: row.get(3)?,
            recipient_id: row.get(4)?,
            direction: row.get(5)?,
            timestamp_ms: row.get(6)?,
            text: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_message(self) -> Result<StoredMessage, StoreError> {
        Ok(StoredMessage {
            id: self.id,
            external_message_id: self.external_message_id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            recipient_id: self.recipient_id,
            direction: self
                .direction
                .parse()
                .map_err(|raw: String| StoreError::invalid("direction", raw))?,
            timestamp_ms: self.timestamp_ms,
            text: self.text,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_cover_entry_id_and_aliases() {
        let identities = AccountIdentities::new(["page-1", " ", "user-9"]);
        assert!(identities.is_self("entry-7", "entry-7"));
        assert!(identities.is_self("entry-7", "page-1"));
        assert!(identities.is_self("entry-7", "user-9"));
        assert!(!identities.is_self("entry-7", "customer"));
        assert!(!identities.is_self("entry-7", ""));
    }

    #[test]
    fn direction_round_trips_through_text() {
        assert_eq!("in".parse::<Direction>(), Ok(Direction::In));
        assert_eq!(Direction::Out.to_string(), "out");
        assert!("sideways".parse::<Direction>().is_err());
    }
}
