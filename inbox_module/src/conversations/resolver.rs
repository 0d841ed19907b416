use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::discovery::find_by_participant;
use super::summary::{apply_summary_in, merge_hydrated_at_in, ConversationSummary};
use super::thread_id::decode_thread_id;
use super::{
    merged_alias, AliasKind, AttachOutcome, Conversation, ConversationDirectory, ConversationRef,
    ResolveError, LEGACY_PREFIX,
};
use crate::clock::Clock;
use crate::db::{format_datetime, parse_datetime, parse_optional_datetime, Database, StoreError};
use crate::messages::Direction;
use crate::retry::{retry_on_contention, ContentionPolicy};

const CONVERSATION_COLUMNS: &str = "id, account_id, counterparty_id, external_conversation_id,
    last_message_id, last_message_timestamp_ms, last_message_text, last_message_direction,
    last_sender_id, last_recipient_id, last_message_at, hydrated_at, created_at";

const PREFERRED_ORDER: &str =
    "ORDER BY CASE WHEN external_conversation_id IS NULL THEN 1 ELSE 0 END, id ASC";

const RECENT_MESSAGE_PROBES: usize = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub kept: Option<i64>,
    pub merged: Vec<i64>,
}

/// Finds the preferred row for (account, counterparty) or inserts one.
/// Concurrent creators may both insert; `reconcile_duplicates` folds them.
pub(crate) fn resolve_or_create_in(
    conn: &Connection,
    account_id: &str,
    counterparty_id: &str,
    now: DateTime<Utc>,
) -> Result<i64, StoreError> {
    if let Some(id) = find_preferred_in(conn, account_id, counterparty_id)? {
        return Ok(id);
    }
    conn.execute(
        "INSERT INTO conversations (account_id, counterparty_id, created_at) VALUES (?1, ?2, ?3)",
        params![account_id, counterparty_id, format_datetime(now)],
    )?;
    Ok(conn.last_insert_rowid())
}

fn find_preferred_in(
    conn: &Connection,
    account_id: &str,
    counterparty_id: &str,
) -> Result<Option<i64>, StoreError> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT id FROM conversations WHERE account_id = ?1 AND counterparty_id = ?2 {PREFERRED_ORDER} LIMIT 1"
            ),
            params![account_id, counterparty_id],
            |row| row.get(0),
        )
        .optional()?)
}

pub(crate) fn register_alias_in(
    conn: &Connection,
    alias: &str,
    kind: AliasKind,
    conversation_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let inserted = conn.execute(
        "INSERT INTO conversation_aliases (alias, alias_kind, conversation_id, created_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(alias) DO NOTHING",
        params![alias, kind.as_str(), conversation_id, format_datetime(now)],
    )?;
    Ok(inserted > 0)
}

fn alias_target_in(conn: &Connection, alias: &str) -> Result<Option<i64>, StoreError> {
    Ok(conn
        .query_row(
            "SELECT conversation_id FROM conversation_aliases WHERE alias = ?1",
            params![alias],
            |row| row.get(0),
        )
        .optional()?)
}

fn find_in(conn: &Connection, conversation_id: i64) -> Result<Option<Conversation>, StoreError> {
    let row = conn
        .query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![conversation_id],
            ConversationRow::from_row,
        )
        .optional()?;
    row.map(ConversationRow::into_conversation).transpose()
}

/// How long a directory miss suppresses another search for the same pair.
const DIRECTORY_MISS_TTL_MINUTES: i64 = 10;
const DIRECTORY_MISS_LIMIT: usize = 1024;

pub struct ConversationResolver {
    db: Database,
    clock: Arc<dyn Clock>,
    contention: ContentionPolicy,
    directory: Option<Arc<dyn ConversationDirectory>>,
    directory_max_pages: usize,
    directory_misses: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl ConversationResolver {
    pub fn new(db: Database, clock: Arc<dyn Clock>, contention: ContentionPolicy) -> Self {
        Self {
            db,
            clock,
            contention,
            directory: None,
            directory_max_pages: 10,
            directory_misses: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_directory(mut self, directory: Arc<dyn ConversationDirectory>, max_pages: usize) -> Self {
        self.directory = Some(directory);
        self.directory_max_pages = max_pages.max(1);
        self
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub(crate) fn contention(&self) -> &ContentionPolicy {
        &self.contention
    }

    pub fn resolve_or_create(&self, account_id: &str, counterparty_id: &str) -> Result<i64, ResolveError> {
        let account_id = account_id.trim();
        let counterparty_id = counterparty_id.trim();
        if account_id.is_empty() || counterparty_id.is_empty() {
            return Err(ResolveError::MissingParticipant);
        }
        let now = self.clock.now();
        Ok(retry_on_contention(&self.contention, "resolve_or_create", || {
            let mut conn = self.db.connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let id = resolve_or_create_in(&tx, account_id, counterparty_id, now)?;
            tx.commit()?;
            Ok(id)
        })?)
    }

    pub fn find(&self, conversation_id: i64) -> Result<Option<Conversation>, ResolveError> {
        let conn = self.db.connection()?;
        Ok(find_in(&conn, conversation_id)?)
    }

    /// First writer wins. The external id is also registered as an alias.
    pub fn attach_external_id(
        &self,
        conversation_id: i64,
        external_id: &str,
    ) -> Result<AttachOutcome, ResolveError> {
        let external_id = external_id.trim();
        if external_id.is_empty() {
            return Err(ResolveError::MissingParticipant);
        }
        let now = self.clock.now();
        let outcome = retry_on_contention(&self.contention, "attach_external_id", || {
            let mut conn = self.db.connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let updated = tx.execute(
                "UPDATE conversations SET external_conversation_id = ?2
                 WHERE id = ?1 AND external_conversation_id IS NULL",
                params![conversation_id, external_id],
            )?;
            let outcome = if updated == 1 {
                Some(AttachOutcome::Attached)
            } else {
                let existing: Option<Option<String>> = tx
                    .query_row(
                        "SELECT external_conversation_id FROM conversations WHERE id = ?1",
                        params![conversation_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                match existing {
                    None => None,
                    Some(Some(existing)) if existing == external_id => Some(AttachOutcome::AlreadySet),
                    Some(Some(existing)) => Some(AttachOutcome::Conflict { existing }),
                    Some(None) => None,
                }
            };
            if matches!(outcome, Some(AttachOutcome::Attached | AttachOutcome::AlreadySet)) {
                register_alias_in(&tx, external_id, AliasKind::External, conversation_id, now)?;
            }
            tx.commit()?;
            Ok(outcome)
        })?;
        match outcome {
            Some(AttachOutcome::Conflict { existing }) => {
                warn!(
                    "external id conflict conversation_id={} existing={} offered={}",
                    conversation_id, existing, external_id
                );
                Ok(AttachOutcome::Conflict { existing })
            }
            Some(outcome) => Ok(outcome),
            None => Err(ResolveError::NotFound(conversation_id.to_string())),
        }
    }

    /// Maps any identifier scheme to the canonical conversation id.
    /// `account_hint` is used when a legacy id has no alias or legacy row yet.
    pub fn resolve(
        &self,
        reference: &ConversationRef,
        account_hint: Option<&str>,
    ) -> Result<i64, ResolveError> {
        let conn = self.db.connection()?;
        match reference {
            ConversationRef::Internal(id) => {
                if find_in(&conn, *id)?.is_some() {
                    return Ok(*id);
                }
                alias_target_in(&conn, &merged_alias(*id))?
                    .ok_or_else(|| ResolveError::NotFound(reference.to_string()))
            }
            ConversationRef::External(external_id) => {
                if let Some(id) = alias_target_in(&conn, external_id)? {
                    return Ok(id);
                }
                let direct: Option<i64> = conn
                    .query_row(
                        "SELECT id FROM conversations WHERE external_conversation_id = ?1 ORDER BY id ASC LIMIT 1",
                        params![external_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                direct.ok_or_else(|| ResolveError::NotFound(reference.to_string()))
            }
            ConversationRef::Legacy(legacy) => {
                if let Some(id) = alias_target_in(&conn, legacy)? {
                    return Ok(id);
                }
                let counterparty_id = legacy
                    .strip_prefix(LEGACY_PREFIX)
                    .map(str::trim)
                    .filter(|cp| !cp.is_empty())
                    .ok_or(ResolveError::MissingParticipant)?;
                let stored_account: Option<String> = conn
                    .query_row(
                        "SELECT account_id FROM legacy_conversations WHERE legacy_id = ?1",
                        params![legacy],
                        |row| row.get(0),
                    )
                    .optional()?;
                drop(conn);
                let account_id = stored_account
                    .or_else(|| account_hint.map(str::to_string))
                    .ok_or_else(|| ResolveError::NotFound(reference.to_string()))?;
                self.resolve_or_create(&account_id, counterparty_id)
            }
        }
    }

    /// Returns the conversation's external id, discovering it if needed:
    /// first from message ids (the hint, then stored messages), then by
    /// paging the platform directory. A pair whose directory search missed
    /// is not searched again until the miss expires.
    pub fn discover_external_id(
        &self,
        conversation_id: i64,
        hint_message_id: Option<&str>,
    ) -> Result<String, ResolveError> {
        let conversation = self
            .find(conversation_id)?
            .ok_or_else(|| ResolveError::NotFound(conversation_id.to_string()))?;
        if let Some(external_id) = conversation.external_conversation_id {
            return Ok(external_id);
        }

        let mut candidates: Vec<String> = hint_message_id.map(str::to_string).into_iter().collect();
        candidates.extend(self.recent_message_ids(conversation_id)?);
        if let Some(external_id) = candidates.iter().find_map(|mid| decode_thread_id(mid)) {
            debug!(
                "external id decoded from message id conversation_id={} external_id={}",
                conversation_id, external_id
            );
            return self.settle(conversation_id, &external_id);
        }

        if let Some(directory) = self.directory.as_ref() {
            let pair = (
                conversation.account_id.clone(),
                conversation.counterparty_id.clone(),
            );
            if !self.directory_already_missed(&pair) {
                match find_by_participant(
                    directory.as_ref(),
                    &conversation.counterparty_id,
                    self.directory_max_pages,
                )? {
                    Some(external_id) => {
                        info!(
                            "external id found in directory conversation_id={} external_id={}",
                            conversation_id, external_id
                        );
                        return self.settle(conversation_id, &external_id);
                    }
                    None => self.record_directory_miss(pair),
                }
            }
        }

        Err(ResolveError::Unresolved {
            account_id: conversation.account_id,
            counterparty_id: conversation.counterparty_id,
        })
    }

    fn settle(&self, conversation_id: i64, external_id: &str) -> Result<String, ResolveError> {
        match self.attach_external_id(conversation_id, external_id)? {
            AttachOutcome::Attached | AttachOutcome::AlreadySet => Ok(external_id.to_string()),
            AttachOutcome::Conflict { existing } => Ok(existing),
        }
    }

    fn directory_already_missed(&self, pair: &(String, String)) -> bool {
        let now = self.clock.now();
        let mut misses = self
            .directory_misses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match misses.get(pair) {
            Some(expires_at) if *expires_at > now => true,
            Some(_) => {
                misses.remove(pair);
                false
            }
            None => false,
        }
    }

    fn record_directory_miss(&self, pair: (String, String)) {
        let now = self.clock.now();
        let mut misses = self
            .directory_misses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        misses.retain(|_, expires_at| *expires_at > now);
        if misses.len() >= DIRECTORY_MISS_LIMIT {
            let oldest = misses
                .iter()
                .min_by_key(|(_, expires_at)| **expires_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                misses.remove(&oldest);
            }
        }
        misses.insert(pair, now + Duration::minutes(DIRECTORY_MISS_TTL_MINUTES));
    }

    fn recent_message_ids(&self, conversation_id: i64) -> Result<Vec<String>, ResolveError> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(
            "SELECT external_message_id FROM messages WHERE conversation_id = ?1
             ORDER BY COALESCE(timestamp_ms, 0) DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![conversation_id, RECENT_MESSAGE_PROBES as i64],
            |row| row.get(0),
        )?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    pub fn mark_hydrated(&self, conversation_id: i64) -> Result<(), ResolveError> {
        let conn = self.db.connection()?;
        merge_hydrated_at_in(&conn, conversation_id, Some(self.clock.now()))?;
        Ok(())
    }

    /// Folds duplicate rows for a pair into the preferred one.
    pub fn reconcile_duplicates(
        &self,
        account_id: &str,
        counterparty_id: &str,
    ) -> Result<ReconcileReport, ResolveError> {
        let now = self.clock.now();
        let report = retry_on_contention(&self.contention, "reconcile_duplicates", || {
            let mut conn = self.db.connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let ids: Vec<i64> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT id FROM conversations WHERE account_id = ?1 AND counterparty_id = ?2 {PREFERRED_ORDER}"
                ))?;
                let rows = stmt.query_map(params![account_id, counterparty_id], |row| row.get(0))?;
                rows.collect::<Result<Vec<i64>, _>>()?
            };
            let Some((&keeper, duplicates)) = ids.split_first() else {
                return Ok(ReconcileReport::default());
            };
            for &duplicate in duplicates {
                fold_into_in(&tx, keeper, duplicate, now)?;
            }
            tx.commit()?;
            Ok(ReconcileReport {
                kept: Some(keeper),
                merged: duplicates.to_vec(),
            })
        })?;
        if !report.merged.is_empty() {
            info!(
                "reconciled duplicate conversations account_id={} counterparty_id={} kept={:?} merged={:?}",
                account_id, counterparty_id, report.kept, report.merged
            );
        }
        Ok(report)
    }
}

fn fold_into_in(
    conn: &Connection,
    keeper: i64,
    duplicate: i64,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let Some(dup) = find_in(conn, duplicate)? else {
        return Ok(());
    };
    apply_summary_in(conn, keeper, &dup.summary)?;
    merge_hydrated_at_in(conn, keeper, dup.hydrated_at)?;
    conn.execute(
        "UPDATE messages SET conversation_id = ?1 WHERE conversation_id = ?2",
        params![keeper, duplicate],
    )?;
    conn.execute(
        "UPDATE conversation_aliases SET conversation_id = ?1 WHERE conversation_id = ?2",
        params![keeper, duplicate],
    )?;
    if let Some(external_id) = dup.external_conversation_id.as_deref() {
        register_alias_in(conn, external_id, AliasKind::External, keeper, now)?;
    }
    register_alias_in(conn, &merged_alias(duplicate), AliasKind::Merged, keeper, now)?;
    conn.execute(
        "UPDATE OR IGNORE shadow_states SET conversation_id = ?1 WHERE conversation_id = ?2",
        params![keeper, duplicate],
    )?;
    conn.execute(
        "DELETE FROM shadow_states WHERE conversation_id = ?1",
        params![duplicate],
    )?;
    conn.execute(
        "UPDATE shadow_replies SET conversation_id = ?1 WHERE conversation_id = ?2",
        params![keeper, duplicate],
    )?;
    conn.execute("DELETE FROM conversations WHERE id = ?1", params![duplicate])?;
    Ok(())
}

struct ConversationRow {
    id: i64,
    account_id: String,
    counterparty_id: String,
    external_conversation_id: Option<String>,
    last_message_id: Option<i64>,
    last_message_timestamp_ms: Option<i64>,
    last_message_text: Option<String>,
    last_message_direction: Option<String>,
    last_sender_id: Option<String>,
    last_recipient_id: Option<String>,
    last_message_at: Option<String>,
    hydrated_at: Option<String>,
    created_at: String,
}

impl ConversationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            account_id: row.get(1)?,
            counterparty_id: row.get(2)?,
            external_conversation_id: row.get(3)?,
            last_message_id: row.get(4)?,
            last_message_timestamp_ms: row.get(5)?,
            last_message_text: row.get(6)?,
            last_message_direction: row.get(7)?,
            last_sender_id: row.get(8)?,
            last_recipient_id: row.get(9)?,
            last_message_at: row.get(10)?,
            hydrated_at: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn into_conversation(self) -> Result<Conversation, StoreError> {
        let direction: Option<Direction> = self
            .last_message_direction
            .as_deref()
            .map(|raw| {
                raw.parse()
                    .map_err(|_| StoreError::invalid("last_message_direction", raw))
            })
            .transpose()?;
        Ok(Conversation {
            id: self.id,
            account_id: self.account_id,
            counterparty_id: self.counterparty_id,
            external_conversation_id: self.external_conversation_id,
            summary: ConversationSummary {
                last_message_id: self.last_message_id,
                last_message_timestamp_ms: self.last_message_timestamp_ms,
                last_message_text: self.last_message_text,
                last_message_direction: direction,
                last_sender_id: self.last_sender_id,
                last_recipient_id: self.last_recipient_id,
                last_message_at: parse_optional_datetime(self.last_message_at)?,
            },
            hydrated_at: parse_optional_datetime(self.hydrated_at)?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}
