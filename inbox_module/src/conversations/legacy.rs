use chrono::{DateTime, Utc};
use rusqlite::{params, Row, TransactionBehavior};
use tracing::{info, warn};

use super::resolver::{register_alias_in, resolve_or_create_in};
use super::summary::{apply_summary_in, merge_hydrated_at_in, ConversationSummary};
use super::{AliasKind, ConversationResolver, ResolveError, LEGACY_PREFIX};
use crate::db::{parse_optional_datetime, StoreError};
use crate::messages::Direction;
use crate::retry::retry_on_contention;

/// A conversation row written under the old `dm:<counterparty>` convention.
#[derive(Debug, Clone, PartialEq)]
pub struct LegacyConversation {
    pub legacy_id: String,
    pub account_id: String,
    pub summary: ConversationSummary,
    pub hydrated_at: Option<DateTime<Utc>>,
}

impl LegacyConversation {
    pub fn counterparty_id(&self) -> Option<&str> {
        self.legacy_id
            .strip_prefix(LEGACY_PREFIX)
            .map(str::trim)
            .filter(|cp| !cp.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub considered: usize,
    pub migrated: usize,
    pub messages_repointed: usize,
    pub summaries_advanced: usize,
    pub skipped: usize,
}

impl ConversationResolver {
    pub fn pending_legacy(&self, limit: usize) -> Result<Vec<LegacyConversation>, ResolveError> {
        let conn = self.db().connection()?;
        let mut stmt = conn.prepare(
            "SELECT legacy_id, account_id, last_message_id, last_message_timestamp_ms,
                    last_message_text, last_message_direction, last_sender_id,
                    last_recipient_id, last_message_at, hydrated_at
             FROM legacy_conversations ORDER BY legacy_id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], LegacyRow::from_row)?;
        let mut legacy = Vec::new();
        for row in rows {
            legacy.push(row?.into_legacy()?);
        }
        Ok(legacy)
    }

    /// Moves up to `limit` legacy rows onto their canonical conversation:
    /// messages are repointed, the summary is merged last-write-wins, the
    /// legacy id becomes an alias and the legacy row is deleted.
    pub fn migrate_legacy(&self, limit: usize) -> Result<MigrationReport, ResolveError> {
        let mut report = MigrationReport::default();
        for legacy in self.pending_legacy(limit)? {
            report.considered += 1;
            let Some(counterparty_id) = legacy.counterparty_id() else {
                warn!("skipping legacy conversation with no counterparty legacy_id={}", legacy.legacy_id);
                report.skipped += 1;
                continue;
            };
            let now = self.now();
            let (conversation_id, repointed, advanced) =
                retry_on_contention(self.contention(), "migrate_legacy", || {
                    let mut conn = self.db().connection()?;
                    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                    let conversation_id =
                        resolve_or_create_in(&tx, &legacy.account_id, counterparty_id, now)?;
                    let repointed = tx.execute(
                        "UPDATE messages SET conversation_id = ?1, legacy_conversation_ref = NULL
                         WHERE legacy_conversation_ref = ?2",
                        params![conversation_id, legacy.legacy_id],
                    )?;
                    let advanced = apply_summary_in(&tx, conversation_id, &legacy.summary)?;
                    merge_hydrated_at_in(&tx, conversation_id, legacy.hydrated_at)?;
                    register_alias_in(&tx, &legacy.legacy_id, AliasKind::Legacy, conversation_id, now)?;
                    tx.execute(
                        "DELETE FROM legacy_conversations WHERE legacy_id = ?1",
                        params![legacy.legacy_id],
                    )?;
                    tx.commit()?;
                    Ok((conversation_id, repointed, advanced))
                })?;
            info!(
                "migrated legacy conversation legacy_id={} conversation_id={} messages={}",
                legacy.legacy_id, conversation_id, repointed
            );
            report.migrated += 1;
            report.messages_repointed += repointed;
            if advanced {
                report.summaries_advanced += 1;
            }
        }
        Ok(report)
    }
}

struct LegacyRow {
    legacy_id: String,
    account_id: String,
    last_message_id: Option<i64>,
    last_message_timestamp_ms: Option<i64>,
    last_message_text: Option<String>,
    last_message_direction: Option<String>,
    last_sender_id: Option<String>,
    last_recipient_id: Option<String>,
    last_message_at: Option<String>,
    hydrated_at: Option<String>,
}

impl LegacyRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            legacy_id: row.get(0)?,
            account_id: row.get(1)?,
            last_message_id: row.get(2)?,
            last_message_timestamp_ms: row.get(3)?,
            last_message_text: row.get(4)?,
            last_message_direction: row.get(5)?,
            last_sender_id: row.get(6)?,
            last_recipient_id: row.get(7)?,
            last_message_at: row.get(8)?,
            hydrated_at: row.get(9)?,
        })
    }

    fn into_legacy(self) -> Result<LegacyConversation, StoreError> {
        let direction: Option<Direction> = match self.last_message_direction.as_deref() {
            Some(raw) => Some(
                raw.parse()
                    .map_err(|_| StoreError::invalid("last_message_direction", raw))?,
            ),
            None => None,
        };
        Ok(LegacyConversation {
            legacy_id: self.legacy_id,
            account_id: self.account_id,
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
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::conversations::ConversationRef;
    use crate::db::Database;
    use crate::retry::ContentionPolicy;
    use chrono::TimeZone;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn migration_merges_legacy_rows_last_write_wins() {
        let temp = TempDir::new().expect("tempdir");
        let db = Database::open(temp.path().join("legacy.db")).unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap());
        let resolver = ConversationResolver::new(db.clone(), Arc::new(clock), ContentionPolicy::default());

        let canonical = resolver.resolve_or_create("acct", "u1").unwrap();
        {
            let conn = db.connection().unwrap();
            conn.execute(
                "UPDATE conversations SET last_message_timestamp_ms = 1000, last_message_text = 'canonical' WHERE id = ?1",
                params![canonical],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO legacy_conversations (legacy_id, account_id, last_message_timestamp_ms, last_message_text, last_message_direction)
                 VALUES ('dm:u1', 'acct', 2000, 'from legacy', 'out'),
                        ('dm:u2', 'acct', 10, 'only legacy', 'in'),
                        ('dm:', 'acct', NULL, NULL, NULL)",
                [],
            )
            .unwrap();
            conn.execute(
                "INSERT INTO messages (external_message_id, legacy_conversation_ref, direction, raw_json, created_at)
                 VALUES ('legacy-m1', 'dm:u1', 'in', '{}', '2026-01-01T00:00:00.000Z'),
                        ('legacy-m2', 'dm:u1', 'out', '{}', '2026-01-01T00:00:00.000Z')",
                [],
            )
            .unwrap();
        }

        let report = resolver.migrate_legacy(10).unwrap();
        assert_eq!(report.considered, 3);
        assert_eq!(report.migrated, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.messages_repointed, 2);
        assert_eq!(report.summaries_advanced, 2);

        let merged = resolver.find(canonical).unwrap().unwrap();
        assert_eq!(merged.summary.last_message_text.as_deref(), Some("from legacy"));
        assert_eq!(merged.summary.last_message_direction, Some(Direction::Out));

        assert_eq!(
            resolver.resolve(&ConversationRef::parse("dm:u1"), None).unwrap(),
            canonical
        );
        let u2 = resolver.resolve(&ConversationRef::parse("dm:u2"), None).unwrap();
        assert_eq!(u2, resolver.resolve_or_create("acct", "u2").unwrap());

        let remaining = resolver.pending_legacy(10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].legacy_id, "dm:");
        assert_eq!(resolver.migrate_legacy(10).unwrap().migrated, 0);
    }
}
