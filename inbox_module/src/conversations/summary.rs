use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::db::{format_datetime, StoreError};
use crate::messages::Direction;

/// Denormalized "last message" projection kept on a conversation row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationSummary {
    pub last_message_id: Option<i64>,
    pub last_message_timestamp_ms: Option<i64>,
    pub last_message_text: Option<String>,
    pub last_message_direction: Option<Direction>,
    pub last_sender_id: Option<String>,
    pub last_recipient_id: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
}

/// Last-write-wins by message timestamp: the projection only moves when
/// the incoming timestamp is at least the stored one. Returns whether it moved.
pub(crate) fn apply_summary_in(
    conn: &Connection,
    conversation_id: i64,
    summary: &ConversationSummary,
) -> Result<bool, StoreError> {
    let Some(timestamp_ms) = summary.last_message_timestamp_ms else {
        return Ok(false);
    };
    let updated = conn.execute(
        "UPDATE conversations SET
            last_message_id = ?3,
            last_message_timestamp_ms = ?2,
            last_message_text = ?4,
            last_message_direction = ?5,
            last_sender_id = ?6,
            last_recipient_id = ?7,
            last_message_at = ?8
         WHERE id = ?1 AND ?2 >= COALESCE(last_message_timestamp_ms, 0)",
        params![
            conversation_id,
            timestamp_ms,
            summary.last_message_id,
            summary.last_message_text,
            summary.last_message_direction.map(|d| d.as_str()),
            summary.last_sender_id,
            summary.last_recipient_id,
            summary.last_message_at.map(format_datetime),
        ],
    )?;
    Ok(updated > 0)
}

/// Keeps the later of the two hydration times.
pub(crate) fn merge_hydrated_at_in(
    conn: &Connection,
    conversation_id: i64,
    hydrated_at: Option<DateTime<Utc>>,
) -> Result<(), StoreError> {
    let Some(hydrated_at) = hydrated_at else {
        return Ok(());
    };
    conn.execute(
        "UPDATE conversations SET hydrated_at = ?2
         WHERE id = ?1 AND (hydrated_at IS NULL OR hydrated_at < ?2)",
        params![conversation_id, format_datetime(hydrated_at)],
    )?;
    Ok(())
}
