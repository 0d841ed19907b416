use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use sha2::{Digest, Sha256};

use crate::db::{format_datetime, parse_datetime, parse_optional_datetime, Database, StoreError};

const RAW_EVENT_COLUMNS: &str =
    "id, object, entry_id, payload, signature, content_hash, received_at, processed_at";

#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub id: i64,
    pub object: String,
    pub entry_id: Option<String>,
    pub payload: Vec<u8>,
    pub signature: String,
    pub content_hash: String,
    pub received_at: DateTime<Utc>,
    /// Set once every message in the body has been stored.
    pub processed_at: Option<DateTime<Utc>>,
}

pub struct NewRawEvent<'a> {
    pub object: &'a str,
    pub entry_id: Option<&'a str>,
    pub payload: &'a [u8],
    pub signature: &'a str,
    pub received_at: DateTime<Utc>,
}

pub fn content_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Append-only record of webhook bodies, unique by content hash.
#[derive(Debug, Clone)]
pub struct RawEventStore {
    db: Database,
}

impl RawEventStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns the stored row and whether this call created it. A body that
    /// was already stored returns the earlier row untouched.
    pub fn insert(&self, event: &NewRawEvent<'_>) -> Result<(RawEvent, bool), StoreError> {
        let hash = content_hash(event.payload);
        if let Some(existing) = self.find_by_hash(&hash)? {
            return Ok((existing, false));
        }
        let conn = self.db.connection()?;
        let inserted = conn.execute(
            "INSERT INTO raw_events (object, entry_id, payload, signature, content_hash, received_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(content_hash) DO NOTHING",
            params![
                event.object,
                event.entry_id,
                event.payload,
                event.signature,
                hash,
                format_datetime(event.received_at),
            ],
        )? == 1;
        drop(conn);
        // Losing the unique race lands here too; re-read the winner.
        let stored = self
            .find_by_hash(&hash)?
            .ok_or_else(|| StoreError::invalid("content_hash", hash.clone()))?;
        Ok((stored, inserted))
    }

    pub fn get(&self, id: i64) -> Result<Option<RawEvent>, StoreError> {
        let conn = self.db.connection()?;
        let row = conn
            .query_row(
                &format!("SELECT {RAW_EVENT_COLUMNS} FROM raw_events WHERE id = ?1"),
                params![id],
                RawEventRow::from_row,
            )
            .optional()?;
        row.map(RawEventRow::into_event).transpose()
    }

    pub fn find_by_hash(&self, hash: &str) -> Result<Option<RawEvent>, StoreError> {
        let conn = self.db.connection()?;
        let row = conn
            .query_row(
                &format!("SELECT {RAW_EVENT_COLUMNS} FROM raw_events WHERE content_hash = ?1"),
                params![hash],
                RawEventRow::from_row,
            )
            .optional()?;
        row.map(RawEventRow::into_event).transpose()
    }

    pub fn mark_processed(&self, id: i64, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let conn = self.db.connection()?;
        let updated = conn.execute(
            "UPDATE raw_events SET processed_at = ?2 WHERE id = ?1",
            params![id, format_datetime(at)],
        )?;
        Ok(updated > 0)
    }

    pub fn ids_received_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<i64>, StoreError> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM raw_events WHERE received_at >= ?1 ORDER BY id ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![format_datetime(since), limit as i64], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<i64>, _>>()?)
    }
}

struct RawEventRow {
    id: i64,
    object: String,
    entry_id: Option<String>,
    payload: Vec<u8>,
    signature: String,
    content_hash: String,
    received_at: String,
    processed_at: Option<String>,
}

impl RawEventRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            object: row.get(1)?,
            entry_id: row.get(2)?,
            payload: row.get(3)?,
            signature: row.get(4)?,
            content_hash: row.get(5)?,
            received_at: row.get(6)?,
            processed_at: row.get(7)?,
        })
    }

    fn into_event(self) -> Result<RawEvent, StoreError> {
        Ok(RawEvent {
            id: self.id,
            object: self.object,
            entry_id: self.entry_id,
            payload: self.payload,
            signature: self.signature,
            content_hash: self.content_hash,
            received_at: parse_datetime(&self.received_at)?,
            processed_at: parse_optional_datetime(self.processed_at)?,
        })
    }
}
