use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::db::{format_datetime, parse_datetime, Database, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentKind {
    Image,
    Video,
    Audio,
    File,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Video => "video",
            AttachmentKind::Audio => "audio",
            AttachmentKind::File => "file",
        }
    }

    /// Classifies from the item's declared type, falling back to its MIME type.
    pub fn classify(item: &Value) -> Self {
        let declared = item
            .get("type")
            .or_else(|| item.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_ascii_lowercase();
        if declared.contains("image") || declared.contains("photo") || declared.contains("sticker") {
            AttachmentKind::Image
        } else if declared.contains("video") || declared.contains("reel") {
            AttachmentKind::Video
        } else if declared.contains("audio") {
            AttachmentKind::Audio
        } else {
            AttachmentKind::File
        }
    }
}

impl FromStr for AttachmentKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "image" => Ok(AttachmentKind::Image),
            "video" => Ok(AttachmentKind::Video),
            "audio" => Ok(AttachmentKind::Audio),
            "file" => Ok(AttachmentKind::File),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Pending,
    Ok,
    Error,
}

impl FetchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchStatus::Pending => "pending",
            FetchStatus::Ok => "ok",
            FetchStatus::Error => "error",
        }
    }
}

impl FromStr for FetchStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(FetchStatus::Pending),
            "ok" => Ok(FetchStatus::Ok),
            "error" => Ok(FetchStatus::Error),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for FetchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub id: i64,
    pub message_id: i64,
    pub position: u32,
    pub kind: AttachmentKind,
    pub external_id: Option<String>,
    pub source_url: Option<String>,
    pub fetch_status: FetchStatus,
    pub storage_path: Option<String>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

pub(crate) struct AttachmentStub {
    pub position: u32,
    pub kind: AttachmentKind,
    pub external_id: Option<String>,
    pub source_url: Option<String>,
}

impl AttachmentStub {
    pub(crate) fn from_item(position: u32, item: &Value) -> Self {
        let payload = item.get("payload");
        let external_id = item
            .get("id")
            .or_else(|| payload.and_then(|p| p.get("id")))
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        let source_url = payload
            .and_then(|p| p.get("url"))
            .or_else(|| item.get("image_data").and_then(|d| d.get("url")))
            .or_else(|| item.get("video_data").and_then(|d| d.get("url")))
            .or_else(|| item.get("file_url"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            position,
            kind: AttachmentKind::classify(item),
            external_id,
            source_url,
        }
    }
}

pub(crate) fn insert_stub_in(
    conn: &Connection,
    message_id: i64,
    stub: &AttachmentStub,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let inserted = conn.execute(
        "INSERT INTO attachments (message_id, position, kind, external_id, source_url, fetch_status, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)
         ON CONFLICT(message_id, position) DO NOTHING",
        params![
            message_id,
            stub.position,
            stub.kind.as_str(),
            stub.external_id,
            stub.source_url,
            format_datetime(now),
        ],
    )?;
    Ok(inserted > 0)
}

const ATTACHMENT_COLUMNS: &str = "id, message_id, position, kind, external_id, source_url,
    fetch_status, storage_path, error, updated_at";

#[derive(Debug, Clone)]
pub struct AttachmentStore {
    db: Database,
}

impl AttachmentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self, message_id: i64, position: u32) -> Result<Option<Attachment>, StoreError> {
        let conn = self.db.connection()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE message_id = ?1 AND position = ?2"
                ),
                params![message_id, position],
                AttachmentRow::from_row,
            )
            .optional()?;
        row.map(AttachmentRow::into_attachment).transpose()
    }

    pub fn for_message(&self, message_id: i64) -> Result<Vec<Attachment>, StoreError> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments WHERE message_id = ?1 ORDER BY position ASC"
        ))?;
        let rows = stmt.query_map(params![message_id], AttachmentRow::from_row)?;
        let mut attachments = Vec::new();
        for row in rows {
            attachments.push(row?.into_attachment()?);
        }
        Ok(attachments)
    }

    /// (message_id, position) pairs still waiting for a fetch.
    pub fn pending(&self, limit: usize) -> Result<Vec<(i64, u32)>, StoreError> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(
            "SELECT message_id, position FROM attachments
             WHERE fetch_status = 'pending' ORDER BY id ASC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn mark_fetched(
        &self,
        message_id: i64,
        position: u32,
        storage_path: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.db.connection()?;
        conn.execute(
            "UPDATE attachments SET fetch_status = 'ok', storage_path = ?3, error = NULL, updated_at = ?4
             WHERE message_id = ?1 AND position = ?2",
            params![message_id, position, storage_path, format_datetime(now)],
        )?;
        Ok(())
    }

    pub fn mark_failed(
        &self,
        message_id: i64,
        position: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.db.connection()?;
        conn.execute(
            "UPDATE attachments SET fetch_status = 'error', error = ?3, updated_at = ?4
             WHERE message_id = ?1 AND position = ?2",
            params![message_id, position, error, format_datetime(now)],
        )?;
        Ok(())
    }
}

struct AttachmentRow {
    id: i64,
    message_id: i64,
    position: u32,
    kind: String,
    external_id: Option<String>,
    source_url: Option<String>,
    fetch_status: String,
    storage_path: Option<String>,
    error: Option<String>,
    updated_at: String,
}

impl AttachmentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            message_id: row.get(1)?,
            position: row.get(2)?,
            kind: row.get(3)?,
            external_id: row.get(4)?,
            source_url: row.get(5)?,
            fetch_status: row.get(6)?,
            storage_path: row.get(7)?,
            error: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_attachment(self) -> Result<Attachment, StoreError> {
        Ok(Attachment {
            id: self.id,
            message_id: self.message_id,
            position: self.position,
            kind: self
                .kind
                .parse()
                .map_err(|raw: String| StoreError::invalid("kind", raw))?,
            external_id: self.external_id,
            source_url: self.source_url,
            fetch_status: self
                .fetch_status
                .parse()
                .map_err(|raw: String| StoreError::invalid("fetch_status", raw))?,
            storage_path: self.storage_path,
            error: self.error,
            updated_at: parse_datetime(&self.updated_at)?,
        })
    }
}
