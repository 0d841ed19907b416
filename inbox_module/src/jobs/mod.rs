//! Durable job registry plus the wake-list broker that workers block on.

mod broker;
mod queue;
mod store;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use broker::{BrokerError, MemoryBroker, QueueBroker, SqliteBroker};
pub use queue::{JobQueue, QueueError, QueueStats, DEFAULT_CLAIM_LEASE};
pub use store::{DeadLetter, JobStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Ingest,
    FetchMedia,
    HydrateConversation,
}

impl JobKind {
    pub const ALL: [JobKind; 3] = [
        JobKind::Ingest,
        JobKind::FetchMedia,
        JobKind::HydrateConversation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Ingest => "ingest",
            JobKind::FetchMedia => "fetch_media",
            JobKind::HydrateConversation => "hydrate_conversation",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job kind: {0}")]
pub struct UnknownJobKind(pub String);

impl FromStr for JobKind {
    type Err = UnknownJobKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "ingest" => Ok(JobKind::Ingest),
            "fetch_media" => Ok(JobKind::FetchMedia),
            "hydrate_conversation" => Ok(JobKind::HydrateConversation),
            other => Err(UnknownJobKind(other.to_string())),
        }
    }
}

/// Wire format pushed onto a kind's wake-list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPointer {
    pub id: i64,
    pub kind: JobKind,
    pub key: String,
}

impl JobPointer {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: i64,
    pub kind: JobKind,
    pub key: String,
    pub payload: Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn pointer(&self) -> JobPointer {
        JobPointer {
            id: self.id,
            kind: self.kind,
            key: self.key.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { attempts: u32 },
    DeadLettered { attempts: u32 },
    /// The job row was already gone (acked elsewhere).
    Missing,
}

/// A producer's request: kind, dedupe key and opaque payload.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub kind: JobKind,
    pub key: String,
    pub payload: Value,
}

impl JobRequest {
    pub fn ingest(raw_event_id: i64) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: JobKind::Ingest,
            key: raw_event_id.to_string(),
            payload: serde_json::to_value(IngestJob { raw_event_id })?,
        })
    }

    pub fn fetch_media(message_id: i64, position: u32) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: JobKind::FetchMedia,
            key: format!("{message_id}:{position}"),
            payload: serde_json::to_value(FetchMediaJob {
                message_id,
                position,
            })?,
        })
    }

    pub fn hydrate(conversation_id: i64, max_messages: Option<u32>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: JobKind::HydrateConversation,
            key: conversation_id.to_string(),
            payload: serde_json::to_value(HydrateConversationJob {
                conversation_id,
                max_messages,
            })?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestJob {
    pub raw_event_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchMediaJob {
    pub message_id: i64,
    pub position: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HydrateConversationJob {
    pub conversation_id: i64,
    #[serde(default)]
    pub max_messages: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub dequeue_timeout: Duration,
    pub poll_interval: Duration,
    /// Unacked or unclaimed jobs older than this get their pointer pushed
    /// again.
    pub claim_lease: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            dequeue_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
            claim_lease: DEFAULT_CLAIM_LEASE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_wire_format_is_plain_json() {
        let pointer = JobPointer {
            id: 7,
            kind: JobKind::FetchMedia,
            key: "12:0".to_string(),
        };
        let raw = pointer.encode().unwrap();
        assert_eq!(raw, r#"{"id":7,"kind":"fetch_media","key":"12:0"}"#);
        assert!(JobPointer::decode("{not json").is_err());
    }

    #[test]
    fn job_kind_parses_its_own_names() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), kind);
        }
        assert!("email".parse::<JobKind>().is_err());
    }

    #[test]
    fn requests_use_stable_keys() {
        assert_eq!(JobRequest::ingest(5).unwrap().key, "5");
        assert_eq!(JobRequest::fetch_media(9, 2).unwrap().key, "9:2");
        let hydrate = JobRequest::hydrate(4, Some(50)).unwrap();
        assert_eq!(hydrate.key, "4");
        assert_eq!(hydrate.payload["max_messages"], 50);
    }
}
