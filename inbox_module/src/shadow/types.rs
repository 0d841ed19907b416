use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowStatus {
    Pending,
    Running,
    Paused,
    NeedsLink,
    NeedsAdmin,
    Exhausted,
    Error,
}

impl ShadowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShadowStatus::Pending => "pending",
            ShadowStatus::Running => "running",
            ShadowStatus::Paused => "paused",
            ShadowStatus::NeedsLink => "needs_link",
            ShadowStatus::NeedsAdmin => "needs_admin",
            ShadowStatus::Exhausted => "exhausted",
            ShadowStatus::Error => "error",
        }
    }
}

impl fmt::Display for ShadowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShadowStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(ShadowStatus::Pending),
            "running" => Ok(ShadowStatus::Running),
            "paused" => Ok(ShadowStatus::Paused),
            "needs_link" => Ok(ShadowStatus::NeedsLink),
            "needs_admin" => Ok(ShadowStatus::NeedsAdmin),
            "exhausted" => Ok(ShadowStatus::Exhausted),
            "error" => Ok(ShadowStatus::Error),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShadowState {
    pub conversation_id: i64,
    pub status: ShadowStatus,
    pub last_inbound_timestamp_ms: Option<i64>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub postpone_count: u32,
    pub escalation_reason: Option<String>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Suggested,
    Sent,
    Dismissed,
    Expired,
    NoReply,
}

impl ReplyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyStatus::Suggested => "suggested",
            ReplyStatus::Sent => "sent",
            ReplyStatus::Dismissed => "dismissed",
            ReplyStatus::Expired => "expired",
            ReplyStatus::NoReply => "no_reply",
        }
    }
}

impl FromStr for ReplyStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "suggested" => Ok(ReplyStatus::Suggested),
            "sent" => Ok(ReplyStatus::Sent),
            "dismissed" => Ok(ReplyStatus::Dismissed),
            "expired" => Ok(ReplyStatus::Expired),
            "no_reply" => Ok(ReplyStatus::NoReply),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShadowReply {
    pub id: i64,
    pub conversation_id: i64,
    pub text: String,
    pub model: Option<String>,
    pub confidence: Option<f64>,
    pub reason: Option<String>,
    pub attempt_no: u32,
    pub status: ReplyStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewShadowReply {
    pub text: String,
    pub model: Option<String>,
    pub confidence: Option<f64>,
    pub reason: Option<String>,
    pub attempt_no: u32,
    pub status: ReplyStatus,
}
