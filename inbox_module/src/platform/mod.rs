//! Messaging platform collaborator: conversation listing, message history
//! and media downloads over the platform's paginated HTTP API.

mod graph;
mod rate_limit;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use graph::{GraphClient, GraphMessage};
pub use rate_limit::RateLimiter;

use crate::ingestion::webhook::MessagingEvent;

#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("platform returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("platform rate limit hit")]
    RateLimited,
    #[error("no platform credentials configured")]
    MissingCredentials,
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PlatformError {
    /// Whether a later attempt may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            PlatformError::Http(_) | PlatformError::RateLimited => true,
            PlatformError::Status { status, .. } => *status >= 500,
            PlatformError::MissingCredentials | PlatformError::Json(_) => false,
        }
    }
}

/// Account id plus the bearer token that acts for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub owner_id: String,
    pub access_token: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlatformCredentials {
    pub page: Option<CredentialPair>,
    pub user: Option<CredentialPair>,
}

impl PlatformCredentials {
    /// The page-level pair when configured, else the user-level pair.
    pub fn resolve(&self) -> Result<(&CredentialPair, bool), PlatformError> {
        if let Some(page) = &self.page {
            return Ok((page, true));
        }
        self.user
            .as_ref()
            .map(|user| (user, false))
            .ok_or(PlatformError::MissingCredentials)
    }

    /// Every id under which the account may appear as a message sender.
    pub fn identity_ids(&self) -> Vec<String> {
        [&self.page, &self.user]
            .into_iter()
            .flatten()
            .map(|pair| pair.owner_id.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct PlatformSettings {
    pub api_base: String,
    pub api_version: String,
    pub credentials: PlatformCredentials,
    pub requests_per_minute: u32,
    pub page_size: usize,
    /// Sent as `platform=` on listings made with page credentials.
    pub listing_platform: Option<String>,
    pub request_timeout: Duration,
    pub media_root: PathBuf,
}

impl Default for PlatformSettings {
    fn default() -> Self {
        Self {
            api_base: "https://graph.facebook.com".to_string(),
            api_version: "v21.0".to_string(),
            credentials: PlatformCredentials::default(),
            requests_per_minute: 120,
            page_size: 50,
            listing_platform: Some("instagram".to_string()),
            request_timeout: Duration::from_secs(20),
            media_root: PathBuf::from("data/media"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePage {
    /// Newest first, as the platform returns them.
    pub messages: Vec<MessagingEvent>,
    pub next_cursor: Option<String>,
}

/// Message history of one external conversation, newest page first.
pub trait MessageHistory: Send + Sync {
    fn list_messages(&self, external_conversation_id: &str, cursor: Option<&str>) -> Result<MessagePage, PlatformError>;
}

pub trait MediaFetcher: Send + Sync {
    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, PlatformError>;
}
