use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct DraftReply {
    pub text: String,
    pub model: Option<String>,
    pub confidence: Option<f64>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DraftOutcome {
    Reply(DraftReply),
    /// The drafter looked and decided nothing should be sent.
    NoReply { reason: Option<String> },
    /// A product or ad link is required before a reply can be drafted.
    NeedsLink,
    Escalate { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DraftError {
    /// Worth another attempt later; counts as a postponement.
    #[error("transient drafter failure: {0}")]
    Transient(String),
    #[error("drafter failure: {0}")]
    Fatal(String),
}

/// Writes the suggested reply for a conversation that has gone quiet.
pub trait ReplyDrafter: Send + Sync {
    fn draft(&self, conversation_id: i64, attempt_no: u32) -> Result<DraftOutcome, DraftError>;
}

#[derive(Debug, Serialize)]
struct DraftRequest {
    conversation_id: i64,
    attempt_no: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum DraftAction {
    Reply,
    NoReply,
    NeedsLink,
    Escalate,
}

#[derive(Debug, Deserialize)]
struct DraftResponse {
    action: DraftAction,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    reason: Option<String>,
}

/// Drafter reached over HTTP. Server errors and transport failures are
/// transient; client errors and unusable bodies are fatal.
#[derive(Debug, Clone)]
pub struct HttpReplyDrafter {
    endpoint: String,
    api_token: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpReplyDrafter {
    pub fn new(endpoint: impl Into<String>, api_token: Option<String>, timeout: Duration) -> Result<Self, DraftError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| DraftError::Fatal(err.to_string()))?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_token,
            client,
        })
    }
}

impl ReplyDrafter for HttpReplyDrafter {
    fn draft(&self, conversation_id: i64, attempt_no: u32) -> Result<DraftOutcome, DraftError> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .json(&DraftRequest {
                conversation_id,
                attempt_no,
            });
        if let Some(token) = &self.api_token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }
        let response = request
            .send()
            .map_err(|err| DraftError::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(DraftError::Transient(format!("drafter returned {}", status)));
        }
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(DraftError::Fatal(format!("drafter returned {}: {}", status, body)));
        }

        let body: DraftResponse = response
            .json()
            .map_err(|err| DraftError::Fatal(format!("invalid drafter response: {}", err)))?;
        match body.action {
            DraftAction::Reply => {
                let text = body
                    .text
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| DraftError::Fatal("reply action without text".to_string()))?;
                Ok(DraftOutcome::Reply(DraftReply {
                    text,
                    model: body.model,
                    confidence: body.confidence,
                    reason: body.reason,
                }))
            }
            DraftAction::NoReply => Ok(DraftOutcome::NoReply { reason: body.reason }),
            DraftAction::NeedsLink => Ok(DraftOutcome::NeedsLink),
            DraftAction::Escalate => Ok(DraftOutcome::Escalate {
                reason: body.reason.unwrap_or_else(|| "escalated by drafter".to_string()),
            }),
        }
    }
}
