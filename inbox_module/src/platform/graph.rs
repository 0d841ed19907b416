use chrono::DateTime;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    MediaFetcher, MessageHistory, MessagePage, PlatformError, PlatformSettings, RateLimiter,
};
use crate::conversations::{ConversationDirectory, DirectoryConversation, DirectoryPage};
use crate::ingestion::webhook::{MessageBody, MessagingEvent, Participant};

const CONVERSATION_FIELDS: &str = "id,updated_time,participants";
const MESSAGE_FIELDS: &str = "id,from,to,created_time,message,attachments";

#[derive(Debug, Clone, Deserialize)]
struct Listing<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Paging {
    #[serde(default)]
    cursors: Option<Cursors>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Cursors {
    #[serde(default)]
    after: Option<String>,
}

impl<T> Listing<T> {
    /// The `after` cursor, only when the platform says another page exists.
    fn next_cursor(&self) -> Option<String> {
        let paging = self.paging.as_ref()?;
        paging.next.as_ref()?;
        paging
            .cursors
            .as_ref()
            .and_then(|c| c.after.clone())
            .filter(|after| !after.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct GraphConversation {
    id: String,
    #[serde(default)]
    participants: Option<Listing<GraphParticipant>>,
}

#[derive(Debug, Clone, Deserialize)]
struct GraphParticipant {
    id: String,
}

/// One message as returned by the history endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct GraphMessage {
    pub id: String,
    #[serde(default)]
    from: Option<GraphParticipant>,
    #[serde(default)]
    to: Option<Listing<GraphParticipant>>,
    #[serde(default)]
    pub created_time: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub attachments: Option<Value>,
}

impl GraphMessage {
    /// Reshapes the history record into the webhook event form so both
    /// paths share one upsert.
    pub fn to_messaging_event(&self) -> MessagingEvent {
        let participant = |id: &str| Participant { id: id.to_string() };
        MessagingEvent {
            sender: self.from.as_ref().map(|from| participant(&from.id)),
            recipient: self
                .to
                .as_ref()
                .and_then(|to| to.data.first())
                .map(|to| participant(&to.id)),
            timestamp: self.created_time.as_deref().and_then(parse_created_time),
            message: Some(MessageBody {
                mid: Some(self.id.clone()),
                text: self.message.clone().filter(|text| !text.is_empty()),
                attachments: self.attachments.clone(),
                ..MessageBody::default()
            }),
            ..MessagingEvent::default()
        }
    }
}

fn parse_created_time(raw: &str) -> Option<i64> {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|parsed| parsed.timestamp_millis())
        .ok()
}

/// Blocking client for the platform's Graph-style API. Every request goes
/// through the shared rate limiter.
pub struct GraphClient {
    settings: PlatformSettings,
    client: Client,
    limiter: RateLimiter,
}

impl GraphClient {
    pub fn new(settings: PlatformSettings) -> Result<Self, PlatformError> {
        let client = Client::builder().timeout(settings.request_timeout).build()?;
        let limiter = RateLimiter::per_minute(settings.requests_per_minute);
        Ok(Self {
            settings,
            client,
            limiter,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.settings.api_base.trim_end_matches('/'),
            self.settings.api_version,
            path.trim_start_matches('/')
        )
    }

    fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, PlatformError> {
        let (credentials, _) = self.settings.credentials.resolve()?;
        self.limiter.acquire();
        let url = self.endpoint(path);
        debug!("platform request path={}", path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&credentials.access_token)
            .query(query)
            .send()?;
        let body = check_status(response)?.text()?;
        Ok(serde_json::from_str(&body)?)
    }
}

fn check_status(response: Response) -> Result<Response, PlatformError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.as_u16() == 429 {
        return Err(PlatformError::RateLimited);
    }
    let body = response.text().unwrap_or_default();
    warn!("platform request failed status={} body={}", status, body);
    Err(PlatformError::Status {
        status: status.as_u16(),
        body,
    })
}

impl ConversationDirectory for GraphClient {
    fn list_conversations(&self, cursor: Option<&str>) -> Result<DirectoryPage, PlatformError> {
        let (credentials, is_page) = self.settings.credentials.resolve()?;
        let mut query = vec![
            ("fields", CONVERSATION_FIELDS.to_string()),
            ("limit", self.settings.page_size.to_string()),
        ];
        if is_page {
            if let Some(platform) = &self.settings.listing_platform {
                query.push(("platform", platform.clone()));
            }
        }
        if let Some(after) = cursor {
            query.push(("after", after.to_string()));
        }
        let listing: Listing<GraphConversation> =
            self.get_json(&format!("{}/conversations", credentials.owner_id), &query)?;
        let next_cursor = listing.next_cursor();
        let conversations = listing
            .data
            .into_iter()
            .map(|conversation| DirectoryConversation {
                external_id: conversation.id,
                participant_ids: conversation
                    .participants
                    .map(|p| p.data.into_iter().map(|participant| participant.id).collect())
                    .unwrap_or_default(),
            })
            .collect();
        Ok(DirectoryPage {
            conversations,
            next_cursor,
        })
    }
}

impl MessageHistory for GraphClient {
    fn list_messages(&self, external_conversation_id: &str, cursor: Option<&str>) -> Result<MessagePage, PlatformError> {
        let mut query = vec![
            ("fields", MESSAGE_FIELDS.to_string()),
            ("limit", self.settings.page_size.to_string()),
        ];
        if let Some(after) = cursor {
            query.push(("after", after.to_string()));
        }
        let listing: Listing<GraphMessage> =
            self.get_json(&format!("{}/messages", external_conversation_id), &query)?;
        Ok(MessagePage {
            next_cursor: listing.next_cursor(),
            messages: listing.data.iter().map(GraphMessage::to_messaging_event).collect(),
        })
    }
}

impl MediaFetcher for GraphClient {
    /// Media URLs are usually pre-signed CDN links; the bearer token is only
    /// attached when the URL points back at the API host.
    fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, PlatformError> {
        self.limiter.acquire();
        let mut request = self.client.get(url);
        if url.starts_with(self.settings.api_base.trim_end_matches('/')) {
            let (credentials, _) = self.settings.credentials.resolve()?;
            request = request.bearer_auth(&credentials.access_token);
        }
        let response = check_status(request.send()?)?;
        Ok(response.bytes()?.to_vec())
    }
}
