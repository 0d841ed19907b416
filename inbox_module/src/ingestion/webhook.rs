//! Webhook payload shapes. Only the fields ingestion needs are typed; the
//! rest is carried through `extra` so the stored raw JSON stays complete.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

impl WebhookPayload {
    pub fn first_entry_id(&self) -> Option<&str> {
        self.entry.iter().find_map(|entry| entry.id.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookEntry {
    #[serde(default, deserialize_with = "opt_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub messaging: Vec<MessagingEvent>,
    #[serde(default)]
    pub changes: Vec<EntryChange>,
}

impl WebhookEntry {
    /// Events delivered directly under `messaging` plus those nested in
    /// `changes[].value.messaging`. Change values of other shapes are skipped.
    pub fn messaging_events(&self) -> Vec<MessagingEvent> {
        let mut events = self.messaging.clone();
        for change in &self.changes {
            let Some(value) = change.value.as_ref() else {
                continue;
            };
            if let Ok(nested) = serde_json::from_value::<ChangeValue>(value.clone()) {
                events.extend(nested.messaging);
            }
        }
        events
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntryChange {
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ChangeValue {
    #[serde(default)]
    messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(default, deserialize_with = "id")]
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagingEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<Participant>,
    #[serde(
        default,
        deserialize_with = "opt_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessageBody>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessagingEvent {
    pub fn sender_id(&self) -> Option<&str> {
        self.sender.as_ref().map(|p| p.id.as_str()).filter(|id| !id.is_empty())
    }

    pub fn recipient_id(&self) -> Option<&str> {
        self.recipient.as_ref().map(|p| p.id.as_str()).filter(|id| !id.is_empty())
    }

    /// Whether the event carries a live message worth storing.
    pub fn has_live_message(&self) -> bool {
        self.message.as_ref().map(|m| !m.is_deleted).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_echo: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageBody {
    pub fn mid(&self) -> Option<&str> {
        self.mid.as_deref().map(str::trim).filter(|mid| !mid.is_empty())
    }

    /// Attachment items, whether delivered as a list or as `{data: [...]}`.
    pub fn attachment_items(&self) -> Vec<&Value> {
        match self.attachments.as_ref() {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(Value::Object(map)) => match map.get("data") {
                Some(Value::Array(items)) => items.iter().collect(),
                _ => Vec::new(),
            },
            _ => Vec::new(),
        }
    }

    /// Message text, or a "title - subtitle" preview of the first template
    /// element when the message has no text.
    pub fn display_text(&self) -> Option<String> {
        if let Some(text) = self.text.as_deref().filter(|t| !t.trim().is_empty()) {
            return Some(text.to_string());
        }
        self.attachment_items().into_iter().find_map(template_preview)
    }
}

fn template_preview(item: &Value) -> Option<String> {
    let payload = item.get("payload")?;
    let elements = payload
        .get("generic")
        .and_then(|generic| generic.get("elements"))
        .or_else(|| payload.get("elements"))
        .or_else(|| payload.get("cards"))?
        .as_array()?;
    let first = elements.first()?;
    let title = first.get("title").and_then(Value::as_str).unwrap_or("").trim();
    let subtitle = first.get("subtitle").and_then(Value::as_str).unwrap_or("").trim();
    match (title.is_empty(), subtitle.is_empty()) {
        (true, true) => None,
        (false, true) => Some(title.to_string()),
        (true, false) => Some(subtitle.to_string()),
        (false, false) => Some(format!("{title} - {subtitle}")),
    }
}

fn value_to_id(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(value_to_id(Value::deserialize(deserializer)?).unwrap_or_default())
}

fn opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<Value>::deserialize(deserializer)?.and_then(value_to_id))
}

fn opt_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
