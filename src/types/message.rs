use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Addressing information for a single message, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageKey {
    pub remote_jid: String,
    #[serde(default)]
    pub from_me: bool,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<String>,
}

/// Message content. Only the shapes the session layer inspects are modelled;
/// everything else is carried through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessagePayload {
    Conversation(String),
    ExtendedTextMessage {
        text: String,
    },
    ImageMessage {
        #[serde(default)]
        caption: Option<String>,
    },
    VideoMessage {
        #[serde(default)]
        caption: Option<String>,
    },
    EphemeralMessage {
        message: Box<MessagePayload>,
    },
    #[serde(untagged)]
    Other(serde_json::Value),
}

// Content keys looked up when a payload carries extra sibling keys such as
// `messageContextInfo`. Ephemeral wrapping wins over everything else.
const CONTENT_KEYS: [&str; 5] = [
    "ephemeralMessage",
    "conversation",
    "extendedTextMessage",
    "imageMessage",
    "videoMessage",
];

impl MessagePayload {
    /// Removes one layer of ephemeral wrapping, if present.
    pub fn unwrap_ephemeral(self) -> MessagePayload {
        match self.into_known() {
            MessagePayload::EphemeralMessage { message } => (*message).into_known(),
            other => other,
        }
    }

    /// Resolves an `Other` object that holds a modelled content key next to
    /// keys this layer does not inspect.
    fn into_known(self) -> MessagePayload {
        match self {
            MessagePayload::Other(serde_json::Value::Object(map)) => {
                match known_content(&map) {
                    Some(payload) => payload,
                    None => MessagePayload::Other(serde_json::Value::Object(map)),
                }
            }
            other => other,
        }
    }

    pub fn is_ephemeral(&self) -> bool {
        matches!(self, MessagePayload::EphemeralMessage { .. })
    }

    pub fn text_content(&self) -> Option<&str> {
        match self {
            MessagePayload::Conversation(text) => Some(text),
            MessagePayload::ExtendedTextMessage { text } => Some(text),
            MessagePayload::ImageMessage { caption } | MessagePayload::VideoMessage { caption } => {
                caption.as_deref()
            }
            MessagePayload::EphemeralMessage { message } => message.text_content(),
            MessagePayload::Other(_) => None,
        }
    }
}

fn known_content(map: &serde_json::Map<String, serde_json::Value>) -> Option<MessagePayload> {
    CONTENT_KEYS.iter().find_map(|key| {
        let value = map.get(*key)?;
        let mut single = serde_json::Map::new();
        single.insert((*key).to_string(), value.clone());
        match serde_json::from_value(serde_json::Value::Object(single)) {
            Ok(MessagePayload::Other(_)) | Err(_) => None,
            Ok(payload) => Some(payload),
        }
    })
}

/// A message exactly as it arrives in a `messages.upsert` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    pub key: MessageKey,
    #[serde(default)]
    pub message: Option<MessagePayload>,
    /// Unix timestamp in seconds.
    #[serde(default)]
    pub message_timestamp: Option<i64>,
    #[serde(default)]
    pub push_name: Option<String>,
}

/// Whether an upsert batch is a live notification or a history append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertKind {
    Notify,
    Append,
}

/// A normalized inbound message handed to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub id: String,
    pub remote_id: String,
    pub from_self: bool,
    pub participant: Option<String>,
    pub push_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub kind: UpsertKind,
    pub payload: MessagePayload,
}

impl InboundMessage {
    /// Builds a normalized message, unwrapping one ephemeral layer.
    /// Returns `None` when the raw message carries no payload.
    pub fn from_raw(raw: RawMessage, kind: UpsertKind) -> Option<Self> {
        let payload = raw.message?.unwrap_ephemeral();
        let timestamp = raw
            .message_timestamp
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now);

        Some(Self {
            id: raw.key.id,
            remote_id: raw.key.remote_jid,
            from_self: raw.key.from_me,
            participant: raw.key.participant,
            push_name: raw.push_name,
            timestamp,
            kind,
            payload,
        })
    }

    pub fn text_content(&self) -> Option<&str> {
        self.payload.text_content()
    }
}
