use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Kind of envelope used in the JSON protocol.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Request,
    Response,
    Event,
}

/// Standard RPC style error object.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// Top level envelope exchanged between the archiver and the bridge process.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Envelope {
    pub id: Option<String>,
    pub kind: Kind,
    pub method: Option<String>,
    pub params: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
    pub topic: Option<String>,
    pub payload: Option<Value>,
}

impl Envelope {
    /// Build a request envelope carrying `params`.
    pub fn request(id: String, method: &str, params: Value) -> Self {
        Self {
            id: Some(id),
            kind: Kind::Request,
            method: Some(method.into()),
            params: Some(params),
            result: None,
            error: None,
            topic: None,
            payload: None,
        }
    }

    /// Build an event envelope for `topic`.
    pub fn event(topic: &str, payload: Value) -> Self {
        Self {
            id: None,
            kind: Kind::Event,
            method: None,
            params: None,
            result: None,
            error: None,
            topic: Some(topic.into()),
            payload: Some(payload),
        }
    }
}

/// Parameters the archiver sends with `bridge.hello`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Hello {
    pub api_id: String,
    pub api_hash: String,
    pub session: String,
    pub version: String,
}

/// A conversation as listed by the messaging service.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct DialogInfo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub is_channel: bool,
    #[serde(default)]
    pub archived: bool,
}

/// Media attached to a message, as described by the bridge.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Contact {
        first_name: String,
    },
    Document {
        #[serde(default)]
        file_name: Option<String>,
        #[serde(default)]
        extension: Option<String>,
        /// "video", "audio", "voice", "sticker"... when the bridge knows it.
        #[serde(default)]
        subtype: Option<String>,
    },
    WebPage,
    Geo,
    GeoLive,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct MediaDescriptor {
    /// Media id, used to tell apart items of one album.
    #[serde(default)]
    pub id: Option<i64>,
    pub kind: MediaKind,
    /// Self-destruct timer of the media, if any.
    #[serde(default)]
    pub ttl_seconds: Option<i64>,
}

/// A single message as seen by the bridge.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    pub id: i64,
    pub dialog_id: i64,
    #[serde(default, with = "time::serde::timestamp::option")]
    pub date: Option<OffsetDateTime>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub sender_id: Option<i64>,
    /// Authored by the archiving account.
    #[serde(default)]
    pub out: bool,
    #[serde(default)]
    pub media: Option<MediaDescriptor>,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub from_scheduled: bool,
    #[serde(default, with = "time::serde::timestamp::option")]
    pub edit_date: Option<OffsetDateTime>,
    #[serde(default)]
    pub grouped_id: Option<i64>,
}

/// Push events delivered while subscribed.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceEvent {
    NewMessage {
        dialog: DialogInfo,
        message: SourceMessage,
    },
    MessageEdited {
        dialog: DialogInfo,
        message: SourceMessage,
    },
    MessageRead {
        #[serde(default)]
        dialog: Option<DialogInfo>,
        message_ids: Vec<i64>,
        #[serde(default, with = "time::serde::timestamp::option")]
        read_at: Option<OffsetDateTime>,
    },
    MessageDeleted {
        #[serde(default)]
        dialog: Option<DialogInfo>,
        message_ids: Vec<i64>,
    },
}

impl SourceEvent {
    /// Topic name used on the wire for this event.
    pub fn topic(&self) -> &'static str {
        match self {
            SourceEvent::NewMessage { .. } => "message.new",
            SourceEvent::MessageEdited { .. } => "message.edited",
            SourceEvent::MessageRead { .. } => "message.read",
            SourceEvent::MessageDeleted { .. } => "message.deleted",
        }
    }

    /// Dialog the event refers to, when the service tells us.
    pub fn dialog(&self) -> Option<&DialogInfo> {
        match self {
            SourceEvent::NewMessage { dialog, .. } | SourceEvent::MessageEdited { dialog, .. } => {
                Some(dialog)
            }
            SourceEvent::MessageRead { dialog, .. } | SourceEvent::MessageDeleted { dialog, .. } => {
                dialog.as_ref()
            }
        }
    }
}
