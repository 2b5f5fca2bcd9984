//! The chat-side collaborator: what the relay needs from the homeserver.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("homeserver returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Room state slots the relay mirrors into its cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Name,
    Topic,
    Avatar,
}

impl StateKind {
    pub const ALL: [StateKind; 3] = [StateKind::Name, StateKind::Topic, StateKind::Avatar];

    pub fn event_type(self) -> &'static str {
        match self {
            StateKind::Name => "m.room.name",
            StateKind::Topic => "m.room.topic",
            StateKind::Avatar => "m.room.avatar",
        }
    }

    /// Content field carrying the value.
    pub fn content_key(self) -> &'static str {
        match self {
            StateKind::Name => "name",
            StateKind::Topic => "topic",
            StateKind::Avatar => "url",
        }
    }

    pub fn from_event_type(event_type: &str) -> Option<Self> {
        StateKind::ALL
            .into_iter()
            .find(|kind| kind.event_type() == event_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Notice,
    Emote,
    Image,
    Video,
    Audio,
    File,
    Other,
}

impl MessageKind {
    pub fn from_msgtype(msgtype: &str) -> Self {
        match msgtype {
            "m.text" => MessageKind::Text,
            "m.notice" => MessageKind::Notice,
            "m.emote" => MessageKind::Emote,
            "m.image" => MessageKind::Image,
            "m.video" => MessageKind::Video,
            "m.audio" => MessageKind::Audio,
            "m.file" => MessageKind::File,
            _ => MessageKind::Other,
        }
    }

    pub fn msgtype(self) -> &'static str {
        match self {
            MessageKind::Text => "m.text",
            MessageKind::Notice => "m.notice",
            MessageKind::Emote => "m.emote",
            MessageKind::Image => "m.image",
            MessageKind::Video => "m.video",
            MessageKind::Audio => "m.audio",
            MessageKind::File | MessageKind::Other => "m.file",
        }
    }

    pub fn is_media(self) -> bool {
        matches!(
            self,
            MessageKind::Image | MessageKind::Video | MessageKind::Audio | MessageKind::File
        )
    }

    /// Media subtype for an uploaded file.
    pub fn for_mime(mime: &str) -> Self {
        if mime.starts_with("image/") {
            MessageKind::Image
        } else if mime.starts_with("video/") {
            MessageKind::Video
        } else if mime.starts_with("audio/") {
            MessageKind::Audio
        } else {
            MessageKind::File
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomMessage {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    pub kind: MessageKind,
    pub body: String,
    /// Media reference, for media messages.
    pub media_url: Option<String>,
    /// Event this message replies to.
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub event_id: String,
    pub room_id: String,
    pub sender: String,
    pub target_event_id: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub room_id: String,
    pub kind: StateKind,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Message(RoomMessage),
    Reaction(Reaction),
    StateChange(StateChange),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedText {
    pub body: String,
    pub html: Option<String>,
}

impl FormattedText {
    pub fn plain(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            html: None,
        }
    }

    pub fn html(body: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            html: Some(html.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaMessage {
    pub kind: MessageKind,
    pub filename: String,
    pub url: String,
    pub mimetype: String,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingMessage {
    Text(FormattedText),
    Media(MediaMessage),
}

/// Where a piece of media can be fetched from, and its declared size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaSource {
    pub download_url: String,
    pub content_length: Option<u64>,
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// The bot's own user id.
    fn user_id(&self) -> &str;

    /// Current value of a room state slot; `None` when unset.
    async fn room_state(
        &self,
        room_id: &str,
        kind: StateKind,
    ) -> Result<Option<String>, TransportError>;

    async fn set_room_state(
        &self,
        room_id: &str,
        kind: StateKind,
        value: &str,
    ) -> Result<(), TransportError>;

    async fn fetch_message(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<RoomMessage, TransportError>;

    async fn media_source(&self, media_url: &str) -> Result<MediaSource, TransportError>;

    /// Stops reading once more than `limit` bytes have arrived, so an
    /// oversized body comes back longer than `limit` but bounded.
    async fn download_media(
        &self,
        source: &MediaSource,
        limit: u64,
    ) -> Result<Vec<u8>, TransportError>;

    /// Returns the media reference of the upload.
    async fn upload_media(
        &self,
        data: Vec<u8>,
        filename: &str,
        mimetype: &str,
    ) -> Result<String, TransportError>;

    /// Returns the event id of the sent reply.
    async fn send_reply(
        &self,
        room_id: &str,
        in_reply_to: &str,
        message: &OutgoingMessage,
    ) -> Result<String, TransportError>;

    async fn react(&self, room_id: &str, event_id: &str, key: &str)
        -> Result<String, TransportError>;

    async fn redact(&self, room_id: &str, event_id: &str, reason: &str)
        -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::{MessageKind, StateKind};

    #[test]
    fn mime_prefix_selects_subtype() {
        assert_eq!(MessageKind::for_mime("image/png"), MessageKind::Image);
        assert_eq!(MessageKind::for_mime("video/webm"), MessageKind::Video);
        assert_eq!(MessageKind::for_mime("audio/ogg"), MessageKind::Audio);
        assert_eq!(MessageKind::for_mime("text/plain"), MessageKind::File);
        assert_eq!(MessageKind::for_mime("imagery/x"), MessageKind::File);
    }

    #[test]
    fn msgtype_round_trip_and_media_detection() {
        assert_eq!(MessageKind::from_msgtype("m.text"), MessageKind::Text);
        assert!(MessageKind::from_msgtype("m.image").is_media());
        assert!(!MessageKind::from_msgtype("m.notice").is_media());
        assert_eq!(MessageKind::from_msgtype("org.custom"), MessageKind::Other);
    }

    #[test]
    fn state_kinds_map_to_event_types() {
        assert_eq!(StateKind::from_event_type("m.room.topic"), Some(StateKind::Topic));
        assert_eq!(StateKind::from_event_type("m.room.member"), None);
        assert_eq!(StateKind::Avatar.content_key(), "url");
    }
}
