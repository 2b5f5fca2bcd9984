//! Matrix client-server API implementation of [`ChatTransport`].

use async_trait::async_trait;
use reqwest::{header::CONTENT_LENGTH, Method, RequestBuilder, StatusCode};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::transport::{
    ChatTransport, InboundEvent, MediaSource, MessageKind, OutgoingMessage, Reaction, RoomMessage,
    StateChange, StateKind, TransportError,
};

const HTML_FORMAT: &str = "org.matrix.custom.html";
const MXC_PREFIX: &str = "mxc://";

/// One `/sync` response reduced to what the relay consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncBatch {
    pub next_batch: String,
    pub events: Vec<InboundEvent>,
}

#[derive(Clone)]
pub struct MatrixTransport {
    http: reqwest::Client,
    homeserver: String,
    access_token: String,
    user_id: String,
}

impl MatrixTransport {
    pub fn new(
        homeserver: impl Into<String>,
        access_token: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        let homeserver: String = homeserver.into();
        Self {
            http: reqwest::Client::new(),
            homeserver: homeserver.trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            user_id: user_id.into(),
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http
            .request(method, url)
            .bearer_auth(&self.access_token)
    }

    fn client_url(&self, path: &str) -> String {
        format!("{}/_matrix/client/v3{}", self.homeserver, path)
    }

    fn room_url(&self, room_id: &str, rest: &str) -> String {
        self.client_url(&format!("/rooms/{}{}", urlencoding::encode(room_id), rest))
    }

    /// Long-poll for new events. `since` is the previous `next_batch`.
    pub async fn sync(&self, since: Option<&str>, timeout_ms: u64) -> Result<SyncBatch, TransportError> {
        let timeout = timeout_ms.to_string();
        let mut query = vec![("timeout", timeout.as_str())];
        if let Some(since) = since {
            query.push(("since", since));
        }
        let res = self
            .request(Method::GET, &self.client_url("/sync"))
            .query(&query)
            .send()
            .await?;
        let body = json_body(res).await?;
        parse_sync(&body)
    }

    async fn send_event(
        &self,
        room_id: &str,
        event_type: &str,
        content: &Value,
    ) -> Result<String, TransportError> {
        let url = self.room_url(
            room_id,
            &format!("/send/{}/{}", urlencoding::encode(event_type), Uuid::new_v4()),
        );
        let res = self.request(Method::PUT, &url).json(content).send().await?;
        let body = json_body(res).await?;
        string_field(&body, "event_id")
    }
}

#[async_trait]
impl ChatTransport for MatrixTransport {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn room_state(
        &self,
        room_id: &str,
        kind: StateKind,
    ) -> Result<Option<String>, TransportError> {
        let url = self.room_url(room_id, &format!("/state/{}", kind.event_type()));
        let res = self.request(Method::GET, &url).send().await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = json_body(res).await?;
        Ok(body
            .get(kind.content_key())
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned))
    }

    async fn set_room_state(
        &self,
        room_id: &str,
        kind: StateKind,
        value: &str,
    ) -> Result<(), TransportError> {
        let url = self.room_url(room_id, &format!("/state/{}", kind.event_type()));
        let mut content = Map::new();
        content.insert(kind.content_key().to_string(), Value::from(value));
        let res = self
            .request(Method::PUT, &url)
            .json(&Value::Object(content))
            .send()
            .await?;
        json_body(res).await?;
        Ok(())
    }

    async fn fetch_message(
        &self,
        room_id: &str,
        event_id: &str,
    ) -> Result<RoomMessage, TransportError> {
        let url = self.room_url(room_id, &format!("/event/{}", urlencoding::encode(event_id)));
        let res = self.request(Method::GET, &url).send().await?;
        let body = json_body(res).await?;
        parse_room_message(room_id, &body).ok_or_else(|| {
            TransportError::InvalidResponse(format!("{event_id} is not a room message"))
        })
    }

    async fn media_source(&self, media_url: &str) -> Result<MediaSource, TransportError> {
        let download_url = media_download_url(&self.homeserver, media_url).ok_or_else(|| {
            TransportError::InvalidResponse(format!("not a media reference: {media_url}"))
        })?;
        let res = self.request(Method::HEAD, &download_url).send().await?;
        if !res.status().is_success() {
            return Err(TransportError::Status {
                status: res.status().as_u16(),
                body: String::new(),
            });
        }
        let content_length = res
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok());
        Ok(MediaSource {
            download_url,
            content_length,
        })
    }

    async fn download_media(
        &self,
        source: &MediaSource,
        limit: u64,
    ) -> Result<Vec<u8>, TransportError> {
        let mut res = self
            .request(Method::GET, &source.download_url)
            .send()
            .await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let mut data = Vec::new();
        while let Some(chunk) = res.chunk().await? {
            data.extend_from_slice(&chunk);
            if data.len() as u64 > limit {
                break;
            }
        }
        Ok(data)
    }

    async fn upload_media(
        &self,
        data: Vec<u8>,
        filename: &str,
        mimetype: &str,
    ) -> Result<String, TransportError> {
        let url = format!("{}/_matrix/media/v3/upload", self.homeserver);
        let res = self
            .request(Method::POST, &url)
            .query(&[("filename", filename)])
            .header(reqwest::header::CONTENT_TYPE, mimetype)
            .body(data)
            .send()
            .await?;
        let body = json_body(res).await?;
        string_field(&body, "content_uri")
    }

    async fn send_reply(
        &self,
        room_id: &str,
        in_reply_to: &str,
        message: &OutgoingMessage,
    ) -> Result<String, TransportError> {
        let content = reply_content(in_reply_to, message);
        self.send_event(room_id, "m.room.message", &content).await
    }

    async fn react(
        &self,
        room_id: &str,
        event_id: &str,
        key: &str,
    ) -> Result<String, TransportError> {
        let content = json!({
            "m.relates_to": {
                "rel_type": "m.annotation",
                "event_id": event_id,
                "key": key,
            }
        });
        self.send_event(room_id, "m.reaction", &content).await
    }

    async fn redact(
        &self,
        room_id: &str,
        event_id: &str,
        reason: &str,
    ) -> Result<(), TransportError> {
        let url = self.room_url(
            room_id,
            &format!("/redact/{}/{}", urlencoding::encode(event_id), Uuid::new_v4()),
        );
        let res = self
            .request(Method::PUT, &url)
            .json(&json!({ "reason": reason }))
            .send()
            .await?;
        json_body(res).await?;
        Ok(())
    }
}

async fn json_body(res: reqwest::Response) -> Result<Value, TransportError> {
    let status = res.status();
    let text = res.text().await?;
    if !status.is_success() {
        return Err(TransportError::Status {
            status: status.as_u16(),
            body: text,
        });
    }
    Ok(serde_json::from_str(&text)?)
}

fn string_field(body: &Value, field: &str) -> Result<String, TransportError> {
    body.get(field)
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| TransportError::InvalidResponse(format!("response missing {field}")))
}

/// Authenticated download endpoint for an `mxc://server/id` reference.
pub fn media_download_url(homeserver: &str, media_url: &str) -> Option<String> {
    let (server, media_id) = media_url.strip_prefix(MXC_PREFIX)?.split_once('/')?;
    if server.is_empty() || media_id.is_empty() || media_id.contains('/') {
        return None;
    }
    Some(format!(
        "{}/_matrix/client/v1/media/download/{}/{}",
        homeserver.trim_end_matches('/'),
        urlencoding::encode(server),
        urlencoding::encode(media_id)
    ))
}

pub fn reply_content(in_reply_to: &str, message: &OutgoingMessage) -> Value {
    let mut content = match message {
        OutgoingMessage::Text(text) => {
            let mut content = json!({
                "msgtype": MessageKind::Notice.msgtype(),
                "body": text.body,
            });
            if let Some(html) = &text.html {
                content["format"] = json!(HTML_FORMAT);
                content["formatted_body"] = json!(html);
            }
            content
        }
        OutgoingMessage::Media(media) => json!({
            "msgtype": media.kind.msgtype(),
            "body": media.filename,
            "url": media.url,
            "info": {
                "size": media.size,
                "mimetype": media.mimetype,
            },
        }),
    };
    content["m.relates_to"] = json!({ "m.in_reply_to": { "event_id": in_reply_to } });
    content
}

pub fn parse_sync(body: &Value) -> Result<SyncBatch, TransportError> {
    let next_batch = string_field(body, "next_batch")?;
    let mut events = Vec::new();
    if let Some(joined) = body.pointer("/rooms/join").and_then(Value::as_object) {
        for (room_id, room) in joined {
            // State from a gapped sync precedes the timeline it leads into.
            for section in ["/state/events", "/timeline/events"] {
                let section = room
                    .pointer(section)
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                events.extend(
                    section
                        .iter()
                        .filter_map(|event| parse_timeline_event(room_id, event)),
                );
            }
        }
    }
    Ok(SyncBatch { next_batch, events })
}

pub fn parse_timeline_event(room_id: &str, event: &Value) -> Option<InboundEvent> {
    let event_type = event.get("type")?.as_str()?;
    match event_type {
        "m.room.message" => parse_room_message(room_id, event).map(InboundEvent::Message),
        "m.reaction" => {
            let relates_to = event.pointer("/content/m.relates_to")?;
            if relates_to.get("rel_type")?.as_str()? != "m.annotation" {
                return None;
            }
            Some(InboundEvent::Reaction(Reaction {
                event_id: event.get("event_id")?.as_str()?.to_string(),
                room_id: room_id.to_string(),
                sender: event.get("sender")?.as_str()?.to_string(),
                target_event_id: relates_to.get("event_id")?.as_str()?.to_string(),
                key: relates_to.get("key")?.as_str()?.to_string(),
            }))
        }
        other => {
            let kind = StateKind::from_event_type(other)?;
            if !event.get("state_key")?.as_str()?.is_empty() {
                return None;
            }
            let value = event
                .get("content")
                .and_then(|content| content.get(kind.content_key()))
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default()
                .to_string();
            Some(InboundEvent::StateChange(StateChange {
                room_id: room_id.to_string(),
                kind,
                value,
            }))
        }
    }
}

fn parse_room_message(room_id: &str, event: &Value) -> Option<RoomMessage> {
    if event.get("type")?.as_str()? != "m.room.message" {
        return None;
    }
    let content = event.get("content")?;
    let kind = MessageKind::from_msgtype(content.get("msgtype")?.as_str()?);
    Some(RoomMessage {
        event_id: event.get("event_id")?.as_str()?.to_string(),
        room_id: room_id.to_string(),
        sender: event.get("sender")?.as_str()?.to_string(),
        kind,
        body: content
            .get("body")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        media_url: content
            .get("url")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
        reply_to: content
            .pointer("/m.relates_to/m.in_reply_to/event_id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
    })
}

#[cfg(test)]
mod tests {
    use httpmock::Method::{GET, PUT};
    use httpmock::MockServer;
    use serde_json::json;

    use super::{media_download_url, parse_sync, reply_content, MatrixTransport};
    use crate::transport::{
        ChatTransport, FormattedText, InboundEvent, MediaMessage, MediaSource, MessageKind,
        OutgoingMessage, StateKind,
    };

    #[test]
    fn download_url_from_media_reference() {
        assert_eq!(
            media_download_url("https://hs.example/", "mxc://example.org/abc123").as_deref(),
            Some("https://hs.example/_matrix/client/v1/media/download/example.org/abc123")
        );
        assert_eq!(media_download_url("https://hs", "https://x/y"), None);
        assert_eq!(media_download_url("https://hs", "mxc://example.org"), None);
        assert_eq!(media_download_url("https://hs", "mxc://example.org/a/b"), None);
    }

    #[test]
    fn text_reply_carries_html_and_relation() {
        let content = reply_content(
            "$orig",
            &OutgoingMessage::Text(FormattedText::html("hi", "<b>hi</b>")),
        );
        assert_eq!(content["msgtype"], "m.notice");
        assert_eq!(content["format"], "org.matrix.custom.html");
        assert_eq!(content["formatted_body"], "<b>hi</b>");
        assert_eq!(content["m.relates_to"]["m.in_reply_to"]["event_id"], "$orig");

        let plain = reply_content("$orig", &OutgoingMessage::Text(FormattedText::plain("x")));
        assert!(plain.get("formatted_body").is_none());
    }

    #[test]
    fn media_reply_uses_subtype_and_info() {
        let content = reply_content(
            "$orig",
            &OutgoingMessage::Media(MediaMessage {
                kind: MessageKind::Image,
                filename: "plot.png".into(),
                url: "mxc://example.org/plot".into(),
                mimetype: "image/png".into(),
                size: 42,
            }),
        );
        assert_eq!(content["msgtype"], "m.image");
        assert_eq!(content["body"], "plot.png");
        assert_eq!(content["info"]["size"], 42);
        assert_eq!(content["info"]["mimetype"], "image/png");
    }

    #[test]
    fn sync_maps_timeline_events() {
        let body = json!({
            "next_batch": "s2",
            "rooms": {"join": {"!r:x": {"timeline": {"events": [
                {
                    "type": "m.room.message",
                    "event_id": "$m",
                    "sender": "@alice:x",
                    "content": {
                        "msgtype": "m.text",
                        "body": "!!echo hi",
                        "m.relates_to": {"m.in_reply_to": {"event_id": "$prev"}}
                    }
                },
                {
                    "type": "m.reaction",
                    "event_id": "$r",
                    "sender": "@bob:x",
                    "content": {"m.relates_to": {"rel_type": "m.annotation", "event_id": "$m", "key": "delete"}}
                },
                {"type": "m.room.topic", "state_key": "", "event_id": "$t", "sender": "@a:x", "content": {"topic": " new "}},
                {"type": "m.room.name", "state_key": "", "event_id": "$n", "sender": "@a:x", "content": {}},
                {"type": "m.room.member", "state_key": "@a:x", "event_id": "$j", "sender": "@a:x", "content": {}}
            ]}}}}
        });

        let batch = parse_sync(&body).unwrap();
        assert_eq!(batch.next_batch, "s2");
        assert_eq!(batch.events.len(), 4);
        match &batch.events[0] {
            InboundEvent::Message(message) => {
                assert_eq!(message.kind, MessageKind::Text);
                assert_eq!(message.reply_to.as_deref(), Some("$prev"));
            }
            other => panic!("unexpected {other:?}"),
        }
        match &batch.events[1] {
            InboundEvent::Reaction(reaction) => {
                assert_eq!(reaction.target_event_id, "$m");
                assert_eq!(reaction.key, "delete");
            }
            other => panic!("unexpected {other:?}"),
        }
        match &batch.events[2] {
            InboundEvent::StateChange(change) => {
                assert_eq!(change.kind, StateKind::Topic);
                assert_eq!(change.value, "new");
            }
            other => panic!("unexpected {other:?}"),
        }
        match &batch.events[3] {
            InboundEvent::StateChange(change) => assert_eq!(change.value, ""),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn gapped_sync_keeps_state_section_changes() {
        let body = json!({
            "next_batch": "s3",
            "rooms": {"join": {"!r:x": {
                "state": {"events": [
                    {"type": "m.room.name", "state_key": "", "event_id": "$n", "sender": "@a:x", "content": {"name": "Renamed"}}
                ]},
                "timeline": {"limited": true, "events": [
                    {"type": "m.room.name", "state_key": "", "event_id": "$n2", "sender": "@a:x", "content": {"name": "Latest"}}
                ]}
            }}}
        });

        let batch = parse_sync(&body).unwrap();
        let names: Vec<&str> = batch
            .events
            .iter()
            .map(|event| match event {
                InboundEvent::StateChange(change) => change.value.as_str(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(names, vec!["Renamed", "Latest"]);

        let state_only = json!({
            "next_batch": "s4",
            "rooms": {"join": {"!r:x": {
                "state": {"events": [
                    {"type": "m.room.topic", "state_key": "", "event_id": "$t", "sender": "@a:x", "content": {"topic": "moved"}}
                ]},
                "timeline": {"limited": true, "events": []}
            }}}
        });
        assert_eq!(parse_sync(&state_only).unwrap().events.len(), 1);
    }

    #[test]
    fn sync_without_next_batch_is_invalid() {
        assert!(parse_sync(&json!({"rooms": {}})).is_err());
        assert!(parse_sync(&json!({"next_batch": "s1"})).unwrap().events.is_empty());
    }

    #[tokio::test]
    async fn room_state_reads_value_and_treats_404_as_unset() {
        let server = MockServer::start();
        let name = server.mock(|when, then| {
            when.method(GET)
                .path_contains("/state/m.room.name")
                .header("authorization", "Bearer syt_token");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"name":"  Lobby  "}"#);
        });
        server.mock(|when, then| {
            when.method(GET)
                .path_contains("/state/m.room.topic");
            then.status(404)
                .header("content-type", "application/json")
                .body(r#"{"errcode":"M_NOT_FOUND","error":"Event not found."}"#);
        });

        let transport = MatrixTransport::new(server.base_url(), "syt_token", "@maush:example.org");
        assert_eq!(
            transport
                .room_state("!room:example.org", StateKind::Name)
                .await
                .unwrap()
                .as_deref(),
            Some("Lobby")
        );
        assert_eq!(
            transport
                .room_state("!room:example.org", StateKind::Topic)
                .await
                .unwrap(),
            None
        );
        name.assert_hits(1);
    }

    #[tokio::test]
    async fn send_reply_returns_event_id() {
        let server = MockServer::start();
        let send = server.mock(|when, then| {
            when.method(PUT)
                .path_contains("/send/m.room.message/")
                .json_body_partial(r#"{"body":"done","m.relates_to":{"m.in_reply_to":{"event_id":"$orig"}}}"#);
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"event_id":"$reply"}"#);
        });

        let transport = MatrixTransport::new(server.base_url(), "syt_token", "@maush:example.org");
        let event_id = transport
            .send_reply(
                "!room:example.org",
                "$orig",
                &OutgoingMessage::Text(FormattedText::plain("done")),
            )
            .await
            .unwrap();
        assert_eq!(event_id, "$reply");
        send.assert_hits(1);
    }

    #[tokio::test]
    async fn download_stops_past_the_limit() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/media/blob");
            then.status(200).body(vec![7u8; 4096]);
        });

        let transport = MatrixTransport::new(server.base_url(), "syt_token", "@maush:example.org");
        let source = MediaSource {
            download_url: server.url("/media/blob"),
            content_length: None,
        };
        let whole = transport.download_media(&source, 8192).await.unwrap();
        assert_eq!(whole.len(), 4096);
        let capped = transport.download_media(&source, 16).await.unwrap();
        assert!(capped.len() > 16 && capped.len() <= 4096);
    }

    #[tokio::test]
    async fn errors_surface_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(PUT).path_contains("/redact/");
            then.status(403).body(r#"{"errcode":"M_FORBIDDEN"}"#);
        });

        let transport = MatrixTransport::new(server.base_url(), "syt_token", "@maush:example.org");
        let err = transport
            .redact("!room:example.org", "$ev", "Delete requested by @a:x")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("403"));
    }
}
