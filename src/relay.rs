//! The exec relay: turns chat commands into backend executions and applies
//! what comes back.

use std::{collections::HashSet, sync::Arc};

use crate::{
    ansi_html::escape_html,
    backend::{BackendClient, BackendError},
    commands::{self, ExecCommand},
    output,
    pending::PendingDeletions,
    protocol::{Device, DeviceBundle, ExecRequest, OutFile, Sender},
    room_cache::{RoomMetadata, RoomMetadataCache},
    transport::{
        ChatTransport, FormattedText, InboundEvent, MediaMessage, MessageKind, OutgoingMessage,
        Reaction, RoomMessage, StateChange, TransportError,
    },
    trust::{self, TrustDecision},
};

pub const DELETE_REACTION: &str = "delete";
pub const TRUST_REFUSAL: &str = "3:<";
pub const UNSUPPORTED_USER: &str = "User ID not supported";
pub const BACKEND_UNREACHABLE: &str = "Failed to send request to maush";
pub const BACKEND_DOWN: &str = "maush is currently down";
const INCIDENT_URL: &str = "https://xkcd.com/838/";
pub const MAX_REPLY_FILE_BYTES: u64 = 8 * 1024 * 1024;

/// Who may use the relay, and how.
#[derive(Debug, Clone, Default)]
pub struct RelayPolicy {
    pub rooms: HashSet<String>,
    pub admins: HashSet<String>,
    pub untrusted: HashSet<String>,
    pub command_prefix: String,
}

/// Outcome of fetching the file behind a replied-to media message.
#[derive(Debug)]
pub enum Attachment {
    Fetched(Vec<u8>),
    TooLarge(u64),
    Failed(TransportError),
}

pub struct ExecRelay {
    transport: Arc<dyn ChatTransport>,
    backend: BackendClient,
    policy: RelayPolicy,
    rooms: RoomMetadataCache,
    pending: PendingDeletions,
}

impl ExecRelay {
    pub fn new(transport: Arc<dyn ChatTransport>, backend: BackendClient, policy: RelayPolicy) -> Self {
        Self {
            transport,
            backend,
            policy,
            rooms: RoomMetadataCache::new(),
            pending: PendingDeletions::new(),
        }
    }

    pub fn room_cache(&self) -> &RoomMetadataCache {
        &self.rooms
    }

    pub fn pending_deletions(&self) -> &PendingDeletions {
        &self.pending
    }

    pub async fn handle(&self, event: InboundEvent) {
        match event {
            InboundEvent::Message(message) => self.on_message(&message).await,
            InboundEvent::Reaction(reaction) => self.on_reaction(&reaction).await,
            InboundEvent::StateChange(change) => self.on_state_change(&change),
        }
    }

    /// Allowed room, plain text, and not our own message.
    pub fn is_admissible(&self, message: &RoomMessage) -> bool {
        self.policy.rooms.contains(&message.room_id)
            && message.kind == MessageKind::Text
            && message.sender != self.transport.user_id()
    }

    async fn on_message(&self, message: &RoomMessage) {
        if !self.is_admissible(message) {
            return;
        }
        let Some(command) = commands::parse(&message.body, &self.policy.command_prefix) else {
            return;
        };
        if command.admin && !self.policy.admins.contains(&message.sender) {
            tracing::info!(
                target = "maush_relay::relay",
                sender = %message.sender,
                room = %message.room_id,
                "refusing admin command from non-admin"
            );
            let body = format!(
                "`{}` is not in the sudoers file. This incident will be [reported]({INCIDENT_URL}).",
                message.sender
            );
            let html = format!(
                "<code>{}</code> is not in the sudoers file. This incident will be <a href=\"{INCIDENT_URL}\">reported</a>.",
                escape_html(&message.sender)
            );
            self.reply(message, FormattedText::html(body, html)).await;
            return;
        }
        self.execute(message, command).await;
    }

    /// Run `command` for `message`, which has already passed admission.
    pub async fn execute(&self, message: &RoomMessage, command: ExecCommand) {
        let acting_as = command.acting_as.as_deref().unwrap_or(&message.sender);
        let sender = match Sender::parse(acting_as) {
            Ok(sender) => sender,
            Err(error) => {
                tracing::debug!(target = "maush_relay::relay", error = %error, "rejecting sender");
                self.reply(message, FormattedText::plain(UNSUPPORTED_USER)).await;
                return;
            }
        };

        let current = self.room_metadata(&message.room_id).await;
        let devices = self.gather_devices(message, &current).await;
        let untrusted = self.policy.untrusted.contains(&sender.user_id);
        let request = ExecRequest::builder(command.mode, command.script)
            .admin(command.admin)
            .untrusted(untrusted)
            .devices(devices)
            .build(&sender);

        let result = match self.backend.execute(&request).await {
            Ok(result) => result,
            Err(BackendError::Unavailable) => {
                self.reply(message, FormattedText::plain(BACKEND_DOWN)).await;
                return;
            }
            Err(error) => {
                tracing::warn!(
                    target = "maush_relay::relay",
                    url = %self.backend.url(),
                    error = %error,
                    "backend request failed"
                );
                self.reply(message, FormattedText::plain(BACKEND_UNREACHABLE)).await;
                return;
            }
        };
        tracing::debug!(
            target = "maush_relay::relay",
            sender = %sender.user_id,
            ok = result.ok,
            return_code = result.return_code,
            timeout = result.timeout,
            "execution response"
        );

        if !result.ok {
            let error = result.error.unwrap_or_default();
            tracing::error!(target = "maush_relay::relay", error = %error, "exec failed");
            self.reply(message, FormattedText::plain(error)).await;
            return;
        }

        let proposed = RoomMetadata {
            name: result.proposed_device(Device::Name),
            topic: result.proposed_device(Device::Topic),
            avatar: result.proposed_device(Device::AvatarMxc),
        };
        let decision = trust::evaluate(&current, &proposed, untrusted);
        if decision == TrustDecision::Rejected {
            tracing::info!(
                target = "maush_relay::relay",
                sender = %sender.user_id,
                room = %message.room_id,
                "rejecting room metadata change"
            );
            self.reply(message, FormattedText::plain(TRUST_REFUSAL)).await;
            return;
        }

        if let Some(reply) = output::render_result(&result) {
            self.reply_deletable(message, OutgoingMessage::Text(reply)).await;
        }
        if let TrustDecision::Apply(changes) = decision {
            for (kind, value) in changes {
                match self.transport.set_room_state(&message.room_id, kind, &value).await {
                    Ok(()) => self.rooms.store(&message.room_id, kind, &value),
                    Err(error) => tracing::warn!(
                        target = "maush_relay::relay",
                        room = %message.room_id,
                        state = kind.event_type(),
                        error = %error,
                        "failed to publish room state"
                    ),
                }
            }
        }
        if let Some(out_file) = &result.out_file {
            self.send_out_file(message, out_file).await;
        }
    }

    async fn on_reaction(&self, reaction: &Reaction) {
        if reaction.key != DELETE_REACTION || reaction.sender == self.transport.user_id() {
            return;
        }
        if !self.pending.take(&reaction.target_event_id) {
            return;
        }
        let reason = format!("Delete requested by {}", reaction.sender);
        if let Err(error) = self
            .transport
            .redact(&reaction.room_id, &reaction.target_event_id, &reason)
            .await
        {
            tracing::warn!(
                target = "maush_relay::relay",
                event_id = %reaction.target_event_id,
                error = %error,
                "redaction failed"
            );
        }
    }

    fn on_state_change(&self, change: &StateChange) {
        self.rooms.store(&change.room_id, change.kind, &change.value);
    }

    /// Cached metadata, fetching slots seen for the first time. A failed
    /// fetch reads as empty and is retried on the next execution.
    async fn room_metadata(&self, room_id: &str) -> RoomMetadata {
        for kind in self.rooms.missing(room_id) {
            match self.transport.room_state(room_id, kind).await {
                Ok(value) => self.rooms.fill(room_id, kind, value.as_deref().unwrap_or_default()),
                Err(error) => tracing::warn!(
                    target = "maush_relay::relay",
                    room = %room_id,
                    state = kind.event_type(),
                    error = %error,
                    "failed to fetch room state"
                ),
            }
        }
        self.rooms.snapshot(room_id)
    }

    async fn gather_devices(&self, message: &RoomMessage, current: &RoomMetadata) -> DeviceBundle {
        let mut devices = DeviceBundle::new();
        devices.insert_text(Device::Name, current.name.as_str());
        devices.insert_text(Device::Topic, current.topic.as_str());
        devices.insert_text(Device::AvatarMxc, current.avatar.as_str());

        let Some(reply_to) = &message.reply_to else {
            return devices;
        };
        let replied = match self.transport.fetch_message(&message.room_id, reply_to).await {
            Ok(replied) => replied,
            Err(error) => {
                tracing::warn!(
                    target = "maush_relay::relay",
                    event_id = %reply_to,
                    error = %error,
                    "failed to fetch replied-to event"
                );
                return devices;
            }
        };

        devices.insert_text(Device::Reply, replied.body.as_str());
        let media_url = replied.media_url.as_deref().filter(|_| replied.kind.is_media());
        if let Some(media_url) = media_url {
            devices.insert_text(Device::ReplyMxc, media_url);
            match self.fetch_reply_file(media_url).await {
                Attachment::Fetched(bytes) => devices.insert_bytes(Device::ReplyFile, bytes),
                Attachment::TooLarge(size) => tracing::debug!(
                    target = "maush_relay::relay",
                    media = %media_url,
                    size,
                    "reply attachment over size cap, skipping"
                ),
                Attachment::Failed(error) => tracing::warn!(
                    target = "maush_relay::relay",
                    media = %media_url,
                    error = %error,
                    "failed to download media for shell"
                ),
            }
        }
        devices
    }

    /// The size cap is checked against the declared length before
    /// downloading and against the real length after.
    pub async fn fetch_reply_file(&self, media_url: &str) -> Attachment {
        let source = match self.transport.media_source(media_url).await {
            Ok(source) => source,
            Err(error) => return Attachment::Failed(error),
        };
        if let Some(length) = source.content_length.filter(|len| *len > MAX_REPLY_FILE_BYTES) {
            return Attachment::TooLarge(length);
        }
        match self
            .transport
            .download_media(&source, MAX_REPLY_FILE_BYTES)
            .await {
            Ok(bytes) if bytes.len() as u64 > MAX_REPLY_FILE_BYTES => {
                Attachment::TooLarge(bytes.len() as u64)
            }
            Ok(bytes) => Attachment::Fetched(bytes),
            Err(error) => Attachment::Failed(error),
        }
    }

    async fn send_out_file(&self, message: &RoomMessage, out_file: &OutFile) {
        let data = match out_file.decode() {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(
                    target = "maush_relay::relay",
                    file = %out_file.name,
                    error = %error,
                    "output file is not valid base64"
                );
                return;
            }
        };
        let size = data.len();
        let url = match self
            .transport
            .upload_media(data, &out_file.name, &out_file.mimetype)
            .await
        {
            Ok(url) => url,
            Err(error) => {
                tracing::warn!(
                    target = "maush_relay::relay",
                    file = %out_file.name,
                    error = %error,
                    "output file upload failed"
                );
                return;
            }
        };
        let media = MediaMessage {
            kind: MessageKind::for_mime(&out_file.mimetype),
            filename: out_file.name.clone(),
            url,
            mimetype: out_file.mimetype.clone(),
            size,
        };
        self.reply_deletable(message, OutgoingMessage::Media(media)).await;
    }

    async fn reply(&self, message: &RoomMessage, text: FormattedText) {
        if let Err(error) = self
            .transport
            .send_reply(&message.room_id, &message.event_id, &OutgoingMessage::Text(text))
            .await
        {
            tracing::warn!(
                target = "maush_relay::relay",
                room = %message.room_id,
                error = %error,
                "failed to send reply"
            );
        }
    }

    /// Send a reply that any human can later retract with a delete reaction.
    async fn reply_deletable(&self, message: &RoomMessage, outgoing: OutgoingMessage) {
        let event_id = match self
            .transport
            .send_reply(&message.room_id, &message.event_id, &outgoing)
            .await
        {
            Ok(event_id) => event_id,
            Err(error) => {
                tracing::warn!(
                    target = "maush_relay::relay",
                    room = %message.room_id,
                    error = %error,
                    "failed to send reply"
                );
                return;
            }
        };
        self.pending.register(event_id.clone());
        if let Err(error) = self
            .transport
            .react(&message.room_id, &event_id, DELETE_REACTION)
            .await
        {
            tracing::warn!(
                target = "maush_relay::relay",
                event_id = %event_id,
                error = %error,
                "failed to add delete reaction"
            );
        }
    }
}
