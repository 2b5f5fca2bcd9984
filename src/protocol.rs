//! Wire records exchanged with the maush backend.

use std::{
    collections::{BTreeMap, HashMap},
    sync::LazyLock,
};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use regex::Regex;
use serde::{Deserialize, Serialize};

static LOCALPART: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._=+-]+$").expect("valid regex"));
static REPEATED_SLASHES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"//+").expect("valid regex"));

/// Named slots forwarded to the backend alongside the script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Device {
    Name,
    Topic,
    AvatarMxc,
    Reply,
    ReplyMxc,
    ReplyFile,
}

impl Device {
    pub fn key(self) -> &'static str {
        match self {
            Device::Name => "name",
            Device::Topic => "topic",
            Device::AvatarMxc => "avatar-mxc",
            Device::Reply => "reply",
            Device::ReplyMxc => "reply-mxc",
            Device::ReplyFile => "reply-file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl DeviceValue {
    fn as_bytes(&self) -> &[u8] {
        match self {
            DeviceValue::Text(text) => text.as_bytes(),
            DeviceValue::Bytes(bytes) => bytes,
        }
    }
}

/// Per-request device map. Empty values are never stored, so absent devices
/// are simply left out of the request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceBundle {
    entries: BTreeMap<Device, DeviceValue>,
}

impl DeviceBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_text(&mut self, device: Device, value: impl Into<String>) {
        let value = value.into();
        if value.trim().is_empty() {
            return;
        }
        self.entries.insert(device, DeviceValue::Text(value));
    }

    pub fn insert_bytes(&mut self, device: Device, value: Vec<u8>) {
        if value.is_empty() {
            return;
        }
        self.entries.insert(device, DeviceValue::Bytes(value));
    }

    pub fn get(&self, device: Device) -> Option<&DeviceValue> {
        self.entries.get(&device)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Base64 form sent on the wire; text is encoded as UTF-8 first.
    pub fn encode(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(device, value)| {
                (
                    device.key().to_string(),
                    BASE64_STANDARD.encode(value.as_bytes()),
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("user id {0:?} is not of the form @localpart:server")]
    MalformedUserId(String),
    #[error("localpart {0:?} contains unsupported characters")]
    UnsupportedLocalpart(String),
}

/// A validated sender: the identity the script runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub user_id: String,
    pub localpart: String,
    pub server: String,
}

impl Sender {
    pub fn parse(user_id: &str) -> Result<Self, ProtocolError> {
        let (localpart, server) = user_id
            .strip_prefix('@')
            .and_then(|rest| rest.split_once(':'))
            .filter(|(_, server)| !server.is_empty())
            .ok_or_else(|| ProtocolError::MalformedUserId(user_id.to_string()))?;
        if !LOCALPART.is_match(localpart) {
            return Err(ProtocolError::UnsupportedLocalpart(localpart.to_string()));
        }
        Ok(Self {
            user_id: user_id.to_string(),
            localpart: localpart.to_string(),
            server: server.to_string(),
        })
    }

    pub fn home(&self) -> String {
        home_path(&self.server, &self.localpart)
    }
}

/// `/<server>/<localpart>` with runs of slashes collapsed.
pub fn home_path(server: &str, localpart: &str) -> String {
    REPEATED_SLASHES
        .replace_all(&format!("/{server}/{localpart}"), "/")
        .into_owned()
}

/// How the backend should interpret the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecMode {
    /// Run `script` with a named interpreter.
    Language(String),
    /// Run `args` directly; `script` is fed to the command as stdin.
    Raw { language: String, args: Vec<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecRequest {
    pub language: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub raw: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    pub script: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub admin: bool,
    pub user: String,
    pub home: String,
    pub untrusted: bool,
    pub devices: BTreeMap<String, String>,
}

impl ExecRequest {
    pub fn builder(mode: ExecMode, script: impl Into<String>) -> ExecRequestBuilder {
        ExecRequestBuilder {
            mode,
            script: script.into(),
            admin: false,
            untrusted: false,
            devices: DeviceBundle::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecRequestBuilder {
    mode: ExecMode,
    script: String,
    admin: bool,
    untrusted: bool,
    devices: DeviceBundle,
}

impl ExecRequestBuilder {
    pub fn admin(mut self, admin: bool) -> Self {
        self.admin = admin;
        self
    }

    pub fn untrusted(mut self, untrusted: bool) -> Self {
        self.untrusted = untrusted;
        self
    }

    pub fn devices(mut self, devices: DeviceBundle) -> Self {
        self.devices = devices;
        self
    }

    /// Taking a [`Sender`] means the identity has already been validated.
    pub fn build(self, sender: &Sender) -> ExecRequest {
        let (language, raw, args) = match self.mode {
            ExecMode::Language(language) => (language, false, None),
            ExecMode::Raw { language, args } => (language, true, Some(args)),
        };
        ExecRequest {
            language,
            raw,
            args,
            script: self.script,
            admin: self.admin,
            user: sender.user_id.clone(),
            home: sender.home(),
            untrusted: self.untrusted,
            devices: self.devices.encode(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OutFile {
    pub name: String,
    pub mimetype: String,
    /// Base64-encoded file body.
    pub content: String,
}

impl OutFile {
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64_STANDARD.decode(self.content.trim())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecResult {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Nanoseconds.
    #[serde(default)]
    pub duration: u64,
    #[serde(rename = "return", default)]
    pub return_code: i64,
    #[serde(default)]
    pub timeout: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub devices: HashMap<String, Option<String>>,
    #[serde(default)]
    pub out_file: Option<OutFile>,
}

impl ExecResult {
    /// Device value proposed by the backend, trimmed; missing and null are empty.
    pub fn proposed_device(&self, device: Device) -> String {
        self.devices
            .get(device.key())
            .and_then(Option::as_deref)
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    }
}
