//! IPC message types exchanged between the app, helper and backend.
//!
//! Every frame carries a one-byte [`MessageType`] tag followed by a JSON
//! payload. The tag tells the receiver which struct to decode; frames carry
//! no request identifier, so a caller knows which response to expect only
//! from the request it sent (see [`MessageType::expected_response`]).

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{IpcError, Result};
use crate::ipc::frame::Frame;

/// Closed set of wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    ListDirRequest = 1,
    ReadFileRequest = 2,
    ListPluginsRequest = 10,
    ListMountsRequest = 11,
    ListMountsResponse = 12,
    Connect = 14,
    CreateMountRequest = 15,
    CreateMountResponse = 16,
    DeleteMountRequest = 17,
    DeleteMountResponse = 18,
    MountRequest = 20,
    UnmountRequest = 21,
    MountResponse = 22,
    UnmountResponse = 23,
    ListDiskTypesRequest = 24,
    ListDiskTypesResponse = 25,
    MountStatusUpdate = 30,
    Announce = 40,
    ShutdownRequest = 98,
    ShutdownResponse = 99,
}

impl MessageType {
    /// All known tags, in wire order.
    pub const ALL: [MessageType; 20] = [
        MessageType::ListDirRequest,
        MessageType::ReadFileRequest,
        MessageType::ListPluginsRequest,
        MessageType::ListMountsRequest,
        MessageType::ListMountsResponse,
        MessageType::Connect,
        MessageType::CreateMountRequest,
        MessageType::CreateMountResponse,
        MessageType::DeleteMountRequest,
        MessageType::DeleteMountResponse,
        MessageType::MountRequest,
        MessageType::UnmountRequest,
        MessageType::MountResponse,
        MessageType::UnmountResponse,
        MessageType::ListDiskTypesRequest,
        MessageType::ListDiskTypesResponse,
        MessageType::MountStatusUpdate,
        MessageType::Announce,
        MessageType::ShutdownRequest,
        MessageType::ShutdownResponse,
    ];

    /// Raw wire tag.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// The single response tag a peer answers this request with.
    ///
    /// Returns `None` for tags that are never answered (responses, events,
    /// announcements) and for the file-projection requests this crate only
    /// forwards.
    pub fn expected_response(self) -> Option<MessageType> {
        match self {
            MessageType::Connect => Some(MessageType::Connect),
            MessageType::ListMountsRequest => Some(MessageType::ListMountsResponse),
            MessageType::CreateMountRequest => Some(MessageType::CreateMountResponse),
            MessageType::DeleteMountRequest => Some(MessageType::DeleteMountResponse),
            MessageType::MountRequest => Some(MessageType::MountResponse),
            MessageType::UnmountRequest => Some(MessageType::UnmountResponse),
            MessageType::ListDiskTypesRequest => Some(MessageType::ListDiskTypesResponse),
            MessageType::ShutdownRequest => Some(MessageType::ShutdownResponse),
            _ => None,
        }
    }

    /// Frames a peer may push without being asked.
    pub fn is_event(self) -> bool {
        matches!(self, MessageType::MountStatusUpdate | MessageType::Announce)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = IpcError;

    fn try_from(tag: u8) -> Result<Self> {
        MessageType::ALL
            .iter()
            .copied()
            .find(|t| t.tag() == tag)
            .ok_or(IpcError::UnknownMessageType(tag))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.tag())
    }
}

/// Identity a client asserts in its CONNECT handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    App,
    Backend,
    FileProvider,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::App => "app",
            Role::Backend => "backend",
            Role::FileProvider => "file_provider",
        };
        f.write_str(name)
    }
}

/// A payload bound to exactly one wire tag.
pub trait Message: Serialize + DeserializeOwned + Send + Sized {
    const TYPE: MessageType;

    fn encode_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn decode_payload(payload: &[u8]) -> Result<Self> {
        // An empty payload stands for a message with no fields set.
        let bytes: &[u8] = if payload.is_empty() { b"{}" } else { payload };
        serde_json::from_slice(bytes).map_err(|e| IpcError::Decode(format!("{}: {}", Self::TYPE, e)))
    }

    fn to_frame(&self) -> Result<Frame> {
        Ok(Frame::new(Self::TYPE.tag(), self.encode_payload()?))
    }

    fn from_frame(frame: &Frame) -> Result<Self> {
        if frame.tag != Self::TYPE.tag() {
            return Err(IpcError::UnexpectedMessage {
                expected: Self::TYPE.to_string(),
                actual: describe_tag(frame.tag),
            });
        }
        Self::decode_payload(&frame.payload)
    }
}

/// A message that is answered by exactly one response message.
pub trait Request: Message {
    type Response: Message;
}

/// Human-readable tag for logs and errors, tolerant of unknown tags.
pub fn describe_tag(tag: u8) -> String {
    match MessageType::try_from(tag) {
        Ok(t) => t.to_string(),
        Err(_) => format!("Unknown({})", tag),
    }
}

macro_rules! message {
    ($ty:ty, $tag:expr) => {
        impl Message for $ty {
            const TYPE: MessageType = $tag;
        }
    };
    ($ty:ty, $tag:expr, $resp:ty) => {
        message!($ty, $tag);
        impl Request for $ty {
            type Response = $resp;
        }
    };
}

// Handshake

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub role: Role,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectResponse {
    #[serde(default)]
    pub error: String,
}

impl ConnectResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_empty()
    }
}

message!(ConnectRequest, MessageType::Connect, ConnectResponse);
message!(ConnectResponse, MessageType::Connect);

// Mounts

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountStatus {
    Mounted,
    Unmounted,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountInfo {
    pub mount_id: u32,
    pub name: String,
    pub disk_type: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    #[serde(default)]
    pub mounted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListMountsRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListMountsResponse {
    #[serde(default)]
    pub mounts: Vec<MountInfo>,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateMountRequest {
    pub name: String,
    pub disk_type: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateMountResponse {
    #[serde(default)]
    pub mount_id: u32,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteMountRequest {
    pub mount_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteMountResponse {
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountRequest {
    pub mount_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MountResponse {
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmountRequest {
    pub mount_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnmountResponse {
    #[serde(default)]
    pub error: String,
}

/// Pushed after a mount changes state; never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountStatusUpdate {
    pub mount_id: u32,
    pub name: String,
    pub status: MountStatus,
    #[serde(default)]
    pub error: String,
}

message!(ListMountsRequest, MessageType::ListMountsRequest, ListMountsResponse);
message!(ListMountsResponse, MessageType::ListMountsResponse);
message!(CreateMountRequest, MessageType::CreateMountRequest, CreateMountResponse);
message!(CreateMountResponse, MessageType::CreateMountResponse);
message!(DeleteMountRequest, MessageType::DeleteMountRequest, DeleteMountResponse);
message!(DeleteMountResponse, MessageType::DeleteMountResponse);
message!(MountRequest, MessageType::MountRequest, MountResponse);
message!(MountResponse, MessageType::MountResponse);
message!(UnmountRequest, MessageType::UnmountRequest, UnmountResponse);
message!(UnmountResponse, MessageType::UnmountResponse);
message!(MountStatusUpdate, MessageType::MountStatusUpdate);

// Disk types

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskTypeInfo {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListDiskTypesRequest {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListDiskTypesResponse {
    #[serde(default)]
    pub disk_types: Vec<DiskTypeInfo>,
    #[serde(default)]
    pub error: String,
}

message!(ListDiskTypesRequest, MessageType::ListDiskTypesRequest, ListDiskTypesResponse);
message!(ListDiskTypesResponse, MessageType::ListDiskTypesResponse);

// Lifecycle

/// Asks the receiving process to exit gracefully. Sent with an empty payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShutdownRequest {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShutdownResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl ShutdownResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

impl Message for ShutdownRequest {
    const TYPE: MessageType = MessageType::ShutdownRequest;

    fn encode_payload(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

impl Request for ShutdownRequest {
    type Response = ShutdownResponse;
}

message!(ShutdownResponse, MessageType::ShutdownResponse);

/// Readiness announcement a child sends to its supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announce {
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub pid: u32,
}

message!(Announce, MessageType::Announce);
