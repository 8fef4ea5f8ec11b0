//! Wire protocol packet types.
//!
//! All communication between Netron peers uses codec-encoded packets over
//! TCP. Each packet is prefixed with a 4-byte big-endian length header. The
//! default codec is JSON; see [`Codec`].

use netron_types::{Definition, DefinitionId, NetronError, NetronResult, PeerStatus, WireValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Protocol version. Both sides of a handshake must agree.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default maximum frame size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// A wire packet (envelope).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    /// Request id, echoed by the matching response.
    pub id: u64,
    /// Status of the sender when the packet was built.
    pub status: PeerStatus,
    /// Packet variant.
    #[serde(flatten)]
    pub kind: PacketKind,
}

impl Packet {
    pub fn request(id: u64, status: PeerStatus, request: Request) -> Self {
        Self {
            id,
            status,
            kind: PacketKind::Request(request),
        }
    }

    pub fn response(id: u64, status: PeerStatus, response: Response) -> Self {
        Self {
            id,
            status,
            kind: PacketKind::Response(response),
        }
    }

    pub fn notification(id: u64, status: PeerStatus, notification: Notification) -> Self {
        Self {
            id,
            status,
            kind: PacketKind::Notification(notification),
        }
    }

    /// Whether this packet initiates an exchange rather than answering one.
    pub fn is_impulse(&self) -> bool {
        !matches!(self.kind, PacketKind::Response(_))
    }
}

/// The different kinds of packets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PacketKind {
    /// Expects exactly one response with the same id.
    #[serde(rename = "request")]
    Request(Request),
    /// Answers a request.
    #[serde(rename = "response")]
    Response(Response),
    /// One-way; never answered.
    #[serde(rename = "notification")]
    Notification(Notification),
}

/// A context registered under a name, as listed in a handshake ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedDefinition {
    pub name: String,
    pub definition: Definition,
}

/// Request packets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    /// Opening packet of a connection.
    Handshake {
        protocol_version: u32,
        /// Built by `on_send_handshake`; carries at least `uid`.
        payload: Value,
    },
    /// Read a property.
    Get {
        def_id: DefinitionId,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
    /// Invoke a method and await its result.
    Call {
        def_id: DefinitionId,
        name: String,
        #[serde(default)]
        args: Vec<WireValue>,
    },
    Ping,
    /// Ask a hub to expose a context living on the sender.
    AttachContext { name: String, definition: Definition },
    /// Withdraw a context attached with `AttachContext`.
    DetachContext { name: String },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Handshake { .. } => "handshake",
            Request::Get { .. } => "get",
            Request::Call { .. } => "call",
            Request::Ping => "ping",
            Request::AttachContext { .. } => "attach_context",
            Request::DetachContext { .. } => "detach_context",
        }
    }
}

/// Response packets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Response {
    /// Acceptor's identity and its full context list.
    HandshakeAck {
        protocol_version: u32,
        uid: Uuid,
        is_super: bool,
        definitions: Vec<NamedDefinition>,
    },
    /// Result of a get, call or control request.
    Value { value: WireValue },
    Pong,
    /// The request failed. Only the message survives for context errors.
    Error { code: i32, message: String },
}

impl Response {
    /// Build an error response from a local error.
    pub fn error(err: &NetronError) -> Self {
        Response::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }

    /// Interpret a response to a get, call or control request.
    pub fn into_value(self) -> NetronResult<WireValue> {
        match self {
            Response::Value { value } => Ok(value),
            Response::Error { code, message } => Err(NetronError::from_code(code, message)),
            other => Err(NetronError::IllegalState(format!(
                "Unexpected response: {}",
                other.name()
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Response::HandshakeAck { .. } => "handshake_ack",
            Response::Value { .. } => "value",
            Response::Pong => "pong",
            Response::Error { .. } => "error",
        }
    }
}

/// Notification packets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    /// Write a property.
    Set {
        def_id: DefinitionId,
        name: String,
        value: WireValue,
    },
    /// Invoke a method, discarding its result.
    CallVoid {
        def_id: DefinitionId,
        name: String,
        #[serde(default)]
        args: Vec<WireValue>,
    },
    /// The sender is done with the weak context `def_id` it was handed.
    Release { def_id: DefinitionId },
    /// The sender registered a context.
    ContextAttached { name: String, definition: Definition },
    /// The sender unregistered a context.
    ContextDetached { name: String },
    /// Open a stream channel; `stream_id` is the sender's id.
    StreamRequest { stream_id: u64 },
    /// Accept a stream; `stream_id` is the receiver's id, `remote_id` the sender's.
    StreamAccept { stream_id: u64, remote_id: u64 },
    /// Bytes for the receiver's stream `stream_id`.
    StreamData {
        stream_id: u64,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// The sender's consumer stopped reading.
    StreamPause { stream_id: u64 },
    /// The sender's consumer is reading.
    StreamResume { stream_id: u64 },
    /// The sender will not write anymore.
    StreamEnd { stream_id: u64 },
    /// Application-defined packet, handled by `custom_process_packet`.
    Custom { code: u16, data: Value },
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Packet body serialization. Framing is handled separately.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, packet: &Packet) -> NetronResult<Vec<u8>>;
    fn decode(&self, body: &[u8]) -> NetronResult<Packet>;
}

/// JSON packet bodies.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, packet: &Packet) -> NetronResult<Vec<u8>> {
        Ok(serde_json::to_vec(packet)?)
    }

    fn decode(&self, body: &[u8]) -> NetronResult<Packet> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Encode a packet with its 4-byte big-endian length prefix.
pub fn encode_frame(codec: &dyn Codec, packet: &Packet) -> NetronResult<Vec<u8>> {
    let body = codec.encode(packet)?;
    let len = frame_length(body.len(), u32::MAX)?;
    let mut bytes = Vec::with_capacity(4 + body.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Convert a body length to its frame prefix, rejecting bodies over `max`.
pub fn frame_length(len: usize, max: u32) -> NetronResult<u32> {
    match u32::try_from(len) {
        Ok(size) if size <= max => Ok(size),
        Ok(size) => Err(NetronError::MessageTooLarge { size, max }),
        Err(_) => Err(NetronError::MessageTooLarge {
            size: u32::MAX,
            max,
        }),
    }
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}
