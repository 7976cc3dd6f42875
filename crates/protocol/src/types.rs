//! Core message types shared across the protocol

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Size of the fixed message header: payload length (u16 BE), type, context ID
pub const HEADER_LEN: usize = 4;

/// Largest payload a single message can carry
pub const MAX_PAYLOAD_LEN: usize = 0xffff;

/// Errors produced while decoding messages
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("payload too long: {0} bytes")]
    PayloadTooLong(usize),
    #[error("invalid {kind} payload")]
    InvalidPayload { kind: MessageType },
    #[error("invalid JSON command: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message type tag
///
/// Types below 32 are control messages that are never stored in session
/// history. 32..=127 are meta messages and 128..=255 are drawing commands.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(pub u8);

impl MessageType {
    // Control
    pub const COMMAND: MessageType = MessageType(0);
    pub const DISCONNECT: MessageType = MessageType(1);
    pub const PING: MessageType = MessageType(2);
    pub const INTERNAL: MessageType = MessageType(31);

    // Meta
    pub const USER_JOIN: MessageType = MessageType(32);
    pub const USER_LEAVE: MessageType = MessageType(33);
    pub const SESSION_OWNER: MessageType = MessageType(34);
    pub const CHAT: MessageType = MessageType(35);
    pub const TRUSTED_USERS: MessageType = MessageType(36);
    pub const SOFT_RESET: MessageType = MessageType(37);
    pub const PRIVATE_CHAT: MessageType = MessageType(38);

    // Opaque meta
    pub const INTERVAL: MessageType = MessageType(64);
    pub const LASER_TRAIL: MessageType = MessageType(65);
    pub const MOVE_POINTER: MessageType = MessageType(66);
    pub const MARKER: MessageType = MessageType(67);
    pub const USER_ACL: MessageType = MessageType(68);
    pub const LAYER_ACL: MessageType = MessageType(69);
    pub const FEATURE_ACCESS_LEVELS: MessageType = MessageType(70);
    pub const DEFAULT_LAYER: MessageType = MessageType(71);
    pub const FILTERED: MessageType = MessageType(72);
    pub const EXTENSION: MessageType = MessageType(73);

    // Drawing commands
    pub const UNDO_POINT: MessageType = MessageType(128);
    pub const CANVAS_RESIZE: MessageType = MessageType(129);
    pub const LAYER_CREATE: MessageType = MessageType(130);
    pub const PUT_IMAGE: MessageType = MessageType(135);
    pub const PEN_UP: MessageType = MessageType(136);
    pub const DRAW_DABS_CLASSIC: MessageType = MessageType(146);
    pub const UNDO: MessageType = MessageType(149);

    pub fn is_control(self) -> bool {
        self.0 < 32
    }

    pub fn is_meta(self) -> bool {
        (32..128).contains(&self.0)
    }

    pub fn is_command(self) -> bool {
        self.0 >= 128
    }

    /// Human readable name, used in log messages
    pub fn name(self) -> &'static str {
        match self {
            Self::COMMAND => "command",
            Self::DISCONNECT => "disconnect",
            Self::PING => "ping",
            Self::INTERNAL => "internal",
            Self::USER_JOIN => "join",
            Self::USER_LEAVE => "leave",
            Self::SESSION_OWNER => "owner",
            Self::CHAT => "chat",
            Self::TRUSTED_USERS => "trusted",
            Self::SOFT_RESET => "softreset",
            Self::PRIVATE_CHAT => "privatechat",
            Self::INTERVAL => "interval",
            Self::LASER_TRAIL => "laser",
            Self::MOVE_POINTER => "movepointer",
            Self::MARKER => "marker",
            Self::USER_ACL => "useracl",
            Self::LAYER_ACL => "layeracl",
            Self::FEATURE_ACCESS_LEVELS => "featureaccess",
            Self::DEFAULT_LAYER => "defaultlayer",
            Self::FILTERED => "filtered",
            Self::EXTENSION => "extension",
            Self::UNDO_POINT => "undopoint",
            Self::CANVAS_RESIZE => "resize",
            Self::LAYER_CREATE => "newlayer",
            Self::PUT_IMAGE => "putimage",
            Self::PEN_UP => "penup",
            Self::DRAW_DABS_CLASSIC => "classicdabs",
            Self::UNDO => "undo",
            _ => "unknown",
        }
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why the server is closing a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    Error = 0,
    Kick = 1,
    Shutdown = 2,
    Other = 3,
}

impl DisconnectReason {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Error,
            1 => Self::Kick,
            2 => Self::Shutdown,
            _ => Self::Other,
        }
    }
}

/// User join flags
pub const JOIN_FLAG_AUTH: u8 = 0x01;
pub const JOIN_FLAG_MOD: u8 = 0x02;

/// A single protocol message
///
/// Messages are immutable once built. Cloning is cheap: the payload buffer is
/// reference counted and shared between clones.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageType,
    context_id: u8,
    payload: Bytes,
}

impl Message {
    /// Build a message. Payloads longer than [`MAX_PAYLOAD_LEN`] are rejected.
    pub fn new(
        kind: MessageType,
        context_id: u8,
        payload: impl Into<Bytes>,
    ) -> Result<Self, ProtocolError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLong(payload.len()));
        }
        Ok(Self {
            kind,
            context_id,
            payload,
        })
    }

    /// Build a message without a payload
    pub fn empty(kind: MessageType, context_id: u8) -> Self {
        Self {
            kind,
            context_id,
            payload: Bytes::new(),
        }
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn context_id(&self) -> u8 {
        self.context_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Serialized length, header included
    pub fn len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Return this message attributed to another user. The payload is shared.
    pub fn with_context_id(&self, context_id: u8) -> Self {
        Self {
            kind: self.kind,
            context_id,
            payload: self.payload.clone(),
        }
    }

    /// Append the wire form of this message to `dst`
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.len());
        dst.put_u16(self.payload.len() as u16);
        dst.put_u8(self.kind.0);
        dst.put_u8(self.context_id);
        dst.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());
        self.write_to(&mut buf);
        buf.freeze()
    }

    /// Length of the complete message at the start of `buf`, if the header is there
    pub fn peek_len(buf: &[u8]) -> Option<usize> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(HEADER_LEN + u16::from_be_bytes([buf[0], buf[1]]) as usize)
    }

    /// Decode one message from the start of `buf`
    pub fn deserialize(buf: &[u8]) -> Result<Self, ProtocolError> {
        let len = Self::peek_len(buf).ok_or(ProtocolError::Truncated {
            needed: HEADER_LEN,
            available: buf.len(),
        })?;
        if buf.len() < len {
            return Err(ProtocolError::Truncated {
                needed: len,
                available: buf.len(),
            });
        }
        Ok(Self {
            kind: MessageType(buf[2]),
            context_id: buf[3],
            payload: Bytes::copy_from_slice(&buf[HEADER_LEN..len]),
        })
    }

    // -- Constructors for server generated messages --

    /// A JSON command (login, session control, server replies)
    pub fn command<T: Serialize>(context_id: u8, body: &T) -> Result<Self, ProtocolError> {
        let json = serde_json::to_vec(body)?;
        Self::new(MessageType::COMMAND, context_id, json)
    }

    /// Parse the JSON body of a Command message
    pub fn parse_command<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        if self.kind != MessageType::COMMAND {
            return Err(ProtocolError::InvalidPayload { kind: self.kind });
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn disconnect(reason: DisconnectReason, message: &str) -> Self {
        let mut buf = BytesMut::with_capacity(1 + message.len());
        buf.put_u8(reason as u8);
        buf.put_slice(truncate_utf8(message, MAX_PAYLOAD_LEN - 1).as_bytes());
        Self {
            kind: MessageType::DISCONNECT,
            context_id: 0,
            payload: buf.freeze(),
        }
    }

    /// Decode a Disconnect payload
    pub fn disconnect_reason(&self) -> Option<(DisconnectReason, String)> {
        if self.kind != MessageType::DISCONNECT || self.payload.is_empty() {
            return None;
        }
        Some((
            DisconnectReason::from_u8(self.payload[0]),
            String::from_utf8_lossy(&self.payload[1..]).into_owned(),
        ))
    }

    pub fn ping(is_pong: bool) -> Self {
        Self {
            kind: MessageType::PING,
            context_id: 0,
            payload: Bytes::from_static(if is_pong { &[1] } else { &[0] }),
        }
    }

    /// Is this a ping (as opposed to a pong)?
    pub fn is_ping(&self) -> bool {
        self.kind == MessageType::PING && self.payload.first() == Some(&0)
    }

    pub fn user_join(context_id: u8, flags: u8, name: &str, avatar: &[u8]) -> Result<Self, ProtocolError> {
        let name = truncate_utf8(name, u8::MAX as usize);
        let mut buf = BytesMut::with_capacity(2 + name.len() + avatar.len());
        buf.put_u8(flags);
        buf.put_u8(name.len() as u8);
        buf.put_slice(name.as_bytes());
        buf.put_slice(avatar);
        Self::new(MessageType::USER_JOIN, context_id, buf.freeze())
    }

    /// Decode a UserJoin payload into (flags, name)
    pub fn user_join_info(&self) -> Option<(u8, String)> {
        if self.kind != MessageType::USER_JOIN || self.payload.len() < 2 {
            return None;
        }
        let name_len = self.payload[1] as usize;
        let name = self.payload.get(2..2 + name_len)?;
        Some((self.payload[0], String::from_utf8_lossy(name).into_owned()))
    }

    pub fn user_leave(context_id: u8) -> Self {
        Self::empty(MessageType::USER_LEAVE, context_id)
    }

    /// List of session operators
    pub fn session_owner(context_id: u8, users: &[u8]) -> Self {
        Self {
            kind: MessageType::SESSION_OWNER,
            context_id,
            payload: Bytes::copy_from_slice(users),
        }
    }

    /// List of trusted users
    pub fn trusted_users(context_id: u8, users: &[u8]) -> Self {
        Self {
            kind: MessageType::TRUSTED_USERS,
            context_id,
            payload: Bytes::copy_from_slice(users),
        }
    }

    /// A public chat message: transparent flags, opaque flags, UTF-8 text
    pub fn chat(context_id: u8, text: &str) -> Result<Self, ProtocolError> {
        let mut buf = BytesMut::with_capacity(2 + text.len());
        buf.put_u8(0);
        buf.put_u8(0);
        buf.put_slice(text.as_bytes());
        Self::new(MessageType::CHAT, context_id, buf.freeze())
    }

    pub fn soft_reset(context_id: u8) -> Self {
        Self::empty(MessageType::SOFT_RESET, context_id)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("context_id", &self.context_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

fn truncate_utf8(value: &str, max_bytes: usize) -> &str {
    if value.len() <= max_bytes {
        return value;
    }
    let mut end = max_bytes;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}
