use serde::{Deserialize, Serialize};

use crate::message::Message;

// Client -> Server opcodes
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_JOIN: u8 = 3;
pub const OP_LEAVE: u8 = 4;
pub const OP_SEND: u8 = 5;

// Server -> Client opcodes
pub const OP_DISPATCH: u8 = 0;
pub const OP_INVALID_SESSION: u8 = 9;
pub const OP_HELLO: u8 = 10;
pub const OP_HEARTBEAT_ACK: u8 = 11;
pub const OP_ACK: u8 = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayMessage {
    pub fn new(op: u8, d: serde_json::Value) -> Self {
        Self {
            op,
            d: Some(d),
            s: None,
            t: None,
        }
    }
}

// Dispatch event names
pub const EVENT_READY: &str = "READY";
pub const EVENT_ROOM_JOINED: &str = "ROOM_JOINED";
pub const EVENT_ROOM_LEFT: &str = "ROOM_LEFT";
pub const EVENT_JOIN_REJECTED: &str = "JOIN_REJECTED";
pub const EVENT_MESSAGE_CREATE: &str = "MESSAGE_CREATE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloPayload {
    pub heartbeat_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyPayload {
    pub session_id: String,
    #[serde(with = "crate::ids")]
    pub user_id: i64,
}

/// Body of JOIN, LEAVE, ROOM_JOINED and ROOM_LEFT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomPayload {
    #[serde(with = "crate::ids")]
    pub conversation_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendPayload {
    #[serde(with = "crate::ids")]
    pub conversation_id: i64,
    pub content: String,
    /// Correlates the ACK and deduplicates retries of the same send.
    pub nonce: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NotFound,
    Forbidden,
    InvalidPayload,
    Unauthenticated,
    RateLimited,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayError {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRejectedPayload {
    #[serde(with = "crate::ids")]
    pub conversation_id: i64,
    pub code: ErrorCode,
}

/// Direct per-call acknowledgement of a SEND. Never broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckPayload {
    pub nonce: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
}

impl AckPayload {
    pub fn success(nonce: String, message: Message) -> Self {
        Self {
            nonce,
            ok: true,
            message: Some(message),
            error: None,
        }
    }

    pub fn failure(nonce: String, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            nonce,
            ok: false,
            message: None,
            error: Some(GatewayError {
                code,
                message: message.into(),
            }),
        }
    }
}
