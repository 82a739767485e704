//! Event envelope and typed payloads
//!
//! Every wire frame carries `{"event": <name>, "data": <object>}`. Inbound
//! frames are parsed into [`ClientEvent`] — the parser is the single place
//! that validates event names against the enumerated set. Outbound frames
//! are rendered from [`ServerEvent`].
//!
//! The ciphertext envelope (`{encrypted, nonce}`) and all WebRTC signaling
//! payloads are opaque: they are forwarded verbatim and never inspected or
//! logged.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{RelayError, Result};
use crate::protocol::frame::Frame;

/// The wire envelope. Both fields are required; anything else is a
/// protocol error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub data: Value,
}

#[derive(Serialize)]
struct OutEnvelope<'a> {
    event: &'a str,
    data: &'a Value,
}

// =============================================================================
// Client -> server payloads
// =============================================================================

/// Profile submitted with `join_chat`. `user_id` is client-supplied and
/// untrusted; `username` is display-only.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinProfile {
    pub user_id: String,
    pub username: String,
    pub preference: String,
    pub gender: String,
    pub room_type: String,
    #[serde(default)]
    pub group_join_method: Option<String>,
    #[serde(default)]
    pub group_code: Option<String>,
}

/// The opaque ciphertext envelope: relayed byte-identical, never decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub encrypted: String,
    pub nonce: String,
}

/// `send_message` payload
#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageData {
    pub message: EncryptedPayload,
    pub is_group_chat: bool,
    #[serde(default)]
    pub group_code: Option<String>,
    #[serde(default)]
    pub reply_to_id: Option<i64>,
}

/// `typing_start` / `typing_stop` payload
#[derive(Debug, Clone, Deserialize)]
pub struct TypingData {
    pub is_group_chat: bool,
    #[serde(default)]
    pub group_code: Option<String>,
}

/// `delete_message` payload. The outbound event always uses `messageId`;
/// inbound accepts both casings the clients have shipped.
#[derive(Debug, Clone, Deserialize)]
pub struct DeleteMessageData {
    #[serde(rename = "messageId", alias = "message_id")]
    pub message_id: String,
    #[serde(rename = "isGroupChat", alias = "is_group_chat", default)]
    pub is_group_chat: bool,
    #[serde(rename = "chatId", alias = "group_code", default)]
    pub group_code: Option<String>,
}

/// `file_sending_start` / `file_sending_end` payload
#[derive(Debug, Clone, Deserialize)]
pub struct FileStatusData {
    pub file_id: String,
    pub is_group_chat: bool,
    #[serde(default)]
    pub group_code: Option<String>,
}

/// WebRTC signaling frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    EndCall,
}

impl SignalKind {
    /// The wire event name, identical inbound and when echoed to peers.
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalKind::Offer => "webrtc_offer",
            SignalKind::Answer => "webrtc_answer",
            SignalKind::IceCandidate => "webrtc_ice_candidate",
            SignalKind::EndCall => "webrtc_end_call",
        }
    }
}

/// A signaling frame: routing fields extracted, payload untouched.
///
/// Only `target_id`, `is_group_chat`, and `group_code` are read; the SDP,
/// candidate, and everything else ride along inside `payload`.
#[derive(Debug, Clone)]
pub struct SignalData {
    pub target_id: Option<String>,
    pub is_group_chat: bool,
    pub group_code: Option<String>,
    pub payload: Value,
}

impl SignalData {
    fn from_value(data: Value) -> Result<Self> {
        if !data.is_object() {
            return Err(RelayError::protocol("signaling payload is not an object"));
        }

        let target_id = data
            .get("target_id")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        let is_group_chat = data
            .get("is_group_chat")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let group_code = data
            .get("group_code")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(Self {
            target_id,
            is_group_chat,
            group_code,
            payload: data,
        })
    }
}

/// A parsed client event
#[derive(Debug, Clone)]
pub enum ClientEvent {
    JoinChat(JoinProfile),
    SendMessage(SendMessageData),
    TypingStart(TypingData),
    TypingStop(TypingData),
    DeleteMessage(DeleteMessageData),
    FileSendingStart(FileStatusData),
    FileSendingEnd(FileStatusData),
    Signal(SignalKind, SignalData),
    DisconnectChat,
}

impl ClientEvent {
    /// Parse a text frame into a typed client event.
    ///
    /// Rejects frames that are not valid JSON, lack the `event`/`data`
    /// fields, carry an event name outside the enumerated set, or whose
    /// payload is missing required fields.
    pub fn parse(text: &str) -> Result<ClientEvent> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| RelayError::protocol(format!("invalid envelope: {}", e)))?;

        match envelope.event.as_str() {
            "join_chat" => Ok(ClientEvent::JoinChat(decode("join_chat", envelope.data)?)),
            "send_message" => Ok(ClientEvent::SendMessage(decode(
                "send_message",
                envelope.data,
            )?)),
            "typing_start" => Ok(ClientEvent::TypingStart(decode(
                "typing_start",
                envelope.data,
            )?)),
            "typing_stop" => Ok(ClientEvent::TypingStop(decode(
                "typing_stop",
                envelope.data,
            )?)),
            "delete_message" => Ok(ClientEvent::DeleteMessage(decode(
                "delete_message",
                envelope.data,
            )?)),
            "file_sending_start" => Ok(ClientEvent::FileSendingStart(decode(
                "file_sending_start",
                envelope.data,
            )?)),
            "file_sending_end" => Ok(ClientEvent::FileSendingEnd(decode(
                "file_sending_end",
                envelope.data,
            )?)),
            "webrtc_offer" => Ok(ClientEvent::Signal(
                SignalKind::Offer,
                SignalData::from_value(envelope.data)?,
            )),
            "webrtc_answer" => Ok(ClientEvent::Signal(
                SignalKind::Answer,
                SignalData::from_value(envelope.data)?,
            )),
            "webrtc_ice_candidate" => Ok(ClientEvent::Signal(
                SignalKind::IceCandidate,
                SignalData::from_value(envelope.data)?,
            )),
            "webrtc_end_call" => Ok(ClientEvent::Signal(
                SignalKind::EndCall,
                SignalData::from_value(envelope.data)?,
            )),
            "disconnect_chat" => Ok(ClientEvent::DisconnectChat),
            other => Err(RelayError::protocol(format!("unknown event: {}", other))),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(kind: &str, data: Value) -> Result<T> {
    serde_json::from_value(data)
        .map_err(|e| RelayError::protocol(format!("bad {} payload: {}", kind, e)))
}

// =============================================================================
// Server -> client events
// =============================================================================

/// Backpressure class of an outbound frame. When a session's queue fills,
/// typing frames are dropped first, then file-progress frames; delivery
/// frames are never dropped while the session is healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Delivery,
    Typing,
    FileProgress,
}

/// An outbound event ready to be rendered into a wire envelope
#[derive(Debug, Clone)]
pub enum ServerEvent {
    ChatStarted { group_code: Option<String> },
    ReceiveMessage {
        sender: String,
        message: EncryptedPayload,
        reply_to: Option<i64>,
    },
    GroupMembersUpdate(Vec<String>),
    UserJoinedGroup(String),
    UserLeftGroup(String),
    TypingStarted { sender: String },
    TypingStopped,
    MessageDeleted { message_id: String },
    FileSendingStarted { file_id: String, username: String },
    FileSendingEnded { file_id: String, username: String },
    PartnerDisconnected,
    WaitingForMatch,
    NoMatchFound,
    GroupNotFound,
    Signal { kind: SignalKind, data: Value },
}

impl ServerEvent {
    /// The wire event name
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerEvent::ChatStarted { .. } => "chat_started",
            ServerEvent::ReceiveMessage { .. } => "receive_message",
            ServerEvent::GroupMembersUpdate(_) => "group_members_update",
            ServerEvent::UserJoinedGroup(_) => "user_joined_group",
            ServerEvent::UserLeftGroup(_) => "user_left_group",
            ServerEvent::TypingStarted { .. } => "typing_started",
            ServerEvent::TypingStopped => "typing_stopped",
            ServerEvent::MessageDeleted { .. } => "message_deleted",
            ServerEvent::FileSendingStarted { .. } => "file_sending_started",
            ServerEvent::FileSendingEnded { .. } => "file_sending_ended",
            ServerEvent::PartnerDisconnected => "partner_disconnected",
            ServerEvent::WaitingForMatch => "waiting_for_match",
            ServerEvent::NoMatchFound => "no_match_found",
            ServerEvent::GroupNotFound => "group_not_found",
            ServerEvent::Signal { kind, .. } => kind.event_name(),
        }
    }

    /// Backpressure class of this event
    pub fn frame_class(&self) -> FrameClass {
        match self {
            ServerEvent::TypingStarted { .. } | ServerEvent::TypingStopped => FrameClass::Typing,
            ServerEvent::FileSendingStarted { .. } | ServerEvent::FileSendingEnded { .. } => {
                FrameClass::FileProgress
            }
            _ => FrameClass::Delivery,
        }
    }

    /// Render the `data` half of the envelope
    pub fn to_data(&self) -> Value {
        match self {
            ServerEvent::ChatStarted { group_code } => match group_code {
                Some(code) => json!({ "groupCode": code }),
                None => json!({}),
            },
            ServerEvent::ReceiveMessage {
                sender,
                message,
                reply_to,
            } => {
                let mut data = Map::new();
                data.insert("sender".into(), json!(sender));
                data.insert("message".into(), json!(message));
                if let Some(reply_to) = reply_to {
                    data.insert("reply_to".into(), json!(reply_to));
                }
                Value::Object(data)
            }
            ServerEvent::GroupMembersUpdate(usernames) => json!(usernames),
            ServerEvent::UserJoinedGroup(username) => json!(username),
            ServerEvent::UserLeftGroup(username) => json!(username),
            ServerEvent::TypingStarted { sender } => json!({ "sender": sender }),
            ServerEvent::TypingStopped => json!({}),
            ServerEvent::MessageDeleted { message_id } => json!({ "messageId": message_id }),
            ServerEvent::FileSendingStarted { file_id, username } => {
                json!({ "fileId": file_id, "username": username })
            }
            ServerEvent::FileSendingEnded { file_id, username } => {
                json!({ "fileId": file_id, "username": username })
            }
            ServerEvent::PartnerDisconnected
            | ServerEvent::WaitingForMatch
            | ServerEvent::NoMatchFound
            | ServerEvent::GroupNotFound => json!({}),
            ServerEvent::Signal { data, .. } => data.clone(),
        }
    }

    /// Render the full envelope as JSON text
    pub fn to_json(&self) -> String {
        let data = self.to_data();
        let envelope = OutEnvelope {
            event: self.event_name(),
            data: &data,
        };
        // JSON values with string keys always serialize
        serde_json::to_string(&envelope).expect("server event serializes")
    }

    /// Encode into a length-prefixed wire frame
    pub fn encode(&self) -> Bytes {
        Frame::text(self.to_json()).encode_to_bytes()
    }
}
