// WebSocket message types for the beacon realtime protocol.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Every event type the relay can push to a client.
///
/// The tag set is closed: business logic publishes through
/// [`EventKind`] rather than free-form strings, so an unknown kind is
/// a compile error, not a silent typo on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    #[serde(rename = "issue.created")]
    IssueCreated,
    #[serde(rename = "issue.updated")]
    IssueUpdated,
    #[serde(rename = "issue.deleted")]
    IssueDeleted,
    #[serde(rename = "issue.archived")]
    IssueArchived,
    #[serde(rename = "comment.created")]
    CommentCreated,
    #[serde(rename = "comment.updated")]
    CommentUpdated,
    #[serde(rename = "comment.deleted")]
    CommentDeleted,
    #[serde(rename = "project.updated")]
    ProjectUpdated,
    #[serde(rename = "cycle.updated")]
    CycleUpdated,
    #[serde(rename = "user.typing")]
    UserTyping,
    #[serde(rename = "connection.ack")]
    ConnectionAck,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error,
}

impl EventKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::IssueCreated => "issue.created",
            Self::IssueUpdated => "issue.updated",
            Self::IssueDeleted => "issue.deleted",
            Self::IssueArchived => "issue.archived",
            Self::CommentCreated => "comment.created",
            Self::CommentUpdated => "comment.updated",
            Self::CommentDeleted => "comment.deleted",
            Self::ProjectUpdated => "project.updated",
            Self::CycleUpdated => "cycle.updated",
            Self::UserTyping => "user.typing",
            Self::ConnectionAck => "connection.ack",
            Self::Pong => "pong",
            Self::Error => "error",
        }
    }
}

/// Error codes carried inside an `error` envelope payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsErrorCode {
    RateLimitExceeded,
    InvalidMessage,
}

impl WsErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::InvalidMessage => "INVALID_MESSAGE",
        }
    }
}

/// Server -> client envelope.
///
/// Built once per broadcast, serialized once, and fanned out
/// unmodified to every recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: Value,
    /// RFC 3339 timestamp taken when the envelope was built.
    pub timestamp: String,
    /// The acting user, when the event has one.
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

impl ServerEvent {
    pub fn new(kind: EventKind, payload: Value, user_id: Option<Uuid>) -> Self {
        Self { kind, payload, timestamp: Utc::now().to_rfc3339(), user_id }
    }

    /// Handshake acknowledgment sent right after a connection registers.
    pub fn connection_ack(user_id: Uuid, email: &str) -> Self {
        Self::new(
            EventKind::ConnectionAck,
            json!({ "userId": user_id, "email": email }),
            Some(user_id),
        )
    }

    /// Acknowledgment for a client liveness ping.
    pub fn pong() -> Self {
        Self::new(EventKind::Pong, json!({}), None)
    }

    pub fn error(code: WsErrorCode, message: &str) -> Self {
        Self::new(
            EventKind::Error,
            json!({ "code": code.as_str(), "message": message }),
            None,
        )
    }

    /// Rate-limit error including the retry hint clients back off on.
    pub fn rate_limit_error(retry_after_seconds: u64) -> Self {
        Self::new(
            EventKind::Error,
            json!({
                "code": WsErrorCode::RateLimitExceeded.as_str(),
                "message": "message rate limit exceeded",
                "retryAfterSeconds": retry_after_seconds,
            }),
            None,
        )
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Client -> server control messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Subscribe { rooms: Vec<String> },
    Unsubscribe { rooms: Vec<String> },
    Ping,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClientMessageError {
    /// Not JSON, not an object, or missing the `action`/`type` tag.
    #[error("client frame is not a recognizable json control message")]
    Malformed,
    /// A subscribe/unsubscribe frame whose `rooms` is not a string array.
    #[error("`rooms` must be a non-empty array of strings")]
    InvalidRooms,
    /// A well-formed frame of a kind this relay does not handle.
    /// Callers log and ignore these so newer clients keep working.
    #[error("unhandled client message kind `{kind}`")]
    Unrecognized { kind: String },
}

/// Parse a raw text frame into a control message.
///
/// Dispatches on the `action` field (subscribe/unsubscribe) or the
/// `type` field (ping). A frame with a tag we do not know yields
/// [`ClientMessageError::Unrecognized`]; everything else malformed.
pub fn parse_client_message(raw: &str) -> Result<ClientMessage, ClientMessageError> {
    let value: Value = serde_json::from_str(raw).map_err(|_| ClientMessageError::Malformed)?;
    let object = value.as_object().ok_or(ClientMessageError::Malformed)?;

    if let Some(action) = object.get("action").and_then(Value::as_str) {
        return match action {
            "subscribe" => Ok(ClientMessage::Subscribe { rooms: parse_rooms(object)? }),
            "unsubscribe" => Ok(ClientMessage::Unsubscribe { rooms: parse_rooms(object)? }),
            other => Err(ClientMessageError::Unrecognized { kind: other.to_string() }),
        };
    }

    if let Some(kind) = object.get("type").and_then(Value::as_str) {
        return match kind {
            "ping" => Ok(ClientMessage::Ping),
            other => Err(ClientMessageError::Unrecognized { kind: other.to_string() }),
        };
    }

    Err(ClientMessageError::Malformed)
}

fn parse_rooms(
    object: &serde_json::Map<String, Value>,
) -> Result<Vec<String>, ClientMessageError> {
    let rooms = object
        .get("rooms")
        .and_then(Value::as_array)
        .ok_or(ClientMessageError::InvalidRooms)?;

    let names = rooms
        .iter()
        .map(|room| room.as_str().map(ToOwned::to_owned))
        .collect::<Option<Vec<_>>>()
        .ok_or(ClientMessageError::InvalidRooms)?;

    if names.is_empty() {
        return Err(ClientMessageError::InvalidRooms);
    }

    Ok(names)
}
