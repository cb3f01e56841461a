//! Shared message model and JSON codec for the realtime chat transport.
//!
//! This crate owns the wire representation used by the connection manager
//! and the CLI. Outbound envelopes are encoded with one canonical,
//! lowercase field schema (the schema the backend's JSON tags define);
//! inbound frames are decoded tolerantly, accepting the capitalized field
//! variants that older clients emitted alongside the canonical ones.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The literal, non-JSON text frame that acknowledges a successful
/// authentication handshake.
pub const AUTH_SENTINEL: &str = "authenticated";

/// Envelope type tag carried by direct user-to-user messages.
pub const TYPE_MESSAGE_USER: &str = "messageuser";

/// Error returned by [`decode`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The frame is neither the auth sentinel nor valid JSON.
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// The frame parsed but carries no non-empty content field.
    #[error("frame has no text/content field")]
    MissingContent,
    /// A direct message envelope without a non-empty sender.
    #[error("direct frame has no sender")]
    MissingSender,
    /// The frame carries a `type` tag this client does not display.
    #[error("unhandled frame type: {0}")]
    UnhandledType(String),
}

/// Where an outbound message is addressed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// One-to-one conversation with another user.
    Direct { peer_id: String },
    /// Group conversation identified by its numeric id.
    Group { group_id: i64 },
}

/// A single chat message as held by the message list cache.
///
/// Immutable once appended; the (sender, content, timestamp) triple is the
/// deduplication key that drops server echoes of optimistic local appends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Sender identifier or display name as the server reported it.
    pub sender: String,
    /// Message body.
    pub content: String,
    /// Server-formatted or ISO-8601 timestamp string.
    pub timestamp: String,
    /// Group context, if the message belongs to a group conversation.
    pub group_id: Option<i64>,
}

/// A successfully decoded inbound frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// The handshake acknowledgment sentinel.
    Authenticated,
    /// An error envelope; the payload is the server's error text.
    Error(String),
    /// An ordinary chat message.
    Chat(ChatMessage),
}

/// Encode the authentication envelope sent once after transport open.
#[must_use]
pub fn encode_auth(bearer_token: &str) -> String {
    serde_json::json!({ "type": "auth", "token": bearer_token }).to_string()
}

/// Encode a direct user-to-user message envelope.
#[must_use]
pub fn encode_direct(sender: &str, peer_id: &str, content: &str, timestamp: &str) -> String {
    serde_json::json!({
        "type": TYPE_MESSAGE_USER,
        "sender": sender,
        "receiver": [peer_id],
        "content": content,
        "groupid": 0,
        "notificationid": 0,
        "offset": 0,
        "timestamp": timestamp,
    })
    .to_string()
}

/// Encode a group message envelope.
#[must_use]
pub fn encode_group(group_id: i64, text: &str) -> String {
    serde_json::json!({ "group_id": group_id, "text": text }).to_string()
}

/// Decode an inbound text frame.
///
/// Decoding never terminates the connection: callers drop and log frames
/// that fail here.
///
/// # Errors
///
/// Returns [`DecodeError::Json`] for non-JSON frames other than the
/// sentinel, [`DecodeError::UnhandledType`] for envelopes tagged with a
/// type this client does not display, [`DecodeError::MissingContent`]
/// for envelopes with no non-empty message body, and
/// [`DecodeError::MissingSender`] for direct envelopes lacking a sender.
pub fn decode(frame: &str) -> Result<Inbound, DecodeError> {
    if frame == AUTH_SENTINEL {
        return Ok(Inbound::Authenticated);
    }

    let value: Value = serde_json::from_str(frame)?;

    if let Some(error) = field_str(&value, &["error", "Error"]) {
        if !error.is_empty() {
            return Ok(Inbound::Error(error.to_owned()));
        }
    }

    let kind = field_str(&value, &["type", "Type"]);
    if let Some(kind) = kind {
        // The hub reports malformed input as a typed error envelope whose
        // message rides in the content field.
        if kind == "error" {
            let message = field_str(&value, &["content", "Content"])
                .unwrap_or("unknown server error")
                .to_owned();
            return Ok(Inbound::Error(message));
        }
        if kind != TYPE_MESSAGE_USER {
            return Err(DecodeError::UnhandledType(kind.to_owned()));
        }
    }

    let content = field_str(&value, &["text", "Text", "content", "Content"])
        .filter(|content| !content.is_empty())
        .ok_or(DecodeError::MissingContent)?
        .to_owned();

    // Direct envelopes without an identified sender are not displayed;
    // untyped group frames fall back to a placeholder.
    let sender = match field_str(&value, &["sender", "Sender"]).filter(|s| !s.is_empty()) {
        Some(sender) => sender.to_owned(),
        None if kind == Some(TYPE_MESSAGE_USER) => return Err(DecodeError::MissingSender),
        None => "unknown".to_owned(),
    };

    let timestamp = field_str(
        &value,
        &["time", "timestamp", "Timestamp", "created_at", "CreatedAt"],
    )
    .unwrap_or_default()
    .to_owned();

    let group_id = ["group_id", "groupid", "Groupid", "GroupID"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_i64));

    Ok(Inbound::Chat(ChatMessage {
        sender,
        content,
        timestamp,
        group_id,
    }))
}

fn field_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| value.get(*key).and_then(Value::as_str))
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
