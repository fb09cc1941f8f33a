use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{ChannelId, MessageId, UserId},
    error::ProtocolError,
};

pub const EVENT_MESSAGE_NEW: &str = "message:new";
pub const EVENT_MESSAGE_DELETE: &str = "message:delete";
pub const EVENT_PRESENCE_UPDATE: &str = "presence:update";
pub const EVENT_AUTH_ERROR: &str = "auth:error";

/// Frames the client writes onto the realtime transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientFrame {
    #[serde(rename = "authenticate")]
    Authenticate { user_id: UserId, token: String },
    #[serde(rename = "join:channel")]
    JoinChannel { id: ChannelId },
    #[serde(rename = "leave:channel")]
    LeaveChannel { id: ChannelId },
}

impl ClientFrame {
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::MalformedFrame)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    #[serde(default)]
    pub author_display: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
    pub temp_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendMessageResponse {
    #[serde(default)]
    pub id: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDeletedPayload {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    pub online: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthErrorPayload {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NewMessageEnvelope {
    message: MessagePayload,
}

/// Events pushed by the server. `Unknown` keeps the type name of anything
/// this client does not understand so it can be logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    MessageNew(MessagePayload),
    MessageDelete(MessageDeletedPayload),
    PresenceUpdate(PresencePayload),
    AuthError(AuthErrorPayload),
    Unknown(String),
}

impl ServerEvent {
    pub fn event_type(&self) -> &str {
        match self {
            Self::MessageNew(_) => EVENT_MESSAGE_NEW,
            Self::MessageDelete(_) => EVENT_MESSAGE_DELETE,
            Self::PresenceUpdate(_) => EVENT_PRESENCE_UPDATE,
            Self::AuthError(_) => EVENT_AUTH_ERROR,
            Self::Unknown(name) => name,
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(ProtocolError::MalformedFrame)?;
        let event_type = envelope.event_type;
        let payload = envelope.payload;
        let invalid = |source| ProtocolError::InvalidPayload {
            event_type: event_type.clone(),
            source,
        };

        let event = match event_type.as_str() {
            EVENT_MESSAGE_NEW => {
                let wrapped: NewMessageEnvelope =
                    serde_json::from_value(payload).map_err(invalid)?;
                Self::MessageNew(wrapped.message)
            }
            EVENT_MESSAGE_DELETE => {
                Self::MessageDelete(serde_json::from_value(payload).map_err(invalid)?)
            }
            EVENT_PRESENCE_UPDATE => {
                Self::PresenceUpdate(serde_json::from_value(payload).map_err(invalid)?)
            }
            EVENT_AUTH_ERROR => Self::AuthError(serde_json::from_value(payload).map_err(invalid)?),
            _ => Self::Unknown(event_type.clone()),
        };
        Ok(event)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let payload = match self {
            Self::MessageNew(message) => serde_json::to_value(NewMessageEnvelope {
                message: message.clone(),
            }),
            Self::MessageDelete(payload) => serde_json::to_value(payload),
            Self::PresenceUpdate(payload) => serde_json::to_value(payload),
            Self::AuthError(payload) => serde_json::to_value(payload),
            Self::Unknown(_) => Ok(Value::Null),
        }
        .map_err(ProtocolError::MalformedFrame)?;

        serde_json::to_string(&Envelope {
            event_type: self.event_type().to_string(),
            payload,
        })
        .map_err(ProtocolError::MalformedFrame)
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
