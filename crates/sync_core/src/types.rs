use std::collections::HashSet;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChannelId, MessageId, UserId},
    protocol::MessagePayload,
};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    /// Optimistic placeholder awaiting confirmation.
    Local,
    /// Authoritative copy delivered by the server.
    Remote,
    /// Restored after a rejected optimistic delete.
    Reconciled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub author_display: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub origin: MessageOrigin,
}

impl Message {
    pub fn remote(payload: MessagePayload) -> Self {
        Self {
            id: payload.id,
            channel_id: payload.channel_id,
            author_id: payload.author_id,
            author_display: payload.author_display,
            body: payload.body,
            created_at: payload.created_at,
            origin: MessageOrigin::Remote,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.origin == MessageOrigin::Local
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    pub temp_id: String,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub body: String,
    pub submitted_at: DateTime<Utc>,
    /// Set once the write succeeded; the entry then only waits for its echo.
    pub acknowledged: bool,
    pub server_id: Option<MessageId>,
}

/// Everything the UI layer can observe, delivered over one broadcast channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged(ConnectionState),
    Message(Message),
    MessageReplaced {
        channel_id: ChannelId,
        previous_id: MessageId,
        message: Message,
    },
    MessageDeleted {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    PresenceChanged(HashSet<UserId>),
    UnreadChanged {
        channel_id: ChannelId,
        count: u32,
    },
    WriteFailed {
        channel_id: ChannelId,
        entity_id: String,
        error: SyncError,
    },
    Error(SyncError),
}
