use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ChannelId, MessageId, UserId},
    protocol::MessagePayload,
};

use crate::types::{Message, MessageOrigin, PendingOperation};

pub const TEMP_ID_PREFIX: &str = "tmp-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// A message nobody was waiting for.
    Inserted(Message),
    /// The echo of a pending write took its placeholder's slot.
    Replaced {
        previous_id: MessageId,
        message: Message,
    },
    Duplicate,
}

/// How an acknowledged write was settled when its echo never came.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    /// The server id was known, so the placeholder now carries it.
    Promoted {
        previous_id: MessageId,
        message: Message,
    },
    /// No server id to fall back on; the placeholder is gone.
    Dropped(Message),
}

/// Per-channel message lists plus the optimistic writes and deletes that
/// are still waiting for the server. Every `Local` message in a list has a
/// matching entry in `pending`, keyed by its temporary id.
#[derive(Debug)]
pub struct Reconciler {
    lists: HashMap<ChannelId, Vec<Message>>,
    pending: HashMap<String, PendingOperation>,
    pending_deletes: HashMap<MessageId, Message>,
    echo_window: chrono::Duration,
    temp_seq: u64,
}

impl Reconciler {
    pub fn new(echo_window: Duration) -> Self {
        Self {
            lists: HashMap::new(),
            pending: HashMap::new(),
            pending_deletes: HashMap::new(),
            echo_window: chrono::Duration::from_std(echo_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(10)),
            temp_seq: 0,
        }
    }

    pub fn messages(&self, channel_id: &ChannelId) -> Vec<Message> {
        self.lists.get(channel_id).cloned().unwrap_or_default()
    }

    pub fn pending(&self, temp_id: &str) -> Option<&PendingOperation> {
        self.pending.get(temp_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_delete_pending(&self, message_id: &MessageId) -> bool {
        self.pending_deletes.contains_key(message_id)
    }

    fn next_temp_id(&mut self, now: DateTime<Utc>) -> String {
        self.temp_seq += 1;
        format!(
            "{TEMP_ID_PREFIX}{}-{}",
            now.timestamp_millis(),
            self.temp_seq
        )
    }

    /// Appends a `Local` placeholder and records the pending write.
    pub fn apply_local(
        &mut self,
        channel_id: &ChannelId,
        author_id: &UserId,
        author_display: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Message {
        let temp_id = self.next_temp_id(now);
        let message = Message {
            id: MessageId::new(temp_id.clone()),
            channel_id: channel_id.clone(),
            author_id: author_id.clone(),
            author_display: author_display.to_string(),
            body: body.to_string(),
            created_at: now,
            origin: MessageOrigin::Local,
        };

        self.pending.insert(
            temp_id.clone(),
            PendingOperation {
                temp_id,
                channel_id: channel_id.clone(),
                author_id: author_id.clone(),
                body: body.to_string(),
                submitted_at: now,
                acknowledged: false,
                server_id: None,
            },
        );
        self.lists
            .entry(channel_id.clone())
            .or_default()
            .push(message.clone());
        message
    }

    /// The write succeeded. The placeholder stays until its echo arrives,
    /// unless the server copy is already in the list, in which case the
    /// placeholder is dropped and its id returned.
    pub fn acknowledge(&mut self, temp_id: &str, server_id: Option<MessageId>) -> Option<MessageId> {
        let op = self.pending.get_mut(temp_id)?;
        op.acknowledged = true;
        op.server_id = server_id.clone();

        let server_id = server_id?;
        let channel_id = op.channel_id.clone();
        let already_delivered = self
            .lists
            .get(&channel_id)
            .is_some_and(|list| list.iter().any(|m| m.id == server_id));
        if !already_delivered {
            return None;
        }

        self.pending.remove(temp_id);
        let placeholder = MessageId::new(temp_id);
        if let Some(list) = self.lists.get_mut(&channel_id) {
            list.retain(|m| m.id != placeholder);
        }
        Some(placeholder)
    }

    /// Settles a write that was acknowledged but never echoed. Unacknowledged
    /// or already reconciled writes are left alone.
    pub fn expire_acknowledged(&mut self, temp_id: &str) -> Option<Expiry> {
        if !self.pending.get(temp_id)?.acknowledged {
            return None;
        }
        let op = self.pending.remove(temp_id)?;
        let placeholder = MessageId::new(temp_id);
        let list = self.lists.get_mut(&op.channel_id)?;
        let index = list.iter().position(|m| m.id == placeholder)?;

        match op.server_id {
            Some(server_id) if !self.pending_deletes.contains_key(&server_id) => {
                let message = &mut list[index];
                message.id = server_id;
                message.origin = MessageOrigin::Reconciled;
                Some(Expiry::Promoted {
                    previous_id: placeholder,
                    message: message.clone(),
                })
            }
            _ => Some(Expiry::Dropped(list.remove(index))),
        }
    }

    /// The write failed: drop the pending entry and its placeholder together.
    pub fn fail(&mut self, temp_id: &str) -> Option<Message> {
        let op = self.pending.remove(temp_id)?;
        let placeholder = MessageId::new(temp_id);
        let list = self.lists.get_mut(&op.channel_id)?;
        let index = list.iter().position(|m| m.id == placeholder)?;
        Some(list.remove(index))
    }

    fn match_pending(&self, payload: &MessagePayload) -> Option<String> {
        if let Some(temp_id) = &payload.temp_id {
            if self
                .pending
                .get(temp_id)
                .is_some_and(|op| op.channel_id == payload.channel_id)
            {
                return Some(temp_id.clone());
            }
        }

        if let Some(op) = self
            .pending
            .values()
            .find(|op| op.server_id.as_ref() == Some(&payload.id))
        {
            return Some(op.temp_id.clone());
        }

        self.pending
            .values()
            .filter(|op| {
                let delta = payload.created_at.signed_duration_since(op.submitted_at);
                op.channel_id == payload.channel_id
                    && op.author_id == payload.author_id
                    && op.body == payload.body
                    && delta <= self.echo_window
                    && -delta <= self.echo_window
            })
            .min_by_key(|op| (op.submitted_at, op.temp_id.clone()))
            .map(|op| op.temp_id.clone())
    }

    pub fn apply_remote(&mut self, payload: MessagePayload) -> RemoteOutcome {
        let known = self
            .lists
            .get(&payload.channel_id)
            .is_some_and(|list| list.iter().any(|m| m.id == payload.id));
        if known || self.pending_deletes.contains_key(&payload.id) {
            return RemoteOutcome::Duplicate;
        }

        let matched = self.match_pending(&payload);
        let message = Message::remote(payload);
        let list = self.lists.entry(message.channel_id.clone()).or_default();

        let Some(temp_id) = matched else {
            insert_by_time(list, message.clone());
            return RemoteOutcome::Inserted(message);
        };

        self.pending.remove(&temp_id);
        let previous_id = MessageId::new(temp_id);
        match list.iter().position(|m| m.id == previous_id) {
            Some(index) => list[index] = message.clone(),
            None => insert_by_time(list, message.clone()),
        }
        RemoteOutcome::Replaced {
            previous_id,
            message,
        }
    }

    /// History pages are merged oldest first through the same matching rules
    /// as live events.
    pub fn merge_history(&mut self, mut page: Vec<MessagePayload>) -> Vec<RemoteOutcome> {
        page.sort_by_key(|m| m.created_at);
        page.into_iter()
            .map(|payload| self.apply_remote(payload))
            .filter(|outcome| *outcome != RemoteOutcome::Duplicate)
            .collect()
    }

    /// Server-side delete. Also settles an optimistic delete of the same id.
    pub fn remove_remote(&mut self, channel_id: &ChannelId, message_id: &MessageId) -> Option<Message> {
        self.pending_deletes.remove(message_id);
        let list = self.lists.get_mut(channel_id)?;
        let index = list
            .iter()
            .position(|m| &m.id == message_id && m.origin != MessageOrigin::Local)?;
        Some(list.remove(index))
    }

    /// Optimistically removes a confirmed message, remembering it for rollback.
    /// Placeholders cannot be deleted: they have no server identity yet.
    pub fn begin_delete(&mut self, channel_id: &ChannelId, message_id: &MessageId) -> Option<Message> {
        let list = self.lists.get_mut(channel_id)?;
        let index = list
            .iter()
            .position(|m| &m.id == message_id && m.origin != MessageOrigin::Local)?;
        let removed = list.remove(index);
        self.pending_deletes
            .insert(message_id.clone(), removed.clone());
        Some(removed)
    }

    pub fn confirm_delete(&mut self, message_id: &MessageId) -> bool {
        self.pending_deletes.remove(message_id).is_some()
    }

    /// Puts a message whose delete was rejected back at the position its
    /// timestamp calls for, which may differ from where it used to be.
    pub fn rollback(&mut self, message_id: &MessageId) -> Option<Message> {
        let mut restored = self.pending_deletes.remove(message_id)?;
        restored.origin = MessageOrigin::Reconciled;
        let list = self.lists.entry(restored.channel_id.clone()).or_default();
        insert_by_time(list, restored.clone());
        Some(restored)
    }
}

fn insert_by_time(list: &mut Vec<Message>, message: Message) {
    let index = list.partition_point(|m| m.created_at <= message.created_at);
    list.insert(index, message);
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
