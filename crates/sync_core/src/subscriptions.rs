use std::collections::HashMap;

use shared::{domain::ChannelId, protocol::ClientFrame};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ChannelIntent {
    wanted: bool,
}

/// Membership intent per channel. Entries are never removed during a
/// session: leaving only clears `wanted`, so late traffic for a channel the
/// user walked away from can be recognised and ignored.
#[derive(Debug, Default)]
pub struct SubscriptionTracker {
    channels: HashMap<ChannelId, ChannelIntent>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the frame to send right away, if any. Re-joining a wanted
    /// channel only re-asserts intent.
    pub fn join(&mut self, channel_id: &ChannelId, connected: bool) -> Option<ClientFrame> {
        let intent = self
            .channels
            .entry(channel_id.clone())
            .or_insert(ChannelIntent { wanted: false });
        let newly_wanted = !intent.wanted;
        intent.wanted = true;

        (newly_wanted && connected).then(|| ClientFrame::JoinChannel {
            id: channel_id.clone(),
        })
    }

    pub fn leave(&mut self, channel_id: &ChannelId, connected: bool) -> Option<ClientFrame> {
        let was_wanted = match self.channels.get_mut(channel_id) {
            Some(intent) => std::mem::replace(&mut intent.wanted, false),
            None => false,
        };

        (was_wanted && connected).then(|| ClientFrame::LeaveChannel {
            id: channel_id.clone(),
        })
    }

    /// One join frame per wanted channel; called once per transition into
    /// `Connected`.
    pub fn resubscribe_all(&self) -> Vec<ClientFrame> {
        self.channels
            .iter()
            .filter(|(_, intent)| intent.wanted)
            .map(|(id, _)| ClientFrame::JoinChannel { id: id.clone() })
            .collect()
    }

    pub fn is_wanted(&self, channel_id: &ChannelId) -> bool {
        self.channels
            .get(channel_id)
            .is_some_and(|intent| intent.wanted)
    }

    /// Known to the tracker but explicitly left.
    pub fn is_abandoned(&self, channel_id: &ChannelId) -> bool {
        self.channels
            .get(channel_id)
            .is_some_and(|intent| !intent.wanted)
    }

    pub fn wanted_channels(&self) -> Vec<ChannelId> {
        let mut wanted: Vec<_> = self
            .channels
            .iter()
            .filter(|(_, intent)| intent.wanted)
            .map(|(id, _)| id.clone())
            .collect();
        wanted.sort();
        wanted
    }
}

#[cfg(test)]
#[path = "tests/subscriptions_tests.rs"]
mod tests;
