use std::collections::{HashMap, HashSet};

use shared::domain::{ChannelId, UserId};

/// Online users (replaced wholesale by each snapshot) and per-channel unread
/// counters relative to the channel the UI reports as active.
#[derive(Debug, Default)]
pub struct PresenceAggregator {
    online: HashSet<UserId>,
    unread: HashMap<ChannelId, u32>,
    active: Option<ChannelId>,
}

impl PresenceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new set when it differs from the previous snapshot.
    pub fn replace_online(&mut self, online: impl IntoIterator<Item = UserId>) -> Option<HashSet<UserId>> {
        let next: HashSet<UserId> = online.into_iter().collect();
        if next == self.online {
            return None;
        }
        self.online = next;
        Some(self.online.clone())
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.online.contains(user_id)
    }

    pub fn online_users(&self) -> HashSet<UserId> {
        self.online.clone()
    }

    pub fn unread_count(&self, channel_id: &ChannelId) -> u32 {
        self.unread.get(channel_id).copied().unwrap_or(0)
    }

    pub fn active_channel(&self) -> Option<&ChannelId> {
        self.active.as_ref()
    }

    /// Counts a newly arrived remote message. Returns the updated counter,
    /// or `None` when the channel is the active one.
    pub fn record_remote_message(&mut self, channel_id: &ChannelId) -> Option<u32> {
        if self.active.as_ref() == Some(channel_id) {
            return None;
        }
        let count = self.unread.entry(channel_id.clone()).or_insert(0);
        *count = count.saturating_add(1);
        Some(*count)
    }

    /// Activating a channel marks it read. Returns the channel whose counter
    /// was reset, if it had anything unread.
    pub fn set_active_channel(&mut self, channel_id: Option<ChannelId>) -> Option<ChannelId> {
        self.active = channel_id.clone();
        let channel_id = channel_id?;
        self.mark_read(&channel_id).then_some(channel_id)
    }

    /// Returns true when the counter changed.
    pub fn mark_read(&mut self, channel_id: &ChannelId) -> bool {
        match self.unread.get_mut(channel_id) {
            Some(count) if *count > 0 => {
                *count = 0;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(id: &str) -> ChannelId {
        ChannelId::new(id)
    }

    #[test]
    fn counts_only_inactive_channels() {
        let mut presence = PresenceAggregator::new();
        presence.set_active_channel(Some(ch("b")));

        assert_eq!(presence.record_remote_message(&ch("a")), Some(1));
        assert_eq!(presence.record_remote_message(&ch("b")), None);
        assert_eq!(presence.unread_count(&ch("a")), 1);
        assert_eq!(presence.unread_count(&ch("b")), 0);

        assert!(presence.mark_read(&ch("a")));
        assert_eq!(presence.unread_count(&ch("a")), 0);
        assert!(!presence.mark_read(&ch("a")));
    }

    #[test]
    fn activating_a_channel_resets_its_counter() {
        let mut presence = PresenceAggregator::new();
        presence.record_remote_message(&ch("a"));
        presence.record_remote_message(&ch("a"));

        assert_eq!(presence.set_active_channel(Some(ch("a"))), Some(ch("a")));
        assert_eq!(presence.unread_count(&ch("a")), 0);
        assert_eq!(presence.set_active_channel(None), None);
        assert_eq!(presence.record_remote_message(&ch("a")), Some(1));
    }

    #[test]
    fn snapshots_replace_rather_than_merge() {
        let mut presence = PresenceAggregator::new();
        presence.replace_online([UserId::new("u1"), UserId::new("u2")]);
        let changed = presence
            .replace_online([UserId::new("u3")])
            .expect("changed");

        assert_eq!(changed.len(), 1);
        assert!(presence.is_online(&UserId::new("u3")));
        assert!(!presence.is_online(&UserId::new("u1")));
        assert!(presence.replace_online([UserId::new("u3")]).is_none());
    }
}
