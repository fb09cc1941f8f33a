use std::collections::HashSet;

use super::*;

fn joined_ids(frames: Vec<ClientFrame>) -> Vec<String> {
    let mut ids: Vec<String> = frames
        .into_iter()
        .map(|frame| match frame {
            ClientFrame::JoinChannel { id } => id.0,
            other => panic!("unexpected frame: {other:?}"),
        })
        .collect();
    ids.sort();
    ids
}

#[test]
fn join_while_disconnected_is_deferred() {
    let mut tracker = SubscriptionTracker::new();
    assert_eq!(tracker.join(&ChannelId::new("a"), false), None);
    assert!(tracker.is_wanted(&ChannelId::new("a")));
    assert_eq!(joined_ids(tracker.resubscribe_all()), vec!["a"]);
}

#[test]
fn join_while_connected_sends_once() {
    let mut tracker = SubscriptionTracker::new();
    let id = ChannelId::new("a");
    assert_eq!(
        tracker.join(&id, true),
        Some(ClientFrame::JoinChannel { id: id.clone() })
    );
    assert_eq!(tracker.join(&id, true), None);
}

#[test]
fn leave_of_unknown_channel_is_a_noop() {
    let mut tracker = SubscriptionTracker::new();
    assert_eq!(tracker.leave(&ChannelId::new("ghost"), true), None);
    assert!(!tracker.is_abandoned(&ChannelId::new("ghost")));
}

#[test]
fn leave_keeps_entry_but_clears_intent() {
    let mut tracker = SubscriptionTracker::new();
    let id = ChannelId::new("a");
    tracker.join(&id, false);
    assert_eq!(
        tracker.leave(&id, true),
        Some(ClientFrame::LeaveChannel { id: id.clone() })
    );
    assert!(tracker.is_abandoned(&id));
    assert!(tracker.resubscribe_all().is_empty());
}

#[test]
fn resubscribe_covers_each_wanted_channel_exactly_once_regardless_of_order() {
    let sequences: Vec<Vec<(&str, bool)>> = vec![
        vec![("a", true), ("b", true), ("c", true), ("b", false)],
        vec![("b", false), ("c", true), ("a", true), ("a", true)],
        vec![("c", true), ("b", true), ("b", false), ("a", true), ("c", true)],
    ];

    for sequence in sequences {
        let mut tracker = SubscriptionTracker::new();
        for (id, join) in &sequence {
            let id = ChannelId::new(*id);
            if *join {
                tracker.join(&id, false);
            } else {
                tracker.leave(&id, false);
            }
        }

        let frames = joined_ids(tracker.resubscribe_all());
        let unique: HashSet<_> = frames.iter().cloned().collect();
        assert_eq!(unique.len(), frames.len(), "duplicate join in {sequence:?}");
        assert_eq!(frames, vec!["a", "c"], "sequence {sequence:?}");
    }
}

#[test]
fn rejoin_after_leave_sends_join_again() {
    let mut tracker = SubscriptionTracker::new();
    let id = ChannelId::new("a");
    tracker.join(&id, true);
    tracker.leave(&id, true);
    assert!(tracker.join(&id, true).is_some());
    assert_eq!(tracker.wanted_channels(), vec![id]);
}
