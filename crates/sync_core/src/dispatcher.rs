use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
};

use shared::protocol::ServerEvent;
use tracing::{debug, warn};

use crate::{
    presence::PresenceAggregator,
    reconciler::{Reconciler, RemoteOutcome},
    subscriptions::SubscriptionTracker,
    types::SyncEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    MessageNew,
    MessageDelete,
    PresenceUpdate,
    AuthError,
}

impl EventKind {
    pub fn of(event: &ServerEvent) -> Option<Self> {
        match event {
            ServerEvent::MessageNew(_) => Some(Self::MessageNew),
            ServerEvent::MessageDelete(_) => Some(Self::MessageDelete),
            ServerEvent::PresenceUpdate(_) => Some(Self::PresenceUpdate),
            ServerEvent::AuthError(_) => Some(Self::AuthError),
            ServerEvent::Unknown(_) => None,
        }
    }
}

pub type EventSubscriber = Box<dyn Fn(&ServerEvent) + Send + Sync>;

pub struct DispatchTargets<'a> {
    pub subscriptions: &'a SubscriptionTracker,
    pub reconciler: &'a mut Reconciler,
    pub presence: &'a mut PresenceAggregator,
}

#[derive(Debug, Default, PartialEq)]
pub struct DispatchOutcome {
    pub events: Vec<SyncEvent>,
    /// Set when the server refused this client's `authenticate` frame.
    pub handshake_rejected: Option<String>,
}

/// Single inbound entry point: routes each server event to the consumers,
/// then to UI subscribers registered for its kind.
#[derive(Default)]
pub struct EventDispatcher {
    subscribers: HashMap<EventKind, Vec<EventSubscriber>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, kind: EventKind, subscriber: EventSubscriber) {
        self.subscribers.entry(kind).or_default().push(subscriber);
    }

    /// Malformed frames are logged and yield `None`.
    pub fn decode(text: &str) -> Option<ServerEvent> {
        match ServerEvent::decode(text) {
            Ok(event) => Some(event),
            Err(err) => {
                warn!("sync: dropping undecodable frame: {err}");
                None
            }
        }
    }

    pub fn dispatch(&self, event: ServerEvent, targets: DispatchTargets<'_>) -> DispatchOutcome {
        let mut outcome = DispatchOutcome::default();
        let Some(kind) = EventKind::of(&event) else {
            warn!(event_type = event.event_type(), "sync: dropping unknown event type");
            return outcome;
        };

        match &event {
            ServerEvent::MessageNew(payload) => {
                if targets.subscriptions.is_abandoned(&payload.channel_id) {
                    debug!(
                        channel_id = %payload.channel_id,
                        message_id = %payload.id,
                        "sync: ignoring message for a channel that was left"
                    );
                    return outcome;
                }
                let channel_id = payload.channel_id.clone();
                match targets.reconciler.apply_remote(payload.clone()) {
                    RemoteOutcome::Inserted(message) => {
                        outcome.events.push(SyncEvent::Message(message));
                        if let Some(count) = targets.presence.record_remote_message(&channel_id) {
                            outcome
                                .events
                                .push(SyncEvent::UnreadChanged { channel_id, count });
                        }
                    }
                    RemoteOutcome::Replaced {
                        previous_id,
                        message,
                    } => {
                        debug!(
                            temp_id = %previous_id,
                            message_id = %message.id,
                            "reconcile: echo resolved pending write"
                        );
                        outcome.events.push(SyncEvent::MessageReplaced {
                            channel_id,
                            previous_id,
                            message,
                        });
                    }
                    RemoteOutcome::Duplicate => {
                        debug!(message_id = %payload.id, "sync: duplicate delivery suppressed");
                    }
                }
            }
            ServerEvent::MessageDelete(payload) => {
                if let Some(removed) = targets
                    .reconciler
                    .remove_remote(&payload.channel_id, &payload.message_id)
                {
                    outcome.events.push(SyncEvent::MessageDeleted {
                        channel_id: removed.channel_id,
                        message_id: removed.id,
                    });
                }
            }
            ServerEvent::PresenceUpdate(payload) => {
                if let Some(online) = targets.presence.replace_online(payload.online.clone()) {
                    outcome.events.push(SyncEvent::PresenceChanged(online));
                }
            }
            ServerEvent::AuthError(payload) => {
                outcome.handshake_rejected = Some(payload.reason.clone());
            }
            ServerEvent::Unknown(_) => {}
        }

        for subscriber in self.subscribers.get(&kind).into_iter().flatten() {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&event))).is_err() {
                warn!(event_type = event.event_type(), "sync: event subscriber panicked");
            }
        }
        outcome
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
