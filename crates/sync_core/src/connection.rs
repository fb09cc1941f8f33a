use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    time::Duration,
};

use shared::protocol::ClientFrame;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    backoff::{Backoff, BackoffPolicy, RetryDecision},
    transport::OutboundFrame,
    types::ConnectionState,
};

pub type StateObserver = Box<dyn Fn(ConnectionState) + Send + Sync>;

/// Connection state machine and sole owner of the transport handle.
///
/// Every connection attempt gets a fresh generation. Results that arrive for
/// an older generation (late connects, closes from a replaced link, stale
/// retry timers) must be discarded by the caller via [`Self::is_current`].
/// At most one attempt task, one link and one retry timer exist at a time.
pub struct ConnectionManager {
    state: ConnectionState,
    backoff: Backoff,
    generation: u64,
    link: Option<mpsc::UnboundedSender<OutboundFrame>>,
    attempt_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
    next_retry: Option<Duration>,
    observers: Vec<StateObserver>,
}

impl ConnectionManager {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            backoff: Backoff::new(policy),
            generation: 0,
            link: None,
            attempt_task: None,
            reader_task: None,
            retry_task: None,
            next_retry: None,
            observers: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    pub fn attempt(&self) -> u32 {
        self.backoff.attempt()
    }

    /// Delay of the currently scheduled retry, if one is pending.
    pub fn next_retry(&self) -> Option<Duration> {
        self.next_retry
    }

    pub fn has_link(&self) -> bool {
        self.link.is_some()
    }

    pub fn on_state_change(&mut self, observer: StateObserver) {
        self.observers.push(observer);
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        debug!(from = self.state.label(), to = next.label(), "sync: connection state");
        self.state = next;
        for observer in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| observer(next))).is_err() {
                warn!("sync: state observer panicked");
            }
        }
    }

    /// Starts a new attempt and returns its generation, or `None` when one
    /// is already running or the link is up. `force` supersedes an in-flight
    /// attempt instead of deferring to it.
    pub fn begin_attempt(&mut self, force: bool) -> Option<u64> {
        match self.state {
            ConnectionState::Connected => return None,
            ConnectionState::Connecting if !force => return None,
            _ => {}
        }
        self.cancel_retry();
        if let Some(task) = self.attempt_task.take() {
            task.abort();
        }
        self.close_link();
        self.generation += 1;
        self.transition(ConnectionState::Connecting);
        Some(self.generation)
    }

    pub fn set_attempt_task(&mut self, task: JoinHandle<()>) {
        self.attempt_task = Some(task);
    }

    /// Called by the attempt task itself once it has an outcome.
    pub fn finish_attempt(&mut self) {
        self.attempt_task = None;
    }

    pub fn attach(&mut self, outbound: mpsc::UnboundedSender<OutboundFrame>) {
        self.close_link();
        self.link = Some(outbound);
    }

    pub fn set_reader_task(&mut self, task: JoinHandle<()>) {
        self.reader_task = Some(task);
    }

    pub fn mark_connected(&mut self) {
        self.backoff.reset();
        self.transition(ConnectionState::Connected);
    }

    pub fn reset_backoff(&mut self) {
        self.backoff.reset();
    }

    /// Writes a frame onto the current link. Returns false when there is no
    /// link or it is already gone.
    pub fn send(&self, frame: &ClientFrame) -> bool {
        let Some(link) = &self.link else {
            debug!(?frame, "sync: no link, frame not sent");
            return false;
        };
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(err) => {
                warn!("sync: failed to encode frame: {err}");
                return false;
            }
        };
        link.send(OutboundFrame::Text(text)).is_ok()
    }

    /// Counts a failed attempt or a dropped link and moves to `next`, or to
    /// `Error` once the policy gives up. The caller schedules the retry.
    pub fn record_failure(&mut self, next: ConnectionState) -> RetryDecision {
        self.close_link();
        self.reader_task = None;
        let decision = self.backoff.record_failure();
        match decision {
            RetryDecision::RetryAfter(_) => self.transition(next),
            RetryDecision::Exhausted { .. } => self.transition(ConnectionState::Error),
        }
        decision
    }

    pub fn set_retry_task(&mut self, task: JoinHandle<()>, delay: Duration) {
        self.cancel_retry();
        self.retry_task = Some(task);
        self.next_retry = Some(delay);
    }

    /// Called by the retry timer itself when it fires.
    pub fn take_retry_task(&mut self) {
        self.retry_task = None;
        self.next_retry = None;
    }

    fn cancel_retry(&mut self) {
        if let Some(task) = self.retry_task.take() {
            task.abort();
        }
        self.next_retry = None;
    }

    fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            let _ = link.send(OutboundFrame::Close);
        }
    }

    /// Tears everything down and invalidates outstanding results. With
    /// `abort_tasks` false the attempt/reader tasks are detached rather than
    /// aborted, for use from inside those tasks.
    pub fn shutdown(&mut self, next: ConnectionState, abort_tasks: bool) {
        self.generation += 1;
        self.cancel_retry();
        let attempt = self.attempt_task.take();
        let reader = self.reader_task.take();
        if abort_tasks {
            for task in attempt.into_iter().chain(reader) {
                task.abort();
            }
        }
        self.close_link();
        self.transition(next);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use shared::domain::ChannelId;

    use super::*;

    fn manager() -> ConnectionManager {
        ConnectionManager::new(BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(40),
            max_attempts: 2,
        })
    }

    fn recorded(manager: &mut ConnectionManager) -> Arc<Mutex<Vec<ConnectionState>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        manager.on_state_change(Box::new(move |state| {
            sink.lock().expect("observer lock").push(state);
        }));
        seen
    }

    #[test]
    fn begin_attempt_is_idempotent_while_connecting() {
        let mut manager = manager();
        let first = manager.begin_attempt(false).expect("first attempt");
        assert_eq!(manager.begin_attempt(false), None);
        assert_eq!(manager.state(), ConnectionState::Connecting);

        let forced = manager.begin_attempt(true).expect("forced attempt");
        assert!(forced > first);
        assert!(!manager.is_current(first));
    }

    #[test]
    fn connected_refuses_even_forced_attempts() {
        let mut manager = manager();
        manager.begin_attempt(false);
        manager.mark_connected();
        assert_eq!(manager.begin_attempt(true), None);
    }

    #[test]
    fn failures_walk_into_error_when_exhausted() {
        let mut manager = manager();
        let seen = recorded(&mut manager);

        manager.begin_attempt(false);
        assert_eq!(
            manager.record_failure(ConnectionState::Error),
            RetryDecision::RetryAfter(Duration::from_millis(10))
        );
        manager.begin_attempt(false);
        assert_eq!(
            manager.record_failure(ConnectionState::Error),
            RetryDecision::RetryAfter(Duration::from_millis(20))
        );
        manager.begin_attempt(false);
        assert_eq!(
            manager.record_failure(ConnectionState::Error),
            RetryDecision::Exhausted { attempts: 3 }
        );

        let seen = seen.lock().expect("observer lock").clone();
        assert_eq!(
            seen,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Error,
                ConnectionState::Connecting,
                ConnectionState::Error,
                ConnectionState::Connecting,
                ConnectionState::Error,
            ]
        );
    }

    #[test]
    fn send_goes_through_the_link_and_shutdown_closes_it() {
        let mut manager = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.begin_attempt(false);
        manager.attach(tx);

        assert!(manager.send(&ClientFrame::JoinChannel {
            id: ChannelId::new("a")
        }));
        assert!(matches!(rx.try_recv(), Ok(OutboundFrame::Text(_))));

        manager.shutdown(ConnectionState::Disconnected, true);
        assert_eq!(rx.try_recv(), Ok(OutboundFrame::Close));
        assert!(rx.try_recv().is_err());
        assert!(!manager.send(&ClientFrame::JoinChannel {
            id: ChannelId::new("a")
        }));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn panicking_observer_does_not_poison_transitions() {
        let mut manager = manager();
        manager.on_state_change(Box::new(|_| panic!("observer bug")));
        let seen = recorded(&mut manager);
        manager.begin_attempt(false);
        assert_eq!(
            seen.lock().expect("observer lock").as_slice(),
            &[ConnectionState::Connecting]
        );
    }
}
