use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::Utc;
use reqwest::Method;
use serde::Deserialize;
use shared::{
    domain::{ChannelId, MessageId, UserId},
    error::ApiError,
    protocol::{ClientFrame, MessagePayload, SendMessageRequest, SendMessageResponse, ServerEvent},
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, Mutex},
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    backoff::RetryDecision,
    config::SyncSettings,
    connection::ConnectionManager,
    dispatcher::{DispatchTargets, EventDispatcher, EventKind},
    error::{SyncError, TransportError},
    http::{HttpResponse, ReqwestClient, RequestClient},
    identity::{Credentials, IdentityProvider},
    presence::PresenceAggregator,
    reconciler::{Expiry, Reconciler, RemoteOutcome},
    subscriptions::SubscriptionTracker,
    transport::{websocket_url, ConnectRequest, Connector, TransportEvent, TransportLink, WsConnector},
    types::{ConnectionState, Message, SyncEvent},
};

struct SessionState {
    connection: ConnectionManager,
    subscriptions: SubscriptionTracker,
    reconciler: Reconciler,
    presence: PresenceAggregator,
    dispatcher: EventDispatcher,
}

/// Result of an optimistic write. The placeholder is already visible; await
/// [`SubmitHandle::outcome`] to learn whether the server accepted it.
#[derive(Debug)]
pub struct SubmitHandle {
    pub temp_id: String,
    pub message: Message,
    outcome: oneshot::Receiver<Result<(), SyncError>>,
}

impl SubmitHandle {
    pub async fn outcome(self) -> Result<(), SyncError> {
        self.outcome
            .await
            .unwrap_or_else(|_| Err(SyncError::write(None, "write task dropped")))
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum HistoryPage {
    Bare(Vec<MessagePayload>),
    Wrapped { messages: Vec<MessagePayload> },
}

/// One authenticated login's worth of realtime state. Build it after login,
/// call [`SyncSession::disconnect`] on logout and drop it.
pub struct SyncSession {
    settings: SyncSettings,
    identity: Arc<dyn IdentityProvider>,
    connector: Arc<dyn Connector>,
    http: Arc<dyn RequestClient>,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncSession {
    pub fn new(
        settings: SyncSettings,
        identity: Arc<dyn IdentityProvider>,
        connector: Arc<dyn Connector>,
        http: Arc<dyn RequestClient>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let mut connection = ConnectionManager::new(settings.backoff_policy());
        let state_events = events.clone();
        connection.on_state_change(Box::new(move |state| {
            let _ = state_events.send(SyncEvent::StateChanged(state));
        }));

        Arc::new(Self {
            inner: Mutex::new(SessionState {
                connection,
                subscriptions: SubscriptionTracker::new(),
                reconciler: Reconciler::new(settings.echo_window),
                presence: PresenceAggregator::new(),
                dispatcher: EventDispatcher::new(),
            }),
            settings,
            identity,
            connector,
            http,
            events,
        })
    }

    /// WebSocket transport and reqwest HTTP client against `settings.server_url`.
    pub fn with_defaults(settings: SyncSettings, identity: Arc<dyn IdentityProvider>) -> Arc<Self> {
        let http = Arc::new(ReqwestClient::new(
            settings.server_url.clone(),
            Arc::clone(&identity),
        ));
        let connector = Arc::new(WsConnector::new(settings.keepalive_interval));
        Self::new(settings, identity, connector, http)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    pub async fn on_state_change(
        &self,
        observer: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) {
        self.inner
            .lock()
            .await
            .connection
            .on_state_change(Box::new(observer));
    }

    pub async fn on_server_event(
        &self,
        kind: EventKind,
        subscriber: impl Fn(&ServerEvent) + Send + Sync + 'static,
    ) {
        self.inner
            .lock()
            .await
            .dispatcher
            .subscribe(kind, Box::new(subscriber));
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.connection.state()
    }

    /// Consecutive failed attempts since the last successful connect.
    pub async fn reconnect_attempt(&self) -> u32 {
        self.inner.lock().await.connection.attempt()
    }

    /// Delay of the scheduled automatic retry. `None` while connected, while
    /// an attempt is in flight, or once retries stopped for good.
    pub async fn next_retry(&self) -> Option<Duration> {
        self.inner.lock().await.connection.next_retry()
    }

    // ---- connection ----

    /// No-op while connecting or connected. Outcomes are reported through
    /// state changes and `SyncEvent::Error`, never returned.
    pub async fn connect(self: &Arc<Self>) {
        let mut guard = self.inner.lock().await;
        self.start_attempt(&mut guard, false);
    }

    pub async fn disconnect(&self) {
        let mut guard = self.inner.lock().await;
        guard
            .connection
            .shutdown(ConnectionState::Disconnected, true);
        info!("sync: disconnected by request");
    }

    /// Manual retry: drops any pending timer or in-flight attempt, resets the
    /// attempt counter and connects immediately.
    pub async fn reconnect_now(self: &Arc<Self>) {
        let mut guard = self.inner.lock().await;
        guard.connection.reset_backoff();
        if guard.connection.state() == ConnectionState::Connected {
            return;
        }
        info!("sync: manual reconnect");
        self.start_attempt(&mut guard, true);
    }

    fn start_attempt(self: &Arc<Self>, state: &mut SessionState, force: bool) {
        let Some(generation) = state.connection.begin_attempt(force) else {
            debug!(
                state = state.connection.state().label(),
                "sync: connect ignored, attempt already active"
            );
            return;
        };
        let session = Arc::clone(self);
        let task = tokio::spawn(async move { session.run_attempt(generation).await });
        state.connection.set_attempt_task(task);
    }

    async fn run_attempt(self: Arc<Self>, generation: u64) {
        let Some(credentials) = self.identity.credentials() else {
            self.on_handshake_failure(generation, SyncError::NotAuthenticated)
                .await;
            return;
        };

        let url = match websocket_url(&self.settings.server_url) {
            Ok(url) => url,
            Err(err) => {
                self.on_connect_error(generation, err.to_string()).await;
                return;
            }
        };

        debug!(generation, %url, "ws: connecting");
        let limit = self.settings.connect_timeout;
        let request = ConnectRequest {
            url,
            bearer: credentials.token.clone(),
        };
        let Ok(result) = timeout(limit, self.connector.connect(request)).await else {
            let reason = format!("connect timed out after {}ms", limit.as_millis());
            self.on_connect_error(generation, reason).await;
            return;
        };

        match result {
            Ok(link) => self.on_link_open(generation, credentials, link).await,
            Err(TransportError::Unauthorized(reason)) => {
                self.on_handshake_failure(generation, SyncError::HandshakeFailure(reason))
                    .await
            }
            Err(err) => self.on_connect_error(generation, err.to_string()).await,
        }
    }

    async fn on_link_open(
        self: &Arc<Self>,
        generation: u64,
        credentials: Credentials,
        link: TransportLink,
    ) {
        let mut guard = self.inner.lock().await;
        if !guard.connection.is_current(generation) {
            debug!(generation, "ws: discarding link from superseded attempt");
            return;
        }

        let TransportLink { outbound, inbound } = link;
        let state = &mut *guard;
        state.connection.finish_attempt();
        state.connection.attach(outbound);
        state.connection.send(&ClientFrame::Authenticate {
            user_id: credentials.user_id.clone(),
            token: credentials.token,
        });
        state.connection.mark_connected();

        let frames = state.subscriptions.resubscribe_all();
        for frame in &frames {
            state.connection.send(frame);
        }
        info!(
            generation,
            user_id = %credentials.user_id,
            channels = frames.len(),
            "sync: connected"
        );

        let reader = tokio::spawn(Arc::clone(self).read_loop(generation, inbound));
        state.connection.set_reader_task(reader);
    }

    async fn read_loop(
        self: Arc<Self>,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while let Some(event) = inbound.recv().await {
            match event {
                TransportEvent::Frame(text) => {
                    if !self.handle_frame(generation, &text).await {
                        debug!(generation, "ws: reader stopped, link superseded");
                        return;
                    }
                }
                TransportEvent::Closed { reason } => {
                    self.on_transport_closed(generation, reason).await;
                    return;
                }
            }
        }
        self.on_transport_closed(generation, "transport dropped".to_string())
            .await;
    }

    /// Returns false once the link this frame came from is no longer current.
    async fn handle_frame(&self, generation: u64, text: &str) -> bool {
        let mut guard = self.inner.lock().await;
        if !guard.connection.is_current(generation) {
            return false;
        }
        if let Some(event) = EventDispatcher::decode(text) {
            self.dispatch(&mut guard, event);
        }
        guard.connection.is_current(generation)
    }

    /// Inbound entry point for already-decoded server events.
    pub async fn handle_server_event(&self, event: ServerEvent) {
        let mut guard = self.inner.lock().await;
        self.dispatch(&mut guard, event);
    }

    fn dispatch(&self, state: &mut SessionState, event: ServerEvent) {
        let outcome = state.dispatcher.dispatch(
            event,
            DispatchTargets {
                subscriptions: &state.subscriptions,
                reconciler: &mut state.reconciler,
                presence: &mut state.presence,
            },
        );
        for event in outcome.events {
            self.emit(event);
        }
        if let Some(reason) = outcome.handshake_rejected {
            self.reject_handshake(state, SyncError::HandshakeFailure(reason));
        }
    }

    async fn on_transport_closed(self: &Arc<Self>, generation: u64, reason: String) {
        let mut guard = self.inner.lock().await;
        if !guard.connection.is_current(generation) {
            return;
        }
        let failure = SyncError::TransportFailure(reason);
        warn!(generation, "ws: connection lost: {failure}");
        self.schedule_retry(&mut guard, ConnectionState::Disconnected);
    }

    async fn on_connect_error(self: &Arc<Self>, generation: u64, reason: String) {
        let mut guard = self.inner.lock().await;
        if !guard.connection.is_current(generation) {
            return;
        }
        guard.connection.finish_attempt();
        let failure = SyncError::TransportFailure(reason);
        warn!(generation, "ws: connect failed: {failure}");
        self.schedule_retry(&mut guard, ConnectionState::Error);
    }

    async fn on_handshake_failure(&self, generation: u64, error: SyncError) {
        let mut guard = self.inner.lock().await;
        if !guard.connection.is_current(generation) {
            return;
        }
        guard.connection.finish_attempt();
        self.reject_handshake(&mut guard, error);
    }

    fn reject_handshake(&self, state: &mut SessionState, error: SyncError) {
        warn!("sync: {error}; automatic reconnect disabled until manual retry");
        state.connection.shutdown(ConnectionState::Error, false);
        self.emit(SyncEvent::Error(error));
    }

    fn schedule_retry(self: &Arc<Self>, state: &mut SessionState, next: ConnectionState) {
        match state.connection.record_failure(next) {
            RetryDecision::RetryAfter(delay) => {
                let generation = state.connection.generation();
                debug!(
                    generation,
                    attempt = state.connection.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "sync: reconnect scheduled"
                );
                let session = Arc::clone(self);
                let timer = tokio::spawn(async move {
                    sleep(delay).await;
                    session.retry(generation).await;
                });
                state.connection.set_retry_task(timer, delay);
            }
            RetryDecision::Exhausted { attempts } => {
                warn!(attempts, "sync: reconnect attempts exhausted");
                self.emit(SyncEvent::Error(SyncError::ReconnectExhausted { attempts }));
            }
        }
    }

    async fn retry(self: &Arc<Self>, generation: u64) {
        let mut guard = self.inner.lock().await;
        if !guard.connection.is_current(generation) {
            return;
        }
        guard.connection.take_retry_task();
        self.start_attempt(&mut guard, false);
    }

    // ---- channels ----

    pub async fn join(&self, channel_id: ChannelId) {
        let mut guard = self.inner.lock().await;
        let connected = guard.connection.state() == ConnectionState::Connected;
        if let Some(frame) = guard.subscriptions.join(&channel_id, connected) {
            guard.connection.send(&frame);
        }
    }

    pub async fn leave(&self, channel_id: ChannelId) {
        let mut guard = self.inner.lock().await;
        let connected = guard.connection.state() == ConnectionState::Connected;
        if let Some(frame) = guard.subscriptions.leave(&channel_id, connected) {
            guard.connection.send(&frame);
        }
    }

    pub async fn wanted_channels(&self) -> Vec<ChannelId> {
        self.inner.lock().await.subscriptions.wanted_channels()
    }

    pub async fn set_active_channel(&self, channel_id: Option<ChannelId>) {
        let mut guard = self.inner.lock().await;
        if let Some(channel_id) = guard.presence.set_active_channel(channel_id) {
            self.emit(SyncEvent::UnreadChanged {
                channel_id,
                count: 0,
            });
        }
    }

    pub async fn mark_read(&self, channel_id: &ChannelId) {
        let mut guard = self.inner.lock().await;
        if guard.presence.mark_read(channel_id) {
            self.emit(SyncEvent::UnreadChanged {
                channel_id: channel_id.clone(),
                count: 0,
            });
        }
    }

    pub async fn unread_count(&self, channel_id: &ChannelId) -> u32 {
        self.inner.lock().await.presence.unread_count(channel_id)
    }

    pub async fn is_online(&self, user_id: &UserId) -> bool {
        self.inner.lock().await.presence.is_online(user_id)
    }

    pub async fn online_users(&self) -> HashSet<UserId> {
        self.inner.lock().await.presence.online_users()
    }

    pub async fn messages(&self, channel_id: &ChannelId) -> Vec<Message> {
        self.inner.lock().await.reconciler.messages(channel_id)
    }

    // ---- writes ----

    /// Shows a `Local` placeholder immediately and posts the write in the
    /// background. Failed writes are rolled back, never retried here.
    pub async fn submit(
        self: &Arc<Self>,
        channel_id: ChannelId,
        body: impl Into<String>,
    ) -> Result<SubmitHandle, SyncError> {
        let credentials = self
            .identity
            .credentials()
            .ok_or(SyncError::NotAuthenticated)?;
        let body = body.into();

        let local = {
            let mut guard = self.inner.lock().await;
            let local = guard.reconciler.apply_local(
                &channel_id,
                &credentials.user_id,
                &credentials.display_name,
                &body,
                Utc::now(),
            );
            self.emit(SyncEvent::Message(local.clone()));
            local
        };

        let temp_id = local.id.0.clone();
        let (tx, rx) = oneshot::channel();
        let session = Arc::clone(self);
        let write_temp_id = temp_id.clone();
        tokio::spawn(async move {
            let outcome = session
                .send_write(channel_id.clone(), write_temp_id.clone(), body)
                .await;
            let delivered = outcome.is_ok();
            let _ = tx.send(outcome);
            if delivered {
                sleep(session.settings.echo_window).await;
                session.expire_write(&channel_id, &write_temp_id).await;
            }
        });

        Ok(SubmitHandle {
            temp_id,
            message: local,
            outcome: rx,
        })
    }

    async fn send_write(
        &self,
        channel_id: ChannelId,
        temp_id: String,
        body: String,
    ) -> Result<(), SyncError> {
        let path = format!("/channels/{channel_id}/messages");
        let request = SendMessageRequest {
            body,
            temp_id: temp_id.clone(),
        };
        let result = match serde_json::to_value(&request) {
            Ok(payload) => self.send_request(Method::POST, &path, Some(payload)).await,
            Err(err) => Err(SyncError::write(None, err.to_string())),
        };

        let mut guard = self.inner.lock().await;
        match result {
            Ok(data) => {
                let server_id = serde_json::from_value::<SendMessageResponse>(data)
                    .ok()
                    .and_then(|response| response.id);
                if let Some(placeholder) = guard.reconciler.acknowledge(&temp_id, server_id) {
                    self.emit(SyncEvent::MessageDeleted {
                        channel_id,
                        message_id: placeholder,
                    });
                }
                Ok(())
            }
            Err(error) => {
                warn!(%channel_id, %temp_id, "reconcile: write rejected, rolling back: {error}");
                if let Some(removed) = guard.reconciler.fail(&temp_id) {
                    self.emit(SyncEvent::MessageDeleted {
                        channel_id: channel_id.clone(),
                        message_id: removed.id,
                    });
                }
                self.emit(SyncEvent::WriteFailed {
                    channel_id,
                    entity_id: temp_id,
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Acknowledged writes whose echo never arrived (channel left, or an
    /// ack without id and an echo outside the window) are settled here.
    async fn expire_write(&self, channel_id: &ChannelId, temp_id: &str) {
        let mut guard = self.inner.lock().await;
        match guard.reconciler.expire_acknowledged(temp_id) {
            Some(Expiry::Promoted {
                previous_id,
                message,
            }) => {
                debug!(%channel_id, %temp_id, id = %message.id, "reconcile: no echo, keeping acknowledged write");
                self.emit(SyncEvent::MessageReplaced {
                    channel_id: channel_id.clone(),
                    previous_id,
                    message,
                });
            }
            Some(Expiry::Dropped(message)) => {
                warn!(%channel_id, %temp_id, "reconcile: no echo and no server id, dropping placeholder");
                self.emit(SyncEvent::MessageDeleted {
                    channel_id: channel_id.clone(),
                    message_id: message.id,
                });
            }
            None => {}
        }
    }

    /// Removes the message right away; a rejected delete puts it back.
    pub async fn delete_message(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), SyncError> {
        {
            let mut guard = self.inner.lock().await;
            if guard
                .reconciler
                .begin_delete(channel_id, message_id)
                .is_none()
            {
                return Err(SyncError::write(
                    None,
                    format!("message {message_id} is not deletable"),
                ));
            }
            self.emit(SyncEvent::MessageDeleted {
                channel_id: channel_id.clone(),
                message_id: message_id.clone(),
            });
        }

        let path = format!("/channels/{channel_id}/messages/{message_id}");
        let result = self.send_request(Method::DELETE, &path, None).await;

        let mut guard = self.inner.lock().await;
        match result {
            Ok(_) => {
                guard.reconciler.confirm_delete(message_id);
                Ok(())
            }
            Err(error) => {
                warn!(%channel_id, %message_id, "reconcile: delete rejected, restoring: {error}");
                if let Some(restored) = guard.reconciler.rollback(message_id) {
                    self.emit(SyncEvent::Message(restored));
                }
                self.emit(SyncEvent::WriteFailed {
                    channel_id: channel_id.clone(),
                    entity_id: message_id.0.clone(),
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Re-issues a delete for a message restored after an earlier rejection.
    pub async fn retry_delete(
        &self,
        channel_id: &ChannelId,
        message_id: &MessageId,
    ) -> Result<(), SyncError> {
        debug!(%channel_id, %message_id, "reconcile: retrying delete");
        self.delete_message(channel_id, message_id).await
    }

    /// Fetches recent history and merges it with what is already known.
    /// Returns how many entries changed the list.
    pub async fn fetch_history(
        &self,
        channel_id: &ChannelId,
        limit: u32,
    ) -> Result<usize, SyncError> {
        let path = format!("/channels/{channel_id}/messages?limit={limit}");
        let data = self.send_request(Method::GET, &path, None).await?;
        let page = match serde_json::from_value::<HistoryPage>(data) {
            Ok(HistoryPage::Bare(messages)) | Ok(HistoryPage::Wrapped { messages }) => messages,
            Err(err) => {
                return Err(SyncError::write(
                    None,
                    format!("invalid history response: {err}"),
                ))
            }
        };

        let mut guard = self.inner.lock().await;
        let outcomes = guard.reconciler.merge_history(page);
        let changed = outcomes.len();
        for outcome in outcomes {
            match outcome {
                RemoteOutcome::Inserted(message) => self.emit(SyncEvent::Message(message)),
                RemoteOutcome::Replaced {
                    previous_id,
                    message,
                } => self.emit(SyncEvent::MessageReplaced {
                    channel_id: message.channel_id.clone(),
                    previous_id,
                    message,
                }),
                RemoteOutcome::Duplicate => {}
            }
        }
        Ok(changed)
    }

    async fn send_request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, SyncError> {
        let limit = self.settings.write_timeout;
        let response = timeout(limit, self.http.request(method, path, body))
            .await
            .map_err(|_| {
                SyncError::write(None, format!("request timed out after {}ms", limit.as_millis()))
            })??;
        check_response(response)
    }
}

fn check_response(response: HttpResponse) -> Result<serde_json::Value, SyncError> {
    if response.is_success() {
        return Ok(response.data);
    }
    let api = serde_json::from_value::<ApiError>(response.data.clone()).unwrap_or_else(|_| {
        let message = match &response.data {
            serde_json::Value::String(text) => text.clone(),
            serde_json::Value::Null => format!("status {}", response.status),
            other => other.to_string(),
        };
        ApiError::from_status(response.status, message)
    });
    Err(SyncError::from_api(response.status, api))
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
