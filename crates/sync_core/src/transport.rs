use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, client::IntoClientRequest, http::HeaderValue, Message},
};
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Frame(String),
    Closed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// One open connection. Dropping `outbound` closes it; `inbound` yields
/// frames until a single terminal `Closed`.
#[derive(Debug)]
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub inbound: mpsc::UnboundedReceiver<TransportEvent>,
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: String,
    pub bearer: String,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: ConnectRequest) -> Result<TransportLink, TransportError>;
}

/// Maps the HTTP base URL to the realtime endpoint (`http` → `ws`, `/ws`).
pub fn websocket_url(server_url: &str) -> Result<String, TransportError> {
    let mut url =
        Url::parse(server_url).map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme '{other}'"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::InvalidUrl(server_url.to_string()))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url.to_string())
}

/// tokio-tungstenite client. Pings after `keepalive` of silence and gives the
/// link up after twice that, so a half-open socket surfaces as `Closed`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    keepalive: Duration,
}

impl WsConnector {
    pub fn new(keepalive: Duration) -> Self {
        Self {
            keepalive: keepalive.max(Duration::from_millis(10)),
        }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, request: ConnectRequest) -> Result<TransportLink, TransportError> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", request.bearer))
            .map_err(|err| TransportError::Connect(format!("invalid credential header: {err}")))?;
        ws_request.headers_mut().insert("authorization", bearer);

        let (ws_stream, _) = connect_async(ws_request).await.map_err(|err| match err {
            tungstenite::Error::Http(response)
                if matches!(response.status().as_u16(), 401 | 403) =>
            {
                TransportError::Unauthorized(format!("upgrade refused with {}", response.status()))
            }
            other => TransportError::Connect(other.to_string()),
        })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (ping_tx, mut ping_rx) = mpsc::unbounded_channel::<()>();
        let keepalive = self.keepalive;

        let writer: JoinHandle<()> = tokio::spawn(async move {
            loop {
                let result = tokio::select! {
                    frame = outbound_rx.recv() => match frame {
                        Some(OutboundFrame::Text(text)) => ws_writer.send(Message::Text(text)).await,
                        Some(OutboundFrame::Close) | None => break,
                    },
                    Some(()) = ping_rx.recv() => ws_writer.send(Message::Ping(Vec::new())).await,
                };
                if let Err(err) = result {
                    warn!("ws: send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
            debug!("ws: writer stopped");
        });

        tokio::spawn(async move {
            let mut last_activity = Instant::now();
            let mut next_ping = last_activity + keepalive;
            let reason = loop {
                tokio::select! {
                    incoming = ws_reader.next() => {
                        last_activity = Instant::now();
                        next_ping = last_activity + keepalive;
                        match incoming {
                            Some(Ok(Message::Text(text))) => {
                                if inbound_tx.send(TransportEvent::Frame(text)).is_err() {
                                    break "receiver dropped".to_string();
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                break frame
                                    .map(|f| f.reason.to_string())
                                    .filter(|r| !r.is_empty())
                                    .unwrap_or_else(|| "closed by server".to_string());
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => break format!("receive failed: {err}"),
                            None => break "stream ended".to_string(),
                        }
                    }
                    _ = sleep_until(next_ping) => {
                        if last_activity.elapsed() >= keepalive * 2 {
                            warn!(
                                silent_ms = last_activity.elapsed().as_millis() as u64,
                                "ws: no traffic since last ping"
                            );
                            break "ping timeout".to_string();
                        }
                        if ping_tx.send(()).is_err() {
                            break "writer stopped".to_string();
                        }
                        next_ping = Instant::now() + keepalive;
                    }
                }
            };
            writer.abort();
            let _ = inbound_tx.send(TransportEvent::Closed { reason });
        });

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
