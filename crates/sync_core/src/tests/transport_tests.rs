use super::*;

use std::time::Duration;

use axum::{
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::{
    net::TcpListener,
    time::{sleep, timeout},
};

async fn echo_socket(mut socket: WebSocket) {
    while let Some(Ok(msg)) = socket.recv().await {
        match msg {
            WsMessage::Text(text) if text == "bye" => {
                let _ = socket.send(WsMessage::Close(None)).await;
                break;
            }
            WsMessage::Text(text) => {
                if socket
                    .send(WsMessage::Text(format!("echo:{text}")))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
}

async fn handle_ws(headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some("Bearer good-token");
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(echo_socket)
}

/// Accepts the upgrade and then never reads, so pings go unanswered.
async fn handle_silent(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|socket| async move {
        sleep(Duration::from_secs(30)).await;
        drop(socket);
    })
}

async fn spawn_ws_server() -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new()
        .route("/ws", get(handle_ws))
        .route("/silent", get(handle_silent));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn next_event(link: &mut TransportLink) -> TransportEvent {
    timeout(Duration::from_secs(5), link.inbound.recv())
        .await
        .expect("timely event")
        .expect("open channel")
}

#[test]
fn websocket_url_maps_scheme_and_path() {
    assert_eq!(
        websocket_url("http://127.0.0.1:8443").expect("url"),
        "ws://127.0.0.1:8443/ws"
    );
    assert_eq!(
        websocket_url("https://sync.example/api/").expect("url"),
        "wss://sync.example/api/ws"
    );
    assert!(matches!(
        websocket_url("ftp://sync.example"),
        Err(TransportError::InvalidUrl(_))
    ));
}

#[tokio::test]
async fn frames_flow_both_ways_and_close_is_reported() {
    let server_url = spawn_ws_server().await;
    let mut link = WsConnector::default()
        .connect(ConnectRequest {
            url: websocket_url(&server_url).expect("url"),
            bearer: "good-token".to_string(),
        })
        .await
        .expect("connect");

    link.outbound
        .send(OutboundFrame::Text("hello".to_string()))
        .expect("send");
    assert_eq!(
        next_event(&mut link).await,
        TransportEvent::Frame("echo:hello".to_string())
    );

    link.outbound
        .send(OutboundFrame::Text("bye".to_string()))
        .expect("send");
    assert!(matches!(
        next_event(&mut link).await,
        TransportEvent::Closed { .. }
    ));
}

#[tokio::test]
async fn refused_upgrade_is_unauthorized() {
    let server_url = spawn_ws_server().await;
    let err = WsConnector::default()
        .connect(ConnectRequest {
            url: websocket_url(&server_url).expect("url"),
            bearer: "expired".to_string(),
        })
        .await
        .expect_err("must be refused");
    assert!(matches!(err, TransportError::Unauthorized(_)), "{err}");
}

#[tokio::test]
async fn unreachable_server_is_a_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let err = WsConnector::default()
        .connect(ConnectRequest {
            url: format!("ws://{addr}/ws"),
            bearer: "good-token".to_string(),
        })
        .await
        .expect_err("must fail");
    assert!(matches!(err, TransportError::Connect(_)), "{err}");
}

#[tokio::test]
async fn unanswered_pings_close_the_link() {
    let server_url = spawn_ws_server().await;
    let mut link = WsConnector::new(Duration::from_millis(100))
        .connect(ConnectRequest {
            url: format!("{}/silent", server_url.replacen("http", "ws", 1)),
            bearer: "good-token".to_string(),
        })
        .await
        .expect("connect");

    match next_event(&mut link).await {
        TransportEvent::Closed { reason } => assert_eq!(reason, "ping timeout"),
        other => panic!("expected the link to close, got {other:?}"),
    }
}

#[tokio::test]
async fn answered_pings_keep_the_link_open() {
    let server_url = spawn_ws_server().await;
    let mut link = WsConnector::new(Duration::from_millis(100))
        .connect(ConnectRequest {
            url: websocket_url(&server_url).expect("url"),
            bearer: "good-token".to_string(),
        })
        .await
        .expect("connect");

    sleep(Duration::from_millis(600)).await;
    link.outbound
        .send(OutboundFrame::Text("still here".to_string()))
        .expect("send");
    assert_eq!(
        next_event(&mut link).await,
        TransportEvent::Frame("echo:still here".to_string())
    );
}
