//! WebSocket connector against an in-process server.

use std::time::Duration;

use chat_sync_channel::{
    ChannelError, ChannelEvent, ChannelManager, ClientEvent, ConnectionState, Connector,
    MessagePayload, ServerEvent, WsConnector,
};
use chat_sync_core::{MessageId, Session, config::ChannelConfig};
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpListener, sync::oneshot, time::timeout};
use tokio_tungstenite::tungstenite::{
    Message,
    handshake::server::{ErrorResponse, Request, Response},
    http::{self, StatusCode},
};

fn session() -> Session {
    Session::new("tok-123", "alice").unwrap()
}

fn payload(id: u64) -> MessagePayload {
    MessagePayload {
        id: MessageId(id),
        text: "hello".into(),
        timestamp: chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        author: "alice".into(),
    }
}

/// Accept one connection, report its Authorization header, echo every
/// `message` event back and acknowledge it.
async fn start_echo_server() -> (String, oneshot::Receiver<Option<String>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (auth_tx, auth_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut auth = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            auth = req
                .headers()
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();
        let _ = auth_tx.send(auth);

        // Garbage first: the client must skip it.
        ws.send(Message::Text(String::from("{\"event\":\"typing\"}").into()))
            .await
            .unwrap();

        while let Some(Ok(frame)) = ws.next().await {
            let Message::Text(text) = frame else { continue };
            let Ok(ClientEvent::Message(p)) = serde_json::from_str::<ClientEvent>(text.as_str())
            else {
                continue;
            };
            let id = p.id;
            let echo = serde_json::to_string(&ServerEvent::Message(p)).unwrap();
            let ack = serde_json::to_string(&ServerEvent::Ack { id }).unwrap();
            ws.send(Message::Text(echo.into())).await.unwrap();
            ws.send(Message::Text(ack.into())).await.unwrap();
        }
    });

    (format!("ws://{addr}/ws"), auth_rx)
}

#[tokio::test]
async fn test_link_sends_bearer_and_round_trips_events() {
    let (url, auth_rx) = start_echo_server().await;
    let connector = WsConnector::new(url);

    let mut link = connector.connect(&session()).await.unwrap();
    assert_eq!(auth_rx.await.unwrap().as_deref(), Some("Bearer tok-123"));

    link.sender().send(ClientEvent::Message(payload(7))).unwrap();

    let first = timeout(Duration::from_secs(5), link.recv()).await.unwrap();
    assert_eq!(first, Some(ServerEvent::Message(payload(7))));
    let second = timeout(Duration::from_secs(5), link.recv()).await.unwrap();
    assert_eq!(second, Some(ServerEvent::Ack { id: MessageId(7) }));

    link.close(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_rejected_upgrade_is_unauthorized() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let reject = |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
            Err(http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body(None)
                .unwrap())
        };
        let _ = tokio_tungstenite::accept_hdr_async(stream, reject).await;
    });

    let connector = WsConnector::new(format!("ws://{addr}/ws"));
    let err = connector.connect(&session()).await.err().unwrap();
    assert!(matches!(err, ChannelError::Unauthorized(_)), "got {err:?}");
}

#[tokio::test]
async fn test_refused_connection_is_transport_failure() {
    // Bind then drop to get a port nobody listens on.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let connector = WsConnector::new(format!("ws://127.0.0.1:{port}/ws"));
    let err = connector.connect(&session()).await.err().unwrap();
    assert!(matches!(err, ChannelError::Transport(_)), "got {err:?}");
}

#[tokio::test]
async fn test_manager_over_websocket() {
    let (url, _auth_rx) = start_echo_server().await;
    let manager = ChannelManager::new(
        std::sync::Arc::new(WsConnector::new(url)),
        ChannelConfig::default(),
    );
    let mut events = manager.take_events().unwrap();
    let mut state = manager.watch_state();

    manager.open(session()).await;
    timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == ConnectionState::Connected),
    )
    .await
    .unwrap()
    .unwrap();

    manager.send(ClientEvent::Message(payload(9))).unwrap();

    let ack = timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(ChannelEvent::Inbound(ServerEvent::Ack { id })) => return id,
                Some(_) => {}
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(ack, MessageId(9));

    manager.close().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}
