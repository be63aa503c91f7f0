//! WebSocket transport against a local echo server.

use futures::{SinkExt, StreamExt};
use huddle::{SignalingMessage, SignalingTransport, WsSignaling};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use uuid::Uuid;

/// Accepts one connection and echoes text frames back.
async fn spawn_echo_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                if ws.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    });

    format!("ws://{}", addr)
}

#[tokio::test]
async fn test_sent_messages_round_trip_the_socket() {
    let url = spawn_echo_server().await;
    let (transport, mut inbound) = WsSignaling::connect(&url).await.unwrap();
    assert!(transport.is_connected());

    let msg = SignalingMessage::offer(Uuid::new_v4(), "p1".to_string(), "v=0".to_string());
    transport.send(msg.clone()).await.unwrap();

    // The echo server reflects the frame; the reader task decodes it
    let echoed = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
        .await
        .expect("timed out waiting for echo")
        .expect("inbound channel closed");
    assert_eq!(echoed, msg);
}

#[tokio::test]
async fn test_connect_to_invalid_url_fails() {
    let err = WsSignaling::connect("not a url").await.unwrap_err();
    assert!(matches!(
        err,
        huddle::SignalingError::ConnectionFailed(_)
    ));
}
