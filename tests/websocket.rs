//! WebSocket tunnelling through the proxy.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

mod common;

#[tokio::test]
async fn relays_messages_both_ways() {
    let (backend, seen) = common::start_ws_echo_backend().await;
    let proxy = common::start_proxy(backend, |_| {}).await;

    let (mut ws, response) = tokio_tungstenite::connect_async(format!("ws://{}/chat?room=1", proxy.addr))
        .await
        .expect("upgrade through proxy failed");
    assert_eq!(response.status(), 101);

    ws.send(Message::text("hello")).await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no echo")
        .unwrap()
        .unwrap();
    assert_eq!(echoed.to_text().unwrap(), "hello");

    ws.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no echo")
        .unwrap()
        .unwrap();
    assert_eq!(echoed.into_data().as_ref(), &[1u8, 2, 3]);

    let handshakes = seen.lock().unwrap().clone();
    assert_eq!(handshakes.len(), 1);
    let head = &handshakes[0];
    assert!(head.starts_with("get /chat?room=1\n"), "{head}");
    assert!(head.contains("x-forwarded-for: 127.0.0.1\n"), "{head}");
    assert!(head.contains(&format!("host: {}\n", proxy.addr)), "{head}");
    assert!(!head.contains("sec-websocket-extensions"), "{head}");

    ws.close(None).await.unwrap();
    proxy.shutdown.trigger();
}

#[tokio::test]
async fn unreachable_backend_closes_after_upgrade() {
    let backend = common::closed_port().await;
    let proxy = common::start_proxy(backend, |_| {}).await;

    let (mut ws, response) = tokio_tungstenite::connect_async(format!("ws://{}/chat", proxy.addr))
        .await
        .expect("client handshake is answered before the backend is dialled");
    assert_eq!(response.status(), 101);

    let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("tunnel was not torn down");
    assert!(!matches!(next, Some(Ok(Message::Text(_)) | Ok(Message::Binary(_)))));

    proxy.shutdown.trigger();
}

#[tokio::test]
async fn unsupported_version_is_rejected() {
    let backend = common::closed_port().await;
    let proxy = common::start_proxy(backend, |_| {}).await;

    let request = "GET /chat HTTP/1.1\r\n\
                   Host: example.com\r\n\
                   Connection: Upgrade, close\r\n\
                   Upgrade: websocket\r\n\
                   Sec-WebSocket-Version: 8\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
    let response = common::raw_exchange(proxy.addr, request.as_bytes()).await;
    assert!(response.starts_with("http/1.1 400"), "{response}");
    assert!(response.contains("sec-websocket-version: 13\r\n"), "{response}");

    proxy.shutdown.trigger();
}

#[tokio::test]
async fn tunnels_to_wss_backend() {
    let dir = tempfile::tempdir().unwrap();
    let (acceptor, ca_file) = common::backend_tls(dir.path());
    let (backend, seen) = common::start_wss_echo_backend(acceptor).await;
    let proxy = common::start_proxy(backend, |config| {
        config.backend.url = format!("https://localhost:{}", backend.port());
        config.backend.ca_file = Some(ca_file);
    })
    .await;

    let (mut ws, response) = tokio_tungstenite::connect_async(format!("ws://{}/feed", proxy.addr))
        .await
        .expect("upgrade through proxy failed");
    assert_eq!(response.status(), 101);

    ws.send(Message::text("over tls")).await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no echo")
        .unwrap()
        .unwrap();
    assert_eq!(echoed.to_text().unwrap(), "over tls");

    let handshakes = seen.lock().unwrap().clone();
    assert_eq!(handshakes.len(), 1);
    assert!(handshakes[0].starts_with("get /feed\n"), "{}", handshakes[0]);

    ws.close(None).await.unwrap();
    proxy.shutdown.trigger();
}
