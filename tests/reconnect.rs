//! End-to-end reconnect check: a command submitted just before the
//! connection drops is resubmitted and answered exactly once after the
//! client reconnects, never with a network-error reply.

use bytes::Bytes;
use redpipe::{Client, ClientConfig, DisconnectStatus, Reply};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::test]
async fn ping_survives_one_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        let (mut first, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = first.read(&mut buf).await;
        drop(first);

        let (mut second, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let _ = second.read(&mut buf).await;
        let _ = second.write_all(b"+PONG\r\n").await;
        let mut sink = [0u8; 1];
        let _ = second.read(&mut sink).await;
    });

    let config = ClientConfig::default()
        .with_max_reconnect_attempts(3)
        .with_retry_interval(Duration::from_millis(50));
    let dropped = Arc::new(Mutex::new(0usize));
    let dropped2 = dropped.clone();
    let client = Client::connect_with_config(
        "127.0.0.1",
        port,
        config,
        Some(Arc::new(move |status| {
            assert_eq!(status, DisconnectStatus::Dropped);
            *dropped2.lock().unwrap() += 1;
        })),
    )
    .await
    .unwrap();

    let replies = Arc::new(Mutex::new(Vec::new()));
    let replies2 = replies.clone();
    client.send(
        vec![Bytes::from_static(b"PING")],
        Some(Box::new(move |reply| {
            replies2.lock().unwrap().push(reply);
        })),
    );
    client.sync_commit(Some(Duration::from_secs(3))).await;

    let got = replies.lock().unwrap();
    assert_eq!(got.len(), 1, "callback must fire exactly once");
    assert_eq!(got[0], Reply::SimpleString("PONG".to_string()));
    assert_eq!(
        *dropped.lock().unwrap(),
        1,
        "disconnect callback must fire once, entering Reconnecting"
    );
}

#[tokio::test]
async fn exhausted_reconnect_fails_pending_with_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        // Accept once, then drop immediately; never accept again, so
        // every retry attempt fails to connect.
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);
    });

    let config = ClientConfig::default()
        .with_max_reconnect_attempts(2)
        .with_retry_interval(Duration::from_millis(20));
    let dropped = Arc::new(Mutex::new(0usize));
    let dropped2 = dropped.clone();
    let client = Client::connect_with_config(
        "127.0.0.1",
        port,
        config,
        Some(Arc::new(move |_status| {
            *dropped2.lock().unwrap() += 1;
        })),
    )
    .await
    .unwrap();

    let replies = Arc::new(Mutex::new(Vec::new()));
    let replies2 = replies.clone();
    client.send(
        vec![Bytes::from_static(b"PING")],
        Some(Box::new(move |reply| {
            replies2.lock().unwrap().push(reply);
        })),
    );
    client.commit().await;

    tokio::time::sleep(Duration::from_millis(500)).await;

    let got = replies.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert!(got[0].is_error());
    assert!(!client.is_connected());
    assert_eq!(
        *dropped.lock().unwrap(),
        2,
        "disconnect callback fires entering Reconnecting, then again on exhaustion"
    );
}
