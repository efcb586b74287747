//! End-to-end reconnect scenario against an in-process fake broker built on
//! `tokio::io::duplex`, exercising the scenario in spec.md §8 #4 without a
//! real socket or TLS handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use fabricrt_messaging::block::Block;
use fabricrt_messaging::client::{boxed_connect, ClientConfig, MessagingClient};
use fabricrt_messaging::error::MessagingError;

type DuplexStream = tokio::io::DuplexStream;

#[tokio::test(flavor = "multi_thread")]
async fn reconnects_once_fake_broker_becomes_available() {
    let broker_up = Arc::new(AtomicBool::new(false));

    let up_for_sender = Arc::clone(&broker_up);
    let connect_sender = boxed_connect::<DuplexStream, _, _>(move || {
        let up = Arc::clone(&up_for_sender);
        async move {
            if !up.load(Ordering::SeqCst) {
                return Err(MessagingError::Transport(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "broker down",
                )));
            }
            let (client_side, server_side) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                // Fake broker: drain whatever the sender writes.
                let mut sink = server_side;
                let mut buf = [0u8; 1024];
                loop {
                    use tokio::io::AsyncReadExt;
                    match sink.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => continue,
                    }
                }
            });
            Ok(client_side)
        }
    });

    let up_for_receiver = Arc::clone(&broker_up);
    let connect_receiver = boxed_connect::<DuplexStream, _, _>(move || {
        let up = Arc::clone(&up_for_receiver);
        async move {
            if !up.load(Ordering::SeqCst) {
                return Err(MessagingError::Transport(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "broker down",
                )));
            }
            let (client_side, _server_side) = tokio::io::duplex(4096);
            // Fake broker never sends anything on the receiver side in this
            // test; it just needs to stay open.
            Ok(client_side)
        }
    });

    let config = ClientConfig {
        reconnect_interval: Duration::from_millis(50),
        ..ClientConfig::default()
    };

    let client = MessagingClient::spawn(
        config,
        connect_sender,
        connect_receiver,
        Arc::new(|_block| {}),
    );

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!client.is_connected(), "should not connect while broker is down");
    let channel_id_before = client.channel_id();

    broker_up.store(true, Ordering::SeqCst);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !client.is_connected() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(client.is_connected(), "should reconnect once broker is up");
    assert_ne!(
        client.channel_id(),
        channel_id_before,
        "channel id must rotate on the disconnected->connected transition"
    );

    let (tx, rx) = std::sync::mpsc::channel();
    client.push_block(
        Block::new(BytesMut::from(&b"hello"[..]), 5),
        Some(Box::new(move |result| {
            let _ = tx.send(result);
        })),
    );
    let result = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    client.dispose().await;
}
