#![allow(missing_docs, reason = "integration tests")]
#![allow(clippy::unwrap_used, reason = "test code can panic")]
#![allow(clippy::expect_used, reason = "test code can panic")]

use std::time::Duration;

use interval_host::socket::{SocketError, SocketOptions};
use test_util::{MockDashboard, framed_socket};
use tokio::time::sleep;

fn fast_options() -> SocketOptions {
    SocketOptions {
        send_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(500),
        ping_timeout: Duration::from_millis(500),
        num_producers: 1,
    }
}

#[tokio::test]
async fn connect_completes_after_authentication() {
    let dashboard = MockDashboard::start().await;
    let socket = framed_socket(&dashboard.endpoint(), fast_options()).await;
    socket.connect().await.unwrap();
    assert!(!socket.is_closed());

    // the authentication message is acknowledged exactly once
    sleep(Duration::from_millis(100)).await;
    assert_eq!(dashboard.ack_count(), 1);
}

#[tokio::test]
async fn sends_complete_on_acknowledgement() {
    let dashboard = MockDashboard::start().await;
    let socket = framed_socket(&dashboard.endpoint(), fast_options()).await;
    socket.connect().await.unwrap();

    socket.send("hello there".to_owned()).await.unwrap();
    socket.ping().await.unwrap();
}

#[tokio::test]
async fn silent_server_times_out_authentication() {
    let dashboard = MockDashboard::start_silent().await;
    let socket = framed_socket(&dashboard.endpoint(), fast_options()).await;
    let err = socket.connect().await.unwrap_err();
    assert!(matches!(err, SocketError::AuthenticationTimeout));
}

#[tokio::test]
async fn operations_after_close_fail_fast() {
    let dashboard = MockDashboard::start().await;
    let socket = framed_socket(&dashboard.endpoint(), fast_options()).await;
    socket.connect().await.unwrap();

    socket.close().await;
    assert!(socket.is_closed());
    let err = socket.send("late".to_owned()).await.unwrap_err();
    assert!(matches!(err, SocketError::NotConnected));
    let err = socket.ping().await.unwrap_err();
    assert!(matches!(err, SocketError::NotConnected));
}

#[tokio::test]
async fn producers_can_run_in_parallel() {
    let dashboard = MockDashboard::start().await;
    let socket = framed_socket(
        &dashboard.endpoint(),
        SocketOptions {
            num_producers: 3,
            ..fast_options()
        },
    )
    .await;
    socket.connect().await.unwrap();

    let sends = (0..12).map(|i| socket.send(format!("payload {i}")));
    for result in futures_util::future::join_all(sends).await {
        result.unwrap();
    }
}
