//! Builder lifecycle integration tests

use std::sync::Arc;
use std::time::Duration;

use linewire::transport::LifecycleState;
use linewire::{AcceptorBuilder, ConnectorBuilder, TransportBuilder, TransportConfig};
use tokio::time::{sleep, timeout};
use tokio_test::{assert_err, assert_ok};

fn loopback() -> std::net::SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[tokio::test]
async fn test_build_is_idempotent() {
    let acceptor_builder = AcceptorBuilder::new();
    let first = acceptor_builder.build().unwrap();
    let second = acceptor_builder.build().unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(acceptor_builder.state(), LifecycleState::Built);
    assert_eq!(
        acceptor_builder.thread_group_names(),
        vec!["linewire-accept".to_string(), "linewire-worker".to_string()]
    );
    assert!(!acceptor_builder.is_disabled_or_terminated());

    let connector_builder = ConnectorBuilder::new();
    let first = connector_builder.build().unwrap();
    let second = connector_builder.build().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(connector_builder.thread_group_names().len(), 1);

    acceptor_builder.shutdown_now();
    connector_builder.shutdown_now();
}

#[tokio::test]
async fn test_concurrent_builds_share_one_bootstrap() {
    let builder = Arc::new(ConnectorBuilder::new());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let builder = Arc::clone(&builder);
            std::thread::spawn(move || builder.build().unwrap())
        })
        .collect();
    let built: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(built.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(builder.thread_group_names().len(), 1);
    builder.shutdown_now();
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let builder = AcceptorBuilder::new().with_shutdown_grace(Duration::from_millis(200));
    builder.build().unwrap();

    builder.shutdown_gracefully();
    builder.shutdown_gracefully();
    builder.shutdown_now();

    assert!(builder.is_disabled_or_terminated());
    assert_eq!(builder.state(), LifecycleState::Terminated);
    assert!(builder.thread_group_names().is_empty());
}

#[tokio::test]
async fn test_shutdown_before_build_is_noop() {
    let builder = ConnectorBuilder::new();
    builder.shutdown_gracefully();
    builder.shutdown_now();

    assert_eq!(builder.state(), LifecycleState::Unbuilt);
    assert!(builder.is_disabled_or_terminated());
    // still buildable afterwards
    assert_ok!(builder.build());
    builder.shutdown_now();
}

#[tokio::test]
async fn test_bind_after_shutdown_fails() {
    let builder = AcceptorBuilder::new();
    let acceptor = builder.build().unwrap();
    builder.shutdown_now();

    assert_err!(acceptor.bind(loopback()).await);
}

#[tokio::test]
async fn test_config_snapshot_taken_at_build() {
    let mut builder = ConnectorBuilder::new();
    builder.config_mut().connect_timeout = Duration::from_secs(3);
    let connector = builder.build().unwrap();

    builder.config_mut().connect_timeout = Duration::from_secs(30);
    builder.config_mut().keep_alive = false;

    assert_eq!(connector.config().connect_timeout, Duration::from_secs(3));
    assert!(connector.config().keep_alive);
    assert_eq!(builder.config().connect_timeout, Duration::from_secs(30));
    assert!(Arc::ptr_eq(&connector, &builder.build().unwrap()));
    builder.shutdown_now();
}

#[tokio::test]
async fn test_invalid_config_surfaces_at_connect() {
    let mut config = TransportConfig::default();
    config.connect_timeout = Duration::ZERO;
    let builder = ConnectorBuilder::with_config(config);

    let connector = assert_ok!(builder.build());
    let error = connector.connect("127.0.0.1", 9).await.unwrap_err();
    assert!(format!("{:#}", error).contains("connect_timeout"));
    builder.shutdown_now();
}

#[tokio::test]
async fn test_connect_refused_is_reported() {
    // grab a free port and release it so nothing listens there
    let port = {
        let listener = std::net::TcpListener::bind(loopback()).unwrap();
        listener.local_addr().unwrap().port()
    };

    let builder = ConnectorBuilder::new();
    let connector = builder.build().unwrap();
    assert_err!(connector.connect("127.0.0.1", port).await);
    builder.shutdown_now();
}

#[tokio::test]
async fn test_inline_mode_runs_on_caller_runtime() {
    let mut config = TransportConfig::default();
    config.use_worker_thread_group = false;

    let acceptor_builder = AcceptorBuilder::with_config(config.clone());
    let connector_builder = ConnectorBuilder::with_config(config);

    let acceptor = acceptor_builder.build().unwrap();
    let connector = connector_builder.build().unwrap();
    assert!(acceptor_builder.thread_group_names().is_empty());
    assert!(acceptor_builder.is_disabled_or_terminated());
    assert!(connector_builder.is_disabled_or_terminated());

    let listener = acceptor.bind(loopback()).await.unwrap();
    let connection = timeout(
        Duration::from_secs(5),
        connector.connect("127.0.0.1", listener.local_addr().port()),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(connection.is_active());
    assert_eq!(
        connection.peer_addr().map(|addr| addr.port()),
        Some(listener.local_addr().port())
    );

    connection.close();
    listener.close();
    // shutdown is a no-op without owned groups
    acceptor_builder.shutdown_gracefully();
    connector_builder.shutdown_gracefully();
}

#[tokio::test]
async fn test_closed_listener_stops_accepting() {
    let builder = AcceptorBuilder::new();
    let acceptor = builder.build().unwrap();
    let listener = acceptor.bind(loopback()).await.unwrap();
    let port = listener.local_addr().port();

    listener.close();
    timeout(Duration::from_secs(1), listener.closed())
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;

    assert_err!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await);
    builder.shutdown_now();
}

#[tokio::test]
async fn test_graceful_shutdown_closes_live_connections() {
    let acceptor_builder = AcceptorBuilder::new().with_shutdown_grace(Duration::from_secs(1));
    let acceptor = acceptor_builder.build().unwrap();
    let listener = acceptor.bind(loopback()).await.unwrap();

    let connector_builder = ConnectorBuilder::new();
    let connector = connector_builder.build().unwrap();
    let connection = connector
        .connect("127.0.0.1", listener.local_addr().port())
        .await
        .unwrap();

    acceptor_builder.shutdown_gracefully();
    assert!(acceptor_builder.is_disabled_or_terminated());
    assert!(listener.is_closed() || timeout(Duration::from_secs(2), listener.closed()).await.is_ok());

    // the server side goes away, so the client sees the close
    timeout(Duration::from_secs(5), connection.closed())
        .await
        .unwrap();
    assert!(!connection.is_active());
    assert!(acceptor_builder.await_termination(Duration::from_secs(10)).await);

    connector_builder.shutdown_gracefully();
    assert!(connector_builder.is_disabled_or_terminated());
    assert!(connector_builder.await_termination(Duration::from_secs(10)).await);
}

#[tokio::test]
async fn test_await_termination_times_out_while_running() {
    let builder = ConnectorBuilder::new();
    builder.build().unwrap();

    assert!(!builder.await_termination(Duration::from_millis(100)).await);

    builder.shutdown_now();
    assert!(builder.await_termination(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_bind_port_listens_on_every_interface() {
    let builder = AcceptorBuilder::new();
    let acceptor = builder.build().unwrap();
    let listener = acceptor.bind_port(0).await.unwrap();

    assert!(listener.local_addr().ip().is_unspecified());
    assert_ne!(listener.local_addr().port(), 0);
    assert_ok!(tokio::net::TcpStream::connect(("127.0.0.1", listener.local_addr().port())).await);

    listener.close();
    builder.shutdown_now();
}
