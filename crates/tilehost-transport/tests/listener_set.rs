//! Integration tests for the listener set and WebSocket connections.
//!
//! Every test binds to port 0 and reads the real port back from
//! `ListenerSet::bound`, so tests can run in parallel.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tilehost_config::{ConfigError, ListenerEndpoint, TlsSettings};
use tilehost_transport::{Connection, ListenerSet};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::Message;

const HANDSHAKE: Duration = Duration::from_secs(5);

async fn connect_client(
    addr: std::net::SocketAddr,
) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
> {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
        .await
        .expect("client should connect");
    ws
}

#[tokio::test]
async fn test_bind_all_endpoints_tags_connections() {
    let endpoints = [
        ListenerEndpoint::plain("127.0.0.1", 0),
        ListenerEndpoint::plain("127.0.0.1", 0),
    ];
    let mut set = ListenerSet::bind(&endpoints, None).await.expect("should bind");
    assert_eq!(set.bound().len(), 2);

    let second = set.bound()[1].local_addr;
    let _client = tokio::spawn(async move { connect_client(second).await });

    let accepted = set.accept().await.expect("a connection");
    assert!(!accepted.is_tls());
    assert_eq!(accepted.endpoint, endpoints[1]);
}

#[tokio::test]
async fn test_bind_conflict_fails_whole_set() {
    let first = ListenerSet::bind(&[ListenerEndpoint::plain("127.0.0.1", 0)], None)
        .await
        .unwrap();
    let taken = first.bound()[0].local_addr.port();

    let result = ListenerSet::bind(
        &[
            ListenerEndpoint::plain("127.0.0.1", 0),
            ListenerEndpoint::plain("127.0.0.1", taken),
        ],
        None,
    )
    .await;
    assert!(matches!(result, Err(ConfigError::Bind { .. })));
}

#[tokio::test]
async fn test_tls_endpoint_without_settings_is_config_error() {
    let result = ListenerSet::bind(&[ListenerEndpoint::tls("127.0.0.1", 0)], None).await;
    assert!(matches!(result, Err(ConfigError::MissingTlsMaterial { .. })));
}

#[tokio::test]
async fn test_tls_endpoint_handshake_connection_is_secure() {
    let dir = tempfile::tempdir().unwrap();
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let tls = TlsSettings {
        certfile: dir.path().join("cert.pem"),
        keyfile: dir.path().join("key.pem"),
        address: "127.0.0.1".into(),
        port: 0,
        bind_pairs: None,
    };
    std::fs::write(&tls.certfile, certified.cert.pem()).unwrap();
    std::fs::write(&tls.keyfile, certified.key_pair.serialize_pem()).unwrap();

    let endpoints = [
        ListenerEndpoint::plain("127.0.0.1", 0),
        ListenerEndpoint::tls("127.0.0.1", 0),
    ];
    let mut set = ListenerSet::bind(&endpoints, Some(&tls)).await.expect("should bind");
    let addr = set.bound()[1].local_addr;

    let mut roots = RootCertStore::empty();
    roots.add(certified.cert.der().clone()).unwrap();
    let connector = TlsConnector::from(Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    ));
    let client = tokio::spawn(async move {
        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
        let server_name = ServerName::try_from("localhost").unwrap();
        let stream = connector.connect(server_name, tcp).await.expect("TLS handshake");
        let (ws, _) = tokio_tungstenite::client_async(format!("wss://localhost:{}", addr.port()), stream)
            .await
            .expect("WebSocket handshake over TLS");
        ws
    });

    let accepted = set.accept().await.expect("a connection");
    assert!(accepted.is_tls());
    assert_eq!(accepted.endpoint, endpoints[1]);
    let conn = accepted.upgrade(HANDSHAKE).await.expect("server handshake");
    assert!(conn.is_secure());

    let mut client = client.await.unwrap();
    client
        .send(Message::Text(r#"{"msg":"heartbeat"}"#.to_string().into()))
        .await
        .unwrap();
    assert_eq!(conn.recv().await.unwrap().unwrap(), br#"{"msg":"heartbeat"}"#);
}

#[tokio::test]
async fn test_upgrade_and_full_duplex_exchange() {
    let mut set = ListenerSet::bind(&[ListenerEndpoint::plain("127.0.0.1", 0)], None)
        .await
        .unwrap();
    let addr = set.bound()[0].local_addr;

    let client = tokio::spawn(async move { connect_client(addr).await });
    let conn = set
        .accept()
        .await
        .unwrap()
        .upgrade(HANDSHAKE)
        .await
        .expect("handshake");
    let mut client = client.await.unwrap();
    assert!(conn.id().into_inner() > 0);
    assert!(!conn.is_secure());

    let conn = Arc::new(conn);

    // A pending recv must not block sends.
    let reader = {
        let conn = conn.clone();
        tokio::spawn(async move { conn.recv().await })
    };
    tokio::task::yield_now().await;
    conn.send(br#"{"msg":"heartbeat_ack"}"#).await.expect("send");

    let msg = client.next().await.unwrap().unwrap();
    assert!(msg.is_text());
    assert_eq!(msg.into_text().unwrap().as_str(), r#"{"msg":"heartbeat_ack"}"#);

    client
        .send(Message::Text(r#"{"msg":"heartbeat"}"#.to_string().into()))
        .await
        .unwrap();
    let received = reader.await.unwrap().unwrap().unwrap();
    assert_eq!(received, br#"{"msg":"heartbeat"}"#);

    client.close(None).await.unwrap();
    assert_eq!(conn.recv().await.unwrap(), None);
}

#[tokio::test]
async fn test_upgrade_times_out_on_silent_client() {
    let mut set = ListenerSet::bind(&[ListenerEndpoint::plain("127.0.0.1", 0)], None)
        .await
        .unwrap();
    let addr = set.bound()[0].local_addr;

    // A raw TCP client that never speaks.
    let _silent = tokio::net::TcpStream::connect(addr).await.unwrap();
    let accepted = set.accept().await.unwrap();
    let result = accepted.upgrade(Duration::from_millis(100)).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_shutdown_ends_accept_stream() {
    let mut set = ListenerSet::bind(&[ListenerEndpoint::plain("127.0.0.1", 0)], None)
        .await
        .unwrap();
    set.shutdown();
    assert!(set.accept().await.is_none());
}
