//! End-to-end scenarios against a scripted in-process exchange server.
//!
//! The fake exchange is a real QUIC endpoint with a self-signed
//! certificate on loopback; the client accepts it via its localhost
//! development path. Discovery is pointed at a dead API port so endpoint
//! selection exercises the static-fallback branch.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::time::timeout;

use vyx_config::{Config, CredentialStore, MemoryStore};
use vyx_proto::{
    Frame, TYPE_AUTH, TYPE_AUTH_SUCCESS, TYPE_CLOSE, TYPE_CONNECT, TYPE_CONNECTED, TYPE_DATA,
    TYPE_ERROR,
};
use vyx_session::{RelayConfig, SessionTiming, Supervisor, SupervisorOptions, SupervisorState};

#[ctor::ctor]
fn init_crypto() {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install aws-lc-rs crypto provider");
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
}

const TICK: Duration = Duration::from_secs(10);

/// Scripted exchange server on a loopback QUIC endpoint.
struct FakeExchange {
    endpoint: quinn::Endpoint,
    addr: String,
}

impl FakeExchange {
    fn start() -> Self {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()])
            .expect("self-signed cert generation failed");
        let cert_der = rustls::pki_types::CertificateDer::from(certified.cert);
        let key_der =
            rustls::pki_types::PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());

        let mut server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der.into())
            .expect("server tls config");
        server_crypto.alpn_protocols = vec![b"vyx-proxy".to_vec()];

        let quic_config = quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .expect("quic server config");
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_config));

        let endpoint = quinn::Endpoint::server(
            server_config,
            "127.0.0.1:0".parse().expect("static addr"),
        )
        .expect("server endpoint bind");
        let addr = format!("127.0.0.1:{}", endpoint.local_addr().unwrap().port());

        Self { endpoint, addr }
    }

    /// Accept one session.
    async fn accept_connection(&self) -> quinn::Connection {
        let incoming = timeout(TICK, self.endpoint.accept())
            .await
            .expect("timed out waiting for client")
            .expect("endpoint closed");
        incoming.await.expect("handshake failed")
    }

    /// Accept one session and its control stream.
    async fn accept(&self) -> (quinn::SendStream, quinn::RecvStream) {
        let connection = self.accept_connection().await;
        timeout(TICK, connection.accept_bi())
            .await
            .expect("timed out waiting for control stream")
            .expect("no control stream")
    }
}

async fn read_frame(recv: &mut quinn::RecvStream) -> Frame {
    timeout(TICK, vyx_proto::read_frame(recv))
        .await
        .expect("timed out reading frame")
        .expect("frame read failed")
}

async fn write_frame(send: &mut quinn::SendStream, frame: &Frame) {
    use tokio::io::AsyncWriteExt;
    let encoded = vyx_proto::encode_frame(frame).unwrap();
    send.write_all(&encoded).await.expect("frame write failed");
}

fn supervisor_for(exchange: &FakeExchange, store: Arc<MemoryStore>) -> Supervisor {
    let config = Config {
        user_id: "u1".into(),
        email: "u1@example.net".into(),
        ..Config::default()
    };
    let options = SupervisorOptions {
        // Dead API port: discovery fails fast and selection falls back
        // to the static endpoint, which is the fake exchange.
        api_base: "http://127.0.0.1:9".into(),
        fallback_endpoint: exchange.addr.clone(),
        debug_mode: false,
        client_version: "0.0.0-test".into(),
        relay: RelayConfig::default(),
        timing: SessionTiming::default(),
    };
    Supervisor::new(config, store, options)
}

async fn wait_for_state(supervisor: &Supervisor, want: SupervisorState) {
    let status = supervisor.status();
    timeout(TICK, async {
        loop {
            if status.snapshot().state == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "never reached {want}, stuck at {}",
            status.snapshot().state
        )
    });
}

/// Cold start happy path: discovery fallback, dial, auth, Running, and a
/// full relay round trip, then a clean user stop.
#[tokio::test(flavor = "multi_thread")]
async fn cold_start_relay_and_stop() {
    init_tracing();

    let exchange = FakeExchange::start();
    let store = Arc::new(MemoryStore::new());
    store.save_token("u1", "tok-valid").unwrap();

    let supervisor = supervisor_for(&exchange, store);
    let runner = supervisor.clone();
    let run_handle = tokio::spawn(async move { runner.run().await });

    // Server side: expect AUTH first, verify the token, accept.
    let (mut send, mut recv) = exchange.accept().await;
    let auth = read_frame(&mut recv).await;
    assert_eq!(auth.frame_type, TYPE_AUTH, "AUTH must be the first frame");
    assert_eq!(auth.id, "tok-valid");
    let meta: serde_json::Value = serde_json::from_slice(&auth.data).unwrap();
    assert_eq!(meta["client_type"], "desktop");

    write_frame(
        &mut send,
        &Frame {
            frame_type: TYPE_AUTH_SUCCESS,
            id: String::new(),
            addr: String::new(),
            data: b"alice".to_vec(),
        },
    )
    .await;

    wait_for_state(&supervisor, SupervisorState::Running).await;
    let snap = supervisor.status().snapshot();
    assert_eq!(snap.authenticated_as.as_deref(), Some("alice"));
    assert_eq!(snap.server_address.as_deref(), Some(exchange.addr.as_str()));
    assert!(snap.connected_at.is_some());

    // Relay demand: CONNECT to a local echo destination with an initial
    // payload, then verify the echo comes back as DATA frames.
    let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dest_addr = destination.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;
        let (mut stream, _) = destination.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    write_frame(
        &mut send,
        &Frame {
            frame_type: TYPE_CONNECT,
            id: "sub-1".into(),
            addr: dest_addr,
            data: b"initial".to_vec(),
        },
    )
    .await;

    let connected = read_frame(&mut recv).await;
    assert_eq!(connected.frame_type, TYPE_CONNECTED);
    assert_eq!(connected.id, "sub-1");

    // The initial payload echoes back without any DATA frame from us.
    let mut echoed = Vec::new();
    while echoed.len() < b"initial".len() {
        let frame = read_frame(&mut recv).await;
        assert_eq!(frame.frame_type, TYPE_DATA);
        assert_eq!(frame.id, "sub-1");
        echoed.extend_from_slice(&frame.data);
    }
    assert_eq!(echoed, b"initial");

    assert_eq!(supervisor.status().snapshot().active_subconnections, 1);

    // User stop: sub-connection torn down promptly, state Stopped, and
    // no reconnect afterward.
    supervisor.stop();
    wait_for_state(&supervisor, SupervisorState::Stopped).await;
    timeout(TICK, async {
        while supervisor.status().snapshot().active_subconnections != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("sub-connections not torn down after stop");
    assert!(!supervisor.share_enabled());

    supervisor.shutdown();
    timeout(TICK, run_handle).await.unwrap().unwrap();
}

/// Destination refuses: no CONNECTED, exactly one CLOSE, no table entry.
#[tokio::test(flavor = "multi_thread")]
async fn refused_destination_yields_single_close() {
    init_tracing();

    let exchange = FakeExchange::start();
    let store = Arc::new(MemoryStore::new());
    store.save_token("u1", "tok-valid").unwrap();

    let supervisor = supervisor_for(&exchange, store);
    let runner = supervisor.clone();
    let run_handle = tokio::spawn(async move { runner.run().await });

    let (mut send, mut recv) = exchange.accept().await;
    let auth = read_frame(&mut recv).await;
    assert_eq!(auth.frame_type, TYPE_AUTH);
    write_frame(
        &mut send,
        &Frame {
            frame_type: TYPE_AUTH_SUCCESS,
            id: String::new(),
            addr: String::new(),
            data: b"alice".to_vec(),
        },
    )
    .await;
    wait_for_state(&supervisor, SupervisorState::Running).await;

    write_frame(
        &mut send,
        &Frame {
            frame_type: TYPE_CONNECT,
            id: "refused".into(),
            addr: "127.0.0.1:1".into(),
            data: Vec::new(),
        },
    )
    .await;

    let frame = read_frame(&mut recv).await;
    assert_eq!(frame.frame_type, TYPE_CLOSE);
    assert_eq!(frame.id, "refused");
    assert_eq!(supervisor.status().snapshot().active_subconnections, 0);

    supervisor.shutdown();
    timeout(TICK, run_handle).await.unwrap().unwrap();
}

/// Stale token: the exchange answers ERROR and the supervisor parks in
/// the long auth backoff without creating any sub-connection.
#[tokio::test(flavor = "multi_thread")]
async fn rejected_token_backs_off() {
    init_tracing();

    let exchange = FakeExchange::start();
    let store = Arc::new(MemoryStore::new());
    store.save_token("u1", "tok-stale").unwrap();

    let supervisor = supervisor_for(&exchange, store);
    let runner = supervisor.clone();
    let run_handle = tokio::spawn(async move { runner.run().await });

    let (mut send, mut recv) = exchange.accept().await;
    let auth = read_frame(&mut recv).await;
    assert_eq!(auth.id, "tok-stale");
    write_frame(
        &mut send,
        &Frame {
            frame_type: TYPE_ERROR,
            id: String::new(),
            addr: String::new(),
            data: b"invalid token".to_vec(),
        },
    )
    .await;

    wait_for_state(&supervisor, SupervisorState::Backoff).await;
    let snap = supervisor.status().snapshot();
    assert_eq!(snap.active_subconnections, 0);
    assert!(snap.authenticated_as.is_none());

    supervisor.shutdown();
    timeout(TICK, run_handle).await.unwrap().unwrap();
}

/// Signed out: no AUTH frame is ever sent; the loop parks in backoff.
#[tokio::test(flavor = "multi_thread")]
async fn signed_out_never_sends_auth() {
    init_tracing();

    let exchange = FakeExchange::start();
    // Empty credential store: not logged in.
    let supervisor = supervisor_for(&exchange, Arc::new(MemoryStore::new()));
    let runner = supervisor.clone();
    let run_handle = tokio::spawn(async move { runner.run().await });

    // The client connects but closes without ever initiating the
    // control stream: with no token there is nothing to send. A QUIC
    // stream only materializes at the peer on first write, so the
    // accept either errors (connection closed) or, if it races a
    // stream open, carries zero bytes.
    let connection = exchange.accept_connection().await;
    match timeout(TICK, connection.accept_bi()).await {
        Ok(Err(_)) => {}
        Ok(Ok((_send, mut recv))) => {
            let mut buf = [0u8; 1];
            let read = timeout(TICK, recv.read(&mut buf))
                .await
                .expect("timed out waiting for stream end");
            assert!(
                matches!(read, Ok(None) | Err(_)),
                "client sent bytes while signed out"
            );
        }
        Err(_) => panic!("connection neither closed nor opened a stream"),
    }

    wait_for_state(&supervisor, SupervisorState::Backoff).await;

    supervisor.shutdown();
    timeout(TICK, run_handle).await.unwrap().unwrap();
}

/// Mid-session disconnect: the exchange drops the session; the client
/// tears down sub-connections and schedules the quick re-dial branch,
/// reconnecting on its own.
#[tokio::test(flavor = "multi_thread")]
async fn mid_session_disconnect_reconnects() {
    init_tracing();

    let exchange = FakeExchange::start();
    let store = Arc::new(MemoryStore::new());
    store.save_token("u1", "tok-valid").unwrap();

    let supervisor = supervisor_for(&exchange, store);
    let runner = supervisor.clone();
    let run_handle = tokio::spawn(async move { runner.run().await });

    // First session.
    let (mut send, mut recv) = exchange.accept().await;
    let _auth = read_frame(&mut recv).await;
    write_frame(
        &mut send,
        &Frame {
            frame_type: TYPE_AUTH_SUCCESS,
            id: String::new(),
            addr: String::new(),
            data: b"alice".to_vec(),
        },
    )
    .await;
    wait_for_state(&supervisor, SupervisorState::Running).await;

    // Abrupt drop. The quick-retry branch (2 s) should bring a second
    // session without any user action.
    drop(send);
    drop(recv);

    let (mut send2, mut recv2) = exchange.accept().await;
    let auth2 = read_frame(&mut recv2).await;
    assert_eq!(auth2.frame_type, TYPE_AUTH);
    write_frame(
        &mut send2,
        &Frame {
            frame_type: TYPE_AUTH_SUCCESS,
            id: String::new(),
            addr: String::new(),
            data: b"alice".to_vec(),
        },
    )
    .await;
    wait_for_state(&supervisor, SupervisorState::Running).await;

    supervisor.shutdown();
    timeout(TICK, run_handle).await.unwrap().unwrap();
}
