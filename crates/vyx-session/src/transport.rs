//! QUIC transport: session dialing and the shared control-stream writer.
//!
//! One session carries exactly one bidirectional stream; every frame in
//! both directions travels on it. Window sizes target a ~200 ms RTT
//! bandwidth-delay product — smaller starves throughput, larger wastes
//! memory on idle sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::QuicClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info};
use vyx_proto::Frame;

use crate::error::SessionError;

/// Application protocol advertised during the TLS handshake.
pub const ALPN_PROTOCOL: &[u8] = b"vyx-proxy";

/// Session idle timeout. Deliberately looser than the 10-minute health
/// threshold; the health monitor fires first, this is the backstop.
const IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Transport-level keepalive cadence.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Deadline for the full dial + handshake. Without it, a blackholed UDP
/// path would wait out the whole idle timeout before failing.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-stream receive window.
const STREAM_RECEIVE_WINDOW: u32 = 16 * 1024 * 1024;
/// Whole-session receive window.
const CONNECTION_RECEIVE_WINDOW: u32 = 32 * 1024 * 1024;

/// A dialed session with its single control stream.
pub struct ControlStream {
    pub connection: quinn::Connection,
    pub send: quinn::SendStream,
    pub recv: quinn::RecvStream,
}

/// Dial the exchange at `addr` (`host:port`) and open the control stream.
pub async fn dial(addr: &str) -> Result<ControlStream, SessionError> {
    let host = addr.rsplit_once(':').map_or(addr, |(host, _)| host);

    let remote: SocketAddr = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| SessionError::Dial(format!("resolve {addr}: {e}")))?
        .next()
        .ok_or_else(|| SessionError::Dial(format!("no addresses for {addr}")))?;

    let bind: SocketAddr = if remote.is_ipv6() {
        "[::]:0".parse().expect("static addr")
    } else {
        "0.0.0.0:0".parse().expect("static addr")
    };

    let mut endpoint = quinn::Endpoint::client(bind)
        .map_err(|e| SessionError::Dial(format!("bind client endpoint: {e}")))?;
    endpoint.set_default_client_config(client_config(host)?);

    debug!(remote = %remote, host = %host, "dialing exchange");

    let connecting = endpoint
        .connect(remote, host)
        .map_err(|e| SessionError::Dial(e.to_string()))?;
    let connection = tokio::time::timeout(HANDSHAKE_TIMEOUT, connecting)
        .await
        .map_err(|_| SessionError::Handshake(format!("timed out connecting to {remote}")))?
        .map_err(|e| SessionError::Handshake(e.to_string()))?;

    let (send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| SessionError::Handshake(format!("open control stream: {e}")))?;

    info!(remote = %remote, "session established");

    Ok(ControlStream {
        connection,
        send,
        recv,
    })
}

/// QUIC client configuration with the transport tuning applied.
fn client_config(host: &str) -> Result<quinn::ClientConfig, SessionError> {
    let tls = build_tls_config(host)?;
    let quic_tls = QuicClientConfig::try_from(tls)
        .map_err(|e| SessionError::Handshake(format!("tls config: {e}")))?;

    let mut config = quinn::ClientConfig::new(Arc::new(quic_tls));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(IDLE_TIMEOUT)
            .map_err(|e| SessionError::Handshake(format!("idle timeout: {e}")))?,
    ));
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    transport.stream_receive_window(quinn::VarInt::from_u32(STREAM_RECEIVE_WINDOW));
    transport.receive_window(quinn::VarInt::from_u32(CONNECTION_RECEIVE_WINDOW));
    config.transport_config(Arc::new(transport));

    Ok(config)
}

/// TLS client config for an exchange host.
///
/// Localhost endpoints skip certificate verification (development path);
/// everything else verifies against the system trust roots with the
/// dialed hostname as the expected name.
fn build_tls_config(host: &str) -> Result<rustls::ClientConfig, SessionError> {
    // Sanity-check the name early so a bad host fails as a dial error
    // rather than deep inside the handshake.
    ServerName::try_from(host.to_string())
        .map_err(|e| SessionError::Dial(format!("invalid server name {host}: {e}")))?;

    let mut config = if is_dev_host(host) {
        debug!(host = %host, "development endpoint, skipping certificate verification");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    config.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];
    Ok(config)
}

fn is_dev_host(host: &str) -> bool {
    host == "localhost" || host == "127.0.0.1"
}

/// Serialized writer for the control stream.
///
/// A single async mutex orders all outbound frames; there is no queue in
/// front of it. Backpressure from the transport surfaces as a blocked
/// write, which blocks the relay task that produced the frame.
pub struct FrameWriter {
    stream: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl FrameWriter {
    pub fn new(stream: impl AsyncWrite + Send + Unpin + 'static) -> Arc<Self> {
        Arc::new(Self {
            stream: Mutex::new(Box::new(stream)),
        })
    }

    /// Encode and send one frame. Holders of the internal lock perform
    /// only the transport write, never application waits.
    pub async fn write_frame(&self, frame: &Frame) -> Result<(), SessionError> {
        let encoded = vyx_proto::encode_frame(frame)?;
        let mut stream = self.stream.lock().await;
        stream
            .write_all(&encoded)
            .await
            .map_err(SessionError::Writer)?;
        stream.flush().await.map_err(SessionError::Writer)?;
        Ok(())
    }
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter").finish_non_exhaustive()
    }
}


/// Certificate verifier that accepts anything; wired up only for
/// localhost development endpoints.
#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::CryptoProvider::get_default()
            .map(|provider| {
                provider
                    .signature_verification_algorithms
                    .supported_schemes()
            })
            .unwrap_or_default()
    }
}
