//! Session error taxonomy.
//!
//! Variants are classified by recovery behavior: everything here is
//! session-scoped. Per-sub-connection failures (dial, relay I/O) never
//! become a `SessionError` — they are contained inside the relay engine
//! and end only their own sub-connection.

/// Errors that end a session or a connection attempt.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Endpoint could not be reached (resolution, bind, connect).
    #[error("transport dial failed: {0}")]
    Dial(String),

    /// TLS/QUIC handshake or control-stream open failed.
    #[error("transport handshake failed: {0}")]
    Handshake(String),

    /// Control-stream decode failure; the stream is unusable.
    #[error("control stream error: {0}")]
    Stream(#[from] vyx_proto::ReadError),

    /// Raw I/O failure on the control stream.
    #[error("control stream I/O: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound frame could not be encoded.
    #[error("frame encode failed: {0}")]
    Encode(#[from] vyx_proto::WriteError),

    /// No bearer token present; the user has not signed in. Retried on a
    /// long delay so an idle machine does not hammer the exchange.
    #[error("not logged in")]
    NotLoggedIn,

    /// The exchange refused the token.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Write on the shared control-stream writer failed. Always
    /// session-fatal: the writer's correctness is the session's.
    #[error("control stream writer failed: {0}")]
    Writer(std::io::Error),

    /// The health monitor declared the session dead.
    #[error("no inbound frames for {0} seconds, session presumed dead")]
    HealthStale(u64),
}

impl SessionError {
    /// Whether the supervisor should apply the authentication backoff
    /// branches rather than the transport schedule.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::NotLoggedIn | Self::AuthRejected(_))
    }
}
