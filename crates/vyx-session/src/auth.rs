//! Token handshake on a freshly opened control stream.
//!
//! AUTH is the first frame on every control stream. The authenticator
//! sends it once and reads exactly one response; it never retries — the
//! supervisor owns retry policy and uses the `NotLoggedIn` /
//! `AuthRejected` distinction to pick its backoff branch.

use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncRead;
use tracing::{debug, warn};
use vyx_proto::{Frame, TYPE_AUTH_SUCCESS, TYPE_ERROR};

use crate::error::SessionError;
use crate::transport::FrameWriter;

/// Deadline for the exchange's response to AUTH.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Client descriptor carried in the AUTH payload.
#[derive(Debug, Serialize)]
struct ClientMetadata<'a> {
    client_type: &'static str,
    os: &'static str,
    os_version: &'static str,
    client_version: &'a str,
}

fn os_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "mac",
        other => other,
    }
}

fn os_version() -> &'static str {
    match std::env::consts::OS {
        "windows" => "Windows",
        "macos" => "macOS",
        "linux" => "Linux",
        other => other,
    }
}

/// Authenticate on a fresh control stream.
///
/// Returns the display name from `AUTH_SUCCESS`. Every non-success
/// outcome — explicit `ERROR`, an unexpected frame, a read failure, or
/// the deadline — maps to `AuthRejected`, except the missing-token
/// precondition which is `NotLoggedIn` and sends nothing.
pub async fn authenticate<R>(
    writer: &FrameWriter,
    recv: &mut R,
    token: Option<&str>,
    client_version: &str,
) -> Result<String, SessionError>
where
    R: AsyncRead + Unpin,
{
    let token = match token {
        Some(token) if !token.is_empty() => token,
        _ => return Err(SessionError::NotLoggedIn),
    };

    let metadata = ClientMetadata {
        client_type: "desktop",
        os: os_name(),
        os_version: os_version(),
        client_version,
    };
    let metadata_json = serde_json::to_vec(&metadata).unwrap_or_else(|_| b"{}".to_vec());

    writer
        .write_frame(&Frame::auth(token, metadata_json))
        .await?;
    debug!("auth frame sent, awaiting response");

    let response = match tokio::time::timeout(AUTH_TIMEOUT, vyx_proto::read_frame(recv)).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            warn!(error = %e, "auth response read failed");
            return Err(SessionError::AuthRejected(format!("read failed: {e}")));
        }
        Err(_) => return Err(SessionError::AuthRejected("timed out".into())),
    };

    match response.frame_type {
        TYPE_AUTH_SUCCESS => {
            let name = String::from_utf8_lossy(&response.data).into_owned();
            debug!(user = %name, "authenticated");
            Ok(name)
        }
        TYPE_ERROR => {
            let reason = String::from_utf8_lossy(&response.data).into_owned();
            Err(SessionError::AuthRejected(reason))
        }
        other => Err(SessionError::AuthRejected(format!(
            "unexpected {} response",
            vyx_proto::type_name(other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use vyx_proto::TYPE_AUTH;

    /// Drive `authenticate` against a scripted peer. Returns the AUTH
    /// frame the peer observed and the handshake outcome.
    async fn run_handshake(
        response: Option<Frame>,
        token: Option<&str>,
    ) -> (Option<Frame>, Result<String, SessionError>) {
        let (client_w, mut peer_r) = tokio::io::duplex(64 * 1024);
        let (mut peer_w, mut client_r) = tokio::io::duplex(64 * 1024);

        let writer = FrameWriter::new(client_w);

        let peer = tokio::spawn(async move {
            let auth = vyx_proto::read_frame(&mut peer_r).await.ok();
            if let Some(frame) = response {
                let encoded = vyx_proto::encode_frame(&frame).unwrap();
                let _ = peer_w.write_all(&encoded).await;
            }
            auth
        });

        let result = authenticate(&writer, &mut client_r, token, "0.1.1").await;
        // Close our write half so a peer still blocked on its read sees EOF.
        drop(writer);
        let seen = peer.await.unwrap();
        (seen, result)
    }

    #[tokio::test]
    async fn success_returns_display_name() {
        let response = Frame {
            frame_type: TYPE_AUTH_SUCCESS,
            id: String::new(),
            addr: String::new(),
            data: b"alice".to_vec(),
        };
        let (seen, result) = run_handshake(Some(response), Some("tok-1")).await;

        let auth = seen.unwrap();
        assert_eq!(auth.frame_type, TYPE_AUTH);
        assert_eq!(auth.id, "tok-1");
        let meta: serde_json::Value = serde_json::from_slice(&auth.data).unwrap();
        assert_eq!(meta["client_type"], "desktop");
        assert_eq!(meta["client_version"], "0.1.1");

        assert_eq!(result.unwrap(), "alice");
    }

    #[tokio::test]
    async fn error_response_is_rejection() {
        let response = Frame {
            frame_type: TYPE_ERROR,
            id: String::new(),
            addr: String::new(),
            data: b"invalid token".to_vec(),
        };
        let (_, result) = run_handshake(Some(response), Some("stale")).await;
        match result {
            Err(SessionError::AuthRejected(reason)) => assert_eq!(reason, "invalid token"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unexpected_frame_is_rejection() {
        let response = Frame::connected("weird");
        let (_, result) = run_handshake(Some(response), Some("tok")).await;
        assert!(matches!(result, Err(SessionError::AuthRejected(_))));
    }

    #[tokio::test]
    async fn closed_stream_is_rejection() {
        // Peer sends nothing and hangs up; the read error maps to a
        // rejection, not a transport error.
        let (_, result) = run_handshake(None, Some("tok")).await;
        assert!(matches!(result, Err(SessionError::AuthRejected(_))));
    }

    #[tokio::test]
    async fn missing_token_fails_before_any_write() {
        let (seen, result) = run_handshake(None, None).await;
        assert!(matches!(result, Err(SessionError::NotLoggedIn)));
        assert!(seen.is_none(), "no AUTH frame may be sent without a token");
    }
}
