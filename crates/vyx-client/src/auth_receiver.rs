//! Transient local HTTP receiver for the browser login flow.
//!
//! The dashboard finishes its OAuth-ish dance in the browser and posts
//! the resulting credentials to `127.0.0.1:<ephemeral>/auth-result`. The
//! server accepts exactly one successful POST, hands the credentials to
//! the caller, and shuts down; an overall timeout bounds how long the
//! port stays open if the user abandons the login page.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How long the receiver stays up waiting for the browser.
const RECEIVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Origins allowed to post credentials.
const PRODUCTION_ORIGINS: &[&str] = &[
    "https://vyx.network",
    "https://www.vyx.network",
    "https://app.vyx.network",
];
/// Additional origins accepted in debug mode only.
const DEBUG_ORIGINS: &[&str] = &["http://localhost:3000", "http://127.0.0.1:8080"];

/// Credentials posted back by the dashboard.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthResult {
    pub token: String,
    pub user_id: String,
    #[serde(default)]
    pub email: String,
}

/// Handle to a running receiver.
pub struct Receiver {
    pub port: u16,
    handle: tokio::task::JoinHandle<Option<AuthResult>>,
}

impl Receiver {
    /// Wait for the first successful POST; `None` on timeout.
    pub async fn wait(self) -> Option<AuthResult> {
        self.handle.await.ok().flatten()
    }
}

struct ReceiverState {
    result_tx: Mutex<Option<oneshot::Sender<AuthResult>>>,
    done: CancellationToken,
    allowed_origins: Vec<String>,
}

/// Start the receiver on an ephemeral loopback port.
pub async fn start(debug_mode: bool) -> std::io::Result<Receiver> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let mut allowed_origins: Vec<String> =
        PRODUCTION_ORIGINS.iter().map(|s| s.to_string()).collect();
    if debug_mode {
        allowed_origins.extend(DEBUG_ORIGINS.iter().map(|s| s.to_string()));
    }

    let (result_tx, result_rx) = oneshot::channel();
    let done = CancellationToken::new();
    let state = Arc::new(ReceiverState {
        result_tx: Mutex::new(Some(result_tx)),
        done: done.clone(),
        allowed_origins,
    });

    let app = axum::Router::new()
        .route(
            "/auth-result",
            post(handle_auth_result).options(handle_preflight),
        )
        .with_state(state);

    info!(port = port, "auth receiver listening");

    let handle = tokio::spawn(async move {
        let shutdown = async move {
            tokio::select! {
                _ = done.cancelled() => {}
                _ = tokio::time::sleep(RECEIVER_TIMEOUT) => {}
            }
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!(error = %e, "auth receiver failed");
        }
        let mut result_rx = result_rx;
        result_rx.try_recv().ok()
    });

    Ok(Receiver { port, handle })
}

/// Security headers applied to every response: the page lives on
/// loopback for seconds, but it still handles a bearer token.
fn security_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'none'"),
    );
    headers
}

fn origin_allowed(state: &ReceiverState, headers: &HeaderMap) -> Result<Option<HeaderValue>, ()> {
    match headers.get(header::ORIGIN) {
        // Non-browser callers carry no Origin; that is not a CORS request.
        None => Ok(None),
        Some(origin) => {
            let origin_str = origin.to_str().map_err(|_| ())?;
            if state.allowed_origins.iter().any(|o| o == origin_str) {
                Ok(Some(origin.clone()))
            } else {
                Err(())
            }
        }
    }
}

async fn handle_preflight(
    State(state): State<Arc<ReceiverState>>,
    headers: HeaderMap,
) -> Response {
    let mut response_headers = security_headers();
    match origin_allowed(&state, &headers) {
        Ok(Some(origin)) => {
            response_headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
            response_headers.insert(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("POST"),
            );
            response_headers.insert(
                header::ACCESS_CONTROL_ALLOW_HEADERS,
                HeaderValue::from_static("content-type"),
            );
            (StatusCode::NO_CONTENT, response_headers).into_response()
        }
        Ok(None) => (StatusCode::NO_CONTENT, response_headers).into_response(),
        Err(()) => (StatusCode::FORBIDDEN, response_headers).into_response(),
    }
}

async fn handle_auth_result(
    State(state): State<Arc<ReceiverState>>,
    headers: HeaderMap,
    Json(result): Json<AuthResult>,
) -> Response {
    let mut response_headers = security_headers();

    let origin = match origin_allowed(&state, &headers) {
        Ok(origin) => origin,
        Err(()) => {
            warn!("auth result from disallowed origin rejected");
            return (StatusCode::FORBIDDEN, response_headers).into_response();
        }
    };
    if let Some(origin) = origin {
        response_headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    }

    if result.token.is_empty() || result.user_id.is_empty() {
        return (StatusCode::BAD_REQUEST, response_headers).into_response();
    }

    let sender = state
        .result_tx
        .lock()
        .expect("auth receiver lock poisoned")
        .take();
    match sender {
        Some(tx) => {
            let _ = tx.send(result);
            // First success: stop accepting and shut the server down.
            state.done.cancel();
            (StatusCode::OK, response_headers).into_response()
        }
        None => (StatusCode::GONE, response_headers).into_response(),
    }
}
