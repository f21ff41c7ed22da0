//! Supervisor: the outer connect/auth/run/backoff state machine.
//!
//! One control task owns the whole session lifecycle. `start()` and
//! `stop()` flip user intent from any thread; the loop observes the flag,
//! never the other way around. Retry pacing follows a fixed schedule with
//! two special branches: a long delay while signed out (no point hammering
//! the exchange) and a longer one after an explicit token rejection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vyx_config::{Config, CredentialStore};
use vyx_config::defaults::{CLIENT_VERSION, DEBUG_ENDPOINT, DEFAULT_FALLBACK_ENDPOINT};
use vyx_dns::FallbackResolver;
use vyx_proto::Frame;

use crate::auth;
use crate::error::SessionError;
use crate::relay::{RelayConfig, RelayEngine};
use crate::session::{SessionTiming, run_session};
use crate::status::{StatusHandle, SupervisorState};
use crate::transport::{self, FrameWriter};

/// Delay while the user has not signed in.
const NOT_LOGGED_IN_DELAY: Duration = Duration::from_secs(30);
/// Delay after the exchange rejected the token.
const AUTH_REJECTED_DELAY: Duration = Duration::from_secs(60);
/// Quick re-dial after a session that had reached Running.
const QUICK_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Retry delay for transport-level failures, by failure count.
fn retry_delay(attempt: u32) -> Duration {
    match attempt {
        0 | 1 => Duration::ZERO,
        2..=4 => Duration::from_secs(5),
        5..=7 => Duration::from_secs(15),
        8..=10 => Duration::from_secs(30),
        11..=15 => Duration::from_secs(60),
        _ => Duration::from_secs(300),
    }
}

/// Static supervisor knobs, fixed at construction.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub api_base: String,
    pub fallback_endpoint: String,
    pub debug_mode: bool,
    pub client_version: String,
    pub relay: RelayConfig,
    pub timing: SessionTiming,
}

impl SupervisorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            api_base: config.api_base(),
            fallback_endpoint: DEFAULT_FALLBACK_ENDPOINT.to_string(),
            debug_mode: config.debug_mode,
            client_version: CLIENT_VERSION.to_string(),
            relay: RelayConfig {
                verbose_logging: config.verbose_logging,
                ..RelayConfig::default()
            },
            timing: SessionTiming::default(),
        }
    }
}

struct LiveSession {
    cancel: CancellationToken,
    writer: Arc<FrameWriter>,
    connection: quinn::Connection,
}

struct Shared {
    config: RwLock<Config>,
    store: Arc<dyn CredentialStore>,
    options: SupervisorOptions,
    status: StatusHandle,
    share_enabled: AtomicBool,
    wake: Notify,
    shutdown: CancellationToken,
    live: Mutex<Option<LiveSession>>,
    resolver: FallbackResolver,
}

/// Handle to the supervisor; cheap to clone and thread-safe.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        store: Arc<dyn CredentialStore>,
        options: SupervisorOptions,
    ) -> Self {
        let status = StatusHandle::new();
        status.set_state(SupervisorState::Idle);

        Self {
            shared: Arc::new(Shared {
                config: RwLock::new(config),
                store,
                options,
                status,
                share_enabled: AtomicBool::new(true),
                wake: Notify::new(),
                shutdown: CancellationToken::new(),
                live: Mutex::new(None),
                resolver: FallbackResolver::new(),
            }),
        }
    }

    pub fn status(&self) -> StatusHandle {
        self.shared.status.clone()
    }

    /// Whether bandwidth sharing is enabled (user intent).
    pub fn share_enabled(&self) -> bool {
        self.shared.share_enabled.load(Ordering::SeqCst)
    }

    /// Enable sharing and force a fresh connection, dropping any
    /// half-alive session.
    pub fn start(&self) {
        info!("bandwidth sharing enabled");
        self.shared.share_enabled.store(true, Ordering::SeqCst);
        self.close_live("restarting");
        self.shared.wake.notify_one();
    }

    /// Disable sharing, close the session, and tear down every
    /// sub-connection. No new session until `start()`.
    pub fn stop(&self) {
        info!("bandwidth sharing stopped");
        self.shared.share_enabled.store(false, Ordering::SeqCst);
        self.close_live("user stopped sharing");
        self.shared.status.set_state(SupervisorState::Stopped);
        self.shared.wake.notify_one();
    }

    /// Permanently end the control loop (process exit).
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.close_live("client exiting");
        self.shared.wake.notify_one();
    }

    /// Replace the config snapshot (after login/logout or a settings
    /// change). Takes effect on the next connection attempt.
    pub fn update_config(&self, config: Config) {
        *self.shared.config.write().expect("config lock poisoned") = config;
    }

    pub fn config_snapshot(&self) -> Config {
        self.shared
            .config
            .read()
            .expect("config lock poisoned")
            .clone()
    }

    /// Best-effort one-shot UID_REGISTER on the live session, used by the
    /// local auth receiver after a browser login.
    pub fn send_uid_register(&self, user_id: &str) {
        let writer = {
            let live = self.shared.live.lock().expect("live lock poisoned");
            live.as_ref().map(|l| l.writer.clone())
        };
        if let Some(writer) = writer {
            let frame = Frame::uid_register(user_id);
            tokio::spawn(async move {
                if let Err(e) = writer.write_frame(&frame).await {
                    warn!(error = %e, "uid-register send failed");
                }
            });
        }
    }

    fn close_live(&self, reason: &str) {
        let taken = {
            let mut live = self.shared.live.lock().expect("live lock poisoned");
            live.take()
        };
        if let Some(live) = taken {
            live.cancel.cancel();
            live.connection
                .close(quinn::VarInt::from_u32(0), reason.as_bytes());
        }
    }

    /// The control loop. Runs until `shutdown()`.
    pub async fn run(&self) {
        let shared = &self.shared;
        let mut attempts: u32 = 0;
        let mut auth_failures: u32 = 0;

        loop {
            if shared.shutdown.is_cancelled() {
                break;
            }

            if !self.share_enabled() {
                tokio::select! {
                    _ = shared.wake.notified() => {}
                    _ = shared.shutdown.cancelled() => break,
                }
                continue;
            }

            // Discovery
            shared.status.set_state(SupervisorState::Discovering);
            let endpoint = if shared.options.debug_mode {
                DEBUG_ENDPOINT.to_string()
            } else {
                vyx_directory::select_endpoint(
                    &shared.options.api_base,
                    &shared.options.fallback_endpoint,
                )
                .await
            };

            if attempts > 0 {
                info!(attempt = attempts + 1, endpoint = %endpoint, "connection attempt");
            } else {
                info!(endpoint = %endpoint, "connecting to exchange");
            }

            // Dial
            shared.status.set_state(SupervisorState::Dialing);
            let control = match transport::dial(&endpoint).await {
                Ok(control) => control,
                Err(e) => {
                    warn!(error = %e, "dial failed");
                    attempts += 1;
                    self.backoff(retry_delay(attempts)).await;
                    continue;
                }
            };

            // Authenticate
            shared.status.set_state(SupervisorState::Authenticating);
            let writer = FrameWriter::new(control.send);
            let mut recv = control.recv;

            let token = {
                let config = shared.config.read().expect("config lock poisoned");
                shared.store.token(&config.user_id).ok()
            };

            let user = match auth::authenticate(
                &writer,
                &mut recv,
                token.as_deref(),
                &shared.options.client_version,
            )
            .await
            {
                Ok(user) => user,
                Err(e) => {
                    control
                        .connection
                        .close(quinn::VarInt::from_u32(1), b"authentication failed");
                    attempts += 1;
                    let delay = match &e {
                        SessionError::NotLoggedIn => {
                            info!("not signed in, waiting for login");
                            NOT_LOGGED_IN_DELAY
                        }
                        SessionError::AuthRejected(reason) => {
                            auth_failures += 1;
                            warn!(
                                reason = %reason,
                                consecutive = auth_failures,
                                "authentication failed"
                            );
                            AUTH_REJECTED_DELAY
                        }
                        other => {
                            warn!(error = %other, "handshake failed");
                            retry_delay(attempts)
                        }
                    };
                    self.backoff(delay).await;
                    continue;
                }
            };

            // Running
            attempts = 0;
            auth_failures = 0;
            info!(user = %user, endpoint = %endpoint, "authenticated, session running");
            shared.status.session_started(&endpoint, &user);

            let session_cancel = CancellationToken::new();
            {
                let mut live = shared.live.lock().expect("live lock poisoned");
                *live = Some(LiveSession {
                    cancel: session_cancel.clone(),
                    writer: writer.clone(),
                    connection: control.connection.clone(),
                });
            }

            let engine = RelayEngine::new(
                writer.clone(),
                shared.resolver.clone(),
                shared.status.clone(),
                shared.options.relay.clone(),
            );

            let result = run_session(
                recv,
                engine,
                writer,
                session_cancel,
                shared.options.timing.clone(),
            )
            .await;

            // Teardown
            {
                let mut live = shared.live.lock().expect("live lock poisoned");
                *live = None;
            }
            control
                .connection
                .close(quinn::VarInt::from_u32(0), b"session ended");
            shared.status.session_ended();

            match &result {
                Ok(()) => info!("session closed"),
                Err(e) => warn!(error = %e, "session lost"),
            }

            if !self.share_enabled() {
                continue;
            }

            // Any session that reached Running earns one quick re-dial;
            // the attempt counter was reset at auth, so a failure streak
            // after this re-enters the schedule from the top.
            self.backoff(QUICK_RETRY_DELAY).await;
        }

        shared.status.set_state(SupervisorState::Stopped);
    }

    /// Sleep through a backoff period; `start()` and `shutdown()` cut it
    /// short.
    async fn backoff(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        self.shared.status.set_state(SupervisorState::Backoff);
        info!(delay_secs = delay.as_secs(), "backing off before retry");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shared.wake.notified() => {}
            _ = self.shared.shutdown.cancelled() => {}
        }
    }
}
