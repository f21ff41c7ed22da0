//! Vyx client binary: CLI, platform glue, and wiring around the session
//! core. The core never touches the filesystem, keychain, or browser —
//! everything OS-shaped lives here.

pub mod account;
pub mod auth_receiver;
pub mod cli;
pub mod platform;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vyx_config::{Config, CredentialStore};
use vyx_session::{Supervisor, SupervisorOptions, SupervisorState};

/// Cadence of the status ticker standing in for the tray refresh.
const STATUS_TICK: Duration = Duration::from_secs(2);

/// Run the agent until a shutdown signal.
pub async fn run_agent(
    config: Config,
    store: Arc<dyn CredentialStore>,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = SupervisorOptions::from_config(&config);
    let logged_in = vyx_config::is_logged_in(&config, store.as_ref());
    let debug_mode = config.debug_mode;
    let api_base = config.api_base();

    sync_autostart(&config);

    let supervisor = Supervisor::new(config, store.clone(), options);

    let runner = supervisor.clone();
    let run_handle = tokio::spawn(async move { runner.run().await });

    let status_cancel = CancellationToken::new();
    tokio::spawn(status_ticker(supervisor.clone(), status_cancel.clone()));

    // First-time setup: open the browser login flow once the loop is up.
    if !logged_in {
        info!("not signed in, starting browser login");
        let login_supervisor = supervisor.clone();
        let login_store = store.clone();
        tokio::spawn(async move {
            if let Err(e) =
                browser_login(&api_base, debug_mode, &login_supervisor, login_store).await
            {
                warn!(error = %e, "browser login failed; sign in from the dashboard instead");
            }
        });
    }

    cli::shutdown_signal().await;
    info!("shutdown signal received");

    status_cancel.cancel();
    supervisor.shutdown();
    let _ = run_handle.await;
    Ok(())
}

/// Log state transitions for whoever is watching the process output.
/// The tray collaborator consumes the same snapshots through
/// [`Supervisor::status`].
async fn status_ticker(supervisor: Supervisor, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(STATUS_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_state = SupervisorState::Idle;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let snap = supervisor.status().snapshot();
                if snap.state != last_state {
                    info!(
                        state = %snap.state,
                        server = snap.server_address.as_deref().unwrap_or("-"),
                        connections = snap.active_subconnections,
                        "status changed"
                    );
                    last_state = snap.state;
                }
            }
        }
    }
}

/// Apply the autostart preference. Best-effort: a failure is logged, not
/// fatal.
fn sync_autostart(config: &Config) {
    let result = if config.auto_start_enabled() {
        platform::autostart::enable()
    } else {
        platform::autostart::disable()
    };
    if let Err(e) = result {
        warn!(error = %e, "autostart registration failed");
    }
}

/// Drive the browser-based login: start the local receiver, open the
/// dashboard, wait for it to post credentials back, then persist them
/// and kick the supervisor.
async fn browser_login(
    api_base: &str,
    debug_mode: bool,
    supervisor: &Supervisor,
    store: Arc<dyn CredentialStore>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let receiver = auth_receiver::start(debug_mode).await?;
    let login_url = format!("{api_base}/login?client_port={}", receiver.port);
    platform::browser::open(&login_url);

    let Some(result) = receiver.wait().await else {
        return Err("login window timed out".into());
    };

    store.save_token(&result.user_id, &result.token)?;

    let mut config = supervisor.config_snapshot();
    config.user_id = result.user_id.clone();
    config.email = result.email.clone();
    vyx_config::save_config(&vyx_config::config_path()?, &config)?;
    supervisor.update_config(config);

    info!(email = %result.email, "signed in");
    supervisor.send_uid_register(&result.user_id);
    supervisor.start();
    Ok(())
}
