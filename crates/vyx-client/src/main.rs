use std::sync::Arc;

use clap::Parser;
use tracing::info;
use vyx_client::cli::{Args, Command, init_tracing};
use vyx_client::platform::InstanceLock;
use vyx_client::{account, run_agent};
use vyx_config::{Config, CredentialStore, KeyringStore, LoggingConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .expect("failed to install default crypto provider");

    let args = Args::parse();

    let store: Arc<dyn CredentialStore> = Arc::new(KeyringStore::new());
    let config_path = vyx_config::config_path()?;
    let mut config = vyx_config::load_config(&config_path, store.as_ref())?;

    if args.verbose {
        config.verbose_logging = true;
    }
    init_tracing(&LoggingConfig {
        level: args.log_level.clone().or_else(|| {
            config.verbose_logging.then(|| "debug".to_string())
        }),
        format: args.log_format.clone(),
        output: None,
    });

    match args.command.unwrap_or(Command::Run) {
        Command::Run => run(config, store).await,
        Command::Login { email, password } => {
            let response = account::login(&config.api_base(), &email, &password).await?;
            account::persist_login(&mut config, store.as_ref(), &response)?;
            println!("Signed in as {}", response.user.email);
            Ok(())
        }
        Command::Register { email, password } => {
            let response = account::register(&config.api_base(), &email, &password).await?;
            account::persist_login(&mut config, store.as_ref(), &response)?;
            println!("Account created, signed in as {}", response.user.email);
            Ok(())
        }
        Command::Logout => {
            account::logout(&mut config, store.as_ref())?;
            println!("Signed out");
            Ok(())
        }
    }
}

async fn run(
    config: Config,
    store: Arc<dyn CredentialStore>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(version = env!("CARGO_PKG_VERSION"), "vyx client starting");

    // One agent per machine, or the device shows up twice on the
    // dashboard.
    let lock = InstanceLock::acquire(&vyx_config::config_dir()?)?;

    let result = run_agent(config, store).await;

    lock.release();
    info!("vyx client stopped");
    result
}
