//! Configuration and credential storage for the Vyx client.
//!
//! The config file is plain JSON under the user's home directory and never
//! contains the bearer token; that lives in the OS credential store
//! (Keychain, Credential Manager, Secret Service) keyed by user id. Legacy
//! config files that still carry a plaintext `api_token` field are migrated
//! into the credential store on first load.

pub mod defaults;
pub mod error;
pub mod loader;
pub mod secure;
pub mod types;

pub use error::{ConfigError, CredentialError};
pub use loader::{config_dir, config_path, is_logged_in, load_config, save_config};
pub use secure::{CredentialStore, KeyringStore, MemoryStore};
pub use types::{Config, LoggingConfig};
