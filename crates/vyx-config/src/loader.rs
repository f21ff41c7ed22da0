//! Config file load/save with legacy token migration.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;
use crate::secure::CredentialStore;
use crate::types::Config;

/// Per-user configuration directory (`<home>/.vyx`).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".vyx"))
        .ok_or(ConfigError::NoHomeDir)
}

/// Path of the config file (`<home>/.vyx/config.json`).
pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json"))
}

/// Shape of the legacy plaintext token field, parsed separately so the
/// public `Config` type never carries a token.
#[derive(Deserialize)]
struct LegacyToken {
    #[serde(default)]
    api_token: String,
}

/// Load the config file, creating a default one if missing.
///
/// If the file still carries a legacy plaintext `api_token`, the token is
/// moved into the credential store and the file is rewritten without it.
pub fn load_config(path: &Path, store: &dyn CredentialStore) -> Result<Config, ConfigError> {
    if !path.exists() {
        let config = Config::default();
        save_config(path, &config)?;
        return Ok(config);
    }

    let data = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&data)?;

    if let Ok(legacy) = serde_json::from_str::<LegacyToken>(&data) {
        if !legacy.api_token.is_empty() && !config.user_id.is_empty() {
            warn!("migrating plaintext token from config file to credential store");
            match store.save_token(&config.user_id, &legacy.api_token) {
                // Rewrite strips the plaintext field.
                Ok(()) => save_config(path, &config)?,
                Err(e) => warn!(error = %e, "token migration failed, leaving config untouched"),
            }
        }
    }

    Ok(config)
}

/// Write the config file with owner-only permissions.
pub fn save_config(path: &Path, config: &Config) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

/// Whether a user is signed in: an identity in the config and a token in
/// the credential store.
pub fn is_logged_in(config: &Config, store: &dyn CredentialStore) -> bool {
    !config.user_id.is_empty() && store.has_token(&config.user_id)
}
