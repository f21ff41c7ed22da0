//! Configuration and credential errors.

/// Errors from config file handling.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("no home directory available")]
    NoHomeDir,
}

/// Errors from the OS credential store.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// No token stored for this user.
    #[error("no credential stored for user {0}")]
    NotFound(String),

    /// Backend failure (locked keychain, missing secret service, ...).
    #[error("credential store error: {0}")]
    Backend(String),
}
