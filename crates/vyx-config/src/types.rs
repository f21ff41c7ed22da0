//! Configuration type definitions.

use serde::{Deserialize, Serialize};

use crate::defaults::default_server_url;

/// On-disk client configuration.
///
/// The bearer token is deliberately absent: it is stored in the OS
/// credential store, never in this file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Exchange API host, with or without an `https://` prefix.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Authenticated user id; empty until first login.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_id: String,

    /// Account email, kept for display only.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,

    /// When false (the default), relay logs omit destination addresses.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub verbose_logging: bool,

    /// Start on boot. Absent means enabled; a pointer-style option so an
    /// explicit `false` survives round trips.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_start: Option<bool>,

    /// Target local development servers and skip discovery.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub debug_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            user_id: String::new(),
            email: String::new(),
            verbose_logging: false,
            auto_start: None,
            debug_mode: false,
        }
    }
}

impl Config {
    /// Autostart preference; absent means enabled.
    pub fn auto_start_enabled(&self) -> bool {
        self.auto_start.unwrap_or(true)
    }

    /// The API base with a scheme, defaulting to https.
    ///
    /// Debug mode targets the local development API, the same switch
    /// that points the session at the local exchange endpoint.
    pub fn api_base(&self) -> String {
        if self.debug_mode {
            return crate::defaults::DEBUG_API_BASE.to_string();
        }
        if self.server_url.starts_with("http://") || self.server_url.starts_with("https://") {
            self.server_url.clone()
        } else {
            format!("https://{}", self.server_url)
        }
    }
}

/// Logging configuration assembled by the CLI (not part of the config file).
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Base level directive, e.g. "info" or "vyx_session=debug".
    pub level: Option<String>,
    /// "pretty" (default), "compact", or "json".
    pub format: Option<String>,
    /// "stderr" (default) or "stdout".
    pub output: Option<String>,
}
