//! Default configuration values.

/// Default exchange API host when the config file does not name one.
pub const DEFAULT_SERVER_URL: &str = "proxy.vyx.network";

/// Static exchange endpoint used when discovery fails entirely.
pub const DEFAULT_FALLBACK_ENDPOINT: &str = "us.vyx.network:8443";

/// Credential-store service name; entries are keyed `(service, user_id)`.
pub const CREDENTIAL_SERVICE: &str = "vyx-proxy-client";

/// Exchange endpoint used in debug mode (local development servers).
pub const DEBUG_ENDPOINT: &str = "127.0.0.1:8443";
/// API base used in debug mode.
pub const DEBUG_API_BASE: &str = "http://127.0.0.1:8080";

/// Client version reported in the auth handshake metadata.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}
