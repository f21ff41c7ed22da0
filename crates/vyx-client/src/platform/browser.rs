//! Best-effort browser opener for the login flow.

use tracing::{info, warn};

/// Open `url` in the default browser. Never fails: a machine without a
/// browser just logs the URL for the user to copy.
pub fn open(url: &str) {
    info!(url = %url, "opening browser for login");
    if let Err(e) = open::that_detached(url) {
        warn!(error = %e, url = %url, "could not open browser, open the URL manually");
    }
}
