//! Supervisor state and the status snapshot surfaced to the UI.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

/// Supervisor control-loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Discovering,
    Dialing,
    Authenticating,
    Running,
    Backoff,
    Stopped,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Discovering => "discovering",
            Self::Dialing => "dialing",
            Self::Authenticating => "authenticating",
            Self::Running => "running",
            Self::Backoff => "backoff",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the agent for the tray/status collaborator.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub state: SupervisorState,
    /// Exchange address, present while a session exists.
    pub server_address: Option<String>,
    /// Display name from AUTH_SUCCESS, present while authenticated.
    pub authenticated_as: Option<String>,
    /// When the current session reached Running.
    pub connected_at: Option<SystemTime>,
    pub active_subconnections: usize,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

#[derive(Debug, Default)]
struct SessionFields {
    state: Option<SupervisorState>,
    server_address: Option<String>,
    authenticated_as: Option<String>,
    connected_at: Option<SystemTime>,
}

/// Cheaply-cloneable handle that every component updates in place.
///
/// Counters are atomics so the relay hot path never takes the mutex; the
/// mutex guards only the rarely-written session identity fields.
#[derive(Debug, Clone, Default)]
pub struct StatusHandle {
    inner: Arc<StatusInner>,
}

#[derive(Debug, Default)]
struct StatusInner {
    fields: Mutex<SessionFields>,
    active: AtomicUsize,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

impl StatusHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, state: SupervisorState) {
        let mut fields = self.inner.fields.lock().expect("status lock poisoned");
        fields.state = Some(state);
    }

    /// Record a session reaching Running.
    pub fn session_started(&self, server_address: &str, authenticated_as: &str) {
        let mut fields = self.inner.fields.lock().expect("status lock poisoned");
        fields.state = Some(SupervisorState::Running);
        fields.server_address = Some(server_address.to_string());
        fields.authenticated_as = Some(authenticated_as.to_string());
        fields.connected_at = Some(SystemTime::now());
    }

    /// Clear session identity after teardown; counters survive (they are
    /// cumulative across sessions).
    pub fn session_ended(&self) {
        let mut fields = self.inner.fields.lock().expect("status lock poisoned");
        fields.server_address = None;
        fields.authenticated_as = None;
        fields.connected_at = None;
    }

    pub fn subconn_opened(&self) {
        self.inner.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subconn_closed(&self) {
        self.inner.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_bytes_up(&self, n: u64) {
        self.inner.bytes_up.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_down(&self, n: u64) {
        self.inner.bytes_down.fetch_add(n, Ordering::Relaxed);
    }

    pub fn active_subconnections(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let fields = self.inner.fields.lock().expect("status lock poisoned");
        StatusSnapshot {
            state: fields.state.unwrap_or(SupervisorState::Idle),
            server_address: fields.server_address.clone(),
            authenticated_as: fields.authenticated_as.clone(),
            connected_at: fields.connected_at,
            active_subconnections: self.inner.active.load(Ordering::Relaxed),
            bytes_up: self.inner.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.inner.bytes_down.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_tracks_session_lifecycle() {
        let status = StatusHandle::new();
        assert_eq!(status.snapshot().state, SupervisorState::Idle);

        status.set_state(SupervisorState::Dialing);
        assert_eq!(status.snapshot().state, SupervisorState::Dialing);

        status.session_started("a.example:8443", "alice");
        let snap = status.snapshot();
        assert_eq!(snap.state, SupervisorState::Running);
        assert_eq!(snap.server_address.as_deref(), Some("a.example:8443"));
        assert_eq!(snap.authenticated_as.as_deref(), Some("alice"));
        assert!(snap.connected_at.is_some());

        status.subconn_opened();
        status.add_bytes_up(100);
        status.add_bytes_down(50);
        let snap = status.snapshot();
        assert_eq!(snap.active_subconnections, 1);
        assert_eq!(snap.bytes_up, 100);
        assert_eq!(snap.bytes_down, 50);

        status.subconn_closed();
        status.session_ended();
        let snap = status.snapshot();
        assert_eq!(snap.active_subconnections, 0);
        assert!(snap.server_address.is_none());
        // Byte counters are cumulative across sessions.
        assert_eq!(snap.bytes_up, 100);
    }
}
