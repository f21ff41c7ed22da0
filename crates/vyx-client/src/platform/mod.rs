//! Platform wrappers: single-instance lock, autostart, browser opener.

pub mod autostart;
pub mod browser;
pub mod instance_lock;

pub use instance_lock::{InstanceLock, InstanceLockError};
