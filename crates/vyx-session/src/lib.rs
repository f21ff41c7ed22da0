//! Session core of the Vyx bandwidth-sharing agent.
//!
//! One authenticated QUIC session to an exchange server carries a single
//! bidirectional control stream; the exchange multiplexes third-party TCP
//! relay demands over it as frames. This crate owns that whole lifecycle:
//!
//! - [`transport`] — dialing, TLS profile, transport tuning, and the
//!   serialized control-stream writer
//! - [`auth`] — the one-shot token handshake
//! - [`relay`] — per-sub-connection dialing, byte shuttling, teardown
//! - [`session`] — the frame dispatch loop and health monitor
//! - [`supervisor`] — enable/disable gating, reconnect backoff, status
//!
//! Everything outside (tray, autostart, credential prompts) talks to the
//! core through [`Supervisor`] and [`StatusSnapshot`] only.

pub mod auth;
pub mod error;
pub mod relay;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod transport;

pub use error::SessionError;
pub use relay::{DispatchOutcome, RelayConfig, RelayEngine};
pub use session::{SessionTiming, run_session};
pub use status::{StatusHandle, StatusSnapshot, SupervisorState};
pub use supervisor::{Supervisor, SupervisorOptions};
pub use transport::{ControlStream, FrameWriter, dial};
