//! Running-session loop: frame dispatch and health monitoring.
//!
//! The reader owns the control stream's receive half. It accumulates
//! bytes and drains complete frames, so the per-read liveness deadline
//! can fire mid-frame without losing the prefix. The health monitor
//! watches time-since-last-inbound-frame and declares the session dead
//! well before the transport idle timeout would.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vyx_proto::{
    Frame, ParseResult, TYPE_CLOSE, TYPE_CONNECT, TYPE_DATA, TYPE_PING,
};

use crate::error::SessionError;
use crate::relay::RelayEngine;
use crate::transport::FrameWriter;

/// Session timing knobs. Defaults follow the production values; tests
/// shrink them to keep wall-clock time down.
#[derive(Debug, Clone)]
pub struct SessionTiming {
    /// Per-read deadline. A timeout is a liveness probe, not an error.
    pub read_timeout: Duration,
    /// Health monitor cadence.
    pub health_tick: Duration,
    /// Idle span that earns a staleness warning.
    pub warn_after: Duration,
    /// Idle span after which the session is declared dead.
    pub dead_after: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(60),
            health_tick: Duration::from_secs(30),
            warn_after: Duration::from_secs(3 * 60),
            dead_after: Duration::from_secs(10 * 60),
        }
    }
}

/// Drive an authenticated session until it ends.
///
/// Returns `Ok(())` when `cancel` fired (user stop), otherwise the error
/// that killed the session. All sub-connections are torn down before
/// returning, whatever the exit path.
pub async fn run_session<R>(
    mut recv: R,
    engine: RelayEngine,
    writer: Arc<FrameWriter>,
    cancel: CancellationToken,
    timing: SessionTiming,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    let last_inbound = Arc::new(Mutex::new(Instant::now()));

    let result = tokio::select! {
        biased;

        () = cancel.cancelled() => {
            info!("session cancelled");
            Ok(())
        }
        err = health_monitor(last_inbound.clone(), timing.clone()) => Err(err),
        res = reader_loop(&mut recv, &engine, &writer, &last_inbound, &timing) => res,
    };

    engine.clear_all().await;
    result
}

/// Watch for inbound silence. Resolves only when the session is dead.
async fn health_monitor(
    last_inbound: Arc<Mutex<Instant>>,
    timing: SessionTiming,
) -> SessionError {
    let mut ticker = tokio::time::interval(timing.health_tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let idle = last_inbound
            .lock()
            .expect("health lock poisoned")
            .elapsed();

        if idle > timing.dead_after {
            warn!(idle_secs = idle.as_secs(), "session presumed dead");
            return SessionError::HealthStale(idle.as_secs());
        }
        if idle > timing.warn_after {
            warn!(idle_secs = idle.as_secs(), "no inbound frames, session may be stale");
        }
    }
}

async fn reader_loop<R>(
    recv: &mut R,
    engine: &RelayEngine,
    writer: &FrameWriter,
    last_inbound: &Mutex<Instant>,
    timing: &SessionTiming,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut acc = BytesMut::with_capacity(64 * 1024);
    let mut chunk = vec![0u8; 64 * 1024];

    loop {
        // Drain every complete frame before reading more.
        loop {
            match vyx_proto::parse_frame(&acc) {
                ParseResult::Complete { frame, consumed } => {
                    acc.advance(consumed);
                    *last_inbound.lock().expect("health lock poisoned") = Instant::now();
                    dispatch(frame, engine, writer).await?;
                }
                ParseResult::Incomplete(_) => break,
                ParseResult::Oversize(n) => {
                    return Err(SessionError::Stream(vyx_proto::ReadError::DataTooLarge(n)));
                }
            }
        }

        match tokio::time::timeout(timing.read_timeout, recv.read(&mut chunk)).await {
            // Idle gap; keep the partial frame and try again.
            Err(_) => continue,
            Ok(Ok(0)) => {
                return Err(SessionError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "control stream closed by peer",
                )));
            }
            Ok(Ok(n)) => acc.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(SessionError::Io(e)),
        }
    }
}

/// Route one inbound frame.
///
/// Only PING handling can fail: its PONG rides the shared writer, and a
/// writer failure is session-fatal.
async fn dispatch(
    frame: Frame,
    engine: &RelayEngine,
    writer: &FrameWriter,
) -> Result<(), SessionError> {
    match frame.frame_type {
        TYPE_CONNECT => {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine.handle_connect(frame.id, frame.addr, frame.data).await;
            });
        }
        TYPE_DATA => {
            engine.dispatch_data(&frame.id, frame.data);
        }
        TYPE_CLOSE => {
            engine.handle_close(&frame.id).await;
        }
        TYPE_PING => {
            debug!(id = %frame.id, "ping");
            writer.write_frame(&Frame::pong(frame.id)).await?;
        }
        other => {
            warn!(
                frame_type = other,
                name = vyx_proto::type_name(other),
                "ignoring unexpected frame type"
            );
        }
    }
    Ok(())
}
