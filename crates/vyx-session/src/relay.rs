//! Relay engine: sub-connection lifecycle and byte shuttling.
//!
//! For every `CONNECT` demand the engine dials the destination, registers
//! a sub-connection, confirms with `CONNECTED`, and runs two tasks: one
//! pumping socket reads into `DATA` frames, one draining the bounded
//! inbound queue into socket writes. All teardown paths funnel through a
//! single removal point so each registered sub-connection emits exactly
//! one outbound `CLOSE`, no matter how it dies.
//!
//! Failures here are strictly per-sub-connection: a bad destination can
//! never end the session.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vyx_dns::FallbackResolver;
use vyx_proto::Frame;

use crate::status::StatusHandle;
use crate::transport::FrameWriter;

/// Destination socket buffer size. Sized for high-BDP paths: the agent
/// typically sits ~200 ms from the exchange.
const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;
/// Destination TCP keepalive period.
const SOCKET_KEEPALIVE: Duration = Duration::from_secs(30);

/// Relay engine tunables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Hard cap on simultaneous sub-connections; `CONNECT` beyond it is
    /// answered with an immediate `CLOSE`.
    pub max_subconnections: usize,
    /// Inbound queue depth per sub-connection, counted in byte-slices.
    /// Bounds what one slow destination can pin in memory.
    pub inbound_queue_capacity: usize,
    /// Socket read buffer for the outbound relay.
    pub read_buffer_size: usize,
    /// Log destination addresses. Off by default: they identify the
    /// proxy user's traffic.
    pub verbose_logging: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_subconnections: 1024,
            inbound_queue_capacity: 10_000,
            read_buffer_size: 256 * 1024,
            verbose_logging: false,
        }
    }
}

/// Result of offering a `DATA` payload to a sub-connection queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// Queue full; the payload was dropped. The session's own flow
    /// control is the real backpressure — buffering further here only
    /// defers OOM.
    Dropped,
    /// No sub-connection with that id (already closed, or never dialed).
    Unknown,
}

struct SubConn {
    tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    /// Registration generation. Relay-task cleanup removes the entry
    /// only when the generation still matches, so a task from a
    /// replaced registration can never tear down its successor.
    generation: u64,
}

/// Cheaply-cloneable relay engine handle.
#[derive(Clone)]
pub struct RelayEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    table: RwLock<HashMap<String, SubConn>>,
    writer: Arc<FrameWriter>,
    resolver: FallbackResolver,
    status: StatusHandle,
    config: RelayConfig,
    next_generation: std::sync::atomic::AtomicU64,
}

impl RelayEngine {
    pub fn new(
        writer: Arc<FrameWriter>,
        resolver: FallbackResolver,
        status: StatusHandle,
        config: RelayConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                table: RwLock::new(HashMap::new()),
                writer,
                resolver,
                status,
                config,
                next_generation: std::sync::atomic::AtomicU64::new(0),
            }),
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.table.read().expect("relay table poisoned").len()
    }

    /// Handle one inbound `CONNECT`. Spawned per demand by the reader.
    pub async fn handle_connect(&self, id: String, addr: String, initial_data: Vec<u8>) {
        if self.active_count() >= self.inner.config.max_subconnections {
            warn!(
                limit = self.inner.config.max_subconnections,
                "sub-connection cap reached, refusing connect"
            );
            let _ = self.inner.writer.write_frame(&Frame::close(&id)).await;
            return;
        }

        let stream = match vyx_dns::dial_with_fallback(&addr, &self.inner.resolver).await {
            Ok(stream) => stream,
            Err(e) => {
                if self.inner.config.verbose_logging {
                    warn!(addr = %addr, error = %e, "destination dial failed");
                } else {
                    warn!(error = %e, "destination dial failed");
                }
                let _ = self.inner.writer.write_frame(&Frame::close(&id)).await;
                return;
            }
        };

        tune_socket(&stream);

        let (tx, rx) = mpsc::channel(self.inner.config.inbound_queue_capacity);
        let cancel = CancellationToken::new();
        let generation = self.register(&id, tx, cancel.clone());

        if self
            .inner
            .writer
            .write_frame(&Frame::connected(&id))
            .await
            .is_err()
        {
            self.tear_down(&id).await;
            return;
        }

        let mut stream = stream;
        if !initial_data.is_empty() && stream.write_all(&initial_data).await.is_err() {
            warn!("failed to write initial payload");
            self.tear_down(&id).await;
            return;
        }

        let (read_half, write_half) = stream.into_split();

        let engine = self.clone();
        let task_id = id.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            outbound_relay(engine, task_id, generation, read_half, task_cancel).await;
        });

        let engine = self.clone();
        tokio::spawn(async move {
            inbound_relay(engine, id, generation, write_half, rx, cancel).await;
        });
    }

    /// Offer a `DATA` payload to a sub-connection's inbound queue.
    ///
    /// Non-blocking by design: the reader must never stall on one slow
    /// destination.
    pub fn dispatch_data(&self, id: &str, data: Vec<u8>) -> DispatchOutcome {
        let table = self.inner.table.read().expect("relay table poisoned");
        let Some(sub) = table.get(id) else {
            debug!(id = %id, "data for unknown sub-connection");
            return DispatchOutcome::Unknown;
        };

        match sub.tx.try_send(data) {
            Ok(()) => DispatchOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(id = %id, "inbound queue full, dropping payload");
                DispatchOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(id = %id, "data for closing sub-connection");
                DispatchOutcome::Unknown
            }
        }
    }

    /// Inbound `CLOSE` from the exchange. Idempotent.
    pub async fn handle_close(&self, id: &str) {
        self.tear_down(id).await;
    }

    /// Remove, cancel, and announce one sub-connection.
    ///
    /// The single removal point: whichever caller wins the removal emits
    /// the one outbound `CLOSE`; later callers are no-ops. The write may
    /// fail silently during session teardown — the writer may already be
    /// gone, and that is fine.
    pub async fn tear_down(&self, id: &str) -> bool {
        self.remove_and_close(id, None).await
    }

    /// Relay-task cleanup: removes only the registration the task
    /// belongs to.
    async fn tear_down_generation(&self, id: &str, generation: u64) -> bool {
        self.remove_and_close(id, Some(generation)).await
    }

    async fn remove_and_close(&self, id: &str, expect_generation: Option<u64>) -> bool {
        let removed = {
            let mut table = self.inner.table.write().expect("relay table poisoned");
            match table.get(id) {
                Some(sub) if expect_generation.is_none_or(|g| sub.generation == g) => {
                    table.remove(id)
                }
                _ => None,
            }
        };

        match removed {
            Some(sub) => {
                sub.cancel.cancel();
                self.inner.status.subconn_closed();
                let _ = self.inner.writer.write_frame(&Frame::close(id)).await;
                true
            }
            None => false,
        }
    }

    /// Tear down every sub-connection (session ended or user stop).
    pub async fn clear_all(&self) {
        let ids: Vec<String> = {
            let table = self.inner.table.read().expect("relay table poisoned");
            table.keys().cloned().collect()
        };

        for id in ids {
            self.tear_down(&id).await;
        }
    }

    fn register(&self, id: &str, tx: mpsc::Sender<Vec<u8>>, cancel: CancellationToken) -> u64 {
        let generation = self
            .inner
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let mut table = self.inner.table.write().expect("relay table poisoned");
        // Server-assigned ids are unique within a session; if one ever
        // repeats, the stale entry loses.
        let entry = SubConn {
            tx,
            cancel,
            generation,
        };
        if let Some(old) = table.insert(id.to_string(), entry) {
            warn!(id = %id, "duplicate sub-connection id, replacing");
            old.cancel.cancel();
        } else {
            self.inner.status.subconn_opened();
        }
        generation
    }

    #[cfg(test)]
    fn register_for_test(&self, id: &str, tx: mpsc::Sender<Vec<u8>>) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.register(id, tx, cancel.clone());
        cancel
    }
}

/// Socket → control stream. Each read becomes one `DATA` frame.
async fn outbound_relay(
    engine: RelayEngine,
    id: String,
    generation: u64,
    mut read_half: OwnedReadHalf,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; engine.inner.config.read_buffer_size];

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            result = read_half.read(&mut buf) => {
                let n = match result {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                let frame = Frame::data(id.clone(), buf[..n].to_vec());
                if engine.inner.writer.write_frame(&frame).await.is_err() {
                    // Writer is shared: this failure also ends the
                    // session via the reader; here it only ends us.
                    break;
                }
                engine.inner.status.add_bytes_up(n as u64);
            }
        }
    }

    engine.tear_down_generation(&id, generation).await;
}

/// Inbound queue → socket.
async fn inbound_relay(
    engine: RelayEngine,
    id: String,
    generation: u64,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            received = rx.recv() => {
                let data = match received {
                    None => break,
                    Some(data) => data,
                };
                if data.is_empty() {
                    continue;
                }
                if write_half.write_all(&data).await.is_err() {
                    break;
                }
                engine.inner.status.add_bytes_down(data.len() as u64);
            }
        }
    }

    engine.tear_down_generation(&id, generation).await;
}

/// Apply destination socket tuning. Advisory: a kernel that clamps or
/// refuses a knob does not fail the connect.
fn tune_socket(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }

    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!(error = %e, "set_recv_buffer_size failed");
    }
    if let Err(e) = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!(error = %e, "set_send_buffer_size failed");
    }
    let keepalive = TcpKeepalive::new().with_time(SOCKET_KEEPALIVE);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        debug!(error = %e, "set_tcp_keepalive failed");
    }
}
