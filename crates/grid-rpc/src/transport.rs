//! Transport contract and an in-memory transport.
//!
//! The RPC core consumes a [`Transport`]: ordered, reliable delivery of
//! encoded frames, a drain future for sender-side backpressure, an
//! at-most-once disconnect signal, and helpers to (de)serialize error
//! objects to opaque payloads.
//!
//! [`MemoryPipe`] provides a connected endpoint pair over channels with
//! byte-counted buffers, used by tests and by anything wiring a client
//! and a server in one process.

use std::future::Future;
use std::pin::{pin, Pin};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::Notify;

use grid_common::constants::{DEFAULT_BUFFER_TIMEOUT_MS, DEFAULT_HIGH_WATER_MARK};
use grid_common::{EngineError, EngineResult};
use grid_proto::Message;

use super::cancel::{CancelSignal, CancelSource};

/// Contract between the RPC core and a message transport.
///
/// The core only awaits `wait_to_drain` while writing the streaming tail
/// of a call or response; non-streamed sends proceed without waiting.
pub trait Transport: Send + Sync {
    /// Sends one message. Errors from here are tagged as transport
    /// errors and are never re-encoded as wire errors.
    fn send_message(
        &self,
        msg: Message,
    ) -> Pin<Box<dyn Future<Output = EngineResult<()>> + Send + '_>>;

    /// Returns `None` when the local send buffer is below the high-water
    /// mark, else a future that resolves when it drains.
    fn wait_to_drain(&self) -> Option<Pin<Box<dyn Future<Output = ()> + Send>>>;

    /// Returns the connection's disconnect signal (fires at most once
    /// with a reason).
    fn disconnect_signal(&self) -> CancelSignal;

    /// Serializes an error object to an opaque payload.
    fn encode_error(&self, error: &EngineError) -> Value {
        error.to_wire()
    }

    /// Reconstructs an error object from an opaque payload.
    fn decode_error(&self, payload: &Value) -> EngineError {
        EngineError::from_wire(payload)
    }
}

/// Configuration for an in-memory pipe.
#[derive(Debug, Clone)]
pub struct PipeConfig {
    /// Send-buffer size above which `wait_to_drain` returns a future.
    pub high_water_mark: usize,
    /// Poll fallback for drain bookkeeping.
    pub buffer_timeout: Duration,
}

impl Default for PipeConfig {
    fn default() -> Self {
        PipeConfig {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            buffer_timeout: Duration::from_millis(DEFAULT_BUFFER_TIMEOUT_MS),
        }
    }
}

impl PipeConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the high-water mark.
    #[must_use]
    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.high_water_mark = bytes;
        self
    }

    /// Sets the drain poll fallback.
    #[must_use]
    pub fn buffer_timeout(mut self, timeout: Duration) -> Self {
        self.buffer_timeout = timeout;
        self
    }
}

/// Byte accounting for one direction of a pipe.
struct BufferGauge {
    bytes: AtomicUsize,
    notify: Notify,
    config: PipeConfig,
}

impl BufferGauge {
    fn new(config: PipeConfig) -> Arc<Self> {
        Arc::new(BufferGauge {
            bytes: AtomicUsize::new(0),
            notify: Notify::new(),
            config,
        })
    }

    fn add(&self, n: usize) {
        self.bytes.fetch_add(n, Ordering::SeqCst);
    }

    fn sub(&self, n: usize) {
        let before = self.bytes.fetch_sub(n, Ordering::SeqCst);
        if before.saturating_sub(n) < self.config.high_water_mark {
            self.notify.notify_waiters();
        }
    }

    fn is_full(&self) -> bool {
        self.bytes.load(Ordering::SeqCst) >= self.config.high_water_mark
    }

    async fn drained(self: Arc<Self>) {
        loop {
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();
            if !self.is_full() {
                return;
            }
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep(self.config.buffer_timeout) => {}
            }
        }
    }
}

/// An in-memory connected endpoint pair.
///
/// Frames sent from one endpoint arrive, encoded, at the other
/// endpoint's [`PipeEndpoint::recv`].
pub struct MemoryPipe;

impl MemoryPipe {
    /// Creates a connected pair with the default configuration.
    #[must_use]
    pub fn pair() -> (Arc<PipeEndpoint>, Arc<PipeEndpoint>) {
        Self::pair_with(PipeConfig::default())
    }

    /// Creates a connected pair with the given configuration.
    #[must_use]
    pub fn pair_with(config: PipeConfig) -> (Arc<PipeEndpoint>, Arc<PipeEndpoint>) {
        let (a_to_b_tx, a_to_b_rx) = mpsc::unbounded_channel();
        let (b_to_a_tx, b_to_a_rx) = mpsc::unbounded_channel();
        let a_to_b_gauge = BufferGauge::new(config.clone());
        let b_to_a_gauge = BufferGauge::new(config);
        let disconnect = Arc::new(CancelSource::new());

        let a = Arc::new(PipeEndpoint {
            outbox: a_to_b_tx,
            inbox: TokioMutex::new(b_to_a_rx),
            outbound: Arc::clone(&a_to_b_gauge),
            inbound: Arc::clone(&b_to_a_gauge),
            disconnect: Arc::clone(&disconnect),
        });
        let b = Arc::new(PipeEndpoint {
            outbox: b_to_a_tx,
            inbox: TokioMutex::new(a_to_b_rx),
            outbound: b_to_a_gauge,
            inbound: a_to_b_gauge,
            disconnect,
        });
        (a, b)
    }
}

/// One endpoint of a [`MemoryPipe`].
pub struct PipeEndpoint {
    outbox: mpsc::UnboundedSender<Bytes>,
    inbox: TokioMutex<mpsc::UnboundedReceiver<Bytes>>,
    outbound: Arc<BufferGauge>,
    inbound: Arc<BufferGauge>,
    disconnect: Arc<CancelSource>,
}

impl PipeEndpoint {
    /// Receives the next encoded frame, or `None` after disconnect.
    pub async fn recv(&self) -> Option<Bytes> {
        let frame = self.inbox.lock().await.recv().await?;
        self.inbound.sub(frame.len());
        Some(frame)
    }

    /// Closes the connection: both endpoints' disconnect signals fire
    /// with the given reason and further sends fail.
    pub fn close(&self, reason: impl Into<String>) {
        self.disconnect.fire(reason);
    }

    /// Returns the number of bytes currently buffered toward the peer.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.outbound.bytes.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for PipeEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeEndpoint")
            .field("buffered_bytes", &self.buffered_bytes())
            .field("disconnected", &self.disconnect.signal().fired())
            .finish()
    }
}

impl Transport for PipeEndpoint {
    fn send_message(
        &self,
        msg: Message,
    ) -> Pin<Box<dyn Future<Output = EngineResult<()>> + Send + '_>> {
        Box::pin(async move {
            if let Some(reason) = self.disconnect.signal().reason() {
                return Err(EngineError::Transport(format!("pipe closed: {reason}")));
            }
            let frame = grid_proto::encode(&msg)
                .map_err(|e| EngineError::Transport(format!("frame encoding failed: {e}")))?;
            let len = frame.len();
            self.outbox
                .send(frame)
                .map_err(|_| EngineError::Transport("pipe receiver dropped".to_string()))?;
            self.outbound.add(len);
            Ok(())
        })
    }

    fn wait_to_drain(&self) -> Option<Pin<Box<dyn Future<Output = ()> + Send>>> {
        if self.outbound.is_full() {
            Some(Box::pin(Arc::clone(&self.outbound).drained()))
        } else {
            None
        }
    }

    fn disconnect_signal(&self) -> CancelSignal {
        self.disconnect.signal()
    }
}
