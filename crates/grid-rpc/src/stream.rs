//! Lazy chunk sequences.
//!
//! A [`StreamIterator`] is the single-consumer view of a finite chunk
//! sequence with a terminal state. Its [`StreamProducer`] is driven by
//! the RPC core as stream frames arrive. The [`ChunkSource`] trait is
//! the shared shape of "lazy finite chunk sequence" used both for
//! incoming streams (this iterator) and outgoing tails (query reads).

use std::collections::VecDeque;
use std::future::Future;
use std::pin::{pin, Pin};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use grid_common::{EngineError, EngineResult};

/// The outcome of one `next()` on a [`StreamIterator`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamNext {
    /// The next queued chunk.
    Chunk(Value),
    /// The terminal success result, delivered exactly once.
    End,
    /// Neutral result after the end has been consumed or the iterator
    /// closed.
    Done,
}

type Cleanup = Box<dyn FnOnce() + Send>;

struct StreamState {
    queue: VecDeque<Value>,
    end: Option<Result<(), EngineError>>,
    end_consumed: bool,
    closed: bool,
    cleanup: Option<Cleanup>,
}

impl StreamState {
    /// Takes the cleanup callback once the upstream has finished and the
    /// consumer is done (end consumed or closed).
    fn take_cleanup(&mut self) -> Option<Cleanup> {
        if self.end.is_some() && (self.closed || self.end_consumed) {
            self.cleanup.take()
        } else {
            None
        }
    }
}

struct StreamShared {
    state: Mutex<StreamState>,
    notify: Notify,
}

/// Single-consumer lazy finite sequence of chunks with a terminal state.
pub struct StreamIterator {
    shared: Arc<StreamShared>,
}

/// The supply side of a [`StreamIterator`], held by the RPC core.
#[derive(Clone)]
pub struct StreamProducer {
    shared: Arc<StreamShared>,
}

impl StreamIterator {
    /// Creates an iterator/producer pair with no cleanup callback.
    #[must_use]
    pub fn pair() -> (StreamIterator, StreamProducer) {
        Self::with_cleanup(|| {})
    }

    /// Creates an iterator/producer pair whose `cleanup` runs exactly
    /// once, after the producer has finished and the consumer has either
    /// consumed the end value or closed.
    #[must_use]
    pub fn with_cleanup(cleanup: impl FnOnce() + Send + 'static) -> (StreamIterator, StreamProducer) {
        let shared = Arc::new(StreamShared {
            state: Mutex::new(StreamState {
                queue: VecDeque::new(),
                end: None,
                end_consumed: false,
                closed: false,
                cleanup: Some(Box::new(cleanup)),
            }),
            notify: Notify::new(),
        });
        (
            StreamIterator {
                shared: Arc::clone(&shared),
            },
            StreamProducer { shared },
        )
    }

    /// Returns the next chunk, the terminal success result, or fails
    /// with the supplied terminal error. Queued chunks are delivered in
    /// order before the end value; the end value is delivered exactly
    /// once, after which `next()` returns [`StreamNext::Done`].
    pub async fn next(&mut self) -> EngineResult<StreamNext> {
        loop {
            let mut notified = pin!(self.shared.notify.notified());
            notified.as_mut().enable();
            {
                let mut state = self.shared.state.lock();
                if state.closed || state.end_consumed {
                    return Ok(StreamNext::Done);
                }
                if let Some(chunk) = state.queue.pop_front() {
                    return Ok(StreamNext::Chunk(chunk));
                }
                if let Some(end) = state.end.clone() {
                    state.end_consumed = true;
                    let cleanup = state.take_cleanup();
                    drop(state);
                    if let Some(cleanup) = cleanup {
                        cleanup();
                    }
                    return match end {
                        Ok(()) => Ok(StreamNext::End),
                        Err(error) => Err(error),
                    };
                }
            }
            notified.await;
        }
    }

    /// Abandons the sequence. Idempotent; queued chunks are dropped and
    /// the cleanup callback runs once the upstream has also finished.
    pub fn close(&mut self) {
        close_shared(&self.shared);
    }
}

impl Drop for StreamIterator {
    fn drop(&mut self) {
        close_shared(&self.shared);
    }
}

impl std::fmt::Debug for StreamIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("StreamIterator")
            .field("queued", &state.queue.len())
            .field("ended", &state.end.is_some())
            .field("closed", &state.closed)
            .finish()
    }
}

fn close_shared(shared: &Arc<StreamShared>) {
    let cleanup = {
        let mut state = shared.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.queue.clear();
        state.take_cleanup()
    };
    if let Some(cleanup) = cleanup {
        cleanup();
    }
}

impl StreamProducer {
    /// Queues a chunk. A no-op after the end state is set or the
    /// consumer has closed.
    pub fn supply_chunk(&self, chunk: Value) {
        {
            let mut state = self.shared.state.lock();
            if state.end.is_some() || state.closed {
                return;
            }
            state.queue.push_back(chunk);
        }
        self.shared.notify.notify_waiters();
    }

    /// Marks successful completion. Only the first end state wins.
    pub fn finish_ok(&self) {
        self.finish(Ok(()));
    }

    /// Fails the sequence with a terminal error. Only the first end
    /// state wins.
    pub fn supply_error(&self, error: EngineError) {
        self.finish(Err(error));
    }

    fn finish(&self, end: Result<(), EngineError>) {
        let cleanup = {
            let mut state = self.shared.state.lock();
            if state.end.is_some() {
                return;
            }
            state.end = Some(end);
            state.take_cleanup()
        };
        self.shared.notify.notify_waiters();
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }
}

/// A lazy finite chunk sequence.
///
/// `next_chunk` yields `Some(Ok(chunk))` per chunk, `Some(Err(_))` for a
/// terminal error, and `None` once the sequence has ended successfully.
pub trait ChunkSource: Send {
    /// Pulls the next chunk.
    fn next_chunk(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<EngineResult<Value>>> + Send + '_>>;

    /// Abandons the sequence, releasing its resources.
    fn close(&mut self);
}

impl ChunkSource for StreamIterator {
    fn next_chunk(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<EngineResult<Value>>> + Send + '_>> {
        Box::pin(async move {
            match self.next().await {
                Ok(StreamNext::Chunk(chunk)) => Some(Ok(chunk)),
                Ok(StreamNext::End | StreamNext::Done) => None,
                Err(error) => Some(Err(error)),
            }
        })
    }

    fn close(&mut self) {
        StreamIterator::close(self);
    }
}

/// A chunk source over an in-memory list; used for tests and for calls
/// that carry a literal streaming tail.
#[derive(Debug, Default)]
pub struct VecChunks {
    chunks: VecDeque<Value>,
}

impl VecChunks {
    /// Creates a source yielding the given chunks in order.
    #[must_use]
    pub fn new(chunks: impl IntoIterator<Item = Value>) -> Self {
        VecChunks {
            chunks: chunks.into_iter().collect(),
        }
    }
}

impl ChunkSource for VecChunks {
    fn next_chunk(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<EngineResult<Value>>> + Send + '_>> {
        let next = self.chunks.pop_front().map(Ok);
        Box::pin(async move { next })
    }

    fn close(&mut self) {
        self.chunks.clear();
    }
}

/// A value plus an optional lazy chunk tail.
pub struct StreamingData {
    /// The initial value frame's payload.
    pub value: Option<Value>,
    /// The streamed tail, if any.
    pub chunks: Option<Box<dyn ChunkSource>>,
}

impl StreamingData {
    /// Creates streaming data with no tail.
    #[must_use]
    pub fn from_value(value: impl Into<Value>) -> Self {
        StreamingData {
            value: Some(value.into()),
            chunks: None,
        }
    }

    /// Creates streaming data with a chunk tail.
    #[must_use]
    pub fn with_chunks(value: Option<Value>, chunks: impl ChunkSource + 'static) -> Self {
        StreamingData {
            value,
            chunks: Some(Box::new(chunks)),
        }
    }

    /// Creates empty streaming data (no value, no tail).
    #[must_use]
    pub fn empty() -> Self {
        StreamingData {
            value: None,
            chunks: None,
        }
    }
}

impl std::fmt::Debug for StreamingData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingData")
            .field("value", &self.value)
            .field("has_chunks", &self.chunks.is_some())
            .finish()
    }
}
