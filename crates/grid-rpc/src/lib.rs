//! # grid-rpc
//!
//! Streaming bidirectional RPC over an ordered message transport.
//!
//! The layer carries calls, signals (fire-and-forget), and responses,
//! any of which may include a streamed tail of chunks. It integrates
//! sender-side backpressure (the transport's drain future), per-call
//! cancellation, and disconnect propagation.
//!
//! - [`cancel`]: at-most-once cancellation signals with a reason
//! - [`stream`]: the lazy chunk sequence consumed by one side of a stream
//! - [`transport`]: the transport contract and an in-memory pipe
//! - [`rpc`]: the core dispatcher

#![warn(clippy::all)]

pub mod cancel;
pub mod rpc;
pub mod stream;
pub mod transport;

pub use cancel::{CancelSignal, CancelSource};
pub use rpc::{CallHandler, IncomingCall, IncomingSignal, Rpc};
pub use stream::{ChunkSource, StreamIterator, StreamNext, StreamProducer, StreamingData, VecChunks};
pub use transport::{MemoryPipe, PipeConfig, PipeEndpoint, Transport};
