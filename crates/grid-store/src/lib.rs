//! # grid-store
//!
//! The streaming query engine backed by embedded SQLite.
//!
//! - [`sql`]: translates structured queries into parameterized SQL
//! - [`apply`]: applies bulk schema/data mutations in one transaction
//! - [`engine`]: executes reads (plain and streaming) and writes
//! - [`pool`]: a bounded pool of store handles

#![warn(clippy::all)]

mod cell;

pub mod apply;
pub mod engine;
pub mod pool;
pub mod sql;

pub use engine::{stream_query, ListenerGuard, QueryEngine, QueryResultStreaming, RowChunk, RowChunks};
pub use pool::{ConnectionPool, PoolConfig, PoolMetrics, PooledHandle, StoreHandle};
pub use sql::SqlQuery;

use grid_common::EngineError;

/// Converts a SQLite error into the unified error type.
pub(crate) fn store_err(error: rusqlite::Error) -> EngineError {
    EngineError::store(error)
}
