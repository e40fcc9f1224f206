//! # grid-common
//!
//! Common types, errors, and constants for Gridbase.
//!
//! This crate provides the foundational types used across all Gridbase
//! components:
//!
//! - **Types**: cell values, bulk column values, columnar query results
//! - **Actions**: document mutations (`DocAction`) and their broadcast form
//! - **Queries**: structured read descriptions and streaming options
//! - **Errors**: unified error handling with [`EngineError`]
//! - **Constants**: system-wide constants and limits

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actions;
pub mod constants;
pub mod error;
pub mod query;
pub mod types;

pub use actions::{ActionSet, ApplyResultSet, ColInfo, ColPatch, DocAction};
pub use error::{EngineError, EngineResult};
pub use query::{Query, QueryCursor, QueryResult, StreamingHeader, StreamingOptions};
pub use types::{BulkColValues, CellValue, TableColValues};
