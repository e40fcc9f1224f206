//! Unified error type for the engine and RPC layers.
//!
//! A single [`EngineError`] covers every failure kind that can cross a
//! component boundary. Each kind has a stable string code used as its
//! wire representation, so peers can translate errors back without
//! sharing Rust types.

use serde_json::{json, Value};
use thiserror::Error;

/// Result alias used throughout Gridbase.
pub type EngineResult<T> = Result<T, EngineError>;

/// The unified error type.
///
/// The enum is `Clone` so a single disconnect reason can be delivered to
/// every pending call and open stream. Source errors (`rusqlite`,
/// `serde_json`, I/O) are converted at the boundary where they arise,
/// preserving their display form.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// Malformed wire frame.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A response arrived for a request id with no pending call.
    #[error("unknown request id {0}")]
    UnknownRequest(u64),

    /// Raised by the transport's send path. Never re-encoded as a wire
    /// error; outgoing-call futures are rejected with it directly.
    #[error("transport error: {0}")]
    Transport(String),

    /// Raised by a user call handler or by chunk iteration on the
    /// sending side; encoded onto the wire as an error frame.
    #[error("handler error: {0}")]
    Handler(String),

    /// Cancellation reason delivered on abort or timeout.
    #[error("aborted: {0}")]
    Aborted(String),

    /// The connection went away; pending work fails with this reason.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// A streaming read was attempted on a handle already running a
    /// transaction.
    #[error("store handle is busy with another read")]
    StoreBusy,

    /// Invalid identifier, arity mismatch, or unknown filter tag.
    /// Synchronous; raised before any I/O.
    #[error("query builder error: {0}")]
    Builder(String),

    /// An action variant whose contract is declared but not implemented.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A malformed doc action (e.g. row-id / value length mismatch).
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// A call for a method outside the server's allow-list.
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Error from the underlying SQL store.
    #[error("store error: {0}")]
    Store(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    /// Returns the stable string code for this error kind.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "PROTOCOL",
            Self::UnknownRequest(_) => "UNKNOWN_REQUEST",
            Self::Transport(_) => "TRANSPORT",
            Self::Handler(_) => "HANDLER",
            Self::Aborted(_) => "ABORTED",
            Self::Disconnected(_) => "DISCONNECTED",
            Self::StoreBusy => "STORE_BUSY",
            Self::Builder(_) => "BUILDER",
            Self::NotImplemented(_) => "NOT_IMPLEMENTED",
            Self::InvalidAction(_) => "INVALID_ACTION",
            Self::UnknownMethod(_) => "UNKNOWN_METHOD",
            Self::Store(_) => "STORE",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
        }
    }

    /// Returns true for cancellation-flavored errors, letting callers
    /// silence reports of expected aborts.
    #[must_use]
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted(_) | Self::Disconnected(_))
    }

    /// Returns true if this error originated in the transport's send
    /// path (as opposed to a handler), which must never be converted
    /// into a wire error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Creates a handler error from any displayable source.
    #[must_use]
    pub fn handler(message: impl std::fmt::Display) -> Self {
        Self::Handler(message.to_string())
    }

    /// Creates a store error from any displayable source.
    #[must_use]
    pub fn store(message: impl std::fmt::Display) -> Self {
        Self::Store(message.to_string())
    }

    /// Creates a transport error from any displayable source.
    #[must_use]
    pub fn transport(message: impl std::fmt::Display) -> Self {
        Self::Transport(message.to_string())
    }

    /// Serializes the error to its wire form `{code, message}`.
    #[must_use]
    pub fn to_wire(&self) -> Value {
        json!({ "code": self.code(), "message": self.to_string() })
    }

    /// Reconstructs an error from its wire form.
    ///
    /// Unknown or missing codes decode to [`EngineError::Handler`], the
    /// catch-all for peer-reported failures.
    #[must_use]
    pub fn from_wire(payload: &Value) -> Self {
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        let code = payload.get("code").and_then(Value::as_str).unwrap_or("");
        match code {
            "PROTOCOL" => Self::Protocol(strip_prefix(&message, "protocol error: ")),
            "TRANSPORT" => Self::Transport(strip_prefix(&message, "transport error: ")),
            "ABORTED" => Self::Aborted(strip_prefix(&message, "aborted: ")),
            "DISCONNECTED" => Self::Disconnected(strip_prefix(&message, "disconnected: ")),
            "STORE_BUSY" => Self::StoreBusy,
            "BUILDER" => Self::Builder(strip_prefix(&message, "query builder error: ")),
            "NOT_IMPLEMENTED" => Self::NotImplemented(strip_prefix(&message, "not implemented: ")),
            "INVALID_ACTION" => Self::InvalidAction(strip_prefix(&message, "invalid action: ")),
            "UNKNOWN_METHOD" => Self::UnknownMethod(strip_prefix(&message, "unknown method: ")),
            "STORE" => Self::Store(strip_prefix(&message, "store error: ")),
            "INVALID_CONFIG" => {
                Self::InvalidConfig(strip_prefix(&message, "invalid configuration: "))
            }
            _ => Self::Handler(strip_prefix(&message, "handler error: ")),
        }
    }
}

fn strip_prefix(message: &str, prefix: &str) -> String {
    message
        .strip_prefix(prefix)
        .unwrap_or(message)
        .to_string()
}
