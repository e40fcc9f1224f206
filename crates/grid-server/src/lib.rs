//! # grid-server
//!
//! The server façade: maps the engine method surface onto RPC calls.
//!
//! Call payloads are `[methodName, ...args]`. Non-streaming methods
//! return their result in the response value; `fetchQueryStreaming`
//! returns the header as the value and the row chunks as the streamed
//! tail. A per-connection action listener turns every applied action
//! set into an `["action", actionSet]` signal and is dropped when the
//! connection disconnects.

#![warn(clippy::all)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, warn};

use grid_common::{
    CellValue, DocAction, EngineError, EngineResult, Query, StreamingOptions,
};
use grid_rpc::{
    CallHandler, ChunkSource, IncomingCall, IncomingSignal, Rpc, StreamingData, Transport,
};
use grid_store::{QueryEngine, RowChunks};

/// The static method allow-list.
pub const METHODS: [&str; 3] = ["fetchQuery", "fetchQueryStreaming", "applyActions"];

/// Per-connection server session dispatching engine methods.
pub struct ServerSession {
    engine: Arc<QueryEngine>,
}

impl ServerSession {
    /// Creates a session over the given engine.
    #[must_use]
    pub fn new(engine: Arc<QueryEngine>) -> Arc<ServerSession> {
        Arc::new(ServerSession { engine })
    }

    async fn dispatch_method(&self, call: IncomingCall) -> EngineResult<StreamingData> {
        let payload = call
            .value
            .ok_or_else(|| EngineError::Protocol("call has no payload".to_string()))?;
        let items = payload.as_array().ok_or_else(|| {
            EngineError::Protocol("call payload must be [method, ...args]".to_string())
        })?;
        let method = items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Protocol("method name must be a string".to_string()))?;
        let args = &items[1..];
        debug!(method, args = args.len(), "dispatching engine method");

        match method {
            "fetchQuery" => {
                let query: Query = parse_arg(args, 0, "query")?;
                let result = self.engine.fetch_query(&query).await?;
                Ok(StreamingData::from_value(to_value(&result)?))
            }
            "fetchQueryStreaming" => {
                let query: Query = parse_arg(args, 0, "query")?;
                let options: StreamingOptions = parse_arg(args, 1, "streaming options")?;
                let streaming = self
                    .engine
                    .fetch_query_streaming(&query, &options, call.cancel.clone())
                    .await?;
                let header = to_value(&streaming.value)?;
                Ok(StreamingData::with_chunks(
                    Some(header),
                    RowChunkSource::new(streaming.chunks),
                ))
            }
            "applyActions" => {
                let actions: Vec<DocAction> = parse_arg(args, 0, "action set")?;
                let result = self.engine.apply_actions(actions).await?;
                Ok(StreamingData::from_value(to_value(&result)?))
            }
            other => Err(EngineError::UnknownMethod(other.to_string())),
        }
    }
}

impl CallHandler for ServerSession {
    fn handle_call(
        &self,
        call: IncomingCall,
    ) -> Pin<Box<dyn Future<Output = EngineResult<StreamingData>> + Send + '_>> {
        Box::pin(self.dispatch_method(call))
    }

    fn handle_signal(
        &self,
        signal: IncomingSignal,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        debug!(value = ?signal.value, "ignoring client signal");
        Box::pin(async {})
    }
}

/// Wires one connection: builds the RPC core over the transport and
/// registers the per-connection action listener, disposed when the
/// connection's disconnect signal fires.
pub fn serve_connection(engine: &Arc<QueryEngine>, transport: Arc<dyn Transport>) -> Arc<Rpc> {
    let session = ServerSession::new(Arc::clone(engine));
    let rpc = Rpc::new(Arc::clone(&transport), session);

    let weak_rpc = Arc::downgrade(&rpc);
    let guard = engine.add_action_listener(move |set| {
        let Some(rpc) = weak_rpc.upgrade() else {
            return;
        };
        let payload = json!(["action", set]);
        tokio::spawn(async move {
            if let Err(error) = rpc.send_signal(StreamingData::from_value(payload)).await {
                warn!(%error, "failed to broadcast action signal");
            }
        });
    });

    let disconnect = transport.disconnect_signal();
    tokio::spawn(async move {
        let reason = disconnect.cancelled().await;
        debug!(%reason, "connection closed, dropping action listener");
        drop(guard);
    });

    rpc
}

fn parse_arg<T: DeserializeOwned>(args: &[Value], index: usize, what: &str) -> EngineResult<T> {
    let raw = args
        .get(index)
        .ok_or_else(|| EngineError::Protocol(format!("missing argument {index} ({what})")))?;
    serde_json::from_value(raw.clone())
        .map_err(|error| EngineError::Protocol(format!("bad {what}: {error}")))
}

fn to_value<T: serde::Serialize>(value: &T) -> EngineResult<Value> {
    serde_json::to_value(value).map_err(EngineError::handler)
}

/// Adapts the engine's row chunks into wire payloads: each chunk is a
/// JSON array of positional row arrays.
struct RowChunkSource {
    chunks: RowChunks,
}

impl RowChunkSource {
    fn new(chunks: RowChunks) -> Self {
        RowChunkSource { chunks }
    }
}

impl ChunkSource for RowChunkSource {
    fn next_chunk(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Option<EngineResult<Value>>> + Send + '_>> {
        Box::pin(async move {
            match self.chunks.next().await {
                None => None,
                Some(Err(error)) => Some(Err(error)),
                Some(Ok(rows)) => {
                    let payload = Value::Array(
                        rows.iter()
                            .map(|row| Value::Array(row.iter().map(CellValue::to_json).collect()))
                            .collect(),
                    );
                    Some(Ok(payload))
                }
            }
        })
    }

    fn close(&mut self) {
        self.chunks.close();
    }
}
