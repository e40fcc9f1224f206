//! # grid-client
//!
//! The client façade: typed wrappers over the engine method surface and
//! a demultiplexer for server-to-client signals.
//!
//! An `["action", actionSet]` signal dispatches the action set to local
//! listeners registered with [`Client::on_action`].

#![warn(clippy::all)]

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use grid_common::{
    ActionSet, ApplyResultSet, CellValue, DocAction, EngineError, EngineResult, Query,
    QueryResult, StreamingHeader, StreamingOptions,
};
use grid_rpc::{
    CallHandler, CancelSignal, ChunkSource, IncomingCall, IncomingSignal, Rpc, StreamingData,
    Transport,
};

type ActionCallback = Arc<dyn Fn(&ActionSet) + Send + Sync>;
type ListenerList = Arc<Mutex<Vec<(u64, ActionCallback)>>>;

/// A connected Gridbase client.
pub struct Client {
    rpc: Arc<Rpc>,
    listeners: ListenerList,
    next_listener_id: AtomicU64,
}

impl Client {
    /// Creates a client over the given transport.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Client> {
        let listeners: ListenerList = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(SignalDemux {
            listeners: Arc::clone(&listeners),
        });
        Arc::new(Client {
            rpc: Rpc::new(transport, handler),
            listeners,
            next_listener_id: AtomicU64::new(1),
        })
    }

    /// Returns the underlying RPC core (the inbound frames must be fed
    /// to its `dispatch`).
    #[must_use]
    pub fn rpc(&self) -> &Arc<Rpc> {
        &self.rpc
    }

    /// Fetches a query eagerly.
    pub async fn fetch_query(&self, query: &Query) -> EngineResult<QueryResult> {
        let data = self
            .call_method("fetchQuery", vec![to_value(query)?], None)
            .await?;
        from_response(data.value, "fetchQuery")
    }

    /// Starts a streaming query. The optional cancel signal aborts the
    /// call and its chunk stream.
    pub async fn fetch_query_streaming(
        &self,
        query: &Query,
        options: &StreamingOptions,
        cancel: Option<CancelSignal>,
    ) -> EngineResult<QueryStream> {
        let data = self
            .call_method(
                "fetchQueryStreaming",
                vec![to_value(query)?, to_value(options)?],
                cancel,
            )
            .await?;
        let header: StreamingHeader = from_response(data.value, "fetchQueryStreaming")?;
        Ok(QueryStream {
            table_id: header.table_id,
            action_num: header.action_num,
            col_ids: header.col_ids,
            chunks: data.chunks,
        })
    }

    /// Applies a set of doc actions.
    pub async fn apply_actions(&self, actions: &[DocAction]) -> EngineResult<ApplyResultSet> {
        let data = self
            .call_method("applyActions", vec![to_value(&actions)?], None)
            .await?;
        from_response(data.value, "applyActions")
    }

    /// Registers a callback for broadcast action sets. The listener is
    /// removed when the returned guard is dropped.
    pub fn on_action(&self, callback: impl Fn(&ActionSet) + Send + Sync + 'static) -> ActionListenerGuard {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push((id, Arc::new(callback)));
        ActionListenerGuard {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    async fn call_method(
        &self,
        method: &str,
        args: Vec<Value>,
        cancel: Option<CancelSignal>,
    ) -> EngineResult<StreamingData> {
        let mut payload = Vec::with_capacity(args.len() + 1);
        payload.push(Value::String(method.to_string()));
        payload.extend(args);
        self.rpc
            .make_call(StreamingData::from_value(Value::Array(payload)), cancel)
            .await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

/// Unregisters its action listener on drop.
pub struct ActionListenerGuard {
    id: u64,
    listeners: Weak<Mutex<Vec<(u64, ActionCallback)>>>,
}

impl Drop for ActionListenerGuard {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// A streaming query result on the client side.
pub struct QueryStream {
    /// Table that is being read.
    pub table_id: String,
    /// Store version at which the read executed.
    pub action_num: u64,
    /// Column ids aligned with the positional row arrays.
    pub col_ids: Vec<String>,
    chunks: Option<Box<dyn ChunkSource>>,
}

impl QueryStream {
    /// Returns the next chunk of rows, `None` at the end, or the error
    /// that terminated the stream.
    pub async fn next_rows(&mut self) -> Option<EngineResult<Vec<Vec<CellValue>>>> {
        let chunks = self.chunks.as_mut()?;
        match chunks.next_chunk().await {
            None => {
                self.chunks = None;
                None
            }
            Some(Err(error)) => {
                self.chunks = None;
                Some(Err(error))
            }
            Some(Ok(payload)) => Some(parse_rows(&payload)),
        }
    }

    /// Abandons the stream.
    pub fn close(&mut self) {
        if let Some(chunks) = &mut self.chunks {
            chunks.close();
        }
        self.chunks = None;
    }
}

impl std::fmt::Debug for QueryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryStream")
            .field("table_id", &self.table_id)
            .field("col_ids", &self.col_ids)
            .field("open", &self.chunks.is_some())
            .finish()
    }
}

fn parse_rows(payload: &Value) -> EngineResult<Vec<Vec<CellValue>>> {
    let rows = payload
        .as_array()
        .ok_or_else(|| EngineError::Protocol("chunk must be an array of rows".to_string()))?;
    rows.iter()
        .map(|row| {
            let cells = row
                .as_array()
                .ok_or_else(|| EngineError::Protocol("row must be an array".to_string()))?;
            cells
                .iter()
                .map(|cell| CellValue::from_json(cell).map_err(EngineError::Protocol))
                .collect()
        })
        .collect()
}

fn to_value<T: serde::Serialize>(value: &T) -> EngineResult<Value> {
    serde_json::to_value(value).map_err(EngineError::handler)
}

fn from_response<T: serde::de::DeserializeOwned>(
    value: Option<Value>,
    method: &str,
) -> EngineResult<T> {
    let value =
        value.ok_or_else(|| EngineError::Protocol(format!("{method} response has no value")))?;
    serde_json::from_value(value)
        .map_err(|error| EngineError::Protocol(format!("bad {method} response: {error}")))
}

/// Demultiplexes incoming signals to registered action listeners.
struct SignalDemux {
    listeners: ListenerList,
}

impl CallHandler for SignalDemux {
    fn handle_call(
        &self,
        _call: IncomingCall,
    ) -> Pin<Box<dyn Future<Output = EngineResult<StreamingData>> + Send + '_>> {
        Box::pin(async {
            Err(EngineError::Handler(
                "clients do not serve calls".to_string(),
            ))
        })
    }

    fn handle_signal(
        &self,
        signal: IncomingSignal,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let Some(Value::Array(items)) = signal.value else {
            warn!("malformed signal payload");
            return Box::pin(async {});
        };
        match (
            items.first().and_then(Value::as_str),
            items.get(1),
        ) {
            (Some("action"), Some(raw)) => match serde_json::from_value::<ActionSet>(raw.clone())
            {
                Ok(set) => {
                    let callbacks: Vec<ActionCallback> = self
                        .listeners
                        .lock()
                        .iter()
                        .map(|(_, callback)| Arc::clone(callback))
                        .collect();
                    for callback in callbacks {
                        callback(&set);
                    }
                }
                Err(error) => warn!(%error, "failed to parse action set"),
            },
            (name, _) => debug!(?name, "ignoring unknown signal"),
        }
        Box::pin(async {})
    }
}
