//! The RPC core: call/signal/response dispatch.
//!
//! One [`Rpc`] instance serves one connection. It tracks pending
//! outgoing calls, open incoming streams keyed by `(mtype, reqId)`, and
//! cancellation tokens for in-flight incoming calls. All state lives
//! behind one mutex; handlers run on spawned tasks.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use grid_common::{EngineError, EngineResult};
use grid_proto::{Message, MsgType};

use super::cancel::{CancelSignal, CancelSource};
use super::stream::{ChunkSource, StreamIterator, StreamProducer, StreamingData};
use super::transport::Transport;

/// An incoming call handed to the user handler.
pub struct IncomingCall {
    /// The call's value payload.
    pub value: Option<Value>,
    /// The call's streamed tail, if the peer flagged more frames.
    pub chunks: Option<StreamIterator>,
    /// Cancellation scoped to this call, composed with the connection's
    /// disconnect signal. Fired by an abort frame on the same request id.
    pub cancel: CancelSignal,
}

/// An incoming signal handed to the user handler.
pub struct IncomingSignal {
    /// The signal's value payload.
    pub value: Option<Value>,
    /// The signal's streamed tail, if any.
    pub chunks: Option<StreamIterator>,
}

/// User-supplied handlers for incoming calls and signals.
pub trait CallHandler: Send + Sync + 'static {
    /// Handles one incoming call; the result (or error) is sent back as
    /// the response.
    fn handle_call(
        &self,
        call: IncomingCall,
    ) -> Pin<Box<dyn Future<Output = EngineResult<StreamingData>> + Send + '_>>;

    /// Handles one incoming fire-and-forget signal.
    fn handle_signal(
        &self,
        signal: IncomingSignal,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

type PendingCall = oneshot::Sender<EngineResult<StreamingData>>;
type StreamKey = (MsgType, u64);

#[derive(Default)]
struct RpcState {
    next_req_id: u64,
    pending_calls: HashMap<u64, PendingCall>,
    pending_streams: HashMap<StreamKey, StreamProducer>,
    call_cancels: HashMap<u64, CancelSource>,
}

/// The RPC core for one connection.
pub struct Rpc {
    transport: Arc<dyn Transport>,
    handler: Arc<dyn CallHandler>,
    state: Mutex<RpcState>,
}

impl Rpc {
    /// Creates the core for a connection and spawns its disconnect
    /// watcher: on disconnect, every pending call is rejected and every
    /// open stream errored with the disconnect reason.
    pub fn new(transport: Arc<dyn Transport>, handler: Arc<dyn CallHandler>) -> Arc<Rpc> {
        let rpc = Arc::new(Rpc {
            transport,
            handler,
            state: Mutex::new(RpcState {
                next_req_id: 1,
                ..RpcState::default()
            }),
        });
        let disconnect = rpc.transport.disconnect_signal();
        let weak = Arc::downgrade(&rpc);
        tokio::spawn(async move {
            let reason = disconnect.cancelled().await;
            if let Some(rpc) = weak.upgrade() {
                rpc.on_disconnect(&reason);
            }
        });
        rpc
    }

    /// Returns the underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Performs an outgoing call, optionally cancellable.
    ///
    /// If `cancel` fires before resolution an abort frame is emitted and
    /// the call still resolves with the peer's eventual (error) response.
    /// Transport send failures reject the call directly.
    pub async fn make_call(
        self: &Arc<Self>,
        data: StreamingData,
        cancel: Option<CancelSignal>,
    ) -> EngineResult<StreamingData> {
        let (tx, rx) = oneshot::channel();
        let req_id = {
            let mut state = self.state.lock();
            let req_id = state.next_req_id;
            state.next_req_id += 1;
            state.pending_calls.insert(req_id, tx);
            req_id
        };

        if let Err(error) = self.send_streaming_data(MsgType::Call, req_id, data).await {
            self.state.lock().pending_calls.remove(&req_id);
            return Err(error);
        }

        let mut rx = rx;
        let resolved = match cancel {
            None => rx.await,
            Some(signal) => {
                tokio::select! {
                    resolved = &mut rx => resolved,
                    reason = signal.cancelled() => {
                        debug!(req_id, %reason, "call cancelled, sending abort frame");
                        if let Err(error) = self
                            .transport
                            .send_message(Message::abort(MsgType::Call, req_id))
                            .await
                        {
                            warn!(req_id, %error, "failed to send abort frame");
                        }
                        rx.await
                    }
                }
            }
        };
        resolved.unwrap_or_else(|_| {
            Err(EngineError::Transport(
                "call abandoned without a response".to_string(),
            ))
        })
    }

    /// Sends a fire-and-forget signal (with an optional streamed tail).
    pub async fn send_signal(self: &Arc<Self>, data: StreamingData) -> EngineResult<()> {
        let req_id = {
            let mut state = self.state.lock();
            let req_id = state.next_req_id;
            state.next_req_id += 1;
            req_id
        };
        self.send_streaming_data(MsgType::Signal, req_id, data).await
    }

    /// Routes an inbound message to its effect.
    ///
    /// Returns whether dispatch succeeded; failures are reported through
    /// the logging hook and leave state unaltered.
    pub fn dispatch(self: &Arc<Self>, msg: Message) -> bool {
        let mtype = msg.mtype;
        let req_id = msg.req_id;
        match self.try_dispatch(msg) {
            Ok(()) => true,
            Err(error) => {
                warn!(?mtype, req_id, %error, "failed to dispatch message");
                false
            }
        }
    }

    fn try_dispatch(self: &Arc<Self>, msg: Message) -> EngineResult<()> {
        // An open stream on (mtype, reqId) claims the frame first.
        let key: StreamKey = (msg.mtype, msg.req_id);
        let producer = self.state.lock().pending_streams.get(&key).cloned();
        if let Some(producer) = producer {
            if let Some(error) = &msg.error {
                producer.supply_error(self.transport.decode_error(error));
            } else if !msg.more {
                producer.finish_ok();
            } else {
                producer.supply_chunk(msg.data.unwrap_or(Value::Null));
            }
            return Ok(());
        }

        match msg.mtype {
            MsgType::Call => {
                self.dispatch_call(msg);
                Ok(())
            }
            MsgType::Signal => {
                self.dispatch_signal(msg);
                Ok(())
            }
            MsgType::Resp => self.dispatch_resp(msg),
        }
    }

    fn dispatch_call(self: &Arc<Self>, msg: Message) {
        let req_id = msg.req_id;
        if msg.abort {
            let state = self.state.lock();
            match state.call_cancels.get(&req_id) {
                Some(source) => {
                    source.fire("call aborted by peer");
                }
                None => debug!(req_id, "abort frame for unknown call"),
            }
            return;
        }

        // The per-call token doubles as the disconnect composition:
        // on_disconnect fires every registered call source directly.
        let source = CancelSource::new();
        let cancel = source.signal();
        let chunks = msg
            .more
            .then(|| self.register_stream(MsgType::Call, req_id));
        self.state.lock().call_cancels.insert(req_id, source);

        let rpc = Arc::clone(self);
        let value = msg.data;
        tokio::spawn(async move {
            let call = IncomingCall {
                value,
                chunks,
                cancel,
            };
            match rpc.handler.handle_call(call).await {
                Ok(data) => {
                    if let Err(error) = rpc.send_streaming_data(MsgType::Resp, req_id, data).await
                    {
                        warn!(req_id, %error, "failed to send response");
                    }
                }
                Err(error) => {
                    let payload = rpc.transport.encode_error(&error);
                    if let Err(send_error) = rpc
                        .transport
                        .send_message(Message::with_error(MsgType::Resp, req_id, payload))
                        .await
                    {
                        warn!(req_id, %send_error, "failed to send error response");
                    }
                }
            }
            // Removed only now: an abort frame arriving while the
            // response tail was still streaming must reach the producer.
            rpc.state.lock().call_cancels.remove(&req_id);
        });
    }

    fn dispatch_signal(self: &Arc<Self>, msg: Message) {
        if msg.abort {
            debug!(req_id = msg.req_id, "ignoring abort frame for signal");
            return;
        }
        let chunks = msg
            .more
            .then(|| self.register_stream(MsgType::Signal, msg.req_id));
        let rpc = Arc::clone(self);
        let value = msg.data;
        tokio::spawn(async move {
            rpc.handler
                .handle_signal(IncomingSignal { value, chunks })
                .await;
        });
    }

    fn dispatch_resp(self: &Arc<Self>, msg: Message) -> EngineResult<()> {
        let tx = self
            .state
            .lock()
            .pending_calls
            .remove(&msg.req_id)
            .ok_or(EngineError::UnknownRequest(msg.req_id))?;
        let result = if let Some(error) = &msg.error {
            Err(self.transport.decode_error(error))
        } else {
            let chunks = msg.more.then(|| {
                Box::new(self.register_stream(MsgType::Resp, msg.req_id)) as Box<dyn ChunkSource>
            });
            Ok(StreamingData {
                value: msg.data,
                chunks,
            })
        };
        // A dropped receiver means the caller abandoned the call.
        let _ = tx.send(result);
        Ok(())
    }

    /// Registers a fresh stream under `(mtype, reqId)`; its cleanup
    /// removes the entry once the stream has fully ended on both sides.
    fn register_stream(self: &Arc<Self>, mtype: MsgType, req_id: u64) -> StreamIterator {
        let key: StreamKey = (mtype, req_id);
        let weak = Arc::downgrade(self);
        let (iter, producer) = StreamIterator::with_cleanup(move || {
            if let Some(rpc) = weak.upgrade() {
                rpc.state.lock().pending_streams.remove(&key);
            }
        });
        self.state.lock().pending_streams.insert(key, producer);
        iter
    }

    /// Sends a value frame and, if present, its streamed tail.
    ///
    /// The tail respects the transport's drain future and the disconnect
    /// signal. Chunk-iteration failures are encoded onto the wire as an
    /// error frame (terminating the stream); transport send failures
    /// propagate to the caller instead.
    pub async fn send_streaming_data(
        self: &Arc<Self>,
        mtype: MsgType,
        req_id: u64,
        data: StreamingData,
    ) -> EngineResult<()> {
        let StreamingData { value, chunks } = data;
        let Some(mut chunks) = chunks else {
            let mut head = Message::new(mtype, req_id);
            head.data = value;
            return self.transport.send_message(head).await;
        };

        let mut head = Message::new(mtype, req_id).more(true);
        head.data = value;
        self.transport.send_message(head).await?;

        let disconnect = self.transport.disconnect_signal();
        loop {
            if let Some(reason) = disconnect.reason() {
                chunks.close();
                return Err(EngineError::Disconnected(reason));
            }
            if let Some(drain) = self.transport.wait_to_drain() {
                drain.await;
            }
            match chunks.next_chunk().await {
                Some(Ok(chunk)) => {
                    self.transport
                        .send_message(Message::with_data(mtype, req_id, chunk).more(true))
                        .await?;
                }
                Some(Err(error)) => {
                    chunks.close();
                    let payload = self.transport.encode_error(&error);
                    return self
                        .transport
                        .send_message(Message::with_error(mtype, req_id, payload))
                        .await;
                }
                None => {
                    return self.transport.send_message(Message::new(mtype, req_id)).await;
                }
            }
        }
    }

    /// Fails all pending work with the disconnect reason.
    fn on_disconnect(self: &Arc<Self>, reason: &str) {
        debug!(reason, "connection disconnected, failing pending work");
        let (calls, streams, cancels) = {
            let mut state = self.state.lock();
            (
                state.pending_calls.drain().collect::<Vec<_>>(),
                state.pending_streams.values().cloned().collect::<Vec<_>>(),
                state.call_cancels.drain().collect::<Vec<_>>(),
            )
        };
        for (_, tx) in calls {
            let _ = tx.send(Err(EngineError::Disconnected(reason.to_string())));
        }
        for producer in streams {
            producer.supply_error(EngineError::Disconnected(reason.to_string()));
        }
        for (_, source) in cancels {
            source.fire(reason);
        }
    }
}

impl std::fmt::Debug for Rpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Rpc")
            .field("next_req_id", &state.next_req_id)
            .field("pending_calls", &state.pending_calls.len())
            .field("pending_streams", &state.pending_streams.len())
            .finish()
    }
}

/// Spawns the read loop feeding frames from a pipe endpoint into the
/// core's dispatch. Decode failures are reported and skipped.
pub fn spawn_dispatch_loop(
    endpoint: Arc<super::transport::PipeEndpoint>,
    rpc: Arc<Rpc>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = endpoint.recv().await {
            match grid_proto::decode(&frame) {
                Ok(msg) => {
                    rpc.dispatch(msg);
                }
                Err(error) => {
                    warn!(%error, "failed to decode frame");
                }
            }
        }
    })
}
