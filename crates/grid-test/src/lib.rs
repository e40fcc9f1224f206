//! # grid-test
//!
//! Integration-test harness for Gridbase: wires an engine, a server
//! session, and a client together over an in-memory pipe.

#![warn(clippy::all)]

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::task::JoinHandle;

use grid_client::Client;
use grid_common::{DocAction, EngineResult};
use grid_rpc::rpc::spawn_dispatch_loop;
use grid_rpc::{
    CallHandler, IncomingCall, IncomingSignal, MemoryPipe, PipeEndpoint, Rpc, StreamNext,
    StreamingData, VecChunks,
};
use grid_server::serve_connection;
use grid_store::{ConnectionPool, PoolConfig, QueryEngine};
use serde_json::json;

/// A fully wired engine + server + client over one in-memory pipe.
pub struct TestHarness {
    /// The shared engine.
    pub engine: Arc<QueryEngine>,
    /// Connected clients, one per connection.
    pub clients: Vec<Arc<Client>>,
    /// Client-side pipe endpoints (close one to simulate disconnect).
    pub client_ends: Vec<Arc<PipeEndpoint>>,
    /// Server cores, held so the sessions stay alive.
    #[allow(dead_code)]
    server_rpcs: Vec<Arc<Rpc>>,
    #[allow(dead_code)]
    tasks: Vec<JoinHandle<()>>,
    dir: TempDir,
}

impl TestHarness {
    /// Starts an engine with one connected client.
    pub async fn start() -> TestHarness {
        Self::start_with_clients(1).await
    }

    /// Starts an engine with `count` connected clients.
    pub async fn start_with_clients(count: usize) -> TestHarness {
        let dir = TempDir::new().expect("create temp dir");
        let pool = ConnectionPool::new(PoolConfig::new(dir.path().join("harness.db")))
            .expect("create pool");
        let engine = QueryEngine::new(pool);

        let mut harness = TestHarness {
            engine,
            clients: Vec::new(),
            client_ends: Vec::new(),
            server_rpcs: Vec::new(),
            tasks: Vec::new(),
            dir,
        };
        for _ in 0..count {
            harness.connect_client();
        }
        harness
    }

    /// Connects one more client to the engine.
    pub fn connect_client(&mut self) -> Arc<Client> {
        let (client_end, server_end) = MemoryPipe::pair();
        let server_rpc = serve_connection(&self.engine, server_end.clone());
        let client = Client::new(client_end.clone());

        self.tasks
            .push(spawn_dispatch_loop(server_end, server_rpc.clone()));
        self.tasks
            .push(spawn_dispatch_loop(client_end.clone(), client.rpc().clone()));

        self.clients.push(client.clone());
        self.client_ends.push(client_end);
        self.server_rpcs.push(server_rpc);
        client
    }

    /// The first connected client.
    #[must_use]
    pub fn client(&self) -> &Arc<Client> {
        &self.clients[0]
    }

    /// Path of the harness database file.
    #[must_use]
    pub fn db_path(&self) -> std::path::PathBuf {
        self.dir.path().join("harness.db")
    }

    /// Creates `Table1(Name Text, Age Int)` and fills it with rows
    /// `1..=rows` where `Name = "N{id}"` and `Age = id * 10`.
    pub async fn seed_table1(&self, rows: i64) -> EngineResult<()> {
        self.client()
            .apply_actions(&[table1_schema()])
            .await?;
        if rows > 0 {
            self.client()
                .apply_actions(&[table1_rows((1..=rows).collect())])
                .await?;
        }
        Ok(())
    }
}

/// The `AddTable` action for the standard test table.
#[must_use]
pub fn table1_schema() -> DocAction {
    DocAction::from_json(&json!([
        "AddTable",
        "Table1",
        [{"id": "Name", "type": "Text"}, {"id": "Age", "type": "Int"}]
    ]))
    .expect("valid action")
}

/// A `BulkAddRecord` filling `Table1` with the given row ids.
#[must_use]
pub fn table1_rows(row_ids: Vec<i64>) -> DocAction {
    let names: Vec<String> = row_ids.iter().map(|id| format!("N{id}")).collect();
    let ages: Vec<i64> = row_ids.iter().map(|id| id * 10).collect();
    DocAction::from_json(&json!([
        "BulkAddRecord", "Table1", row_ids, {"Name": names, "Age": ages}
    ]))
    .expect("valid action")
}

/// An RPC handler that echoes calls back, streamed tail included.
pub struct EchoHandler;

impl CallHandler for EchoHandler {
    fn handle_call(
        &self,
        call: IncomingCall,
    ) -> Pin<Box<dyn Future<Output = EngineResult<StreamingData>> + Send + '_>> {
        Box::pin(async move {
            match call.chunks {
                None => Ok(StreamingData {
                    value: call.value,
                    chunks: None,
                }),
                Some(mut chunks) => {
                    let mut echoed = Vec::new();
                    loop {
                        match chunks.next().await? {
                            StreamNext::Chunk(chunk) => echoed.push(chunk),
                            StreamNext::End | StreamNext::Done => break,
                        }
                    }
                    Ok(StreamingData::with_chunks(call.value, VecChunks::new(echoed)))
                }
            }
        })
    }

    fn handle_signal(
        &self,
        _signal: IncomingSignal,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

/// Connects a raw RPC pair with the given handler on the far side.
pub fn rpc_pair(handler: Arc<dyn CallHandler>) -> (Arc<Rpc>, Arc<Rpc>, Arc<PipeEndpoint>) {
    let (near_end, far_end) = MemoryPipe::pair();
    let near = Rpc::new(near_end.clone(), Arc::new(EchoHandler));
    let far = Rpc::new(far_end.clone(), handler);
    spawn_dispatch_loop(near_end.clone(), near.clone());
    spawn_dispatch_loop(far_end, far.clone());
    (near, far, near_end)
}
