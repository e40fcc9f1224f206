//! Executes read queries and applies mutations.
//!
//! Reads run inside transactions on acquired store handles. Plain reads
//! fetch eagerly and columnar; streaming reads hand the handle to a
//! blocking pump task that yields bounded chunks through a capacity-1
//! channel, re-checking a merged cancel-or-timeout signal between
//! yields. Every exit path funnels through one cleanup point that drops
//! the cursor, rolls back, clears the handle's busy claim, and returns
//! the handle to the pool.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use grid_common::{
    ActionSet, ApplyResultSet, CellValue, DocAction, EngineError, EngineResult, Query, QueryResult,
    StreamingHeader, StreamingOptions, TableColValues,
};
use grid_rpc::CancelSignal;

use crate::apply::apply_all;
use crate::cell::{cell_from_sql, SqlCell};
use crate::pool::{ConnectionPool, PooledHandle, StoreHandle};
use crate::sql::{build_fetch_sql, SqlQuery};
use crate::store_err;

/// One chunk of positional rows.
pub type RowChunk = Vec<Vec<CellValue>>;

/// Poll interval while the chunk channel is full.
const SEND_POLL: Duration = Duration::from_millis(10);

type ListenerCallback = Arc<dyn Fn(&ActionSet) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    callback: ListenerCallback,
}

/// The streaming query engine.
pub struct QueryEngine {
    pool: Arc<ConnectionPool>,
    action_num: Arc<AtomicU64>,
    listeners: Arc<Mutex<Vec<ListenerEntry>>>,
    next_listener_id: AtomicU64,
}

impl QueryEngine {
    /// Creates an engine over the given pool.
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>) -> Arc<QueryEngine> {
        Arc::new(QueryEngine {
            pool,
            action_num: Arc::new(AtomicU64::new(0)),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
        })
    }

    /// Returns the engine's current action number.
    ///
    /// The counter is owned by this engine instance: it is bumped per
    /// successful [`QueryEngine::apply_actions`] and sampled by reads
    /// after their transaction begins. It is not durable across
    /// restarts; a fresh engine resumes at 0.
    #[must_use]
    pub fn action_num(&self) -> u64 {
        self.action_num.load(Ordering::SeqCst)
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Runs a read query eagerly, returning columnar table data.
    pub async fn fetch_query(&self, query: &Query) -> EngineResult<QueryResult> {
        let sql = build_fetch_sql(query)?;
        let table_id = query.table_id.clone();
        let pooled = self.pool.acquire().await?;
        let counter = Arc::clone(&self.action_num);

        tokio::task::spawn_blocking(move || {
            let handle = pooled.store_handle();
            handle.try_begin()?;
            let conn = handle.lock_conn();
            let outcome = (|| {
                conn.execute_batch("BEGIN").map_err(store_err)?;
                let action_num = counter.load(Ordering::SeqCst);
                let data = collect_table(&conn, &sql);
                let _ = conn.execute_batch("ROLLBACK");
                Ok((action_num, data?))
            })();
            drop(conn);
            handle.end();
            drop(pooled);
            let (action_num, table_data) = outcome?;
            Ok(QueryResult {
                table_id,
                action_num,
                table_data,
            })
        })
        .await
        .map_err(EngineError::store)?
    }

    /// Runs a read query as a streaming result.
    ///
    /// The caller's cancel signal is combined with a timeout signal of
    /// `timeout_ms`; firing either rolls back the transaction and ends
    /// the chunk sequence with the cancellation reason.
    pub async fn fetch_query_streaming(
        &self,
        query: &Query,
        options: &StreamingOptions,
        cancel: CancelSignal,
    ) -> EngineResult<QueryResultStreaming> {
        options.validate()?;
        let sql = build_fetch_sql(query)?;
        let pooled = self.pool.acquire().await?;
        let merged = CancelSignal::merged(
            &cancel,
            &CancelSignal::after(Duration::from_millis(options.timeout_ms), "query timed out"),
        );
        start_stream(
            pooled.store_handle(),
            Some(pooled),
            sql,
            query.table_id.clone(),
            *options,
            merged,
            Arc::clone(&self.action_num),
        )
        .await
    }

    /// Applies a set of doc actions atomically, then notifies listeners
    /// with the (possibly stripped) action set.
    pub async fn apply_actions(&self, actions: Vec<DocAction>) -> EngineResult<ApplyResultSet> {
        let pooled = self.pool.acquire().await?;
        let (results, actions) = tokio::task::spawn_blocking(move || {
            let handle = pooled.store_handle();
            handle.try_begin()?;
            let conn = handle.lock_conn();
            let outcome = (|| {
                // Immediate mode takes the write lock up front so
                // concurrent readers never observe a half-applied set.
                conn.execute_batch("BEGIN IMMEDIATE").map_err(store_err)?;
                match apply_all(&conn, &actions) {
                    Ok(results) => match conn.execute_batch("COMMIT") {
                        Ok(()) => Ok(results),
                        Err(error) => {
                            let _ = conn.execute_batch("ROLLBACK");
                            Err(store_err(error))
                        }
                    },
                    Err(error) => {
                        let _ = conn.execute_batch("ROLLBACK");
                        Err(error)
                    }
                }
            })();
            drop(conn);
            handle.end();
            drop(pooled);
            outcome.map(|results| (results, actions))
        })
        .await
        .map_err(EngineError::store)??;

        let action_num = self.action_num.fetch_add(1, Ordering::SeqCst) + 1;
        let set = ActionSet {
            action_num,
            actions,
        };
        self.notify_listeners(&set.for_broadcast());
        Ok(ApplyResultSet { results })
    }

    /// Registers an action listener. The listener is removed when the
    /// returned guard is dropped.
    pub fn add_action_listener(
        &self,
        callback: impl Fn(&ActionSet) + Send + Sync + 'static,
    ) -> ListenerGuard {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push(ListenerEntry {
            id,
            callback: Arc::new(callback),
        });
        ListenerGuard {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    fn notify_listeners(&self, set: &ActionSet) {
        let callbacks: Vec<ListenerCallback> = self
            .listeners
            .lock()
            .iter()
            .map(|entry| Arc::clone(&entry.callback))
            .collect();
        debug!(
            action_num = set.action_num,
            listeners = callbacks.len(),
            "broadcasting action set"
        );
        for callback in callbacks {
            callback(set);
        }
    }
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("action_num", &self.action_num())
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

/// Unregisters its action listener on drop.
pub struct ListenerGuard {
    id: u64,
    listeners: Weak<Mutex<Vec<ListenerEntry>>>,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().retain(|entry| entry.id != self.id);
        }
    }
}

/// A streaming query result: the header plus a lazy chunk sequence.
#[derive(Debug)]
pub struct QueryResultStreaming {
    /// Table id, action number, and column ids for the row arrays.
    pub value: StreamingHeader,
    /// The lazy chunk sequence.
    pub chunks: RowChunks,
}

/// The consumer side of a streaming read.
///
/// The raw row cursor opens on first consumption; dropping (or closing)
/// this ends the read and releases its transaction and handle.
#[derive(Debug)]
pub struct RowChunks {
    rx: mpsc::Receiver<EngineResult<RowChunk>>,
    start: Option<oneshot::Sender<()>>,
    done: bool,
}

impl RowChunks {
    /// Returns the next chunk, `None` at the end of the sequence, or the
    /// cancellation/store error that terminated it.
    pub async fn next(&mut self) -> Option<EngineResult<RowChunk>> {
        if self.done {
            return None;
        }
        if let Some(start) = self.start.take() {
            let _ = start.send(());
        }
        match self.rx.recv().await {
            None => {
                self.done = true;
                None
            }
            Some(Err(error)) => {
                self.done = true;
                Some(Err(error))
            }
            Some(chunk) => Some(chunk),
        }
    }

    /// Abandons the read; the pump rolls back and releases its handle.
    pub fn close(&mut self) {
        self.start = None;
        self.rx.close();
        self.done = true;
    }
}

/// Runs a streaming read directly on a handle, outside any pool.
///
/// Used where the caller manages the handle itself; the same busy
/// contract applies. The reported action number is 0.
pub async fn stream_query(
    handle: &StoreHandle,
    query: &Query,
    options: &StreamingOptions,
    cancel: CancelSignal,
) -> EngineResult<QueryResultStreaming> {
    options.validate()?;
    let sql = build_fetch_sql(query)?;
    let merged = CancelSignal::merged(
        &cancel,
        &CancelSignal::after(Duration::from_millis(options.timeout_ms), "query timed out"),
    );
    start_stream(
        handle.clone(),
        None,
        sql,
        query.table_id.clone(),
        *options,
        merged,
        Arc::new(AtomicU64::new(0)),
    )
    .await
}

async fn start_stream(
    handle: StoreHandle,
    guard: Option<PooledHandle>,
    sql: SqlQuery,
    table_id: String,
    options: StreamingOptions,
    cancel: CancelSignal,
    counter: Arc<AtomicU64>,
) -> EngineResult<QueryResultStreaming> {
    handle.try_begin()?;

    let (setup_tx, setup_rx) = oneshot::channel();
    let (start_tx, start_rx) = oneshot::channel();
    let (chunk_tx, chunk_rx) = mpsc::channel(1);

    let pump_handle = handle.clone();
    tokio::task::spawn_blocking(move || {
        pump(
            pump_handle, guard, sql, options, cancel, counter, setup_tx, start_rx, chunk_tx,
        );
    });

    let (col_ids, action_num) = setup_rx
        .await
        .map_err(|_| EngineError::Store("streaming read setup aborted".to_string()))??;
    Ok(QueryResultStreaming {
        value: StreamingHeader {
            table_id,
            action_num,
            col_ids,
        },
        chunks: RowChunks {
            rx: chunk_rx,
            start: Some(start_tx),
            done: false,
        },
    })
}

type SetupResult = EngineResult<(Vec<String>, u64)>;

/// The blocking pump owning the handle for the read's duration. All
/// exits fall through to the cleanup tail below the cursor loop.
#[allow(clippy::too_many_arguments)]
fn pump(
    handle: StoreHandle,
    guard: Option<PooledHandle>,
    sql: SqlQuery,
    options: StreamingOptions,
    cancel: CancelSignal,
    counter: Arc<AtomicU64>,
    setup_tx: oneshot::Sender<SetupResult>,
    start_rx: oneshot::Receiver<()>,
    chunk_tx: mpsc::Sender<EngineResult<RowChunk>>,
) {
    let conn = handle.lock_conn();
    if let Err(error) = conn.execute_batch("BEGIN").map_err(store_err) {
        drop(conn);
        handle.end();
        drop(guard);
        let _ = setup_tx.send(Err(error));
        return;
    }
    let action_num = counter.load(Ordering::SeqCst);
    run_cursor(
        &conn, &sql, options, &cancel, action_num, setup_tx, start_rx, &chunk_tx,
    );
    let _ = conn.execute_batch("ROLLBACK");
    drop(conn);
    handle.end();
    drop(guard);
}

#[allow(clippy::too_many_arguments)]
fn run_cursor(
    conn: &Connection,
    sql: &SqlQuery,
    options: StreamingOptions,
    cancel: &CancelSignal,
    action_num: u64,
    setup_tx: oneshot::Sender<SetupResult>,
    start_rx: oneshot::Receiver<()>,
    chunk_tx: &mpsc::Sender<EngineResult<RowChunk>>,
) {
    let mut stmt = match conn.prepare(&sql.sql) {
        Ok(stmt) => stmt,
        Err(error) => {
            let _ = setup_tx.send(Err(store_err(error)));
            return;
        }
    };
    let col_ids: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();
    let col_count = col_ids.len();
    if setup_tx.send(Ok((col_ids, action_num))).is_err() {
        return;
    }

    // The raw cursor opens lazily, on the consumer's first pull. A
    // dropped sender means the read was abandoned before consumption.
    if start_rx.blocking_recv().is_err() {
        return;
    }
    if send_abort_if_cancelled(chunk_tx, cancel) {
        return;
    }

    let params = rusqlite::params_from_iter(sql.params.iter().map(SqlCell));
    let mut rows = match stmt.query(params) {
        Ok(rows) => rows,
        Err(error) => {
            let _ = chunk_tx.blocking_send(Err(store_err(error)));
            return;
        }
    };

    loop {
        let mut chunk: RowChunk = Vec::with_capacity(options.chunk_rows);
        let finished = loop {
            match rows.next() {
                Ok(Some(row)) => {
                    match row_cells(row, col_count) {
                        Ok(cells) => chunk.push(cells),
                        Err(error) => {
                            let _ = chunk_tx.blocking_send(Err(error));
                            return;
                        }
                    }
                    if chunk.len() >= options.chunk_rows {
                        break false;
                    }
                }
                Ok(None) => break true,
                Err(error) => {
                    let _ = chunk_tx.blocking_send(Err(store_err(error)));
                    return;
                }
            }
        };
        if !chunk.is_empty() && !deliver(chunk_tx, cancel, chunk) {
            return;
        }
        if finished {
            return;
        }
        if send_abort_if_cancelled(chunk_tx, cancel) {
            return;
        }
    }
}

/// Reports a fired cancel signal as the terminal error. Returns whether
/// the read should stop.
fn send_abort_if_cancelled(
    chunk_tx: &mpsc::Sender<EngineResult<RowChunk>>,
    cancel: &CancelSignal,
) -> bool {
    match cancel.reason() {
        Some(reason) => {
            let _ = chunk_tx.blocking_send(Err(EngineError::Aborted(reason)));
            true
        }
        None => false,
    }
}

/// Delivers a chunk, polling while the channel is full so a fired
/// cancel signal can still end a read whose consumer has gone idle. If
/// cancellation fires while blocked, the undelivered chunk is replaced
/// by the cancellation reason. Returns false if the read should stop.
fn deliver(
    chunk_tx: &mpsc::Sender<EngineResult<RowChunk>>,
    cancel: &CancelSignal,
    chunk: RowChunk,
) -> bool {
    let mut item = Ok(chunk);
    loop {
        match chunk_tx.try_send(item) {
            Ok(()) => return true,
            Err(mpsc::error::TrySendError::Full(back)) => {
                if let Some(reason) = cancel.reason() {
                    let _ = chunk_tx.blocking_send(Err(EngineError::Aborted(reason)));
                    return false;
                }
                item = back;
                std::thread::sleep(SEND_POLL);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return false,
        }
    }
}

fn row_cells(row: &rusqlite::Row<'_>, col_count: usize) -> EngineResult<Vec<CellValue>> {
    (0..col_count)
        .map(|i| row.get_ref(i).map(cell_from_sql).map_err(store_err))
        .collect()
}

fn collect_table(conn: &Connection, sql: &SqlQuery) -> EngineResult<TableColValues> {
    let mut stmt = conn.prepare(&sql.sql).map_err(store_err)?;
    let col_ids: Vec<String> = stmt.column_names().iter().map(ToString::to_string).collect();
    let col_count = col_ids.len();
    let id_index = col_ids
        .iter()
        .position(|name| name == "id")
        .ok_or_else(|| EngineError::Store("query result has no id column".to_string()))?;

    let mut id = Vec::new();
    let mut columns: Vec<(String, Vec<CellValue>)> = Vec::new();
    let mut slots: Vec<Option<usize>> = Vec::with_capacity(col_count);
    for (index, name) in col_ids.iter().enumerate() {
        if index == id_index {
            slots.push(None);
        } else {
            slots.push(Some(columns.len()));
            columns.push((name.clone(), Vec::new()));
        }
    }

    let params = rusqlite::params_from_iter(sql.params.iter().map(SqlCell));
    let mut rows = stmt.query(params).map_err(store_err)?;
    while let Some(row) = rows.next().map_err(store_err)? {
        for (index, slot) in slots.iter().enumerate() {
            let cell = cell_from_sql(row.get_ref(index).map_err(store_err)?);
            match slot {
                None => id.push(cell.as_int().ok_or_else(|| {
                    EngineError::Store("row id is not an integer".to_string())
                })?),
                Some(column) => columns[*column].1.push(cell),
            }
        }
    }
    Ok(TableColValues { id, columns })
}

#[cfg(test)]
mod tests {
    use super::*;
    use grid_common::{QueryCursor, StreamingOptions};
    use grid_rpc::CancelSource;
    use serde_json::json;
    use tempfile::TempDir;

    use crate::pool::PoolConfig;

    fn engine_in(dir: &TempDir) -> Arc<QueryEngine> {
        let pool =
            ConnectionPool::new(PoolConfig::new(dir.path().join("engine.db"))).unwrap();
        QueryEngine::new(pool)
    }

    async fn seed_table1(engine: &QueryEngine, rows: i64) {
        engine
            .apply_actions(vec![DocAction::from_json(&json!([
                "AddTable",
                "Table1",
                [{"id": "Name", "type": "Text"}, {"id": "Age", "type": "Int"}]
            ]))
            .unwrap()])
            .await
            .unwrap();
        let row_ids: Vec<i64> = (1..=rows).collect();
        let names: Vec<String> = row_ids.iter().map(|i| format!("N{i}")).collect();
        let ages: Vec<i64> = row_ids.iter().map(|i| i * 10).collect();
        engine
            .apply_actions(vec![DocAction::from_json(&json!([
                "BulkAddRecord",
                "Table1",
                row_ids,
                {"Name": names, "Age": ages}
            ]))
            .unwrap()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fetch_query_roundtrip() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        seed_table1(&engine, 3).await;

        let result = engine.fetch_query(&Query::table("Table1")).await.unwrap();
        assert_eq!(result.table_id, "Table1");
        assert_eq!(result.action_num, 2);
        assert_eq!(result.table_data.id, vec![1, 2, 3]);
        assert_eq!(
            result.table_data.col("Name").unwrap(),
            &vec![
                CellValue::Text("N1".into()),
                CellValue::Text("N2".into()),
                CellValue::Text("N3".into())
            ]
        );
        assert_eq!(
            result.table_data.col("Age").unwrap(),
            &vec![CellValue::Int(10), CellValue::Int(20), CellValue::Int(30)]
        );
    }

    #[tokio::test]
    async fn test_fetch_query_filter_and_sort() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        seed_table1(&engine, 3).await;

        let query = Query {
            filters: Some(json!(["GtE", ["Name", "Age"], ["Const", 20]])),
            sort: Some(vec!["-Age".into()]),
            ..Query::table("Table1")
        };
        let result = engine.fetch_query(&query).await.unwrap();
        assert_eq!(result.table_data.id, vec![3, 2]);
    }

    #[tokio::test]
    async fn test_fetch_query_column_projection_order() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        seed_table1(&engine, 2).await;

        let query = Query {
            columns: Some(vec!["Age".into(), "Name".into()]),
            ..Query::table("Table1")
        };
        let result = engine.fetch_query(&query).await.unwrap();
        let names: Vec<&str> = result
            .table_data
            .columns
            .iter()
            .map(|(name, _)| name.as_str())
            .collect();
        assert_eq!(names, vec!["Age", "Name"]);
    }

    #[tokio::test]
    async fn test_cursor_pagination() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        seed_table1(&engine, 30).await;

        let mut cursor = None;
        let mut batches = Vec::new();
        loop {
            let query = Query {
                sort: Some(vec!["id".into()]),
                limit: Some(10),
                cursor: cursor.clone(),
                ..Query::table("Table1")
            };
            let result = engine.fetch_query(&query).await.unwrap();
            if result.table_data.id.is_empty() {
                break;
            }
            cursor = Some(QueryCursor::after(vec![json!(
                *result.table_data.id.last().unwrap()
            )]));
            batches.push(result.table_data.id);
        }
        assert_eq!(batches.len(), 3);
        let all: Vec<i64> = batches.into_iter().flatten().collect();
        assert_eq!(all, (1..=30).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_include_previous() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        seed_table1(&engine, 3).await;

        let query = Query {
            sort: Some(vec!["-Age".into()]),
            include_previous: true,
            ..Query::table("Table1")
        };
        let result = engine.fetch_query(&query).await.unwrap();
        // Order is Age descending: ids 3, 2, 1; each row's previous is
        // the one before it, null for the first.
        assert_eq!(result.table_data.id, vec![3, 2, 1]);
        assert_eq!(
            result.table_data.col("_grist_Previous").unwrap(),
            &vec![CellValue::Null, CellValue::Int(3), CellValue::Int(2)]
        );
    }

    #[tokio::test]
    async fn test_streaming_matches_eager_fetch() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        seed_table1(&engine, 25).await;

        let query = Query {
            sort: Some(vec!["id".into()]),
            ..Query::table("Table1")
        };
        let options = StreamingOptions {
            timeout_ms: 10_000,
            chunk_rows: 7,
        };
        let mut streamed = engine
            .fetch_query_streaming(&query, &options, CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(streamed.value.table_id, "Table1");
        assert_eq!(streamed.value.col_ids, vec!["id", "Name", "Age"]);

        let mut rows = Vec::new();
        let mut chunk_sizes = Vec::new();
        while let Some(chunk) = streamed.chunks.next().await {
            let chunk = chunk.unwrap();
            chunk_sizes.push(chunk.len());
            rows.extend(chunk);
        }
        assert!(chunk_sizes.iter().all(|size| *size <= 7));
        assert_eq!(chunk_sizes, vec![7, 7, 7, 4]);

        let eager = engine.fetch_query(&query).await.unwrap();
        assert_eq!(rows.len(), eager.table_data.row_count());
        let streamed_ids: Vec<i64> = rows
            .iter()
            .map(|row| row[0].as_int().unwrap())
            .collect();
        assert_eq!(streamed_ids, eager.table_data.id);
    }

    #[tokio::test]
    async fn test_streaming_cancel_mid_read() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        seed_table1(&engine, 50).await;

        let source = CancelSource::new();
        let options = StreamingOptions {
            timeout_ms: 60_000,
            chunk_rows: 10,
        };
        let mut streamed = engine
            .fetch_query_streaming(
                &Query::table("Table1"),
                &options,
                source.signal(),
            )
            .await
            .unwrap();

        let first = streamed.chunks.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 10);
        source.fire("caller gave up");

        // The pump re-checks the signal between yields; consumption soon
        // observes the cancellation reason.
        let mut saw_abort = false;
        while let Some(chunk) = streamed.chunks.next().await {
            if let Err(error) = chunk {
                assert_eq!(error, EngineError::Aborted("caller gave up".into()));
                saw_abort = true;
                break;
            }
        }
        assert!(saw_abort);
    }

    #[tokio::test]
    async fn test_streaming_timeout_zero_cancels_immediately() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        seed_table1(&engine, 5).await;

        let options = StreamingOptions {
            timeout_ms: 0,
            chunk_rows: 2,
        };
        let mut streamed = engine
            .fetch_query_streaming(&Query::table("Table1"), &options, CancelSignal::never())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut saw_abort = false;
        while let Some(chunk) = streamed.chunks.next().await {
            if chunk.is_err() {
                saw_abort = true;
                break;
            }
        }
        assert!(saw_abort);
    }

    #[tokio::test]
    async fn test_store_busy_on_overlapping_streams() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        seed_table1(&engine, 20).await;

        let handle = StoreHandle::open(&dir.path().join("engine.db")).unwrap();
        let options = StreamingOptions {
            timeout_ms: 60_000,
            chunk_rows: 5,
        };
        let query = Query::table("Table1");

        let mut first = stream_query(&handle, &query, &options, CancelSignal::never())
            .await
            .unwrap();
        let _ = first.chunks.next().await.unwrap().unwrap();

        // Overlapping read on the same handle fails fast.
        let second = stream_query(&handle, &query, &options, CancelSignal::never()).await;
        assert!(matches!(second, Err(EngineError::StoreBusy)));

        // Aborting the first frees the handle for a fresh read.
        first.chunks.close();
        let mut third = None;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            match stream_query(&handle, &query, &options, CancelSignal::never()).await {
                Ok(streaming) => {
                    third = Some(streaming);
                    break;
                }
                Err(EngineError::StoreBusy) => continue,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        let mut third = third.expect("handle stayed busy after close");
        assert!(third.chunks.next().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_apply_actions_atomicity() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        seed_table1(&engine, 2).await;
        let before = engine.fetch_query(&Query::table("Table1")).await.unwrap();

        // Second action targets a missing table; the whole set fails.
        let error = engine
            .apply_actions(vec![
                DocAction::from_json(&json!([
                    "BulkAddRecord", "Table1", [10], {"Name": ["late"], "Age": [1]}
                ]))
                .unwrap(),
                DocAction::from_json(&json!(["BulkRemoveRecord", "NoSuchTable", [1]]))
                    .unwrap(),
            ])
            .await
            .unwrap_err();
        assert!(matches!(error, EngineError::Store(_)));

        let after = engine.fetch_query(&Query::table("Table1")).await.unwrap();
        assert_eq!(after.table_data, before.table_data);
        assert_eq!(after.action_num, before.action_num);
    }

    #[tokio::test]
    async fn test_listeners_notified_and_stripped() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        seed_table1(&engine, 1).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let guard = engine.add_action_listener(move |set: &ActionSet| {
            let _ = tx.send(set.clone());
        });

        let big: Vec<i64> = (100..=300).collect();
        let names: Vec<String> = big.iter().map(|i| format!("R{i}")).collect();
        let ages: Vec<i64> = big.iter().map(|_| 1).collect();
        engine
            .apply_actions(vec![DocAction::from_json(&json!([
                "BulkAddRecord", "Table1", big, {"Name": names, "Age": ages}
            ]))
            .unwrap()])
            .await
            .unwrap();

        let set = rx.recv().await.unwrap();
        assert_eq!(set.actions.len(), 1);
        // 201 rows exceeds the small-action threshold: stripped.
        assert_eq!(set.actions[0].row_count(), 0);
        match &set.actions[0] {
            DocAction::BulkAddRecord { columns, .. } => {
                assert!(columns.contains_key("Name"));
                assert!(columns["Name"].is_empty());
            }
            other => panic!("unexpected action {other:?}"),
        }

        // Dropped guard unregisters the listener.
        drop(guard);
        engine
            .apply_actions(vec![DocAction::from_json(&json!([
                "BulkRemoveRecord", "Table1", [1]
            ]))
            .unwrap()])
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_action_num_increments_per_apply() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        assert_eq!(engine.action_num(), 0);
        seed_table1(&engine, 1).await;
        assert_eq!(engine.action_num(), 2);
    }

    #[tokio::test]
    async fn test_builder_error_before_io() {
        let dir = TempDir::new().unwrap();
        let engine = engine_in(&dir);
        let query = Query {
            filters: Some(json!(["Explode"])),
            ..Query::table("Table1")
        };
        let error = engine.fetch_query(&query).await.unwrap_err();
        assert!(matches!(error, EngineError::Builder(_)));
    }
}
