//! A bounded pool of store handles.
//!
//! Handles are SQLite connections wrapped for sharing with blocking
//! tasks. The pool is a stack: `acquire` pops a handle or opens a new
//! one, `release` pushes it back. The bound is a documented choice:
//! acquisition waits up to `acquire_timeout` for a permit and then
//! fails rather than growing without limit.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use rusqlite::Connection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use grid_common::{EngineError, EngineResult};

use crate::store_err;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Path of the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum number of handles.
    pub max_handles: usize,
    /// How long `acquire` waits for a free handle before failing.
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    /// Creates a configuration for the given database file.
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        PoolConfig {
            db_path: db_path.into(),
            max_handles: 10,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    /// Sets the maximum number of handles.
    #[must_use]
    pub fn max_handles(mut self, max: usize) -> Self {
        self.max_handles = max;
        self
    }

    /// Sets the acquire timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_handles == 0 {
            return Err(EngineError::InvalidConfig(
                "max_handles must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// A snapshot of the pool's counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolMetrics {
    /// Handles created over the pool's lifetime.
    pub total_connections: usize,
    /// Handles currently checked out.
    pub in_use_connections: usize,
}

struct HandleInner {
    id: u64,
    conn: Mutex<Connection>,
    busy: AtomicBool,
}

/// One connection to the underlying store, usable by one task at a time.
///
/// The handle is cheaply cloneable so a blocking pump task can own a
/// copy for the duration of a read. The busy flag serializes
/// transactions per handle: a second streaming read on a busy handle
/// fails with [`EngineError::StoreBusy`] until the first is closed or
/// aborted.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<HandleInner>,
}

impl StoreHandle {
    /// Opens a standalone handle on the given database file.
    pub fn open(path: &Path) -> EngineResult<StoreHandle> {
        Self::open_with_id(path, 0)
    }

    fn open_with_id(path: &Path, id: u64) -> EngineResult<StoreHandle> {
        let conn = Connection::open(path).map_err(store_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA busy_timeout=5000;",
        )
        .map_err(store_err)?;
        Ok(StoreHandle {
            inner: Arc::new(HandleInner {
                id,
                conn: Mutex::new(conn),
                busy: AtomicBool::new(false),
            }),
        })
    }

    /// Returns the handle's id within its pool.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Claims the handle for a transaction; fails with store-busy if one
    /// is already running on it.
    pub(crate) fn try_begin(&self) -> EngineResult<()> {
        self.inner
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| EngineError::StoreBusy)
    }

    /// Releases the busy claim.
    pub(crate) fn end(&self) {
        self.inner.busy.store(false, Ordering::SeqCst);
    }

    /// Returns whether a transaction is running on this handle.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    /// Locks the underlying connection.
    pub(crate) fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.inner.conn.lock()
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("id", &self.inner.id)
            .field("busy", &self.is_busy())
            .finish()
    }
}

/// A bounded stack of store handles.
pub struct ConnectionPool {
    config: PoolConfig,
    handles: Mutex<Vec<StoreHandle>>,
    semaphore: Arc<Semaphore>,
    total: AtomicUsize,
    in_use: AtomicUsize,
    next_id: AtomicU64,
}

impl ConnectionPool {
    /// Creates a pool over the given database file.
    pub fn new(config: PoolConfig) -> EngineResult<Arc<ConnectionPool>> {
        config.validate()?;
        Ok(Arc::new(ConnectionPool {
            semaphore: Arc::new(Semaphore::new(config.max_handles)),
            handles: Mutex::new(Vec::new()),
            total: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
            config,
        }))
    }

    /// Acquires a handle, waiting up to the configured timeout.
    pub async fn acquire(self: &Arc<Self>) -> EngineResult<PooledHandle> {
        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            EngineError::Store(format!(
                "timed out acquiring a store handle after {:?}",
                self.config.acquire_timeout
            ))
        })?
        .map_err(|_| EngineError::Store("connection pool closed".to_string()))?;

        let handle = self.pop_or_create()?;
        self.in_use.fetch_add(1, Ordering::SeqCst);
        debug!(handle = handle.id(), metrics = ?self.metrics(), "acquired store handle");
        Ok(PooledHandle {
            pool: Arc::clone(self),
            handle: Some(handle),
            _permit: permit,
        })
    }

    /// Runs a synchronous callback on a handle, releasing it afterwards.
    ///
    /// Fail-fast: does not wait for a free handle, since the callback
    /// blocks the calling thread. Asynchronous users acquire and release
    /// explicitly because holding a handle across an await can starve
    /// the pool.
    pub fn with_db<R>(
        self: &Arc<Self>,
        callback: impl FnOnce(&Connection) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let permit = self
            .semaphore
            .clone()
            .try_acquire_owned()
            .map_err(|_| EngineError::Store("connection pool exhausted".to_string()))?;
        let handle = self.pop_or_create()?;
        self.in_use.fetch_add(1, Ordering::SeqCst);
        let result = {
            let conn = handle.lock_conn();
            callback(&conn)
        };
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        self.handles.lock().push(handle);
        drop(permit);
        result
    }

    /// Returns the pool's counters for logging.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            total_connections: self.total.load(Ordering::SeqCst),
            in_use_connections: self.in_use.load(Ordering::SeqCst),
        }
    }

    fn pop_or_create(&self) -> EngineResult<StoreHandle> {
        if let Some(handle) = self.handles.lock().pop() {
            return Ok(handle);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = StoreHandle::open_with_id(&self.config.db_path, id)?;
        self.total.fetch_add(1, Ordering::SeqCst);
        debug!(handle = id, "opened new store handle");
        Ok(handle)
    }

    fn release(&self, handle: StoreHandle) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        debug!(handle = handle.id(), "released store handle");
        self.handles.lock().push(handle);
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("db_path", &self.config.db_path)
            .field("max_handles", &self.config.max_handles)
            .field("metrics", &self.metrics())
            .finish()
    }
}

/// A handle checked out of the pool; returned on drop.
pub struct PooledHandle {
    pool: Arc<ConnectionPool>,
    handle: Option<StoreHandle>,
    _permit: OwnedSemaphorePermit,
}

impl PooledHandle {
    /// Returns a clone of the underlying handle.
    #[must_use]
    pub fn store_handle(&self) -> StoreHandle {
        self.handle
            .as_ref()
            .expect("handle present until drop")
            .clone()
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

impl std::fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("handle", &self.handle)
            .finish()
    }
}
