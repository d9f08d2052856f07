//! Connection Pool Manager (C9): named pools of generic connections,
//! acquire/release with timeouts, idle reaping, and health checks.

use crate::error::{ExecutionError, MappingEngineError, Result, SystemicError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};

/// What a concrete resource type (a database connection, an HTTP client, a
/// lookup table handle, ...) exposes to the pool manager. Implementations
/// live with the resource they wrap; the pool only depends on this trait.
#[async_trait]
pub trait ConnectionFactory<T>: Send + Sync {
    async fn create(&self) -> Result<T>;
    async fn destroy(&self, conn: T);
    async fn validate(&self, _conn: &T) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub min: usize,
    pub max: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            min: 0,
            max: 10,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub created: AtomicU64,
    pub destroyed: AtomicU64,
    pub acquired: AtomicU64,
    pub released: AtomicU64,
    pub acquire_timeouts: AtomicU64,
    pub errors: AtomicU64,
}

impl Clone for PoolMetrics {
    fn clone(&self) -> Self {
        Self {
            created: AtomicU64::new(self.created.load(Ordering::Relaxed)),
            destroyed: AtomicU64::new(self.destroyed.load(Ordering::Relaxed)),
            acquired: AtomicU64::new(self.acquired.load(Ordering::Relaxed)),
            released: AtomicU64::new(self.released.load(Ordering::Relaxed)),
            acquire_timeouts: AtomicU64::new(self.acquire_timeouts.load(Ordering::Relaxed)),
            errors: AtomicU64::new(self.errors.load(Ordering::Relaxed)),
        }
    }
}

struct Idle<T> {
    conn: T,
    returned_at: Instant,
}

/// A single named pool of `T` connections. Waiters queue FIFO on a
/// `tokio::sync::Semaphore`, which already grants permits in acquisition
/// order; the idle list underneath is a plain `VecDeque` guarded by a
/// `tokio::sync::Mutex`, following the teacher's `StateManager`/`WatermarkManager`
/// "DashMap-keyed, Mutex/RwLock-guarded interior state" idiom in `stream.rs`.
pub struct ConnectionPool<T> {
    name: String,
    factory: Arc<dyn ConnectionFactory<T>>,
    options: PoolOptions,
    idle: Mutex<VecDeque<Idle<T>>>,
    permits: Semaphore,
    in_use: AtomicU64,
    pub metrics: PoolMetrics,
}

/// RAII guard returned by `acquire`; returns the connection to the idle list
/// on drop so release happens on every exit path (success, error, panic-safe
/// drop, or early return) without relying on the caller to remember.
pub struct PooledConnection<T: Send + 'static> {
    conn: Option<T>,
    pool: Arc<ConnectionPool<T>>,
}

impl<T: Send + 'static> PooledConnection<T> {
    pub fn get(&self) -> &T {
        self.conn.as_ref().expect("connection present until drop")
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<T: Send + 'static> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = self.pool.clone();
            tokio::spawn(async move {
                pool.release(conn).await;
            });
        }
    }
}

impl<T: Send + 'static> ConnectionPool<T> {
    pub fn new(name: impl Into<String>, factory: Arc<dyn ConnectionFactory<T>>, options: PoolOptions) -> Arc<Self> {
        let max = options.max;
        Arc::new(Self {
            name: name.into(),
            factory,
            options,
            idle: Mutex::new(VecDeque::new()),
            permits: Semaphore::new(max),
            in_use: AtomicU64::new(0),
            metrics: PoolMetrics::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks up to `acquire_timeout_ms`, returning `AcquireTimeout` on
    /// expiry. Waiters are released in FIFO order by the semaphore.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection<T>> {
        let permit = tokio::time::timeout(self.options.acquire_timeout, self.permits.acquire())
            .await
            .map_err(|_| {
                self.metrics.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                MappingEngineError::from(ExecutionError::AcquireTimeout {
                    resource: self.name.clone(),
                    timeout_ms: self.options.acquire_timeout.as_millis() as u64,
                })
            })?
            .expect("semaphore is never closed");
        permit.forget();

        let mut idle = self.idle.lock().await;
        let conn = if let Some(existing) = idle.pop_front() {
            drop(idle);
            if self.factory.validate(&existing.conn).await {
                existing.conn
            } else {
                self.factory.destroy(existing.conn).await;
                self.metrics.destroyed.fetch_add(1, Ordering::Relaxed);
                self.create_one().await?
            }
        } else {
            drop(idle);
            self.create_one().await?
        };

        self.in_use.fetch_add(1, Ordering::Relaxed);
        self.metrics.acquired.fetch_add(1, Ordering::Relaxed);
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.clone(),
        })
    }

    async fn create_one(&self) -> Result<T> {
        match self.factory.create().await {
            Ok(conn) => {
                self.metrics.created.fetch_add(1, Ordering::Relaxed);
                Ok(conn)
            }
            Err(err) => {
                self.metrics.errors.fetch_add(1, Ordering::Relaxed);
                self.permits.add_permits(1);
                Err(err)
            }
        }
    }

    async fn release(&self, conn: T) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.metrics.released.fetch_add(1, Ordering::Relaxed);
        self.idle.lock().await.push_back(Idle {
            conn,
            returned_at: Instant::now(),
        });
        self.permits.add_permits(1);
    }

    /// Acquires, runs `f`, and releases on every exit path via the guard's
    /// `Drop` impl -- the idiomatic Rust answer to spec 4.9's "guaranteed
    /// release on all exit paths" requirement.
    pub async fn execute_with_connection<F, Fut, R>(self: &Arc<Self>, f: F) -> Result<R>
    where
        F: FnOnce(&T) -> Fut,
        Fut: std::future::Future<Output = Result<R>>,
    {
        let guard = self.acquire().await?;
        f(guard.get()).await
    }

    /// Destroys idle connections that have sat beyond `idle_timeout`.
    pub async fn reap_idle(&self) {
        let mut idle = self.idle.lock().await;
        let timeout = self.options.idle_timeout;
        let mut keep = VecDeque::with_capacity(idle.len());
        while let Some(entry) = idle.pop_front() {
            if entry.returned_at.elapsed() > timeout {
                self.factory.destroy(entry.conn).await;
                self.metrics.destroyed.fetch_add(1, Ordering::Relaxed);
            } else {
                keep.push_back(entry);
            }
        }
        *idle = keep;
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed) as usize
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    pub fn max(&self) -> usize {
        self.options.max
    }

    /// Drains all idle connections; `in_use` connections finish naturally as
    /// their guards drop.
    pub async fn shutdown(&self) {
        let mut idle = self.idle.lock().await;
        while let Some(entry) = idle.pop_front() {
            self.factory.destroy(entry.conn).await;
            self.metrics.destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Type-erased handle used by stages/enrichment that only need a keyed
/// string lookup against a named pool resource, without depending on the
/// pool's element type directly.
#[async_trait]
pub trait PoolLookup: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<serde_json::Value>;
}

/// Registry of named pools (spec 3's "Connection pool" + 4.9's
/// `createPool`/registry), held by the engine facade and passed to
/// collaborators explicitly rather than as a module-level singleton (spec
/// section 9 redesign note).
#[derive(Default)]
pub struct ConnectionPoolRegistry {
    lookups: DashMap<String, Arc<dyn PoolLookup>>,
}

impl ConnectionPoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, lookup: Arc<dyn PoolLookup>) {
        self.lookups.insert(name.into(), lookup);
    }

    pub fn names(&self) -> Vec<String> {
        self.lookups.iter().map(|entry| entry.key().clone()).collect()
    }

    pub async fn lookup(&self, pool: &str, key: &str) -> Result<serde_json::Value> {
        let entry = self.lookups.get(pool).ok_or_else(|| {
            MappingEngineError::from(SystemicError::PoolExhausted {
                pool: pool.to_string(),
                in_use: 0,
                max: 0,
            })
        })?;
        entry.lookup(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingFactory {
        created: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionFactory<u32> for CountingFactory {
        async fn create(&self) -> Result<u32> {
            Ok(self.created.fetch_add(1, Ordering::SeqCst) as u32)
        }

        async fn destroy(&self, _conn: u32) {}
    }

    #[tokio::test]
    async fn acquire_and_release_round_trips() {
        let factory = Arc::new(CountingFactory { created: AtomicUsize::new(0) });
        let pool = ConnectionPool::new("test", factory, PoolOptions { max: 2, ..Default::default() });

        {
            let conn = pool.acquire().await.unwrap();
            assert_eq!(pool.in_use(), 1);
            let _ = conn.get();
        }
        // Release happens on a spawned task; yield until it lands.
        for _ in 0..50 {
            if pool.in_use() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn in_use_never_exceeds_max() {
        let factory = Arc::new(CountingFactory { created: AtomicUsize::new(0) });
        let pool = ConnectionPool::new("test", factory, PoolOptions { max: 1, ..Default::default() });

        let first = pool.acquire().await.unwrap();
        assert_eq!(pool.in_use(), 1);

        let second_result = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(second_result.is_err(), "second acquire should block while pool is exhausted");
        drop(first);
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let factory = Arc::new(CountingFactory { created: AtomicUsize::new(0) });
        let pool = ConnectionPool::new(
            "test",
            factory,
            PoolOptions { max: 1, acquire_timeout: Duration::from_millis(20), ..Default::default() },
        );
        let _held = pool.acquire().await.unwrap();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(MappingEngineError::Execution { source: ExecutionError::AcquireTimeout { .. } })));
    }
}
