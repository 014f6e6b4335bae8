use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use billscan_core::OcrConfig;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::recognizer::{Engine, EngineFactory, OcrError};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Timeout waiting for an OCR engine after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("OCR cancelled")]
    Cancelled,
    #[error("OCR engine pool has been shut down")]
    Disposed,
    #[error("Failed to start OCR engine: {0}")]
    Engine(#[from] OcrError),
}

struct IdleEngines<E> {
    engines: Vec<E>,
    closed: bool,
}

/// A bounded pool of recognition engines.
///
/// A semaphore with `capacity` permits gates checkouts. Engines are built
/// lazily behind that gate, so no more than `capacity` instances ever exist.
/// Share one pool per process through an `Arc`.
pub struct EnginePool<F: EngineFactory> {
    factory: Arc<F>,
    gate: Arc<Semaphore>,
    idle: Arc<Mutex<IdleEngines<F::Engine>>>,
    capacity: usize,
    rent_timeout: Duration,
}

impl<F: EngineFactory> EnginePool<F> {
    pub fn new(factory: F, capacity: usize, rent_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            factory: Arc::new(factory),
            gate: Arc::new(Semaphore::new(capacity)),
            idle: Arc::new(Mutex::new(IdleEngines { engines: Vec::new(), closed: false })),
            capacity,
            rent_timeout,
        }
    }

    pub fn from_config(factory: F, config: &OcrConfig) -> Self {
        Self::new(factory, config.max_engines, config.rent_timeout())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently held by a lease.
    pub fn available_slots(&self) -> usize {
        self.gate.available_permits()
    }

    /// Constructed engines waiting to be leased.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().engines.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.idle.lock().closed
    }

    /// Wait for a free slot and lease an engine.
    ///
    /// Fails with [`PoolError::Timeout`] once the configured rent timeout
    /// elapses, [`PoolError::Cancelled`] as soon as `cancel` fires, and
    /// [`PoolError::Disposed`] after [`shutdown`](Self::shutdown). On failure
    /// no lease exists and nothing is owed back to the pool.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<EngineLease<F::Engine>, PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::Disposed);
        }

        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::info!("Engine acquire cancelled by caller");
                return Err(PoolError::Cancelled);
            }
            waited = tokio::time::timeout(self.rent_timeout, Arc::clone(&self.gate).acquire_owned()) => {
                match waited {
                    Ok(Ok(permit)) => permit,
                    // The gate only closes on shutdown.
                    Ok(Err(_)) => return Err(PoolError::Disposed),
                    Err(_) => {
                        tracing::warn!(
                            "Timeout ({}ms) waiting for OCR engine (max_engines={})",
                            self.rent_timeout.as_millis(),
                            self.capacity
                        );
                        return Err(PoolError::Timeout(self.rent_timeout));
                    }
                }
            }
        };

        let reused = {
            let mut idle = self.idle.lock();
            if idle.closed {
                return Err(PoolError::Disposed);
            }
            idle.engines.pop()
        };

        let engine = match reused {
            Some(engine) => {
                tracing::debug!("Reusing OCR engine from pool");
                engine
            }
            None => {
                tracing::info!("Creating new OCR engine (max {})", self.capacity);
                let factory = Arc::clone(&self.factory);
                tokio::task::spawn_blocking(move || factory.create())
                    .await
                    .map_err(|e| OcrError::Worker(e.to_string()))??
            }
        };

        Ok(EngineLease {
            engine: Some(engine),
            idle: Arc::clone(&self.idle),
            _permit: permit,
        })
    }

    /// Return a leased engine. Equivalent to dropping the lease.
    pub fn release(&self, lease: EngineLease<F::Engine>) {
        lease.release();
    }

    /// Destroy idle engines and refuse further leases. Engines still leased
    /// are destroyed when their lease ends. Calling this twice is harmless.
    pub fn shutdown(&self) {
        let drained = {
            let mut idle = self.idle.lock();
            if idle.closed {
                return;
            }
            idle.closed = true;
            std::mem::take(&mut idle.engines)
        };
        self.gate.close();
        tracing::info!("OCR engine pool shut down, destroying {} idle engine(s)", drained.len());
        drop(drained);
    }
}

impl<F: EngineFactory> Drop for EnginePool<F> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Exclusive use of one pooled engine.
///
/// Only [`EnginePool::acquire`] creates leases. The lease is move-only, and
/// ending it (by [`release`](Self::release) or by drop) hands the engine back
/// exactly once: the engine goes to the idle list before the slot reopens, or
/// is destroyed if the pool has shut down meanwhile.
pub struct EngineLease<E: Engine> {
    engine: Option<E>,
    idle: Arc<Mutex<IdleEngines<E>>>,
    // Dropped after `Drop::drop` has returned the engine.
    _permit: OwnedSemaphorePermit,
}

impl<E: Engine> EngineLease<E> {
    pub fn engine_mut(&mut self) -> &mut E {
        self.engine
            .as_mut()
            .expect("engine is present until the lease is dropped")
    }

    pub fn release(self) {}
}

impl<E: Engine> fmt::Debug for EngineLease<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineLease")
            .field("engine_present", &self.engine.is_some())
            .finish_non_exhaustive()
    }
}

impl<E: Engine> Drop for EngineLease<E> {
    fn drop(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        if std::thread::panicking() {
            // The engine may be mid-call in an unknown state.
            tracing::warn!("Discarding OCR engine released while panicking");
            drop(engine);
            return;
        }
        let mut idle = self.idle.lock();
        if idle.closed {
            drop(idle);
            tracing::debug!("Destroying OCR engine returned after pool shutdown");
            drop(engine);
        } else {
            idle.engines.push(engine);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::MockEngineFactory;
    use std::time::Instant;

    fn pool(factory: MockEngineFactory, capacity: usize, timeout_ms: u64) -> Arc<EnginePool<MockEngineFactory>> {
        Arc::new(EnginePool::new(factory, capacity, Duration::from_millis(timeout_ms)))
    }

    #[tokio::test]
    async fn engines_are_built_lazily_and_reused() {
        let factory = MockEngineFactory::new("x");
        let pool = pool(factory.clone(), 2, 1000);
        let cancel = CancellationToken::new();
        assert_eq!(factory.created(), 0);

        let lease = pool.acquire(&cancel).await.unwrap();
        assert_eq!(factory.created(), 1);
        pool.release(lease);
        assert_eq!(pool.idle_count(), 1);

        let _lease = pool.acquire(&cancel).await.unwrap();
        assert_eq!(factory.created(), 1, "idle engine should be reused");
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn n_plus_k_acquires_let_exactly_n_through() {
        const N: usize = 3;
        const K: usize = 2;
        let factory = MockEngineFactory::new("x");
        let pool = pool(factory.clone(), N, 5000);
        let cancel = CancellationToken::new();

        let mut held = Vec::new();
        for _ in 0..N {
            held.push(pool.acquire(&cancel).await.unwrap());
        }
        assert_eq!(pool.available_slots(), 0);

        let mut waiters = Vec::new();
        for _ in 0..K {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            waiters.push(tokio::spawn(async move { pool.acquire(&cancel).await.map(drop) }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(waiters.iter().all(|w| !w.is_finished()), "waiters must block while pool is full");

        drop(held);
        for w in waiters {
            w.await.unwrap().unwrap();
        }
        assert!(factory.created() <= N);
        assert_eq!(pool.available_slots(), N);
    }

    #[tokio::test]
    async fn concurrent_load_never_exceeds_capacity() {
        const N: usize = 2;
        let factory = MockEngineFactory::new("x");
        let pool = pool(factory.clone(), N, 5000);
        let in_use = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = Arc::clone(&pool);
            let in_use = Arc::clone(&in_use);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                use std::sync::atomic::Ordering::SeqCst;
                let lease = pool.acquire(&CancellationToken::new()).await.unwrap();
                let now = in_use.fetch_add(1, SeqCst) + 1;
                peak.fetch_max(now, SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_use.fetch_sub(1, SeqCst);
                drop(lease);
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= N);
        assert!(factory.created() <= N);
    }

    #[tokio::test]
    async fn acquire_times_out_when_nothing_is_released() {
        let pool = pool(MockEngineFactory::new("x"), 1, 100);
        let cancel = CancellationToken::new();
        let _held = pool.acquire(&cancel).await.unwrap();

        let started = Instant::now();
        let err = pool.acquire(&cancel).await.unwrap_err();
        let waited = started.elapsed();

        assert!(matches!(err, PoolError::Timeout(d) if d == Duration::from_millis(100)));
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_millis(1000), "waited {waited:?}");
        assert_eq!(err.to_string(), "Timeout waiting for an OCR engine after 100ms");
    }

    #[tokio::test]
    async fn cancellation_aborts_the_wait_immediately() {
        let pool = pool(MockEngineFactory::new("x"), 1, 10_000);
        let _held = pool.acquire(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let err = pool.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, PoolError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn already_cancelled_token_wins_over_free_slot() {
        let pool = pool(MockEngineFactory::new("x"), 1, 1000);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(pool.acquire(&cancel).await, Err(PoolError::Cancelled)));
        assert_eq!(pool.available_slots(), 1);
    }

    #[tokio::test]
    async fn failed_construction_frees_the_slot() {
        let pool = pool(MockEngineFactory::new("x").failing(), 1, 100);
        let cancel = CancellationToken::new();

        let err = pool.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, PoolError::Engine(OcrError::Engine(_))));
        assert_eq!(pool.available_slots(), 1);
    }

    #[tokio::test]
    async fn engine_that_panicked_is_not_pooled() {
        let pool = pool(MockEngineFactory::new("x"), 1, 1000);
        let lease = pool.acquire(&CancellationToken::new()).await.unwrap();

        let joined = tokio::task::spawn_blocking(move || {
            let _lease = lease;
            panic!("engine blew up");
        })
        .await;

        assert!(joined.is_err());
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.available_slots(), 1);
    }

    #[tokio::test]
    async fn lease_debug_does_not_need_engine_debug() {
        let pool = pool(MockEngineFactory::new("x"), 1, 1000);
        let lease = pool.acquire(&CancellationToken::new()).await.unwrap();
        assert!(format!("{lease:?}").starts_with("EngineLease"));
    }

    #[tokio::test]
    async fn acquire_after_shutdown_is_disposed() {
        let pool = pool(MockEngineFactory::new("x"), 2, 1000);
        pool.shutdown();
        let err = pool.acquire(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, PoolError::Disposed));
    }

    #[tokio::test]
    async fn shutdown_destroys_idle_and_late_returns() {
        let pool = pool(MockEngineFactory::new("x"), 2, 1000);
        let cancel = CancellationToken::new();

        let a = pool.acquire(&cancel).await.unwrap();
        let b = pool.acquire(&cancel).await.unwrap();
        pool.release(a);
        assert_eq!(pool.idle_count(), 1);

        pool.shutdown();
        assert_eq!(pool.idle_count(), 0);

        // Checked-out engine is destroyed on return instead of pooled.
        pool.release(b);
        assert_eq!(pool.idle_count(), 0);
        assert!(pool.is_shut_down());
        pool.shutdown();
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters_with_disposed() {
        let pool = pool(MockEngineFactory::new("x"), 1, 10_000);
        let _held = pool.acquire(&CancellationToken::new()).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&CancellationToken::new()).await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.shutdown();

        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Disposed)));
    }

    #[tokio::test]
    async fn dropped_lease_is_released_exactly_once() {
        let factory = MockEngineFactory::new("x");
        let pool = pool(factory.clone(), 1, 1000);
        let cancel = CancellationToken::new();

        {
            let _lease = pool.acquire(&cancel).await.unwrap();
            assert_eq!(pool.available_slots(), 0);
        }
        assert_eq!(pool.available_slots(), 1);
        assert_eq!(pool.idle_count(), 1);

        let _again = pool.acquire(&cancel).await.unwrap();
        assert_eq!(factory.created(), 1);
        assert_eq!(pool.available_slots(), 0);
    }

    #[test]
    fn capacity_is_at_least_one() {
        let pool = EnginePool::new(MockEngineFactory::new("x"), 0, Duration::from_millis(10));
        assert_eq!(pool.capacity(), 1);
    }

    #[test]
    fn from_config_uses_pool_settings() {
        let config = OcrConfig { max_engines: 3, rent_timeout_ms: 750, ..OcrConfig::default() };
        let pool = EnginePool::from_config(MockEngineFactory::new("x"), &config);
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.available_slots(), 3);
    }
}
