//! In-memory tunnel and driver doubles for unit and verification tests.

use crate::error::{GatewayError, GatewayResult, TunnelError};
use crate::models::{ForwardTarget, PoolLimits, PoolStatus, Row};
use crate::services::driver::{check_wait_queue, DatabasePool, Driver, PooledConnection};
use crate::services::tunnel::{ForwardedStream, TunnelConnector, TunnelSession};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Tunnel
// ============================================================================

#[derive(Default)]
struct TunnelControls {
    connects: AtomicUsize,
    closes: AtomicUsize,
    forwards: AtomicUsize,
    fail_auth: AtomicBool,
    refuse_forwards: AtomicBool,
    fail_close: AtomicBool,
    hang_close: AtomicBool,
    connect_delay: Mutex<Duration>,
    forward_delay: Mutex<Duration>,
    next_port: AtomicU16,
}

/// Connector producing [`FakeSession`]s.
pub struct FakeConnector {
    controls: Arc<TunnelControls>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        let controls = TunnelControls { next_port: AtomicU16::new(40000), ..Default::default() };
        Arc::new(Self { controls: Arc::new(controls), sessions: Mutex::new(Vec::new()) })
    }

    /// Sessions successfully established.
    pub fn connects(&self) -> usize {
        self.controls.connects.load(Ordering::SeqCst)
    }

    /// Sessions closed.
    pub fn closes(&self) -> usize {
        self.controls.closes.load(Ordering::SeqCst)
    }

    /// Forwards opened.
    pub fn forwards(&self) -> usize {
        self.controls.forwards.load(Ordering::SeqCst)
    }

    /// Sessions neither closed nor broken.
    pub fn live_sessions(&self) -> usize {
        self.sessions.lock().iter().filter(|s| s.is_healthy()).count()
    }

    /// Simulate a dropped transport on every session handed out so far.
    pub fn break_sessions(&self) {
        for session in self.sessions.lock().iter() {
            session.healthy.store(false, Ordering::SeqCst);
        }
    }

    pub fn fail_auth(&self, fail: bool) {
        self.controls.fail_auth.store(fail, Ordering::SeqCst);
    }

    pub fn refuse_forwards(&self, refuse: bool) {
        self.controls.refuse_forwards.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_close(&self, fail: bool) {
        self.controls.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Make `close` cancel its forwards and then never return.
    pub fn hang_close(&self, hang: bool) {
        self.controls.hang_close.store(hang, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.controls.connect_delay.lock() = delay;
    }

    pub fn set_forward_delay(&self, delay: Duration) {
        *self.controls.forward_delay.lock() = delay;
    }
}

#[async_trait]
impl TunnelConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn TunnelSession>, TunnelError> {
        let delay = *self.controls.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.controls.fail_auth.load(Ordering::SeqCst) {
            return Err(TunnelError::auth("permission denied (password)"));
        }

        self.controls.connects.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(FakeSession {
            controls: self.controls.clone(),
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            cancel_token: CancellationToken::new(),
        });
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

/// Session whose forwards are cancellation tokens rather than sockets.
pub struct FakeSession {
    controls: Arc<TunnelControls>,
    healthy: AtomicBool,
    closed: AtomicBool,
    cancel_token: CancellationToken,
}

#[async_trait]
impl TunnelSession for FakeSession {
    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn open_forward(
        &self,
        _local_bind: SocketAddr,
        target: &ForwardTarget,
    ) -> Result<ForwardedStream, TunnelError> {
        let delay = *self.controls.forward_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.is_healthy() {
            return Err(TunnelError::Closed);
        }
        if self.controls.refuse_forwards.load(Ordering::SeqCst) {
            return Err(TunnelError::forward(target.to_string(), "administratively prohibited"));
        }

        self.controls.forwards.fetch_add(1, Ordering::SeqCst);
        let port = self.controls.next_port.fetch_add(1, Ordering::SeqCst);
        let local_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        Ok(ForwardedStream::new(local_addr, target.clone(), self.cancel_token.child_token()))
    }

    async fn close(&self) -> Result<(), TunnelError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel_token.cancel();
        self.controls.closes.fetch_add(1, Ordering::SeqCst);
        if self.controls.hang_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.controls.fail_close.load(Ordering::SeqCst) {
            return Err(TunnelError::Session {
                message: "broken pipe".to_string(),
                source: None,
            });
        }
        Ok(())
    }
}

// ============================================================================
// Driver
// ============================================================================

#[derive(Default)]
struct DriverControls {
    pools_created: AtomicUsize,
    acquires: AtomicUsize,
    releases: AtomicUsize,
    queries: AtomicUsize,
    fail_queries: AtomicBool,
    query_delay: Mutex<Duration>,
}

/// Driver whose pools hand out counted, semaphore-bounded connections.
pub struct FakeDriver {
    controls: Arc<DriverControls>,
    pools: Mutex<Vec<Arc<FakePool>>>,
}

impl FakeDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { controls: Arc::default(), pools: Mutex::new(Vec::new()) })
    }

    pub fn pools_created(&self) -> usize {
        self.controls.pools_created.load(Ordering::SeqCst)
    }

    pub fn acquires(&self) -> usize {
        self.controls.acquires.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.controls.releases.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.controls.queries.load(Ordering::SeqCst)
    }

    /// Pools not yet closed.
    pub fn open_pools(&self) -> usize {
        self.pools.lock().iter().filter(|p| !p.is_closed()).count()
    }

    /// Highest number of connections any single pool had out at once.
    pub fn peak_in_use(&self) -> usize {
        self.pools.lock().iter().map(|p| p.peak.load(Ordering::SeqCst)).max().unwrap_or(0)
    }

    pub fn fail_queries(&self, fail: bool) {
        self.controls.fail_queries.store(fail, Ordering::SeqCst);
    }

    pub fn set_query_delay(&self, delay: Duration) {
        *self.controls.query_delay.lock() = delay;
    }
}

impl Driver for FakeDriver {
    fn create_pool(
        &self,
        database: &str,
        stream: &ForwardedStream,
        limits: &PoolLimits,
    ) -> GatewayResult<Arc<dyn DatabasePool>> {
        self.controls.pools_created.fetch_add(1, Ordering::SeqCst);
        let pool = Arc::new(FakePool {
            database: database.to_string(),
            local_addr: stream.local_addr(),
            limits: limits.clone(),
            permits: Arc::new(Semaphore::new(limits.max_size)),
            waiting: AtomicUsize::new(0),
            in_use: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            controls: self.controls.clone(),
        });
        self.pools.lock().push(pool.clone());
        Ok(pool)
    }
}

pub struct FakePool {
    database: String,
    local_addr: SocketAddr,
    limits: PoolLimits,
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    in_use: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    closed: AtomicBool,
    controls: Arc<DriverControls>,
}

#[async_trait]
impl DatabasePool for FakePool {
    async fn acquire(&self) -> GatewayResult<Box<dyn PooledConnection>> {
        if self.is_closed() {
            return Err(TunnelError::Closed.into());
        }
        check_wait_queue(&self.database, &self.status(), self.limits.queue_limit)?;

        self.waiting.fetch_add(1, Ordering::SeqCst);
        let permit =
            tokio::time::timeout(self.limits.wait_timeout, self.permits.clone().acquire_owned())
                .await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(TunnelError::Closed.into()),
            Err(_) => {
                return Err(GatewayError::pool_exhausted(
                    &self.database,
                    "timed out waiting for a free connection",
                    self.waiting.load(Ordering::SeqCst),
                ))
            }
        };

        self.controls.acquires.fetch_add(1, Ordering::SeqCst);
        let now = self.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(FakeConnection {
            database: self.database.clone(),
            local_addr: self.local_addr,
            in_use: self.in_use.clone(),
            controls: self.controls.clone(),
            _permit: permit,
        }))
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            max_size: self.limits.max_size,
            size: self.in_use.load(Ordering::SeqCst),
            available: 0,
            waiting: self.waiting.load(Ordering::SeqCst),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.permits.close();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct FakeConnection {
    database: String,
    local_addr: SocketAddr,
    in_use: Arc<AtomicUsize>,
    controls: Arc<DriverControls>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl PooledConnection for FakeConnection {
    async fn query(&self, sql: &str, params: &[JsonValue]) -> GatewayResult<Vec<Row>> {
        let delay = *self.controls.query_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.controls.queries.fetch_add(1, Ordering::SeqCst);

        if self.controls.fail_queries.load(Ordering::SeqCst) {
            return Err(GatewayError::Query {
                message: "syntax error at or near \"SELEC\"".to_string(),
                detail: None,
                hint: None,
                position: Some(1),
                code: Some("42601".to_string()),
                source: None,
            });
        }

        let row = json!({
            "database": self.database,
            "via": self.local_addr.to_string(),
            "sql": sql,
            "params": params,
        });
        match row {
            JsonValue::Object(map) => Ok(vec![map]),
            _ => unreachable!("json! object literal"),
        }
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        self.controls.releases.fetch_add(1, Ordering::SeqCst);
    }
}
