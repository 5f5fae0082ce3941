//! Per-database pool registry over the shared tunnel.
//!
//! The [`SecureTunnel`] and the [`IdleReaper`] live behind one async mutex.
//! Pool creation, explicit close and idle teardown all run under it, so none
//! of them can interleave.
//!
//! The pool map itself sits in a [`parking_lot::RwLock`] that is only written
//! while that mutex is held. Requests for an already-live pool, status reads
//! and activity recording go through the map alone and never wait behind a
//! slow tunnel operation.

use crate::error::GatewayResult;
use crate::models::{ForwardTarget, GatewaySettings, PoolLimits, PoolSnapshot, TunnelPhase};
use crate::services::driver::{DatabasePool, Driver};
use crate::services::reaper::{ActivityGuard, ActivityTracker, IdleReaper};
use crate::services::tunnel::{ForwardedStream, SecureTunnel, TunnelConnector, TunnelSession};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// One pool together with the forward it connects through.
pub struct PoolEntry {
    id: Uuid,
    database: String,
    pool: Arc<dyn DatabasePool>,
    stream: ForwardedStream,
    session: Arc<dyn TunnelSession>,
    created_at: DateTime<Utc>,
}

impl PoolEntry {
    fn new(
        database: &str,
        pool: Arc<dyn DatabasePool>,
        stream: ForwardedStream,
        session: Arc<dyn TunnelSession>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            database: database.to_string(),
            pool,
            stream,
            session,
            created_at: Utc::now(),
        }
    }

    /// Identity of this pool instance.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Logical database name.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// The driver pool.
    pub fn pool(&self) -> &Arc<dyn DatabasePool> {
        &self.pool
    }

    /// Local endpoint of the backing forward.
    pub fn local_addr(&self) -> SocketAddr {
        self.stream.local_addr()
    }

    /// Whether the pool or its forward has been shut.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed() || self.stream.is_stopped()
    }

    /// Open, and the session it was built on is still healthy.
    fn is_usable(&self) -> bool {
        !self.is_closed() && self.session.is_healthy()
    }

    /// Point-in-time view for callers.
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            id: self.id,
            database: self.database.clone(),
            created_at: self.created_at,
            local_addr: self.local_addr().to_string(),
            status: self.pool.status(),
        }
    }

    fn close(&self) {
        self.pool.close();
        self.stream.stop();
        tracing::info!(database = %self.database, pool_id = %self.id, "Pool closed");
    }
}

/// A pool handed to one request. While any lease is alive the idle reaper
/// will not tear anything down.
pub struct PoolLease {
    entry: Arc<PoolEntry>,
    _activity: ActivityGuard,
}

impl PoolLease {
    /// The leased pool.
    pub fn entry(&self) -> &Arc<PoolEntry> {
        &self.entry
    }

    /// Shortcut for `entry().pool()`.
    pub fn pool(&self) -> &Arc<dyn DatabasePool> {
        self.entry.pool()
    }
}

type PoolMap = HashMap<String, Arc<PoolEntry>>;

struct RegistryState {
    tunnel: SecureTunnel,
    reaper: IdleReaper,
}

struct Shared {
    state: Mutex<RegistryState>,
    pools: RwLock<PoolMap>,
    driver: Arc<dyn Driver>,
    target: ForwardTarget,
    limits: PoolLimits,
    activity: Arc<ActivityTracker>,
    phase: Arc<RwLock<TunnelPhase>>,
}

/// What an idle fire found.
enum IdleCheck {
    Busy(usize),
    Recent(Duration),
    Expired(Vec<Arc<PoolEntry>>),
}

/// Get-or-create registry of pools keyed by logical database name.
#[derive(Clone)]
pub struct PoolRegistry {
    shared: Arc<Shared>,
}

impl PoolRegistry {
    /// Create an empty registry. Nothing connects until the first lookup.
    pub fn new(
        connector: Arc<dyn TunnelConnector>,
        driver: Arc<dyn Driver>,
        target: ForwardTarget,
        settings: &GatewaySettings,
    ) -> Self {
        let tunnel = SecureTunnel::new(connector, settings);
        let phase = tunnel.phase_handle();
        let state = RegistryState { tunnel, reaper: IdleReaper::new(settings.idle_timeout) };

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                pools: RwLock::new(HashMap::new()),
                driver,
                target,
                limits: settings.pool.clone(),
                activity: ActivityTracker::new(),
                phase,
            }),
        }
    }

    /// Return the pool for `database`, creating it (and the tunnel) on first
    /// use. Counts as activity for the idle timer.
    pub async fn get_pool(&self, database: &str) -> GatewayResult<Arc<PoolEntry>> {
        let lease = self.checkout(database).await?;
        Ok(lease.entry)
    }

    /// Like [`get_pool`](Self::get_pool), but the returned lease marks the
    /// caller as active until dropped.
    pub async fn checkout(&self, database: &str) -> GatewayResult<PoolLease> {
        // Begin before reading the map: an idle fire checks `in_flight` under
        // the map's write lock, so it either sees this request or has already
        // emptied the map.
        let activity = self.shared.activity.begin();
        if let Some(entry) = self.live_entry(database) {
            tracing::debug!(database = %database, pool_id = %entry.id(), "Reusing pool");
            return Ok(PoolLease { entry, _activity: activity });
        }

        let mut state = self.shared.state.lock().await;
        let entry = self.get_or_create(&mut state, database).await?;
        if !state.reaper.is_armed() {
            self.arm(&mut state);
        }
        Ok(PoolLease { entry, _activity: activity })
    }

    /// Record activity, pushing back the idle deadline. Lock-free.
    pub fn touch(&self) {
        self.shared.activity.record();
    }

    /// Close one pool. Closing the last pool also closes the tunnel.
    ///
    /// Returns `false` if no pool existed for `database`.
    pub async fn close_pool(&self, database: &str) -> bool {
        let mut state = self.shared.state.lock().await;
        let (removed, now_empty) = {
            let mut pools = self.shared.pools.write();
            let removed = pools.remove(database);
            (removed, pools.is_empty())
        };
        let Some(entry) = removed else {
            return false;
        };
        entry.close();

        if now_empty {
            state.reaper.disarm();
            state.tunnel.close().await;
        }
        true
    }

    /// Close every pool and the tunnel, and disarm the idle timer.
    ///
    /// Idempotent and best-effort: close failures are logged, and the
    /// registry always ends empty and rebuildable.
    pub async fn teardown_all(&self) {
        let mut state = self.shared.state.lock().await;
        self.teardown_locked(&mut state).await;
    }

    /// Snapshots of every live pool, ordered by database name. Lock-free
    /// with respect to pool creation.
    pub fn snapshots(&self) -> Vec<PoolSnapshot> {
        let mut snapshots: Vec<_> =
            self.shared.pools.read().values().map(|e| e.snapshot()).collect();
        snapshots.sort_by(|a, b| a.database.cmp(&b.database));
        snapshots
    }

    /// Number of pools currently registered.
    pub fn len(&self) -> usize {
        self.shared.pools.read().len()
    }

    /// Check if no pools are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the idle timer is running.
    pub async fn is_armed(&self) -> bool {
        self.shared.state.lock().await.reaper.is_armed()
    }

    /// Tunnel phase, read without taking the registry lock.
    pub fn tunnel_phase(&self) -> TunnelPhase {
        *self.shared.phase.read()
    }

    /// Requests currently between lookup and release.
    pub fn in_flight(&self) -> usize {
        self.shared.activity.in_flight()
    }

    /// Wait until no request is in flight.
    pub async fn drained(&self) {
        self.shared.activity.drained().await
    }

    fn live_entry(&self, database: &str) -> Option<Arc<PoolEntry>> {
        self.shared.pools.read().get(database).filter(|e| e.is_usable()).cloned()
    }

    async fn get_or_create(
        &self,
        state: &mut RegistryState,
        database: &str,
    ) -> GatewayResult<Arc<PoolEntry>> {
        // Another caller may have built it while we waited for the lock.
        if let Some(entry) = self.live_entry(database) {
            tracing::debug!(database = %database, pool_id = %entry.id(), "Reusing pool");
            return Ok(entry);
        }

        let pool_count = self.len();
        if !state.tunnel.is_healthy() && pool_count > 0 {
            tracing::warn!(pools = pool_count, "SSH tunnel lost, discarding pools before rebuilding");
            self.teardown_locked(state).await;
        } else {
            let stale = self.shared.pools.write().remove(database);
            if let Some(stale) = stale {
                stale.close();
            }
        }

        let entry = match self.create(state, database).await {
            Ok(entry) => entry,
            Err(e) => {
                if self.is_empty() {
                    state.tunnel.close().await;
                }
                return Err(e);
            }
        };

        self.shared.pools.write().insert(database.to_string(), entry.clone());
        Ok(entry)
    }

    async fn create(
        &self,
        state: &mut RegistryState,
        database: &str,
    ) -> GatewayResult<Arc<PoolEntry>> {
        let session = state.tunnel.ensure_connected().await?;
        let stream = state.tunnel.open_forward(&self.shared.target).await?;
        let pool = self.shared.driver.create_pool(database, &stream, &self.shared.limits)?;
        let entry = Arc::new(PoolEntry::new(database, pool, stream, session));

        tracing::info!(
            database = %database,
            pool_id = %entry.id(),
            local_addr = %entry.local_addr(),
            max_size = self.shared.limits.max_size,
            "Pool created"
        );
        Ok(entry)
    }

    fn arm(&self, state: &mut RegistryState) {
        let delay = state.reaper.idle_timeout();
        self.arm_after(state, delay);
    }

    fn arm_after(&self, state: &mut RegistryState, delay: Duration) {
        let shared = Arc::downgrade(&self.shared);
        state.reaper.arm_after(delay, move |generation| async move {
            if let Some(shared) = shared.upgrade() {
                PoolRegistry { shared }.on_idle(generation).await;
            }
        });
    }

    async fn on_idle(&self, generation: u64) {
        let mut state = self.shared.state.lock().await;
        if !state.reaper.is_current(generation) {
            tracing::trace!(generation, "Ignoring superseded idle timer");
            return;
        }

        let idle_timeout = state.reaper.idle_timeout();
        let check = {
            let mut pools = self.shared.pools.write();
            let in_flight = self.shared.activity.in_flight();
            let idle_for = self.shared.activity.idle_for();
            if in_flight > 0 {
                IdleCheck::Busy(in_flight)
            } else if idle_for < idle_timeout {
                IdleCheck::Recent(idle_timeout - idle_for)
            } else {
                IdleCheck::Expired(pools.drain().map(|(_, entry)| entry).collect())
            }
        };

        match check {
            IdleCheck::Busy(in_flight) => {
                tracing::debug!(in_flight, "Idle timer fired during active requests, re-arming");
                self.arm(&mut state);
            }
            IdleCheck::Recent(remaining) => {
                tracing::trace!(
                    remaining_ms = remaining.as_millis() as u64,
                    "Activity since the timer was armed, re-arming for the remainder"
                );
                self.arm_after(&mut state, remaining);
            }
            IdleCheck::Expired(entries) => {
                tracing::info!(
                    pools = entries.len(),
                    idle_timeout_ms = idle_timeout.as_millis() as u64,
                    "Idle timeout reached, reclaiming pools and tunnel"
                );
                Self::shut(&mut state, entries).await;
            }
        }
    }

    async fn teardown_locked(&self, state: &mut RegistryState) {
        let entries: Vec<_> = self.shared.pools.write().drain().map(|(_, entry)| entry).collect();
        Self::shut(state, entries).await;
    }

    async fn shut(state: &mut RegistryState, entries: Vec<Arc<PoolEntry>>) {
        state.reaper.disarm();
        for entry in entries {
            entry.close();
        }
        state.tunnel.close().await;
    }
}
