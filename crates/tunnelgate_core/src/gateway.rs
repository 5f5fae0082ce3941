//! Query gateway: the single entry point application code uses.

use crate::error::{GatewayError, GatewayResult};
use crate::models::{
    truncate_sql, ForwardTarget, GatewayConfig, GatewaySettings, PoolSnapshot, Row, TunnelPhase,
};
use crate::services::driver::Driver;
use crate::services::postgres::PgDriver;
use crate::services::registry::PoolRegistry;
use crate::services::ssh::SshConnector;
use crate::services::tunnel::TunnelConnector;

use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Tunneled, pooled access to every database behind one SSH host.
///
/// Construct once at startup and share it (`Arc<Gateway>`). Nothing connects
/// until the first query; resources are reclaimed after the idle timeout and
/// rebuilt on the next query.
pub struct Gateway {
    registry: PoolRegistry,
    shutdown_grace: Duration,
}

impl Gateway {
    /// Create a gateway from its parts.
    pub fn new(
        connector: Arc<dyn TunnelConnector>,
        driver: Arc<dyn Driver>,
        target: ForwardTarget,
        settings: GatewaySettings,
    ) -> Self {
        tracing::debug!(
            target = %target,
            idle_timeout_ms = settings.idle_timeout.as_millis() as u64,
            max_size = settings.pool.max_size,
            "Gateway created"
        );
        Self {
            registry: PoolRegistry::new(connector, driver, target, &settings),
            shutdown_grace: settings.shutdown_grace,
        }
    }

    /// Create a gateway using SSH and PostgreSQL from validated configuration.
    pub fn from_config(config: GatewayConfig) -> GatewayResult<Self> {
        config.validate()?;
        let GatewayConfig { tunnel, database, settings } = config;

        let target = database.forward_target();
        let connector =
            Arc::new(SshConnector::new(tunnel).with_channel_timeout(settings.forward_timeout));
        let driver = Arc::new(PgDriver::new(database));
        Ok(Self::new(connector, driver, target, settings))
    }

    /// Run `sql` against `database` with `params` bound positionally.
    ///
    /// The connection is returned to its pool on every exit path, including
    /// when the returned future is dropped before completion.
    pub async fn execute(
        &self,
        database: &str,
        sql: &str,
        params: &[JsonValue],
    ) -> GatewayResult<Vec<Row>> {
        if database.trim().is_empty() {
            return Err(GatewayError::query("database name must not be empty"));
        }

        let query_id = Uuid::new_v4();
        let started = Instant::now();

        let lease = self.registry.checkout(database).await?;
        let connection = lease.pool().acquire().await?;
        let result = connection.query(sql, params).await;
        drop(connection);

        match result {
            Ok(rows) => {
                self.registry.touch();
                tracing::debug!(
                    query_id = %query_id,
                    database = %database,
                    pool_id = %lease.entry().id(),
                    execution_time_ms = started.elapsed().as_millis() as u64,
                    row_count = rows.len(),
                    "Query completed"
                );
                Ok(rows)
            }
            Err(e) => {
                tracing::warn!(
                    query_id = %query_id,
                    database = %database,
                    sql = %truncate_sql(sql, 200),
                    error = %e,
                    "Query failed"
                );
                Err(e)
            }
        }
    }

    /// Snapshots of every live pool, ordered by database name.
    ///
    /// Does not wait for a pool or tunnel that is being built.
    pub fn pool_statuses(&self) -> Vec<PoolSnapshot> {
        self.registry.snapshots()
    }

    /// Close the pool for `database`. Returns `false` if none existed.
    pub async fn close_pool(&self, database: &str) -> bool {
        self.registry.close_pool(database).await
    }

    /// Current tunnel phase.
    pub fn tunnel_phase(&self) -> TunnelPhase {
        self.registry.tunnel_phase()
    }

    /// The underlying pool registry.
    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    /// Wait up to the shutdown grace for in-flight queries, then close every
    /// pool and the tunnel. A later query rebuilds from scratch.
    pub async fn shutdown(&self) {
        let in_flight = self.registry.in_flight();
        if in_flight > 0 {
            tracing::info!(
                in_flight,
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "Waiting for in-flight queries before shutdown"
            );
            if tokio::time::timeout(self.shutdown_grace, self.registry.drained()).await.is_err() {
                tracing::warn!(
                    in_flight = self.registry.in_flight(),
                    "Shutdown grace elapsed with queries still running"
                );
            }
        }

        self.registry.teardown_all().await;
        tracing::info!("Gateway shut down");
    }
}
