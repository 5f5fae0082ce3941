//! Database driver seam.
//!
//! The registry builds one [`DatabasePool`] per logical database on top of a
//! [`ForwardedStream`]. Connections checked out of a pool are returned when
//! the [`PooledConnection`] value is dropped, so release happens on every exit
//! path including cancellation.

use crate::error::{GatewayError, GatewayResult};
use crate::models::{PoolLimits, PoolStatus, Row};
use crate::services::tunnel::ForwardedStream;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Builds pools bound to a forwarded stream.
pub trait Driver: Send + Sync {
    /// Create a pool for `database`, connecting through `stream`.
    ///
    /// Connections are opened lazily on first acquire.
    fn create_pool(
        &self,
        database: &str,
        stream: &ForwardedStream,
        limits: &PoolLimits,
    ) -> GatewayResult<Arc<dyn DatabasePool>>;
}

/// A bounded set of reusable connections to one database.
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Check out a connection, waiting up to the pool's wait timeout.
    async fn acquire(&self) -> GatewayResult<Box<dyn PooledConnection>>;

    /// Current occupancy.
    fn status(&self) -> PoolStatus;

    /// Close the pool. Idle connections are dropped now, checked-out ones
    /// when they are returned.
    fn close(&self);

    /// Check if the pool is closed.
    fn is_closed(&self) -> bool;
}

/// A checked-out connection. Dropping it returns it to its pool.
#[async_trait]
pub trait PooledConnection: Send + Sync {
    /// Run `sql` with positionally bound `params` and collect the rows.
    async fn query(&self, sql: &str, params: &[JsonValue]) -> GatewayResult<Vec<Row>>;
}

/// Admission check run before an acquire.
///
/// Only a caller that would actually wait is counted against `queue_limit`;
/// while a connection is idle or the pool can still grow, the call proceeds.
pub fn check_wait_queue(
    database: &str,
    status: &PoolStatus,
    queue_limit: usize,
) -> GatewayResult<()> {
    if status.is_saturated() && status.waiting >= queue_limit {
        return Err(GatewayError::pool_exhausted(
            database,
            format!("wait queue is full ({} waiting)", status.waiting),
            status.waiting,
        ));
    }
    Ok(())
}
