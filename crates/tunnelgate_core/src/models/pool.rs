//! Pool status and snapshot models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pool occupancy at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    /// Maximum pool capacity
    pub max_size: usize,
    /// Current connections (idle + checked out)
    pub size: usize,
    /// Idle connections
    pub available: usize,
    /// Tasks waiting for connections
    pub waiting: usize,
}

impl PoolStatus {
    /// Check if the pool is healthy.
    pub fn is_healthy(&self) -> bool {
        self.waiting == 0
    }

    /// Check if a new acquire would have to wait: nothing idle and no room
    /// to open another connection.
    pub fn is_saturated(&self) -> bool {
        self.available == 0 && self.size >= self.max_size
    }

    /// Get the number of checked-out connections.
    pub fn active(&self) -> usize {
        self.size.saturating_sub(self.available)
    }

    /// Get pool utilization as a percentage.
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            0.0
        } else {
            (self.active() as f64 / self.max_size as f64) * 100.0
        }
    }
}

/// Registry entry as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    /// Identity of the pool instance; a rebuilt pool gets a new id
    pub id: Uuid,
    /// Logical database name
    pub database: String,
    /// When the pool was created
    pub created_at: DateTime<Utc>,
    /// Local endpoint of the forwarded stream backing the pool
    pub local_addr: String,
    /// Occupancy
    pub status: PoolStatus,
}
