//! Data models for the gateway.
//!
//! - `config` - GatewayConfig, TunnelConfig, DatabaseTarget, PoolLimits
//! - `pool` - PoolStatus, PoolSnapshot
//! - `query` - Row, truncate_sql
//! - `tunnel` - TunnelPhase

pub mod config;
pub mod pool;
pub mod query;
pub mod tunnel;

pub use config::{
    DatabaseTarget, ForwardTarget, GatewayConfig, GatewaySettings, KeySource, PoolLimits,
    SshCredentials, TunnelConfig,
};
pub use pool::{PoolSnapshot, PoolStatus};
pub use query::{truncate_sql, Row};
pub use tunnel::TunnelPhase;
