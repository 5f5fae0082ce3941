//! SSH-tunneled PostgreSQL gateway.
//!
//! Application code talks to databases only through [`Gateway::execute`].
//! Behind it, every logical database gets its own connection pool, all pools
//! share one authenticated SSH session, and everything is torn down after a
//! period without queries.
//!
//! - **error**: Error taxonomy with PostgreSQL-specific details
//! - **models**: Configuration, pool status and tunnel phase types
//! - **services**: Tunnel, drivers, pool registry and idle reaper
//! - **gateway**: The query entry point
//! - **logging**: Structured logging setup

pub mod error;
pub mod gateway;
pub mod logging;
pub mod models;
pub mod services;

#[cfg(test)]
mod test_support;

pub use error::{ErrorInfo, GatewayError, GatewayResult, TunnelError};
pub use gateway::Gateway;
pub use models::{
    DatabaseTarget, ForwardTarget, GatewayConfig, GatewaySettings, KeySource, PoolLimits,
    PoolSnapshot, PoolStatus, Row, SshCredentials, TunnelConfig, TunnelPhase,
};
