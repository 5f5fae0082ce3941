//! Service layer of the gateway.
//!
//! - `tunnel` - SecureTunnel state machine and the transport traits
//! - `ssh` - russh implementation of the transport
//! - `driver` - database driver traits
//! - `postgres` - deadpool-postgres driver
//! - `registry` - per-database pool registry
//! - `reaper` - idle timer and activity tracking

pub mod driver;
pub mod postgres;
pub mod reaper;
pub mod registry;
pub mod ssh;
pub mod tunnel;

pub use driver::{DatabasePool, Driver, PooledConnection};
pub use postgres::PgDriver;
pub use reaper::{ActivityGuard, ActivityTracker, IdleReaper};
pub use registry::{PoolEntry, PoolLease, PoolRegistry};
pub use ssh::SshConnector;
pub use tunnel::{ForwardedStream, SecureTunnel, TunnelConnector, TunnelSession};
