//! Gateway configuration loaded once at process start.
//!
//! Values come from environment-style key/value pairs. Secrets are wrapped in
//! [`SecretString`] so they never show up in `Debug` output or logs.

use crate::error::{GatewayError, GatewayResult};

use secrecy::SecretString;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// SSH authentication material.
#[derive(Debug)]
pub enum SshCredentials {
    /// Password authentication
    Password(SecretString),
    /// Private key authentication
    PrivateKey {
        /// Where the key material comes from
        key: KeySource,
        /// Passphrase for an encrypted key
        passphrase: Option<SecretString>,
    },
    /// Keys offered by the local SSH agent
    Agent,
}

impl SshCredentials {
    /// Short name for logging.
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Password(_) => "password",
            Self::PrivateKey { .. } => "key",
            Self::Agent => "agent",
        }
    }
}

/// Source of private key material.
#[derive(Debug)]
pub enum KeySource {
    /// PEM/OpenSSH key text
    Inline(SecretString),
    /// Path to a key file
    File(PathBuf),
}

/// SSH tunnel host and credentials.
#[derive(Debug)]
pub struct TunnelConfig {
    /// SSH server hostname
    pub host: String,
    /// SSH server port (default 22)
    pub port: u16,
    /// SSH username
    pub username: String,
    /// Authentication material
    pub credentials: SshCredentials,
    /// Expected SHA-256 fingerprint of the server host key
    pub host_key_fingerprint: Option<String>,
}

impl TunnelConfig {
    /// Create a tunnel configuration on the default SSH port.
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        credentials: SshCredentials,
    ) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            credentials,
            host_key_fingerprint: None,
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// `host:port` for logging.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The database server as reachable from the SSH host.
#[derive(Debug)]
pub struct DatabaseTarget {
    /// Hostname resolved on the SSH server side
    pub host: String,
    /// PostgreSQL port (default 5432)
    pub port: u16,
    /// Database user
    pub user: String,
    /// Database password
    pub password: SecretString,
    /// Bound on establishing one driver connection
    pub connect_timeout: Duration,
    /// Server-side statement timeout
    pub statement_timeout: Option<Duration>,
    /// Reported to the server as `application_name`
    pub application_name: String,
}

impl DatabaseTarget {
    /// Create a target on `127.0.0.1:5432` of the SSH host.
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: Ipv4Addr::LOCALHOST.to_string(),
            port: 5432,
            user: user.into(),
            password: SecretString::new(password.into().into_boxed_str()),
            connect_timeout: Duration::from_secs(10),
            statement_timeout: None,
            application_name: "tunnelgate".to_string(),
        }
    }

    /// The remote endpoint every pool forwards to.
    pub fn forward_target(&self) -> ForwardTarget {
        ForwardTarget { host: self.host.clone(), port: self.port }
    }
}

/// Remote `host:port` a forwarded stream is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    /// Host as resolved by the SSH server
    pub host: String,
    /// Port on that host
    pub port: u16,
}

impl std::fmt::Display for ForwardTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Bounds applied to every per-database pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolLimits {
    /// Maximum concurrent connections per pool
    pub max_size: usize,
    /// Maximum callers queued for a connection before failing fast
    pub queue_limit: usize,
    /// How long a caller waits for a free connection
    pub wait_timeout: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self { max_size: 10, queue_limit: 64, wait_timeout: Duration::from_secs(30) }
    }
}

/// Lifecycle settings for the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    /// Upper bound on SSH authentication
    pub auth_timeout: Duration,
    /// Upper bound on setting up one forward
    pub forward_timeout: Duration,
    /// Local address forwarded streams listen on (port 0 = ephemeral)
    pub local_bind: SocketAddr,
    /// Inactivity period after which everything is torn down
    pub idle_timeout: Duration,
    /// How long an explicit shutdown waits for in-flight queries
    pub shutdown_grace: Duration,
    /// Per-pool bounds
    pub pool: PoolLimits,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(15),
            forward_timeout: Duration::from_secs(10),
            local_bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            idle_timeout: Duration::from_secs(5 * 60),
            shutdown_grace: Duration::from_secs(5),
            pool: PoolLimits::default(),
        }
    }
}

impl GatewaySettings {
    /// Set the idle interval.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Set the per-pool bounds.
    pub fn with_pool(mut self, pool: PoolLimits) -> Self {
        self.pool = pool;
        self
    }
}

/// Complete gateway configuration.
#[derive(Debug)]
pub struct GatewayConfig {
    /// SSH side
    pub tunnel: TunnelConfig,
    /// Database side
    pub database: DatabaseTarget,
    /// Timeouts, limits and idle interval
    pub settings: GatewaySettings,
}

impl GatewayConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> GatewayResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key/value lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> GatewayResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let tunnel = TunnelConfig {
            host: env.required("SSH_HOST")?,
            port: env.parsed("SSH_PORT")?.unwrap_or(22),
            username: env.required("SSH_USERNAME")?,
            credentials: env.credentials()?,
            host_key_fingerprint: env
                .get("SSH_HOST_FINGERPRINT")
                .map(|v| v.trim().trim_start_matches("SHA256:").to_string()),
        };

        let mut database = DatabaseTarget::new(env.required("DB_USER")?, env.required("DB_PASSWORD")?);
        if let Some(host) = env.get("DB_HOST") {
            database.host = host;
        }
        if let Some(port) = env.parsed("DB_PORT")? {
            database.port = port;
        }
        if let Some(timeout) = env.duration("GATEWAY_CONNECT_TIMEOUT")? {
            database.connect_timeout = timeout;
        }
        database.statement_timeout = env.duration("GATEWAY_STATEMENT_TIMEOUT")?;

        let defaults = GatewaySettings::default();
        let settings = GatewaySettings {
            auth_timeout: env.duration("GATEWAY_AUTH_TIMEOUT")?.unwrap_or(defaults.auth_timeout),
            forward_timeout: env
                .duration("GATEWAY_FORWARD_TIMEOUT")?
                .unwrap_or(defaults.forward_timeout),
            local_bind: env.parsed("GATEWAY_LOCAL_BIND")?.unwrap_or(defaults.local_bind),
            idle_timeout: env.duration("GATEWAY_IDLE_TIMEOUT")?.unwrap_or(defaults.idle_timeout),
            shutdown_grace: env
                .duration("GATEWAY_SHUTDOWN_GRACE")?
                .unwrap_or(defaults.shutdown_grace),
            pool: PoolLimits {
                max_size: env.parsed("GATEWAY_POOL_MAX_SIZE")?.unwrap_or(defaults.pool.max_size),
                queue_limit: env
                    .parsed("GATEWAY_POOL_QUEUE_LIMIT")?
                    .unwrap_or(defaults.pool.queue_limit),
                wait_timeout: env
                    .duration("GATEWAY_POOL_WAIT_TIMEOUT")?
                    .unwrap_or(defaults.pool.wait_timeout),
            },
        };

        let config = Self { tunnel, database, settings };
        config.validate()?;
        Ok(config)
    }

    /// Validate ranges that parsing alone cannot catch.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.tunnel.port == 0 {
            return Err(GatewayError::config("SSH_PORT must be between 1 and 65535"));
        }
        if self.database.port == 0 {
            return Err(GatewayError::config("DB_PORT must be between 1 and 65535"));
        }
        if self.settings.pool.max_size == 0 {
            return Err(GatewayError::config("GATEWAY_POOL_MAX_SIZE must be at least 1"));
        }
        if self.settings.pool.queue_limit == 0 {
            return Err(GatewayError::config("GATEWAY_POOL_QUEUE_LIMIT must be at least 1"));
        }
        if self.settings.idle_timeout.is_zero() {
            return Err(GatewayError::config("GATEWAY_IDLE_TIMEOUT must be non-zero"));
        }
        if self.settings.auth_timeout.is_zero() || self.settings.forward_timeout.is_zero() {
            return Err(GatewayError::config("tunnel timeouts must be non-zero"));
        }
        Ok(())
    }
}

/// Typed access over a raw key/value lookup.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &str) -> GatewayResult<String> {
        self.get(key).ok_or_else(|| GatewayError::config(format!("{key} is required")))
    }

    fn secret(&self, key: &str) -> Option<SecretString> {
        self.get(key).map(|v| SecretString::new(v.into_boxed_str()))
    }

    fn parsed<T>(&self, key: &str) -> GatewayResult<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.trim()
                    .parse::<T>()
                    .map_err(|e| GatewayError::config(format!("{key} is invalid: {e}")))
            })
            .transpose()
    }

    fn duration(&self, key: &str) -> GatewayResult<Option<Duration>> {
        self.get(key)
            .map(|raw| {
                humantime::parse_duration(raw.trim())
                    .map_err(|e| GatewayError::config(format!("{key} is invalid: {e}")))
            })
            .transpose()
    }

    fn flag(&self, key: &str) -> GatewayResult<bool> {
        match self.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(false),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(GatewayError::config(format!("{key} is invalid: '{v}' is not a boolean"))),
        }
    }

    /// Exactly one credential source must be configured.
    fn credentials(&self) -> GatewayResult<SshCredentials> {
        let password = self.secret("SSH_PASSWORD");
        let inline_key = self.secret("SSH_PRIVATE_KEY");
        let key_path = self.get("SSH_PRIVATE_KEY_PATH").map(PathBuf::from);
        let use_agent = self.flag("SSH_USE_AGENT")?;

        let configured = [password.is_some(), inline_key.is_some(), key_path.is_some(), use_agent]
            .iter()
            .filter(|set| **set)
            .count();
        if configured != 1 {
            return Err(GatewayError::config(
                "exactly one of SSH_PASSWORD, SSH_PRIVATE_KEY, SSH_PRIVATE_KEY_PATH or SSH_USE_AGENT must be set",
            ));
        }

        let passphrase = self.secret("SSH_KEY_PASSPHRASE");
        let credentials = if let Some(password) = password {
            SshCredentials::Password(password)
        } else if let Some(key) = inline_key {
            SshCredentials::PrivateKey { key: KeySource::Inline(key), passphrase }
        } else if let Some(path) = key_path {
            SshCredentials::PrivateKey { key: KeySource::File(path), passphrase }
        } else {
            SshCredentials::Agent
        };
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    const BASE: &[(&str, &str)] = &[
        ("SSH_HOST", "bastion.internal"),
        ("SSH_USERNAME", "deploy"),
        ("SSH_PASSWORD", "ssh-secret"),
        ("DB_USER", "app"),
        ("DB_PASSWORD", "db-secret"),
    ];

    fn with(extra: &[(&'static str, &'static str)]) -> Vec<(&'static str, &'static str)> {
        let mut pairs: Vec<_> = BASE.to_vec();
        for &(key, value) in extra {
            pairs.retain(|(k, _)| *k != key);
            pairs.push((key, value));
        }
        pairs
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = GatewayConfig::from_lookup(lookup(BASE)).unwrap();

        assert_eq!(config.tunnel.address(), "bastion.internal:22");
        assert_eq!(config.tunnel.credentials.method_name(), "password");
        assert_eq!(config.database.forward_target().to_string(), "127.0.0.1:5432");
        assert_eq!(config.database.password.expose_secret(), "db-secret");
        assert_eq!(config.settings, GatewaySettings::default());
        assert_eq!(config.settings.idle_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_overrides_are_parsed() {
        let pairs = with(&[
            ("SSH_PORT", "2222"),
            ("SSH_HOST_FINGERPRINT", "SHA256:abc123"),
            ("DB_HOST", "db.private"),
            ("DB_PORT", "6432"),
            ("GATEWAY_IDLE_TIMEOUT", "100ms"),
            ("GATEWAY_AUTH_TIMEOUT", "3s"),
            ("GATEWAY_POOL_MAX_SIZE", "4"),
            ("GATEWAY_POOL_QUEUE_LIMIT", "8"),
            ("GATEWAY_POOL_WAIT_TIMEOUT", "2s"),
            ("GATEWAY_STATEMENT_TIMEOUT", "1m"),
        ]);
        let config = GatewayConfig::from_lookup(lookup(&pairs)).unwrap();

        assert_eq!(config.tunnel.port, 2222);
        assert_eq!(config.tunnel.host_key_fingerprint.as_deref(), Some("abc123"));
        assert_eq!(config.database.forward_target().to_string(), "db.private:6432");
        assert_eq!(config.database.statement_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.settings.idle_timeout, Duration::from_millis(100));
        assert_eq!(config.settings.auth_timeout, Duration::from_secs(3));
        assert_eq!(
            config.settings.pool,
            PoolLimits { max_size: 4, queue_limit: 8, wait_timeout: Duration::from_secs(2) }
        );
    }

    #[test]
    fn test_missing_required_key_is_config_error() {
        let pairs: Vec<_> = BASE.iter().copied().filter(|(k, _)| *k != "DB_PASSWORD").collect();
        let err = GatewayConfig::from_lookup(lookup(&pairs)).unwrap_err();

        assert!(matches!(err, GatewayError::Config { .. }));
        assert!(err.to_string().contains("DB_PASSWORD is required"));
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        for (key, value) in [
            ("SSH_PORT", "ssh"),
            ("GATEWAY_IDLE_TIMEOUT", "soon"),
            ("GATEWAY_POOL_MAX_SIZE", "0"),
            ("GATEWAY_POOL_QUEUE_LIMIT", "0"),
            ("SSH_PORT", "0"),
            ("SSH_USE_AGENT", "maybe"),
        ] {
            let pairs = with(&[(key, value)]);
            let err = GatewayConfig::from_lookup(lookup(&pairs)).unwrap_err();
            assert!(matches!(err, GatewayError::Config { .. }), "{key}={value} should be rejected");
        }
    }

    #[test]
    fn test_exactly_one_credential_source() {
        let pairs = with(&[("SSH_PRIVATE_KEY_PATH", "/home/deploy/.ssh/id_ed25519")]);
        assert!(GatewayConfig::from_lookup(lookup(&pairs)).is_err());

        let pairs: Vec<_> = BASE.iter().copied().filter(|(k, _)| *k != "SSH_PASSWORD").collect();
        assert!(GatewayConfig::from_lookup(lookup(&pairs)).is_err());
    }

    #[test]
    fn test_key_and_agent_credentials() {
        let mut pairs: Vec<_> =
            BASE.iter().copied().filter(|(k, _)| *k != "SSH_PASSWORD").collect();
        pairs.push(("SSH_PRIVATE_KEY_PATH", "/home/deploy/.ssh/id_ed25519"));
        pairs.push(("SSH_KEY_PASSPHRASE", "hunter2"));
        let config = GatewayConfig::from_lookup(lookup(&pairs)).unwrap();
        match config.tunnel.credentials {
            SshCredentials::PrivateKey { key: KeySource::File(path), passphrase } => {
                assert_eq!(path, PathBuf::from("/home/deploy/.ssh/id_ed25519"));
                assert_eq!(passphrase.unwrap().expose_secret(), "hunter2");
            }
            other => panic!("unexpected credentials: {other:?}"),
        }

        let mut pairs: Vec<_> =
            BASE.iter().copied().filter(|(k, _)| *k != "SSH_PASSWORD").collect();
        pairs.push(("SSH_USE_AGENT", "true"));
        let config = GatewayConfig::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.tunnel.credentials.method_name(), "agent");
    }

    #[test]
    fn test_debug_output_redacts_secrets() {
        let config = GatewayConfig::from_lookup(lookup(BASE)).unwrap();
        let rendered = format!("{config:?}");

        assert!(!rendered.contains("ssh-secret"));
        assert!(!rendered.contains("db-secret"));
    }
}
