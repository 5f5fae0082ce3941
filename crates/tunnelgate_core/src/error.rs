//! Error types for the tunneled database gateway.
//!
//! Every failure reaching a caller of [`crate::Gateway::execute`] is one of the
//! [`GatewayError`] categories. Transport establishment failures are reported
//! as [`TunnelError`] and surface wrapped in [`GatewayError::Unavailable`].

use std::time::Duration;
use thiserror::Error;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Failure establishing or using the SSH transport.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Authentication failed or the SSH host could not be reached.
    #[error("SSH authentication failed: {message}")]
    Auth {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the operator.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<BoxedSource>,
    },

    /// A bounded tunnel operation did not complete in time.
    #[error("SSH {operation} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        /// Operation that timed out ("authentication", "forward setup").
        operation: &'static str,
        /// The configured bound.
        timeout: Duration,
    },

    /// The remote side refused to forward to the target.
    #[error("SSH forward to {target} failed: {message}")]
    Forward {
        /// `host:port` the forward was requested for.
        target: String,
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<BoxedSource>,
    },

    /// The established session failed (disconnect, transport error).
    #[error("SSH session error: {message}")]
    Session {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<BoxedSource>,
    },

    /// The tunnel was torn down while the operation was in progress.
    #[error("SSH tunnel is closed")]
    Closed,
}

impl TunnelError {
    /// Create an authentication error.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth { message: message.into(), hint: None, source: None }
    }

    /// Create an authentication error with a hint.
    pub fn auth_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Auth { message: message.into(), hint: Some(hint.into()), source: None }
    }

    /// Create an authentication error with source.
    pub fn auth_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Auth { message: message.into(), hint: None, source: Some(Box::new(source)) }
    }

    /// Create a timeout error.
    pub fn timeout(operation: &'static str, timeout: Duration) -> Self {
        Self::Timeout { operation, timeout }
    }

    /// Create a forward error.
    pub fn forward(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Forward { target: target.into(), message: message.into(), source: None }
    }

    /// Create a forward error with source.
    pub fn forward_with_source(
        target: impl Into<String>,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Forward {
            target: target.into(),
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a session error with source.
    pub fn session_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Session { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Get actionable hint for the operator.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Auth { hint, .. } => {
                hint.as_deref().or(Some("Check the SSH host, port and credentials"))
            }
            Self::Timeout { .. } => Some("Check network connectivity to the SSH host"),
            Self::Forward { .. } => {
                Some("The SSH server may not allow TCP forwarding to the database host")
            }
            Self::Session { .. } => Some("The SSH connection dropped; it is rebuilt on demand"),
            Self::Closed => Some("Retry the request; the tunnel is rebuilt on demand"),
        }
    }
}

/// Main error type for gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Missing or invalid configuration. Fatal.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// The tunnel could not be established or was lost.
    #[error("Gateway unavailable: {source}")]
    Unavailable {
        /// The transport failure.
        #[from]
        source: TunnelError,
    },

    /// Driver-level failure while executing a query.
    #[error("{message}")]
    Query {
        /// PostgreSQL or driver error message.
        message: String,
        /// Additional detail from PostgreSQL.
        detail: Option<String>,
        /// PostgreSQL hint, or a generated one.
        hint: Option<String>,
        /// Position in query (1-indexed).
        position: Option<usize>,
        /// SQLSTATE code (e.g., "42P01").
        code: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<BoxedSource>,
    },

    /// No connection became available in time, or the wait queue is full.
    #[error("Pool exhausted for database '{database}': {message}")]
    PoolExhausted {
        /// Logical database the pool belongs to.
        database: String,
        /// Human-readable error message.
        message: String,
        /// Number of tasks waiting for connections when the error was raised.
        waiting: usize,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<BoxedSource>,
    },
}

impl GatewayError {
    // ========== Constructors ==========

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a query error from a plain message.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
            code: None,
            source: None,
        }
    }

    /// Create a pool exhausted error.
    pub fn pool_exhausted(
        database: impl Into<String>,
        message: impl Into<String>,
        waiting: usize,
    ) -> Self {
        Self::PoolExhausted { database: database.into(), message: message.into(), waiting }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Create a new internal error with source.
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Box::new(source)) }
    }

    // ========== Methods ==========

    /// Check if this error means the tunnel could not be used.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    /// Check if this error is a wait-queue timeout.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }

    /// Check if this error came from the driver during execution.
    pub fn is_query(&self) -> bool {
        matches!(self, Self::Query { .. })
    }

    /// Get the underlying tunnel error, if any.
    pub fn tunnel_error(&self) -> Option<&TunnelError> {
        match self {
            Self::Unavailable { source } => Some(source),
            _ => None,
        }
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "Config",
            Self::Unavailable { .. } => "Unavailable",
            Self::Query { .. } => "Query",
            Self::PoolExhausted { .. } => "Pool",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the caller.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Config { .. } => Some("Check the SSH_* and DB_* environment variables"),
            Self::Unavailable { source } => source.hint(),
            Self::Query { hint, .. } => hint.as_deref(),
            Self::PoolExhausted { .. } => {
                Some("Raise GATEWAY_POOL_MAX_SIZE or reduce concurrent queries")
            }
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Get SQLSTATE code (if applicable).
    pub fn pg_code(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Convert to displayable error info.
    pub fn to_error_info(&self) -> ErrorInfo {
        let error_type = format!("{} Error", self.category());
        let message = self.to_string();
        let hint = self.hint().map(String::from);

        let technical_detail = match self {
            Self::Query { detail, code, position, .. } => {
                let mut parts = Vec::new();
                if let Some(code) = code {
                    parts.push(format!("Code: {code}"));
                }
                if let Some(pos) = position {
                    parts.push(format!("Position: {pos}"));
                }
                if let Some(detail) = detail {
                    parts.push(format!("Detail: {detail}"));
                }
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join("\n"))
                }
            }
            Self::PoolExhausted { waiting, .. } => {
                Some(format!("{waiting} tasks waiting for connections"))
            }
            _ => None,
        };

        ErrorInfo { error_type, message, hint, technical_detail }
    }
}

/// Displayable error information.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    /// Category name (e.g., "Query Error").
    pub error_type: String,
    /// Message.
    pub message: String,
    /// Actionable suggestion.
    pub hint: Option<String>,
    /// Technical detail (SQLSTATE, position, server detail).
    pub technical_detail: Option<String>,
}

/// Type alias for Result with GatewayError.
pub type GatewayResult<T> = Result<T, GatewayError>;

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error, preserving server error metadata.
impl From<tokio_postgres::Error> for GatewayError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let detail = db_err.detail().map(String::from);
            let code = db_err.code().code().to_string();
            let hint = db_err.hint().map(String::from).or_else(|| postgres_hint(&code));
            let position = db_err.position().and_then(|p| match p {
                tokio_postgres::error::ErrorPosition::Original(pos) => Some(*pos as usize),
                tokio_postgres::error::ErrorPosition::Internal { .. } => None,
            });

            return GatewayError::Query {
                message,
                detail,
                hint,
                position,
                code: Some(code),
                source: Some(Box::new(err)),
            };
        }

        let message =
            if err.is_closed() { "Connection closed".to_string() } else { err.to_string() };

        GatewayError::Query {
            message,
            detail: None,
            hint: Some("The connection through the tunnel was lost".to_string()),
            position: None,
            code: None,
            source: Some(Box::new(err)),
        }
    }
}

/// Generate an actionable hint for common SQLSTATE codes.
fn postgres_hint(code: &str) -> Option<String> {
    let hint = match code {
        "28P01" => "Password authentication failed. Check DB_USER and DB_PASSWORD.",
        "28000" => "Invalid authorization. Check DB_USER and its permissions.",
        "3D000" => "Database does not exist. Check the database name.",
        "42601" => "SQL syntax error. Check your query syntax.",
        "42501" => "Permission denied. You may not have access to this object.",
        "42P01" => "Table does not exist. Check the table name and schema.",
        "42703" => "Column does not exist. Check column names in your query.",
        "42P02" => "Parameter count mismatch. Check the number of bound parameters.",
        "53300" => "Too many connections. Lower GATEWAY_POOL_MAX_SIZE.",
        "57014" => "Query cancelled. The statement timeout may have been reached.",
        _ if code.starts_with("08") => "Connection exception. The tunnel may have dropped.",
        _ if code.starts_with("23") => "Constraint violation. Check the data being written.",
        _ => return None,
    };
    Some(hint.to_string())
}
