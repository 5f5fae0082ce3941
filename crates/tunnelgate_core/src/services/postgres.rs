//! PostgreSQL driver on deadpool-postgres.
//!
//! Every pool connects to the loopback endpoint of its forwarded stream, so
//! all of its connections ride the shared SSH session. Parameters are bound
//! with the types the server reports for the prepared statement.

use crate::error::{GatewayError, GatewayResult, TunnelError};
use crate::models::{DatabaseTarget, PoolLimits, PoolStatus, Row};
use crate::services::driver::{check_wait_queue, DatabasePool, Driver, PooledConnection};
use crate::services::tunnel::ForwardedStream;

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use deadpool_postgres::{
    Manager, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime, TimeoutType,
};
use secrecy::ExposeSecret;
use serde_json::Value as JsonValue;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::NoTls;
use uuid::Uuid;

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Builds deadpool-postgres pools for one database server.
pub struct PgDriver {
    target: DatabaseTarget,
}

impl PgDriver {
    /// Create a driver for the given server and credentials.
    pub fn new(target: DatabaseTarget) -> Self {
        Self { target }
    }
}

impl Driver for PgDriver {
    fn create_pool(
        &self,
        database: &str,
        stream: &ForwardedStream,
        limits: &PoolLimits,
    ) -> GatewayResult<Arc<dyn DatabasePool>> {
        let local = stream.local_addr();

        let mut pg_config = tokio_postgres::Config::new();
        pg_config.host(&local.ip().to_string());
        pg_config.port(local.port());
        pg_config.dbname(database);
        pg_config.user(&self.target.user);
        pg_config.password(self.target.password.expose_secret());
        pg_config.application_name(&self.target.application_name);
        pg_config.connect_timeout(self.target.connect_timeout);
        pg_config.keepalives(true);
        if let Some(timeout) = self.target.statement_timeout {
            pg_config.options(&format!("-c statement_timeout={}", timeout.as_millis()));
        }

        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Fast },
        );

        let pool = Pool::builder(manager)
            .max_size(limits.max_size)
            .wait_timeout(Some(limits.wait_timeout))
            .create_timeout(Some(self.target.connect_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| GatewayError::internal_with_source("Failed to build connection pool", e))?;

        tracing::debug!(
            database = %database,
            local_addr = %local,
            max_size = limits.max_size,
            "PostgreSQL pool built"
        );

        Ok(Arc::new(PgPool {
            database: database.to_string(),
            pool,
            queue_limit: limits.queue_limit,
            connect_timeout: self.target.connect_timeout,
        }))
    }
}

/// deadpool-postgres pool for one logical database.
struct PgPool {
    database: String,
    pool: Pool,
    queue_limit: usize,
    connect_timeout: Duration,
}

#[async_trait]
impl DatabasePool for PgPool {
    async fn acquire(&self) -> GatewayResult<Box<dyn PooledConnection>> {
        check_wait_queue(&self.database, &self.status(), self.queue_limit)?;

        let client = self.pool.get().await.map_err(|e| {
            map_pool_error(&self.database, e, self.pool.status().waiting, self.connect_timeout)
        })?;

        Ok(Box::new(PgConnection { client }))
    }

    fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            max_size: status.max_size,
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }

    fn close(&self) {
        self.pool.close();
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// Translate a failed checkout.
///
/// Only a wait timeout means the pool is exhausted. Create and recycle
/// timeouts mean the server did not answer through the tunnel.
fn map_pool_error(
    database: &str,
    err: PoolError,
    waiting: usize,
    connect_timeout: Duration,
) -> GatewayError {
    match err {
        PoolError::Timeout(TimeoutType::Wait) => GatewayError::pool_exhausted(
            database,
            "timed out waiting for a free connection",
            waiting,
        ),
        PoolError::Timeout(TimeoutType::Create) => GatewayError::Query {
            message: format!(
                "could not connect to database '{database}' within {}ms",
                connect_timeout.as_millis()
            ),
            detail: None,
            hint: Some("Check DB_HOST and DB_PORT as seen from the SSH host".to_string()),
            position: None,
            code: Some("08001".to_string()),
            source: None,
        },
        PoolError::Timeout(TimeoutType::Recycle) => GatewayError::Query {
            message: format!("health check of a pooled connection to '{database}' timed out"),
            detail: None,
            hint: None,
            position: None,
            code: Some("08006".to_string()),
            source: None,
        },
        PoolError::Backend(e) => GatewayError::from(e),
        PoolError::Closed => GatewayError::from(TunnelError::Closed),
        other => GatewayError::internal(format!("Failed to acquire connection: {other}")),
    }
}

/// A checked-out client; dropping it returns it to the pool.
struct PgConnection {
    client: deadpool_postgres::Client,
}

#[async_trait]
impl PooledConnection for PgConnection {
    async fn query(&self, sql: &str, params: &[JsonValue]) -> GatewayResult<Vec<Row>> {
        let statement = self.client.prepare_cached(sql).await?;

        let types = statement.params();
        if types.len() != params.len() {
            return Err(GatewayError::Query {
                message: format!(
                    "statement expects {} parameters but {} were supplied",
                    types.len(),
                    params.len()
                ),
                detail: None,
                hint: Some("Bind one value per $n placeholder".to_string()),
                position: None,
                code: Some("08P01".to_string()),
                source: None,
            });
        }

        let bound = params
            .iter()
            .zip(types)
            .enumerate()
            .map(|(i, (value, ty))| bind_param(i, value, ty))
            .collect::<GatewayResult<Vec<_>>>()?;
        let refs: Vec<&(dyn ToSql + Sync)> =
            bound.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

        let rows = self.client.query(&statement, &refs).await?;
        Ok(rows.iter().map(row_to_map).collect())
    }
}

/// SQL NULL for a parameter of any type.
#[derive(Debug)]
struct SqlNull;

impl ToSql for SqlNull {
    fn to_sql(&self, _: &Type, _: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        Ok(IsNull::Yes)
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Convert one JSON value to the parameter type the server expects.
fn bind_param(index: usize, value: &JsonValue, ty: &Type) -> GatewayResult<BoxedParam> {
    if value.is_null() {
        return Ok(Box::new(SqlNull));
    }

    let mismatch = || {
        let mut err = GatewayError::query(format!(
            "parameter ${} cannot be bound as {}: got {}",
            index + 1,
            ty.name(),
            json_kind(value)
        ));
        if let GatewayError::Query { hint, .. } = &mut err {
            *hint = Some(format!("Cast the placeholder explicitly, e.g. ${}::text", index + 1));
        }
        err
    };

    let param: BoxedParam = match *ty {
        Type::BOOL => Box::new(value.as_bool().ok_or_else(mismatch)?),
        Type::INT2 => Box::new(int::<i16>(value).ok_or_else(mismatch)?),
        Type::INT4 => Box::new(int::<i32>(value).ok_or_else(mismatch)?),
        Type::INT8 => Box::new(value.as_i64().ok_or_else(mismatch)?),
        Type::OID => Box::new(int::<u32>(value).ok_or_else(mismatch)?),
        Type::FLOAT4 => Box::new(value.as_f64().ok_or_else(mismatch)? as f32),
        Type::FLOAT8 => Box::new(value.as_f64().ok_or_else(mismatch)?),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            Box::new(text(value))
        }
        Type::JSON | Type::JSONB => Box::new(value.clone()),
        Type::UUID => Box::new(parsed::<Uuid>(value).ok_or_else(mismatch)?),
        Type::TIMESTAMPTZ => Box::new(
            value
                .as_str()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(mismatch)?,
        ),
        Type::TIMESTAMP => Box::new(value.as_str().and_then(naive_datetime).ok_or_else(mismatch)?),
        Type::DATE => Box::new(parsed::<NaiveDate>(value).ok_or_else(mismatch)?),
        Type::TIME => Box::new(parsed::<NaiveTime>(value).ok_or_else(mismatch)?),
        Type::BOOL_ARRAY => Box::new(array(value, JsonValue::as_bool).ok_or_else(mismatch)?),
        Type::INT4_ARRAY => Box::new(array(value, int::<i32>).ok_or_else(mismatch)?),
        Type::INT8_ARRAY => Box::new(array(value, JsonValue::as_i64).ok_or_else(mismatch)?),
        Type::FLOAT8_ARRAY => Box::new(array(value, JsonValue::as_f64).ok_or_else(mismatch)?),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => {
            Box::new(array(value, |v| Some(text(v))).ok_or_else(mismatch)?)
        }
        Type::UUID_ARRAY => Box::new(array(value, parsed::<Uuid>).ok_or_else(mismatch)?),
        _ => return Err(mismatch()),
    };
    Ok(param)
}

fn int<T: TryFrom<i64>>(value: &JsonValue) -> Option<T> {
    value.as_i64().and_then(|v| T::try_from(v).ok())
}

fn parsed<T: std::str::FromStr>(value: &JsonValue) -> Option<T> {
    value.as_str().and_then(|s| s.parse().ok())
}

fn naive_datetime(s: &str) -> Option<NaiveDateTime> {
    s.parse::<NaiveDateTime>()
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

/// Strings bind verbatim; other scalars and containers bind as their JSON text.
fn text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn array<T>(value: &JsonValue, element: impl Fn(&JsonValue) -> Option<T>) -> Option<Vec<T>> {
    value.as_array()?.iter().map(element).collect()
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

/// Convert a PostgreSQL row to a column-name keyed JSON object.
fn row_to_map(row: &tokio_postgres::Row) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| (col.name().to_string(), column_value(row, i, col.type_())))
        .collect()
}

fn get<'a, T>(row: &'a tokio_postgres::Row, i: usize) -> Option<T>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get::<_, Option<T>>(i).ok().flatten()
}

fn column_value(row: &tokio_postgres::Row, i: usize, ty: &Type) -> JsonValue {
    let value = match *ty {
        Type::BOOL => get::<bool>(row, i).map(JsonValue::Bool),
        Type::INT2 => get::<i16>(row, i).map(JsonValue::from),
        Type::INT4 => get::<i32>(row, i).map(JsonValue::from),
        Type::INT8 => get::<i64>(row, i).map(JsonValue::from),
        Type::OID => get::<u32>(row, i).map(JsonValue::from),
        Type::FLOAT4 => get::<f32>(row, i)
            .and_then(|v| serde_json::Number::from_f64(v as f64))
            .map(JsonValue::Number),
        Type::FLOAT8 => {
            get::<f64>(row, i).and_then(serde_json::Number::from_f64).map(JsonValue::Number)
        }
        Type::UUID => get::<Uuid>(row, i).map(|v| JsonValue::String(v.to_string())),
        Type::JSON | Type::JSONB => get::<JsonValue>(row, i),
        Type::TIMESTAMPTZ => get::<DateTime<Utc>>(row, i).map(|v| JsonValue::String(v.to_rfc3339())),
        Type::TIMESTAMP => get::<NaiveDateTime>(row, i).map(|v| JsonValue::String(v.to_string())),
        Type::DATE => get::<NaiveDate>(row, i).map(|v| JsonValue::String(v.to_string())),
        Type::TIME => get::<NaiveTime>(row, i).map(|v| JsonValue::String(v.to_string())),
        Type::BYTEA => get::<Vec<u8>>(row, i).map(|bytes| {
            let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
            JsonValue::String(format!("\\x{hex}"))
        }),
        Type::BOOL_ARRAY => get::<Vec<bool>>(row, i).map(JsonValue::from),
        Type::INT4_ARRAY => get::<Vec<i32>>(row, i).map(JsonValue::from),
        Type::INT8_ARRAY => get::<Vec<i64>>(row, i).map(JsonValue::from),
        Type::FLOAT8_ARRAY => get::<Vec<f64>>(row, i).map(JsonValue::from),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => get::<Vec<String>>(row, i).map(JsonValue::from),
        // Types without a native decoder (numeric, intervals, ...) read back
        // only when text-compatible; cast them to text in the query otherwise.
        _ => get::<String>(row, i).map(JsonValue::String),
    };
    value.unwrap_or(JsonValue::Null)
}
