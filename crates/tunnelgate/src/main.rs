//! tunnelgate - run one query through the SSH-tunneled PostgreSQL gateway.
//!
//! Connection settings come from the environment (SSH_*, DB_*, GATEWAY_*).
//! Rows are printed to stdout as a JSON array; logs go to stderr.

use anyhow::Context;
use clap::Parser;
use serde_json::Value as JsonValue;
use std::path::PathBuf;
use tunnelgate_core::logging::{init_logging, LogConfig};
use tunnelgate_core::{Gateway, GatewayConfig};

#[derive(Parser, Debug)]
#[command(name = "tunnelgate", version, about = "Query PostgreSQL through an SSH tunnel")]
struct Cli {
    /// Logical database to connect to
    database: String,

    /// SQL text; use $1, $2, ... for parameters
    sql: String,

    /// Positional parameter as JSON; text that is not valid JSON binds as a string
    #[arg(long = "param", short = 'p', value_parser = parse_param)]
    params: Vec<JsonValue>,

    /// Pretty-print the result rows
    #[arg(long)]
    pretty: bool,

    /// Log filter directives (overrides TUNNELGATE_LOG)
    #[arg(long = "log")]
    log_filter: Option<String>,

    /// Also write daily log files to this directory
    #[arg(long, env = "TUNNELGATE_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

fn parse_param(raw: &str) -> Result<JsonValue, String> {
    Ok(serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.to_string())))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::console();
    if let Some(dir) = &cli.log_dir {
        log_config = log_config.with_log_dir(dir);
    }
    if let Some(filter) = &cli.log_filter {
        log_config = log_config.with_filter(filter);
    }
    let _logging_guard = init_logging(log_config);

    let config = GatewayConfig::from_env().context("Invalid gateway configuration")?;
    let gateway = Gateway::from_config(config).context("Failed to create gateway")?;

    tracing::info!(database = %cli.database, params = cli.params.len(), "Running query");
    let result = gateway.execute(&cli.database, &cli.sql, &cli.params).await;
    gateway.shutdown().await;

    let rows = match result {
        Ok(rows) => rows,
        Err(e) => {
            let info = e.to_error_info();
            if let Some(hint) = &info.hint {
                tracing::error!(category = e.category(), hint = %hint, "Query failed");
            }
            return Err(e).context(format!("Query against '{}' failed", cli.database));
        }
    };

    let output = if cli.pretty {
        serde_json::to_string_pretty(&rows)?
    } else {
        serde_json::to_string(&rows)?
    };
    println!("{output}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_params_parse_as_json_or_text() {
        assert_eq!(parse_param("42").unwrap(), json!(42));
        assert_eq!(parse_param("null").unwrap(), JsonValue::Null);
        assert_eq!(parse_param("[1,2]").unwrap(), json!([1, 2]));
        assert_eq!(parse_param("\"quoted\"").unwrap(), json!("quoted"));
        assert_eq!(parse_param("alice").unwrap(), json!("alice"));
    }

    #[test]
    fn test_cli_collects_repeated_params() {
        let cli = Cli::try_parse_from([
            "tunnelgate",
            "orders",
            "SELECT * FROM orders WHERE id = $1 AND status = $2",
            "--param",
            "7",
            "-p",
            "shipped",
        ])
        .unwrap();

        assert_eq!(cli.database, "orders");
        assert_eq!(cli.params, vec![json!(7), json!("shipped")]);
        assert!(!cli.pretty);
    }
}
