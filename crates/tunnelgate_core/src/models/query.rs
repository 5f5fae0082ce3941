//! Query input and output models.

use serde_json::Value as JsonValue;

/// A single result row: column name to value.
pub type Row = serde_json::Map<String, JsonValue>;

/// Truncate SQL for logging.
pub fn truncate_sql(sql: &str, max_len: usize) -> String {
    if sql.len() <= max_len {
        return sql.to_string();
    }
    let mut end = max_len;
    while !sql.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &sql[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_sql_keeps_short_statements() {
        assert_eq!(truncate_sql("SELECT 1", 100), "SELECT 1");
    }

    #[test]
    fn test_truncate_sql_respects_char_boundaries() {
        assert_eq!(truncate_sql("SELECT 'héllo'", 10), "SELECT 'h...");
        assert_eq!(truncate_sql("SELECT 'ééé'", 10), "SELECT 'é...");
    }
}
