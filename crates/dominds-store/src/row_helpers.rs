use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Get a column value from a row, mapping failures to `CorruptRow`.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Decode a JSON text column into a typed record.
pub fn parse_json<T: DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Decode an optional JSON text column.
pub fn parse_json_opt<T: DeserializeOwned>(
    raw: Option<String>,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    raw.map(|s| parse_json(&s, table, column)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_json_reports_location() {
        let err = parse_json::<serde_json::Value>("{nope", "reminders", "items").unwrap_err();
        match err {
            StoreError::CorruptRow { table, column, .. } => {
                assert_eq!(table, "reminders");
                assert_eq!(column, "items");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn parse_json_opt_none_passthrough() {
        let v: Option<u32> = parse_json_opt(None, "t", "c").unwrap();
        assert!(v.is_none());
        let v: Option<u32> = parse_json_opt(Some("7".into()), "t", "c").unwrap();
        assert_eq!(v, Some(7));
    }
}
