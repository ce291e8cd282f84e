//! Table export serialization: CSV (RFC 4180) and JSON.

use serde_json::Value;

use crate::{Error, Result};

/// Quote a CSV field when it contains a quote, comma, or line break;
/// inner quotes are doubled.
fn escape_csv_field(field: &str) -> String {
    if field.contains('"') || field.contains(',') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn value_to_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Serialize rows (JSON objects) to CSV with a header line.
pub fn rows_to_csv(columns: &[String], rows: &[Value]) -> String {
    let mut out = String::new();
    out.push_str(
        &columns
            .iter()
            .map(|c| escape_csv_field(c))
            .collect::<Vec<_>>()
            .join(","),
    );
    out.push_str("\r\n");
    for row in rows {
        let fields: Vec<String> = columns
            .iter()
            .map(|c| {
                row.get(c)
                    .map(value_to_field)
                    .map(|f| escape_csv_field(&f))
                    .unwrap_or_default()
            })
            .collect();
        out.push_str(&fields.join(","));
        out.push_str("\r\n");
    }
    out
}

pub fn rows_to_json(rows: &[Value]) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(rows).map_err(|e| Error::Internal(format!("serialize export: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_fields_are_unquoted() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let rows = vec![json!({"id": 1, "name": "John"})];
        assert_eq!(rows_to_csv(&columns, &rows), "id,name\r\n1,John\r\n");
    }

    #[test]
    fn special_characters_are_escaped() {
        let columns = vec!["name".to_string(), "note".to_string()];
        let rows = vec![json!({
            "name": "says \"hi\"",
            "note": "line1\nline2, more",
        })];
        let csv = rows_to_csv(&columns, &rows);
        assert_eq!(
            csv,
            "name,note\r\n\"says \"\"hi\"\"\",\"line1\nline2, more\"\r\n"
        );
    }

    #[test]
    fn null_and_missing_become_empty() {
        let columns = vec!["a".to_string(), "b".to_string()];
        let rows = vec![json!({"a": null})];
        assert_eq!(rows_to_csv(&columns, &rows), "a,b\r\n,\r\n");
    }

    #[test]
    fn nested_values_serialize_inline() {
        let columns = vec!["data".to_string()];
        let rows = vec![json!({"data": {"k": 1}})];
        let csv = rows_to_csv(&columns, &rows);
        assert!(csv.contains("\"{\"\"k\"\":1}\""));
    }

    #[test]
    fn json_export_roundtrips() {
        let rows = vec![json!({"id": 1}), json!({"id": 2})];
        let bytes = rows_to_json(&rows).unwrap();
        let parsed: Vec<Value> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, rows);
    }
}
