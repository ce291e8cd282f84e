//! Compilation of parsed CRUD queries into parameterized SQL.
//!
//! Every identifier is checked against the cached schema and quoted;
//! every value travels as a typed positional parameter. No client input
//! is ever interpolated into statement text.

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::crud::filter::{CrudQuery, Filter, FilterOp, Select};
use crate::crud::schema::{ColumnSchema, TableSchema};
use crate::{Error, Result};

/// A bound parameter, coerced to the column's type.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Text(String),
    Json(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<ParamValue>,
}

/// Tenant table names: `^[a-z_][a-z0-9_]*$`.
pub fn ensure_table_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    if valid_first && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        Ok(())
    } else {
        Err(Error::BadRequest(format!("invalid table name '{name}'")))
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

fn ensure_column<'a>(schema: &'a TableSchema, name: &str) -> Result<&'a ColumnSchema> {
    schema.column(name).ok_or_else(|| {
        Error::Schema(format!(
            "unknown column '{}' on table '{}'",
            name, schema.name
        ))
    })
}

/// Coerce a query-string value to the column's parameter type.
pub fn coerce_text(value: &str, column: &ColumnSchema) -> Result<ParamValue> {
    let bad = |what: &str| {
        Error::BadRequest(format!(
            "invalid {what} value '{}' for column '{}'",
            value, column.name
        ))
    };
    match column.data_type.as_str() {
        "smallint" | "integer" | "bigint" => value
            .parse::<i64>()
            .map(ParamValue::I64)
            .map_err(|_| bad("integer")),
        "numeric" | "real" | "double precision" => value
            .parse::<f64>()
            .map(ParamValue::F64)
            .map_err(|_| bad("numeric")),
        "boolean" => match value {
            "true" | "t" | "1" => Ok(ParamValue::Bool(true)),
            "false" | "f" | "0" => Ok(ParamValue::Bool(false)),
            _ => Err(bad("boolean")),
        },
        "uuid" => Uuid::parse_str(value)
            .map(ParamValue::Uuid)
            .map_err(|_| bad("uuid")),
        "timestamp with time zone" | "timestamp without time zone" => value
            .parse::<DateTime<Utc>>()
            .map(ParamValue::Timestamp)
            .map_err(|_| bad("timestamp")),
        "json" | "jsonb" => serde_json::from_str(value)
            .map(ParamValue::Json)
            .map_err(|_| bad("json")),
        _ => Ok(ParamValue::Text(value.to_string())),
    }
}

/// Coerce a JSON body value (insert/update) to the column's parameter type.
pub fn coerce_json(value: &Value, column: &ColumnSchema) -> Result<ParamValue> {
    match value {
        Value::Null => Ok(ParamValue::Null),
        Value::Bool(b) => Ok(ParamValue::Bool(*b)),
        Value::Number(n) => {
            if matches!(
                column.data_type.as_str(),
                "numeric" | "real" | "double precision"
            ) {
                n.as_f64().map(ParamValue::F64).ok_or_else(|| {
                    Error::BadRequest(format!("invalid number for column '{}'", column.name))
                })
            } else if let Some(i) = n.as_i64() {
                Ok(ParamValue::I64(i))
            } else {
                n.as_f64().map(ParamValue::F64).ok_or_else(|| {
                    Error::BadRequest(format!("invalid number for column '{}'", column.name))
                })
            }
        }
        Value::String(s) => coerce_text(s, column),
        Value::Array(_) | Value::Object(_) => {
            if matches!(column.data_type.as_str(), "json" | "jsonb") {
                Ok(ParamValue::Json(value.clone()))
            } else {
                Err(Error::BadRequest(format!(
                    "column '{}' does not accept structured values",
                    column.name
                )))
            }
        }
    }
}

/// AND of all filters, appending to `params`. Placeholders continue from
/// `params.len() + 1`.
fn where_clause(
    schema: &TableSchema,
    filters: &[Filter],
    params: &mut Vec<ParamValue>,
) -> Result<String> {
    let mut parts = Vec::with_capacity(filters.len());
    for filter in filters {
        let column = ensure_column(schema, &filter.column)?;
        let ident = quote_ident(&column.name);
        match &filter.op {
            FilterOp::In(values) => {
                let mut placeholders = Vec::with_capacity(values.len());
                for value in values {
                    params.push(coerce_text(value, column)?);
                    placeholders.push(format!("${}", params.len()));
                }
                parts.push(format!("{} IN ({})", ident, placeholders.join(", ")));
            }
            FilterOp::Eq(v)
            | FilterOp::Neq(v)
            | FilterOp::Lt(v)
            | FilterOp::Lte(v)
            | FilterOp::Gt(v)
            | FilterOp::Gte(v) => {
                params.push(coerce_text(v, column)?);
                parts.push(format!("{} {} ${}", ident, filter.op.sql_operator(), params.len()));
            }
            FilterOp::Like(v) | FilterOp::Ilike(v) => {
                // Pattern matching is textual regardless of column type.
                params.push(ParamValue::Text(v.clone()));
                parts.push(format!(
                    "{}::text {} ${}",
                    ident,
                    filter.op.sql_operator(),
                    params.len()
                ));
            }
        }
    }
    Ok(parts.join(" AND "))
}

fn select_list(schema: &TableSchema, select: &Select) -> Result<String> {
    match select {
        Select::All => Ok("*".to_string()),
        Select::Columns(columns) => {
            let mut idents = Vec::with_capacity(columns.len());
            for c in columns {
                idents.push(quote_ident(&ensure_column(schema, c)?.name));
            }
            Ok(idents.join(", "))
        }
    }
}

pub fn build_select(schema: &TableSchema, query: &CrudQuery) -> Result<Statement> {
    let mut params = Vec::new();
    let mut sql = format!(
        "SELECT {} FROM {}",
        select_list(schema, &query.select)?,
        quote_ident(&schema.name)
    );
    if !query.filters.is_empty() {
        let clause = where_clause(schema, &query.filters, &mut params)?;
        sql.push_str(" WHERE ");
        sql.push_str(&clause);
    }
    if let Some(order) = &query.order {
        let column = ensure_column(schema, &order.column)?;
        sql.push_str(&format!(
            " ORDER BY {} {}",
            quote_ident(&column.name),
            order.direction.sql()
        ));
    }
    params.push(ParamValue::I64(query.limit));
    sql.push_str(&format!(" LIMIT ${}", params.len()));
    params.push(ParamValue::I64(query.offset));
    sql.push_str(&format!(" OFFSET ${}", params.len()));
    Ok(Statement { sql, params })
}

pub fn build_insert(
    schema: &TableSchema,
    row: &serde_json::Map<String, Value>,
    returning: bool,
) -> Result<Statement> {
    if row.is_empty() {
        return Err(Error::BadRequest("insert row has no columns".to_string()));
    }
    let mut idents = Vec::with_capacity(row.len());
    let mut placeholders = Vec::with_capacity(row.len());
    let mut params = Vec::with_capacity(row.len());
    for (key, value) in row {
        let column = ensure_column(schema, key)?;
        params.push(coerce_json(value, column)?);
        idents.push(quote_ident(&column.name));
        placeholders.push(format!("${}", params.len()));
    }
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(&schema.name),
        idents.join(", "),
        placeholders.join(", ")
    );
    if returning {
        sql.push_str(" RETURNING *");
    }
    Ok(Statement { sql, params })
}

pub fn build_update(
    schema: &TableSchema,
    values: &serde_json::Map<String, Value>,
    filters: &[Filter],
    returning: bool,
) -> Result<Statement> {
    if filters.is_empty() {
        return Err(Error::BadRequest(
            "UPDATE requires at least one filter".to_string(),
        ));
    }
    if values.is_empty() {
        return Err(Error::BadRequest("update has no values".to_string()));
    }
    let mut params = Vec::new();
    let mut assignments = Vec::with_capacity(values.len());
    for (key, value) in values {
        let column = ensure_column(schema, key)?;
        params.push(coerce_json(value, column)?);
        assignments.push(format!("{} = ${}", quote_ident(&column.name), params.len()));
    }
    let clause = where_clause(schema, filters, &mut params)?;
    let mut sql = format!(
        "UPDATE {} SET {} WHERE {}",
        quote_ident(&schema.name),
        assignments.join(", "),
        clause
    );
    if returning {
        sql.push_str(" RETURNING *");
    }
    Ok(Statement { sql, params })
}

pub fn build_delete(schema: &TableSchema, filters: &[Filter]) -> Result<Statement> {
    if filters.is_empty() {
        return Err(Error::BadRequest(
            "DELETE requires at least one filter".to_string(),
        ));
    }
    let mut params = Vec::new();
    let clause = where_clause(schema, filters, &mut params)?;
    let sql = format!(
        "DELETE FROM {} WHERE {}",
        quote_ident(&schema.name),
        clause
    );
    Ok(Statement { sql, params })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crud::filter::{Direction, Order, parse_query};

    fn users_schema() -> TableSchema {
        let col = |name: &str, data_type: &str| ColumnSchema {
            name: name.to_string(),
            data_type: data_type.to_string(),
            is_nullable: true,
        };
        TableSchema {
            name: "users".to_string(),
            columns: vec![
                col("id", "integer"),
                col("name", "character varying"),
                col("email", "character varying"),
                col("active", "boolean"),
                col("score", "double precision"),
                col("org", "uuid"),
                col("profile", "jsonb"),
                col("created_at", "timestamp with time zone"),
            ],
        }
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn table_name_validation() {
        assert!(ensure_table_name("users").is_ok());
        assert!(ensure_table_name("_tmp_2024").is_ok());
        assert!(ensure_table_name("Users").is_err());
        assert!(ensure_table_name("1users").is_err());
        assert!(ensure_table_name("users; drop").is_err());
        assert!(ensure_table_name("").is_err());
    }

    #[test]
    fn select_emits_only_placeholders() {
        let schema = users_schema();
        let query = parse_query(
            &pairs(&[("eq.name", "John"), ("gt.id", "5"), ("in.org", &format!("{}", Uuid::nil()))]),
            1000,
        )
        .unwrap();
        let stmt = build_select(&schema, &query).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"users\" WHERE \"name\" = $1 AND \"id\" > $2 AND \"org\" IN ($3) LIMIT $4 OFFSET $5"
        );
        // No raw client value appears in the SQL text.
        assert!(!stmt.sql.contains("John"));
        assert_eq!(stmt.params.len(), 5);
        assert_eq!(stmt.params[0], ParamValue::Text("John".to_string()));
        assert_eq!(stmt.params[1], ParamValue::I64(5));
        assert_eq!(stmt.params[2], ParamValue::Uuid(Uuid::nil()));
    }

    #[test]
    fn in_filter_gets_one_placeholder_per_value() {
        let schema = users_schema();
        let query = parse_query(&pairs(&[("in.id", "1,2,3")]), 1000).unwrap();
        let stmt = build_select(&schema, &query).unwrap();
        assert!(stmt.sql.contains("\"id\" IN ($1, $2, $3)"));
        assert_eq!(stmt.params.len(), 5); // 3 values + limit + offset
    }

    #[test]
    fn order_and_projection_use_validated_identifiers() {
        let schema = users_schema();
        let mut query = parse_query(&pairs(&[("select", "id,name")]), 1000).unwrap();
        query.order = Some(Order {
            column: "created_at".to_string(),
            direction: Direction::Desc,
        });
        let stmt = build_select(&schema, &query).unwrap();
        assert!(stmt.sql.starts_with("SELECT \"id\", \"name\" FROM \"users\""));
        assert!(stmt.sql.contains("ORDER BY \"created_at\" DESC"));
    }

    #[test]
    fn unknown_column_is_schema_error() {
        let schema = users_schema();
        let query = parse_query(&pairs(&[("eq.password", "x")]), 1000).unwrap();
        assert!(matches!(
            build_select(&schema, &query),
            Err(Error::Schema(_))
        ));
        let query = parse_query(&pairs(&[("select", "id,secret")]), 1000).unwrap();
        assert!(matches!(
            build_select(&schema, &query),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn update_refuses_empty_filters() {
        let schema = users_schema();
        let mut values = serde_json::Map::new();
        values.insert("name".to_string(), Value::String("x".to_string()));
        let err = build_update(&schema, &values, &[], true).unwrap_err();
        assert!(matches!(err, Error::BadRequest(msg) if msg.contains("filter")));
    }

    #[test]
    fn delete_refuses_empty_filters() {
        let schema = users_schema();
        let err = build_delete(&schema, &[]).unwrap_err();
        assert!(matches!(err, Error::BadRequest(msg) if msg.contains("filter")));
    }

    #[test]
    fn update_compiles_with_filters() {
        let schema = users_schema();
        let mut values = serde_json::Map::new();
        values.insert("active".to_string(), Value::Bool(false));
        let query = parse_query(&pairs(&[("eq.id", "7")]), 1000).unwrap();
        let stmt = build_update(&schema, &values, &query.filters, true).unwrap();
        assert_eq!(
            stmt.sql,
            "UPDATE \"users\" SET \"active\" = $1 WHERE \"id\" = $2 RETURNING *"
        );
        assert_eq!(stmt.params, vec![ParamValue::Bool(false), ParamValue::I64(7)]);
    }

    #[test]
    fn insert_validates_body_keys() {
        let schema = users_schema();
        let mut row = serde_json::Map::new();
        row.insert("name".to_string(), Value::String("Jane".to_string()));
        row.insert("nope".to_string(), Value::Bool(true));
        assert!(matches!(
            build_insert(&schema, &row, false),
            Err(Error::Schema(_))
        ));
    }

    #[test]
    fn insert_compiles_and_honors_returning() {
        let schema = users_schema();
        let mut row = serde_json::Map::new();
        row.insert("name".to_string(), Value::String("Jane".to_string()));
        let stmt = build_insert(&schema, &row, true).unwrap();
        assert_eq!(
            stmt.sql,
            "INSERT INTO \"users\" (\"name\") VALUES ($1) RETURNING *"
        );
        let stmt = build_insert(&schema, &row, false).unwrap();
        assert!(!stmt.sql.contains("RETURNING"));
    }

    #[test]
    fn coercion_rejects_mismatched_values() {
        let schema = users_schema();
        let query = parse_query(&pairs(&[("eq.id", "not-a-number")]), 1000).unwrap();
        assert!(matches!(
            build_select(&schema, &query),
            Err(Error::BadRequest(_))
        ));
        let query = parse_query(&pairs(&[("eq.org", "not-a-uuid")]), 1000).unwrap();
        assert!(build_select(&schema, &query).is_err());
        let query = parse_query(&pairs(&[("eq.active", "maybe")]), 1000).unwrap();
        assert!(build_select(&schema, &query).is_err());
    }

    #[test]
    fn like_casts_column_to_text() {
        let schema = users_schema();
        let query = parse_query(&pairs(&[("ilike.name", "%jo%")]), 1000).unwrap();
        let stmt = build_select(&schema, &query).unwrap();
        assert!(stmt.sql.contains("\"name\"::text ILIKE $1"));
    }
}
