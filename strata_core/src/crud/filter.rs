//! Query-string grammar for the public data API.
//!
//! `select=*|c1,c2`, `order=col.asc|desc`, `limit`, `offset`, and filter
//! pairs of the form `<op>.<column>=<value>` over a closed operator set.
//! Unknown operators are rejected at parse time.

use crate::{Error, Result};

/// Closed filter operator set; one variant per operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOp {
    Eq(String),
    Neq(String),
    Lt(String),
    Lte(String),
    Gt(String),
    Gte(String),
    Like(String),
    Ilike(String),
    In(Vec<String>),
}

impl FilterOp {
    /// SQL comparison operator; `In` is handled separately.
    pub fn sql_operator(&self) -> &'static str {
        match self {
            FilterOp::Eq(_) => "=",
            FilterOp::Neq(_) => "<>",
            FilterOp::Lt(_) => "<",
            FilterOp::Lte(_) => "<=",
            FilterOp::Gt(_) => ">",
            FilterOp::Gte(_) => ">=",
            FilterOp::Like(_) => "LIKE",
            FilterOp::Ilike(_) => "ILIKE",
            FilterOp::In(_) => "IN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Select {
    All,
    Columns(Vec<String>),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

/// Parsed query-string for one CRUD call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrudQuery {
    pub select: Select,
    pub order: Option<Order>,
    pub limit: i64,
    pub offset: i64,
    pub filters: Vec<Filter>,
}

const DEFAULT_LIMIT: i64 = 100;

/// Parse raw query pairs. `max_rows` caps `limit`.
pub fn parse_query(pairs: &[(String, String)], max_rows: u32) -> Result<CrudQuery> {
    let mut select = Select::All;
    let mut order = None;
    let mut limit = DEFAULT_LIMIT.min(max_rows as i64);
    let mut offset = 0i64;
    let mut filters = Vec::new();

    for (key, value) in pairs {
        match key.as_str() {
            "select" => select = parse_select(value)?,
            "order" => order = Some(parse_order(value)?),
            "limit" => {
                limit = value
                    .parse::<i64>()
                    .map_err(|_| Error::BadRequest(format!("invalid limit '{value}'")))?;
                if limit < 1 || limit > max_rows as i64 {
                    return Err(Error::BadRequest(format!(
                        "limit must be between 1 and {max_rows}"
                    )));
                }
            }
            "offset" => {
                offset = value
                    .parse::<i64>()
                    .map_err(|_| Error::BadRequest(format!("invalid offset '{value}'")))?;
                if offset < 0 {
                    return Err(Error::BadRequest("offset must be >= 0".to_string()));
                }
            }
            _ => filters.push(parse_filter(key, value)?),
        }
    }

    Ok(CrudQuery {
        select,
        order,
        limit,
        offset,
        filters,
    })
}

fn parse_select(value: &str) -> Result<Select> {
    let value = value.trim();
    if value.is_empty() || value == "*" {
        return Ok(Select::All);
    }
    let columns: Vec<String> = value
        .split(',')
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    if columns.is_empty() {
        return Ok(Select::All);
    }
    Ok(Select::Columns(columns))
}

fn parse_order(value: &str) -> Result<Order> {
    let (column, dir) = value
        .rsplit_once('.')
        .ok_or_else(|| Error::BadRequest(format!("order must be 'column.asc|desc', got '{value}'")))?;
    let direction = match dir {
        "asc" => Direction::Asc,
        "desc" => Direction::Desc,
        other => {
            return Err(Error::BadRequest(format!(
                "order direction must be 'asc' or 'desc', got '{other}'"
            )));
        }
    };
    if column.trim().is_empty() {
        return Err(Error::BadRequest("order column is empty".to_string()));
    }
    Ok(Order {
        column: column.trim().to_string(),
        direction,
    })
}

fn parse_filter(key: &str, value: &str) -> Result<Filter> {
    let (op, column) = key.split_once('.').ok_or_else(|| {
        Error::BadRequest(format!(
            "unrecognized query parameter '{key}' (filters are '<op>.<column>')"
        ))
    })?;
    if column.trim().is_empty() {
        return Err(Error::BadRequest(format!("filter '{key}' has no column")));
    }
    let column = column.trim().to_string();
    let value = value.to_string();
    let op = match op {
        "eq" => FilterOp::Eq(value),
        "neq" => FilterOp::Neq(value),
        "lt" => FilterOp::Lt(value),
        "lte" => FilterOp::Lte(value),
        "gt" => FilterOp::Gt(value),
        "gte" => FilterOp::Gte(value),
        "like" => FilterOp::Like(value),
        "ilike" => FilterOp::Ilike(value),
        "in" => FilterOp::In(
            value
                .split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect(),
        ),
        other => {
            return Err(Error::BadRequest(format!(
                "unknown filter operator '{other}'"
            )));
        }
    };
    if let FilterOp::In(values) = &op {
        if values.is_empty() {
            return Err(Error::BadRequest(format!(
                "'in' filter on '{column}' has no values"
            )));
        }
    }
    Ok(Filter { column, op })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults() {
        let q = parse_query(&[], 1000).unwrap();
        assert_eq!(q.select, Select::All);
        assert!(q.order.is_none());
        assert_eq!(q.limit, 100);
        assert_eq!(q.offset, 0);
        assert!(q.filters.is_empty());
    }

    #[test]
    fn parses_every_operator() {
        let q = parse_query(
            &pairs(&[
                ("eq.name", "John"),
                ("neq.city", "Oslo"),
                ("lt.age", "30"),
                ("lte.age", "29"),
                ("gt.score", "1.5"),
                ("gte.score", "2"),
                ("like.email", "%@x"),
                ("ilike.email", "%@X"),
                ("in.id", "1,2,3"),
            ]),
            1000,
        )
        .unwrap();
        assert_eq!(q.filters.len(), 9);
        assert_eq!(
            q.filters[8].op,
            FilterOp::In(vec!["1".into(), "2".into(), "3".into()])
        );
    }

    #[test]
    fn unknown_operator_is_rejected() {
        let err = parse_query(&pairs(&[("regex.name", "x")]), 1000).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn bare_unknown_key_is_rejected() {
        assert!(parse_query(&pairs(&[("name", "x")]), 1000).is_err());
    }

    #[test]
    fn limit_bounds() {
        assert!(parse_query(&pairs(&[("limit", "0")]), 1000).is_err());
        assert!(parse_query(&pairs(&[("limit", "1001")]), 1000).is_err());
        let q = parse_query(&pairs(&[("limit", "1000")]), 1000).unwrap();
        assert_eq!(q.limit, 1000);
    }

    #[test]
    fn default_limit_respects_lower_cap() {
        let q = parse_query(&[], 50).unwrap();
        assert_eq!(q.limit, 50);
    }

    #[test]
    fn negative_offset_is_rejected() {
        assert!(parse_query(&pairs(&[("offset", "-1")]), 1000).is_err());
    }

    #[test]
    fn order_parse() {
        let q = parse_query(&pairs(&[("order", "created_at.desc")]), 1000).unwrap();
        let order = q.order.unwrap();
        assert_eq!(order.column, "created_at");
        assert_eq!(order.direction, Direction::Desc);
        assert!(parse_query(&pairs(&[("order", "name")]), 1000).is_err());
        assert!(parse_query(&pairs(&[("order", "name.up")]), 1000).is_err());
    }

    #[test]
    fn select_parse() {
        let q = parse_query(&pairs(&[("select", "id, name")]), 1000).unwrap();
        assert_eq!(
            q.select,
            Select::Columns(vec!["id".into(), "name".into()])
        );
        let q = parse_query(&pairs(&[("select", "*")]), 1000).unwrap();
        assert_eq!(q.select, Select::All);
    }

    #[test]
    fn empty_in_list_is_rejected() {
        assert!(parse_query(&pairs(&[("in.id", "")]), 1000).is_err());
    }
}
