//! Query splitting.
//!
//! Turns one full-table `SELECT` into contiguous key-range slices that
//! together cover the session's shard exactly once. Boundaries come from
//! the engine's key statistics and are only estimates.

use sqlparser::ast::{GroupByExpr, SetExpr, Statement, TableFactor};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser as SqlParser;
use tablet_common::constants::{SPLIT_END_BIND_VAR, SPLIT_START_BIND_VAR};
use tablet_common::error::{TabletError, TabletResult};
use tablet_common::types::KeyRange;
use tablet_proto::{BoundQuery, QuerySplit, Value};

use crate::engine::TableStats;

/// A query accepted for splitting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPlan {
    /// Table the query scans.
    pub table: String,
    /// The query text without its `WHERE` clause.
    pub base: String,
    /// The original `WHERE` expression, if any.
    pub filter: Option<String>,
}

/// Parses `sql` and checks that it can be split.
///
/// # Errors
///
/// `InvalidArgument` unless the query is a single-table `SELECT` without
/// joins, grouping, ordering, limits or set operations.
pub fn analyze(sql: &str) -> TabletResult<SplitPlan> {
    let mut statements = SqlParser::parse_sql(&MySqlDialect {}, sql)
        .map_err(|e| TabletError::invalid_argument(format!("cannot parse split query: {e}")))?;
    if statements.len() != 1 {
        return Err(unsplittable("must be a single statement"));
    }
    let Statement::Query(mut query) = statements.remove(0) else {
        return Err(unsplittable("must be a SELECT"));
    };

    if query.with.is_some() {
        return Err(unsplittable("must not use WITH"));
    }
    if !query.order_by.is_empty() {
        return Err(unsplittable("must not use ORDER BY"));
    }
    if query.limit.is_some() || query.offset.is_some() || query.fetch.is_some() {
        return Err(unsplittable("must not use LIMIT"));
    }
    if !query.locks.is_empty() {
        return Err(unsplittable("must not lock rows"));
    }

    let select = match query.body.as_mut() {
        SetExpr::Select(select) => select,
        SetExpr::SetOperation { .. } => return Err(unsplittable("must not use UNION")),
        _ => return Err(unsplittable("must be a plain SELECT")),
    };

    if select.from.len() != 1 || !select.from[0].joins.is_empty() {
        return Err(unsplittable("must read exactly one table without JOIN"));
    }
    let table = match &select.from[0].relation {
        TableFactor::Table { name, .. } => name
            .0
            .last()
            .map(|ident| ident.value.clone())
            .ok_or_else(|| unsplittable("must name a table"))?,
        _ => return Err(unsplittable("must read from a table")),
    };
    match &select.group_by {
        GroupByExpr::Expressions(exprs) if exprs.is_empty() => {}
        _ => return Err(unsplittable("must not use GROUP BY")),
    }
    if select.having.is_some() {
        return Err(unsplittable("must not use HAVING"));
    }

    let filter = select.selection.take().map(|expr| expr.to_string());
    Ok(SplitPlan {
        table,
        base: query.to_string(),
        filter,
    })
}

fn unsplittable(reason: &str) -> TabletError {
    TabletError::invalid_argument(format!("split query {reason}"))
}

/// Splits a planned query into at most `split_count` slices of `range`.
///
/// Interior boundaries are spread evenly over the table's key bounds,
/// clamped into `range`. The first slice starts where `range` starts and
/// the last one ends where it ends, so the slices never leave a gap.
pub fn split(
    query: &BoundQuery,
    plan: &SplitPlan,
    stats: &TableStats,
    range: KeyRange,
    split_count: u64,
) -> Vec<QuerySplit> {
    let bounds = boundaries(stats, range, split_count);

    let mut edges = Vec::with_capacity(bounds.len() + 2);
    edges.push(range.start);
    edges.extend(bounds.into_iter().map(Some));
    edges.push(range.end);

    let slices = edges.len() as u64 - 1;
    let per_slice = stats.row_count / slices;
    let remainder = stats.row_count % slices;

    edges
        .windows(2)
        .zip(0u64..)
        .map(|(edge, i)| {
            let rows = per_slice + u64::from(i < remainder);
            QuerySplit {
                query: restrict(query, plan, &stats.key_column, edge[0], edge[1]),
                row_count: i64::try_from(rows).unwrap_or(i64::MAX),
            }
        })
        .collect()
}

/// Strictly increasing interior boundaries, all inside `range`.
fn boundaries(stats: &TableStats, range: KeyRange, split_count: u64) -> Vec<u64> {
    let lo = u128::from(range.clamp(stats.min_key));
    let hi = u128::from(range.clamp(stats.max_key.saturating_add(1)));
    if split_count <= 1 || hi <= lo {
        return Vec::new();
    }

    let n = u128::from(split_count);
    let mut bounds: Vec<u64> = Vec::new();
    for i in 1..n {
        let point = lo + (hi - lo) * i / n;
        let Ok(b) = u64::try_from(point) else {
            break;
        };
        let inside = point > lo && range.end.map_or(true, |e| b < e);
        if inside && bounds.last().map_or(true, |&last| b > last) {
            bounds.push(b);
        }
    }
    bounds
}

fn restrict(
    query: &BoundQuery,
    plan: &SplitPlan,
    key_column: &str,
    start: Option<u64>,
    end: Option<u64>,
) -> BoundQuery {
    let mut conditions = Vec::with_capacity(3);
    let mut bound = query.clone();

    if let Some(filter) = &plan.filter {
        conditions.push(format!("({filter})"));
    }
    if let Some(start) = start {
        conditions.push(format!("{key_column} >= :{SPLIT_START_BIND_VAR}"));
        bound
            .bind_variables
            .insert(SPLIT_START_BIND_VAR.to_string(), Value::UInt(start));
    }
    if let Some(end) = end {
        conditions.push(format!("{key_column} < :{SPLIT_END_BIND_VAR}"));
        bound
            .bind_variables
            .insert(SPLIT_END_BIND_VAR.to_string(), Value::UInt(end));
    }

    bound.sql = if conditions.is_empty() {
        plan.base.clone()
    } else {
        format!("{} WHERE {}", plan.base, conditions.join(" AND "))
    };
    bound
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_common::error::ErrorKind;

    fn stats(min_key: u64, max_key: u64, row_count: u64) -> TableStats {
        TableStats {
            key_column: "id".to_string(),
            min_key,
            max_key,
            row_count,
        }
    }

    fn key_of(split: &QuerySplit, name: &str) -> Option<u64> {
        split.query.bind_variables.get(name).and_then(Value::as_key)
    }

    #[test]
    fn test_analyze_simple_select() {
        let plan = analyze("select id, name from users where name = :name").unwrap();
        assert_eq!(plan.table, "users");
        assert!(!plan.base.to_lowercase().contains("where"));
        assert!(plan.filter.as_deref().unwrap().contains(":name"));

        let plan = analyze("select * from users").unwrap();
        assert_eq!(plan.filter, None);
    }

    #[test]
    fn test_analyze_rejects_unsplittable() {
        for sql in [
            "select * from a join b on a.id = b.id",
            "select * from a, b",
            "select name, count(*) from a group by name",
            "select * from a order by id",
            "select * from a limit 10",
            "select * from a union select * from b",
            "insert into a values (1)",
            "select * from a; select * from b",
            "not sql at all",
        ] {
            let err = analyze(sql).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{sql}");
        }
    }

    #[test]
    fn test_split_covers_full_range() {
        let query = BoundQuery::new("select * from users where active = 1").bind("x", 1i64);
        let plan = analyze(&query.sql).unwrap();
        let splits = split(&query, &plan, &stats(0, 999, 1000), KeyRange::full(), 4);

        assert_eq!(splits.len(), 4);
        assert_eq!(key_of(&splits[0], SPLIT_START_BIND_VAR), None);
        assert_eq!(key_of(&splits[3], SPLIT_END_BIND_VAR), None);
        for pair in splits.windows(2) {
            assert_eq!(
                key_of(&pair[0], SPLIT_END_BIND_VAR),
                key_of(&pair[1], SPLIT_START_BIND_VAR)
            );
        }
        assert_eq!(key_of(&splits[1], SPLIT_START_BIND_VAR), Some(250));
        assert!(splits.iter().all(|s| s.row_count == 250));
        assert!(splits.iter().all(|s| s.query.bind_variables.contains_key("x")));
        assert!(splits[1]
            .query
            .sql
            .ends_with("WHERE (active = 1) AND id >= :_split_start AND id < :_split_end"));
    }

    #[test]
    fn test_split_respects_shard_range() {
        let range = KeyRange::new(Some(100), Some(200));
        let query = BoundQuery::new("select * from t");
        let plan = analyze(&query.sql).unwrap();
        let splits = split(&query, &plan, &stats(0, 10_000, 7), range, 3);

        assert_eq!(key_of(&splits[0], SPLIT_START_BIND_VAR), Some(100));
        assert_eq!(key_of(splits.last().unwrap(), SPLIT_END_BIND_VAR), Some(200));
        for s in &splits {
            let start = key_of(s, SPLIT_START_BIND_VAR).unwrap();
            let end = key_of(s, SPLIT_END_BIND_VAR).unwrap();
            assert!(start < end);
        }
        let total: i64 = splits.iter().map(|s| s.row_count).sum();
        assert_eq!(total, 7);
        assert_eq!(splits[0].row_count, 3);
    }

    #[test]
    fn test_split_small_table_dedups_boundaries() {
        let query = BoundQuery::new("select * from t");
        let plan = analyze(&query.sql).unwrap();
        let splits = split(&query, &plan, &stats(5, 6, 2), KeyRange::full(), 10);

        assert_eq!(splits.len(), 2);
        assert_eq!(key_of(&splits[0], SPLIT_END_BIND_VAR), Some(6));
    }

    #[test]
    fn test_single_split_is_unrestricted() {
        let query = BoundQuery::new("select * from t");
        let plan = analyze(&query.sql).unwrap();
        let splits = split(&query, &plan, &stats(0, 100, 50), KeyRange::full(), 1);

        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].row_count, 50);
        assert!(splits[0].query.bind_variables.is_empty());
        assert_eq!(splits[0].query.sql, plan.base);
    }
}
