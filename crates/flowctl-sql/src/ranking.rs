//! Versioned-read ranking transform: injects
//! `ROW_NUMBER() OVER (PARTITION BY keys ORDER BY version DESC)` with the
//! safety checks from spec.md §4.D.

use datafusion::sql::sqlparser::dialect::GenericDialect;
use datafusion::sql::sqlparser::parser::Parser as SqlParser;
use flowctl_core::{FlowError, Result};

const AGGREGATE_MARKERS: &[&str] = &["avg(", "sum(", "count(", "min(", "max("];

/// Rejects base queries that would produce incorrect ranks under the
/// rewrite: a CTE, a `GROUP BY`, or (when ranking is requested) any
/// aggregate-function substring marker.
pub fn validate_simple_query(query: &str, ranking_enabled: bool) -> Result<()> {
    let dialect = GenericDialect {};
    let statements = SqlParser::parse_sql(&dialect, query)
        .map_err(|e| FlowError::Configuration(format!("cannot parse base query: {e}")))?;

    for stmt in &statements {
        let text = stmt.to_string();
        if has_with_clause(&text) {
            return Err(FlowError::Configuration(
                "CTEs are not supported in versioned-read source queries".into(),
            ));
        }
        if ranking_enabled {
            if has_group_by(&text) {
                return Err(FlowError::Configuration(
                    "GROUP BY is not supported when ranking is applied".into(),
                ));
            }
            let lowered = query.to_lowercase();
            if AGGREGATE_MARKERS.iter().any(|marker| lowered.contains(marker)) {
                return Err(FlowError::Configuration(
                    "aggregate functions are not allowed when ranking is applied".into(),
                ));
            }
        }
    }
    Ok(())
}

fn has_with_clause(rendered_sql: &str) -> bool {
    rendered_sql.trim_start().to_uppercase().starts_with("WITH")
}

fn has_group_by(rendered_sql: &str) -> bool {
    rendered_sql.to_uppercase().contains("GROUP BY")
}

/// Rewrites `query` to read from `selectable`, ranking rows by
/// `PARTITION BY keys ORDER BY version DESC` and wrapping the result in a
/// subquery named `ranked`. Returns `(sql, where_clause)`; when `version`
/// or `keys` are absent this is the identity transform and `where_clause`
/// is empty.
pub fn build_ranked_query(
    query: &str,
    selectable: &str,
    version: Option<&str>,
    keys: Option<&[String]>,
) -> Result<(String, String)> {
    let apply_ranking = version.is_some() && keys.is_some_and(|k| !k.is_empty());
    validate_simple_query(query, apply_ranking)?;

    let base = strip_trailing_semicolon(query);
    let base_with_selectable = substitute_from(&base, selectable);

    if !apply_ranking {
        return Ok((base_with_selectable, String::new()));
    }

    let version = version.unwrap();
    let keys = keys.unwrap();
    let partition_by = keys.join(", ");
    let rank_expr = format!(
        "ROW_NUMBER() OVER (PARTITION BY {partition_by} ORDER BY {version} DESC) AS __rank__"
    );
    let ranked_inner = format!(
        "SELECT *, {rank_expr} FROM ({base_with_selectable}) AS __ranking_source__"
    );
    let sql = format!("SELECT * FROM ({ranked_inner}) AS ranked");
    let where_clause = "WHERE \"__rank__\" = 1".to_string();
    Ok((sql, where_clause))
}

fn strip_trailing_semicolon(query: &str) -> String {
    query.trim().trim_end_matches(';').to_string()
}

/// Rewrites a bare `SELECT ... FROM <table>` query's `FROM` target to
/// `selectable`. If the query has no `FROM` clause at all (e.g.
/// `SELECT 1`), `selectable` is appended.
fn substitute_from(query: &str, selectable: &str) -> String {
    let lowered = query.to_lowercase();
    if let Some(from_idx) = lowered.find(" from ") {
        let (head, tail) = query.split_at(from_idx + 6);
        // tail begins right after "from "; replace up to the next
        // whitespace/clause boundary with `selectable`.
        let end = tail
            .find(|c: char| c.is_whitespace())
            .unwrap_or(tail.len());
        format!("{head}{selectable}{}", &tail[end..])
    } else {
        format!("{query} FROM {selectable}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_without_version_or_keys() {
        let (sql, wh) = build_ranked_query("SELECT * FROM x", "delta_scan('t')", None, None).unwrap();
        assert_eq!(sql, "SELECT * FROM delta_scan('t')");
        assert_eq!(wh, "");
    }

    #[test]
    fn ranked_query_wraps_in_subquery_named_ranked() {
        let keys = vec!["id".to_string()];
        let (sql, wh) = build_ranked_query(
            "SELECT * FROM x",
            "delta_scan('t')",
            Some("updated_at"),
            Some(&keys),
        )
        .unwrap();
        assert!(sql.contains("ROW_NUMBER() OVER (PARTITION BY id ORDER BY updated_at DESC)"));
        assert!(sql.contains("AS ranked"));
        assert_eq!(wh, "WHERE \"__rank__\" = 1");
    }

    #[test]
    fn rejects_cte() {
        let err = validate_simple_query("WITH a AS (SELECT 1) SELECT * FROM a", false);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_group_by_when_ranking_enabled() {
        let err = validate_simple_query("SELECT a, COUNT(*) FROM t GROUP BY a", true);
        assert!(err.is_err());
    }

    #[test]
    fn rejects_aggregates_when_ranking_enabled() {
        let err = validate_simple_query("SELECT SUM(amount) FROM t", true);
        assert!(err.is_err());
    }

    #[test]
    fn allows_aggregates_when_ranking_disabled() {
        validate_simple_query("SELECT SUM(amount) FROM t", false).unwrap();
    }
}
