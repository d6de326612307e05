//! Connector Base contract: the shared `tap`/`sink`/`sql`/`show_schema`
//! trait plus the behavior every connector gets via composition (locator
//! resolution, the ranking hook, the raw-SQL rewriter).

use async_trait::async_trait;
use flowctl_core::model::{BucketKind, VersionedFields};
use flowctl_core::{Columns, ConnectionConfiguration, FlowError, Locator, Result};
use flowctl_sql::SqlAdapter;

/// Every connector exposes these four operations; errors are reported as
/// [`flowctl_core::FlowError`] variants.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn tap(&mut self, sql: &SqlAdapter, stage_name: &str, query: Option<&str>) -> Result<()>;
    async fn sink(&mut self, sql: &SqlAdapter, from_name: &str) -> Result<()>;
    async fn sql(&mut self, sql: &SqlAdapter, statement: &str) -> Result<()>;
    async fn show_schema(&mut self, sql: &SqlAdapter, stage_name: &str) -> Result<Columns>;
}

/// Shared connector plumbing, embedded by composition (not inheritance)
/// in every concrete connector.
pub struct ConnectorBase {
    pub stage_name: String,
    pub config: ConnectionConfiguration,
}

impl ConnectorBase {
    pub fn new(stage_name: impl Into<String>, config: ConnectionConfiguration) -> Self {
        Self { stage_name: stage_name.into(), config }
    }

    /// Resolves `raw_name` against the configured bucket/prefix, applying
    /// the wildcard substitution when requested.
    pub fn locate(&self, kind: BucketKind, raw_name: &str, use_wildcard: bool) -> Result<String> {
        let bucket_cfg = self.config.resolve_bucket(kind);
        let locator = Locator {
            bucket: bucket_cfg.bucket.as_deref(),
            prefix: bucket_cfg.data_prefix.as_deref(),
            wildcard: bucket_cfg
                .locator_wildcard
                .as_ref()
                .map(|(p, r)| (p.as_str(), r.as_str())),
        };
        locator.resolve(raw_name, use_wildcard)
    }

    /// Ranking hook: short-circuits to `(query, "")` for non-versioned
    /// connections, otherwise delegates to the versioned-read transform.
    pub fn ranking(
        &self,
        query: &str,
        selectable: &str,
        versioned: &VersionedFields,
    ) -> Result<(String, String)> {
        flowctl_sql::build_ranked_query(
            query,
            selectable,
            versioned.version.as_deref(),
            versioned.key.as_deref(),
        )
    }

    /// The raw-SQL rewriter (§4.A): substitutes the resolved long locator
    /// for the connection's short locator inside `delta_scan`/
    /// `read_parquet` calls.
    pub fn raw_sql_rewrite(&self, sql: &str, short_locator: &str, long_locator: &str) -> Result<String> {
        flowctl_core::rewrite_locators(sql, short_locator, long_locator)
    }
}

/// Maps the stage's declared preview `show` value to the sampling clause
/// described in spec.md §4.L's preview semantics.
pub fn preview_clause(show: f64, table: &str) -> Option<String> {
    if show == 0.0 {
        None
    } else if show == -1.0 {
        Some(format!("SELECT * FROM \"{table}\""))
    } else if show > 1.0 {
        Some(format!("SELECT * FROM \"{table}\" USING SAMPLE {} ROWS", show as i64))
    } else if show > 0.0 {
        let pct = (show * 100.0).round() as i64;
        Some(format!("SELECT * FROM \"{table}\" USING SAMPLE {pct}%"))
    } else {
        None
    }
}

pub fn not_implemented(what: &str) -> FlowError {
    FlowError::Configuration(format!("not implemented: {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_clause_disabled_on_zero() {
        assert!(preview_clause(0.0, "t").is_none());
    }

    #[test]
    fn preview_clause_all_on_minus_one() {
        assert_eq!(preview_clause(-1.0, "t").unwrap(), "SELECT * FROM \"t\"");
    }

    #[test]
    fn preview_clause_rows_for_n_greater_than_one() {
        assert_eq!(
            preview_clause(10.0, "t").unwrap(),
            "SELECT * FROM \"t\" USING SAMPLE 10 ROWS"
        );
    }

    #[test]
    fn preview_clause_percent_for_fraction() {
        assert_eq!(preview_clause(0.25, "t").unwrap(), "SELECT * FROM \"t\" USING SAMPLE 25%");
    }
}
