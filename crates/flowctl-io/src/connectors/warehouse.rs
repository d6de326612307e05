//! Warehouse connector (BigQuery-like): a query-only tap with the
//! versioned-read ranking transform, and a batch-load sink with
//! disposition mapping and one-shot dataset-not-found retry.

use std::sync::Arc;

use async_trait::async_trait;
use datafusion::arrow::array::{new_null_array, RecordBatch};
use datafusion::arrow::datatypes::{Schema, SchemaRef};

use flowctl_core::model::{DataMode, SchemaMode, WarehouseConnection};
use flowctl_core::{Columns, FlowError, Result};
use flowctl_sql::SqlAdapter;

use crate::base::{Connector, ConnectorBase};

/// The warehouse's write disposition for a load job, mapped from the
/// connection's `data_mode`/`schema_mode` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteDisposition {
    WriteAppend,
    WriteTruncate,
    WriteEmpty,
    AllowFieldAddition,
}

/// `schema_mode=overwrite` always wins (full schema replace); an explicit
/// `schema_mode=merge` grants field addition regardless of `data_mode`;
/// otherwise the plain `data_mode` mapping applies and a schema mismatch
/// is left for the sink to catch as a conflict.
fn write_disposition(mode: DataMode, schema_mode: Option<SchemaMode>) -> WriteDisposition {
    match (mode, schema_mode) {
        (DataMode::Error, _) => WriteDisposition::WriteEmpty,
        (DataMode::Overwrite, _) => WriteDisposition::WriteTruncate,
        (_, Some(SchemaMode::Overwrite)) => WriteDisposition::WriteTruncate,
        (_, Some(SchemaMode::Merge)) => WriteDisposition::AllowFieldAddition,
        (DataMode::Append, None) => WriteDisposition::WriteAppend,
        (DataMode::Merge, None) => WriteDisposition::WriteAppend,
    }
}

/// True when both schemas declare the same column names, independent of
/// order.
fn schemas_match(a: &SchemaRef, b: &SchemaRef) -> bool {
    let mut a_names: Vec<&str> = a.fields().iter().map(|f| f.name().as_str()).collect();
    let mut b_names: Vec<&str> = b.fields().iter().map(|f| f.name().as_str()).collect();
    a_names.sort_unstable();
    b_names.sort_unstable();
    a_names == b_names
}

/// Merges two schemas, keeping `a`'s field order and appending any of
/// `b`'s fields `a` lacks.
fn union_schema(a: &SchemaRef, b: &SchemaRef) -> SchemaRef {
    let mut fields: Vec<_> = a.fields().iter().map(|f| f.as_ref().clone()).collect();
    for field in b.fields() {
        if !fields.iter().any(|f| f.name() == field.name()) {
            fields.push(field.as_ref().clone());
        }
    }
    Arc::new(Schema::new(fields))
}

/// Reshapes `batch` to `target`, padding columns the batch lacks with
/// nulls so differently-shaped batches can be concatenated under
/// `AllowFieldAddition`.
fn conform_batch(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch> {
    let mut columns = Vec::with_capacity(target.fields().len());
    for field in target.fields() {
        match batch.schema().index_of(field.name()) {
            Ok(idx) => columns.push(batch.column(idx).clone()),
            Err(_) => columns.push(new_null_array(field.data_type(), batch.num_rows())),
        }
    }
    RecordBatch::try_new(target.clone(), columns).map_err(|e| anyhow::Error::from(e).into())
}

/// A thin client over the embedded SQL runtime standing in for the
/// warehouse's native driver: `query` runs against the dataset's
/// registered tables, `load` materializes a batch as a dataset table.
/// This keeps the connector runnable without a live warehouse account
/// while preserving the dispatch shape a real client would expose.
pub struct WarehouseConnector {
    base: ConnectorBase,
    conn: WarehouseConnection,
}

impl WarehouseConnector {
    pub fn new(stage_name: &str, conn: WarehouseConnection) -> Self {
        let config = conn.common.config.clone().unwrap_or_default();
        Self { base: ConnectorBase::new(stage_name, config), conn }
    }

    fn dataset_table(&self) -> Result<String> {
        // Warehouse locators are `<dataset>.<table>` names, not bucket
        // paths, so resolution only validates presence of the
        // `warehouse` config block rather than joining under a bucket.
        if self.conn.locator.trim().is_empty() {
            return Err(FlowError::Configuration("warehouse connection locator is empty".into()));
        }
        Ok(self.conn.locator.clone())
    }
}

#[async_trait]
impl Connector for WarehouseConnector {
    async fn tap(&mut self, sql: &SqlAdapter, stage_name: &str, query: Option<&str>) -> Result<()> {
        let table = self.dataset_table()?;
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

        let result = sql.sql(&effective_sql).await;
        let rel = match result {
            Ok(r) => r,
            Err(e) if is_dataset_not_found(&e) => {
                return Err(FlowError::TapSourceMissing(format!(
                    "warehouse dataset/table '{table}' not found: {e}"
                )));
            }
            Err(e) => return Err(e),
        };
        let schema = rel
            .fetch_one()
            .map(|b| b.schema())
            .ok_or_else(|| FlowError::TapSourceMissing(table.clone()))?;
        sql.unregister(stage_name).ok();
        sql.register(stage_name, rel.batches().to_vec(), schema)?;
        Ok(())
    }

    async fn sink(&mut self, sql: &SqlAdapter, from_name: &str) -> Result<()> {
        let table = self.dataset_table()?;
        let disposition = write_disposition(self.conn.data_mode, self.conn.schema_mode);

        let rel = sql.sql(&format!("SELECT * FROM \"{from_name}\"")).await?;
        let batches: Vec<RecordBatch> = rel.batches().to_vec();
        if batches.is_empty() {
            return Ok(());
        }
        let schema = batches[0].schema();

        let exists = sql.table_exists(&table).await;
        if !exists {
            // dataset-not-found retry-once: create the destination table
            // from the incoming schema and load once more.
            sql.register(&table, batches.clone(), schema.clone())?;
            return Ok(());
        }

        match disposition {
            WriteDisposition::WriteEmpty => {
                if sql.row_count(&table).await.unwrap_or(0) > 0 {
                    return Err(FlowError::DataModeConflict(format!(
                        "warehouse table '{table}' is not empty and data_mode is error"
                    )));
                }
                sql.unregister(&table).ok();
                sql.register(&table, batches, schema)?;
            }
            WriteDisposition::WriteTruncate => {
                sql.unregister(&table).ok();
                sql.register(&table, batches, schema)?;
            }
            WriteDisposition::WriteAppend => {
                let existing = sql.sql(&format!("SELECT * FROM \"{table}\"")).await?;
                let existing_batches = existing.batches().to_vec();
                let existing_schema = existing_batches.first().map(|b| b.schema()).unwrap_or_else(|| schema.clone());
                if !schemas_match(&existing_schema, &schema) {
                    return Err(FlowError::SchemaModeConflict(format!(
                        "warehouse table '{table}' schema does not match incoming data; set schema_mode=merge to allow field addition"
                    )));
                }
                let mut all = existing_batches;
                all.extend(batches);
                sql.unregister(&table).ok();
                sql.register(&table, all, existing_schema)?;
            }
            WriteDisposition::AllowFieldAddition => {
                let existing = sql.sql(&format!("SELECT * FROM \"{table}\"")).await?;
                let existing_batches = existing.batches().to_vec();
                let existing_schema = existing_batches.first().map(|b| b.schema()).unwrap_or_else(|| schema.clone());
                let merged_schema = union_schema(&existing_schema, &schema);

                let mut all = Vec::with_capacity(existing_batches.len() + batches.len());
                for batch in &existing_batches {
                    all.push(conform_batch(batch, &merged_schema)?);
                }
                for batch in &batches {
                    all.push(conform_batch(batch, &merged_schema)?);
                }
                sql.unregister(&table).ok();
                sql.register(&table, all, merged_schema)?;
            }
        }
        Ok(())
    }

    async fn sql(&mut self, sql: &SqlAdapter, statement: &str) -> Result<()> {
        sql.sql(statement).await?;
        Ok(())
    }

    async fn show_schema(&mut self, sql: &SqlAdapter, stage_name: &str) -> Result<Columns> {
        let table = self.dataset_table().unwrap_or_else(|_| stage_name.to_string());
        sql.columns(&table).await
    }
}

/// Classifies a query failure as the warehouse's "dataset/table not
/// found" condition via string matching on the provider's error message,
/// matching the original's own string-matching approach (no structured
/// error codes are exposed through this adapter).
fn is_dataset_not_found(err: &FlowError) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("not found") || msg.contains("does not exist") || msg.contains("table_not_found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_disposition_maps() {
        assert_eq!(write_disposition(DataMode::Append, None), WriteDisposition::WriteAppend);
    }

    #[test]
    fn overwrite_disposition_maps() {
        assert_eq!(write_disposition(DataMode::Overwrite, None), WriteDisposition::WriteTruncate);
    }

    #[test]
    fn error_disposition_maps() {
        assert_eq!(write_disposition(DataMode::Error, None), WriteDisposition::WriteEmpty);
    }

    #[test]
    fn merge_with_schema_overwrite_truncates() {
        assert_eq!(
            write_disposition(DataMode::Merge, Some(SchemaMode::Overwrite)),
            WriteDisposition::WriteTruncate
        );
    }

    #[test]
    fn merge_without_schema_mode_is_plain_append() {
        assert_eq!(write_disposition(DataMode::Merge, None), WriteDisposition::WriteAppend);
    }

    #[test]
    fn merge_schema_mode_grants_field_addition() {
        assert_eq!(
            write_disposition(DataMode::Merge, Some(SchemaMode::Merge)),
            WriteDisposition::AllowFieldAddition
        );
    }

    #[test]
    fn append_with_schema_merge_grants_field_addition() {
        assert_eq!(
            write_disposition(DataMode::Append, Some(SchemaMode::Merge)),
            WriteDisposition::AllowFieldAddition
        );
    }

    #[test]
    fn append_schema_overwrite_truncates() {
        assert_eq!(
            write_disposition(DataMode::Append, Some(SchemaMode::Overwrite)),
            WriteDisposition::WriteTruncate
        );
    }

    #[test]
    fn schemas_match_ignores_order() {
        use datafusion::arrow::datatypes::{DataType, Field};
        let a = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true), Field::new("b", DataType::Int64, true)]));
        let b = Arc::new(Schema::new(vec![Field::new("b", DataType::Int64, true), Field::new("a", DataType::Int64, true)]));
        assert!(schemas_match(&a, &b));
    }

    #[test]
    fn schemas_match_detects_extra_column() {
        use datafusion::arrow::datatypes::{DataType, Field};
        let a = Arc::new(Schema::new(vec![Field::new("a", DataType::Int64, true), Field::new("b", DataType::Int64, true)]));
        let b = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("b", DataType::Int64, true),
            Field::new("c", DataType::Int64, true),
        ]));
        assert!(!schemas_match(&a, &b));
    }
}
