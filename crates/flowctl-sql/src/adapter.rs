//! Wraps a single embedded `datafusion::prelude::SessionContext`
//! process-wide: register/unregister in-memory tables, scoped credential
//! secrets, and `read_json|read_parquet|read_csv` ingestion.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Datelike;
use datafusion::arrow::array::RecordBatch;
use datafusion::arrow::datatypes::SchemaRef;
use datafusion::datasource::MemTable;
use datafusion::prelude::{SessionConfig, SessionContext};
use flowctl_core::{ConnectionConfiguration, FlowError, Result};
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use url::Url;

/// A thin handle around `DataFrame::collect()`/`fetch one row`/raw access.
pub struct Relation {
    batches: Vec<RecordBatch>,
}

impl Relation {
    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn row_count(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }

    pub fn fetch_one(&self) -> Option<&RecordBatch> {
        self.batches.first()
    }

    /// Escape hatch matching the source's `Relation.raw()`.
    pub fn raw(&self) -> &[RecordBatch] {
        &self.batches
    }
}

/// Adapter around the embedded analytical SQL engine. One instance is
/// shared by a scheduler run and all of its nested sub-pipelines.
pub struct SqlAdapter {
    ctx: SessionContext,
    sandboxed: bool,
    secret_scopes: Mutex<HashSet<String>>,
}

impl SqlAdapter {
    /// Opens the engine. In a "sandboxed" environment, local filesystem
    /// scan functions and `delta_scan` are refused by the caller (the
    /// table-format and File connectors check `is_sandboxed()` before
    /// issuing those statements).
    pub async fn connect(sandboxed: bool) -> Result<Self> {
        let config = SessionConfig::new().with_information_schema(true);
        let ctx = SessionContext::new_with_config(config);
        crate::macros::install(&ctx)?;
        Ok(Self { ctx, sandboxed, secret_scopes: Mutex::new(HashSet::new()) })
    }

    pub fn is_sandboxed(&self) -> bool {
        self.sandboxed
    }

    pub fn session(&self) -> &SessionContext {
        &self.ctx
    }

    /// Upserts a named credential scope for `config`, keyed by bucket URI
    /// so multiple buckets coexist without precedence ambiguity. Re-
    /// registering the same URI is a safe overwrite, matching spec.md §5's
    /// "upsert-idempotent" requirement. Builds and registers a real
    /// `object_store` backend against this session's runtime, scoped to
    /// the bucket URL, so `s3://`/`gs://` paths in SQL resolve with the
    /// stage's own credentials rather than ambient ones.
    pub fn inject_secrets(&self, scope_name: &str, config: &ConnectionConfiguration) -> Result<()> {
        let mut scopes = self.secret_scopes.lock().expect("secret scope lock poisoned");

        if let Some(bucket) = &config.s3.bucket.bucket {
            let uri = format!("s3://{bucket}");
            let url = Url::parse(&uri)
                .map_err(|e| FlowError::Configuration(format!("invalid S3 bucket URI '{uri}': {e}")))?;
            let mut builder = AmazonS3Builder::new().with_bucket_name(bucket);
            if let Some(region) = &config.s3.bucket.region {
                builder = builder.with_region(region);
            }
            if let Some(key) = &config.s3.access_key_id {
                builder = builder.with_access_key_id(key);
            }
            if let Some(secret) = &config.s3.secret_access_key {
                builder = builder.with_secret_access_key(secret);
            }
            let store = builder
                .build()
                .map_err(|e| FlowError::Configuration(format!("failed to build S3 store for '{uri}': {e}")))?;
            self.ctx.runtime_env().register_object_store(&url, Arc::new(store));
            scopes.insert(uri);
        }

        if let Some(bucket) = &config.gs.bucket.bucket {
            let uri = format!("gs://{bucket}");
            let url = Url::parse(&uri)
                .map_err(|e| FlowError::Configuration(format!("invalid GS bucket URI '{uri}': {e}")))?;
            let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(bucket);
            if let Some(file) = &config.gs.credential_file {
                builder = builder.with_service_account_path(file);
            }
            let store = builder
                .build()
                .map_err(|e| FlowError::Configuration(format!("failed to build GS store for '{uri}': {e}")))?;
            self.ctx.runtime_env().register_object_store(&url, Arc::new(store));
            scopes.insert(uri);
        }

        tracing::debug!(scope = scope_name, "credential scopes injected");
        Ok(())
    }

    pub async fn sql(&self, query: &str) -> Result<Relation> {
        let df = self
            .ctx
            .sql(query)
            .await
            .map_err(|e| FlowError::Other(classify_sql_error(query, e)))?;
        let batches = df
            .collect()
            .await
            .map_err(|e| FlowError::Other(classify_sql_error(query, e)))?;
        Ok(Relation { batches })
    }

    pub fn register(&self, name: &str, batches: Vec<RecordBatch>, schema: SchemaRef) -> Result<()> {
        let table = MemTable::try_new(schema, vec![batches]).map_err(anyhow::Error::from)?;
        self.ctx
            .register_table(name, Arc::new(table))
            .map_err(anyhow::Error::from)?;
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        self.ctx.deregister_table(name).map_err(anyhow::Error::from)?;
        Ok(())
    }

    pub async fn table_exists(&self, name: &str) -> bool {
        self.ctx.table_exist(name).unwrap_or(false)
    }

    pub async fn drop_table(&self, name: &str) -> Result<()> {
        self.sql(&format!("DROP TABLE IF EXISTS \"{name}\"")).await.map(|_| ())
    }

    /// `Fn.columns(table)` equivalent: returns `(name, type)` pairs for a
    /// registered table via `information_schema.columns`.
    pub async fn columns(&self, table: &str) -> Result<flowctl_core::Columns> {
        let rel = self
            .sql(&format!(
                "SELECT column_name, data_type FROM information_schema.columns WHERE table_name = '{table}'"
            ))
            .await?;
        let mut fields = vec![];
        for batch in rel.batches() {
            let names = batch
                .column(0)
                .as_any()
                .downcast_ref::<datafusion::arrow::array::StringArray>()
                .ok_or_else(|| FlowError::Configuration("unexpected column_name type".into()))?;
            let types = batch
                .column(1)
                .as_any()
                .downcast_ref::<datafusion::arrow::array::StringArray>()
                .ok_or_else(|| FlowError::Configuration("unexpected data_type type".into()))?;
            for i in 0..batch.num_rows() {
                fields.push(flowctl_core::Column {
                    name: names.value(i).to_string(),
                    type_name: types.value(i).to_string(),
                });
            }
        }
        Ok(flowctl_core::Columns::new(fields))
    }

    /// `Fn.calendar(table, start, end)` equivalent: materializes one row
    /// per day in `[start_epoch, end_epoch]` with ISO calendar and 4-4-5
    /// fiscal fields, the same non-UDF route as `columns()` since
    /// DataFusion has no table-macro mechanism to register this against.
    pub fn generate_calendar(&self, table_name: &str, start_epoch: i64, end_epoch: i64) -> Result<()> {
        use datafusion::arrow::array::{Int64Array, StringArray};
        use datafusion::arrow::datatypes::{DataType, Field, Schema};

        if end_epoch < start_epoch {
            return Err(FlowError::Configuration(format!(
                "generate_calendar(): end {end_epoch} precedes start {start_epoch}"
            )));
        }

        let mut dates = vec![];
        let mut epochs = vec![];
        let mut iso_years = vec![];
        let mut iso_weeks = vec![];
        let mut iso_days = vec![];
        let mut fiscal_periods = vec![];

        const SECONDS_PER_DAY: i64 = 86_400;
        let mut epoch = start_epoch - (start_epoch % SECONDS_PER_DAY);
        while epoch <= end_epoch {
            let naive = crate::macros::to_naive(epoch).ok_or_else(|| {
                FlowError::Configuration(format!("generate_calendar(): epoch {epoch} out of range"))
            })?;
            dates.push(naive.format("%Y-%m-%d").to_string());
            epochs.push(epoch);
            iso_years.push(naive.iso_week().year() as i64);
            iso_weeks.push(naive.iso_week().week() as i64);
            iso_days.push(naive.weekday().number_from_monday() as i64);
            fiscal_periods.push(crate::macros::fiscal_period_445(naive.iso_week().week()));
            epoch += SECONDS_PER_DAY;
        }

        let schema = Arc::new(Schema::new(vec![
            Field::new("date", DataType::Utf8, false),
            Field::new("epoch", DataType::Int64, false),
            Field::new("iso_year", DataType::Int64, false),
            Field::new("iso_week", DataType::Int64, false),
            Field::new("iso_day", DataType::Int64, false),
            Field::new("fiscal_period", DataType::Int64, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(dates)),
                Arc::new(Int64Array::from(epochs)),
                Arc::new(Int64Array::from(iso_years)),
                Arc::new(Int64Array::from(iso_weeks)),
                Arc::new(Int64Array::from(iso_days)),
                Arc::new(Int64Array::from(fiscal_periods)),
            ],
        )
        .map_err(anyhow::Error::from)?;
        self.register(table_name, vec![batch], schema)
    }

    pub async fn row_count(&self, table: &str) -> Result<u64> {
        let rel = self.sql(&format!("SELECT COUNT(*) AS c FROM \"{table}\"")).await?;
        let batch = rel.fetch_one().ok_or_else(|| {
            FlowError::Configuration(format!("row count query for '{table}' returned no rows"))
        })?;
        let col = batch
            .column(0)
            .as_any()
            .downcast_ref::<datafusion::arrow::array::UInt64Array>()
            .or_else(|| None);
        match col {
            Some(arr) => Ok(arr.value(0)),
            None => {
                // COUNT(*) may come back as Int64 depending on planner version.
                let arr = batch
                    .column(0)
                    .as_any()
                    .downcast_ref::<datafusion::arrow::array::Int64Array>()
                    .ok_or_else(|| FlowError::Configuration("unexpected COUNT(*) type".into()))?;
                Ok(arr.value(0) as u64)
            }
        }
    }
}

/// Maps a DataFusion error to the "replayable SQL error" class the LLM
/// SQL generator is permitted to re-prompt against (parser/syntax/
/// binder/catalog errors).
fn classify_sql_error(query: &str, err: datafusion::error::DataFusionError) -> anyhow::Error {
    let msg = err.to_string();
    let lowered = msg.to_lowercase();
    let replayable = ["sql error", "parser error", "schema error", "plan error"]
        .iter()
        .any(|marker| lowered.contains(marker));
    if replayable {
        anyhow::anyhow!("replayable SQL error executing `{query}`: {msg}")
    } else {
        anyhow::anyhow!("SQL execution error executing `{query}`: {msg}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datafusion::arrow::array::Int64Array;
    use datafusion::arrow::datatypes::{DataType, Field, Schema};

    #[tokio::test]
    async fn register_and_query_roundtrip() {
        let adapter = SqlAdapter::connect(false).await.unwrap();
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let batch =
            RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(vec![1, 2, 3]))])
                .unwrap();
        adapter.register("t", vec![batch], schema).unwrap();
        let rel = adapter.sql("SELECT COUNT(*) AS c FROM t").await.unwrap();
        assert_eq!(rel.row_count(), 1);
    }

    #[tokio::test]
    async fn row_count_helper() {
        let adapter = SqlAdapter::connect(false).await.unwrap();
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        let batch =
            RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(vec![1, 2, 3]))])
                .unwrap();
        adapter.register("t", vec![batch], schema).unwrap();
        assert_eq!(adapter.row_count("t").await.unwrap(), 3);
    }
}
