//! File/Object connectors: Parquet, JSON, CSV and the suffix-dispatching
//! `File` connection, plus the in-memory `Variable` connection.

use async_trait::async_trait;
use flowctl_core::model::{BucketKind, Connection, PhysicalFileConnection, VariableConnection, VersionedFields};
use flowctl_core::{Columns, FlowError, Result};
use flowctl_sql::SqlAdapter;

use crate::base::{Connector, ConnectorBase};

/// Formats the File/Object connectors understand. xlsx/xml/html are
/// explicitly out of scope (spec.md §4.F Non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Parquet,
    Json,
    Csv,
}

impl FileFormat {
    fn from_suffix(suffix: &str) -> Result<FileFormat> {
        match suffix.trim_start_matches('.').to_lowercase().as_str() {
            "parquet" => Ok(FileFormat::Parquet),
            "json" | "jsonl" => Ok(FileFormat::Json),
            "csv" => Ok(FileFormat::Csv),
            other => Err(FlowError::Configuration(format!(
                "unsupported file suffix '.{other}': only parquet/csv/json/jsonl are supported"
            ))),
        }
    }

    fn tag(tag: &str) -> FileFormat {
        match tag {
            "parquet" => FileFormat::Parquet,
            "json" => FileFormat::Json,
            "csv" => FileFormat::Csv,
            other => panic!("unknown forced file format tag '{other}'"),
        }
    }

    fn read_fn(&self) -> &'static str {
        match self {
            FileFormat::Parquet => "read_parquet",
            FileFormat::Json => "read_json",
            FileFormat::Csv => "read_csv",
        }
    }

    fn copy_options(&self) -> &'static str {
        match self {
            FileFormat::Parquet => "(FORMAT PARQUET)",
            FileFormat::Json => "(FORMAT JSON)",
            FileFormat::Csv => "(FORMAT CSV, HEADER true)",
        }
    }
}

/// Shared tap/sink/schema behavior for Parquet/JSON/CSV/File. `forced`
/// pins the format for the Parquet/JSON/CSV connections; `None` makes the
/// File connection dispatch on the locator's suffix.
pub struct FileConnector {
    base: ConnectorBase,
    conn: PhysicalFileConnection,
    forced: Option<FileFormat>,
}

impl FileConnector {
    pub fn new(stage_name: &str, conn: PhysicalFileConnection, forced: Option<&'static str>) -> Self {
        let config = conn.common.config.clone().unwrap_or_default();
        Self {
            base: ConnectorBase::new(stage_name, config),
            conn,
            forced: forced.map(FileFormat::tag),
        }
    }

    fn format(&self) -> Result<FileFormat> {
        if let Some(fmt) = self.forced {
            return Ok(fmt);
        }
        let suffix = flowctl_core::Path::parse(&self.conn.locator).suffix();
        FileFormat::from_suffix(&suffix)
    }

    fn resolved_locator(&self) -> Result<String> {
        self.base.locate(BucketKind::Local, &self.conn.locator, true)
    }
}

#[async_trait]
impl Connector for FileConnector {
    async fn tap(&mut self, sql: &SqlAdapter, stage_name: &str, query: Option<&str>) -> Result<()> {
        let locator = self.resolved_locator()?;
        let fmt = self.format()?;
        let raw_dispatch = self.conn.raw_dispatch.unwrap_or(false);

        let selectable = format!("{}('{}')", fmt.read_fn(), locator);
        let base_query = query.unwrap_or("SELECT * FROM x");

        let effective_sql = if raw_dispatch {
            match query {
                Some(q) => self.base.raw_sql_rewrite(q, &self.conn.locator, &locator)?,
                None => format!("SELECT * FROM {selectable}"),
            }
        } else {
            let (rewritten, where_clause) =
                self.base.ranking(base_query, &selectable, &VersionedFields::default())?;
            if where_clause.is_empty() {
                rewritten
            } else {
                format!("{rewritten} {where_clause}")
            }
        };

        sql.unregister(stage_name).ok();
        let rel = sql.sql(&effective_sql).await?;
        let schema = rel
            .fetch_one()
            .map(|b| b.schema())
            .ok_or_else(|| FlowError::TapSourceMissing(locator.clone()))?;
        sql.register(stage_name, rel.batches().to_vec(), schema)?;
        Ok(())
    }

    async fn sink(&mut self, sql: &SqlAdapter, from_name: &str) -> Result<()> {
        let locator = self.resolved_locator()?;
        let fmt = self.format()?;
        let stmt = format!(
            "COPY (SELECT * FROM \"{from_name}\") TO '{locator}' {}",
            fmt.copy_options()
        );
        sql.sql(&stmt).await?;
        Ok(())
    }

    async fn sql(&mut self, sql: &SqlAdapter, statement: &str) -> Result<()> {
        sql.sql(statement).await?;
        Ok(())
    }

    async fn show_schema(&mut self, sql: &SqlAdapter, stage_name: &str) -> Result<Columns> {
        sql.columns(stage_name).await
    }
}

/// The in-memory Variable connection. Taps expect the scheduler to have
/// already placed the referenced `Variables` entry into a table named
/// after the stage (it is the one connection whose tap reads scheduler
/// state rather than external storage); sinks write a stage's full result
/// set back out as a relation the scheduler copies into `Variables`.
pub struct VariableConnector {
    conn: VariableConnection,
}

impl VariableConnector {
    pub fn new(conn: VariableConnection) -> Self {
        Self { conn }
    }

    pub fn key(&self) -> &str {
        &self.conn.locator
    }
}

#[async_trait]
impl Connector for VariableConnector {
    async fn tap(&mut self, sql: &SqlAdapter, stage_name: &str, _query: Option<&str>) -> Result<()> {
        if sql.table_exists(stage_name).await {
            Ok(())
        } else {
            Err(FlowError::TapSourceMissing(format!(
                "variable '{}' has no value for stage '{stage_name}'",
                self.conn.locator
            )))
        }
    }

    async fn sink(&mut self, sql: &SqlAdapter, from_name: &str) -> Result<()> {
        sql.sql(&format!("SELECT * FROM \"{from_name}\"")).await?;
        Ok(())
    }

    async fn sql(&mut self, sql: &SqlAdapter, statement: &str) -> Result<()> {
        sql.sql(statement).await?;
        Ok(())
    }

    async fn show_schema(&mut self, sql: &SqlAdapter, stage_name: &str) -> Result<Columns> {
        sql.columns(stage_name).await
    }
}

pub fn connection_to_file_connector(stage_name: &str, connection: &Connection) -> Option<FileConnector> {
    match connection {
        Connection::Parquet(c) => Some(FileConnector::new(stage_name, c.clone(), Some("parquet"))),
        Connection::Json(c) => Some(FileConnector::new(stage_name, c.clone(), Some("json"))),
        Connection::Csv(c) => Some(FileConnector::new(stage_name, c.clone(), Some("csv"))),
        Connection::File(c) => Some(FileConnector::new(stage_name, c.clone(), None)),
        _ => None,
    }
}
