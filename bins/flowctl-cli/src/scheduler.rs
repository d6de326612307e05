//! Stage Scheduler: walks a [`Stages`] list in document order, renders
//! each stage's templated fields, dispatches to the handler implied by
//! its `kind`, and fans sub-pipelines out over the previous stage's rows.

use std::collections::HashMap;
use std::time::Duration;

use flowctl_core::model::StageKind;
use flowctl_core::{FlowContext, FlowError, Renderer, Result, Stage, Stages, Variables};
use flowctl_sql::SqlAdapter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::LogFilterHandle;

/// Shared run state: one SQL-runtime handle, one Variables map, one
/// Context, carried by value into nested sub-pipeline schedulers so they
/// observe the same tables and variable mutations as their parent.
pub struct Scheduler<'a> {
    sql: &'a SqlAdapter,
    context: FlowContext,
    variables: Variables,
    lastname: Option<String>,
    flow_on_error_continue: bool,
    filter_handle: LogFilterHandle,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        sql: &'a SqlAdapter,
        context: FlowContext,
        variables: Variables,
        flow_continue_on_error: bool,
        filter_handle: LogFilterHandle,
    ) -> Self {
        Self {
            sql,
            context,
            variables,
            lastname: None,
            flow_on_error_continue: flow_continue_on_error,
            filter_handle,
        }
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn lastname(&self) -> Option<&str> {
        self.lastname.as_deref()
    }

    pub async fn run(&mut self, stages: &Stages) -> Result<()> {
        for stage in stages.steps() {
            self.run_stage(stage).await?;
        }
        Ok(())
    }

    async fn run_stage(&mut self, stage: &Stage) -> Result<()> {
        if let Some(level) = &stage.log_level {
            self.apply_log_level(level)?;
        }

        if stage.kind == StageKind::Header {
            return Ok(());
        }

        let rendered = self.render_stage(stage).await?;

        if let Some(skip_if) = &rendered.skip_if {
            if is_truthy(skip_if) {
                tracing::info!(stage = %rendered.name, "skip_if truthy, skipping stage");
                return Ok(());
            }
        }

        let result = self.dispatch(&rendered).await;

        if let Some(seconds) = rendered.throttle {
            if seconds > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
            }
        }

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let stage_continue = rendered.on_error == flowctl_core::model::OnError::Continue;
                if stage_continue && self.flow_on_error_continue {
                    tracing::warn!(stage = %rendered.name, error = %e, "stage failed, continuing (on_error=continue)");
                    Ok(())
                } else {
                    Err(e.into_flow_run(rendered.name.clone()))
                }
            }
        }
    }

    /// Reloads the global tracing filter to `level`, in effect for this
    /// stage and every stage after it until a later `log_level` overrides
    /// it again.
    fn apply_log_level(&self, level: &str) -> Result<()> {
        let parsed: LevelFilter = level
            .parse()
            .map_err(|_| FlowError::Configuration(format!("invalid log_level '{level}'")))?;
        self.filter_handle
            .reload(EnvFilter::new(parsed.to_string()))
            .map_err(|e| FlowError::Configuration(format!("failed to apply log_level '{level}': {e}")))
    }

    async fn render_stage(&mut self, stage: &Stage) -> Result<Stage> {
        let tables = self.materialize_looked_up_tables(stage).await?;
        let renderer = Renderer::new(&self.context, &self.variables).with_tables(tables);

        let mut rendered = stage.clone();
        if let Some(skip_if) = &stage.skip_if {
            rendered.skip_if = Some(renderer.render(skip_if)?);
        }
        if let Some(query) = &stage.query {
            rendered.query = Some(renderer.render(query)?);
        }
        // Connection re-validation after template substitution happens
        // implicitly: connector constructors consume the already-parsed
        // `Connection` value, so only its string leaves (locator, request
        // fields) are worth rendering here; the structural shape can't
        // change post-deserialization.
        if let Some(connection) = &mut rendered.connection {
            render_connection_locator(connection, &renderer)?;
        }

        for (key, value) in renderer.take_pending_writes() {
            self.variables.insert(key, value);
        }
        Ok(rendered)
    }

    /// Scans a stage's templated strings for `API.look("table", ...)`
    /// calls and materializes each referenced table into a row snapshot,
    /// since the renderer has no embedded SQL engine of its own to query
    /// live.
    async fn materialize_looked_up_tables(
        &self,
        stage: &Stage,
    ) -> Result<HashMap<String, Vec<HashMap<String, serde_json::Value>>>> {
        let mut sources = vec![];
        if let Some(skip_if) = &stage.skip_if {
            sources.push(skip_if.as_str());
        }
        if let Some(query) = &stage.query {
            sources.push(query.as_str());
        }

        let mut table_names = vec![];
        for source in sources {
            table_names.extend(find_looked_up_tables(source));
        }
        table_names.sort();
        table_names.dedup();

        let mut tables = HashMap::new();
        for name in table_names {
            let rel = self.sql.sql(&format!("SELECT * FROM \"{name}\"")).await?;
            let mut rows = vec![];
            for batch in rel.batches() {
                for row in 0..batch.num_rows() {
                    if let serde_json::Value::Object(map) = row_to_json(batch, row)? {
                        rows.push(map.into_iter().collect());
                    }
                }
            }
            tables.insert(name, rows);
        }
        Ok(tables)
    }

    async fn dispatch(&mut self, stage: &Stage) -> Result<()> {
        match stage.kind {
            StageKind::Header => Ok(()),
            StageKind::Source | StageKind::Tap => self.run_tap(stage).await,
            StageKind::Transform => self.run_transform(stage).await,
            StageKind::Sink => self.run_sink(stage).await,
            StageKind::Sql => self.run_sql(stage).await,
            StageKind::Internal | StageKind::SelfKind => self.run_internal(stage).await,
            StageKind::Pipeline => self.run_pipeline(stage).await,
        }
    }

    async fn run_tap(&mut self, stage: &Stage) -> Result<()> {
        let connection = stage
            .connection
            .clone()
            .ok_or_else(|| FlowError::Configuration(format!("stage '{}' requires a connection", stage.name)))?;
        let mut connector = flowctl_io::connector_for(&stage.name, connection)?;
        connector.tap(self.sql, &stage.name, stage.query.as_deref()).await?;
        self.after_materialize(stage, &stage.name).await?;
        self.lastname = Some(stage.name.clone());
        Ok(())
    }

    async fn run_transform(&mut self, stage: &Stage) -> Result<()> {
        let query = stage
            .query
            .as_deref()
            .ok_or_else(|| FlowError::Configuration(format!("transform stage '{}' requires a query", stage.name)))?;
        self.sql
            .sql(&format!("CREATE OR REPLACE VIEW \"{}\" AS {query}", stage.name))
            .await?;
        self.after_materialize(stage, &stage.name).await?;
        self.lastname = Some(stage.name.clone());
        Ok(())
    }

    async fn run_sink(&mut self, stage: &Stage) -> Result<()> {
        let connection = stage
            .connection
            .clone()
            .ok_or_else(|| FlowError::Configuration(format!("sink stage '{}' requires a connection", stage.name)))?;
        let mut connector = flowctl_io::connector_for(&stage.name, connection)?;

        let from_name = if let Some(query) = &stage.query {
            self.sql
                .sql(&format!("CREATE OR REPLACE VIEW \"{}\" AS {query}", stage.name))
                .await?;
            stage.name.clone()
        } else {
            self.lastname.clone().ok_or_else(|| {
                FlowError::UnrecoverableSink(format!(
                    "sink stage '{}' has no prior stage output to sink",
                    stage.name
                ))
            })?
        };
        connector.sink(self.sql, &from_name).await?;
        Ok(())
    }

    async fn run_sql(&mut self, stage: &Stage) -> Result<()> {
        let connection = stage
            .connection
            .clone()
            .ok_or_else(|| FlowError::Configuration(format!("sql stage '{}' requires a connection", stage.name)))?;
        let mut connector = flowctl_io::connector_for(&stage.name, connection)?;
        let query = stage
            .query
            .as_deref()
            .ok_or_else(|| FlowError::Configuration(format!("sql stage '{}' requires a query", stage.name)))?;
        connector.sql(self.sql, query).await
    }

    async fn run_internal(&mut self, stage: &Stage) -> Result<()> {
        let query = stage
            .query
            .as_deref()
            .ok_or_else(|| FlowError::Configuration(format!("internal stage '{}' requires a query", stage.name)))?;
        self.sql.sql(query).await?;
        self.after_materialize(stage, &stage.name).await.ok();
        self.lastname = Some(stage.name.clone());
        Ok(())
    }

    async fn run_pipeline(&mut self, stage: &Stage) -> Result<()> {
        let nested = stage
            .stages
            .clone()
            .ok_or_else(|| FlowError::Configuration(format!("pipeline stage '{}' has no nested stages", stage.name)))?;
        let nested = Stages::from_stages_list(nested)?;

        let Some(lastname) = self.lastname.clone() else {
            let mut child = Scheduler::new(
                self.sql,
                self.context.clone(),
                self.variables.clone(),
                self.flow_on_error_continue,
                self.filter_handle.clone(),
            );
            child.run(&nested).await?;
            self.lastname = child.lastname;
            self.variables = child.variables;
            return Ok(());
        };

        let rel = self.sql.sql(&format!("SELECT * FROM \"{lastname}\"")).await?;
        for batch in rel.batches() {
            for row in 0..batch.num_rows() {
                let row_value = row_to_json(batch, row)?;
                self.variables.set_loop_control(row_value);
                let result = async {
                    let mut child = Scheduler::new(
                        self.sql,
                        self.context.clone(),
                        self.variables.clone(),
                        self.flow_on_error_continue,
                        self.filter_handle.clone(),
                    );
                    child.run(&nested).await
                }
                .await;
                self.variables.clear_loop_control();
                result?;
            }
        }
        Ok(())
    }

    /// Optional schema print and preview sample, run after any stage that
    /// materializes a table.
    async fn after_materialize(&self, stage: &Stage, table: &str) -> Result<()> {
        if stage.show_schema.unwrap_or(false) {
            let columns = self.sql.columns(table).await?;
            tracing::info!(stage = %stage.name, schema = %columns.print(), "stage schema");
        }
        if let Some(clause) = flowctl_io::base::preview_clause(stage.show, table) {
            let rel = self.sql.sql(&clause).await?;
            tracing::info!(stage = %stage.name, rows = rel.row_count(), "stage preview");
        }
        Ok(())
    }
}

/// Extracts the table-name argument of every `API.look("table", ...)`
/// call in a template string.
fn find_looked_up_tables(template: &str) -> Vec<String> {
    let mut names = vec![];
    let mut rest = template;
    while let Some(start) = rest.find("API.look(") {
        let after = &rest[start + "API.look(".len()..];
        let trimmed = after.trim_start();
        let quote = trimmed.chars().next();
        if let Some(q @ ('"' | '\'')) = quote {
            if let Some(end) = trimmed[1..].find(q) {
                names.push(trimmed[1..1 + end].to_string());
            }
        }
        rest = after;
    }
    names
}

fn is_truthy(rendered: &str) -> bool {
    !matches!(rendered.trim(), "" | "0" | "false" | "False" | "null" | "None")
}

fn render_connection_locator(
    connection: &mut flowctl_core::model::Connection,
    renderer: &Renderer,
) -> Result<()> {
    use flowctl_core::model::Connection::*;
    let locator_slot: Option<&mut String> = match connection {
        Deltatable(c) => Some(&mut c.locator),
        Parquet(c) | Json(c) | Csv(c) | File(c) => Some(&mut c.locator),
        Clickhouse(c) => Some(&mut c.locator),
        BigQuery(c) => Some(&mut c.locator),
        Variable(c) => Some(&mut c.locator),
        Custom(c) => Some(&mut c.locator),
        Rest(_) | SqlGen(_) => None,
    };
    if let Some(slot) = locator_slot {
        *slot = renderer.render(slot)?;
    }
    Ok(())
}

fn row_to_json(batch: &datafusion::arrow::array::RecordBatch, row: usize) -> Result<serde_json::Value> {
    use datafusion::arrow::util::display::{ArrayFormatter, FormatOptions};

    let mut map = serde_json::Map::new();
    let options = FormatOptions::default();
    for (i, field) in batch.schema().fields().iter().enumerate() {
        let col = batch.column(i);
        let value = if col.is_null(row) {
            serde_json::Value::Null
        } else {
            let formatter = ArrayFormatter::try_new(col.as_ref(), &options).map_err(|e| anyhow::Error::from(e))?;
            serde_json::Value::String(formatter.value(row).to_string())
        };
        map.insert(field.name().clone(), value);
    }
    Ok(serde_json::Value::Object(map))
}
