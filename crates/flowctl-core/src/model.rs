//! The stage/connection data model: `Stage`, `Stages`, `Connection`,
//! `ConnectionConfiguration`, `FlowContext`, `Variables`, `SchemaItem`.

use std::collections::HashMap;
use std::path::Path as StdPath;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::error::{FlowError, Result};

/// Reserved Variables key the scheduler sets to the current row when
/// fanning out a sub-pipeline.
pub const LOOP_CONTROL: &str = "loop_control";

/// Immutable key -> value mapping supplied by the caller; referenced in
/// templates by dotted access.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowContext(HashMap<String, Value>);

impl FlowContext {
    pub fn insert(&mut self, key: String, value: Value) {
        self.0.insert(key, value);
    }

    pub fn as_map(&self) -> &HashMap<String, Value> {
        &self.0
    }
}

/// Mutable key -> value mapping; may receive entire stage outputs when a
/// stage sinks to the in-memory Variable connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Variables(HashMap<String, Value>);

impl Variables {
    pub fn insert(&mut self, key: String, value: Value) {
        self.0.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn as_map(&self) -> &HashMap<String, Value> {
        &self.0
    }

    /// Sets `loop_control` for the duration of a sub-pipeline fan-out
    /// iteration; cleared via [`Variables::clear_loop_control`] on every
    /// exit path, success or failure.
    pub fn set_loop_control(&mut self, row: Value) {
        self.0.insert(LOOP_CONTROL.to_string(), row);
    }

    pub fn clear_loop_control(&mut self) {
        self.0.remove(LOOP_CONTROL);
    }
}

/// A single `(name, type)` pair using the SQL dialect's type vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

/// A schema, or the "schema unavailable" error sentinel alongside an
/// empty list so discovery failure is reportable without raising.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Columns {
    pub fields: Vec<Column>,
    pub error: Option<String>,
}

impl Columns {
    pub fn new(fields: Vec<Column>) -> Self {
        Self { fields, error: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { fields: vec![], error: Some(message.into()) }
    }

    pub fn print(&self) -> String {
        if let Some(err) = &self.error {
            format!("schema unavailable: {err}")
        } else {
            self.fields
                .iter()
                .map(|f| format!("{}: {}", f.name, f.type_name))
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

/// Returned by schema discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaItem {
    pub table: String,
    pub locator: Option<String>,
    pub kind: String,
    pub fields: Columns,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct BucketConfig {
    pub bucket: Option<String>,
    pub data_prefix: Option<String>,
    pub locator_wildcard: Option<(String, String)>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct S3Config {
    #[serde(flatten)]
    pub bucket: BucketConfig,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct GsConfig {
    #[serde(flatten)]
    pub bucket: BucketConfig,
    pub hmac_key: Option<String>,
    pub hmac_secret: Option<String>,
    pub credential_file: Option<String>,
}

/// Warehouse (BigQuery-like) provider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct WarehouseConfig {
    pub project: Option<String>,
    pub dataset: Option<String>,
    pub region: Option<String>,
    pub credential_file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct DatabaseConfig {
    pub database: Option<String>,
    pub host: Option<String>,
    pub cluster: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Row-DB (Clickhouse-like) provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RowDbConfig {
    #[serde(flatten)]
    pub database: DatabaseConfig,
    #[serde(default = "default_blocksize")]
    pub blocksize: usize,
}

impl Default for RowDbConfig {
    fn default() -> Self {
        Self { database: DatabaseConfig::default(), blocksize: default_blocksize() }
    }
}

fn default_blocksize() -> usize {
    50_000
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct LlmConfig {
    pub protocol: Option<String>,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

/// Configuration bundle containing per-provider blocks, each carrying its
/// own credentials. A stage may override selected fields via a per-stage
/// `connection.config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct ConnectionConfiguration {
    #[serde(default)]
    pub local: BucketConfig,
    #[serde(default)]
    pub s3: S3Config,
    #[serde(default)]
    pub gs: GsConfig,
    #[serde(default)]
    pub warehouse: WarehouseConfig,
    #[serde(default)]
    pub rowdb: RowDbConfig,
    #[serde(default)]
    pub llm: LlmConfig,
}

impl ConnectionConfiguration {
    /// Walks the configuration blocks looking for the first one carrying a
    /// populated bucket, matching the original's `ConfigResolver`.
    pub fn resolve_bucket(&self, kind: BucketKind) -> &BucketConfig {
        match kind {
            BucketKind::Local => &self.local,
            BucketKind::S3 => &self.s3.bucket,
            BucketKind::Gs => &self.gs.bucket,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketKind {
    Local,
    S3,
    Gs,
}

/// Data mode for a table-format / warehouse sink write operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataMode {
    #[default]
    Error,
    Append,
    Overwrite,
    Merge,
}

/// Schema evolution mode for a table-format / warehouse sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaMode {
    Merge,
    Overwrite,
}

/// `version`/`key` pair shared by connections that support versioned-read
/// deduplication.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionedFields {
    pub version: Option<String>,
    pub key: Option<Vec<String>>,
}

impl VersionedFields {
    pub fn is_versioned(&self) -> bool {
        self.version.is_some() && self.key.as_ref().is_some_and(|k| !k.is_empty())
    }
}

/// Fields shared by every connection variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionCommon {
    pub config: Option<ConnectionConfiguration>,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    pub fields: Option<Columns>,
    pub create_statement: Option<String>,
    pub show_schema: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeltatableConnection {
    #[serde(flatten)]
    pub common: ConnectionCommon,
    pub locator: String,
    pub raw_dispatch: Option<bool>,
    #[serde(flatten)]
    pub versioned: VersionedFields,
    pub writer_features: Option<Vec<String>>,
    pub partition: Option<Vec<String>>,
    #[serde(default)]
    pub data_mode: DataMode,
    pub schema_mode: Option<SchemaMode>,
    #[serde(default = "default_optimize")]
    pub optimize: OptimizeSetting,
}

fn default_optimize() -> OptimizeSetting {
    OptimizeSetting::Int(1)
}

/// `optimize` accepts a string tag (`optimize`, `vacuum`, `all`) or an
/// integer day-retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptimizeSetting {
    Int(i64),
    Tag(String),
}

impl Default for OptimizeSetting {
    fn default() -> Self {
        default_optimize()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhysicalFileConnection {
    #[serde(flatten)]
    pub common: ConnectionCommon,
    pub locator: String,
    pub raw_dispatch: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RowDbConnection {
    #[serde(flatten)]
    pub common: ConnectionCommon,
    pub locator: String,
    /// Database name, required when `locator` carries no `database.table`
    /// dot and forbidden when it does (spec's locator-qualification rule).
    pub database: Option<String>,
    pub raw_dispatch: Option<bool>,
    #[serde(flatten)]
    pub versioned: VersionedFields,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarehouseConnection {
    #[serde(flatten)]
    pub common: ConnectionCommon,
    pub locator: String,
    pub raw_dispatch: Option<bool>,
    #[serde(flatten)]
    pub versioned: VersionedFields,
    pub partition: Option<Vec<String>>,
    #[serde(default)]
    pub data_mode: DataMode,
    pub schema_mode: Option<SchemaMode>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableConnection {
    #[serde(flatten)]
    pub common: ConnectionCommon,
    pub locator: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomConnection {
    #[serde(flatten)]
    pub common: ConnectionCommon,
    pub locator: String,
    pub module: String,
    pub classname: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Basic,
    Digest,
    Header,
    Oauth2,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestAuth {
    pub method: Option<AuthType>,
    #[serde(default)]
    pub values: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestClientConfig {
    pub base_url: String,
    pub transport: Option<String>,
    pub timeout: Option<f64>,
    pub auth: Option<RestAuth>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Json,
    FormUrlencoded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Json,
    Csv,
    Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterDisposition {
    Query,
    Body,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestErrorHandler {
    #[serde(default)]
    pub error_status_codes: Vec<u16>,
    pub condition: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ResponseHandler {
    Basic,
    Pagination {
        page_param: String,
        page_size: u32,
        param_locator: ParameterDisposition,
        total_records: Option<String>,
        increment: i64,
        throttle: Option<f64>,
    },
    #[serde(rename = "URLPolling")]
    UrlPolling { ready_status: Option<String> },
    #[serde(rename = "StatePolling")]
    StatePolling { ready_status: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestResponse {
    pub handler: Option<ResponseHandler>,
    pub content_type: DataType,
    pub locator: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub endpoint: String,
    pub method: RequestMethod,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub query: HashMap<String, Value>,
    pub body: Option<Value>,
    #[serde(default)]
    pub errorhandler: RestErrorHandler,
    pub response: RestResponse,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: f64,
}

fn default_initial_backoff() -> f64 {
    0.5
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestConnection {
    #[serde(flatten)]
    pub common: ConnectionCommon,
    pub locator: Option<String>,
    pub client: Option<RestClientConfig>,
    pub request: Option<Request>,
    pub show_schema: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SqlGenConnection {
    #[serde(flatten)]
    pub common: ConnectionCommon,
    pub locator: Option<String>,
    pub variables: Option<HashMap<String, Value>>,
}

/// Tagged connection variant discriminated by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Connection {
    Deltatable(DeltatableConnection),
    Parquet(PhysicalFileConnection),
    #[serde(rename = "JSON")]
    Json(PhysicalFileConnection),
    #[serde(rename = "CSV")]
    Csv(PhysicalFileConnection),
    File(PhysicalFileConnection),
    Clickhouse(RowDbConnection),
    BigQuery(WarehouseConnection),
    Variable(VariableConnection),
    #[serde(rename = "CustomConnection")]
    Custom(CustomConnection),
    Rest(RestConnection),
    #[serde(rename = "SQLGen")]
    SqlGen(SqlGenConnection),
}

impl Connection {
    pub fn kind(&self) -> &'static str {
        match self {
            Connection::Deltatable(_) => "Deltatable",
            Connection::Parquet(_) => "Parquet",
            Connection::Json(_) => "JSON",
            Connection::Csv(_) => "CSV",
            Connection::File(_) => "File",
            Connection::Clickhouse(_) => "Clickhouse",
            Connection::BigQuery(_) => "BigQuery",
            Connection::Variable(_) => "Variable",
            Connection::Custom(_) => "CustomConnection",
            Connection::Rest(_) => "Rest",
            Connection::SqlGen(_) => "SQLGen",
        }
    }

    /// The locator string if this connection carries one (every variant
    /// except Rest and SQLGen, which carry their own subtrees instead).
    pub fn locator(&self) -> Option<&str> {
        match self {
            Connection::Deltatable(c) => Some(&c.locator),
            Connection::Parquet(c) | Connection::Json(c) | Connection::Csv(c) | Connection::File(c) => {
                Some(&c.locator)
            }
            Connection::Clickhouse(c) => Some(&c.locator),
            Connection::BigQuery(c) => Some(&c.locator),
            Connection::Variable(c) => Some(&c.locator),
            Connection::Custom(c) => Some(&c.locator),
            Connection::Rest(c) => c.locator.as_deref(),
            Connection::SqlGen(c) => c.locator.as_deref(),
        }
    }

    pub fn config(&self) -> Option<&ConnectionConfiguration> {
        match self {
            Connection::Deltatable(c) => c.common.config.as_ref(),
            Connection::Parquet(c) | Connection::Json(c) | Connection::Csv(c) | Connection::File(c) => {
                c.common.config.as_ref()
            }
            Connection::Clickhouse(c) => c.common.config.as_ref(),
            Connection::BigQuery(c) => c.common.config.as_ref(),
            Connection::Variable(c) => c.common.config.as_ref(),
            Connection::Custom(c) => c.common.config.as_ref(),
            Connection::Rest(c) => c.common.config.as_ref(),
            Connection::SqlGen(c) => c.common.config.as_ref(),
        }
    }

    pub fn set_config(&mut self, config: ConnectionConfiguration) {
        let slot = match self {
            Connection::Deltatable(c) => &mut c.common.config,
            Connection::Parquet(c) | Connection::Json(c) | Connection::Csv(c) | Connection::File(c) => {
                &mut c.common.config
            }
            Connection::Clickhouse(c) => &mut c.common.config,
            Connection::BigQuery(c) => &mut c.common.config,
            Connection::Variable(c) => &mut c.common.config,
            Connection::Custom(c) => &mut c.common.config,
            Connection::Rest(c) => &mut c.common.config,
            Connection::SqlGen(c) => &mut c.common.config,
        };
        *slot = Some(config);
    }
}

/// `kind` of a stage; `on_error` policy for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Source,
    Tap,
    Transform,
    Sink,
    Sql,
    Internal,
    #[serde(rename = "self")]
    SelfKind,
    Pipeline,
    Header,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Fail,
    Continue,
}

/// One step in a pipeline. Invariant: within a [`Stages`] list, `name`
/// values are unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub kind: StageKind,
    pub name: String,
    pub connection: Option<Connection>,
    pub skip_if: Option<String>,
    pub query: Option<String>,
    pub context: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub show: f64,
    pub show_schema: Option<bool>,
    #[serde(default)]
    pub explain: bool,
    pub stages: Option<Vec<Stage>>,
    #[serde(default)]
    pub on_error: OnError,
    pub throttle: Option<f64>,
    pub log_level: Option<String>,
    pub fields: Option<Columns>,
}

/// Ordered sequence of [`Stage`]. Created from an external loader,
/// immutable through a single run, iterated once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stages(pub Vec<Stage>);

impl Stages {
    /// Returns the non-header stages in document order.
    pub fn steps(&self) -> impl Iterator<Item = &Stage> {
        self.0.iter().filter(|s| s.kind != StageKind::Header)
    }

    pub fn from_stages_list(stages: Vec<Stage>) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for s in &stages {
            if !seen.insert(&s.name) {
                return Err(FlowError::Configuration(format!(
                    "duplicate stage name '{}' in stage list",
                    s.name
                )));
            }
        }
        Ok(Stages(stages))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(text)
            .map_err(|e| FlowError::Configuration(format!("invalid stage YAML: {e}")))?;
        Self::from_value(value)
    }

    /// Loads a stage document from a path, raw YAML text, or — matching
    /// the original's `Stages.load` — a value that, once parsed, is
    /// itself a bare string naming a path to re-load.
    pub fn load(source: &str) -> Result<Self> {
        let path = StdPath::new(source);
        if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| FlowError::Configuration(format!("cannot read '{source}': {e}")))?;
            return Self::from_yaml(&text);
        }
        Self::from_yaml(source)
    }

    fn from_value(value: serde_yaml::Value) -> Result<Self> {
        match value {
            serde_yaml::Value::String(inner) => Self::load(&inner),
            serde_yaml::Value::Sequence(_) => {
                let stages: Vec<Stage> = serde_yaml::from_value(value)
                    .map_err(|e| FlowError::Configuration(format!("invalid stage list: {e}")))?;
                Self::from_stages_list(stages)
            }
            other => Err(FlowError::Configuration(format!(
                "stage document must be a list, got: {other:?}"
            ))),
        }
    }
}
