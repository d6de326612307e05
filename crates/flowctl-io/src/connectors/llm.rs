//! LLM SQL Generator connector: renders a prompt from the stage's
//! `SqlGen` connection, dispatches it to an `LlmClient`, executes the
//! returned SQL, and replays the prompt with the engine's error appended
//! when that error is classified as replayable (spec.md §4.K).

use async_trait::async_trait;
use serde_json::Value;

use flowctl_core::model::SqlGenConnection;
use flowctl_core::{Columns, FlowError, Result};
use flowctl_sql::SqlAdapter;

use crate::base::Connector;

const MAX_REPLAYS: u32 = 3;

/// Abstracts the chat-completion backend so the connector doesn't couple
/// to one vendor's SDK; `protocol` in `llm` config selects the
/// implementation at construction time.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Talks to any OpenAI-compatible chat-completions endpoint over plain
/// REST (the dominant self-hosted and proxy deployment shape).
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiCompatibleClient {
    pub fn new(endpoint: String, api_key: Option<String>, model: String) -> Self {
        Self { client: reqwest::Client::new(), endpoint, api_key, model }
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatibleClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let mut req = self.client.post(&self.endpoint).json(&serde_json::json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.0,
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let response = req.send().await.map_err(|e| FlowError::Fetch(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(FlowError::RestRequest { status, message: text });
        }
        let body: Value = response.json().await.map_err(|e| FlowError::Fetch(e.to_string()))?;
        body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| FlowError::Fetch("LLM response missing choices[0].message.content".into()))
    }
}

/// An internal HTTP gateway reached via the same REST primitives but
/// with a response-shape that returns the generated SQL under `sql`
/// directly, as an internal proxy typically would.
pub struct ProxyClient {
    client: reqwest::Client,
    endpoint: String,
}

impl ProxyClient {
    pub fn new(endpoint: String) -> Self {
        Self { client: reqwest::Client::new(), endpoint }
    }
}

#[async_trait]
impl LlmClient for ProxyClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await
            .map_err(|e| FlowError::Fetch(e.to_string()))?;
        let body: Value = response.json().await.map_err(|e| FlowError::Fetch(e.to_string()))?;
        body["sql"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| FlowError::Fetch("proxy response missing 'sql' field".into()))
    }
}

/// Deterministic test double returning a fixed SQL string regardless of
/// prompt content.
pub struct MockClient {
    pub fixed_sql: String,
}

#[async_trait]
impl LlmClient for MockClient {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Ok(self.fixed_sql.clone())
    }
}

pub fn client_from_config(conn: &SqlGenConnection) -> Result<Box<dyn LlmClient>> {
    let config = conn
        .common
        .config
        .as_ref()
        .ok_or_else(|| FlowError::Configuration("SQLGen connection requires a config.llm block".into()))?;
    let llm = &config.llm;
    match llm.protocol.as_deref() {
        Some("proxy") => {
            let endpoint = llm
                .endpoint
                .clone()
                .ok_or_else(|| FlowError::Configuration("llm.endpoint is required for protocol=proxy".into()))?;
            Ok(Box::new(ProxyClient::new(endpoint)))
        }
        Some("mock") => Ok(Box::new(MockClient { fixed_sql: "SELECT 1".into() })),
        _ => {
            let endpoint = llm.endpoint.clone().ok_or_else(|| {
                FlowError::Configuration("llm.endpoint is required for an OpenAI-compatible protocol".into())
            })?;
            let model = llm.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            Ok(Box::new(OpenAiCompatibleClient::new(endpoint, llm.api_key.clone(), model)))
        }
    }
}

fn render_prompt(conn: &SqlGenConnection, error_context: Option<&str>) -> String {
    let base = conn.locator.clone().unwrap_or_default();
    match error_context {
        Some(err) => format!(
            "{base}\n\nThe previous SQL failed to execute with this error, fix it and return \
             only corrected SQL:\n{err}"
        ),
        None => base,
    }
}

fn strip_code_fence(sql: &str) -> String {
    let trimmed = sql.trim();
    if let Some(rest) = trimmed.strip_prefix("```sql") {
        rest.trim_end_matches("```").trim().to_string()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.trim_end_matches("```").trim().to_string()
    } else {
        trimmed.to_string()
    }
}

pub struct LlmSqlGeneratorConnector {
    conn: SqlGenConnection,
    client: Box<dyn LlmClient>,
}

impl LlmSqlGeneratorConnector {
    pub fn new(conn: SqlGenConnection) -> Result<Self> {
        let client = client_from_config(&conn)?;
        Ok(Self { conn, client })
    }
}

#[async_trait]
impl Connector for LlmSqlGeneratorConnector {
    async fn tap(&mut self, sql: &SqlAdapter, stage_name: &str, _query: Option<&str>) -> Result<()> {
        let mut error_context: Option<String> = None;

        for attempt in 0..=MAX_REPLAYS {
            let prompt = render_prompt(&self.conn, error_context.as_deref());
            let raw = self.client.complete(&prompt).await?;
            let generated = strip_code_fence(&raw);

            match sql.sql(&generated).await {
                Ok(rel) => {
                    let schema = rel
                        .fetch_one()
                        .map(|b| b.schema())
                        .ok_or_else(|| FlowError::TapSourceMissing(stage_name.to_string()))?;
                    sql.unregister(stage_name).ok();
                    sql.register(stage_name, rel.batches().to_vec(), schema)?;
                    return Ok(());
                }
                Err(e) if e.is_replayable() && attempt < MAX_REPLAYS => {
                    tracing::warn!(attempt, error = %e, "generated SQL failed, replaying prompt with error context");
                    error_context = Some(e.to_string());
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("loop always returns or propagates before exhausting MAX_REPLAYS + 1 iterations")
    }

    async fn sink(&mut self, _sql: &SqlAdapter, _from_name: &str) -> Result<()> {
        Err(FlowError::Configuration("SQLGen connections are tap-only".into()))
    }

    async fn sql(&mut self, sql: &SqlAdapter, statement: &str) -> Result<()> {
        sql.sql(statement).await?;
        Ok(())
    }

    async fn show_schema(&mut self, sql: &SqlAdapter, stage_name: &str) -> Result<Columns> {
        sql.columns(stage_name).await
    }
}
