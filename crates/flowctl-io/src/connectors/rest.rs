//! REST connector: request builder, the four auth schemes, retry/backoff,
//! the four response handlers (Basic/Pagination/URLPolling/StatePolling)
//! and JMESPath-driven locator/condition/message extraction.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde_json::Value;

use flowctl_core::model::{
    AuthType, ContentType, DataType as RestDataType, ParameterDisposition, RequestMethod, ResponseHandler,
    RestConnection,
};
use flowctl_core::{Columns, FlowError, Result};
use flowctl_sql::SqlAdapter;

use crate::base::Connector;

pub struct RestConnector {
    conn: RestConnection,
    client: reqwest::Client,
}

impl RestConnector {
    pub fn new(conn: RestConnection) -> Result<Self> {
        let timeout = conn
            .client
            .as_ref()
            .and_then(|c| c.timeout)
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::from_secs(30));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::Error::from(e))?;
        Ok(Self { conn, client })
    }

    fn base_url(&self) -> Result<&str> {
        self.conn
            .client
            .as_ref()
            .map(|c| c.base_url.as_str())
            .ok_or_else(|| FlowError::Configuration("REST connection requires a client.base_url".into()))
    }

    fn request_spec(&self) -> Result<&flowctl_core::model::Request> {
        self.conn
            .request
            .as_ref()
            .ok_or_else(|| FlowError::Configuration("REST connection requires a request block".into()))
    }

    fn build_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let Some(auth) = self.conn.client.as_ref().and_then(|c| c.auth.as_ref()) else {
            return Ok(headers);
        };
        match auth.method {
            Some(AuthType::Basic) => {
                let user = auth.values.get("username").cloned().unwrap_or_default();
                let pass = auth.values.get("password").cloned().unwrap_or_default();
                let encoded = base64_encode(&format!("{user}:{pass}"));
                headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Basic {encoded}")).unwrap());
            }
            Some(AuthType::Header) => {
                for (k, v) in &auth.values {
                    if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(k.as_bytes()), HeaderValue::from_str(v)) {
                        headers.insert(name, value);
                    }
                }
            }
            Some(AuthType::Oauth2) => {
                if let Some(token) = auth.values.get("access_token") {
                    headers.insert(
                        AUTHORIZATION,
                        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
                    );
                }
            }
            Some(AuthType::Digest) => {
                // Digest auth requires a challenge round trip the plain
                // HTTP client here doesn't negotiate; callers needing it
                // fall back to a `header` auth block with a precomputed
                // digest value.
            }
            None => {}
        }
        Ok(headers)
    }

    async fn send_once(&self, url: &str, body: Option<&Value>) -> Result<reqwest::Response> {
        let req = self.request_spec()?;
        let headers = self.build_headers()?;
        let mut builder = match req.method {
            RequestMethod::Get => self.client.get(url),
            RequestMethod::Post => self.client.post(url),
            RequestMethod::Put => self.client.put(url),
            RequestMethod::Patch => self.client.patch(url),
            RequestMethod::Delete => self.client.delete(url),
        };
        builder = builder.headers(headers);
        if let Some(body) = body.or(req.body.as_ref()) {
            builder = match req.content_type {
                ContentType::Json => builder.json(body),
                ContentType::FormUrlencoded => {
                    let pairs: Vec<(String, String)> = body
                        .as_object()
                        .map(|m| m.iter().map(|(k, v)| (k.clone(), value_to_string(v))).collect())
                        .unwrap_or_default();
                    builder.form(&pairs)
                }
            };
        }
        builder.send().await.map_err(|e| FlowError::Fetch(e.to_string()))
    }

    /// Sends the request with exponential backoff retry, classifying the
    /// response status against `errorhandler.error_status_codes` and a
    /// 429/5xx default retryable set.
    async fn send_with_retry(&self, url: &str, body: Option<&Value>) -> Result<Value> {
        let req = self.request_spec()?;
        let mut backoff = req.initial_backoff;
        let mut attempt = 0u32;

        loop {
            let response = self.send_once(url, body).await?;
            let status = response.status().as_u16();

            if req.errorhandler.error_status_codes.contains(&status) {
                let text = response.text().await.unwrap_or_default();
                let message = req.errorhandler.message.clone().unwrap_or(text);
                return Err(FlowError::RestRequest { status, message });
            }

            if status == 429 || (500..600).contains(&status) {
                if attempt >= req.max_retries {
                    return Err(FlowError::RestRateLimit { status });
                }
                tracing::warn!(status, attempt, "REST request retryable failure, backing off");
                tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                backoff *= 2.0;
                attempt += 1;
                continue;
            }

            if !(200..300).contains(&status) {
                let text = response.text().await.unwrap_or_default();
                return Err(FlowError::RestRetryable { status, message: text });
            }

            return match req.response.content_type {
                RestDataType::Json => response.json::<Value>().await.map_err(|e| FlowError::Fetch(e.to_string())),
                RestDataType::Csv | RestDataType::Bytes => {
                    let text = response.text().await.map_err(|e| FlowError::Fetch(e.to_string()))?;
                    Ok(Value::String(text))
                }
            };
        }
    }

    fn jmespath_extract<'a>(&self, payload: &'a Value, expr: &str) -> Result<Value> {
        let compiled = jmespath::compile(expr)
            .map_err(|e| FlowError::Configuration(format!("invalid JMESPath expression '{expr}': {e}")))?;
        let value = serde_json::to_value(payload).map_err(|e| anyhow::Error::from(e))?;
        let data = jmespath::Variable::try_from(value).map_err(|e| {
            FlowError::Configuration(format!("failed to convert JSON to JMESPath variable: {e}"))
        })?;
        let result = compiled
            .search(data)
            .map_err(|e| FlowError::Configuration(format!("JMESPath evaluation failed: {e}")))?;
        serde_json::to_value(&*result).map_err(|e| FlowError::Other(e.into()))
    }

    fn records_from_response(&self, payload: &Value) -> Result<Vec<Value>> {
        let req = self.request_spec()?;
        let located = match &req.response.locator {
            Some(expr) => self.jmespath_extract(payload, expr)?,
            None => payload.clone(),
        };
        match located {
            Value::Array(items) => Ok(items),
            other => Ok(vec![other]),
        }
    }

    async fn fetch_basic(&self, url: &str) -> Result<Vec<Value>> {
        let payload = self.send_with_retry(url, None).await?;
        self.records_from_response(&payload)
    }

    async fn fetch_paginated(
        &self,
        base_url: &str,
        page_param: &str,
        page_size: u32,
        disposition: ParameterDisposition,
        total_records_expr: Option<&str>,
        increment: i64,
    ) -> Result<Vec<Value>> {
        let mut out = vec![];
        let mut page: i64 = 0;
        loop {
            let url = match disposition {
                ParameterDisposition::Query => {
                    let sep = if base_url.contains('?') { '&' } else { '?' };
                    format!("{base_url}{sep}{page_param}={page}&page_size={page_size}")
                }
                ParameterDisposition::Body => base_url.to_string(),
            };
            let payload = self.send_with_retry(&url, None).await?;
            let records = self.records_from_response(&payload)?;
            let got = records.len();
            out.extend(records);

            if got == 0 {
                break;
            }
            if let Some(expr) = total_records_expr {
                let total = self.jmespath_extract(&payload, expr)?;
                if let Some(total) = total.as_i64() {
                    if out.len() as i64 >= total {
                        break;
                    }
                }
            } else if (got as u32) < page_size {
                break;
            }
            page += increment;
        }
        Ok(out)
    }

    async fn poll_until_ready(&self, url: &str, ready_status_expr: Option<&str>) -> Result<Value> {
        let max_polls = 30;
        for _ in 0..max_polls {
            let payload = self.send_with_retry(url, None).await?;
            let ready = match ready_status_expr {
                Some(expr) => {
                    let status = self.jmespath_extract(&payload, expr)?;
                    matches!(status, Value::Bool(true)) || status.as_str() == Some("ready")
                }
                None => true,
            };
            if ready {
                return Ok(payload);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(FlowError::RestRetryable { status: 0, message: "polling timed out".into() })
    }
}

#[async_trait]
impl Connector for RestConnector {
    async fn tap(&mut self, sql: &SqlAdapter, stage_name: &str, _query: Option<&str>) -> Result<()> {
        let req = self.request_spec()?.clone();
        let base_url = self.base_url()?;
        let url = format!("{}{}", base_url.trim_end_matches('/'), req.endpoint);

        let records = match req.response.handler.clone() {
            None | Some(ResponseHandler::Basic) => self.fetch_basic(&url).await?,
            Some(ResponseHandler::Pagination {
                page_param,
                page_size,
                param_locator,
                total_records,
                increment,
                throttle,
            }) => {
                if let Some(seconds) = throttle {
                    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                }
                self.fetch_paginated(
                    &url,
                    &page_param,
                    page_size,
                    param_locator,
                    total_records.as_deref(),
                    increment,
                )
                .await?
            }
            Some(ResponseHandler::UrlPolling { ready_status }) => {
                let payload = self.poll_until_ready(&url, ready_status.as_deref()).await?;
                self.records_from_response(&payload)?
            }
            Some(ResponseHandler::StatePolling { ready_status }) => {
                let payload = self.poll_until_ready(&url, Some(&ready_status)).await?;
                self.records_from_response(&payload)?
            }
        };

        if records.is_empty() {
            return Err(FlowError::TapSourceMissing(url));
        }

        let ndjson: String = records
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        let tmp_table = format!("__rest_raw_{stage_name}");
        let batches = flowctl_sql_json_records_to_batches(&ndjson)?;
        let schema = batches
            .first()
            .map(|b| b.schema())
            .ok_or_else(|| FlowError::TapSourceMissing(url.clone()))?;
        sql.unregister(&tmp_table).ok();
        sql.register(&tmp_table, batches, schema)?;
        sql.unregister(stage_name).ok();
        let rel = sql.sql(&format!("SELECT * FROM \"{tmp_table}\"")).await?;
        let out_schema = rel.fetch_one().map(|b| b.schema()).unwrap();
        sql.register(stage_name, rel.batches().to_vec(), out_schema)?;
        sql.unregister(&tmp_table).ok();
        Ok(())
    }

    async fn sink(&mut self, sql: &SqlAdapter, from_name: &str) -> Result<()> {
        let req = self.request_spec()?.clone();
        let base_url = self.base_url()?;
        let url = format!("{}{}", base_url.trim_end_matches('/'), req.endpoint);

        let rel = sql.sql(&format!("SELECT * FROM \"{from_name}\"")).await?;
        for batch in rel.batches() {
            for row in 0..batch.num_rows() {
                let value = record_batch_row_to_json(batch, row)?;
                self.send_with_retry(&url, Some(&value)).await?;
            }
        }
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

fn base64_encode(s: &str) -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let bytes = s.as_bytes();
    let mut out = String::new();
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = *chunk.get(1).unwrap_or(&0);
        let b2 = *chunk.get(2).unwrap_or(&0);
        out.push(CHARS[(b0 >> 2) as usize] as char);
        out.push(CHARS[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize] as char);
        out.push(if chunk.len() > 1 { CHARS[(((b1 & 0x0f) << 2) | (b2 >> 6)) as usize] as char } else { '=' });
        out.push(if chunk.len() > 2 { CHARS[(b2 & 0x3f) as usize] as char } else { '=' });
    }
    out
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn flowctl_sql_json_records_to_batches(ndjson: &str) -> Result<Vec<datafusion::arrow::array::RecordBatch>> {
    use datafusion::arrow::json::ReaderBuilder;
    use std::io::Cursor;

    let cursor = Cursor::new(ndjson.as_bytes());
    let (schema, _) = datafusion::arrow::json::reader::infer_json_schema(Cursor::new(ndjson.as_bytes()), None)
        .map_err(|e| anyhow::Error::from(e))?;
    let mut reader = ReaderBuilder::new(std::sync::Arc::new(schema))
        .build(cursor)
        .map_err(|e| anyhow::Error::from(e))?;
    let mut batches = vec![];
    while let Some(batch) = reader.next() {
        batches.push(batch.map_err(|e| anyhow::Error::from(e))?);
    }
    Ok(batches)
}

fn record_batch_row_to_json(batch: &datafusion::arrow::array::RecordBatch, row: usize) -> Result<Value> {
    use datafusion::arrow::util::display::{ArrayFormatter, FormatOptions};

    let mut map = serde_json::Map::new();
    let options = FormatOptions::default();
    for (i, field) in batch.schema().fields().iter().enumerate() {
        let col = batch.column(i);
        let value = if col.is_null(row) {
            Value::Null
        } else {
            let formatter =
                ArrayFormatter::try_new(col.as_ref(), &options).map_err(|e| anyhow::Error::from(e))?;
            Value::String(formatter.value(row).to_string())
        };
        map.insert(field.name().clone(), value);
    }
    Ok(Value::Object(map))
}
