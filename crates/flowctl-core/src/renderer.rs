//! Template rendering with non-default delimiters (`<< >>`, `<% %>`,
//! `<# #>`) so templates don't collide with SQL's own braces, plus the
//! `@json` / deprecated `JSON>` prefix form and the `API.*` callable
//! namespace (`dt`, `look`, `sqltuple`, `setvariable`, `error`, `peek`,
//! `int`).

use std::cell::RefCell;
use std::collections::HashMap;

use serde_json::Value;

use crate::error::{FlowError, Result};
use crate::model::{FlowContext, Variables};

const JSON_MARKER: &str = "@json";
const JSON_MARKER_DEPRECATED: &str = "JSON>";

/// Renders template strings against a context and a variables map, and
/// evaluates `API.*` calls against pre-materialized tables. Flowctl-core
/// has no embedded SQL engine dependency, so `API.look(table, ...)`
/// resolves against a plain row snapshot the caller supplies up front via
/// [`Renderer::with_tables`] rather than querying a live engine here.
pub struct Renderer<'a> {
    pub context: &'a FlowContext,
    pub variables: &'a Variables,
    tables: HashMap<String, Vec<HashMap<String, Value>>>,
    pending_writes: RefCell<Vec<(String, Value)>>,
}

impl<'a> Renderer<'a> {
    pub fn new(context: &'a FlowContext, variables: &'a Variables) -> Self {
        Self { context, variables, tables: HashMap::new(), pending_writes: RefCell::new(Vec::new()) }
    }

    /// Supplies the row snapshots `API.look(table, ...)` calls resolve
    /// against. The caller materializes these from the SQL runtime before
    /// constructing the renderer.
    pub fn with_tables(mut self, tables: HashMap<String, Vec<HashMap<String, Value>>>) -> Self {
        self.tables = tables;
        self
    }

    /// Drains the `(key, value)` pairs recorded by `API.setvariable(...)`
    /// calls made during the renders performed so far. The caller applies
    /// these to its own `Variables` map; the renderer itself never
    /// mutates `variables` directly, keeping the side effect explicit.
    pub fn take_pending_writes(&self) -> Vec<(String, Value)> {
        self.pending_writes.borrow_mut().drain(..).collect()
    }

    /// Recursively renders strings in any JSON-shaped value; non-string
    /// leaves pass through unchanged.
    pub fn render_value(&self, value: &Value, infer_type: bool) -> Result<Value> {
        match value {
            Value::String(s) => self.render_string(s, infer_type),
            Value::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|v| self.render_value(v, infer_type))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.render_value(v, infer_type)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Renders a bare string, handling the `@json` / deprecated `JSON>`
    /// prefix forms before falling through to plain substitution.
    pub fn render(&self, template: &str) -> Result<String> {
        if let Value::String(s) = self.render_string(template, false)? {
            Ok(s)
        } else {
            unreachable!("render_string on a string input always returns a string")
        }
    }

    fn render_string(&self, s: &str, infer_type: bool) -> Result<Value> {
        if let Some(body) = s.strip_prefix(JSON_MARKER) {
            return self.render_json_block(body, s);
        }
        if let Some(body) = s.strip_prefix(JSON_MARKER_DEPRECATED) {
            tracing::warn!("`JSON>` prefix is deprecated, use `@json` instead");
            return self.render_json_block(body, s);
        }

        let rendered = self.substitute(s)?;
        if infer_type {
            Ok(infer(&rendered))
        } else {
            Ok(Value::String(rendered))
        }
    }

    fn render_json_block(&self, body: &str, original: &str) -> Result<Value> {
        if body.contains(JSON_MARKER) || body.contains(JSON_MARKER_DEPRECATED) {
            return Err(FlowError::Configuration(format!(
                "nested JSON markers are not allowed in template: {original}"
            )));
        }
        let collapsed: String = body.split_whitespace().collect::<Vec<_>>().join(" ");
        let rendered = self.substitute(&collapsed)?;
        serde_json::from_str(&rendered).map_err(|e| {
            FlowError::Configuration(format!("failed to parse @json template: {e}: {original}"))
        })
    }

    /// Substitutes `<< expr >>` expressions. Expressions are either a
    /// dotted-path lookup against `context`/`variables`, e.g.
    /// `<< context.env >>`, or a call into the `API` namespace, e.g.
    /// `<< API.dt(variables.ts, "%Y-%m-%d") >>`. `<# #>` comments are
    /// stripped before substitution.
    fn substitute(&self, s: &str) -> Result<String> {
        let without_comments = strip_comments(s);
        let mut out = String::new();
        let mut rest = without_comments.as_str();
        while let Some(start) = rest.find("<<") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find(">>").ok_or_else(|| {
                FlowError::Configuration(format!("unterminated '<<' in template: {s}"))
            })?;
            let expr = after[..end].trim();
            out.push_str(&value_to_string(&self.eval_expr_value(expr)?));
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }

    /// Evaluates a single `<< ... >>` expression to its value: an `API.*`
    /// call, or a dotted-path lookup against `context`/`variables`.
    fn eval_expr_value(&self, expr: &str) -> Result<Value> {
        let expr = expr.trim();
        if let Some(call) = expr.strip_prefix("API.") {
            return self.eval_api_call(call);
        }
        let mut parts = expr.splitn(2, '.');
        let root = parts.next().unwrap_or_default();
        let path = parts.next().unwrap_or_default();
        let value = match root {
            "context" => lookup_dotted(self.context.as_map(), path),
            "variables" => lookup_dotted(self.variables.as_map(), path),
            _ => None,
        };
        value.ok_or_else(|| FlowError::Configuration(format!("template references unknown variable: {expr}")))
    }

    fn eval_api_call(&self, call: &str) -> Result<Value> {
        let call = call.trim();
        let (name, args_str) = call
            .split_once('(')
            .ok_or_else(|| FlowError::Configuration(format!("malformed API call: API.{call}")))?;
        let args_str = args_str
            .strip_suffix(')')
            .ok_or_else(|| FlowError::Configuration(format!("malformed API call: API.{call}")))?;
        let args = split_args(args_str)
            .into_iter()
            .map(|raw| self.eval_arg(&raw))
            .collect::<Result<Vec<_>>>()?;

        match name.trim() {
            "dt" => api_dt(&args),
            "int" => api_int(&args),
            "sqltuple" => api_sqltuple(&args),
            "peek" => self.api_peek(&args),
            "look" => self.api_look(&args),
            "setvariable" => self.api_setvariable(&args),
            "error" => api_error(&args),
            other => Err(FlowError::Configuration(format!("unknown API call: API.{other}(...)"))),
        }
    }

    /// Evaluates one call argument: a quoted string literal, a bracketed
    /// list literal, a numeric/boolean literal, or a recursive
    /// `context.*`/`variables.*`/`API.*` expression.
    fn eval_arg(&self, raw: &str) -> Result<Value> {
        let raw = raw.trim();
        if raw.len() >= 2
            && ((raw.starts_with('"') && raw.ends_with('"')) || (raw.starts_with('\'') && raw.ends_with('\'')))
        {
            return Ok(Value::String(raw[1..raw.len() - 1].to_string()));
        }
        if raw.starts_with('[') && raw.ends_with(']') {
            return serde_json::from_str(raw)
                .map_err(|e| FlowError::Configuration(format!("invalid list literal '{raw}': {e}")));
        }
        if raw == "true" || raw == "false" {
            return Ok(Value::Bool(raw == "true"));
        }
        if raw == "null" || raw == "none" {
            return Ok(Value::Null);
        }
        if let Ok(n) = raw.parse::<i64>() {
            return Ok(Value::from(n));
        }
        if let Ok(f) = raw.parse::<f64>() {
            return Ok(Value::from(f));
        }
        self.eval_expr_value(raw)
    }

    /// `API.peek(key, default?)`: reads a dotted `"context.foo"` /
    /// `"variables.foo"` path without raising when the path is absent.
    fn api_peek(&self, args: &[Value]) -> Result<Value> {
        let key = args
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| FlowError::Configuration("API.peek() requires a string key".into()))?;
        let default = args.get(1).cloned().unwrap_or(Value::Null);
        let mut parts = key.splitn(2, '.');
        let root = parts.next().unwrap_or_default();
        let path = parts.next().unwrap_or_default();
        let found = match root {
            "context" => lookup_dotted(self.context.as_map(), path),
            "variables" => lookup_dotted(self.variables.as_map(), path),
            _ => None,
        };
        Ok(found.unwrap_or(default))
    }

    /// `API.look(table, filter?)`: row lookup against a pre-materialized
    /// table, returning a list of objects a `<% for %>` loop can iterate.
    fn api_look(&self, args: &[Value]) -> Result<Value> {
        let table = args
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| FlowError::Configuration("API.look() requires a table name".into()))?;
        let filter = args.get(1).cloned().unwrap_or(Value::Null);
        let rows = self.tables.get(table).ok_or_else(|| {
            FlowError::Configuration(format!(
                "API.look(): table '{table}' was not pre-materialized for this render"
            ))
        })?;
        let matched = rows
            .iter()
            .filter(|row| row_matches(row, &filter))
            .map(|row| Value::Object(row.iter().map(|(k, v)| (k.clone(), v.clone())).collect()))
            .collect();
        Ok(Value::Array(matched))
    }

    /// `API.setvariable(key, value)`: records a Variables write, applied
    /// by the caller via [`Renderer::take_pending_writes`].
    fn api_setvariable(&self, args: &[Value]) -> Result<Value> {
        let key = args
            .first()
            .and_then(|v| v.as_str())
            .ok_or_else(|| FlowError::Configuration("API.setvariable() requires a string key".into()))?;
        let value = args.get(1).cloned().unwrap_or(Value::Null);
        self.pending_writes.borrow_mut().push((key.to_string(), value.clone()));
        Ok(value)
    }
}

/// `API.dt(value, fmt?)`: formats an epoch-seconds number or a parseable
/// datetime string with a `chrono` format string (default `%Y-%m-%d`).
fn api_dt(args: &[Value]) -> Result<Value> {
    let value = args
        .first()
        .ok_or_else(|| FlowError::Configuration("API.dt() requires a value argument".into()))?;
    let fmt = args.get(1).and_then(|v| v.as_str()).unwrap_or("%Y-%m-%d");
    let epoch = match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| FlowError::Configuration("API.dt(): numeric value out of range".into()))?,
        Value::String(s) => parse_epoch(s)?,
        other => return Err(FlowError::Configuration(format!("API.dt(): unsupported value {other}"))),
    };
    let datetime = chrono::DateTime::from_timestamp(epoch, 0)
        .ok_or_else(|| FlowError::Configuration(format!("API.dt(): epoch {epoch} out of range")))?;
    Ok(Value::String(datetime.format(fmt).to_string()))
}

fn parse_epoch(s: &str) -> Result<i64> {
    if let Ok(n) = s.parse::<i64>() {
        return Ok(n);
    }
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp())
        .map_err(|e| FlowError::Configuration(format!("API.dt(): cannot parse '{s}' as a datetime: {e}")))
}

/// `API.int(value)`: coerces a number, numeric string, or bool to an int.
fn api_int(args: &[Value]) -> Result<Value> {
    let value = args
        .first()
        .ok_or_else(|| FlowError::Configuration("API.int() requires a value argument".into()))?;
    let n = match value {
        Value::Number(n) => {
            n.as_i64().ok_or_else(|| FlowError::Configuration("API.int(): value out of range".into()))?
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| FlowError::Configuration(format!("API.int(): cannot parse '{s}' as an integer")))?,
        Value::Bool(b) => *b as i64,
        other => return Err(FlowError::Configuration(format!("API.int(): unsupported value {other}"))),
    };
    Ok(Value::from(n))
}

/// `API.sqltuple(list)`: renders a SQL-safe `(a, b, c)` tuple literal.
fn api_sqltuple(args: &[Value]) -> Result<Value> {
    let list = match args.first() {
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
        None => vec![],
    };
    let rendered: Vec<String> = list.iter().map(sql_literal).collect();
    Ok(Value::String(format!("({})", rendered.join(", "))))
}

fn sql_literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

/// `API.error(msg)`: raises [`FlowError::UserGenerated`], terminating the
/// stage the way an uncaught exception would in the original runtime.
fn api_error(args: &[Value]) -> Result<Value> {
    let msg = args.first().map(value_to_string).unwrap_or_default();
    Err(FlowError::UserGenerated(msg))
}

fn row_matches(row: &HashMap<String, Value>, filter: &Value) -> bool {
    match filter {
        Value::Object(conditions) => conditions.iter().all(|(k, v)| row.get(k) == Some(v)),
        _ => true,
    }
}

/// Splits a call's argument text on top-level commas, leaving commas
/// inside quoted strings and bracketed lists untouched.
fn split_args(s: &str) -> Vec<String> {
    let mut out = vec![];
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut depth = 0i32;
    for c in s.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if c == q {
                    quote = None;
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    current.push(c);
                }
                '[' => {
                    depth += 1;
                    current.push(c);
                }
                ']' => {
                    depth -= 1;
                    current.push(c);
                }
                ',' if depth == 0 => {
                    out.push(current.trim().to_string());
                    current = String::new();
                }
                _ => current.push(c),
            },
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn strip_comments(s: &str) -> String {
    let mut out = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("<#") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("#>") {
            Some(end) => rest = &after[end + 2..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

fn lookup_dotted(map: &HashMap<String, Value>, path: &str) -> Option<Value> {
    if path.is_empty() {
        return None;
    }
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = map.get(first)?.clone();
    for seg in segments {
        current = current.get(seg)?.clone();
    }
    Some(current)
}

/// Coerces `true|false`, `null|none`, and numeric literals; everything
/// else stays a string.
fn infer(s: &str) -> Value {
    match s {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" | "none" => Value::Null,
        _ => {
            if let Ok(i) = s.parse::<i64>() {
                Value::from(i)
            } else if let Ok(f) = s.parse::<f64>() {
                Value::from(f)
            } else {
                Value::String(s.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixtures() -> (FlowContext, Variables) {
        let mut ctx = FlowContext::default();
        ctx.insert("env".into(), json!("prod"));
        let mut vars = Variables::default();
        vars.insert("count".into(), json!(3));
        (ctx, vars)
    }

    #[test]
    fn identity_on_non_string() {
        let (ctx, vars) = fixtures();
        let r = Renderer::new(&ctx, &vars);
        let v = json!(42);
        assert_eq!(r.render_value(&v, false).unwrap(), v);
    }

    #[test]
    fn substitutes_context_and_variables() {
        let (ctx, vars) = fixtures();
        let r = Renderer::new(&ctx, &vars);
        assert_eq!(r.render("env=<< context.env >>").unwrap(), "env=prod");
        assert_eq!(r.render("n=<< variables.count >>").unwrap(), "n=3");
    }

    #[test]
    fn json_prefix_parses_to_object() {
        let (ctx, vars) = fixtures();
        let r = Renderer::new(&ctx, &vars);
        let out = r.render_json_block(r#"{"env": "<< context.env >>"}"#, "").unwrap();
        assert_eq!(out, json!({"env": "prod"}));
    }

    #[test]
    fn deprecated_json_marker_still_works() {
        let (ctx, vars) = fixtures();
        let r = Renderer::new(&ctx, &vars);
        let out = r.render_string(r#"JSON>{"env": "<< context.env >>"}"#, false).unwrap();
        assert_eq!(out, json!({"env": "prod"}));
    }

    #[test]
    fn infer_type_coerces_literals() {
        let (ctx, vars) = fixtures();
        let r = Renderer::new(&ctx, &vars);
        assert_eq!(r.render_value(&json!("true"), true).unwrap(), json!(true));
        assert_eq!(r.render_value(&json!("null"), true).unwrap(), json!(null));
        assert_eq!(r.render_value(&json!("42"), true).unwrap(), json!(42));
    }

    #[test]
    fn api_dt_formats_epoch() {
        let (ctx, vars) = fixtures();
        let r = Renderer::new(&ctx, &vars);
        assert_eq!(r.render("<< API.dt(0, \"%Y-%m-%d\") >>").unwrap(), "1970-01-01");
    }

    #[test]
    fn api_int_coerces_string() {
        let (ctx, vars) = fixtures();
        let r = Renderer::new(&ctx, &vars);
        assert_eq!(r.render("<< API.int(\"7\") >>").unwrap(), "7");
    }

    #[test]
    fn api_sqltuple_renders_quoted_list() {
        let (ctx, vars) = fixtures();
        let r = Renderer::new(&ctx, &vars);
        assert_eq!(r.render("<< API.sqltuple([\"a\", \"b\"]) >>").unwrap(), "('a', 'b')");
    }

    #[test]
    fn api_peek_falls_back_on_missing_key() {
        let (ctx, vars) = fixtures();
        let r = Renderer::new(&ctx, &vars);
        assert_eq!(r.render("<< API.peek(\"variables.missing\", \"fallback\") >>").unwrap(), "fallback");
        assert_eq!(r.render("<< API.peek(\"variables.count\", \"fallback\") >>").unwrap(), "3");
    }

    #[test]
    fn api_setvariable_records_pending_write() {
        let (ctx, vars) = fixtures();
        let r = Renderer::new(&ctx, &vars);
        r.render("<< API.setvariable(\"k\", \"v\") >>").unwrap();
        assert_eq!(r.take_pending_writes(), vec![("k".to_string(), json!("v"))]);
    }

    #[test]
    fn api_error_raises_user_generated() {
        let (ctx, vars) = fixtures();
        let r = Renderer::new(&ctx, &vars);
        let err = r.render("<< API.error(\"boom\") >>").unwrap_err();
        assert!(matches!(err, FlowError::UserGenerated(msg) if msg == "boom"));
    }

    #[test]
    fn api_look_filters_pre_materialized_rows() {
        let (ctx, vars) = fixtures();
        let mut rows = HashMap::new();
        rows.insert(
            "users".to_string(),
            vec![
                HashMap::from([("id".to_string(), json!(1)), ("name".to_string(), json!("a"))]),
                HashMap::from([("id".to_string(), json!(2)), ("name".to_string(), json!("b"))]),
            ],
        );
        let r = Renderer::new(&ctx, &vars).with_tables(rows);
        let out = r.render("<< API.look(\"users\", {\"id\": 2}) >>").unwrap();
        assert!(out.contains("\"b\""));
    }
}
