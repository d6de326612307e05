//! The `Fn.*` macro namespace installed into the session at `connect()`
//! time: datetime parsing, boolean/arithmetic coercion, ISO calendar
//! helpers and a 4-4-5 fiscal-period bucketer, plus validation macros.
//!
//! DataFusion has no direct equivalent of the source engine's "table
//! macro" (`Fn.columns(table)` returning `(name, type)` rows); that one
//! operation is exposed instead as [`crate::adapter::SqlAdapter::columns`],
//! a regular async method, since DataFusion resolves table functions at
//! plan time and registering one per call is not supported by the version
//! in this stack. Everything else in the macro library is a real scalar
//! UDF registered once at connect time, matching the source's "installed
//! into the SQL runtime at connect time" global-registry model.

use std::sync::Arc;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Utc};
use datafusion::arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray,
};
use datafusion::arrow::datatypes::DataType;
use datafusion::functions::utils::make_scalar_function;
use datafusion::logical_expr::{create_udf, Volatility};
use datafusion::prelude::SessionContext;
use flowctl_core::Result;

/// Installs the macro namespace.
pub fn install(ctx: &SessionContext) -> Result<()> {
    ctx.register_udf(dt_udf());
    ctx.register_udf(to_bool_udf());
    ctx.register_udf(iso_week_udf());
    ctx.register_udf(iso_year_udf());
    ctx.register_udf(iso_day_udf());
    ctx.register_udf(fiscal_period_udf());
    ctx.register_udf(validate_range_udf());
    ctx.register_udf(validate_compare_udf());
    ctx.register_udf(regex_match_udf());
    Ok(())
}

/// `dt(value, fmt, fail_on_error)` — robust datetime parsing. Accepts
/// unix seconds/milliseconds/nanoseconds (by magnitude), ISO-8601 with or
/// without a timezone suffix, or falls back to `fmt` if given. Per the
/// accepted Open Question decision, unknown strings default to the epoch
/// unless `fail_on_error` is true, in which case the scalar call errors.
fn dt_udf() -> datafusion::logical_expr::ScalarUDF {
    let fun = Arc::new(make_scalar_function(|args: &[ArrayRef]| {
        let values = args[0].as_any().downcast_ref::<StringArray>().ok_or_else(|| {
            datafusion::error::DataFusionError::Execution("dt(): first arg must be a string".into())
        })?;
        let fmts = args.get(1).and_then(|a| a.as_any().downcast_ref::<StringArray>());
        let fail_on_error = args
            .get(2)
            .and_then(|a| a.as_any().downcast_ref::<BooleanArray>())
            .map(|a| a.value(0))
            .unwrap_or(false);

        let mut out = Vec::with_capacity(values.len());
        for i in 0..values.len() {
            if values.is_null(i) {
                out.push(None);
                continue;
            }
            let fmt = fmts.filter(|a| !a.is_null(i)).map(|a| a.value(i));
            match parse_datetime(values.value(i), fmt) {
                Some(ts) => out.push(Some(ts)),
                None if fail_on_error => {
                    return Err(datafusion::error::DataFusionError::Execution(format!(
                        "dt(): could not parse '{}' as a datetime",
                        values.value(i)
                    )))
                }
                None => out.push(Some(0)),
            }
        }
        Ok(Arc::new(Int64Array::from(out)) as ArrayRef)
    }, vec![]));
    create_udf(
        "dt",
        vec![DataType::Utf8, DataType::Utf8, DataType::Boolean],
        DataType::Int64,
        Volatility::Immutable,
        fun,
    )
}

/// Parses `s` as an epoch-seconds timestamp. `fmt`, when given, is tried
/// first as a `chrono` format string ahead of the unix-epoch/RFC-3339/
/// default fallback chain.
fn parse_datetime(s: &str, fmt: Option<&str>) -> Option<i64> {
    if let Some(fmt) = fmt.filter(|f| !f.is_empty()) {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc().timestamp());
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp());
        }
    }
    if let Ok(seconds) = s.parse::<i64>() {
        return Some(normalize_epoch(seconds));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc().timestamp());
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp());
    }
    None
}

/// Numeric epoch values may arrive as seconds, milliseconds or
/// nanoseconds; normalize to seconds by magnitude.
fn normalize_epoch(value: i64) -> i64 {
    let abs = value.abs();
    if abs > 1_000_000_000_000_000 {
        value / 1_000_000_000
    } else if abs > 1_000_000_000_000 {
        value / 1_000
    } else {
        value
    }
}

/// `to_bool(value)` — arithmetic/string boolean coercion:
/// `true/false/1/0/yes/no` (case-insensitive).
fn to_bool_udf() -> datafusion::logical_expr::ScalarUDF {
    let fun = Arc::new(make_scalar_function(|args: &[ArrayRef]| {
        let values = args[0].as_any().downcast_ref::<StringArray>().ok_or_else(|| {
            datafusion::error::DataFusionError::Execution(
                "to_bool(): first arg must be a string".into(),
            )
        })?;
        let out: BooleanArray = values
            .iter()
            .map(|v| {
                v.map(|s| matches!(s.to_lowercase().as_str(), "true" | "1" | "yes" | "y" | "t"))
            })
            .collect();
        Ok(Arc::new(out) as ArrayRef)
    }, vec![]));
    create_udf(
        "to_bool",
        vec![DataType::Utf8],
        DataType::Boolean,
        Volatility::Immutable,
        fun,
    )
}

/// `iso_week(epoch_seconds)` — ISO-8601 week number.
fn iso_week_udf() -> datafusion::logical_expr::ScalarUDF {
    let fun = Arc::new(make_scalar_function(|args: &[ArrayRef]| {
        let values = args[0].as_any().downcast_ref::<Int64Array>().ok_or_else(|| {
            datafusion::error::DataFusionError::Execution(
                "iso_week(): first arg must be an integer epoch".into(),
            )
        })?;
        let out: Int64Array = values
            .iter()
            .map(|v| v.and_then(to_naive).map(|d| d.iso_week().week() as i64))
            .collect();
        Ok(Arc::new(out) as ArrayRef)
    }, vec![]));
    create_udf(
        "iso_week",
        vec![DataType::Int64],
        DataType::Int64,
        Volatility::Immutable,
        fun,
    )
}

/// `iso_year(epoch_seconds)` — ISO-8601 week-based year.
fn iso_year_udf() -> datafusion::logical_expr::ScalarUDF {
    let fun = Arc::new(make_scalar_function(|args: &[ArrayRef]| {
        let values = args[0].as_any().downcast_ref::<Int64Array>().ok_or_else(|| {
            datafusion::error::DataFusionError::Execution(
                "iso_year(): first arg must be an integer epoch".into(),
            )
        })?;
        let out: Int64Array = values
            .iter()
            .map(|v| v.and_then(to_naive).map(|d| d.iso_week().year() as i64))
            .collect();
        Ok(Arc::new(out) as ArrayRef)
    }, vec![]));
    create_udf(
        "iso_year",
        vec![DataType::Int64],
        DataType::Int64,
        Volatility::Immutable,
        fun,
    )
}

/// `fiscal_period(epoch_seconds)` — "4-4-5" fiscal-period bucketer:
/// returns the 1-indexed fiscal period (1..=12) given a 4-4-5 week
/// calendar starting on the ISO year's first Monday.
fn fiscal_period_udf() -> datafusion::logical_expr::ScalarUDF {
    let fun = Arc::new(make_scalar_function(|args: &[ArrayRef]| {
        let values = args[0].as_any().downcast_ref::<Int64Array>().ok_or_else(|| {
            datafusion::error::DataFusionError::Execution(
                "fiscal_period(): first arg must be an integer epoch".into(),
            )
        })?;
        let out: Int64Array = values
            .iter()
            .map(|v| v.and_then(to_naive).map(|d| fiscal_period_445(d.iso_week().week())))
            .collect();
        Ok(Arc::new(out) as ArrayRef)
    }, vec![]));
    create_udf(
        "fiscal_period",
        vec![DataType::Int64],
        DataType::Int64,
        Volatility::Immutable,
        fun,
    )
}

pub(crate) fn fiscal_period_445(iso_week: u32) -> i64 {
    // Periods of 4,4,5 weeks (13 weeks/quarter) repeating 4 times a year.
    const PATTERN: [u32; 12] = [4, 4, 5, 4, 4, 5, 4, 4, 5, 4, 4, 5];
    let mut remaining = iso_week.max(1);
    for (idx, weeks) in PATTERN.iter().enumerate() {
        if remaining <= *weeks {
            return (idx + 1) as i64;
        }
        remaining -= weeks;
    }
    12
}

/// `iso_day(epoch_seconds)` — ISO-8601 weekday number, 1 (Monday) through
/// 7 (Sunday).
fn iso_day_udf() -> datafusion::logical_expr::ScalarUDF {
    let fun = Arc::new(make_scalar_function(|args: &[ArrayRef]| {
        let values = args[0].as_any().downcast_ref::<Int64Array>().ok_or_else(|| {
            datafusion::error::DataFusionError::Execution(
                "iso_day(): first arg must be an integer epoch".into(),
            )
        })?;
        let out: Int64Array = values
            .iter()
            .map(|v| v.and_then(to_naive).map(|d| d.weekday().number_from_monday() as i64))
            .collect();
        Ok(Arc::new(out) as ArrayRef)
    }, vec![]));
    create_udf(
        "iso_day",
        vec![DataType::Int64],
        DataType::Int64,
        Volatility::Immutable,
        fun,
    )
}

pub(crate) fn to_naive(epoch: i64) -> Option<chrono::NaiveDate> {
    DateTime::<Utc>::from_timestamp(epoch, 0).map(|d| d.naive_utc().date())
}

/// `validate_range(value, low, high)` — returns `value` unchanged when
/// `low <= value <= high`; otherwise the call fails (the source's
/// validation macros "return the value on pass and a typed error on
/// fail" via the engine's own error propagation).
fn validate_range_udf() -> datafusion::logical_expr::ScalarUDF {
    let fun = Arc::new(make_scalar_function(|args: &[ArrayRef]| {
        let values = args[0].as_any().downcast_ref::<Float64Array>().ok_or_else(|| {
            datafusion::error::DataFusionError::Execution(
                "validate_range(): first arg must be numeric".into(),
            )
        })?;
        let low = args[1].as_any().downcast_ref::<Float64Array>().unwrap().value(0);
        let high = args[2].as_any().downcast_ref::<Float64Array>().unwrap().value(0);
        for i in 0..values.len() {
            if values.is_null(i) {
                continue;
            }
            let v = values.value(i);
            if v < low || v > high {
                return Err(datafusion::error::DataFusionError::Execution(format!(
                    "validate_range(): value {v} is outside [{low}, {high}]"
                )));
            }
        }
        Ok(Arc::new(values.clone()) as ArrayRef)
    }, vec![]));
    create_udf(
        "validate_range",
        vec![DataType::Float64, DataType::Float64, DataType::Float64],
        DataType::Float64,
        Volatility::Immutable,
        fun,
    )
}

/// `validate_compare(value, op, bound)` — returns `value` unchanged when
/// `value <op> bound` holds for `op` in `< <= > >= == !=`; otherwise the
/// call fails, matching `validate_range`'s pass-through-or-error shape.
fn validate_compare_udf() -> datafusion::logical_expr::ScalarUDF {
    let fun = Arc::new(make_scalar_function(|args: &[ArrayRef]| {
        let values = args[0].as_any().downcast_ref::<Float64Array>().ok_or_else(|| {
            datafusion::error::DataFusionError::Execution(
                "validate_compare(): first arg must be numeric".into(),
            )
        })?;
        let ops = args[1].as_any().downcast_ref::<StringArray>().ok_or_else(|| {
            datafusion::error::DataFusionError::Execution(
                "validate_compare(): second arg must be a string operator".into(),
            )
        })?;
        let bound = args[2].as_any().downcast_ref::<Float64Array>().ok_or_else(|| {
            datafusion::error::DataFusionError::Execution(
                "validate_compare(): third arg must be numeric".into(),
            )
        })?;
        let op = ops.value(0);
        let bound = bound.value(0);
        for i in 0..values.len() {
            if values.is_null(i) {
                continue;
            }
            let v = values.value(i);
            let pass = match op {
                "<" => v < bound,
                "<=" => v <= bound,
                ">" => v > bound,
                ">=" => v >= bound,
                "==" => v == bound,
                "!=" => v != bound,
                other => {
                    return Err(datafusion::error::DataFusionError::Execution(format!(
                        "validate_compare(): unknown operator '{other}'"
                    )))
                }
            };
            if !pass {
                return Err(datafusion::error::DataFusionError::Execution(format!(
                    "validate_compare(): value {v} does not satisfy {v} {op} {bound}"
                )));
            }
        }
        Ok(Arc::new(values.clone()) as ArrayRef)
    }, vec![]));
    create_udf(
        "validate_compare",
        vec![DataType::Float64, DataType::Utf8, DataType::Float64],
        DataType::Float64,
        Volatility::Immutable,
        fun,
    )
}

/// `regex_match(value, pattern)` — returns `value` unchanged when it
/// matches `pattern`; otherwise the call fails.
fn regex_match_udf() -> datafusion::logical_expr::ScalarUDF {
    let fun = Arc::new(make_scalar_function(|args: &[ArrayRef]| {
        let values = args[0].as_any().downcast_ref::<StringArray>().ok_or_else(|| {
            datafusion::error::DataFusionError::Execution(
                "regex_match(): first arg must be a string".into(),
            )
        })?;
        let patterns = args[1].as_any().downcast_ref::<StringArray>().ok_or_else(|| {
            datafusion::error::DataFusionError::Execution(
                "regex_match(): second arg must be a string pattern".into(),
            )
        })?;
        let re = regex::Regex::new(patterns.value(0)).map_err(|e| {
            datafusion::error::DataFusionError::Execution(format!(
                "regex_match(): invalid pattern '{}': {e}",
                patterns.value(0)
            ))
        })?;
        for i in 0..values.len() {
            if values.is_null(i) {
                continue;
            }
            let v = values.value(i);
            if !re.is_match(v) {
                return Err(datafusion::error::DataFusionError::Execution(format!(
                    "regex_match(): value '{v}' does not match pattern '{}'",
                    patterns.value(0)
                )));
            }
        }
        Ok(Arc::new(values.clone()) as ArrayRef)
    }, vec![]));
    create_udf(
        "regex_match",
        vec![DataType::Utf8, DataType::Utf8],
        DataType::Utf8,
        Volatility::Immutable,
        fun,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_epoch_magnitudes() {
        assert_eq!(normalize_epoch(1_700_000_000), 1_700_000_000);
        assert_eq!(normalize_epoch(1_700_000_000_000), 1_700_000_000);
        assert_eq!(normalize_epoch(1_700_000_000_000_000_000), 1_700_000_000);
    }

    #[test]
    fn parses_iso_and_numeric_forms() {
        assert!(parse_datetime("2024-01-15T10:00:00Z", None).is_some());
        assert!(parse_datetime("2024-01-15", None).is_some());
        assert!(parse_datetime("1700000000", None).is_some());
        assert!(parse_datetime("not-a-date", None).is_none());
    }

    #[test]
    fn parses_with_explicit_format() {
        assert_eq!(
            parse_datetime("15/01/2024", Some("%d/%m/%Y")),
            parse_datetime("2024-01-15", None)
        );
    }

    #[test]
    fn fiscal_period_bucketing_is_monotonic() {
        assert_eq!(fiscal_period_445(1), 1);
        assert_eq!(fiscal_period_445(4), 1);
        assert_eq!(fiscal_period_445(5), 2);
        assert_eq!(fiscal_period_445(13), 3);
        assert_eq!(fiscal_period_445(52), 12);
    }
}
