//! Response normalizer.
//!
//! Maps a call name (or a channel's response type) to a `RecordShape`
//! and coerces raw JSON into records of that shape.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use log::debug;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::ShapeMismatch;
use crate::schema::{self, FieldSpec, FieldType, Payload, Record, RecordShape};
use crate::util;

/// Epoch values above this are taken as milliseconds.
const EPOCH_MS_THRESHOLD: f64 = 1e11;

#[derive(Debug, Clone)]
pub struct Normalizer {
    shapes: BTreeMap<String, RecordShape>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(schema::catalogue())
    }
}

impl Normalizer {
    pub fn new(shapes: BTreeMap<String, RecordShape>) -> Self {
        Self { shapes }
    }

    /// Catalogue shapes with configured shapes layered on top.
    pub fn with_overrides(overrides: &BTreeMap<String, RecordShape>) -> Self {
        let mut shapes = schema::catalogue();
        shapes.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { shapes }
    }

    pub fn shape(&self, name: &str) -> Option<&RecordShape> {
        self.shapes.get(name)
    }

    /// Normalizes the response of a REST call.
    ///
    /// A call without a registered shape passes through unchanged.
    pub fn normalize_call(&self, call: &str, raw: &Value) -> Result<Payload, ShapeMismatch> {
        match self.shapes.get(call) {
            Some(shape) => apply(call, shape, raw),
            None => {
                debug!("no shape registered for call '{call}', passing through");
                passthrough(call, raw)
            }
        }
    }

    /// Normalizes one channel message using the channel's response type.
    ///
    /// Unknown response types fall back to the `default` shape.
    pub fn normalize_channel(
        &self,
        channel: &str,
        response_type: &str,
        raw: &Value,
    ) -> Result<Payload, ShapeMismatch> {
        match self
            .shapes
            .get(response_type)
            .or_else(|| self.shapes.get("default"))
        {
            Some(shape) => apply(channel, shape, raw),
            None => passthrough(channel, raw),
        }
    }
}

fn mismatch(name: &str, index: Option<usize>, field: Option<&str>, reason: String, raw: &Value) -> ShapeMismatch {
    ShapeMismatch {
        name: name.to_string(),
        index,
        field: field.map(str::to_string),
        reason,
        raw: raw.clone(),
    }
}

fn passthrough(name: &str, raw: &Value) -> Result<Payload, ShapeMismatch> {
    match raw {
        Value::Object(map) => Ok(Payload::One(map.clone())),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::Object(map) => Ok(map.clone()),
                other => Err(mismatch(name, Some(i), None, format!("expected object, got {other}"), raw)),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Payload::Many),
        other => Err(mismatch(name, None, None, format!("expected object or list, got {other}"), raw)),
    }
}

/// Extracts the payload at the shape's path and coerces it.
fn apply(name: &str, shape: &RecordShape, raw: &Value) -> Result<Payload, ShapeMismatch> {
    let body = match &shape.path {
        Some(path) => util::lookup_path(raw, path).map_err(|seg| {
            mismatch(name, None, None, format!("path '{path}' not found (missing '{seg}')"), raw)
        })?,
        None => raw,
    };

    if shape.many {
        let items = body.as_array().ok_or_else(|| {
            mismatch(name, None, None, format!("expected a list, got {}", kind_of(body)), raw)
        })?;
        items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                coerce_record(shape, item).map_err(|(field, reason)| {
                    mismatch(name, Some(i), field.as_deref(), reason, raw)
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Payload::Many)
    } else {
        coerce_record(shape, body)
            .map(Payload::One)
            .map_err(|(field, reason)| mismatch(name, None, field.as_deref(), reason, raw))
    }
}

type FieldFailure = (Option<String>, String);

fn coerce_record(shape: &RecordShape, item: &Value) -> Result<Record, FieldFailure> {
    let obj = item
        .as_object()
        .ok_or_else(|| (None, format!("expected an object, got {}", kind_of(item))))?;

    if shape.fields.is_empty() {
        return Ok(obj.clone());
    }

    let mut out = Map::with_capacity(shape.fields.len());
    for spec in &shape.fields {
        let value = match obj.get(&spec.name) {
            None | Some(Value::Null) if spec.required => {
                return Err((Some(spec.name.clone()), "required field is missing".into()));
            }
            None | Some(Value::Null) => Value::Null,
            Some(v) => coerce_field(spec, v).map_err(|reason| (Some(spec.name.clone()), reason))?,
        };
        out.insert(spec.name.clone(), value);
    }
    Ok(out)
}

fn coerce_field(spec: &FieldSpec, v: &Value) -> Result<Value, String> {
    match spec.kind {
        FieldType::Str => match v {
            Value::String(s) => Ok(Value::String(s.clone())),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(format!("expected string, got {}", kind_of(other))),
        },
        FieldType::Float => to_f64(v)
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .ok_or_else(|| format!("expected float, got {v}")),
        FieldType::Int => to_f64(v)
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| Value::from(f as i64))
            .ok_or_else(|| format!("expected integer, got {v}")),
        FieldType::Bool => match v {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Number(n) if n.as_i64() == Some(0) || n.as_i64() == Some(1) => {
                Ok(Value::Bool(n.as_i64() == Some(1)))
            }
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err(format!("expected bool, got {v}")),
            },
            other => Err(format!("expected bool, got {other}")),
        },
        FieldType::Timestamp => parse_timestamp(v)
            .map(|ts| Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
            .ok_or_else(|| format!("expected timestamp, got {v}")),
        FieldType::List => {
            let items = v
                .as_array()
                .ok_or_else(|| format!("expected list, got {}", kind_of(v)))?;
            match &spec.items {
                None => Ok(v.clone()),
                Some(inner) => items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        coerce_record(inner, item)
                            .map(Value::Object)
                            .map_err(|(field, reason)| match field {
                                Some(f) => format!("[{i}].{f}: {reason}"),
                                None => format!("[{i}]: {reason}"),
                            })
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array),
            }
        }
        FieldType::Json => Ok(v.clone()),
    }
}

fn to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Parses RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) or unix epoch values.
pub fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => from_epoch(n.as_f64()?),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
                if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(Utc.from_utc_datetime(&naive));
                }
            }
            s.parse::<f64>().ok().and_then(from_epoch)
        }
        _ => None,
    }
}

fn from_epoch(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let ms = if value > EPOCH_MS_THRESHOLD {
        value
    } else {
        value * 1_000.0
    };
    DateTime::from_timestamp_millis(ms.round() as i64)
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
