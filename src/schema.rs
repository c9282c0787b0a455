use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;

use crate::error::{ShapeMismatch, TransportError};

/// A normalized record.
///
/// Keys keep the declaration order of the shape that produced them,
/// and every declared field is present (absent optionals are `null`).
pub type Record = Map<String, Value>;

// ------------------------------------------------------------
// Record shapes
// ------------------------------------------------------------
//
// A RecordShape is the declarative description of one call or
// channel result:
// - where the payload lives in the raw response (`path`)
// - whether it is a list of records or a single record (`many`)
// - which fields are expected and how they are coerced
//
// Shapes are plain data. They round-trip through the configuration
// file so operators can add shapes for calls the catalogue lacks.
//
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordShape {
    /// Dotted path to the payload inside the raw response (e.g. `data.history`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Payload is a list of records.
    #[serde(default)]
    pub many: bool,

    /// Declared fields, in output order. An empty list keeps raw objects as-is.
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: FieldType,

    #[serde(default = "default_required")]
    pub required: bool,

    /// Element shape for `list` fields.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<RecordShape>>,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Str,
    Float,
    Int,
    Bool,
    Timestamp,
    List,
    Json,
}

impl RecordShape {
    pub fn new(path: Option<&str>, many: bool) -> Self {
        Self {
            path: path.map(str::to_string),
            many,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, kind: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            required: true,
            items: None,
        });
        self
    }

    pub fn optional(mut self, name: &str, kind: FieldType) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind,
            required: false,
            items: None,
        });
        self
    }

    pub fn list(mut self, name: &str, items: RecordShape) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_string(),
            kind: FieldType::List,
            required: true,
            items: Some(Box::new(items)),
        });
        self
    }
}

// ------------------------------------------------------------
// Results
// ------------------------------------------------------------

/// Normalized payload: one record or a list of records.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    One(Record),
    Many(Vec<Record>),
}

impl Payload {
    pub fn records(&self) -> Vec<&Record> {
        match self {
            Payload::One(r) => vec![r],
            Payload::Many(rs) => rs.iter().collect(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Payload::One(r) => Value::Object(r.clone()),
            Payload::Many(rs) => Value::Array(rs.iter().cloned().map(Value::Object).collect()),
        }
    }
}

/// Where a result came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum ResultSource {
    Call { callname: String },
    Channel { channel: String, response_type: String },
    /// The websocket connection itself
    Stream { url: String },
}

impl ResultSource {
    pub fn call(name: &str) -> Self {
        ResultSource::Call {
            callname: name.to_string(),
        }
    }

    pub fn channel(channel: &str, response_type: &str) -> Self {
        ResultSource::Channel {
            channel: channel.to_string(),
            response_type: response_type.to_string(),
        }
    }

    pub fn stream(url: &str) -> Self {
        ResultSource::Stream { url: url.to_string() }
    }

    /// Call name, channel name or stream URL.
    pub fn name(&self) -> &str {
        match self {
            ResultSource::Call { callname } => callname,
            ResultSource::Channel { channel, .. } => channel,
            ResultSource::Stream { url } => url,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    ShapeMismatch,
    /// The facade or normalizer panicked.
    Internal,
}

/// Error payload carried by a failed result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl From<&TransportError> for ResultError {
    fn from(err: &TransportError) -> Self {
        Self {
            kind: ErrorKind::Transport,
            message: err.to_string(),
            raw: err.raw(),
        }
    }
}

impl From<ShapeMismatch> for ResultError {
    fn from(err: ShapeMismatch) -> Self {
        Self {
            kind: ErrorKind::ShapeMismatch,
            message: err.to_string(),
            raw: Some(err.raw),
        }
    }
}

/// The unit delivered to the pipeline.
///
/// The outcome is either a payload or an error, never both.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResult {
    pub service: String,
    pub source: ResultSource,
    pub received_at: DateTime<Utc>,
    outcome: Result<Payload, ResultError>,
}

impl ApiResult {
    pub fn ok(service: &str, source: ResultSource, payload: Payload) -> Self {
        Self {
            service: service.to_string(),
            source,
            received_at: Utc::now(),
            outcome: Ok(payload),
        }
    }

    pub fn err(service: &str, source: ResultSource, error: ResultError) -> Self {
        Self {
            service: service.to_string(),
            source,
            received_at: Utc::now(),
            outcome: Err(error),
        }
    }

    pub fn value(&self) -> Option<&Payload> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ResultError> {
        self.outcome.as_ref().err()
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn to_json(&self) -> Value {
        let mut out = json!({
            "service": self.service,
            "received_at": self.received_at.to_rfc3339(),
        });
        if let (Value::Object(map), Ok(Value::Object(src))) =
            (&mut out, serde_json::to_value(&self.source))
        {
            map.extend(src);
            match &self.outcome {
                Ok(payload) => {
                    map.insert("result".into(), payload.to_json());
                    map.insert("error".into(), Value::Null);
                }
                Err(e) => {
                    map.insert("result".into(), Value::Null);
                    map.insert(
                        "error".into(),
                        serde_json::to_value(e).unwrap_or(Value::Null),
                    );
                }
            }
        }
        out
    }
}

// ------------------------------------------------------------
// Built-in shape catalogue
// ------------------------------------------------------------
//
// Shapes for the calls and channels the bundled facades speak.
// `default` is the fallback for channels whose response type has
// no registered shape: the raw object passes through untouched.
//
pub static CATALOGUE: Lazy<BTreeMap<String, RecordShape>> = Lazy::new(build_catalogue);

pub fn catalogue() -> BTreeMap<String, RecordShape> {
    CATALOGUE.clone()
}

fn build_catalogue() -> BTreeMap<String, RecordShape> {
    use FieldType::*;

    let order_item = RecordShape::new(None, true)
        .field("price", Float)
        .field("quantity", Float)
        .field("total", Float);

    let history_item = RecordShape::new(None, true)
        .field("price", Float)
        .field("quantity", Float)
        .field("time_local", Timestamp)
        .field("type", Str);

    let mut shapes = BTreeMap::new();

    shapes.insert("default".into(), RecordShape::new(None, false));

    shapes.insert(
        "ticker".into(),
        RecordShape::new(Some("data"), true)
            .field("exchange", Str)
            .field("market", Str)
            .field("last_trade", Float)
            .field("high_trade", Float)
            .field("low_trade", Float)
            .field("current_volume", Float)
            .field("timestamp", Timestamp)
            .field("ask", Float)
            .field("bid", Float),
    );

    shapes.insert(
        "history".into(),
        RecordShape {
            path: Some("data.history".into()),
            ..history_item.clone()
        },
    );

    for side in ["asks", "bids"] {
        shapes.insert(
            side.into(),
            RecordShape {
                path: Some(format!("data.{side}")),
                ..order_item.clone()
            },
        );
    }

    shapes.insert(
        "orders".into(),
        RecordShape::new(Some("data"), false)
            .field("exch_code", Str)
            .field("primary_curr_code", Str)
            .field("secondary_curr_code", Str)
            .field("type", Str)
            .list("asks", order_item.clone())
            .list("bids", order_item.clone()),
    );

    shapes.insert(
        "all".into(),
        RecordShape::new(Some("data"), false)
            .field("exch_code", Str)
            .field("primary_curr_code", Str)
            .field("secondary_curr_code", Str)
            .field("type", Str)
            .list("history", history_item)
            .list("asks", order_item.clone())
            .list("bids", order_item),
    );

    shapes.insert(
        "accounts".into(),
        RecordShape::new(Some("data"), true)
            .field("auth_id", Str)
            .optional("auth_nickname", Str)
            .field("exch_id", Str)
            .field("exch_name", Str)
            .optional("auth_active", Str)
            .optional("auth_trade", Str)
            .optional("auth_updated", Timestamp),
    );

    shapes.insert(
        "balances".into(),
        RecordShape::new(Some("data"), true)
            .field("balance_curr_code", Str)
            .optional("balance_amount_avail", Float)
            .optional("balance_amount_held", Float)
            .optional("balance_amount_total", Float)
            .optional("btc_balance", Float)
            .optional("last_price", Float),
    );

    shapes.insert(
        "exchanges".into(),
        RecordShape::new(Some("data"), true)
            .field("exch_id", Int)
            .field("exch_name", Str)
            .field("exch_code", Str)
            .field("exch_fee", Float)
            .field("exch_trade_enabled", Int)
            .field("exch_balance_enabled", Int)
            .field("exch_url", Str),
    );

    shapes.insert(
        "markets".into(),
        RecordShape::new(Some("data"), true)
            .field("exch_id", Int)
            .field("exch_name", Str)
            .field("exch_code", Str)
            .field("mkt_id", Int)
            .field("mkt_name", Str)
            .field("exchmkt_id", Int),
    );

    shapes.insert(
        "userOrders".into(),
        RecordShape::new(Some("data"), false)
            .list("open_orders", user_order())
            .list("order_history", user_order()),
    );

    shapes.insert(
        "channels".into(),
        RecordShape::new(None, true).field("channel", Str),
    );

    // Websocket channel shapes
    shapes.insert(
        "trade".into(),
        RecordShape::new(None, false)
            .optional("market_history_id", Int)
            .field("exchange", Str)
            .field("label", Str)
            .optional("tradeid", Str)
            .field("price", Float)
            .field("quantity", Float)
            .field("total", Float)
            .field("type", Str)
            .field("timestamp", Timestamp),
    );

    shapes.insert(
        "order".into(),
        RecordShape::new(None, true)
            .field("exchange", Str)
            .field("label", Str)
            .field("ordertype", Str)
            .field("price", Float)
            .field("quantity", Float)
            .field("total", Float)
            .field("timestamp", Timestamp),
    );

    shapes
}

fn user_order() -> RecordShape {
    use FieldType::*;

    RecordShape::new(None, true)
        .field("exch_name", Str)
        .field("mkt_name", Str)
        .field("limit_price", Float)
        .optional("operator", Str)
        .field("order_id", Int)
        .field("order_type", Str)
        .field("order_price_type", Str)
        .field("order_status", Str)
        .field("quantity", Float)
        .field("order_time", Timestamp)
        .optional("foreign_order_id", Str)
        .field("auth_id", Str)
        .optional("auth_nickname", Str)
        .optional("quantity_remaining", Float)
        .optional("stop_price", Float)
        .field("exch_code", Str)
        .optional("display_name", Str)
}
