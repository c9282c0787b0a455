//! Error taxonomy.
//!
//! Two families live here:
//! - Fatal startup errors (`ConfigError`, `CredentialsError`)
//! - Recoverable runtime errors (`TransportError`, `ShapeMismatch`)
//!
//! Recoverable errors never escape an adapter loop. They are converted
//! into an `ApiResult` carrying the error and pushed down the pipeline.

use serde_json::Value;
use thiserror::Error;

/// Malformed or incomplete configuration. Aborts startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("missing configuration key: {0}")]
    Missing(String),

    #[error("invalid configuration value for '{key}': {reason}")]
    Invalid { key: String, reason: String },
}

/// Missing credentials for a named service. Fatal for that service only.
#[derive(Error, Debug)]
pub enum CredentialsError {
    #[error("no credentials configured for service '{0}'")]
    Missing(String),

    #[error("credential '{name}' not found for service '{service}'")]
    UnknownName { service: String, name: String },
}

/// Non-2xx HTTP, embedded remote error or websocket failure.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP {status} from {url}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("remote error from {url}: {message}")]
    Remote { url: String, message: String, raw: Value },

    #[error("undecodable response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("connection to {0} closed by server")]
    Disconnected(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("no REST endpoint configured for '{0}'")]
    NoEndpoint(String),
}

impl TransportError {
    /// Raw payload attached to the failure, when the server sent one.
    pub fn raw(&self) -> Option<Value> {
        match self {
            TransportError::Remote { raw, .. } => Some(raw.clone()),
            TransportError::Status { body, .. } | TransportError::Decode { reason: body, .. } => {
                Some(Value::String(body.clone()))
            }
            _ => None,
        }
    }
}

/// The normalizer could not coerce a payload into its record shape.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("shape mismatch for '{name}'{}: {reason}", fmt_location(.index, .field))]
pub struct ShapeMismatch {
    /// Call or channel name the payload was received for.
    pub name: String,
    /// Element index inside a list payload (None for single records or path errors).
    pub index: Option<usize>,
    /// Offending field, if the failure is field-specific.
    pub field: Option<String>,
    pub reason: String,
    /// The raw payload as received.
    pub raw: Value,
}

fn fmt_location(index: &Option<usize>, field: &Option<String>) -> String {
    match (index, field.as_deref()) {
        (Some(i), Some(f)) => format!(" at index {i}, field '{f}'"),
        (Some(i), None) => format!(" at index {i}"),
        (None, Some(f)) => format!(" at field '{f}'"),
        (None, None) => String::new(),
    }
}

/// Adapter lifecycle misuse.
#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("adapter '{name}' cannot {action} while {state}")]
    InvalidState {
        name: String,
        action: &'static str,
        state: String,
    },

    #[error("adapter task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shape_mismatch_message_names_call_and_index() {
        let err = ShapeMismatch {
            name: "history".into(),
            index: Some(3),
            field: Some("price".into()),
            reason: "expected float, got \"abc\"".into(),
            raw: json!({}),
        };
        let msg = err.to_string();
        assert!(msg.contains("'history'"));
        assert!(msg.contains("index 3"));
        assert!(msg.contains("field 'price'"));
    }

    #[test]
    fn remote_error_keeps_raw_payload() {
        let err = TransportError::Remote {
            url: "http://x/ticker".into(),
            message: "bad key".into(),
            raw: json!({"error": "bad key"}),
        };
        assert_eq!(err.raw(), Some(json!({"error": "bad key"})));
    }
}
