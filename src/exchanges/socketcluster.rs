use serde_json::{Value, json};

use crate::config::Credential;

use super::facade::{StreamEvent, StreamProtocol};

/// SocketCluster framing (JSON envelopes with `event` / `cid` / `rid`).
///
/// Used by Coinigy's websocket API:
/// - `#handshake` reply carries `isAuthenticated`
/// - `auth` is a custom event acked with `rid`
/// - channel data arrives as `#publish` events
/// - `#1` pings are answered with `#2`
pub struct SocketClusterProtocol;

impl StreamProtocol for SocketClusterProtocol {
    fn handshake(&self, cid: u64) -> String {
        json!({
            "event": "#handshake",
            "data": { "authToken": null },
            "cid": cid
        })
        .to_string()
    }

    fn requires_auth(&self, reply: &Value) -> bool {
        !reply
            .get("isAuthenticated")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn auth(&self, credentials: &Credential, cid: u64) -> String {
        json!({
            "event": "auth",
            "data": {
                "apiKey": credentials.api_key,
                "apiSecret": credentials.secret
            },
            "cid": cid
        })
        .to_string()
    }

    fn subscribe(&self, channel: &str, cid: u64) -> String {
        json!({
            "event": "#subscribe",
            "data": { "channel": channel },
            "cid": cid
        })
        .to_string()
    }

    fn catalogue_request(&self, cid: u64) -> Option<String> {
        Some(
            json!({
                "event": "channels",
                "data": null,
                "cid": cid
            })
            .to_string(),
        )
    }

    /// Reply data is `[[{"channel": "..."}, ...]]`; a flat list is accepted too.
    fn catalogue_channels(&self, reply: &Value) -> Vec<String> {
        let items = match reply.get(0) {
            Some(Value::Array(inner)) => inner.as_slice(),
            _ => reply.as_array().map(Vec::as_slice).unwrap_or_default(),
        };
        items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                other => other.get("channel").and_then(Value::as_str).map(str::to_string),
            })
            .collect()
    }

    fn decode(&self, raw: &str) -> StreamEvent {
        if raw == "#1" {
            return StreamEvent::Ping("#2".to_string());
        }

        let v: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(_) => return StreamEvent::Ignore,
        };

        if let Some(rid) = v.get("rid").and_then(Value::as_u64) {
            let error = match v.get("error") {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => Some(
                    other
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| other.to_string()),
                ),
            };
            return StreamEvent::Reply {
                cid: rid,
                error,
                data: v.get("data").cloned().unwrap_or(Value::Null),
            };
        }

        match v.get("event").and_then(Value::as_str) {
            Some("#publish") => {
                let data = &v["data"];
                match data.get("channel").and_then(Value::as_str) {
                    Some(channel) => StreamEvent::Message {
                        channel: channel.to_string(),
                        data: data.get("data").cloned().unwrap_or(Value::Null),
                    },
                    None => StreamEvent::Ignore,
                }
            }
            _ => StreamEvent::Ignore,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_replies_publishes_and_pings() {
        let p = SocketClusterProtocol;
        assert_eq!(p.decode("#1"), StreamEvent::Ping("#2".into()));
        assert_eq!(
            p.decode(r#"{"rid": 2, "error": {"message": "bad key"}}"#),
            StreamEvent::Reply { cid: 2, error: Some("bad key".into()), data: Value::Null }
        );
        assert_eq!(
            p.decode(r##"{"event": "#publish", "data": {"channel": "TRADE-A--B--C", "data": {"price": 1}}}"##),
            StreamEvent::Message { channel: "TRADE-A--B--C".into(), data: json!({"price": 1}) }
        );
        assert_eq!(p.decode(r##"{"event": "#setAuthToken", "data": {}}"##), StreamEvent::Ignore);
        assert_eq!(p.decode("not json"), StreamEvent::Ignore);
    }

    #[test]
    fn handshake_reply_signals_auth_challenge() {
        let p = SocketClusterProtocol;
        assert!(p.requires_auth(&json!({"id": "x", "isAuthenticated": false})));
        assert!(!p.requires_auth(&json!({"id": "x", "isAuthenticated": true})));
    }

    #[test]
    fn catalogue_reply_lists_channel_names() {
        let p = SocketClusterProtocol;
        let reply = json!([[{"channel": "TRADE-GDAX--BTC--USD"}, {"channel": "NEWS"}]]);
        assert_eq!(p.catalogue_channels(&reply), vec!["TRADE-GDAX--BTC--USD", "NEWS"]);
        assert_eq!(p.catalogue_channels(&json!(["A", "B"])), vec!["A", "B"]);
    }
}
