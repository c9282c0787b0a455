use log::{debug, error};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};
use std::time::Duration;

use crate::error::TransportError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where standing credentials are attached to each request.
#[derive(Debug, Clone, Default)]
pub struct RestAuth {
    pub headers: Vec<(String, String)>,
    pub fields: Vec<(String, String)>,
}

/// Pooled REST client bound to one base URL.
///
/// Every request is a form-encoded `POST {base}/{method}` carrying the
/// standing credential fields merged with call arguments (arguments win
/// on conflicts).
///
/// Success means a 2xx status *and* a JSON body without an `error` key.
/// Anything else is returned as a `TransportError`.
#[derive(Debug, Clone)]
pub struct RestClient {
    base: String,
    fields: Vec<(String, String)>,
    http: reqwest::Client,
}

impl RestClient {
    pub fn new(base: &str, auth: RestAuth) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        for (k, v) in &auth.headers {
            let name = HeaderName::from_bytes(k.as_bytes()).map_err(|e| TransportError::Decode {
                url: base.to_string(),
                reason: format!("invalid header name '{k}': {e}"),
            })?;
            let value = HeaderValue::from_str(v).map_err(|e| TransportError::Decode {
                url: base.to_string(),
                reason: format!("invalid value for header '{k}': {e}"),
            })?;
            headers.insert(name, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            fields: auth.fields,
            http,
        })
    }

    pub fn url_for(&self, method: &str) -> String {
        format!("{}/{}", self.base, method.trim_start_matches('/'))
    }

    pub async fn post(
        &self,
        method: &str,
        args: Option<&Map<String, Value>>,
    ) -> Result<Value, TransportError> {
        let url = self.url_for(method);
        let form = merge_form(&self.fields, args);
        debug!("POST {url}");

        let resp = self.http.post(&url).form(&form).send().await?;
        let status = resp.status();
        let body = resp.text().await?;

        if !status.is_success() {
            error!("POST {url} failed with HTTP {}: {body}", status.as_u16());
            return Err(TransportError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = serde_json::from_str(&body).map_err(|e| TransportError::Decode {
            url: url.clone(),
            reason: format!("{e}: {body}"),
        })?;

        if let Some(message) = embedded_error(&value) {
            error!("POST {url} returned error: {message}");
            return Err(TransportError::Remote {
                url,
                message,
                raw: value,
            });
        }

        Ok(value)
    }
}

/// Credential fields first, then call arguments overriding them.
fn merge_form(fields: &[(String, String)], args: Option<&Map<String, Value>>) -> Vec<(String, String)> {
    let mut form: Vec<(String, String)> = fields.to_vec();
    if let Some(args) = args {
        for (k, v) in args {
            let v = match v {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            match form.iter_mut().find(|(name, _)| name == k) {
                Some(slot) => slot.1 = v,
                None => form.push((k.clone(), v)),
            }
        }
    }
    form
}

/// `{"error": ...}` or the `err_num` / `err_msg` pair some APIs use.
fn embedded_error(value: &Value) -> Option<String> {
    let obj = value.as_object()?;
    match obj.get("error") {
        Some(Value::Null) | None => {}
        Some(Value::String(s)) => return Some(s.clone()),
        Some(other) => return Some(other.to_string()),
    }
    obj.get("err_num").map(|num| {
        let msg = obj.get("err_msg").and_then(Value::as_str).unwrap_or("unknown error");
        format!("{msg} ({num})")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn auth() -> RestAuth {
        RestAuth {
            headers: vec![("X-API-KEY".into(), "k".into())],
            fields: vec![("X-API-SECRET".into(), "s".into())],
        }
    }

    #[tokio::test]
    async fn posts_credentials_and_arguments() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/ticker")
            .match_header("x-api-key", "k")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("X-API-SECRET".into(), "s".into()),
                Matcher::UrlEncoded("exchange_code".into(), "GDAX".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data": [{"price": "100.5"}]}"#)
            .create_async()
            .await;

        let client = RestClient::new(&format!("{}/", server.url()), auth()).unwrap();
        let args = json!({"exchange_code": "GDAX"});
        let v = client.post("ticker", args.as_object()).await.unwrap();

        assert_eq!(v, json!({"data": [{"price": "100.5"}]}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn non_2xx_is_status_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/ticker")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = RestClient::new(&server.url(), auth()).unwrap();
        let err = client.post("ticker", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 500, .. }));
    }

    #[tokio::test]
    async fn embedded_error_key_is_remote_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/accounts")
            .with_status(200)
            .with_body(r#"{"err_num": "1018", "err_msg": "Invalid API key"}"#)
            .create_async()
            .await;

        let client = RestClient::new(&server.url(), auth()).unwrap();
        match client.post("accounts", None).await.unwrap_err() {
            TransportError::Remote { message, raw, .. } => {
                assert!(message.contains("Invalid API key"));
                assert_eq!(raw["err_num"], "1018");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn non_json_body_is_decode_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/ticker")
            .with_status(200)
            .with_body("<html>")
            .create_async()
            .await;

        let client = RestClient::new(&server.url(), auth()).unwrap();
        assert!(matches!(
            client.post("ticker", None).await.unwrap_err(),
            TransportError::Decode { .. }
        ));
    }

    #[test]
    fn arguments_override_credential_fields() {
        let args = json!({"X-API-SECRET": "other", "limit": 5});
        let form = merge_form(&[("X-API-SECRET".into(), "s".into())], args.as_object());
        assert_eq!(
            form,
            vec![
                ("X-API-SECRET".to_string(), "other".to_string()),
                ("limit".to_string(), "5".to_string()),
            ]
        );
    }
}
