use async_trait::async_trait;
use log::debug;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::context::ExchangeContext;
use crate::error::TransportError;
use crate::transport::rest::{RestAuth, RestClient};

use super::facade::{ExchangeFacade, StreamProtocol};
use super::socketcluster::SocketClusterProtocol;

/// Coinigy API facade
///
/// REST: https://api.coinigy.com/api/v1/{method}
/// WS:   SocketCluster, channels `TRADE-EXCH--BASE--QUOTE` / `ORDER-...`
///
/// Market data calls (`history`, `asks`, `bids`, `orders`, `all`) are all
/// served by the `data` endpoint, distinguished by a `type` field.
pub struct CoinigyFacade {
    ctx: Arc<ExchangeContext>,
    rest: Option<RestClient>,
    protocol: Arc<SocketClusterProtocol>,
}

const OVERRIDES: &[(&str, &str)] = &[
    ("history", "data"),
    ("asks", "data"),
    ("bids", "data"),
    ("orders", "data"),
    ("all", "data"),
];

impl CoinigyFacade {
    pub fn new(ctx: Arc<ExchangeContext>) -> Result<Self, TransportError> {
        let rest = match &ctx.endpoints.rest {
            Some(url) => Some(RestClient::new(
                url,
                RestAuth {
                    headers: vec![
                        ("X-API-KEY".into(), ctx.credentials.api_key.clone()),
                        ("X-API-SECRET".into(), ctx.credentials.secret.clone()),
                    ],
                    fields: Vec::new(),
                },
            )?),
            None => None,
        };
        debug!("Starting API facade coinigy");
        Ok(Self {
            ctx,
            rest,
            protocol: Arc::new(SocketClusterProtocol),
        })
    }
}

#[async_trait]
impl ExchangeFacade for CoinigyFacade {
    fn name(&self) -> &'static str {
        "coinigy"
    }

    fn context(&self) -> &Arc<ExchangeContext> {
        &self.ctx
    }

    fn endpoint_overrides(&self) -> &'static [(&'static str, &'static str)] {
        OVERRIDES
    }

    fn rest(&self) -> Option<&RestClient> {
        self.rest.as_ref()
    }

    /// Market data calls carry their call name as the `type` field.
    async fn call(
        &self,
        name: &str,
        args: Option<&Map<String, Value>>,
    ) -> Result<Value, TransportError> {
        if self.resolve_endpoint(name) != "data" {
            return self.proxy_call(name, args).await;
        }

        let mut merged = args.cloned().unwrap_or_default();
        merged
            .entry("type")
            .or_insert_with(|| Value::String(name.to_string()));
        self.proxy_call(name, Some(&merged)).await
    }

    fn stream_protocol(&self) -> Option<Arc<dyn StreamProtocol>> {
        Some(self.protocol.clone())
    }
}
