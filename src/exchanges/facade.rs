use async_trait::async_trait;
use log::{debug, info};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::config::Credential;
use crate::context::ExchangeContext;
use crate::error::TransportError;
use crate::transport::rest::RestClient;

/// ExchangeFacade is the layer between:
/// - The generic poll / stream adapters
/// - One exchange's HTTP and websocket APIs
///
/// Each implementation must:
/// - Resolve logical call names to endpoint paths
/// - Attach standing credentials to every request
/// - Report failures as `TransportError` (never swallow them)
///
/// THREAD SAFETY:
/// - Must be Send + Sync
/// - One facade instance is shared by the poll and stream adapters
///   of its service
///
#[async_trait]
pub trait ExchangeFacade: Send + Sync {
    /// Canonical service name. Must match `api.services[].name`.
    fn name(&self) -> &'static str;

    fn context(&self) -> &Arc<ExchangeContext>;

    /// Logical call → endpoint path. Calls not listed here are sent to
    /// an endpoint of the same name.
    fn endpoint_overrides(&self) -> &'static [(&'static str, &'static str)] {
        &[]
    }

    fn resolve_endpoint<'a>(&self, call: &'a str) -> &'a str {
        self.endpoint_overrides()
            .iter()
            .find(|(name, _)| *name == call)
            .map(|(_, path)| *path)
            .unwrap_or(call)
    }

    /// REST client, if the service has a REST endpoint.
    fn rest(&self) -> Option<&RestClient>;

    /// Request/response verb.
    ///
    /// The default is the generic proxy call: resolve the endpoint and
    /// POST. Facades override this for calls that need native handling
    /// and delegate to `proxy_call` for everything else.
    async fn call(
        &self,
        name: &str,
        args: Option<&Map<String, Value>>,
    ) -> Result<Value, TransportError> {
        self.proxy_call(name, args).await
    }

    async fn proxy_call(
        &self,
        name: &str,
        args: Option<&Map<String, Value>>,
    ) -> Result<Value, TransportError> {
        let rest = self
            .rest()
            .ok_or_else(|| TransportError::NoEndpoint(self.name().to_string()))?;
        let endpoint = self.resolve_endpoint(name);
        if endpoint != name {
            debug!("[{}] using override for /{name}: /{endpoint}", self.name());
        }
        rest.post(endpoint, args).await
    }

    /// Websocket framing spoken by this service, if it streams.
    fn stream_protocol(&self) -> Option<Arc<dyn StreamProtocol>> {
        None
    }

    /// Called once the stream is authenticated and subscribed.
    fn on_stream_connect(&self) {
        info!("[{}] stream connected", self.name());
    }

    fn shutdown(&self) {
        info!("Shutting down API facade for {}", self.name());
    }
}

/// Decoded inbound websocket frame.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Reply to a request we emitted with `cid`.
    Reply {
        cid: u64,
        error: Option<String>,
        data: Value,
    },

    /// Message published on a subscribed channel.
    Message { channel: String, data: Value },

    /// Keepalive that must be answered with the given frame.
    Ping(String),

    /// Anything else (token refresh, server notices).
    Ignore,
}

/// Websocket framing for one service.
///
/// Pure message building / decoding. No I/O, no shared state; the
/// stream session owns request ids and connection state.
///
/// Exchange of frames:
/// 1. `handshake` → reply tells whether auth is required
/// 2. `auth` → reply is the ack (or a rejection)
/// 3. `subscribe` per channel
/// 4. optional `catalogue_request` → reply lists server channels
pub trait StreamProtocol: Send + Sync {
    fn handshake(&self, cid: u64) -> String;

    /// Whether the handshake reply is an auth challenge.
    fn requires_auth(&self, reply: &Value) -> bool;

    fn auth(&self, credentials: &Credential, cid: u64) -> String;

    fn subscribe(&self, channel: &str, cid: u64) -> String;

    fn catalogue_request(&self, _cid: u64) -> Option<String> {
        None
    }

    /// Channel names from a catalogue reply.
    fn catalogue_channels(&self, _reply: &Value) -> Vec<String> {
        Vec::new()
    }

    fn decode(&self, raw: &str) -> StreamEvent;
}
