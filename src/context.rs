//! Context records shared between adapters and strategies.
//!
//! - `ExchangeContext`: one per configured service, built at startup
//! - `PipelineContext`: one per result, threaded through the pipeline

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::channels::ChannelTable;
use crate::config::{CallSpec, Config, Credential, Endpoints, ServiceConfig};
use crate::error::CredentialsError;
use crate::pipeline::ResultSink;
use crate::schema::ApiResult;

/// Per-service mutable state, written by the stream adapter during
/// channel discovery and readable by strategies.
#[derive(Debug, Default, Clone)]
pub struct Scratch {
    /// Channel name → subscribed
    pub channels: ChannelTable,
    /// Server channel catalogue as last reported
    pub catalogue: Vec<String>,
}

// ------------------------------------------------------------
// ExchangeContext
// ------------------------------------------------------------
//
// Everything a facade and its adapters need about one service:
// credentials, endpoints, calls, subscriptions and the sink that
// feeds the pipeline. Shared as `Arc<ExchangeContext>`.
//
#[derive(Debug)]
pub struct ExchangeContext {
    pub name: String,
    pub credentials: Credential,
    pub endpoints: Endpoints,
    pub currencies: Vec<String>,
    /// Exchange codes monitored through this service
    pub exchanges: Vec<String>,
    pub calls: BTreeMap<String, CallSpec>,
    /// Channel name → response type
    pub subscriptions: BTreeMap<String, String>,
    pub discover_channels: bool,
    shared: Mutex<Scratch>,
    sink: ResultSink,
}

impl ExchangeContext {
    pub fn from_config(
        cfg: &Config,
        svc: &ServiceConfig,
        sink: ResultSink,
    ) -> Result<Self, CredentialsError> {
        let credentials = svc.credentials()?.clone();
        Ok(Self {
            name: svc.name.clone(),
            credentials,
            endpoints: svc.endpoints.clone(),
            currencies: cfg.currencies_for(svc),
            exchanges: svc.exchanges.clone(),
            calls: cfg.api.calls.clone(),
            subscriptions: svc.subscriptions.clone(),
            discover_channels: svc.discover_channels,
            shared: Mutex::new(Scratch::default()),
            sink,
        })
    }

    /// Minimal context for a single service, mostly useful in tests.
    pub fn new(name: &str, credentials: Credential, endpoints: Endpoints, sink: ResultSink) -> Self {
        Self {
            name: name.to_string(),
            credentials,
            endpoints,
            currencies: Vec::new(),
            exchanges: Vec::new(),
            calls: BTreeMap::new(),
            subscriptions: BTreeMap::new(),
            discover_channels: false,
            shared: Mutex::new(Scratch::default()),
            sink,
        }
    }

    /// Runs `f` with exclusive access to the scratch space.
    pub fn with_shared<R>(&self, f: impl FnOnce(&mut Scratch) -> R) -> R {
        let mut guard = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn shared_snapshot(&self) -> Scratch {
        self.with_shared(|s| s.clone())
    }

    /// Hands a result to the pipeline.
    pub fn deliver(&self, result: ApiResult) {
        self.sink.deliver(result);
    }

    pub fn sink(&self) -> &ResultSink {
        &self.sink
    }
}

/// All service contexts by name.
pub type ExchangeContexts = Arc<BTreeMap<String, Arc<ExchangeContext>>>;

// ------------------------------------------------------------
// PipelineContext
// ------------------------------------------------------------

/// Strategy scratch data, keyed by strategy namespace.
///
/// Insertion ordered. There is no removal API: a stage may add or
/// replace its own keys, never drop keys of earlier stages.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StrategyData {
    entries: Map<String, Value>,
}

impl StrategyData {
    pub fn set(&mut self, key: &str, value: Value) {
        self.entries.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries.get_mut(key)
    }

    /// Value under `key`, inserting an empty object first if absent.
    pub fn namespace(&mut self, key: &str) -> &mut Value {
        self.entries
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Object(self.entries.clone())
    }
}

/// Accumulated state threaded through the middleware chain for one result.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    result: ApiResult,
    exchanges: ExchangeContexts,
    strategy: StrategyData,
}

impl PipelineContext {
    pub fn new(result: ApiResult, exchanges: ExchangeContexts) -> Self {
        Self {
            result,
            exchanges,
            strategy: StrategyData::default(),
        }
    }

    pub fn result(&self) -> &ApiResult {
        &self.result
    }

    pub fn exchange(&self, name: &str) -> Option<&Arc<ExchangeContext>> {
        self.exchanges.get(name)
    }

    pub fn exchanges(&self) -> &ExchangeContexts {
        &self.exchanges
    }

    pub fn strategy(&self) -> &StrategyData {
        &self.strategy
    }

    pub fn strategy_mut(&mut self) -> &mut StrategyData {
        &mut self.strategy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample;
    use crate::pipeline::ResultSink;
    use serde_json::json;

    #[test]
    fn context_is_built_from_service_config() {
        let cfg: Config = sample().to_string().parse().unwrap();
        let (sink, _rx) = ResultSink::channel();
        let ctx = ExchangeContext::from_config(&cfg, &cfg.api.services[0], sink).unwrap();
        assert_eq!(ctx.name, "coinigy");
        assert_eq!(ctx.credentials.secret, "test_secret");
        assert_eq!(ctx.currencies, vec!["BTC", "ETH", "XRP"]);
        assert!(ctx.calls.contains_key("ticker"));
    }

    #[test]
    fn missing_credentials_fail_for_that_service() {
        let cfg: Config = sample().to_string().parse().unwrap();
        let mut svc = cfg.api.services[0].clone();
        svc.credentials.clear();
        let (sink, _rx) = ResultSink::channel();
        assert!(ExchangeContext::from_config(&cfg, &svc, sink).is_err());
    }

    #[test]
    fn scratch_is_shared_across_handles() {
        let (sink, _rx) = ResultSink::channel();
        let ctx = Arc::new(ExchangeContext::new(
            "x",
            Credential { name: None, api_key: "k".into(), secret: "s".into() },
            Endpoints::default(),
            sink,
        ));
        let other = ctx.clone();
        ctx.with_shared(|s| {
            s.channels.insert("TRADE-A--B--C".into(), true);
            s.catalogue = vec!["TRADE-A--B--C".into(), "ORDER-A--B--C".into()];
        });
        let seen = other.shared_snapshot();
        assert_eq!(seen.channels.len(), 1);
        assert_eq!(seen.catalogue.len(), 2);
    }

    #[test]
    fn strategy_data_keeps_insertion_order() {
        let mut data = StrategyData::default();
        data.set("zeta", json!(1));
        data.set("alpha", json!(2));
        data.namespace("mid")["k"] = json!(3);
        let keys: Vec<_> = data.keys().cloned().collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
        assert_eq!(data.get("mid"), Some(&json!({"k": 3})));
    }
}
