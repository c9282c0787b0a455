//! Service wiring.
//!
//! Builds one context, facade, poll adapter and stream adapter per
//! configured service and a single dispatcher for the pipeline, then
//! starts and stops them in order.

use log::{error, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::adapters::{PollAdapter, StreamAdapter};
use crate::config::Config;
use crate::context::{ExchangeContext, ExchangeContexts};
use crate::error::{AdapterError, ConfigError};
use crate::exchanges::{self, ExchangeFacade};
use crate::metrics::RuntimeMetrics;
use crate::normalizer::Normalizer;
use crate::pipeline::{Dispatcher, DispatcherHandle, Pipeline, ResultSink};
use crate::strategies;

pub struct App {
    contexts: ExchangeContexts,
    facades: Vec<Arc<dyn ExchangeFacade>>,
    polls: Vec<PollAdapter>,
    streams: Vec<StreamAdapter>,
    dispatcher: Option<Dispatcher>,
    handle: Option<DispatcherHandle>,
    metrics: Arc<RuntimeMetrics>,
}

impl App {
    /// Builds every component without starting any task.
    ///
    /// Only configuration errors fail. A service with bad credentials,
    /// an unknown name or a broken REST client is logged and skipped.
    pub fn build(cfg: &Config, metrics: Arc<RuntimeMetrics>) -> Result<Self, ConfigError> {
        let pipeline = strategies::pipeline(&cfg.strategies)?;
        let normalizer = Arc::new(Normalizer::with_overrides(&cfg.api.shapes));
        let (sink, rx) = ResultSink::channel();

        let mut contexts = BTreeMap::new();
        let mut facades = Vec::new();
        let mut polls = Vec::new();
        let mut streams = Vec::new();

        for svc in &cfg.api.services {
            let ctx = match ExchangeContext::from_config(cfg, svc, sink.clone()) {
                Ok(ctx) => Arc::new(ctx),
                Err(e) => {
                    error!("Skipping service '{}': {e}", svc.name);
                    continue;
                }
            };

            let facade = match exchanges::get_facade(ctx.clone()) {
                Some(Ok(facade)) => facade,
                Some(Err(e)) => {
                    error!("Skipping service '{}': {e}", svc.name);
                    continue;
                }
                None => {
                    warn!(
                        "Service '{}' is not supported (expected one of {:?})",
                        svc.name,
                        exchanges::SUPPORTED
                    );
                    continue;
                }
            };

            if !ctx.calls.is_empty() && ctx.endpoints.rest.is_some() {
                polls.push(PollAdapter::new(facade.clone(), normalizer.clone(), metrics.clone()));
            }

            if !ctx.subscriptions.is_empty() || ctx.discover_channels {
                match StreamAdapter::new(
                    facade.clone(),
                    normalizer.clone(),
                    metrics.clone(),
                    cfg.stream.reconnect.clone(),
                ) {
                    Some(stream) => streams.push(stream),
                    None => warn!("Service '{}' has subscriptions but cannot stream", svc.name),
                }
            }

            contexts.insert(svc.name.clone(), ctx);
            facades.push(facade);
        }

        let contexts: ExchangeContexts = Arc::new(contexts);
        let dispatcher = Dispatcher::new(pipeline, rx, contexts.clone(), metrics.clone());

        Ok(Self {
            contexts,
            facades,
            polls,
            streams,
            dispatcher: Some(dispatcher),
            handle: None,
            metrics,
        })
    }

    pub fn contexts(&self) -> &ExchangeContexts {
        &self.contexts
    }

    pub fn poll_adapters(&self) -> &[PollAdapter] {
        &self.polls
    }

    pub fn stream_adapters(&self) -> &[StreamAdapter] {
        &self.streams
    }

    /// Starts the dispatcher, then every adapter.
    pub fn start(&mut self) -> Result<(), AdapterError> {
        if let Some(dispatcher) = self.dispatcher.take() {
            self.handle = Some(dispatcher.spawn());
        }

        for facade in &self.facades {
            info!("Starting {} service", facade.context().name);
            RuntimeMetrics::incr(&self.metrics.services_active);
        }
        for poll in &mut self.polls {
            poll.run()?;
        }
        for stream in &mut self.streams {
            stream.run()?;
        }
        Ok(())
    }

    /// Stops adapters first so the dispatcher can drain what they
    /// delivered, then shuts the pipeline down.
    pub async fn shutdown(mut self) -> Result<Option<Pipeline>, AdapterError> {
        for poll in &mut self.polls {
            poll.shutdown().await?;
        }
        for stream in &mut self.streams {
            stream.shutdown().await?;
        }
        for facade in &self.facades {
            facade.shutdown();
            RuntimeMetrics::decr(&self.metrics.services_active);
        }

        match self.handle.take() {
            Some(handle) => handle.shutdown().await.map(Some),
            None => Ok(None),
        }
    }
}
