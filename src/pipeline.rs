//! Middleware pipeline.
//!
//! Strategies are chained in configuration order. Every result
//! delivered by an adapter becomes a `PipelineContext` that is folded
//! left-to-right through the chain.
//!
//! Delivery is serialized: adapters push into a `ResultSink`, a single
//! dispatcher task drains it in FIFO order and runs the pipeline for
//! one result at a time. Strategies therefore never run concurrently.

use log::{debug, error, info, warn};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::context::{ExchangeContexts, PipelineContext};
use crate::error::AdapterError;
use crate::metrics::RuntimeMetrics;
use crate::schema::ApiResult;

/// One stage of the middleware chain.
///
/// `bind` reads the latest result and may add keys under its own
/// namespace in `ctx.strategy_mut()`. Results carry their error
/// explicitly: check `ctx.result().error()` before using `value()`.
pub trait Strategy: Send {
    fn name(&self) -> &str;

    fn bind(&mut self, ctx: PipelineContext) -> PipelineContext;

    /// Fires once, before the first message.
    fn on_start(&mut self) {}

    fn on_message_before(&mut self, _ctx: &PipelineContext) {}

    fn on_message_after(&mut self, _ctx: &PipelineContext) {}

    fn on_shutdown_before(&mut self) {}

    fn on_shutdown_after(&mut self) {}
}

#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Strategy>>,
    started: bool,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Strategy>>) -> Self {
        Self {
            stages,
            started: false,
        }
    }

    pub fn push(&mut self, stage: Box<dyn Strategy>) {
        self.stages.push(stage);
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Fires `on_start` on every stage. Subsequent calls are no-ops.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        for stage in &mut self.stages {
            stage.on_start();
        }
        self.started = true;
    }

    pub fn execute(&mut self, mut ctx: PipelineContext) -> PipelineContext {
        for stage in &mut self.stages {
            stage.on_message_before(&ctx);
            ctx = stage.bind(ctx);
            stage.on_message_after(&ctx);
        }
        ctx
    }

    pub fn shutdown(&mut self) {
        for stage in &mut self.stages {
            debug!("shutting down strategy {}", stage.name());
            stage.on_shutdown_before();
            stage.on_shutdown_after();
        }
    }
}

// ------------------------------------------------------------
// ResultSink
// ------------------------------------------------------------
//
// The callback handed to every adapter. Cloning is cheap; all clones
// feed the same dispatcher queue.
//
#[derive(Debug, Clone)]
pub struct ResultSink {
    tx: mpsc::UnboundedSender<ApiResult>,
}

impl ResultSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ApiResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn deliver(&self, result: ApiResult) {
        if let Err(e) = self.tx.send(result) {
            warn!(
                "pipeline is gone, dropping result for '{}' from {}",
                e.0.name(),
                e.0.service
            );
        }
    }
}

// ------------------------------------------------------------
// Dispatcher
// ------------------------------------------------------------

/// Queue depth above which the dispatcher warns that strategies fall behind.
pub const QUEUE_WARN_DEPTH: usize = 1_000;

pub struct Dispatcher {
    pipeline: Pipeline,
    rx: mpsc::UnboundedReceiver<ApiResult>,
    exchanges: ExchangeContexts,
    metrics: Arc<RuntimeMetrics>,
    /// Set while the backlog is above `QUEUE_WARN_DEPTH`
    lagging: bool,
}

/// Handle to a running dispatcher task.
pub struct DispatcherHandle {
    stop: oneshot::Sender<()>,
    join: JoinHandle<Pipeline>,
}

impl Dispatcher {
    pub fn new(
        pipeline: Pipeline,
        rx: mpsc::UnboundedReceiver<ApiResult>,
        exchanges: ExchangeContexts,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            pipeline,
            rx,
            exchanges,
            metrics,
            lagging: false,
        }
    }

    pub fn spawn(self) -> DispatcherHandle {
        let (stop, stopped) = oneshot::channel();
        let join = tokio::spawn(self.run(stopped));
        DispatcherHandle { stop, join }
    }

    /// Runs until `stop` fires (or every sink is dropped), then drains the
    /// queue and shuts the pipeline down.
    pub async fn run(mut self, mut stop: oneshot::Receiver<()>) -> Pipeline {
        self.pipeline.start();
        info!("pipeline started: [{}]", self.pipeline.names().join(", "));

        loop {
            tokio::select! {
                biased;
                maybe = self.rx.recv() => match maybe {
                    Some(result) => self.dispatch(result),
                    None => break,
                },
                _ = &mut stop => {
                    while let Ok(result) = self.rx.try_recv() {
                        self.dispatch(result);
                    }
                    break;
                }
            }
        }

        self.metrics.pipeline_queue_depth.store(0, Ordering::Relaxed);
        self.pipeline.shutdown();
        info!("pipeline stopped");
        self.pipeline
    }

    /// Publishes the backlog left behind the result being dispatched and
    /// warns once each time it climbs past `QUEUE_WARN_DEPTH`.
    fn record_depth(&mut self) {
        let depth = self.rx.len();
        self.metrics.pipeline_queue_depth.store(depth, Ordering::Relaxed);
        if depth > QUEUE_WARN_DEPTH && !self.lagging {
            warn!("pipeline is falling behind: {depth} results queued");
            self.lagging = true;
        } else if depth <= QUEUE_WARN_DEPTH / 2 && self.lagging {
            info!("pipeline caught up: {depth} results queued");
            self.lagging = false;
        }
    }

    /// A panicking stage loses that one message, not the dispatcher.
    fn dispatch(&mut self, result: ApiResult) {
        self.record_depth();
        let label = format!("{}/{}", result.service, result.name());
        let ctx = PipelineContext::new(result, self.exchanges.clone());
        let pipeline = &mut self.pipeline;
        if catch_unwind(AssertUnwindSafe(|| pipeline.execute(ctx))).is_err() {
            error!("pipeline panicked while handling {label}");
        }
        RuntimeMetrics::incr(&self.metrics.pipeline_executions);
    }
}

impl DispatcherHandle {
    /// Stops the dispatcher after the queued results and returns the pipeline.
    pub async fn shutdown(self) -> Result<Pipeline, AdapterError> {
        let _ = self.stop.send(());
        Ok(self.join.await?)
    }
}
