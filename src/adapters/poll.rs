use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

use crate::config::CallSpec;
use crate::error::AdapterError;
use crate::exchanges::ExchangeFacade;
use crate::metrics::RuntimeMetrics;
use crate::normalizer::Normalizer;
use crate::schema::{ApiResult, ErrorKind, ResultError, ResultSource};

use super::scheduler::Scheduler;
use super::{PollState, guarded, stop_requested};

/// Repeatedly invokes the configured calls of one service.
///
/// Lifecycle: `Idle → Running → Stopping → Stopped`.
///
/// Calls without a delay fire on every loop iteration. Calls with a
/// delay go through the scheduler and fire once per delay. Every
/// response is normalized and delivered to the service's sink.
pub struct PollAdapter {
    facade: Arc<dyn ExchangeFacade>,
    normalizer: Arc<Normalizer>,
    metrics: Arc<RuntimeMetrics>,
    state: watch::Sender<PollState>,
    stop: watch::Sender<bool>,
    iterations: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl PollAdapter {
    pub fn new(
        facade: Arc<dyn ExchangeFacade>,
        normalizer: Arc<Normalizer>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        Self {
            facade,
            normalizer,
            metrics,
            state: watch::Sender::new(PollState::Idle),
            stop: watch::Sender::new(false),
            iterations: Arc::new(AtomicU64::new(0)),
            task: None,
        }
    }

    pub fn state(&self) -> PollState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PollState> {
        self.state.subscribe()
    }

    /// Completed loop iterations.
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.facade.context().name
    }

    /// Starts the polling loop on its own task.
    pub fn run(&mut self) -> Result<(), AdapterError> {
        let state = self.state();
        if state != PollState::Idle {
            return Err(AdapterError::InvalidState {
                name: self.name().to_string(),
                action: "run",
                state: state.to_string(),
            });
        }

        let worker = PollLoop {
            facade: self.facade.clone(),
            normalizer: self.normalizer.clone(),
            metrics: self.metrics.clone(),
            stop: self.stop.subscribe(),
            iterations: self.iterations.clone(),
        };

        self.state.send_replace(PollState::Running);
        info!("[{}] poll adapter running", self.name());
        self.task = Some(tokio::spawn(worker.run()));
        Ok(())
    }

    /// Stops scheduling new iterations and waits for the current one.
    pub async fn shutdown(&mut self) -> Result<(), AdapterError> {
        match self.state() {
            PollState::Stopped => return Ok(()),
            PollState::Idle => {
                self.state.send_replace(PollState::Stopped);
                return Ok(());
            }
            _ => {}
        }

        self.state.send_replace(PollState::Stopping);
        self.stop.send_replace(true);

        let joined = match self.task.take() {
            Some(task) => task.await,
            None => Ok(()),
        };

        self.state.send_replace(PollState::Stopped);
        info!("[{}] poll adapter stopped", self.name());
        joined.map_err(AdapterError::from)
    }
}

/// State owned by the polling task.
struct PollLoop {
    facade: Arc<dyn ExchangeFacade>,
    normalizer: Arc<Normalizer>,
    metrics: Arc<RuntimeMetrics>,
    stop: watch::Receiver<bool>,
    iterations: Arc<AtomicU64>,
}

impl PollLoop {
    async fn run(mut self) {
        let ctx = self.facade.context().clone();
        let (immediate, delayed): (Vec<_>, Vec<_>) =
            ctx.calls.iter().partition(|(_, spec)| spec.delay().is_none());

        let mut scheduler = Scheduler::new();
        let start = Instant::now();
        for (name, spec) in &delayed {
            if let Some(delay) = spec.delay() {
                scheduler.enter(start + delay, spec.priority.unwrap_or(0), name);
            }
        }

        loop {
            if *self.stop.borrow() {
                break;
            }

            for (name, spec) in &immediate {
                self.dispatch(name, spec).await;
            }

            // Entries re-entered below wait for the next iteration, even
            // with a zero delay.
            let now = Instant::now();
            let mut due = Vec::new();
            while let Some(entry) = scheduler.pop_due(now) {
                due.push(entry);
            }
            for entry in due {
                let Some(spec) = ctx.calls.get(&entry.call) else {
                    continue;
                };
                self.dispatch(&entry.call, spec).await;
                if let Some(delay) = spec.delay() {
                    scheduler.enter(Instant::now() + delay, entry.priority, &entry.call);
                }
            }

            self.iterations.fetch_add(1, Ordering::Release);

            let deadline = scheduler.next_deadline();
            let overdue = deadline.is_some_and(|at| at <= Instant::now());
            if immediate.is_empty() && !overdue {
                // Only throttled calls: sleep until the next one is due.
                tokio::select! {
                    _ = async {
                        match deadline {
                            Some(at) => sleep_until(at).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {}
                    _ = stop_requested(&mut self.stop) => {}
                }
            } else {
                tokio::task::yield_now().await;
            }
        }

        debug!("[{}] poll loop finished", ctx.name);
    }

    /// Calls, normalizes and delivers one result. Never fails.
    async fn dispatch(&self, name: &str, spec: &CallSpec) {
        let ctx = self.facade.context();
        RuntimeMetrics::incr(&self.metrics.calls_dispatched);

        let source = ResultSource::call(name);
        let call = self.facade.call(name, spec.arguments.as_ref());

        let result = match guarded(&ctx.name, name, call).await {
            Ok(Ok(raw)) => match self.normalizer.normalize_call(name, &raw) {
                Ok(payload) => ApiResult::ok(&ctx.name, source, payload),
                Err(mismatch) => {
                    warn!("[{}] {mismatch}; raw payload: {}", ctx.name, mismatch.raw);
                    RuntimeMetrics::incr(&self.metrics.shape_mismatches);
                    ApiResult::err(&ctx.name, source, mismatch.into())
                }
            },
            Ok(Err(e)) => {
                error!(
                    "[{}] call '{name}' failed: {e}; raw payload: {}",
                    ctx.name,
                    e.raw().map(|r| r.to_string()).unwrap_or_default()
                );
                RuntimeMetrics::incr(&self.metrics.call_errors);
                ApiResult::err(&ctx.name, source, ResultError::from(&e))
            }
            Err(message) => {
                RuntimeMetrics::incr(&self.metrics.call_errors);
                ApiResult::err(
                    &ctx.name,
                    source,
                    ResultError {
                        kind: ErrorKind::Internal,
                        message,
                        raw: None,
                    },
                )
            }
        };

        ctx.deliver(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::{FakeFacade, context};
    use crate::error::TransportError;
    use crate::schema::{FieldType, Payload, RecordShape};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn ticker_normalizer() -> Arc<Normalizer> {
        let mut shapes = BTreeMap::new();
        shapes.insert(
            "ticker".to_string(),
            RecordShape::new(Some("data"), true).field("price", FieldType::Float),
        );
        Arc::new(Normalizer::new(shapes))
    }

    fn ticker_reply(_: &str) -> Result<serde_json::Value, TransportError> {
        Ok(json!({"data": [{"price": "100.5"}]}))
    }

    fn failing_reply(name: &str) -> Result<serde_json::Value, TransportError> {
        Err(TransportError::Status {
            url: format!("http://x/{name}"),
            status: 500,
            body: "boom".into(),
        })
    }

    fn panicking_reply(_: &str) -> Result<serde_json::Value, TransportError> {
        panic!("facade bug")
    }

    fn adapter(facade: Arc<FakeFacade>) -> PollAdapter {
        PollAdapter::new(facade, ticker_normalizer(), Arc::new(RuntimeMetrics::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn undelayed_calls_fire_every_iteration() {
        let (mut ctx, mut rx) = context("x");
        ctx.calls.insert("ticker".into(), CallSpec::default());
        ctx.calls.insert("balances".into(), CallSpec::default());
        let facade = Arc::new(FakeFacade::new(Arc::new(ctx), ticker_reply));
        let mut poll = adapter(facade.clone());

        poll.run().unwrap();
        while poll.iterations() < 5 {
            tokio::task::yield_now().await;
        }
        poll.shutdown().await.unwrap();

        let iterations = poll.iterations() as usize;
        assert!(iterations >= 5);
        assert_eq!(facade.count("ticker"), iterations);
        assert_eq!(facade.count("balances"), iterations);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name(), "balances");
        assert_eq!(first.service, "x");
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_calls_fire_once_per_delay() {
        let (mut ctx, _rx) = context("x");
        ctx.calls.insert(
            "ticker".into(),
            CallSpec {
                delay: Some(10.0),
                ..CallSpec::default()
            },
        );
        let facade = Arc::new(FakeFacade::new(Arc::new(ctx), ticker_reply));
        let mut poll = adapter(facade.clone());

        poll.run().unwrap();
        tokio::time::sleep(Duration::from_secs(35)).await;
        poll.shutdown().await.unwrap();

        assert_eq!(facade.count("ticker"), 3);
    }

    #[tokio::test]
    async fn zero_delay_call_still_stops() {
        let (mut ctx, _rx) = context("x");
        ctx.calls.insert(
            "ticker".into(),
            CallSpec {
                delay: Some(0.0),
                ..CallSpec::default()
            },
        );
        let facade = Arc::new(FakeFacade::new(Arc::new(ctx), ticker_reply));
        let mut poll = adapter(facade.clone());

        poll.run().unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while poll.iterations() < 3 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        tokio::time::timeout(Duration::from_secs(2), poll.shutdown())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(poll.state(), PollState::Stopped);
        assert_eq!(facade.count("ticker") as u64, poll.iterations());
    }

    #[tokio::test]
    async fn ticker_result_is_normalized() {
        let (mut ctx, mut rx) = context("x");
        ctx.calls.insert("ticker".into(), CallSpec::default());
        let facade = Arc::new(FakeFacade::new(Arc::new(ctx), ticker_reply));
        let mut poll = adapter(facade);

        poll.run().unwrap();
        let result = rx.recv().await.unwrap();
        poll.shutdown().await.unwrap();

        assert!(result.error().is_none());
        assert_eq!(
            result.value().unwrap(),
            &Payload::Many(vec![json!({"price": 100.5}).as_object().unwrap().clone()])
        );
    }

    #[tokio::test]
    async fn transport_failure_becomes_error_result_and_loop_continues() {
        let (mut ctx, mut rx) = context("x");
        ctx.calls.insert("ticker".into(), CallSpec::default());
        let facade = Arc::new(FakeFacade::new(Arc::new(ctx), failing_reply));
        let mut poll = adapter(facade.clone());

        poll.run().unwrap();
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        poll.shutdown().await.unwrap();

        for r in [first, second] {
            let err = r.error().unwrap();
            assert_eq!(err.kind, ErrorKind::Transport);
            assert!(err.message.contains("500"));
            assert!(r.value().is_none());
        }
    }

    #[tokio::test]
    async fn shape_mismatch_becomes_error_result() {
        fn bad(_: &str) -> Result<serde_json::Value, TransportError> {
            Ok(json!({"data": [{"price": "n/a"}]}))
        }
        let (mut ctx, mut rx) = context("x");
        ctx.calls.insert("ticker".into(), CallSpec::default());
        let facade = Arc::new(FakeFacade::new(Arc::new(ctx), bad));
        let mut poll = adapter(facade);

        poll.run().unwrap();
        let result = rx.recv().await.unwrap();
        poll.shutdown().await.unwrap();

        let err = result.error().unwrap();
        assert_eq!(err.kind, ErrorKind::ShapeMismatch);
        assert!(err.message.contains("index 0"));
        assert_eq!(err.raw, Some(json!({"data": [{"price": "n/a"}]})));
    }

    #[tokio::test]
    async fn facade_panic_does_not_kill_the_loop() {
        let (mut ctx, mut rx) = context("x");
        ctx.calls.insert("ticker".into(), CallSpec::default());
        let facade = Arc::new(FakeFacade::new(Arc::new(ctx), panicking_reply));
        let mut poll = adapter(facade.clone());

        poll.run().unwrap();
        let first = rx.recv().await.unwrap();
        let _second = rx.recv().await.unwrap();
        poll.shutdown().await.unwrap();

        assert_eq!(first.error().unwrap().kind, ErrorKind::Internal);
        assert_eq!(poll.state(), PollState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_call_finishes_iteration_then_stops() {
        let (mut ctx, mut rx) = context("x");
        ctx.calls.insert("ticker".into(), CallSpec::default());
        let mut fake = FakeFacade::new(Arc::new(ctx), ticker_reply);
        fake.latency = Some(Duration::from_secs(1));
        let facade = Arc::new(fake);
        let mut poll = adapter(facade.clone());

        poll.run().unwrap();
        facade.entered.notified().await;
        assert_eq!(poll.state(), PollState::Running);

        poll.shutdown().await.unwrap();

        assert_eq!(poll.state(), PollState::Stopped);
        assert_eq!(facade.count("ticker"), 1);
        assert_eq!(poll.iterations(), 1);
        assert!(rx.recv().await.unwrap().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lifecycle_transitions_are_enforced() {
        let (ctx, _rx) = context("x");
        let facade = Arc::new(FakeFacade::new(Arc::new(ctx), ticker_reply));
        let mut poll = adapter(facade);

        assert_eq!(poll.state(), PollState::Idle);
        poll.run().unwrap();
        assert!(matches!(poll.run(), Err(AdapterError::InvalidState { .. })));
        poll.shutdown().await.unwrap();
        assert_eq!(poll.state(), PollState::Stopped);
        assert!(poll.run().is_err());
        poll.shutdown().await.unwrap();
    }
}
