use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use rand::Rng;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Message, Utf8Bytes},
};

use crate::config::ReconnectPolicy;
use crate::error::{AdapterError, TransportError};
use crate::exchanges::ExchangeFacade;
use crate::metrics::RuntimeMetrics;
use crate::normalizer::Normalizer;
use crate::schema::{ApiResult, ResultError, ResultSource};

use super::session::StreamSession;
use super::{StreamState, stop_requested};

/// Persistent websocket connection for one service.
///
/// Lifecycle:
///   Disconnected → Connecting → Authenticating → Subscribed
///   connection lost → Disconnected → (backoff) → Connecting ...
///   shutdown, or reconnection disabled / exhausted → Closed
///
/// RESPONSIBILITIES:
/// - Socket lifecycle and reconnection policy
/// - Feeding text frames to the `StreamSession`
/// - Delivering normalized channel messages to the sink
/// - Delivering each failed connection to the sink as a transport error
///
/// NOT RESPONSIBLE FOR:
/// - Framing (facade's `StreamProtocol`)
/// - Record coercion (normalizer)
pub struct StreamAdapter {
    facade: Arc<dyn ExchangeFacade>,
    url: String,
    session: Option<StreamSession>,
    policy: ReconnectPolicy,
    metrics: Arc<RuntimeMetrics>,
    state: Arc<watch::Sender<StreamState>>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl StreamAdapter {
    /// `None` when the service has no websocket endpoint or its facade
    /// speaks no stream protocol.
    pub fn new(
        facade: Arc<dyn ExchangeFacade>,
        normalizer: Arc<Normalizer>,
        metrics: Arc<RuntimeMetrics>,
        policy: ReconnectPolicy,
    ) -> Option<Self> {
        let protocol = facade.stream_protocol()?;
        let ctx = facade.context().clone();
        let url = ctx.endpoints.websocket.clone()?;
        let session = StreamSession::new(ctx, protocol, normalizer, metrics.clone());

        Some(Self {
            facade,
            url,
            session: Some(session),
            policy,
            metrics,
            state: Arc::new(watch::Sender::new(StreamState::Disconnected)),
            stop: watch::Sender::new(false),
            task: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.facade.context().name
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    /// True only while authenticated and subscribed.
    pub fn is_connected(&self) -> bool {
        self.state() == StreamState::Subscribed
    }

    /// Spawns the connection task.
    pub fn run(&mut self) -> Result<(), AdapterError> {
        let session = match self.session.take() {
            Some(session) if self.state() == StreamState::Disconnected => session,
            other => {
                self.session = other;
                return Err(AdapterError::InvalidState {
                    name: self.name().to_string(),
                    action: "run",
                    state: self.state().to_string(),
                });
            }
        };

        let worker = StreamLoop {
            facade: self.facade.clone(),
            url: self.url.clone(),
            session,
            policy: self.policy.clone(),
            metrics: self.metrics.clone(),
            state: self.state.clone(),
            stop: self.stop.subscribe(),
            authenticated: false,
        };

        info!("[{}] stream adapter starting ({})", self.name(), self.url);
        self.task = Some(tokio::spawn(worker.run()));
        Ok(())
    }

    /// Closes the socket and waits for the task to finish.
    pub async fn shutdown(&mut self) -> Result<(), AdapterError> {
        self.stop.send_replace(true);

        let joined = match self.task.take() {
            Some(task) => task.await,
            None => Ok(()),
        };

        self.state.send_replace(StreamState::Closed);
        info!("[{}] stream adapter closed", self.name());
        joined.map_err(AdapterError::from)
    }
}

/// How one connection ended without a transport error.
enum Ended {
    Stopped,
    Dropped,
}

/// State owned by the connection task.
struct StreamLoop {
    facade: Arc<dyn ExchangeFacade>,
    url: String,
    session: StreamSession,
    policy: ReconnectPolicy,
    metrics: Arc<RuntimeMetrics>,
    state: Arc<watch::Sender<StreamState>>,
    stop: watch::Receiver<bool>,
    /// Whether the current connection got past authentication
    authenticated: bool,
}

impl StreamLoop {
    fn publish(&self, state: StreamState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    async fn run(mut self) {
        let name = self.facade.context().name.clone();
        let mut attempt: u32 = 0;

        loop {
            if *self.stop.borrow() {
                break;
            }

            self.publish(StreamState::Connecting);
            self.authenticated = false;

            let failure = match self.connect_once().await {
                Ok(Ended::Stopped) => break,
                Ok(Ended::Dropped) => {
                    warn!("[{name}] stream connection closed by server");
                    TransportError::Disconnected(self.url.clone())
                }
                Err(e) => {
                    error!("[{name}] stream error: {e}");
                    e
                }
            };
            self.report(&failure);

            self.session.disconnect();
            self.publish(StreamState::Disconnected);

            if self.authenticated {
                attempt = 0;
            }
            attempt += 1;

            if !self.policy.allows(attempt) {
                info!("[{name}] not reconnecting (attempt {attempt}, policy {:?})", self.policy);
                break;
            }

            let delay = jittered(self.policy.backoff(attempt));
            RuntimeMetrics::incr(&self.metrics.ws_reconnects);
            info!("[{name}] reconnecting in {delay:?} (attempt {attempt})");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_requested(&mut self.stop) => break,
            }
        }

        self.session.close();
        self.publish(StreamState::Closed);
        debug!("[{name}] stream loop finished");
    }

    /// Hands a failed connection to the pipeline as a transport error.
    fn report(&self, failure: &TransportError) {
        let ctx = self.facade.context();
        ctx.deliver(ApiResult::err(
            &ctx.name,
            ResultSource::stream(&self.url),
            ResultError::from(failure),
        ));
    }

    async fn connect_once(&mut self) -> Result<Ended, TransportError> {
        let (ws, _) = connect_async(self.url.as_str()).await?;

        RuntimeMetrics::incr(&self.metrics.ws_connections_active);
        let ended = self.drive(ws).await;
        RuntimeMetrics::decr(&self.metrics.ws_connections_active);

        ended
    }

    async fn drive(
        &mut self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> Result<Ended, TransportError> {
        let (mut write, mut read) = ws.split();

        for frame in self.session.open() {
            write.send(Message::Text(Utf8Bytes::from(frame))).await?;
        }

        loop {
            let msg = tokio::select! {
                _ = stop_requested(&mut self.stop) => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(Ended::Stopped);
                }
                msg = read.next() => msg,
            };

            match msg {
                Some(Ok(Message::Text(text))) => {
                    let handled =
                        catch_unwind(AssertUnwindSafe(|| self.session.handle_text(text.as_str())));
                    let step = match handled {
                        Ok(step) => step?,
                        Err(_) => {
                            error!(
                                "[{}] stream handler panicked on frame: {}",
                                self.facade.context().name,
                                text.as_str()
                            );
                            continue;
                        }
                    };

                    self.publish(self.session.state());
                    if step.connected {
                        self.authenticated = true;
                        self.facade.on_stream_connect();
                    }

                    for frame in step.frames {
                        write.send(Message::Text(Utf8Bytes::from(frame))).await?;
                    }

                    let ctx = self.facade.context();
                    for result in step.results {
                        ctx.deliver(result);
                    }
                }
                Some(Ok(Message::Ping(payload))) => write.send(Message::Pong(payload)).await?,
                Some(Ok(Message::Close(frame))) => {
                    debug!("[{}] close frame: {frame:?}", self.facade.context().name);
                    return Ok(Ended::Dropped);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => return Ok(Ended::Dropped),
            }
        }
    }
}

/// Adds up to 25% random jitter.
fn jittered(base: Duration) -> Duration {
    let spread = base.as_millis() as u64 / 4;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::rng().random_range(0..=spread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::testing::context;
    use crate::exchanges::CoinigyFacade;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_async;

    const WAIT: Duration = Duration::from_secs(5);

    async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(t))) => return serde_json::from_str(t.as_str()).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected frame: {other:?}"),
            }
        }
    }

    async fn send(ws: &mut WebSocketStream<TcpStream>, v: Value) {
        ws.send(Message::Text(Utf8Bytes::from(v.to_string()))).await.unwrap();
    }

    /// Speaks just enough SocketCluster for one authenticated subscription.
    async fn serve_once(listener: TcpListener) {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();

        let hs = next_json(&mut ws).await;
        assert_eq!(hs["event"], "#handshake");
        send(&mut ws, json!({"rid": hs["cid"], "data": {"id": "s1", "isAuthenticated": false}})).await;

        let auth = next_json(&mut ws).await;
        assert_eq!(auth["event"], "auth");
        assert_eq!(auth["data"]["apiSecret"], "secret");
        send(&mut ws, json!({"rid": auth["cid"], "data": null})).await;

        let sub = next_json(&mut ws).await;
        assert_eq!(sub["data"]["channel"], "TRADE-GDAX--BTC--USD");
        send(&mut ws, json!({"rid": sub["cid"]})).await;

        send(
            &mut ws,
            json!({
                "event": "#publish",
                "data": {
                    "channel": "TRADE-GDAX--BTC--USD",
                    "data": {
                        "exchange": "GDAX", "label": "BTC/USD", "type": "SELL",
                        "price": "4000.5", "quantity": "0.5", "total": "2000.25",
                        "timestamp": 1514764800
                    }
                }
            }),
        )
        .await;

        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    }

    fn adapter(
        url: String,
        policy: ReconnectPolicy,
    ) -> (StreamAdapter, tokio::sync::mpsc::UnboundedReceiver<crate::schema::ApiResult>, Arc<RuntimeMetrics>) {
        let (mut ctx, rx) = context("coinigy");
        ctx.endpoints.websocket = Some(url);
        ctx.subscriptions.insert("TRADE-GDAX--BTC--USD".into(), "trade".into());
        let facade = Arc::new(CoinigyFacade::new(Arc::new(ctx)).unwrap());
        let metrics = Arc::new(RuntimeMetrics::default());
        let adapter = StreamAdapter::new(facade, Arc::new(Normalizer::default()), metrics.clone(), policy)
            .expect("coinigy streams");
        (adapter, rx, metrics)
    }

    #[tokio::test]
    async fn authenticates_subscribes_and_delivers_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(serve_once(listener));

        let (mut stream, mut rx, metrics) = adapter(url, ReconnectPolicy::default());
        assert_eq!(stream.state(), StreamState::Disconnected);
        stream.run().unwrap();

        let result = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(stream.is_connected());
        assert_eq!(result.service, "coinigy");
        assert_eq!(result.name(), "TRADE-GDAX--BTC--USD");
        let records = result.value().unwrap().records();
        assert_eq!(records[0]["price"], json!(4000.5));
        assert_eq!(records[0]["timestamp"], json!("2018-01-01T00:00:00Z"));

        stream.shutdown().await.unwrap();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(!stream.is_connected());
        timeout(WAIT, server).await.unwrap().unwrap();
        assert_eq!(metrics.stream_messages.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.ws_connections_active.load(Ordering::Relaxed), 0);
    }

    /// Accepts TCP connections and drops them straight away.
    fn refuse_forever(listener: TcpListener, accepted: Arc<AtomicUsize>) {
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                drop(tcp);
            }
        });
    }

    #[tokio::test]
    async fn closes_after_first_failure_when_reconnect_disabled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        refuse_forever(listener, accepted.clone());

        let policy = ReconnectPolicy {
            enabled: false,
            ..ReconnectPolicy::default()
        };
        let (mut stream, mut rx, metrics) = adapter(url.clone(), policy);
        let mut state = stream.watch_state();
        stream.run().unwrap();

        timeout(WAIT, state.wait_for(|s| *s == StreamState::Closed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.ws_reconnects.load(Ordering::Relaxed), 0);
        stream.shutdown().await.unwrap();

        let failed = rx.try_recv().unwrap();
        assert_eq!(failed.service, "coinigy");
        assert_eq!(failed.source, ResultSource::stream(&url));
        assert_eq!(failed.error().unwrap().kind, crate::schema::ErrorKind::Transport);
        assert!(failed.value().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn every_failed_connection_reaches_the_sink() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        refuse_forever(listener, accepted.clone());

        let policy = ReconnectPolicy {
            enabled: true,
            delay_ms: 5,
            max_delay_ms: 20,
            max_attempts: Some(2),
        };
        let (mut stream, mut rx, _metrics) = adapter(url, policy);
        let mut state = stream.watch_state();
        stream.run().unwrap();

        timeout(WAIT, state.wait_for(|s| *s == StreamState::Closed))
            .await
            .unwrap()
            .unwrap();
        stream.shutdown().await.unwrap();

        let mut failures = 0;
        while let Ok(result) = rx.try_recv() {
            assert!(!result.error().unwrap().message.is_empty());
            failures += 1;
        }
        assert_eq!(failures, accepted.load(Ordering::SeqCst));
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn server_close_is_reported_as_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let _ = next_json(&mut ws).await;
            ws.close(None).await.unwrap();
            while ws.next().await.is_some() {}
        });

        let policy = ReconnectPolicy {
            enabled: false,
            ..ReconnectPolicy::default()
        };
        let (mut stream, mut rx, _metrics) = adapter(url.clone(), policy);
        stream.run().unwrap();

        let failed = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        let err = failed.error().unwrap();
        assert_eq!(err.kind, crate::schema::ErrorKind::Transport);
        assert!(err.message.contains("closed by server"));
        assert!(err.message.contains(&url));
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn retries_until_max_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        refuse_forever(listener, accepted.clone());

        let policy = ReconnectPolicy {
            enabled: true,
            delay_ms: 5,
            max_delay_ms: 20,
            max_attempts: Some(3),
        };
        let (mut stream, _rx, metrics) = adapter(url, policy);
        let mut state = stream.watch_state();
        stream.run().unwrap();

        timeout(WAIT, state.wait_for(|s| *s == StreamState::Closed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.ws_reconnects.load(Ordering::Relaxed), 2);
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn no_adapter_without_stream_protocol_or_endpoint() {
        let (ctx, _rx) = context("generic");
        let facade = Arc::new(crate::exchanges::GenericFacade::new(Arc::new(ctx)).unwrap());
        let metrics = Arc::new(RuntimeMetrics::default());
        assert!(
            StreamAdapter::new(facade, Arc::new(Normalizer::default()), metrics.clone(), ReconnectPolicy::default())
                .is_none()
        );

        let (ctx, _rx) = context("coinigy");
        let facade = Arc::new(CoinigyFacade::new(Arc::new(ctx)).unwrap());
        assert!(
            StreamAdapter::new(facade, Arc::new(Normalizer::default()), metrics, ReconnectPolicy::default())
                .is_none()
        );
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let d = jittered(base);
            assert!(d >= base && d <= Duration::from_millis(1250));
        }
        assert_eq!(jittered(Duration::from_millis(2)), Duration::from_millis(2));
    }
}
