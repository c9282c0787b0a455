use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::channels;
use crate::context::ExchangeContext;
use crate::error::TransportError;
use crate::exchanges::{StreamEvent, StreamProtocol};
use crate::metrics::RuntimeMetrics;
use crate::normalizer::Normalizer;
use crate::schema::{ApiResult, ErrorKind, ResultError, ResultSource};

use super::StreamState;

/// What an outstanding request id was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Pending {
    Handshake,
    Auth,
    Subscribe(String),
    Catalogue,
}

/// Output of one inbound frame.
#[derive(Debug, Default)]
pub struct Step {
    /// Frames to write back, in order.
    pub frames: Vec<String>,
    /// Normalized channel messages for the pipeline.
    pub results: Vec<ApiResult>,
    /// Set on the frame that completed authentication.
    pub connected: bool,
}

// ------------------------------------------------------------
// StreamSession
// ------------------------------------------------------------
//
// Transport-free websocket state machine for one service:
//
//   open()         → handshake frame           (Connecting)
//   handshake ack  → auth frame                (Authenticating)
//   auth ack       → one subscribe per channel (Subscribed)
//   catalogue ack  → subscribe discovered channels
//   publish        → normalized ApiResult
//
// The stream adapter owns the socket and feeds text frames in.
// Channel → response type survives reconnects; the set of live
// subscriptions does not.
//
pub struct StreamSession {
    ctx: Arc<ExchangeContext>,
    protocol: Arc<dyn StreamProtocol>,
    normalizer: Arc<Normalizer>,
    metrics: Arc<RuntimeMetrics>,
    state: StreamState,
    next_cid: u64,
    pending: HashMap<u64, Pending>,
    /// Channel name → response type (configured and discovered)
    channels: BTreeMap<String, String>,
    /// Subscriptions acknowledged on the current connection
    subscribed: BTreeSet<String>,
}

impl StreamSession {
    pub fn new(
        ctx: Arc<ExchangeContext>,
        protocol: Arc<dyn StreamProtocol>,
        normalizer: Arc<Normalizer>,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        let channels = ctx.subscriptions.clone();
        Self {
            ctx,
            protocol,
            normalizer,
            metrics,
            state: StreamState::Disconnected,
            next_cid: 0,
            pending: HashMap::new(),
            channels,
            subscribed: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Known channels and their response types.
    pub fn channels(&self) -> &BTreeMap<String, String> {
        &self.channels
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscribed.contains(channel)
    }

    fn cid(&mut self, purpose: Pending) -> u64 {
        self.next_cid += 1;
        self.pending.insert(self.next_cid, purpose);
        self.next_cid
    }

    /// Starts a fresh connection. Returns the handshake frame.
    pub fn open(&mut self) -> Vec<String> {
        self.reset();
        self.state = StreamState::Connecting;
        self.ctx.with_shared(|s| {
            for name in self.channels.keys() {
                s.channels.entry(name.clone()).or_insert(false);
            }
        });
        let cid = self.cid(Pending::Handshake);
        vec![self.protocol.handshake(cid)]
    }

    /// Connection lost: every subscription is void.
    pub fn disconnect(&mut self) {
        self.reset();
        self.state = StreamState::Disconnected;
    }

    /// Terminal state.
    pub fn close(&mut self) {
        self.reset();
        self.state = StreamState::Closed;
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.subscribed.clear();
        self.ctx.with_shared(|s| s.channels.values_mut().for_each(|live| *live = false));
    }

    /// Consumes one inbound text frame.
    ///
    /// Errors are fatal for the connection (handshake or auth rejected);
    /// everything else, including per-message shape mismatches, is
    /// reported through `Step::results`.
    pub fn handle_text(&mut self, raw: &str) -> Result<Step, TransportError> {
        let mut step = Step::default();

        match self.protocol.decode(raw) {
            StreamEvent::Ping(pong) => step.frames.push(pong),
            StreamEvent::Ignore => debug!("[{}] ignoring frame: {raw}", self.ctx.name),
            StreamEvent::Message { channel, data } => {
                step.results.push(self.on_message(&channel, &data));
            }
            StreamEvent::Reply { cid, error, data } => match self.pending.remove(&cid) {
                Some(Pending::Handshake) => {
                    if let Some(e) = error {
                        return Err(TransportError::AuthRejected(format!("handshake failed: {e}")));
                    }
                    if self.protocol.requires_auth(&data) {
                        self.state = StreamState::Authenticating;
                        let cid = self.cid(Pending::Auth);
                        step.frames.push(self.protocol.auth(&self.ctx.credentials, cid));
                    } else {
                        self.on_authenticated(&mut step);
                    }
                }
                Some(Pending::Auth) => {
                    if let Some(e) = error {
                        return Err(TransportError::AuthRejected(e));
                    }
                    self.on_authenticated(&mut step);
                }
                Some(Pending::Subscribe(channel)) => match error {
                    Some(e) => {
                        warn!("[{}] subscription to {channel} rejected: {e}", self.ctx.name);
                        step.results.push(self.rejected(&channel, e));
                    }
                    None => {
                        debug!("[{}] subscribed to {channel}", self.ctx.name);
                        self.ctx.with_shared(|s| {
                            s.channels.insert(channel.clone(), true);
                        });
                        self.subscribed.insert(channel);
                    }
                },
                Some(Pending::Catalogue) => match error {
                    Some(e) => warn!("[{}] channel catalogue request failed: {e}", self.ctx.name),
                    None => self.on_catalogue(&data, &mut step),
                },
                None => debug!("[{}] reply for unknown request {cid}", self.ctx.name),
            },
        }

        Ok(step)
    }

    fn on_authenticated(&mut self, step: &mut Step) {
        self.state = StreamState::Subscribed;
        step.connected = true;
        info!(
            "[{}] stream authenticated, subscribing {} channel(s)",
            self.ctx.name,
            self.channels.len()
        );

        let names: Vec<String> = self.channels.keys().cloned().collect();
        for name in names {
            self.subscribe(&name, step);
        }

        if self.ctx.discover_channels {
            let cid = self.cid(Pending::Catalogue);
            match self.protocol.catalogue_request(cid) {
                Some(frame) => step.frames.push(frame),
                None => {
                    self.pending.remove(&cid);
                    debug!("[{}] protocol has no channel catalogue", self.ctx.name);
                }
            }
        }
    }

    /// Subscribes once per connection.
    fn subscribe(&mut self, channel: &str, step: &mut Step) {
        let in_flight = self
            .pending
            .values()
            .any(|p| matches!(p, Pending::Subscribe(c) if c == channel));
        if in_flight || self.subscribed.contains(channel) {
            return;
        }
        let cid = self.cid(Pending::Subscribe(channel.to_string()));
        step.frames.push(self.protocol.subscribe(channel, cid));
        RuntimeMetrics::incr(&self.metrics.subscriptions_sent);
    }

    fn on_catalogue(&mut self, data: &serde_json::Value, step: &mut Step) {
        let catalogue = self.protocol.catalogue_channels(data);
        let fresh = self.ctx.with_shared(|s| {
            s.catalogue = catalogue.clone();
            channels::discover(&catalogue, &self.ctx.exchanges, &self.ctx.currencies, &mut s.channels)
        });

        info!(
            "[{}] catalogue lists {} channel(s), {} new",
            self.ctx.name,
            catalogue.len(),
            fresh.len()
        );

        for (desc, response_type) in fresh {
            let name = desc.to_string();
            self.channels.insert(name.clone(), response_type.to_string());
            self.subscribe(&name, step);
        }
    }

    fn on_message(&self, channel: &str, data: &serde_json::Value) -> ApiResult {
        RuntimeMetrics::incr(&self.metrics.stream_messages);
        let response_type = self
            .channels
            .get(channel)
            .map(String::as_str)
            .unwrap_or("default");
        let source = ResultSource::channel(channel, response_type);

        match self.normalizer.normalize_channel(channel, response_type, data) {
            Ok(payload) => ApiResult::ok(&self.ctx.name, source, payload),
            Err(mismatch) => {
                warn!("[{}] {mismatch}; raw payload: {}", self.ctx.name, mismatch.raw);
                RuntimeMetrics::incr(&self.metrics.shape_mismatches);
                ApiResult::err(&self.ctx.name, source, mismatch.into())
            }
        }
    }

    fn rejected(&self, channel: &str, message: String) -> ApiResult {
        let response_type = self
            .channels
            .get(channel)
            .map(String::as_str)
            .unwrap_or("default");
        ApiResult::err(
            &self.ctx.name,
            ResultSource::channel(channel, response_type),
            ResultError {
                kind: ErrorKind::Transport,
                message: format!("subscription rejected: {message}"),
                raw: None,
            },
        )
    }
}
