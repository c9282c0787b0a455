/// Adapter module
///
/// This module groups the runtime that drives facades:
/// - poll:      scheduled REST calls (one task per service)
/// - stream:    websocket connection lifecycle (one task per service)
/// - session:   transport-free websocket state machine
/// - scheduler: min-heap of throttled calls
///
/// Every adapter converts facade and normalizer failures into an
/// `ApiResult` carrying the error. Nothing raised by a facade ever
/// ends an adapter loop.
pub mod poll;
pub mod scheduler;
pub mod session;
pub mod stream;

use futures_util::FutureExt;
use log::error;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::watch;

pub use poll::PollAdapter;
pub use session::StreamSession;
pub use stream::StreamAdapter;

/// Poll adapter lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Stream adapter lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribed,
    /// Terminal: shut down, or reconnection disabled / exhausted.
    Closed,
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Resolves once the stop flag is raised (or its sender is gone).
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

/// Runs `fut`, turning a panic into an error message.
pub(crate) async fn guarded<F, T>(service: &str, what: &str, fut: F) -> Result<T, String>
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(v) => Ok(v),
        Err(panic) => {
            let msg = panic_message(panic.as_ref());
            error!("[{service}] {what} panicked: {msg}");
            Err(format!("{what} panicked: {msg}"))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
