use std::sync::atomic::{AtomicUsize, Ordering};

/// Runtime counters shared by adapters and the dispatcher.
///
/// Lock-free and cheap to update. One instance is created in `main`
/// and handed to every component as `Arc<RuntimeMetrics>`.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    pub services_active: AtomicUsize,

    // Poll adapters
    pub calls_dispatched: AtomicUsize,
    pub call_errors: AtomicUsize,

    // Stream adapters
    pub ws_connections_active: AtomicUsize,
    pub ws_reconnects: AtomicUsize,
    pub stream_messages: AtomicUsize,
    pub subscriptions_sent: AtomicUsize,

    // Normalizer / pipeline
    pub shape_mismatches: AtomicUsize,
    pub pipeline_executions: AtomicUsize,
    /// Results waiting for the dispatcher (gauge)
    pub pipeline_queue_depth: AtomicUsize,
}

impl RuntimeMetrics {
    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr(counter: &AtomicUsize) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// One-line summary for the periodic reporter.
    pub fn summary(&self) -> String {
        format!(
            "svc={} calls={} call_err={} ws={} reconnects={} msgs={} subs={} shape_err={} pipeline={} queued={}",
            self.services_active.load(Ordering::Relaxed),
            self.calls_dispatched.load(Ordering::Relaxed),
            self.call_errors.load(Ordering::Relaxed),
            self.ws_connections_active.load(Ordering::Relaxed),
            self.ws_reconnects.load(Ordering::Relaxed),
            self.stream_messages.load(Ordering::Relaxed),
            self.subscriptions_sent.load(Ordering::Relaxed),
            self.shape_mismatches.load(Ordering::Relaxed),
            self.pipeline_executions.load(Ordering::Relaxed),
            self.pipeline_queue_depth.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decr_never_underflows() {
        let m = RuntimeMetrics::default();
        RuntimeMetrics::decr(&m.ws_connections_active);
        assert_eq!(m.ws_connections_active.load(Ordering::Relaxed), 0);
        RuntimeMetrics::incr(&m.ws_connections_active);
        assert!(m.summary().contains("ws=1"));
    }
}
