//! Server metrics for observability

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Event stream metrics
    /// Currently open SSE connections
    pub active_event_streams: AtomicU64,
    pub total_event_streams: AtomicU64,

    // Terminal bridge metrics
    /// Currently open WebSocket terminal bridges
    pub active_bridges: AtomicU64,
    pub total_bridges: AtomicU64,
    /// Bytes relayed pty -> socket
    pub bridge_bytes_out: AtomicU64,

    /// Successful mutating API calls
    pub mutations: AtomicU64,

    // Error metrics
    /// Responses classified as upstream (collaborator) failures
    pub upstream_errors: AtomicU64,
    pub pty_errors: AtomicU64,

    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn event_stream_opened(&self) {
        self.active_event_streams.fetch_add(1, Ordering::Relaxed);
        self.total_event_streams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_stream_closed(&self) {
        self.active_event_streams.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn bridge_opened(&self) {
        self.active_bridges.fetch_add(1, Ordering::Relaxed);
        self.total_bridges.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bridge_closed(&self) {
        self.active_bridges.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn bridge_bytes(&self, n: usize) {
        self.bridge_bytes_out.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn mutation(&self) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pty_error(&self) {
        self.pty_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            event_streams: GaugeMetrics {
                active: self.active_event_streams.load(Ordering::Relaxed),
                total: self.total_event_streams.load(Ordering::Relaxed),
            },
            bridges: GaugeMetrics {
                active: self.active_bridges.load(Ordering::Relaxed),
                total: self.total_bridges.load(Ordering::Relaxed),
            },
            bridge_bytes_out: self.bridge_bytes_out.load(Ordering::Relaxed),
            mutations: self.mutations.load(Ordering::Relaxed),
            errors: ErrorMetrics {
                upstream: self.upstream_errors.load(Ordering::Relaxed),
                pty: self.pty_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub event_streams: GaugeMetrics,
    pub bridges: GaugeMetrics,
    pub bridge_bytes_out: u64,
    pub mutations: u64,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GaugeMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub upstream: u64,
    pub pty: u64,
}
