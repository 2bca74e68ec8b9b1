//! Externally consumed interfaces
//!
//! The core reports into these; collaborators (metrics exporter, control
//! server) implement them. All methods are sink-only: the core never
//! blocks on, or reads back from, a hook.

use std::sync::Arc;

/// Counter/gauge/histogram sink
pub trait Metrics: Send + Sync {
    /// Increment a counter by one
    fn incr(&self, name: &'static str, labels: &[(&'static str, &str)]);

    /// Set a gauge to an absolute value
    fn gauge(&self, name: &'static str, value: f64);

    /// Record one observation (latency, size)
    fn observe(&self, name: &'static str, value: f64);
}

/// Lifecycle events for a control-protocol server
pub trait ControlHook: Send + Sync {
    /// A circuit changed state
    fn circuit_event(&self, circuit_id: u32, state: &'static str);

    /// A stream changed state
    fn stream_event(&self, circuit_id: u32, stream_id: u16, state: &'static str);

    /// Bytes moved through the client (read, written)
    fn bw_event(&self, bytes_read: u64, bytes_written: u64);
}

/// Metrics sink that drops everything
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn incr(&self, _name: &'static str, _labels: &[(&'static str, &str)]) {}
    fn gauge(&self, _name: &'static str, _value: f64) {}
    fn observe(&self, _name: &'static str, _value: f64) {}
}

/// Control hook that drops everything
pub struct NoopControlHook;

impl ControlHook for NoopControlHook {
    fn circuit_event(&self, _circuit_id: u32, _state: &'static str) {}
    fn stream_event(&self, _circuit_id: u32, _stream_id: u16, _state: &'static str) {}
    fn bw_event(&self, _bytes_read: u64, _bytes_written: u64) {}
}

/// Shared handle type used throughout the client
pub type MetricsHandle = Arc<dyn Metrics>;

/// Shared control hook handle
pub type ControlHandle = Arc<dyn ControlHook>;

/// Default no-op metrics handle
pub fn noop_metrics() -> MetricsHandle {
    Arc::new(NoopMetrics)
}

/// Default no-op control handle
pub fn noop_control() -> ControlHandle {
    Arc::new(NoopControlHook)
}
