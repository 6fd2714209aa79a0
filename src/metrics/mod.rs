// src/metrics/mod.rs
// Prometheus metrics for the pulsechat backend.

use axum::{http::StatusCode, response::IntoResponse};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;
use tracing::info;

/// Global Prometheus handle for metrics rendering
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Live SSE stream count, tracked separately from the gauge so concurrent
/// connect/disconnect calls read back a consistent value.
static ACTIVE_SSE_STREAMS: AtomicI64 = AtomicI64::new(0);

/// Initialize the Prometheus metrics exporter
pub fn init_metrics() {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    PROMETHEUS_HANDLE
        .set(handle)
        .expect("Prometheus handle already initialized");

    info!("Prometheus metrics initialized");
}

/// GET /metrics - Prometheus metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Metrics not initialized".to_string(),
        ),
    }
}

/// Record one ingest attempt on a chat surface (`global`, `trivia`,
/// `private`, `dm`, `group`), tagged with its outcome.
pub fn record_message_ingest(surface: &str, outcome: &str) {
    counter!("pulsechat_messages_ingested_total", "surface" => surface.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record ingest latency for a surface (sanitize -> publish, end to end).
pub fn record_ingest_duration(surface: &str, duration_seconds: f64) {
    histogram!("pulsechat_ingest_duration_seconds", "surface" => surface.to_string()).record(duration_seconds);
}

/// Record a rate-limit tier decision.
pub fn record_rate_limit(surface: &str, allowed: bool) {
    let outcome = if allowed { "allowed" } else { "denied" };
    counter!("pulsechat_rate_limit_checks_total", "surface" => surface.to_string(), "outcome" => outcome).increment(1);
}

/// Record a push-notification dispatch batch.
pub fn record_push_batch(show_as_in_app: bool, device_count: u64) {
    let channel = if show_as_in_app { "in_app" } else { "system" };
    counter!("pulsechat_push_batches_total", "channel" => channel).increment(1);
    counter!("pulsechat_push_devices_total", "channel" => channel).increment(device_count);
}

/// Track an SSE stream opening.
pub fn sse_stream_opened() {
    let count = ACTIVE_SSE_STREAMS.fetch_add(1, Ordering::SeqCst) + 1;
    gauge!("pulsechat_active_sse_streams").set(count as f64);
}

/// Track an SSE stream closing.
pub fn sse_stream_closed() {
    let count = ACTIVE_SSE_STREAMS.fetch_sub(1, Ordering::SeqCst) - 1;
    gauge!("pulsechat_active_sse_streams").set(count as f64);
}

/// Record an SSE heartbeat tick, tagged with whether the relay connection
/// was considered lagging at the time.
pub fn record_sse_heartbeat(relay_lag: bool) {
    counter!("pulsechat_sse_heartbeats_total", "relay_lag" => relay_lag.to_string()).increment(1);
}

/// Record a group epoch bump.
pub fn record_epoch_bump(reason: &str) {
    counter!("pulsechat_group_epoch_bumps_total", "reason" => reason.to_string()).increment(1);
}

/// Helper for timing a single ingest call; records both the counter and the
/// duration histogram when dropped.
pub struct IngestTimer {
    start: Instant,
    surface: String,
    outcome: &'static str,
}

impl IngestTimer {
    pub fn new(surface: &str) -> Self {
        Self { start: Instant::now(), surface: surface.to_string(), outcome: "ok" }
    }

    pub fn mark_error(&mut self) {
        self.outcome = "error";
    }
}

impl Drop for IngestTimer {
    fn drop(&mut self) {
        record_message_ingest(&self.surface, self.outcome);
        record_ingest_duration(&self.surface, self.start.elapsed().as_secs_f64());
    }
}
