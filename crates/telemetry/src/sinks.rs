//! Defines abstract traits for metrics reporting, decoupling core logic from the backend.

use once_cell::sync::OnceCell;

// --- Static Sink Access ---

/// A no-op sink for use in tests or when telemetry is disabled.
#[derive(Debug, Clone, Copy)]
pub struct NopSink;

/// A lazily-initialized static reference to the global `MetricsSink` implementation.
pub static SINK: OnceCell<&'static dyn MetricsSink> = OnceCell::new();
static NOP_SINK: NopSink = NopSink;

/// Returns a static reference to the configured bridge metrics sink.
/// If no sink has been initialized, it returns a no-op sink.
pub fn bridge_metrics() -> &'static dyn BridgeMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

/// Returns a static reference to the configured intake metrics sink.
pub fn intake_metrics() -> &'static dyn IntakeMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

/// Returns a static reference to the configured orchestrator metrics sink.
pub fn orchestrator_metrics() -> &'static dyn OrchestratorMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

// --- Trait Definitions ---

/// A sink for metrics emitted by the bridge submission path.
pub trait BridgeMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments submissions, labeled by outcome code (`ok`, error code).
    fn inc_submissions(&self, outcome: &str);
    /// Increments the counter for sequence-conflict retries.
    fn inc_sequence_retries(&self);
    /// Observes the latency of one reconciled submission.
    fn observe_submit_duration(&self, duration_secs: f64);
}
impl BridgeMetricsSink for NopSink {
    fn inc_submissions(&self, _outcome: &str) {}
    fn inc_sequence_retries(&self) {}
    fn observe_submit_duration(&self, _duration_secs: f64) {}
}

/// A sink for metrics emitted by the rejection/confirmation intake.
pub trait IntakeMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments rejections persisted for the first time.
    fn inc_rejections_indexed(&self);
    /// Increments webhook deliveries deduplicated by `updateHash`.
    fn inc_duplicate_rejections(&self);
    /// Increments snapshot confirmations applied.
    fn inc_confirmations(&self);
    /// Increments snapshots swept to `ORPHANED`.
    fn inc_orphaned(&self, count: u64);
    /// Increments webhook payloads rejected at the door (bad signature/shape).
    fn inc_webhook_rejected(&self);
}
impl IntakeMetricsSink for NopSink {
    fn inc_rejections_indexed(&self) {}
    fn inc_duplicate_rejections(&self) {}
    fn inc_confirmations(&self) {}
    fn inc_orphaned(&self, _count: u64) {}
    fn inc_webhook_rejected(&self) {}
}

/// A sink for metrics emitted by the orchestrator's tick loop.
pub trait OrchestratorMetricsSink: Send + Sync + std::fmt::Debug {
    /// Observes the duration of a generation tick.
    fn observe_tick_duration(&self, duration_secs: f64);
    /// Sets the gauge for the live population size.
    fn set_population(&self, count: u64);
    /// Sets the gauge for in-flight (non-terminal) fibers.
    fn set_active_fibers(&self, count: u64);
    /// Increments agent births.
    fn inc_births(&self, count: u64);
    /// Increments agent deaths.
    fn inc_deaths(&self, count: u64);
}
impl OrchestratorMetricsSink for NopSink {
    fn observe_tick_duration(&self, _duration_secs: f64) {}
    fn set_population(&self, _count: u64) {}
    fn set_active_fibers(&self, _count: u64) {}
    fn inc_births(&self, _count: u64) {}
    fn inc_deaths(&self, _count: u64) {}
}

/// The union of all sinks, implemented by the installed backend.
pub trait MetricsSink:
    BridgeMetricsSink + IntakeMetricsSink + OrchestratorMetricsSink + Send + Sync
{
}

impl MetricsSink for NopSink {}
