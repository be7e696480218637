//! A concrete implementation of the metrics sinks using the Prometheus crate.

use crate::sinks::*;
use once_cell::sync::OnceCell;
use prometheus::{
    exponential_buckets, register_gauge, register_histogram, register_int_counter,
    register_int_counter_vec, Gauge, Histogram, IntCounter, IntCounterVec,
};

// --- Metric Statics ---
// OnceCell holds the collectors; `install` initializes them exactly once.

static BRIDGE_SUBMISSIONS_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static BRIDGE_SEQUENCE_RETRIES_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static BRIDGE_SUBMIT_DURATION_SECONDS: OnceCell<Histogram> = OnceCell::new();
static INTAKE_REJECTIONS_INDEXED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static INTAKE_DUPLICATE_REJECTIONS_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static INTAKE_CONFIRMATIONS_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static INTAKE_ORPHANED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static INTAKE_WEBHOOKS_REJECTED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static ORCH_TICK_DURATION_SECONDS: OnceCell<Histogram> = OnceCell::new();
static ORCH_POPULATION: OnceCell<Gauge> = OnceCell::new();
static ORCH_ACTIVE_FIBERS: OnceCell<Gauge> = OnceCell::new();
static ORCH_BIRTHS_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static ORCH_DEATHS_TOTAL: OnceCell<IntCounter> = OnceCell::new();

/// The Prometheus-backed sink.
#[derive(Debug, Clone, Copy)]
pub struct PrometheusSink;

/// Helper macro to reduce boilerplate for getting a metric from OnceCell.
/// This will panic if `install()` has not been called, which is intentional
/// as it indicates a critical application setup error.
macro_rules! get_metric {
    ($metric:ident) => {
        $metric
            .get()
            .expect("Prometheus sink not initialized. Call telemetry::prometheus::install() first.")
    };
}

impl BridgeMetricsSink for PrometheusSink {
    fn inc_submissions(&self, outcome: &str) {
        get_metric!(BRIDGE_SUBMISSIONS_TOTAL)
            .with_label_values(&[outcome])
            .inc();
    }
    fn inc_sequence_retries(&self) {
        get_metric!(BRIDGE_SEQUENCE_RETRIES_TOTAL).inc();
    }
    fn observe_submit_duration(&self, duration_secs: f64) {
        get_metric!(BRIDGE_SUBMIT_DURATION_SECONDS).observe(duration_secs);
    }
}

impl IntakeMetricsSink for PrometheusSink {
    fn inc_rejections_indexed(&self) {
        get_metric!(INTAKE_REJECTIONS_INDEXED_TOTAL).inc();
    }
    fn inc_duplicate_rejections(&self) {
        get_metric!(INTAKE_DUPLICATE_REJECTIONS_TOTAL).inc();
    }
    fn inc_confirmations(&self) {
        get_metric!(INTAKE_CONFIRMATIONS_TOTAL).inc();
    }
    fn inc_orphaned(&self, count: u64) {
        get_metric!(INTAKE_ORPHANED_TOTAL).inc_by(count);
    }
    fn inc_webhook_rejected(&self) {
        get_metric!(INTAKE_WEBHOOKS_REJECTED_TOTAL).inc();
    }
}

impl OrchestratorMetricsSink for PrometheusSink {
    fn observe_tick_duration(&self, duration_secs: f64) {
        get_metric!(ORCH_TICK_DURATION_SECONDS).observe(duration_secs);
    }
    fn set_population(&self, count: u64) {
        get_metric!(ORCH_POPULATION).set(count as f64);
    }
    fn set_active_fibers(&self, count: u64) {
        get_metric!(ORCH_ACTIVE_FIBERS).set(count as f64);
    }
    fn inc_births(&self, count: u64) {
        get_metric!(ORCH_BIRTHS_TOTAL).inc_by(count);
    }
    fn inc_deaths(&self, count: u64) {
        get_metric!(ORCH_DEATHS_TOTAL).inc_by(count);
    }
}

impl MetricsSink for PrometheusSink {}

static INSTALLED_SINK: PrometheusSink = PrometheusSink;

/// Registers all collectors and installs the Prometheus sink globally.
/// Safe to call more than once; later calls are no-ops.
pub fn install() -> Result<(), prometheus::Error> {
    let _ = BRIDGE_SUBMISSIONS_TOTAL.set(register_int_counter_vec!(
        "loom_bridge_submissions_total",
        "Total bridge submissions, by outcome code",
        &["outcome"]
    )?);
    let _ = BRIDGE_SEQUENCE_RETRIES_TOTAL.set(register_int_counter!(
        "loom_bridge_sequence_retries_total",
        "Total sequence-conflict retries performed by the reconciler"
    )?);
    let _ = BRIDGE_SUBMIT_DURATION_SECONDS.set(register_histogram!(
        "loom_bridge_submit_duration_seconds",
        "Latency of reconciled submissions (seconds)",
        exponential_buckets(0.001, 2.0, 15)?
    )?);
    let _ = INTAKE_REJECTIONS_INDEXED_TOTAL.set(register_int_counter!(
        "loom_intake_rejections_indexed_total",
        "Rejections persisted for the first time"
    )?);
    let _ = INTAKE_DUPLICATE_REJECTIONS_TOTAL.set(register_int_counter!(
        "loom_intake_duplicate_rejections_total",
        "Webhook deliveries deduplicated by updateHash"
    )?);
    let _ = INTAKE_CONFIRMATIONS_TOTAL.set(register_int_counter!(
        "loom_intake_confirmations_total",
        "Snapshot confirmations applied"
    )?);
    let _ = INTAKE_ORPHANED_TOTAL.set(register_int_counter!(
        "loom_intake_orphaned_total",
        "Snapshots swept to ORPHANED"
    )?);
    let _ = INTAKE_WEBHOOKS_REJECTED_TOTAL.set(register_int_counter!(
        "loom_intake_webhooks_rejected_total",
        "Webhook payloads rejected at the door"
    )?);
    let _ = ORCH_TICK_DURATION_SECONDS.set(register_histogram!(
        "loom_orchestrator_tick_duration_seconds",
        "Duration of generation ticks (seconds)",
        exponential_buckets(0.01, 2.0, 12)?
    )?);
    let _ = ORCH_POPULATION.set(register_gauge!(
        "loom_orchestrator_population",
        "Live agent population"
    )?);
    let _ = ORCH_ACTIVE_FIBERS.set(register_gauge!(
        "loom_orchestrator_active_fibers",
        "In-flight (non-terminal) fibers"
    )?);
    let _ = ORCH_BIRTHS_TOTAL.set(register_int_counter!(
        "loom_orchestrator_births_total",
        "Agents born"
    )?);
    let _ = ORCH_DEATHS_TOTAL.set(register_int_counter!(
        "loom_orchestrator_deaths_total",
        "Agents withdrawn by the death pass"
    )?);

    let _ = crate::sinks::SINK.set(&INSTALLED_SINK);
    Ok(())
}
