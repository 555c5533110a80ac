/*!
Observability infrastructure for DeltaVault.

This module provides:
- Structured logging and tracing setup
- Prometheus export of persistence and vault statistics (`metrics` feature)
*/

#[cfg(feature = "metrics")]
use crate::metrics::PersistenceStats;
#[cfg(feature = "metrics")]
use crate::snapshot::ManagerStats;
#[cfg(feature = "metrics")]
use prometheus::{Encoder, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{PersistError, Result};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "deltavault=info";

/// Log filter from `RUST_LOG`, falling back to [`DEFAULT_LOG_FILTER`]
pub fn default_filter() -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(DEFAULT_LOG_FILTER)
            .map_err(|e| PersistError::validation(format!("Invalid log filter: {e}"))),
    }
}

/// Initialize the global tracing subscriber
///
/// Logs go to stderr, as JSON lines when `json` is set and as human-readable
/// text otherwise. Fails if a global subscriber is already installed.
pub fn init_observability(json: bool) -> Result<()> {
    init_observability_with_filter(default_filter()?, json)
}

/// Like [`init_observability`] with an explicit filter
pub fn init_observability_with_filter(filter: EnvFilter, json: bool) -> Result<()> {
    let json_layer = json.then(|| {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(false)
            .with_writer(std::io::stderr)
    });
    let text_layer = (!json).then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    let subscriber = TracingRegistry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer);

    set_global_default(subscriber).map_err(|e| {
        PersistError::persistence(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!(json, "DeltaVault observability initialized");
    Ok(())
}

/// Initialize observability with default settings
pub fn init_default_observability() -> Result<()> {
    init_observability(false)
}

/// Publishes persistence statistics as Prometheus gauges
///
/// Statistics are point-in-time copies, so every value is a gauge set on
/// each [`publish`](PrometheusExporter::publish); the `component` label
/// separates backends and managers sharing one exporter.
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct PrometheusExporter {
    operations: IntGaugeVec,
    errors: IntGaugeVec,
    bytes: IntGaugeVec,
    cache: IntGaugeVec,
    cache_hit_rate: GaugeVec,
    avg_latency_ms: GaugeVec,
    snapshots: IntGaugeVec,
    storage_bytes: IntGaugeVec,
    registry: Registry,
}

#[cfg(feature = "metrics")]
fn metric_err(name: &str) -> impl FnOnce(prometheus::Error) -> PersistError + '_ {
    move |e| PersistError::persistence(format!("Failed to create metric {name}: {e}"))
}

#[cfg(feature = "metrics")]
impl PrometheusExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let int_vec = |name: &str, help: &str, labels: &[&str]| -> Result<IntGaugeVec> {
            let gauge = IntGaugeVec::new(Opts::new(name, help), labels).map_err(metric_err(name))?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(metric_err(name))?;
            Ok(gauge)
        };
        let float_vec = |name: &str, help: &str, labels: &[&str]| -> Result<GaugeVec> {
            let gauge = GaugeVec::new(Opts::new(name, help), labels).map_err(metric_err(name))?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(metric_err(name))?;
            Ok(gauge)
        };

        let operations = int_vec(
            "deltavault_operations",
            "Completed persistence operations",
            &["component", "operation"],
        )?;
        let errors = int_vec(
            "deltavault_errors",
            "Failed persistence operations",
            &["component", "operation"],
        )?;
        let bytes = int_vec(
            "deltavault_bytes",
            "Bytes moved by saves and loads",
            &["component", "direction"],
        )?;
        let cache = int_vec(
            "deltavault_cache_lookups",
            "Working-state lookups by outcome",
            &["component", "outcome"],
        )?;
        let cache_hit_rate = float_vec(
            "deltavault_cache_hit_rate",
            "Fraction of lookups that hit",
            &["component"],
        )?;
        let avg_latency_ms = float_vec(
            "deltavault_avg_latency_ms",
            "Average save/load latency in milliseconds",
            &["component", "operation"],
        )?;
        let snapshots = int_vec(
            "deltavault_snapshots",
            "Snapshots in the vault by kind",
            &["component", "kind"],
        )?;
        let storage_bytes = int_vec(
            "deltavault_storage_bytes",
            "Full-state and stored payload sizes",
            &["component", "measure"],
        )?;

        Ok(Self {
            operations,
            errors,
            bytes,
            cache,
            cache_hit_rate,
            avg_latency_ms,
            snapshots,
            storage_bytes,
            registry,
        })
    }

    /// Set gauges from one component's counters
    pub fn publish(&self, component: &str, stats: &PersistenceStats) {
        for (operation, count) in &stats.operation_counts {
            self.operations
                .with_label_values(&[component, operation.as_str()])
                .set(*count as i64);
        }
        for (operation, count) in &stats.errors_by_operation {
            self.errors
                .with_label_values(&[component, operation.as_str()])
                .set(*count as i64);
        }
        self.bytes
            .with_label_values(&[component, "written"])
            .set(stats.bytes_written as i64);
        self.bytes
            .with_label_values(&[component, "read"])
            .set(stats.bytes_read as i64);
        self.cache
            .with_label_values(&[component, "hit"])
            .set(stats.cache_hits as i64);
        self.cache
            .with_label_values(&[component, "miss"])
            .set(stats.cache_misses as i64);
        self.cache_hit_rate
            .with_label_values(&[component])
            .set(stats.cache_hit_rate);
        self.avg_latency_ms
            .with_label_values(&[component, "save"])
            .set(stats.avg_save_time_ms);
        self.avg_latency_ms
            .with_label_values(&[component, "load"])
            .set(stats.avg_load_time_ms);
    }

    /// Set gauges from a snapshot manager's statistics
    pub fn publish_manager(&self, component: &str, stats: &ManagerStats) {
        self.publish(component, &stats.persistence);
        self.snapshots
            .with_label_values(&[component, "full"])
            .set(stats.full_snapshots as i64);
        self.snapshots
            .with_label_values(&[component, "delta"])
            .set(stats.delta_snapshots as i64);
        self.storage_bytes
            .with_label_values(&[component, "state"])
            .set(stats.total_state_bytes as i64);
        self.storage_bytes
            .with_label_values(&[component, "stored"])
            .set(stats.total_stored_bytes as i64);
    }

    /// Gather metrics in Prometheus text format
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| PersistError::persistence(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer).map_err(|e| {
            PersistError::persistence(format!("Failed to convert metrics to string: {e}"))
        })
    }
}
