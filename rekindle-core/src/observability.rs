/*!
Observability infrastructure for Rekindle.

- Structured logging through `tracing-subscriber`, plain or JSON
- Prometheus metrics behind the `metrics` feature
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Instant;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{RekindleError, Result};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_FILTER: &str = "rekindle=info,rekindle_core=info,rekindle_retry=info";

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<RekindleMetrics>> = OnceLock::new();

/// Metrics collection for Rekindle operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct RekindleMetrics {
    pub remote_requests_total: Counter,
    pub remote_errors_total: Counter,
    pub remote_latency_seconds: Histogram,

    pub backups_total: Counter,
    pub backup_failures_total: Counter,
    pub restore_attempts_total: Counter,
    pub heartbeats_total: Counter,

    pub snapshot_size_bytes: Histogram,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let counter = Counter::new(name, help)
        .map_err(|e| RekindleError::storage(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| RekindleError::storage(format!("Failed to register {name}: {e}")))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
fn histogram(registry: &Registry, name: &str, help: &str) -> Result<Histogram> {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help))
        .map_err(|e| RekindleError::storage(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(histogram.clone()))
        .map_err(|e| RekindleError::storage(format!("Failed to register {name}: {e}")))?;
    Ok(histogram)
}

#[cfg(feature = "metrics")]
impl RekindleMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        Ok(Self {
            remote_requests_total: counter(
                &registry,
                "rekindle_remote_requests_total",
                "Total requests made against the remote blob API",
            )?,
            remote_errors_total: counter(
                &registry,
                "rekindle_remote_errors_total",
                "Total failed requests against the remote blob API",
            )?,
            remote_latency_seconds: histogram(
                &registry,
                "rekindle_remote_latency_seconds",
                "Duration of remote blob requests in seconds",
            )?,
            backups_total: counter(
                &registry,
                "rekindle_backups_total",
                "Total backup ticks that completed",
            )?,
            backup_failures_total: counter(
                &registry,
                "rekindle_backup_failures_total",
                "Total backup ticks that failed",
            )?,
            restore_attempts_total: counter(
                &registry,
                "rekindle_restore_attempts_total",
                "Total startup restore attempts",
            )?,
            heartbeats_total: counter(
                &registry,
                "rekindle_heartbeats_total",
                "Total heartbeats written",
            )?,
            snapshot_size_bytes: histogram(
                &registry,
                "rekindle_snapshot_size_bytes",
                "Size of encoded snapshots in bytes",
            )?,
            registry,
        })
    }

    /// Global metrics instance, `None` if registration failed
    pub fn global() -> Option<&'static RekindleMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to initialize metrics");
                    None
                }
            })
            .as_ref()
    }

    pub fn record_backup(&self, snapshot_bytes: usize) {
        self.backups_total.inc();
        self.snapshot_size_bytes.observe(snapshot_bytes as f64);
    }

    pub fn record_backup_failure(&self) {
        self.backup_failures_total.inc();
    }

    pub fn record_restore_attempt(&self) {
        self.restore_attempts_total.inc();
    }

    pub fn record_heartbeat(&self) {
        self.heartbeats_total.inc();
    }

    /// Gather metrics in Prometheus format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| RekindleError::storage(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| RekindleError::storage(format!("Failed to convert metrics to string: {e}")))
    }
}

/// Run `f` against the global metrics, if they are available
#[cfg(feature = "metrics")]
pub fn with_metrics<F: FnOnce(&RekindleMetrics)>(f: F) {
    if let Some(metrics) = RekindleMetrics::global() {
        f(metrics);
    }
}

/// Prometheus text export of the global metrics
#[cfg(feature = "metrics")]
pub fn gather_metrics() -> Result<String> {
    RekindleMetrics::global()
        .ok_or_else(|| RekindleError::storage("metrics are not available"))?
        .gather_metrics()
}

/// Measures one remote request
#[cfg(feature = "metrics")]
pub struct MetricsTimer {
    start: Instant,
}

#[cfg(feature = "metrics")]
impl MetricsTimer {
    /// Count a remote request and start timing it
    pub fn start_remote(operation: &str) -> Self {
        with_metrics(|m| m.remote_requests_total.inc());
        tracing::trace!(operation, "Remote request started");
        Self {
            start: Instant::now(),
        }
    }

    /// Complete the timer, recording success latency
    pub fn finish(self) {
        let elapsed = self.start.elapsed();
        with_metrics(|m| m.remote_latency_seconds.observe(elapsed.as_secs_f64()));
    }

    /// Complete the timer with an error, recording both latency and error
    pub fn finish_with_error(self) {
        let elapsed = self.start.elapsed();
        with_metrics(|m| {
            m.remote_latency_seconds.observe(elapsed.as_secs_f64());
            m.remote_errors_total.inc();
        });
    }
}

/// Install the global tracing subscriber with [`DEFAULT_FILTER`]
///
/// `RUST_LOG` overrides the filter.
///
/// # Arguments
/// * `json` - Emit one JSON object per event instead of human readable lines
pub fn init_observability(json: bool) -> Result<()> {
    init_observability_with(DEFAULT_FILTER, json)
}

/// Install the global tracing subscriber with a fallback filter directive
pub fn init_observability_with(default_filter: &str, json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    RekindleMetrics::global();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = TracingRegistry::default().with(filter);

    let installed = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(registry.with(fmt_layer))
    } else {
        set_global_default(registry.with(tracing_subscriber::fmt::layer().with_target(false)))
    };
    installed.map_err(|e| {
        RekindleError::config(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!(json, "Observability initialized");
    Ok(())
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_timer_and_gathering() {
        let timer = MetricsTimer::start_remote("fetch");
        timer.finish();
        MetricsTimer::start_remote("replace_file").finish_with_error();
        with_metrics(|m| {
            m.record_backup(512);
            m.record_heartbeat();
        });

        let text = gather_metrics().unwrap();
        assert!(text.contains("rekindle_remote_requests_total"));
        assert!(text.contains("rekindle_snapshot_size_bytes"));
    }
}
