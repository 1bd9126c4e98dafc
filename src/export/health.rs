use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Counter, CounterVec, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Default listen address of the exposition endpoint.
pub const DEFAULT_LISTEN_ADDR: &str = ":9080";

/// Self-observability metrics plus the HTTP endpoint that serves every
/// registered gauge, including the per-target rate gauges.
pub struct ExporterMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Number of polling workers currently running.
    pub active_workers: Gauge,
    /// Number of per-target rate gauges currently registered.
    pub registered_metrics: Gauge,
    /// Reload attempts by result (success/failure).
    pub reloads_total: CounterVec,
    /// Queries issued by workers by result (success/failure).
    pub samples_total: CounterVec,
}

/// Sample counters handed to each worker.
#[derive(Clone)]
pub struct SampleStats {
    pub success: Counter,
    pub failure: Counter,
}

impl ExporterMetrics {
    /// Creates the metrics set on a fresh registry.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let active_workers = Gauge::with_opts(
            Opts::new("active_workers", "Number of polling workers currently running.")
                .namespace("snmp_exporter"),
        )?;
        let registered_metrics = Gauge::with_opts(
            Opts::new(
                "registered_metrics",
                "Number of per-target rate gauges currently registered.",
            )
            .namespace("snmp_exporter"),
        )?;
        let reloads_total = CounterVec::new(
            Opts::new("reloads_total", "Total configuration reloads by result.")
                .namespace("snmp_exporter"),
            &["result"],
        )?;
        let samples_total = CounterVec::new(
            Opts::new("samples_total", "Total SNMP queries issued by result.")
                .namespace("snmp_exporter"),
            &["result"],
        )?;

        registry.register(Box::new(active_workers.clone()))?;
        registry.register(Box::new(registered_metrics.clone()))?;
        registry.register(Box::new(reloads_total.clone()))?;
        registry.register(Box::new(samples_total.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            active_workers,
            registered_metrics,
            reloads_total,
            samples_total,
        })
    }

    /// Registry shared with the gauge registrations of the targets.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn sample_stats(&self) -> SampleStats {
        SampleStats {
            success: self.samples_total.with_label_values(&["success"]),
            failure: self.samples_total.with_label_values(&["failure"]),
        }
    }

    pub fn record_reload(&self, ok: bool) {
        let result = if ok { "success" } else { "failure" };
        self.reloads_total.with_label_values(&[result]).inc();
    }

    /// Renders every registered metric in the text exposition format.
    pub fn render(&self) -> Result<String> {
        render(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 is requested.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr);

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the HTTP server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Expands the `:port` shorthand to an all-interfaces address.
pub fn bind_address(addr: &str) -> String {
    let addr = if addr.is_empty() {
        DEFAULT_LISTEN_ADDR
    } else {
        addr
    };

    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn render(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match render(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
