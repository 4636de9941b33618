use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over `default_filter`. Safe to call more than once.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .try_init();
    if installed.is_err() {
        warn!("tracing subscriber already installed");
    }
}

#[cfg(feature = "metrics-exporter")]
pub fn init_metrics(port: u16) {
    use metrics_exporter_prometheus::PrometheusBuilder;

    match PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
    {
        Ok(()) => {
            info!(port, "prometheus exporter listening on /metrics");
            metrics::gauge!("brokerfeed_up").set(1.0);
        }
        Err(e) => warn!(error = %e, "prometheus exporter not installed"),
    }
}

#[cfg(not(feature = "metrics-exporter"))]
pub fn init_metrics(port: u16) {
    info!(port, "built without metrics-exporter, metrics stay in-process");
}
