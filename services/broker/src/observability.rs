//! Tracing and metrics setup for the daemon: a tracing subscriber with
//! environment filtering, a Prometheus recorder, and an HTTP server exposing
//! `/metrics`, `/live` and `/ready`.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
#[cfg(test)]
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[cfg(test)]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initializes observability for the daemon and returns the handle used to
/// render Prometheus metrics.
pub fn init(service_name: &str) -> PrometheusHandle {
    // Use environment variable for log filtering; default to "info".
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();
    init_subscriber(tracing_subscriber::registry().with(filter).with(fmt_layer));
    tracing::debug!(service = service_name, "tracing initialized");
    install_metrics_recorder()
}

/// Serves Prometheus metrics and health probes on the given address.
pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route("/ready", axum::routing::get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await
}

/// Installs the Prometheus metrics recorder globally.
///
/// In tests, reuses a cached recorder handle because only one global
/// recorder can exist per process.
fn install_metrics_recorder() -> PrometheusHandle {
    #[cfg(test)]
    {
        if let Some(handle) = METRICS_HANDLE.get() {
            return handle.clone();
        }
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("install metrics recorder");
        let _ = METRICS_HANDLE.set(handle.clone());
        handle
    }
    #[cfg(not(test))]
    {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install metrics recorder")
    }
}

fn init_subscriber<S>(subscriber: S)
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    #[cfg(test)]
    {
        let _ = subscriber.try_init();
    }
    #[cfg(not(test))]
    {
        subscriber.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn init_returns_a_working_handle() {
        let handle = init("test-service");
        metrics::counter!("crossbard_test_counter").increment(1);
        let rendered = handle.render();
        assert!(rendered.contains("crossbard_test_counter"));
    }

    #[test]
    #[serial]
    fn recorder_install_is_idempotent_in_tests() {
        let first = install_metrics_recorder();
        let second = install_metrics_recorder();
        let _ = first.render();
        let _ = second.render();
    }
}
