//! # Metrics Collection Module

pub mod handler;

/// Initializes the metrics exporter.
///
/// Installs the global Prometheus recorder and spawns a background task for
/// periodic upkeep of histograms. No-op when the `prometheus` feature is
/// disabled.
pub fn init() {
    #[cfg(feature = "prometheus")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        use tracing::debug;
        debug!("Prometheus metrics endpoint is enabled");
        if let Ok(handle) = PrometheusBuilder::new().install_recorder() {
            crate::metrics::handler::set_prom_handle(handle.clone());
            use std::time::Duration;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs(30));
                loop {
                    tick.tick().await;
                    handle.run_upkeep();
                }
            });
        }
    }
}

/// Records a proxied request (C7): path, method, response status and latency.
pub fn record_proxy_request(method: &str, status: u16, latency_ms: f64) {
    #[cfg(feature = "prometheus")]
    {
        use metrics::{counter, histogram};
        let status_s = status.to_string();
        counter!(
            "authproxy_proxy_requests_total",
            "method" => method.to_string(),
            "status" => status_s.clone()
        )
        .increment(1);
        histogram!(
            "authproxy_proxy_latency_ms",
            "method" => method.to_string(),
            "status" => status_s
        )
        .record(latency_ms);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (method, status, latency_ms);
    }
}

/// Outcome of an upstream token refresh attempt (C3), for the
/// success/expired/network/server/unknown classification in spec §4.2.
pub fn record_refresh_outcome(outcome: &str) {
    #[cfg(feature = "prometheus")]
    {
        use metrics::counter;
        counter!("authproxy_refresh_outcomes_total", "outcome" => outcome.to_string())
            .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = outcome;
    }
}

/// Records a rate-limiter rejection on the metadata endpoint (§5).
pub fn record_rate_limit_rejection(route: &str) {
    #[cfg(feature = "prometheus")]
    {
        use metrics::counter;
        counter!("authproxy_rate_limit_rejections_total", "route" => route.to_string())
            .increment(1);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = route;
    }
}

/// Records KV store operation latency (C1/C2).
pub fn record_kv_op(op: &str, latency_ms: f64) {
    #[cfg(feature = "prometheus")]
    {
        use metrics::histogram;
        histogram!("authproxy_kv_op_latency_ms", "op" => op.to_string()).record(latency_ms);
    }
    #[cfg(not(feature = "prometheus"))]
    {
        let _ = (op, latency_ms);
    }
}
