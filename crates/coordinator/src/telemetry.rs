use axum::{http::StatusCode, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static HTTP_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("http_requests_total", "HTTP request count"), &["method", "path", "status"])
        .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    let h = HistogramVec::new(
        histogram_opts!("http_request_duration_seconds", "HTTP request latency"),
        &["method", "path"],
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

pub static SCANS_INGESTED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("scans_ingested_total", "Scans accepted by intake").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SCANS_SUCCESS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("scans_success_total", "Scans finished successfully").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SCANS_FAIL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("scans_fail_total", "Scans reported as failed by workers").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static SCANS_REPORTED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("scans_reported_total", "Finished scans forwarded to the reporter").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Queued plus pending scans. Primed from the database at startup.
pub static SCANS_IN_QUEUE: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("scans_in_queue", "Scans waiting to be scanned or leased to a worker").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

/// Collapse parameterized paths so metric label cardinality stays bounded.
pub fn normalize_path(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("/report/") {
        if !rest.is_empty() {
            return "/report/:name".to_string();
        }
    }
    path.to_string()
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ([("Content-Type", "text/plain; version=0.0.4")], buf).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_paths_collapse() {
        assert_eq!(normalize_path("/report/left-pad"), "/report/:name");
        assert_eq!(normalize_path("/package"), "/package");
        assert_eq!(normalize_path("/report/"), "/report/");
    }
}
