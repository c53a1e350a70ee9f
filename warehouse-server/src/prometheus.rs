// prometheus exporter setup

use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use warehouse::metrics_consts::FLUSH_SIZE_HISTOGRAM;

const HTTP_REQUESTS_COUNTER: &str = "warehouse_http_requests_total";
const HTTP_REQUEST_DURATION_HISTOGRAM: &str = "warehouse_http_request_duration_seconds";

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];
    const BATCH_SIZES: &[f64] = &[
        1.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("_seconds".to_string()),
            EXPONENTIAL_SECONDS,
        )
        .expect("invalid duration buckets")
        .set_buckets_for_metric(
            Matcher::Full(FLUSH_SIZE_HISTOGRAM.to_string()),
            BATCH_SIZES,
        )
        .expect("invalid batch size buckets")
        .install_recorder()
        .expect("failed to install metrics recorder")
}

/// Count requests and time them, labelled by method, route and status.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    // Label by route template so path parameters don't explode cardinality
    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(HTTP_REQUESTS_COUNTER, &labels).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION_HISTOGRAM, &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
