//! Prometheus metrics: request counters, latency histogram, in-flight gauge,
//! and cache / rate-limit counters.

use std::{sync::OnceLock, time::Instant};

use axum::{
    extract::{MatchedPath, Request},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "nexusforge_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "nexusforge_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "nexusforge_http_requests_in_flight";
    pub const CACHE_HITS_TOTAL: &str = "nexusforge_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "nexusforge_cache_misses_total";
    pub const RATE_LIMITED_TOTAL: &str = "nexusforge_rate_limited_total";
}

/// Installs the global recorder. Returns `false` if it was already installed or failed.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        return false;
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("prometheus handle already set");
                return false;
            }
            tracing::info!("prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to install prometheus recorder");
            false
        }
    }
}

pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

/// `GET /metrics`
pub async fn metrics_handler() -> Response {
    match render_metrics() {
        Some(body) => (
            [(
                axum::http::header::CONTENT_TYPE,
                "text/plain; version=0.0.4; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

pub fn record_http_request(method: &str, path: &str, status: u16, started: Instant) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];
    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels)
        .record(started.elapsed().as_secs_f64());
}

pub fn record_cache_hit() {
    counter!(names::CACHE_HITS_TOTAL).increment(1);
}

pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

pub fn record_rate_limited() {
    counter!(names::RATE_LIMITED_TOTAL).increment(1);
}

/// Decrements the in-flight gauge on drop, so cancelled requests are counted out too.
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);
        Self
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);
    }
}

pub async fn track_http(req: Request, next: Next) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let started = Instant::now();
    let method = req.method().to_string();
    // route template keeps label cardinality bounded
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let _guard = InFlight::enter();
    let res = next.run(req).await;
    record_http_request(&method, &path, res.status().as_u16(), started);
    res
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request, middleware, routing::get, Router};
    use tower::ServiceExt;

    use super::*;

    #[tokio::test]
    async fn exposition_lists_route_templates() {
        // the recorder is process-global; another test may have installed it already
        init_metrics();
        let app = Router::new()
            .route("/items/:id", get(|| async { "ok" }))
            .route("/metrics", get(metrics_handler))
            .layer(middleware::from_fn(track_http));

        let req = Request::builder().uri("/items/42").body(Body::empty()).unwrap();
        let res = app.clone().oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        record_cache_hit();

        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let res = app.oneshot(req).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains(names::HTTP_REQUESTS_TOTAL));
        assert!(text.contains(r#"path="/items/:id""#));
        assert!(!text.contains(r#"path="/metrics""#));
        assert!(text.contains(names::CACHE_HITS_TOTAL));
    }
}
