use prometheus::{TextEncoder, Encoder, Registry, IntCounter, IntCounterVec, opts};
use once_cell::sync::Lazy;
use axum::{body::Body, extract::MatchedPath, http::{Request, StatusCode}, middleware::Next, response::{IntoResponse, Response}};
use tracing_subscriber::{fmt, EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogFormat;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::with_opts(opts!(name, help)).expect("static metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(opts!(name, help), labels).expect("static metric definition");
    REGISTRY.register(Box::new(c.clone())).ok();
    c
}

pub static HTTP_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| counter_vec("http_requests_total", "HTTP request count", &["method", "path", "status"]));
pub static VERSIONS_CREATED: Lazy<IntCounter> = Lazy::new(|| counter("bento_versions_created_total", "Bento versions recorded"));
pub static UPLOAD_URL_FAILURES: Lazy<IntCounter> = Lazy::new(|| counter("bento_upload_url_failures_total", "Upload URL issuance failures"));
/// outcome: submitted | already_submitted | failed
pub static BUILD_PROVISION_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| counter_vec("bento_build_provision_total", "Image build provisioning attempts", &["outcome"]));

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() { return StatusCode::INTERNAL_SERVER_ERROR.into_response(); }
    ([("Content-Type","text/plain; version=0.0.4")], buf).into_response()
}

/// Collapse numeric segments and the version string after `versions/` so
/// per-record paths share one label. Used when no route template matched.
pub fn normalize_path(path: &str) -> String {
    let mut prev = "";
    path.split('/')
        .map(|seg| {
            let label = if seg.is_empty() {
                seg
            } else if prev == "versions" {
                ":version"
            } else if seg.chars().all(|c| c.is_ascii_digit()) {
                ":id"
            } else {
                seg
            };
            prev = seg;
            label
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Count every request by method, route template and status.
pub async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path_label = match req.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_string(),
        None => normalize_path(req.uri().path()),
    };
    let resp = next.run(req).await;
    HTTP_REQUESTS.with_label_values(&[method.as_str(), path_label.as_str(), resp.status().as_str()]).inc();
    resp
}

pub fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base = fmt::layer().with_target(false);
    match format {
        LogFormat::Json => tracing_subscriber::registry().with(env).with(base.json()).try_init()?,
        LogFormat::Text => tracing_subscriber::registry().with(env).with(base.compact()).try_init()?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_segments_collapse() {
        assert_eq!(normalize_path("/bento_versions/42"), "/bento_versions/:id");
        assert_eq!(normalize_path("/bento_versions/42/upload_url"), "/bento_versions/:id/upload_url");
        assert_eq!(normalize_path("/bentos/7/versions"), "/bentos/:id/versions");
        assert_eq!(normalize_path("/health"), "/health");
    }

    #[test]
    fn version_strings_share_a_label() {
        let a = normalize_path("/bentos/7/versions/1.0.0");
        assert_eq!(a, "/bentos/:id/versions/:version");
        assert_eq!(a, normalize_path("/bentos/7/versions/1.0.1-rc.2"));
    }

    #[tokio::test]
    async fn metrics_exposes_build_counter() {
        BUILD_PROVISION_TOTAL.with_label_values(&["submitted"]).inc();
        let body = axum::body::to_bytes(metrics_handler().await.into_response().into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("bento_build_provision_total"));
    }
}
