pub mod builder;
pub mod cluster;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod models;
pub mod naming;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod test_support;

use axum::{Router, middleware, routing::{get, post}};
use handlers::{health::health, readiness::readiness, bento_versions::{create_version, list_versions, get_version_by_name, list_latest, get_version, update_version, reissue_upload_url}};
use utoipa::OpenApi;
use crate::telemetry::{metrics_handler, track_metrics};

pub use engine::BentoVersionService;

#[derive(Clone)]
pub struct AppState { pub engine: BentoVersionService }

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::readiness::readiness,
        handlers::bento_versions::create_version,
        handlers::bento_versions::list_versions,
        handlers::bento_versions::get_version_by_name,
        handlers::bento_versions::list_latest,
        handlers::bento_versions::get_version,
        handlers::bento_versions::update_version,
        handlers::bento_versions::reissue_upload_url,
    ),
    components(schemas(
        error::ApiErrorBody,
        models::BentoVersion,
        models::BentoVersionChanges,
        models::BuildStatus,
        models::UploadStatus,
        handlers::bento_versions::CreateVersionRequest,
        handlers::bento_versions::CreateVersionResponse,
        handlers::bento_versions::UploadUrlResponse,
        handlers::bento_versions::VersionPage,
    )),
    tags( (name = "bento", description = "Bento version registry and image builds") )
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    let openapi = ApiDoc::openapi();
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readiness))
        .route("/metrics", get(metrics_handler))
        .route("/bentos/:bento_id/versions", post(create_version).get(list_versions))
        .route("/bentos/:bento_id/versions/:version", get(get_version_by_name))
        .route("/bento_versions/latest", get(list_latest))
        .route("/bento_versions/:id", get(get_version).patch(update_version))
        .route("/bento_versions/:id/upload_url", post(reissue_upload_url))
        .route("/openapi.json", get(|| async move { axum::Json(openapi.clone()) }))
        .layer(middleware::from_fn(track_metrics))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::{Request, StatusCode}, body::Body};
    use tower::util::ServiceExt;
    use crate::test_support::Fixture;

    async fn json(res: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_ok() {
        let app = build_router(Fixture::new().state());
        let res = app.oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json(res).await["status"], "ok");
    }

    #[tokio::test]
    async fn readiness_ok() {
        let app = build_router(Fixture::new().state());
        let res = app.oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn openapi_lists_version_routes() {
        let app = build_router(Fixture::new().state());
        let res = app.oneshot(Request::builder().uri("/openapi.json").body(Body::empty()).unwrap()).await.unwrap();
        let doc = json(res).await;
        assert!(doc["paths"]["/bentos/{bento_id}/versions"].is_object());
        assert!(doc["paths"]["/bento_versions/{id}/upload_url"].is_object());
    }

    #[tokio::test]
    async fn unknown_version_is_404_json() {
        let app = build_router(Fixture::new().state());
        let res = app.oneshot(Request::builder().uri("/bento_versions/999").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(res).await["code"], "not_found");
    }
}
