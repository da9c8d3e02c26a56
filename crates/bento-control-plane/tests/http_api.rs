use axum::body::Body;
use axum::http::{Request, StatusCode};
use bento_control_plane::build_router;
use bento_control_plane::builder::ResourceKind;
use bento_control_plane::test_support::Fixture;
use serde_json::{json, Value};
use tower::util::ServiceExt; // for oneshot

async fn call(fx: &Fixture, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => { req = req.header("content-type", "application/json"); Body::from(v.to_string()) }
        None => Body::empty(),
    };
    let res = build_router(fx.state()).oneshot(req.body(body).unwrap()).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap_or(Value::Null) };
    (status, value)
}

#[tokio::test]
async fn register_upload_and_build() {
    let fx = Fixture::new();
    let uri = format!("/bentos/{}/versions", fx.bento.id);
    let (status, created) = call(&fx, "POST", &uri, Some(json!({"creator_id": 1, "version": "1.0.0"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["storage_key"], "bentos/acme/resnet/1.0.0.tar.gz");
    assert_eq!(created["method"], "PUT");
    assert_eq!(created["version"]["upload_status"], "pending");
    let id = created["version"]["id"].as_i64().unwrap();

    let (status, updated) = call(&fx, "PATCH", &format!("/bento_versions/{id}"), Some(json!({"upload_status": "success"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["upload_status"], "success");
    assert_eq!(fx.cluster.count(ResourceKind::Job), 1);

    let (status, by_name) = call(&fx, "GET", &format!("/bentos/{}/versions/1.0.0", fx.bento.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(by_name["id"], id);
}

#[tokio::test]
async fn duplicate_registration_is_409() {
    let fx = Fixture::new();
    let uri = format!("/bentos/{}/versions", fx.bento.id);
    call(&fx, "POST", &uri, Some(json!({"creator_id": 1, "version": "1.0.0"}))).await;
    let (status, body) = call(&fx, "POST", &uri, Some(json!({"creator_id": 1, "version": "1.0.0"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "conflict");
}

#[tokio::test]
async fn unconfigured_organization_is_412() {
    let fx = Fixture::with_config(None);
    let (status, body) = call(&fx, "POST", &format!("/bentos/{}/versions", fx.bento.id), Some(json!({"creator_id": 1, "version": "1.0.0"}))).await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);
    assert_eq!(body["code"], "configuration");
}

#[tokio::test]
async fn url_failure_returns_version_id_and_repair_works() {
    let fx = Fixture::new();
    fx.objects.set_fail_presign(true);
    let (status, body) = call(&fx, "POST", &format!("/bentos/{}/versions", fx.bento.id), Some(json!({"creator_id": 1, "version": "1.0.0"}))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["code"], "upload_url_issuance");
    let id = body["version_id"].as_i64().unwrap();

    fx.objects.set_fail_presign(false);
    let (status, body) = call(&fx, "POST", &format!("/bento_versions/{id}/upload_url"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["storage_key"], "bentos/acme/resnet/1.0.0.tar.gz");
}

#[tokio::test]
async fn backward_transition_is_422() {
    let fx = Fixture::new();
    let (_, created) = call(&fx, "POST", &format!("/bentos/{}/versions", fx.bento.id), Some(json!({"creator_id": 1, "version": "1.0.0"}))).await;
    let id = created["version"]["id"].as_i64().unwrap();
    call(&fx, "PATCH", &format!("/bento_versions/{id}"), Some(json!({"build_status": "failed"}))).await;
    let (status, body) = call(&fx, "PATCH", &format!("/bento_versions/{id}"), Some(json!({"build_status": "building"}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "invalid_transition");
}

#[tokio::test]
async fn listing_and_latest() {
    let fx = Fixture::new();
    let uri = format!("/bentos/{}/versions", fx.bento.id);
    for v in ["1.0.0", "1.1.0"] {
        call(&fx, "POST", &uri, Some(json!({"creator_id": 1, "version": v}))).await;
    }
    let (status, page) = call(&fx, "GET", &format!("{uri}?limit=1"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 2);
    assert_eq!(page["items"].as_array().unwrap().len(), 1);

    let (status, latest) = call(&fx, "GET", &format!("/bento_versions/latest?bento_ids={}", fx.bento.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(latest[0]["version"], "1.1.0");

    let (status, _) = call(&fx, "GET", "/bento_versions/latest?bento_ids=abc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn metrics_count_requests() {
    let fx = Fixture::new();
    call(&fx, "GET", "/bento_versions/12345", None).await;
    let res = build_router(fx.state()).oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap()).await.unwrap();
    let text = String::from_utf8(axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap().to_vec()).unwrap();
    assert!(text.contains("http_requests_total"));
    assert!(text.contains("/bento_versions/:id"));
}

#[tokio::test]
async fn version_lookups_share_one_metric_series() {
    let fx = Fixture::new();
    for v in ["3.1.4", "3.1.5"] {
        call(&fx, "GET", &format!("/bentos/{}/versions/{v}", fx.bento.id), None).await;
    }
    let res = build_router(fx.state()).oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap()).await.unwrap();
    let text = String::from_utf8(axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap().to_vec()).unwrap();
    assert!(text.contains("/bentos/:bento_id/versions/:version"));
    assert!(!text.contains("3.1.4"));
    assert!(!text.contains("3.1.5"));
}
