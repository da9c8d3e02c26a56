use axum::{Json, http::StatusCode, extract::{State, Path, Query}};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use crate::{AppState, error::{ApiError, ApiResult}, models::{BentoVersion, BentoVersionChanges, CreateBentoVersion}, storage::PresignedUpload};

#[derive(Deserialize, ToSchema)]
pub struct CreateVersionRequest {
    pub creator_id: i64,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Defaults to the time of the request.
    #[serde(default)]
    #[schema(value_type = Option<String>, format = DateTime)]
    pub build_at: Option<DateTime<Utc>>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub manifest: Option<serde_json::Value>,
}

#[derive(Serialize, ToSchema)]
pub struct UploadUrlResponse { pub upload_url: String, pub method: String, pub storage_key: String }

impl From<PresignedUpload> for UploadUrlResponse {
    fn from(p: PresignedUpload) -> Self { Self { upload_url: p.url, method: p.method, storage_key: p.storage_key } }
}

#[derive(Serialize, ToSchema)]
pub struct CreateVersionResponse {
    pub version: BentoVersion,
    #[serde(flatten)]
    pub upload: UploadUrlResponse,
}

/// Register a bento version and get its upload URL
#[utoipa::path(post, path = "/bentos/{bento_id}/versions", params(("bento_id" = i64, Path,)), request_body = CreateVersionRequest, responses(
    (status=201, body=CreateVersionResponse),
    (status=404, body=crate::error::ApiErrorBody, description="bento not found"),
    (status=409, body=crate::error::ApiErrorBody, description="version already exists"),
    (status=412, body=crate::error::ApiErrorBody, description="organization storage not configured"),
    (status=502, body=crate::error::ApiErrorBody, description="version recorded but no upload url; retry via /bento_versions/{id}/upload_url"),
))]
#[tracing::instrument(level="info", skip(state, req), fields(version=%req.version))]
pub async fn create_version(State(state): State<AppState>, Path(bento_id): Path<i64>, Json(req): Json<CreateVersionRequest>) -> ApiResult<(StatusCode, Json<CreateVersionResponse>)> {
    if req.version.trim().is_empty() { return Err(ApiError::bad_request("version must not be empty")); }
    let new = CreateBentoVersion {
        creator_id: req.creator_id,
        bento_id,
        version: req.version,
        description: req.description,
        build_at: req.build_at.unwrap_or_else(Utc::now),
        manifest: req.manifest,
    };
    let reg = state.engine.create(new).await?;
    Ok((StatusCode::CREATED, Json(CreateVersionResponse { version: reg.version, upload: reg.upload.into() })))
}

#[derive(Deserialize, ToSchema)]
pub struct PageQuery { pub limit: Option<i64>, pub offset: Option<i64> }

#[derive(Serialize, ToSchema)]
pub struct VersionPage { pub items: Vec<BentoVersion>, pub total: i64 }

/// List a bento's versions, newest build first
#[utoipa::path(get, path = "/bentos/{bento_id}/versions", params(("bento_id" = i64, Path,), ("limit" = Option<i64>, Query, description="Max items (default 20, max 1000)"), ("offset" = Option<i64>, Query, description="Offset")), responses( (status=200, body=VersionPage) ))]
#[tracing::instrument(level="debug", skip(state, q), fields(limit=?q.limit, offset=?q.offset))]
pub async fn list_versions(State(state): State<AppState>, Path(bento_id): Path<i64>, Query(q): Query<PageQuery>) -> ApiResult<Json<VersionPage>> {
    let limit = q.limit.unwrap_or(20).clamp(1, 1000);
    let offset = q.offset.unwrap_or(0).max(0);
    let (items, total) = state.engine.list(Some(bento_id), limit, offset).await?;
    Ok(Json(VersionPage { items, total }))
}

#[utoipa::path(get, path = "/bentos/{bento_id}/versions/{version}", params(("bento_id" = i64, Path,), ("version" = String, Path,)), responses( (status=200, body=BentoVersion), (status=404, body=crate::error::ApiErrorBody) ))]
pub async fn get_version_by_name(State(state): State<AppState>, Path((bento_id, version)): Path<(i64, String)>) -> ApiResult<Json<BentoVersion>> {
    Ok(Json(state.engine.get_by_version(bento_id, &version).await?))
}

#[derive(Deserialize, ToSchema)]
pub struct LatestQuery { pub bento_ids: String }

fn parse_ids(raw: &str) -> Result<Vec<i64>, ApiError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<i64>().map_err(|_| ApiError::bad_request(format!("invalid bento id {s}"))))
        .collect()
}

/// Latest version of each listed bento
#[utoipa::path(get, path = "/bento_versions/latest", params(("bento_ids" = String, Query, description="Comma separated bento ids")), responses( (status=200, body=[BentoVersion]), (status=400, body=crate::error::ApiErrorBody) ))]
pub async fn list_latest(State(state): State<AppState>, Query(q): Query<LatestQuery>) -> ApiResult<Json<Vec<BentoVersion>>> {
    let ids = parse_ids(&q.bento_ids)?;
    Ok(Json(state.engine.list_latest_by_bento_ids(&ids).await?))
}

#[utoipa::path(get, path = "/bento_versions/{id}", params(("id" = i64, Path,)), responses( (status=200, body=BentoVersion), (status=404, body=crate::error::ApiErrorBody) ))]
pub async fn get_version(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<BentoVersion>> {
    Ok(Json(state.engine.get(id).await?))
}

/// Apply a sparse status update. An upload moving to `success` starts the image build.
#[utoipa::path(patch, path = "/bento_versions/{id}", params(("id" = i64, Path,)), request_body = BentoVersionChanges, responses(
    (status=200, body=BentoVersion),
    (status=404, body=crate::error::ApiErrorBody),
    (status=412, body=crate::error::ApiErrorBody, description="status saved but the build could not start: organization config incomplete"),
    (status=422, body=crate::error::ApiErrorBody, description="illegal status transition"),
    (status=502, body=crate::error::ApiErrorBody, description="status saved but the build cluster rejected the job"),
))]
#[tracing::instrument(level="info", skip(state, changes))]
pub async fn update_version(State(state): State<AppState>, Path(id): Path<i64>, Json(changes): Json<BentoVersionChanges>) -> ApiResult<Json<BentoVersion>> {
    let current = state.engine.get(id).await?;
    Ok(Json(state.engine.update(current, changes).await?))
}

/// Issue a fresh upload URL for a version whose upload has not finished
#[utoipa::path(post, path = "/bento_versions/{id}/upload_url", params(("id" = i64, Path,)), responses( (status=200, body=UploadUrlResponse), (status=404, body=crate::error::ApiErrorBody), (status=422, body=crate::error::ApiErrorBody) ))]
#[tracing::instrument(level="info", skip(state))]
pub async fn reissue_upload_url(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Json<UploadUrlResponse>> {
    Ok(Json(state.engine.issue_upload_url(id).await?.into()))
}
