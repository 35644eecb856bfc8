use crate::auth::Identity;
use crate::error::{ApiError, ApiResult};
use crate::models::{normalize_name, ScanRecord, ScanStatus};
use crate::store::{Cursor, ListFilter};
use crate::telemetry::{SCANS_FAIL, SCANS_INGESTED, SCANS_IN_QUEUE, SCANS_SUCCESS};
use crate::AppState;
use axum::{
    extract::{Query, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Deserialize, ToSchema)]
pub struct QueuePackageBody {
    pub name: String,
    pub version: String,
    pub distributions: Vec<String>,
}

#[derive(Serialize, ToSchema)]
pub struct QueuePackageResponse {
    pub id: Uuid,
}

/// Intake: queue a `(name, version)` pair for scanning. Duplicates are a
/// conflict, never a retry signal.
pub async fn queue_package(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<QueuePackageBody>,
) -> ApiResult<Json<QueuePackageResponse>> {
    if body.name.is_empty() || body.version.is_empty() {
        return Err(ApiError::bad_request("name and version must be non-empty"));
    }
    if body.distributions.is_empty() {
        return Err(ApiError::bad_request("at least one distribution URL is required"));
    }
    let name = normalize_name(&body.name);
    let id = state.store.insert_scan(&name, &body.version, &body.distributions, &identity.subject).await?;
    SCANS_INGESTED.inc();
    SCANS_IN_QUEUE.inc();
    info!(name = %name, version = %body.version, queued_by = %identity.subject, "package_added");
    Ok(Json(QueuePackageResponse { id }))
}

#[derive(Deserialize, ToSchema)]
pub struct SubmitBody {
    pub name: String,
    pub version: String,
    pub score: i32,
    pub inspector_url: String,
    #[serde(default)]
    pub rules: Vec<String>,
    /// Rules commit the worker evaluated. Informational only: the stored
    /// hash was bound when the scan was dispatched.
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub files: Option<serde_json::Value>,
}

/// Submit a worker's verdict for its leased scan.
pub async fn submit_results(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<SubmitBody>,
) -> ApiResult<Json<serde_json::Value>> {
    if body.score < 0 {
        return Err(ApiError::bad_request("score must be non-negative"));
    }
    let name = normalize_name(&body.name);
    state
        .store
        .submit(
            &name,
            &body.version,
            &identity.subject,
            body.score,
            &body.inspector_url,
            &body.rules,
            body.files.as_ref(),
            Utc::now(),
        )
        .await?;
    SCANS_SUCCESS.inc();
    SCANS_IN_QUEUE.dec();
    Ok(Json(serde_json::json!({})))
}

#[derive(Deserialize, ToSchema)]
pub struct FailBody {
    pub name: String,
    pub version: String,
    pub reason: String,
}

/// Record that the worker could not scan its leased package.
pub async fn fail_package(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<FailBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let name = normalize_name(&body.name);
    state.store.fail(&name, &body.version, &identity.subject, &body.reason, Utc::now()).await?;
    SCANS_FAIL.inc();
    SCANS_IN_QUEUE.dec();
    Ok(Json(serde_json::json!({})))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub name: Option<String>,
    pub version: Option<String>,
    pub status: Option<ScanStatus>,
    /// Unix seconds, inclusive lower bound on `finished_at`.
    pub since: Option<i64>,
    /// Unix seconds, inclusive upper bound on `finished_at`.
    pub until: Option<i64>,
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Serialize, ToSchema)]
pub struct ListResponse {
    pub scans: Vec<ScanRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

fn parse_unix(ts: i64) -> ApiResult<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0).ok_or_else(|| ApiError::bad_request("timestamp out of range"))
}

/// Filtered listing of scans.
pub async fn lookup_package_info(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<ListResponse>> {
    if query.version.is_some() && query.name.is_none() {
        return Err(ApiError::bad_request("version filter requires name"));
    }
    let cursor = match &query.cursor {
        Some(raw) => Some(Cursor::decode(raw).ok_or_else(|| ApiError::bad_request("malformed cursor"))?),
        None => None,
    };
    let filter = ListFilter {
        name: query.name.as_deref().map(normalize_name),
        version: query.version.clone(),
        status: query.status,
        since: query.since.map(parse_unix).transpose()?,
        until: query.until.map(parse_unix).transpose()?,
        cursor,
        limit: query.limit.unwrap_or(100).clamp(1, 500),
    };
    let (page, next_cursor) = state.store.list(&filter).await?;
    let scans = page
        .into_iter()
        .map(|(row, rules, urls)| ScanRecord::from_row(row, rules, urls))
        .collect();
    Ok(Json(ListResponse { scans, next_cursor: next_cursor.map(|c| c.encode()) }))
}
