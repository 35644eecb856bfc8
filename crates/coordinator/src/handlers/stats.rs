use crate::error::ApiResult;
use crate::models::ScanStatus;
use crate::store::Stats;
use crate::AppState;
use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Recent system statistics over the trailing 24 hours.
#[utoipa::path(get, path = "/stats", responses((status = 200, body = Stats)))]
pub async fn get_stats(State(state): State<AppState>) -> ApiResult<Json<Stats>> {
    Ok(Json(state.store.stats(Utc::now()).await?))
}

#[derive(Deserialize)]
pub struct ScansQuery {
    /// Unix seconds; scans finished at or after this instant.
    pub since: i64,
}

#[derive(Serialize, ToSchema)]
pub struct PackageSpecifier {
    pub name: String,
    pub version: String,
}

#[derive(Serialize, ToSchema)]
pub struct MaliciousPackage {
    pub name: String,
    pub version: String,
    pub score: i32,
    pub inspector_url: String,
    pub rules: Vec<String>,
}

#[derive(Serialize, ToSchema)]
pub struct GetScansResponse {
    pub all_scans: Vec<PackageSpecifier>,
    pub malicious_packages: Vec<MaliciousPackage>,
}

/// Scans finished since a point in time, with the subset whose score crossed
/// the configured threshold called out for downstream consumers.
pub async fn get_scans(
    State(state): State<AppState>,
    Query(query): Query<ScansQuery>,
) -> ApiResult<Json<GetScansResponse>> {
    let since = DateTime::from_timestamp(query.since, 0)
        .ok_or_else(|| crate::error::ApiError::bad_request("timestamp out of range"))?;
    let finished = state.store.finished_since(since).await?;

    let mut all_scans = Vec::with_capacity(finished.len());
    let mut malicious_packages = Vec::new();
    for (scan, rules) in finished {
        all_scans.push(PackageSpecifier { name: scan.name.clone(), version: scan.version.clone() });
        if scan.status != ScanStatus::Finished {
            continue;
        }
        let (Some(score), Some(inspector_url)) = (scan.score, scan.inspector_url) else {
            continue;
        };
        if score >= state.settings.score_threshold {
            malicious_packages.push(MaliciousPackage {
                name: scan.name,
                version: scan.version,
                score,
                inspector_url,
                rules,
            });
        }
    }
    Ok(Json(GetScansResponse { all_scans, malicious_packages }))
}
