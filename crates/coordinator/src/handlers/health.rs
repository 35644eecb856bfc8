use crate::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Liveness probe
#[utoipa::path(get, path = "/health", responses((status = 200, body = HealthResponse)))]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize, ToSchema)]
pub struct ReadinessResponse {
    pub status: &'static str,
}

/// Readiness probe: checks DB connectivity (simple SELECT 1)
#[utoipa::path(get, path = "/readyz", responses(
    (status = 200, body = ReadinessResponse, description = "Service ready"),
    (status = 503, body = ReadinessResponse, description = "Dependency not ready")
))]
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let ok = sqlx::query("SELECT 1").execute(state.store.pool()).await.is_ok();
    if ok {
        (StatusCode::OK, Json(ReadinessResponse { status: "ready" }))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(ReadinessResponse { status: "degraded" }))
    }
}

#[derive(Serialize, ToSchema)]
pub struct ServerMetadata {
    pub server_commit: String,
    pub rules_commit: String,
}

/// Server and ruleset identity, for worker version agreement.
pub async fn root(State(state): State<AppState>) -> Json<ServerMetadata> {
    Json(ServerMetadata {
        server_commit: state.settings.git_sha.clone(),
        rules_commit: state.ruleset.current().commit_hash.clone(),
    })
}
