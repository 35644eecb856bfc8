use crate::auth::Identity;
use crate::error::ApiResult;
use crate::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{Duration, Utc};

/// Dispatch one scan to the calling worker. Returns 204 when nothing is
/// queued and no lease has expired; the worker polls again later.
pub async fn get_job(State(state): State<AppState>, Extension(identity): Extension<Identity>) -> ApiResult<Response> {
    let now = Utc::now();
    let cutoff = now - Duration::seconds(state.settings.job_timeout as i64);
    let ruleset = state.ruleset.current();
    match state.store.claim_next(&identity.subject, now, cutoff, &ruleset).await? {
        Some(job) => Ok(Json(job).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}
