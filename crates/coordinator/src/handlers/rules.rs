use crate::error::{ApiError, ApiResult};
use crate::AppState;
use axum::{extract::State, Json};
use serde::Serialize;
use tracing::info;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct GetRulesResponse {
    pub hash: String,
    pub rules: Vec<String>,
}

/// Current ruleset snapshot, for worker version agreement.
pub async fn get_rules(State(state): State<AppState>) -> Json<GetRulesResponse> {
    let snapshot = state.ruleset.current();
    Json(GetRulesResponse { hash: snapshot.commit_hash.clone(), rules: snapshot.rule_names.clone() })
}

#[derive(Serialize, ToSchema)]
pub struct UpdateRulesResponse {
    pub commit: String,
    pub rules: Vec<String>,
}

/// Admin: refetch the ruleset, reconcile the rules table and swap the
/// snapshot. A failed fetch leaves the old snapshot serving.
pub async fn update_rules(State(state): State<AppState>) -> ApiResult<Json<UpdateRulesResponse>> {
    let snapshot = state
        .rules_repo
        .fetch()
        .await
        .map_err(|e| ApiError::bad_gateway("ruleset_stale", format!("ruleset fetch failed: {e}")))?;
    state.store.reconcile_rules(&snapshot.rule_names).await?;
    let response = UpdateRulesResponse { commit: snapshot.commit_hash.clone(), rules: snapshot.rule_names.clone() };
    state.ruleset.swap(snapshot);
    info!(commit = %response.commit, rules = response.rules.len(), "ruleset_updated");
    Ok(Json(response))
}
