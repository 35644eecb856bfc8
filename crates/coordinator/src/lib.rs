pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod reporter;
pub mod ruleset;
pub mod store;
pub mod telemetry;
pub mod test_support;

use auth::TokenVerifier;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use config::Settings;
use handlers::{health, jobs, packages, report, rules, stats};
use reporter::ReporterClient;
use ruleset::{RulesRepo, RulesetHandle};
use std::sync::Arc;
use store::ScanStore;

#[derive(Clone)]
pub struct AppState {
    pub store: ScanStore,
    pub ruleset: RulesetHandle,
    pub rules_repo: Arc<dyn RulesRepo>,
    pub reporter: Arc<dyn ReporterClient>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub settings: Arc<Settings>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::health))
        .route("/readyz", get(health::readiness))
        .route("/metrics", get(telemetry::metrics_handler))
        .route("/job", post(jobs::get_job))
        .route(
            "/package",
            post(packages::queue_package).put(packages::submit_results).get(packages::lookup_package_info),
        )
        .route("/package/fail", post(packages::fail_package))
        .route("/report/:name", post(report::report_package))
        .route("/rules", get(rules::get_rules))
        .route("/rules/update", post(rules::update_rules))
        .route("/scans", get(stats::get_scans))
        .route("/stats", get(stats::get_stats))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_layer))
        .with_state(state)
}
