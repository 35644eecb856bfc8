use crate::auth::Identity;
use crate::error::{ApiError, ApiResult};
use crate::models::{normalize_name, ScanRow, ScanStatus};
use crate::reporter::{EmailReport, ObservationReport};
use crate::telemetry::SCANS_REPORTED;
use crate::AppState;
use axum::{
    extract::{Path, State},
    Extension, Json,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use utoipa::ToSchema;

#[derive(Deserialize, ToSchema)]
pub struct ReportPackageBody {
    pub version: String,
    #[serde(default)]
    pub recipient: Option<String>,
    #[serde(default)]
    pub inspector_url: Option<String>,
    #[serde(default)]
    pub additional_information: Option<String>,
    #[serde(default)]
    pub use_email: bool,
}

fn find_target<'a>(scans: &'a [ScanRow], name: &str, version: &str) -> ApiResult<&'a ScanRow> {
    if scans.is_empty() {
        return Err(ApiError::not_found(format!("No records for package `{name}` were found in the database")));
    }
    // One effective report per package name: a different already-reported
    // version blocks this one.
    if let Some(reported) = scans.iter().find(|s| s.reported_at.is_some() && s.version != version) {
        return Err(ApiError::conflict(format!(
            "Only one version of a package may be reported at a time (`{name}@{}` was already reported)",
            reported.version
        )));
    }
    scans
        .iter()
        .find(|s| s.version == version)
        .ok_or_else(|| ApiError::not_found(format!("No scan found for `{name}@{version}`")))
}

/// Forward a finished scan's findings to the external reporter service.
/// Effective at most once: the reported stamp is compare-and-set before the
/// outbound call and undone if that call fails, so operators can retry.
pub async fn report_package(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Extension(identity): Extension<Identity>,
    Json(body): Json<ReportPackageBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let name = normalize_name(&name);
    let scans = state.store.scans_by_name(&name).await?;
    let scan = find_target(&scans, &name, &body.version)?;

    if scan.status != ScanStatus::Finished {
        return Err(ApiError::conflict(format!(
            "Package `{name}@{}` is not in a FINISHED state",
            body.version
        )));
    }
    let inspector_url = body
        .inspector_url
        .clone()
        .or_else(|| scan.inspector_url.clone())
        .ok_or_else(|| ApiError::bad_request("inspector_url not given and not found in database"))?;

    // Observation reports always need a summary; email reports can fall back
    // on the matched rules when there are any.
    let rules_matched = state.store.rule_names_for(scan.scan_id).await?;
    if body.additional_information.is_none() && (rules_matched.is_empty() || !body.use_email) {
        let detail = if rules_matched.is_empty() {
            format!("additional_information is required as package `{name}@{}` has no matched rules", body.version)
        } else {
            "additional_information is required when using the observation API".to_string()
        };
        return Err(ApiError::bad_request(detail));
    }

    state.store.mark_reported(scan.scan_id, &identity.subject, Utc::now()).await?;

    let sent = if body.use_email {
        let report = EmailReport {
            name: name.clone(),
            version: body.version.clone(),
            rules_matched: rules_matched.clone(),
            recipient: body.recipient.clone(),
            inspector_url: inspector_url.clone(),
            additional_information: body.additional_information.clone(),
        };
        state.reporter.send_email(&report).await
    } else {
        // The gate above guarantees a summary on this path.
        let summary = body.additional_information.clone().unwrap_or_default();
        let report = ObservationReport::malware(summary, inspector_url.clone(), &rules_matched);
        state.reporter.send_observation(&name, &report).await
    };

    if let Err(e) = sent {
        // Undo the stamp so the scan stays eligible for another attempt.
        state.store.clear_reported(scan.scan_id).await?;
        warn!(name = %name, version = %body.version, error = %e, "report_send_failed");
        return Err(ApiError::bad_gateway("reporter_failure", format!("reporter call failed: {e}")));
    }

    SCANS_REPORTED.inc();
    info!(
        name = %name,
        version = %body.version,
        inspector_url = %inspector_url,
        use_email = body.use_email,
        reported_by = %identity.subject,
        "report_sent"
    );
    Ok(Json(serde_json::json!({})))
}
