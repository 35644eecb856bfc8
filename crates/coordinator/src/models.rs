use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "scan_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    /// Waiting to be handed to a worker.
    Queued,
    /// Leased to a worker, waiting for its verdict.
    Pending,
    Finished,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Queued => "queued",
            ScanStatus::Pending => "pending",
            ScanStatus::Finished => "finished",
            ScanStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScanRow {
    pub scan_id: Uuid,
    pub name: String,
    pub version: String,
    pub status: ScanStatus,
    pub score: Option<i32>,
    pub inspector_url: Option<String>,
    pub commit_hash: Option<String>,
    pub files: Option<serde_json::Value>,
    pub fail_reason: Option<String>,
    pub queued_at: DateTime<Utc>,
    pub queued_by: String,
    pub pending_at: Option<DateTime<Utc>>,
    pub pending_by: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub finished_by: Option<String>,
    pub reported_at: Option<DateTime<Utc>>,
    pub reported_by: Option<String>,
}

/// One scan handed to a worker by dispatch.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Job {
    pub name: String,
    pub version: String,
    pub distributions: Vec<String>,
    /// Rules-repo commit the worker must evaluate against.
    pub hash: String,
    pub rules: Vec<String>,
}

/// Wire form of a scan for listings. Timestamps serialize as Unix seconds.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ScanRecord {
    pub scan_id: Uuid,
    pub name: String,
    pub version: String,
    pub status: ScanStatus,
    pub score: Option<i32>,
    pub inspector_url: Option<String>,
    pub commit_hash: Option<String>,
    pub fail_reason: Option<String>,
    pub rules: Vec<String>,
    pub download_urls: Vec<String>,
    pub files: Option<serde_json::Value>,
    pub queued_at: i64,
    pub queued_by: String,
    pub pending_at: Option<i64>,
    pub pending_by: Option<String>,
    pub finished_at: Option<i64>,
    pub finished_by: Option<String>,
    pub reported_at: Option<i64>,
    pub reported_by: Option<String>,
}

impl ScanRecord {
    pub fn from_row(row: ScanRow, rules: Vec<String>, download_urls: Vec<String>) -> Self {
        Self {
            scan_id: row.scan_id,
            name: row.name,
            version: row.version,
            status: row.status,
            score: row.score,
            inspector_url: row.inspector_url,
            commit_hash: row.commit_hash,
            fail_reason: row.fail_reason,
            rules,
            download_urls,
            files: row.files,
            queued_at: row.queued_at.timestamp(),
            queued_by: row.queued_by,
            pending_at: row.pending_at.map(|t| t.timestamp()),
            pending_by: row.pending_by,
            finished_at: row.finished_at.map(|t| t.timestamp()),
            finished_by: row.finished_by,
            reported_at: row.reported_at.map(|t| t.timestamp()),
            reported_by: row.reported_by,
        }
    }
}

/// Canonical package name per the index's rules: lowercase, with every run
/// of `.`, `-` and `_` replaced by a single `-` (wherever it appears).
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.chars() {
        if matches!(c, '.' | '-' | '_') {
            in_separator = true;
            continue;
        }
        if in_separator {
            out.push('-');
            in_separator = false;
        }
        out.extend(c.to_lowercase());
    }
    if in_separator {
        out.push('-');
    }
    out
}
