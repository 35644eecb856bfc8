//! Outbound client for the external reporter service. The coordinator sends
//! at most one effective report per scan; retry policy belongs to operators,
//! not this client.

use async_trait::async_trait;
use serde::Serialize;

/// Report forwarded through the package index's observation API.
#[derive(Debug, Clone, Serialize)]
pub struct ObservationReport {
    pub kind: &'static str,
    pub summary: String,
    pub inspector_url: String,
    pub extra: serde_json::Value,
}

impl ObservationReport {
    pub fn malware(summary: String, inspector_url: String, rules_matched: &[String]) -> Self {
        Self {
            kind: "is_malware",
            summary,
            inspector_url,
            extra: serde_json::json!({ "yara_rules": rules_matched }),
        }
    }
}

/// Report delivered by email instead of the observation API.
#[derive(Debug, Clone, Serialize)]
pub struct EmailReport {
    pub name: String,
    pub version: String,
    pub rules_matched: Vec<String>,
    pub recipient: Option<String>,
    pub inspector_url: String,
    pub additional_information: Option<String>,
}

#[async_trait]
pub trait ReporterClient: Send + Sync + 'static {
    async fn send_observation(&self, name: &str, report: &ObservationReport) -> anyhow::Result<()>;
    async fn send_email(&self, report: &EmailReport) -> anyhow::Result<()>;
}

pub struct HttpReporter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpReporter {
    pub fn new(base_url: &str) -> Self {
        Self { client: reqwest::Client::new(), base_url: base_url.trim_end_matches('/').to_string() }
    }
}

#[async_trait]
impl ReporterClient for HttpReporter {
    async fn send_observation(&self, name: &str, report: &ObservationReport) -> anyhow::Result<()> {
        self.client
            .post(format!("{}/report/{name}", self.base_url))
            .json(report)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn send_email(&self, report: &EmailReport) -> anyhow::Result<()> {
        self.client
            .post(format!("{}/report/email", self.base_url))
            .json(report)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Test double: records every outbound report and fails on demand.
#[derive(Default)]
pub struct RecordingReporter {
    pub observations: std::sync::Mutex<Vec<(String, ObservationReport)>>,
    pub emails: std::sync::Mutex<Vec<EmailReport>>,
    pub fail_next: std::sync::atomic::AtomicBool,
}

impl RecordingReporter {
    fn check_failure(&self) -> anyhow::Result<()> {
        if self.fail_next.swap(false, std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("reporter unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl ReporterClient for RecordingReporter {
    async fn send_observation(&self, name: &str, report: &ObservationReport) -> anyhow::Result<()> {
        self.check_failure()?;
        self.observations.lock().unwrap().push((name.to_string(), report.clone()));
        Ok(())
    }

    async fn send_email(&self, report: &EmailReport) -> anyhow::Result<()> {
        self.check_failure()?;
        self.emails.lock().unwrap().push(report.clone());
        Ok(())
    }
}
