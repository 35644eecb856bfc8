//! The ruleset snapshot and its source. Dispatch stamps every lease with the
//! snapshot's commit hash; refresh swaps the whole snapshot at once.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use tracing::info;

#[derive(Debug, Clone)]
pub struct RulesetSnapshot {
    pub commit_hash: String,
    pub rule_names: Vec<String>,
}

/// Shared handle to the current snapshot. Readers clone the inner `Arc`, so
/// no lock is ever held across an await point; writers swap wholesale.
#[derive(Clone)]
pub struct RulesetHandle {
    inner: Arc<RwLock<Arc<RulesetSnapshot>>>,
}

impl RulesetHandle {
    pub fn new(snapshot: RulesetSnapshot) -> Self {
        Self { inner: Arc::new(RwLock::new(Arc::new(snapshot))) }
    }

    pub fn current(&self) -> Arc<RulesetSnapshot> {
        self.inner.read().expect("ruleset lock poisoned").clone()
    }

    pub fn swap(&self, snapshot: RulesetSnapshot) {
        *self.inner.write().expect("ruleset lock poisoned") = Arc::new(snapshot);
    }
}

/// Source of the authoritative ruleset.
#[async_trait]
pub trait RulesRepo: Send + Sync + 'static {
    async fn fetch(&self) -> anyhow::Result<RulesetSnapshot>;
}

/// GitHub-backed rules repository: rule names are the `*.yara` files at the
/// repo root, the hash is the head commit of the default branch.
pub struct GithubRulesRepo {
    client: reqwest::Client,
    repo: String,
    token: String,
}

#[derive(Deserialize)]
struct ContentsEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
}

impl GithubRulesRepo {
    pub fn new(repo: &str, token: &str) -> Self {
        Self { client: reqwest::Client::new(), repo: repo.to_string(), token: token.to_string() }
    }
}

#[async_trait]
impl RulesRepo for GithubRulesRepo {
    async fn fetch(&self) -> anyhow::Result<RulesetSnapshot> {
        let commit_hash = self
            .client
            .get(format!("https://api.github.com/repos/{}/commits/main", self.repo))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github.VERSION.sha")
            .header("User-Agent", "scan-coordinator")
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let entries: Vec<ContentsEntry> = self
            .client
            .get(format!("https://api.github.com/repos/{}/contents/", self.repo))
            .bearer_auth(&self.token)
            .header("User-Agent", "scan-coordinator")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut rule_names: Vec<String> = entries
            .into_iter()
            .filter(|e| e.kind == "file")
            .filter_map(|e| e.name.strip_suffix(".yara").map(str::to_string))
            .collect();
        rule_names.sort();

        info!(commit = %commit_hash, rules = rule_names.len(), "ruleset_fetched");
        Ok(RulesetSnapshot { commit_hash, rule_names })
    }
}

/// Fixed ruleset for tests.
pub struct StaticRulesRepo {
    pub snapshot: RulesetSnapshot,
}

#[async_trait]
impl RulesRepo for StaticRulesRepo {
    async fn fetch(&self) -> anyhow::Result<RulesetSnapshot> {
        Ok(self.snapshot.clone())
    }
}
