use anyhow::{Context, Result};

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub db_url: String,
    pub db_pool_persistent_size: u32,
    pub db_pool_max_size: u32,
    /// Seconds a worker may hold a pending scan before it becomes reclaimable.
    pub job_timeout: u64,
    pub auth_domain: String,
    pub auth_audience: String,
    pub rules_repo: String,
    pub rules_repo_token: String,
    pub reporter_url: String,
    pub score_threshold: i32,
    pub git_sha: String,
    pub bind_addr: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let db_url = std::env::var("DB_URL").context("DB_URL must be set")?;
        Ok(Self {
            db_url,
            db_pool_persistent_size: env_parse("DB_CONNECTION_POOL_PERSISTENT_SIZE", 5),
            db_pool_max_size: env_parse("DB_CONNECTION_POOL_MAX_SIZE", 15),
            job_timeout: env_parse("JOB_TIMEOUT", 120),
            auth_domain: std::env::var("AUTH_DOMAIN").unwrap_or_default(),
            auth_audience: std::env::var("AUTH_AUDIENCE").unwrap_or_default(),
            rules_repo: std::env::var("RULES_REPO").unwrap_or_default(),
            rules_repo_token: std::env::var("RULES_REPO_TOKEN").unwrap_or_default(),
            reporter_url: std::env::var("REPORTER_URL").unwrap_or_default(),
            score_threshold: env_parse("SCORE_THRESHOLD", 20),
            git_sha: std::env::var("GIT_SHA").unwrap_or_else(|_| "development".into()),
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into()),
        })
    }

    /// Settings for tests: local database, short lease, no external services.
    pub fn for_tests(db_url: &str) -> Self {
        Self {
            db_url: db_url.to_string(),
            db_pool_persistent_size: 2,
            db_pool_max_size: 10,
            job_timeout: 120,
            auth_domain: String::new(),
            auth_audience: String::new(),
            rules_repo: String::new(),
            rules_repo_token: String::new(),
            reporter_url: "http://localhost:9999".into(),
            score_threshold: 20,
            git_sha: "test".into(),
            bind_addr: "127.0.0.1:0".into(),
        }
    }
}
