//! Binary entrypoint for the scan coordinator.
use anyhow::Context;
use axum::{body::Body, http::Request, middleware::{self, Next}, response::Response};
use coordinator::auth::JwtVerifier;
use coordinator::config::Settings;
use coordinator::reporter::HttpReporter;
use coordinator::ruleset::{GithubRulesRepo, RulesRepo, RulesetHandle};
use coordinator::store::ScanStore;
use coordinator::telemetry::{normalize_path, HTTP_REQUESTS, HTTP_REQUEST_DURATION, SCANS_IN_QUEUE};
use coordinator::{build_router, db::init_db, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let settings = Settings::from_env()?;
    let pool = init_db(&settings).await.context("database must be available")?;
    let store = ScanStore::new(pool);

    let rules_repo = Arc::new(GithubRulesRepo::new(&settings.rules_repo, &settings.rules_repo_token));
    let snapshot = rules_repo.fetch().await.context("initial ruleset fetch")?;
    store.reconcile_rules(&snapshot.rule_names).await?;
    let ruleset = RulesetHandle::new(snapshot);

    let in_flight = store.in_flight_count().await?;
    SCANS_IN_QUEUE.set(in_flight);

    let verifier = Arc::new(JwtVerifier::new(&settings.auth_domain, &settings.auth_audience));
    let reporter = Arc::new(HttpReporter::new(&settings.reporter_url));
    let bind_addr = settings.bind_addr.clone();
    let state = AppState {
        store,
        ruleset,
        rules_repo,
        reporter,
        verifier,
        settings: Arc::new(settings),
    };
    let app = build_router(state);

    async fn track_metrics(req: Request<Body>, next: Next) -> Response {
        let method = req.method().clone();
        let path_label = normalize_path(req.uri().path());
        let start = std::time::Instant::now();
        let resp = next.run(req).await;
        let status = resp.status().as_u16().to_string();
        HTTP_REQUESTS.with_label_values(&[method.as_str(), path_label.as_str(), status.as_str()]).inc();
        HTTP_REQUEST_DURATION
            .with_label_values(&[method.as_str(), path_label.as_str()])
            .observe(start.elapsed().as_secs_f64());
        resp
    }
    const MAX_BODY_BYTES: usize = 1024 * 1024; // 1MB
    let app = app
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(middleware::from_fn(track_metrics));

    let addr: SocketAddr = bind_addr.parse()?;
    info!(%addr, "coordinator listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown = async {
        tokio::signal::ctrl_c().await.expect("install ctrl_c");
        info!(target: "shutdown.signal", "received Ctrl+C");
        tokio::time::sleep(Duration::from_millis(200)).await; // graceful drain window
    };
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    Ok(())
}
