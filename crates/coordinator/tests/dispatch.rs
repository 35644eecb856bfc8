use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use coordinator::{build_router, test_support::test_state, AppState};
use serde_json::json;
use tower::util::ServiceExt;

fn post(uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

async fn body_json(res: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(res.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn queue(app: &axum::Router, name: &str, version: &str) {
    let body = json!({"name": name, "version": version, "distributions": [format!("https://files.example/{name}-{version}.tar.gz")]});
    let res = app.clone().oneshot(post("/package", "ingest", body)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

/// Push a pending scan's lease past expiry without waiting for it.
async fn expire_lease(state: &AppState, name: &str, version: &str) {
    sqlx::query("UPDATE scans SET pending_at = pending_at - interval '1 hour' WHERE name = $1 AND version = $2")
        .bind(name)
        .bind(version)
        .execute(state.store.pool())
        .await
        .unwrap();
}

#[tokio::test]
#[serial_test::serial]
async fn dispatch_hands_out_oldest_queued() {
    let state = test_state().await;
    let app = build_router(state);
    queue(&app, "left-pad", "1.0.0").await;
    queue(&app, "right-pad", "2.0.0").await;

    let res = app.clone().oneshot(post("/job", "w1", json!({}))).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let job = body_json(res).await;
    assert_eq!(job["name"], "left-pad");
    assert_eq!(job["hash"], "abc123");
    assert_eq!(job["rules"], json!(["r1", "r2"]));
    assert_eq!(job["distributions"], json!(["https://files.example/left-pad-1.0.0.tar.gz"]));

    let res = app.clone().oneshot(get("/package?name=left-pad&version=1.0.0", "reader")).await.unwrap();
    let v = body_json(res).await;
    let scan = &v["scans"][0];
    assert_eq!(scan["status"], "pending");
    assert_eq!(scan["pending_by"], "w1");
    assert_eq!(scan["commit_hash"], "abc123");
    assert!(scan["pending_at"].is_number());
}

#[tokio::test]
#[serial_test::serial]
async fn empty_queue_is_204() {
    let app = build_router(test_state().await);
    let res = app.oneshot(post("/job", "w1", json!({}))).await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
#[serial_test::serial]
async fn concurrent_dispatch_has_one_winner() {
    let app = build_router(test_state().await);
    queue(&app, "left-pad", "1.0.0").await;

    let (res_a, res_b) = tokio::join!(
        app.clone().oneshot(post("/job", "w1", json!({}))),
        app.clone().oneshot(post("/job", "w2", json!({}))),
    );
    let statuses = [res_a.unwrap().status(), res_b.unwrap().status()];
    assert!(statuses.contains(&StatusCode::OK), "one dispatcher must win: {statuses:?}");
    assert!(statuses.contains(&StatusCode::NO_CONTENT), "the other must get nothing: {statuses:?}");
}

#[tokio::test]
#[serial_test::serial]
async fn expired_lease_is_reclaimed() {
    let state = test_state().await;
    let app = build_router(state.clone());
    queue(&app, "left-pad", "1.0.0").await;

    let res = app.clone().oneshot(post("/job", "w1", json!({}))).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    // Lease still live: nothing to hand out.
    let res = app.clone().oneshot(post("/job", "w2", json!({}))).await.unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    expire_lease(&state, "left-pad", "1.0.0").await;
    let res = app.clone().oneshot(post("/job", "w2", json!({}))).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let job = body_json(res).await;
    assert_eq!(job["name"], "left-pad");

    let res = app.oneshot(get("/package?name=left-pad&version=1.0.0", "reader")).await.unwrap();
    let v = body_json(res).await;
    assert_eq!(v["scans"][0]["pending_by"], "w2");
}

#[tokio::test]
#[serial_test::serial]
async fn queued_rows_win_over_expired_leases() {
    let state = test_state().await;
    let app = build_router(state.clone());
    queue(&app, "left-pad", "1.0.0").await;
    let res = app.clone().oneshot(post("/job", "w1", json!({}))).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    expire_lease(&state, "left-pad", "1.0.0").await;
    queue(&app, "right-pad", "2.0.0").await;

    // Fresh queue beats the reclaim branch even though the expired lease is older.
    let res = app.clone().oneshot(post("/job", "w2", json!({}))).await.unwrap();
    let job = body_json(res).await;
    assert_eq!(job["name"], "right-pad");

    let res = app.clone().oneshot(post("/job", "w2", json!({}))).await.unwrap();
    let job = body_json(res).await;
    assert_eq!(job["name"], "left-pad");
}

#[tokio::test]
#[serial_test::serial]
async fn reclaim_preserves_queued_at() {
    let state = test_state().await;
    let app = build_router(state.clone());
    queue(&app, "left-pad", "1.0.0").await;

    let res = app.clone().oneshot(get("/package?name=left-pad&version=1.0.0", "reader")).await.unwrap();
    let queued_at_before = body_json(res).await["scans"][0]["queued_at"].clone();

    let res = app.clone().oneshot(post("/job", "w1", json!({}))).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    expire_lease(&state, "left-pad", "1.0.0").await;
    let res = app.clone().oneshot(post("/job", "w2", json!({}))).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app.oneshot(get("/package?name=left-pad&version=1.0.0", "reader")).await.unwrap();
    let v = body_json(res).await;
    assert_eq!(v["scans"][0]["queued_at"], queued_at_before);
    assert_eq!(v["scans"][0]["status"], "pending");
}
