use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use coordinator::{build_router, test_support::test_state_with_reporter};
use serde_json::json;
use std::sync::atomic::Ordering;
use tower::util::ServiceExt;

fn request(method: &str, uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
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

/// Drive a scan all the way to FINISHED with the given matched rules.
async fn finish_scan(app: &axum::Router, name: &str, version: &str, rules: serde_json::Value) {
    let body = json!({"name": name, "version": version, "distributions": ["https://files.example/a.tar.gz"]});
    let res = app.clone().oneshot(request("POST", "/package", "ingest", body)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let res = app.clone().oneshot(request("POST", "/job", "w1", json!({}))).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let submit = json!({
        "name": name,
        "version": version,
        "score": 25,
        "inspector_url": format!("https://inspector.example/{name}/{version}"),
        "rules": rules,
        "files": {}
    });
    let res = app.clone().oneshot(request("PUT", "/package", "w1", submit)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
#[serial_test::serial]
async fn report_is_effective_exactly_once() {
    let (state, reporter) = test_state_with_reporter().await;
    let app = build_router(state);
    finish_scan(&app, "left-pad", "1.0.0", json!(["r1"])).await;

    let body = json!({"version": "1.0.0", "additional_information": "obfuscated download-and-exec payload"});
    let res = app.clone().oneshot(request("POST", "/report/left-pad", "operator", body.clone())).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    {
        let observations = reporter.observations.lock().unwrap();
        assert_eq!(observations.len(), 1);
        let (name, report) = &observations[0];
        assert_eq!(name, "left-pad");
        assert_eq!(report.kind, "is_malware");
        assert_eq!(report.summary, "obfuscated download-and-exec payload");
        assert_eq!(report.inspector_url, "https://inspector.example/left-pad/1.0.0");
    }

    let res = app.clone().oneshot(get("/package?name=left-pad&version=1.0.0", "reader")).await.unwrap();
    let scan = &body_json(res).await["scans"][0];
    assert!(scan["reported_at"].is_number());
    assert_eq!(scan["reported_by"], "operator");

    // A second attempt changes nothing.
    let res = app.oneshot(request("POST", "/report/left-pad", "operator", body)).await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    assert_eq!(body_json(res).await["code"], "already_reported");
    assert_eq!(reporter.observations.lock().unwrap().len(), 1);
}

#[tokio::test]
#[serial_test::serial]
async fn concurrent_reports_have_one_winner() {
    let (state, reporter) = test_state_with_reporter().await;
    let app = build_router(state);
    finish_scan(&app, "left-pad", "1.0.0", json!(["r1"])).await;

    let body = json!({"version": "1.0.0", "additional_information": "manual triage confirmed"});
    let (res_a, res_b) = tokio::join!(
        app.clone().oneshot(request("POST", "/report/left-pad", "op-a", body.clone())),
        app.clone().oneshot(request("POST", "/report/left-pad", "op-b", body.clone())),
    );
    let statuses = [res_a.unwrap().status(), res_b.unwrap().status()];
    assert!(statuses.contains(&StatusCode::OK), "{statuses:?}");
    assert!(statuses.contains(&StatusCode::CONFLICT), "{statuses:?}");
    assert_eq!(reporter.observations.lock().unwrap().len(), 1);
}

#[tokio::test]
#[serial_test::serial]
async fn failed_send_rolls_the_stamp_back() {
    let (state, reporter) = test_state_with_reporter().await;
    let app = build_router(state);
    finish_scan(&app, "left-pad", "1.0.0", json!(["r1"])).await;

    reporter.fail_next.store(true, Ordering::SeqCst);
    let body = json!({"version": "1.0.0", "additional_information": "manual triage confirmed"});
    let res = app.clone().oneshot(request("POST", "/report/left-pad", "operator", body.clone())).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);

    let res = app.clone().oneshot(get("/package?name=left-pad&version=1.0.0", "reader")).await.unwrap();
    let scan = &body_json(res).await["scans"][0];
    assert!(scan["reported_at"].is_null(), "stamp must be undone after a failed send");

    // Eligible again: the retry goes through.
    let res = app.oneshot(request("POST", "/report/left-pad", "operator", body)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(reporter.observations.lock().unwrap().len(), 1);
}

#[tokio::test]
#[serial_test::serial]
async fn unfinished_scans_cannot_be_reported() {
    let (state, _) = test_state_with_reporter().await;
    let app = build_router(state);
    let body = json!({"name": "left-pad", "version": "1.0.0", "distributions": ["https://files.example/a.tar.gz"]});
    let res = app.clone().oneshot(request("POST", "/package", "ingest", body)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = app.oneshot(request("POST", "/report/left-pad", "operator", json!({"version": "1.0.0"}))).await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
#[serial_test::serial]
async fn only_one_version_per_package_may_be_reported() {
    let (state, _) = test_state_with_reporter().await;
    let app = build_router(state);
    finish_scan(&app, "left-pad", "1.0.0", json!(["r1"])).await;
    finish_scan(&app, "left-pad", "1.0.1", json!(["r1"])).await;

    let body = json!({"version": "1.0.0", "additional_information": "manual triage confirmed"});
    let res = app.clone().oneshot(request("POST", "/report/left-pad", "operator", body)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body = json!({"version": "1.0.1", "additional_information": "manual triage confirmed"});
    let res = app.oneshot(request("POST", "/report/left-pad", "operator", body)).await.unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
}

#[tokio::test]
#[serial_test::serial]
async fn no_matched_rules_requires_additional_information() {
    let (state, reporter) = test_state_with_reporter().await;
    let app = build_router(state);
    finish_scan(&app, "left-pad", "1.0.0", json!([])).await;

    let res = app.clone().oneshot(request("POST", "/report/left-pad", "operator", json!({"version": "1.0.0"}))).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let body = json!({"version": "1.0.0", "additional_information": "manual triage: obfuscated payload"});
    let res = app.oneshot(request("POST", "/report/left-pad", "operator", body)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(reporter.observations.lock().unwrap().len(), 1);
}

#[tokio::test]
#[serial_test::serial]
async fn email_reports_use_the_email_channel() {
    let (state, reporter) = test_state_with_reporter().await;
    let app = build_router(state);
    finish_scan(&app, "left-pad", "1.0.0", json!(["r1"])).await;

    // With matched rules on record, the email path needs no extra summary.
    let body = json!({
        "version": "1.0.0",
        "use_email": true,
        "recipient": "security@index.example"
    });
    let res = app.oneshot(request("POST", "/report/left-pad", "operator", body)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(reporter.observations.lock().unwrap().is_empty());
    let emails = reporter.emails.lock().unwrap();
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].recipient.as_deref(), Some("security@index.example"));
    assert_eq!(emails[0].rules_matched, vec!["r1".to_string()]);
    assert!(emails[0].additional_information.is_none());
}

#[tokio::test]
#[serial_test::serial]
async fn observation_reports_require_a_summary() {
    let (state, reporter) = test_state_with_reporter().await;
    let app = build_router(state);
    finish_scan(&app, "left-pad", "1.0.0", json!(["r1"])).await;

    // Matched rules do not excuse a missing summary on the observation path.
    let res = app.clone().oneshot(request("POST", "/report/left-pad", "operator", json!({"version": "1.0.0"}))).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert!(reporter.observations.lock().unwrap().is_empty());

    let res = app.clone().oneshot(get("/package?name=left-pad&version=1.0.0", "reader")).await.unwrap();
    assert!(body_json(res).await["scans"][0]["reported_at"].is_null());
}
