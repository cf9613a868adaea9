mod common;

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use common::{Harness, SERVER_ID, SGC_ID};
use manman::api::{create_router, AppState};
use manman::domain::SessionStatus;
use manman::persistence::SessionRepository;
use serde_json::{json, Value};
use tower::ServiceExt;

fn router(h: &Harness) -> Router {
    create_router(AppState::new(h.handler.clone(), h.shutdown.clone()))
}

async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_start_conflict_and_stop_over_http() {
    let h = Harness::new().await;
    let uri = format!("/api/server-game-configs/{SGC_ID}/sessions");

    let (status, session) = send(router(&h), "POST", &uri, Some(json!({}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(session["status"], "pending");
    let session_id = session["session_id"].as_i64().unwrap();

    let (status, err) = send(router(&h), "POST", &uri, Some(json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["code"], "failed_precondition");

    let (status, stopped) = send(
        router(&h),
        "POST",
        &format!("/api/sessions/{session_id}/stop"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stopped["status"], "stopping");

    let (status, list) = send(router(&h), "GET", &format!("{uri}?status=stopping"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_session_is_404() {
    let h = Harness::new().await;
    let (status, err) = send(router(&h), "GET", "/api/sessions/4242", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(err["code"], "not_found");
}

#[tokio::test]
async fn test_send_input_over_http() {
    let h = Harness::new().await;
    let (_, session) = send(
        router(&h),
        "POST",
        &format!("/api/server-game-configs/{SGC_ID}/sessions"),
        Some(json!({"parameters": {"difficulty": "hard"}})),
    )
    .await;
    let session_id = session["session_id"].as_i64().unwrap();
    assert_eq!(session["parameters"]["difficulty"], "hard");

    let input_uri = format!("/api/sessions/{session_id}/input");
    let (status, err) = send(router(&h), "POST", &input_uri, Some(json!({"input": "list\n"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(err["code"], "failed_precondition");

    h.store
        .update_session_status(session_id, SessionStatus::Running)
        .await
        .unwrap();
    let (status, _) = send(router(&h), "POST", &input_uri, Some(json!({"input": "list\n"}))).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_available_ports_endpoint() {
    let h = Harness::new().await;
    send(
        router(&h),
        "POST",
        &format!("/api/server-game-configs/{SGC_ID}/sessions"),
        Some(json!({})),
    )
    .await;

    let (status, body) = send(
        router(&h),
        "GET",
        &format!("/api/servers/{SERVER_ID}/ports/available?start=25564&end=25566&protocol=tcp"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["protocol"], "TCP");
    assert_eq!(body["ports"], json!([25564, 25566]));

    let (status, err) = send(
        router(&h),
        "GET",
        &format!("/api/servers/{SERVER_ID}/ports/available?start=0&end=10"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(err["code"], "invalid_argument");
}

#[tokio::test]
async fn test_health() {
    let h = Harness::new().await;
    let (status, body) = send(router(&h), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
