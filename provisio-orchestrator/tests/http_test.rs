// Integration tests for the HTTP command surface

mod common;

use axum_test::TestServer;
use common::{create_test_app, fixed_template};
use serde_json::{json, Value};
use uuid::Uuid;

#[tokio::test]
async fn test_root() {
    let (_h, app) = create_test_app();
    let server = TestServer::new(app).unwrap();
    let response = server.get("/").await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.text(), "Provisio Orchestrator Online");
}

#[tokio::test]
async fn test_ping_command() {
    let (_h, app) = create_test_app();
    let server = TestServer::new(app).unwrap();

    let response = server.post("/commands/ping").json(&json!({ "msg": "PING" })).await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["command"], "ping");
    assert_eq!(body["result"], "PONG");
    assert!(body["command_id"].as_str().is_some());

    let response = server.post("/commands/ping").await;
    let body: Value = response.json();
    assert_eq!(body["result"], "DONE");
}

#[tokio::test]
async fn test_create_vm_command() {
    let (h, app) = create_test_app();
    fixed_template(&h.backend, 5);
    h.backend.set_next_ids(7, 42);
    h.backend.assign_ip(42, "10.0.0.5");
    let server = TestServer::new(app).unwrap();

    let response = server
        .post("/commands/create_vm")
        .json(&json!({
            "login": "bob", "password": "pw", "passwd": "guest",
            "templateid": "5", "cpu": "1", "ram": "1024", "drive": "10240"
        }))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["result"], json!({ "userid": 7, "vmid": 42, "ip": "10.0.0.5" }));

    let stats: Value = server
        .post("/commands/statistics")
        .json(&json!({ "method": "create_vm" }))
        .await
        .json();
    assert_eq!(stats["result"]["create_vm"]["counter"], 1);
}

#[tokio::test]
async fn test_workflow_failures_are_returned_not_raised() {
    let (_h, app) = create_test_app();
    let server = TestServer::new(app).unwrap();

    let response = server
        .post("/commands/create_vm")
        .json(&json!({ "login": "bob", "templateid": 5 }))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["result"]["error"], "InvalidRequest");
    assert!(body["result"]["trace"].as_array().is_some());
}

#[tokio::test]
async fn test_disabled_entry_point_returns_null() {
    let (_h, app) = create_test_app();
    let server = TestServer::new(app).unwrap();
    let body: Value = server
        .post("/commands/reinstall_vm")
        .json(&json!({ "debug": "turn_method_off" }))
        .await
        .json();
    assert_eq!(body["result"], Value::Null);
}

#[tokio::test]
async fn test_unknown_command_and_bad_params() {
    let (_h, app) = create_test_app();
    let server = TestServer::new(app).unwrap();

    let response = server.post("/commands/CreateVM").expect_failure().await;
    assert_eq!(response.status_code(), 404);
    let body: Value = response.json();
    assert_eq!(body["error"], "unknown_command");

    let response = server
        .post("/commands/ping")
        .json(&json!([1, 2, 3]))
        .expect_failure()
        .await;
    assert_eq!(response.status_code(), 400);

    let response = server
        .post("/commands/ping")
        .text("{not json")
        .expect_failure()
        .await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_admin_status_and_task_cancel() {
    let (_h, app) = create_test_app();
    let server = TestServer::new(app).unwrap();

    let response = server.get("/admin/status").await;
    assert_eq!(response.status_code(), 200);
    let body: Value = response.json();
    assert_eq!(body["provider"], "mock");
    assert_eq!(body["running_tasks"], 0);
    let commands: Vec<String> = serde_json::from_value(body["commands"].clone()).unwrap();
    assert!(commands.contains(&"create_vm".to_string()));
    assert!(commands.contains(&"reinstall_vm".to_string()));

    let response = server
        .delete(&format!("/admin/tasks/{}", Uuid::new_v4()))
        .expect_failure()
        .await;
    assert_eq!(response.status_code(), 404);
}
