//! UI socket and status endpoint, end to end

mod common;

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tower::ServiceExt;

use chi_agent::dashboard::{create_router, DashboardState};
use chi_agent::grpc::{self, AgentClient, ClientError};

use common::{call_response, ok, text_response, Harness, ScriptedModel, SpyRunner};

fn network_runner() -> SpyRunner {
    SpyRunner::new(&["nmcli"], |spec| {
        if spec.args.iter().any(|a| a == "general") {
            ok("connected\n")
        } else {
            ok("Home:802-11-wireless:wlan0:activated\n")
        }
    })
}

#[tokio::test]
async fn test_ui_socket_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("run").join("chi-agent.sock");

    let model = ScriptedModel::replies(vec![
        call_response("get_network_status", json!({})),
        text_response("You're online."),
    ]);
    let h = Harness::new(model, network_runner());

    let listener = grpc::bind_socket(&socket).unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(grpc::serve(h.controller.clone(), listener, async {
        let _ = stop_rx.await;
    }));

    let mut client = AgentClient::connect(&socket).await.unwrap();

    let status = client.status().await.unwrap();
    assert_eq!(status.status, "ready");

    let reply = client.ask("am I online?", None).await.unwrap();
    assert_eq!(reply.reply, "You're online.");
    assert_eq!(reply.tool_calls.len(), 1);
    assert_eq!(reply.tool_calls[0].tool, "get_network_status");
    let result: Value = serde_json::from_str(&reply.tool_calls[0].result_json).unwrap();
    assert_eq!(result["state"], "connected");

    let conversations = client.history(0).await.unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].id, reply.conversation_id);

    let records = client.data(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(client.delete_data_record(records[0].id).await.unwrap());
    assert!(!client.delete_data_record(records[0].id).await.unwrap());

    assert!(client.delete_conversation(&reply.conversation_id).await.unwrap());
    assert!(!client.delete_conversation(&reply.conversation_id).await.unwrap());

    // Unknown conversation maps to NOT_FOUND
    match client.ask("hello", Some("missing")).await {
        Err(ClientError::Grpc(status)) => assert_eq!(status.code(), tonic::Code::NotFound),
        other => panic!("expected NOT_FOUND, got {:?}", other.map(|r| r.reply)),
    }

    let _ = stop_tx.send(());
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_connect_without_daemon_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let err = AgentClient::connect(dir.path().join("absent.sock")).await.err().unwrap();
    assert!(matches!(err, ClientError::Connection { .. }));
    assert!(err.to_string().contains("absent.sock"));
}

#[tokio::test]
async fn test_status_endpoint() {
    let h = Harness::new(ScriptedModel::replies(vec![]), SpyRunner::permissive());
    let app = create_router(DashboardState {
        controller: h.controller.clone(),
    });

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let status: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["status"], "ready");
    assert_eq!(status["model"], "scripted");
    assert_eq!(status["turns_in_flight"], 0);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/tools").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let tools: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(tools.as_array().unwrap().len(), 12);
    assert_eq!(tools[0]["name"], "launch_app");

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
