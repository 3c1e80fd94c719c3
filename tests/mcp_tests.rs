//! MCP stdio server: listing, calling, protocol errors

mod common;

use std::sync::Arc;

use serde_json::{json, Value};

use chi_agent::mcp::McpServer;

use common::{ok, registry, SpyRunner};

fn server_with(runner: SpyRunner) -> (McpServer, Arc<SpyRunner>) {
    let runner = Arc::new(runner);
    (McpServer::new(registry(runner.clone())), runner)
}

async fn request(server: &McpServer, message: Value) -> Value {
    let response = server
        .handle_line(&message.to_string())
        .await
        .expect("request should be answered");
    serde_json::to_value(response).unwrap()
}

#[tokio::test]
async fn test_tools_list_is_prefixed_and_annotated() {
    let (server, _) = server_with(SpyRunner::permissive());

    let response = request(&server, json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" })).await;
    let tools = response["result"]["tools"].as_array().unwrap();

    assert_eq!(tools.len(), 12);
    assert!(tools.iter().all(|t| t["name"].as_str().unwrap().starts_with("chi_")));

    let shell = tools.iter().find(|t| t["name"] == "chi_run_shell").unwrap();
    assert_eq!(shell["annotations"]["destructiveHint"], true);
    assert_eq!(shell["inputSchema"]["required"][0], "command");

    let status = tools.iter().find(|t| t["name"] == "chi_get_network_status").unwrap();
    assert_eq!(status["annotations"]["readOnlyHint"], true);
}

#[tokio::test]
async fn test_call_runs_through_registry() {
    let (server, runner) = server_with(SpyRunner::new(&["sh"], |_| ok("up 3 days\n")));

    let response = request(
        &server,
        json!({
            "jsonrpc": "2.0",
            "id": "a",
            "method": "tools/call",
            "params": { "name": "chi_run_shell", "arguments": { "command": "uptime" } }
        }),
    )
    .await;

    assert_eq!(response["id"], "a");
    assert_eq!(response["result"]["isError"], false);
    assert_eq!(response["result"]["structuredContent"]["stdout"], "up 3 days");
    assert_eq!(response["result"]["content"][0]["type"], "text");
    assert_eq!(runner.commands(), vec!["sh -c uptime"]);
}

#[tokio::test]
async fn test_denied_command_is_tool_error_not_protocol_error() {
    let (server, runner) = server_with(SpyRunner::permissive());

    let response = request(
        &server,
        json!({
            "jsonrpc": "2.0",
            "id": 2,
            "method": "tools/call",
            "params": { "name": "chi_run_shell", "arguments": { "command": "rm -rf /" } }
        }),
    )
    .await;

    assert!(response.get("error").is_none());
    assert_eq!(response["result"]["isError"], true);
    assert_eq!(response["result"]["structuredContent"]["error"]["kind"], "safety_denied");
    assert!(runner.commands().is_empty());
}

#[tokio::test]
async fn test_unknown_and_unprefixed_tools_rejected() {
    let (server, runner) = server_with(SpyRunner::permissive());

    for name in ["chi_format_disk", "run_shell"] {
        let response = request(
            &server,
            json!({
                "jsonrpc": "2.0",
                "id": 3,
                "method": "tools/call",
                "params": { "name": name, "arguments": {} }
            }),
        )
        .await;
        assert_eq!(response["error"]["code"], -32602);
        assert_eq!(response["error"]["message"], format!("unknown tool: {}", name));
    }
    assert!(runner.commands().is_empty());
}

#[tokio::test]
async fn test_invalid_arguments_do_not_spawn() {
    let (server, runner) = server_with(SpyRunner::permissive());

    let response = request(
        &server,
        json!({
            "jsonrpc": "2.0",
            "id": 4,
            "method": "tools/call",
            "params": { "name": "chi_install_system", "arguments": { "name": "" } }
        }),
    )
    .await;

    assert_eq!(response["result"]["isError"], true);
    assert_eq!(response["result"]["structuredContent"]["error"]["kind"], "invalid_argument");
    assert!(runner.commands().is_empty());
}

#[tokio::test]
async fn test_protocol_errors() {
    let (server, _) = server_with(SpyRunner::permissive());

    let parse = serde_json::to_value(server.handle_line("{not json").await.unwrap()).unwrap();
    assert_eq!(parse["error"]["code"], -32700);
    assert_eq!(parse["id"], Value::Null);

    let missing = request(&server, json!({ "jsonrpc": "2.0", "id": 5, "method": "resources/list" })).await;
    assert_eq!(missing["error"]["code"], -32601);

    let notification = json!({ "jsonrpc": "2.0", "method": "notifications/initialized" });
    assert!(server.handle_line(&notification.to_string()).await.is_none());
}

#[tokio::test]
async fn test_serve_stdio_session() {
    let (server, _) = server_with(SpyRunner::permissive());
    let input = [
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": { "protocolVersion": "2025-03-26", "capabilities": {} }
        }),
        json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
        json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" }),
    ]
    .iter()
    .map(|m| format!("{}\n", m))
    .collect::<String>();

    let mut output = Vec::new();
    server.serve(input.as_bytes(), &mut output).await.unwrap();

    let lines: Vec<Value> = String::from_utf8(output)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    // The notification gets no response
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["result"]["protocolVersion"], "2025-03-26");
    assert_eq!(lines[0]["result"]["serverInfo"]["name"], "chi-agent");
    assert_eq!(lines[1]["id"], 2);
}
