//! Integration tests for the `McpClient` facade.
//!
//! The facade owns the spawn → handshake → typed-call path, so these tests
//! run against real child processes: a scripted `/bin/sh` server answering
//! the deterministic request ids the transport allocates. Covers:
//! - readiness gating before, during, and after a session
//! - spawn failure surfacing without changing the lifecycle state
//! - the full session: handshake, typed tool rows, verbatim call results
//! - malformed result envelopes decoding to codec errors

#![cfg(unix)]

use serde_json::json;

use mcp_intercept::client::lifecycle::LifecycleState;
use mcp_intercept::client::ClientOptions;
use mcp_intercept::{AppError, McpClient};

/// Options spawning `/bin/sh -c script` as the server.
fn sh_options(script: &str) -> ClientOptions {
    ClientOptions::new("/bin/sh", vec!["-c".into(), script.into()])
}

#[tokio::test]
async fn gated_calls_fail_before_connect() {
    let client = McpClient::new(sh_options("exit 0"));
    assert_eq!(client.state(), LifecycleState::Uninitialized);
    assert!(client.initialize_result().is_none());

    let err = client
        .list_tools()
        .await
        .expect_err("tools/list must be gated before connect");
    match err {
        AppError::NotInitialized(msg) => {
            assert!(msg.contains("tools/list"), "must name the operation: {msg}");
        }
        other => panic!("expected AppError::NotInitialized, got: {other:?}"),
    }
}

#[tokio::test]
async fn spawn_failure_surfaces_and_leaves_state_untouched() {
    let mut client = McpClient::new(ClientOptions::new(
        "/nonexistent/mcp-server-binary",
        Vec::new(),
    ));

    let err = client
        .connect()
        .await
        .expect_err("spawning a missing binary must fail");
    assert!(
        matches!(err, AppError::Spawn(_)),
        "expected AppError::Spawn, got: {err:?}"
    );
    assert_eq!(client.state(), LifecycleState::Uninitialized);
    assert!(client.initialize_result().is_none());
}

/// Answers ids 1 (initialize), 2 (tools/list), and 3 (tools/call) in order,
/// consuming one request line before each reply and the `initialized`
/// notification in between; the transport's id counter makes the ids
/// deterministic.
const SCRIPTED_SERVER: &str = r#"
read init
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"scripted-server","version":"0.1.0"}}}'
read initialized
read list
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo text back","annotations":{"readOnlyHint":true}}]}}'
read call
printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"hello"}]}}'
"#;

#[tokio::test]
async fn full_session_against_a_scripted_server() {
    let mut client = McpClient::new(sh_options(SCRIPTED_SERVER));

    let result = client.connect().await.expect("handshake must complete");
    assert_eq!(result.server_info.name, "scripted-server");
    assert!(result.capabilities.tools.is_some());
    assert_eq!(client.state(), LifecycleState::Ready);
    assert_eq!(
        client
            .initialize_result()
            .expect("result retained after connect")
            .server_info
            .name,
        "scripted-server"
    );

    let tools = client.list_tools().await.expect("tools/list must resolve");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "echo");
    assert_eq!(tools[0].description.as_deref(), Some("Echo text back"));
    assert_eq!(
        tools[0]
            .annotations
            .as_ref()
            .and_then(|a| a.read_only_hint),
        Some(true),
        "annotations must decode from camelCase"
    );

    let outcome = client
        .call_tool("echo", Some(json!({"text": "hello"})))
        .await
        .expect("tools/call must resolve");
    assert_eq!(outcome["content"][0]["text"], "hello");

    client.disconnect().await;
    assert_eq!(client.state(), LifecycleState::Closed);

    let err = client
        .list_tools()
        .await
        .expect_err("calls after disconnect must be gated");
    match err {
        AppError::NotInitialized(msg) => {
            assert!(msg.contains("closed"), "must name the state: {msg}");
        }
        other => panic!("expected AppError::NotInitialized, got: {other:?}"),
    }
}

/// Handshake succeeds, then tools/list answers with a result whose `tools`
/// field is not an array.
const MALFORMED_LIST_SERVER: &str = r#"
read init
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","serverInfo":{"name":"scripted-server"}}}'
read initialized
read list
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":42}}'
"#;

#[tokio::test]
async fn malformed_list_result_is_a_codec_error() {
    let mut client = McpClient::new(sh_options(MALFORMED_LIST_SERVER));
    client.connect().await.expect("handshake must complete");

    let err = client
        .list_tools()
        .await
        .expect_err("a malformed result envelope must not decode");
    match err {
        AppError::Codec(msg) => assert!(
            msg.contains("tools/list"),
            "codec errors must name the operation: {msg}"
        ),
        other => panic!("expected AppError::Codec, got: {other:?}"),
    }

    client.disconnect().await;
}

/// The server answers initialize with an error object; connect must fail,
/// tear the transport down, and leave the client retryable.
const REFUSING_SERVER: &str = r#"
read init
printf '%s\n' '{"jsonrpc":"2.0","id":1,"error":{"code":-32600,"message":"not today"}}'
"#;

#[tokio::test]
async fn rejected_handshake_leaves_the_client_retryable() {
    let mut client = McpClient::new(sh_options(REFUSING_SERVER));

    let err = client
        .connect()
        .await
        .expect_err("a refused initialize must fail connect");
    match err {
        AppError::Protocol(error) => assert_eq!(error.message, "not today"),
        other => panic!("expected AppError::Protocol, got: {other:?}"),
    }
    assert_eq!(
        client.state(),
        LifecycleState::Uninitialized,
        "a failed connect must revert so the caller can retry"
    );
}
