//! Integration tests for the initialize/initialized handshake.
//!
//! Each test scripts the server side of the exchange by hand over an
//! in-memory duplex. Covers:
//! - the full three-step handshake and the wire shape of `initialize`
//! - `ensure_ready` gating before, during, and after
//! - strict vs lenient treatment of a protocol-revision mismatch
//! - error replies and malformed results reverting the state machine

use serde_json::json;

use mcp_intercept::client::lifecycle::{
    ClientInfo, LifecycleNegotiator, LifecycleState, VersionPolicy, INITIALIZED_NOTIFICATION,
    INITIALIZE_METHOD, PROTOCOL_VERSION,
};
use mcp_intercept::protocol::jsonrpc::error_codes;
use mcp_intercept::AppError;

use super::test_helpers::{paired_transport, read_frame, write_line};

fn test_client_info() -> ClientInfo {
    ClientInfo {
        name: "test-host".into(),
        version: "0.0.1".into(),
    }
}

#[tokio::test]
async fn handshake_completes_and_reaches_ready() {
    let (transport, mut peer_read, mut peer_write) = paired_transport();

    let peer = tokio::spawn(async move {
        let init = read_frame(&mut peer_read).await;
        assert_eq!(init["method"], INITIALIZE_METHOD);
        assert_eq!(init["params"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(init["params"]["clientInfo"]["name"], "test-host");
        assert_eq!(init["params"]["clientInfo"]["version"], "0.0.1");
        assert_eq!(
            init["params"]["capabilities"]["roots"]["listChanged"], true,
            "the roots capability must advertise listChanged in camelCase"
        );

        write_line(
            &mut peer_write,
            &json!({
                "jsonrpc": "2.0",
                "id": init["id"],
                "result": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": "fake-server", "version": "1.2.3"}
                }
            }),
        )
        .await;

        let initialized = read_frame(&mut peer_read).await;
        assert_eq!(initialized["method"], INITIALIZED_NOTIFICATION);
        assert!(
            initialized.get("id").is_none(),
            "initialized must be a notification"
        );
    });

    let mut negotiator = LifecycleNegotiator::new(VersionPolicy::Lenient);
    assert_eq!(negotiator.state(), LifecycleState::Uninitialized);

    let result = negotiator
        .initialize(&transport, test_client_info())
        .await
        .expect("handshake must complete");

    assert_eq!(result.protocol_version, PROTOCOL_VERSION);
    assert_eq!(result.server_info.name, "fake-server");
    assert_eq!(result.server_info.version.as_deref(), Some("1.2.3"));
    assert!(result.capabilities.tools.is_some());
    assert_eq!(negotiator.state(), LifecycleState::Ready);
    assert!(negotiator.ensure_ready("tools/list").is_ok());

    peer.await.expect("peer task");
    transport.stop().await;
}

#[test]
fn ensure_ready_gates_before_the_handshake() {
    let negotiator = LifecycleNegotiator::new(VersionPolicy::default());

    let err = negotiator
        .ensure_ready("tools/list")
        .expect_err("gated operations must fail before the handshake");
    match err {
        AppError::NotInitialized(msg) => {
            assert!(msg.contains("tools/list"), "must name the operation: {msg}");
            assert!(msg.contains("uninitialized"), "must name the state: {msg}");
        }
        other => panic!("expected AppError::NotInitialized, got: {other:?}"),
    }
}

#[test]
fn ensure_ready_gates_after_close() {
    let mut negotiator = LifecycleNegotiator::new(VersionPolicy::default());
    negotiator.close();

    assert_eq!(negotiator.state(), LifecycleState::Closed);
    let err = negotiator
        .ensure_ready("resources/list")
        .expect_err("gated operations must fail after close");
    assert!(
        matches!(err, AppError::NotInitialized(_)),
        "expected AppError::NotInitialized, got: {err:?}"
    );
}

#[tokio::test]
async fn strict_policy_rejects_version_mismatch() {
    let (transport, mut peer_read, mut peer_write) = paired_transport();

    let peer = tokio::spawn(async move {
        let init = read_frame(&mut peer_read).await;
        write_line(
            &mut peer_write,
            &json!({
                "jsonrpc": "2.0",
                "id": init["id"],
                "result": {
                    "protocolVersion": "2025-06-18",
                    "serverInfo": {"name": "newer-server"}
                }
            }),
        )
        .await;
    });

    let mut negotiator = LifecycleNegotiator::new(VersionPolicy::Strict);
    let err = negotiator
        .initialize(&transport, test_client_info())
        .await
        .expect_err("strict policy must reject the mismatch");

    match err {
        AppError::Protocol(error) => {
            assert_eq!(error.code, error_codes::INVALID_REQUEST);
            assert!(
                error.message.contains("2025-06-18") && error.message.contains(PROTOCOL_VERSION),
                "mismatch must name both revisions: {}",
                error.message
            );
        }
        other => panic!("expected AppError::Protocol, got: {other:?}"),
    }
    assert_eq!(
        negotiator.state(),
        LifecycleState::Uninitialized,
        "a failed handshake must revert so a fresh transport can retry"
    );

    peer.await.expect("peer task");
    transport.stop().await;
}

#[tokio::test]
async fn lenient_policy_accepts_version_mismatch() {
    let (transport, mut peer_read, mut peer_write) = paired_transport();

    let peer = tokio::spawn(async move {
        let init = read_frame(&mut peer_read).await;
        write_line(
            &mut peer_write,
            &json!({
                "jsonrpc": "2.0",
                "id": init["id"],
                "result": {
                    "protocolVersion": "2025-06-18",
                    "serverInfo": {"name": "newer-server"}
                }
            }),
        )
        .await;
        // With the mismatch tolerated, the handshake still completes.
        let initialized = read_frame(&mut peer_read).await;
        assert_eq!(initialized["method"], INITIALIZED_NOTIFICATION);
    });

    let mut negotiator = LifecycleNegotiator::new(VersionPolicy::Lenient);
    let result = negotiator
        .initialize(&transport, test_client_info())
        .await
        .expect("lenient policy must tolerate the mismatch");

    assert_eq!(result.protocol_version, "2025-06-18");
    assert_eq!(negotiator.state(), LifecycleState::Ready);

    peer.await.expect("peer task");
    transport.stop().await;
}

#[tokio::test]
async fn handshake_is_not_repeatable() {
    let (transport, mut peer_read, mut peer_write) = paired_transport();

    let peer = tokio::spawn(async move {
        let init = read_frame(&mut peer_read).await;
        write_line(
            &mut peer_write,
            &json!({
                "jsonrpc": "2.0",
                "id": init["id"],
                "result": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "serverInfo": {"name": "fake-server"}
                }
            }),
        )
        .await;
        let _ = read_frame(&mut peer_read).await;
    });

    let mut negotiator = LifecycleNegotiator::new(VersionPolicy::Lenient);
    negotiator
        .initialize(&transport, test_client_info())
        .await
        .expect("first handshake must complete");

    let err = negotiator
        .initialize(&transport, test_client_info())
        .await
        .expect_err("a second handshake must be rejected");
    match err {
        AppError::NotInitialized(msg) => assert!(
            msg.contains("already performed"),
            "must explain the rejection: {msg}"
        ),
        other => panic!("expected AppError::NotInitialized, got: {other:?}"),
    }
    assert_eq!(
        negotiator.state(),
        LifecycleState::Ready,
        "a rejected repeat must not disturb the completed handshake"
    );

    peer.await.expect("peer task");
    transport.stop().await;
}

#[tokio::test]
async fn error_reply_fails_handshake_and_reverts_state() {
    let (transport, mut peer_read, mut peer_write) = paired_transport();

    let peer = tokio::spawn(async move {
        let init = read_frame(&mut peer_read).await;
        write_line(
            &mut peer_write,
            &json!({
                "jsonrpc": "2.0",
                "id": init["id"],
                "error": {"code": -32603, "message": "server broke"}
            }),
        )
        .await;
    });

    let mut negotiator = LifecycleNegotiator::new(VersionPolicy::Lenient);
    let err = negotiator
        .initialize(&transport, test_client_info())
        .await
        .expect_err("an error reply must fail the handshake");

    match err {
        AppError::Protocol(error) => {
            assert_eq!(error.code, error_codes::INTERNAL_ERROR);
            assert_eq!(error.message, "server broke");
        }
        other => panic!("expected AppError::Protocol, got: {other:?}"),
    }
    assert_eq!(negotiator.state(), LifecycleState::Uninitialized);

    peer.await.expect("peer task");
    transport.stop().await;
}

#[tokio::test]
async fn malformed_initialize_result_is_a_codec_error() {
    let (transport, mut peer_read, mut peer_write) = paired_transport();

    let peer = tokio::spawn(async move {
        let init = read_frame(&mut peer_read).await;
        // Result missing the required protocolVersion and serverInfo.
        write_line(
            &mut peer_write,
            &json!({"jsonrpc": "2.0", "id": init["id"], "result": {"unexpected": true}}),
        )
        .await;
    });

    let mut negotiator = LifecycleNegotiator::new(VersionPolicy::Lenient);
    let err = negotiator
        .initialize(&transport, test_client_info())
        .await
        .expect_err("a malformed result must fail the handshake");

    match err {
        AppError::Codec(msg) => assert!(
            msg.contains("malformed initialize result"),
            "must name the malformed envelope: {msg}"
        ),
        other => panic!("expected AppError::Codec, got: {other:?}"),
    }
    assert_eq!(negotiator.state(), LifecycleState::Uninitialized);

    peer.await.expect("peer task");
    transport.stop().await;
}

#[tokio::test]
async fn result_without_capabilities_defaults_empty() {
    let (transport, mut peer_read, mut peer_write) = paired_transport();

    let peer = tokio::spawn(async move {
        let init = read_frame(&mut peer_read).await;
        write_line(
            &mut peer_write,
            &json!({
                "jsonrpc": "2.0",
                "id": init["id"],
                "result": {
                    "protocolVersion": PROTOCOL_VERSION,
                    "serverInfo": {"name": "spartan-server"}
                }
            }),
        )
        .await;
        let _ = read_frame(&mut peer_read).await;
    });

    let mut negotiator = LifecycleNegotiator::new(VersionPolicy::Lenient);
    let result = negotiator
        .initialize(&transport, test_client_info())
        .await
        .expect("handshake must complete without capabilities");

    assert!(result.capabilities.tools.is_none());
    assert!(result.capabilities.resources.is_none());
    assert!(result.capabilities.prompts.is_none());
    assert!(result.server_info.version.is_none());

    peer.await.expect("peer task");
    transport.stop().await;
}
