//! MCP initialization handshake.
//!
//! Before any tool, resource, or prompt call, an MCP client performs a
//! three-step exchange over the transport:
//!
//! 1. send an `initialize` request carrying the protocol revision the
//!    client speaks, its capabilities, and its identity;
//! 2. receive the server's [`InitializeResult`] and check the negotiated
//!    revision against the configured [`VersionPolicy`];
//! 3. send the `notifications/initialized` notification.
//!
//! Only after step 3 is the session [`LifecycleState::Ready`]; every gated
//! operation attempted earlier fails with [`AppError::NotInitialized`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::client::transport::StdioTransport;
use crate::protocol::jsonrpc::{error_codes, ErrorObject};
use crate::{AppError, Result};

/// MCP protocol revision this client speaks.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Handshake request method.
pub const INITIALIZE_METHOD: &str = "initialize";

/// Handshake completion notification method.
pub const INITIALIZED_NOTIFICATION: &str = "notifications/initialized";

// ── State machine ─────────────────────────────────────────────────────────────

/// Where a session stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No handshake attempted yet.
    Uninitialized,
    /// `initialize` sent, response or `initialized` notification outstanding.
    Initializing,
    /// Handshake complete; gated operations may flow.
    Ready,
    /// Connection torn down; terminal.
    Closed,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// How to treat a server that negotiates a different protocol revision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VersionPolicy {
    /// Log a warning and continue. Matches how most deployed servers behave:
    /// they answer with the newest revision they support.
    #[default]
    Lenient,
    /// Fail initialization on any mismatch.
    Strict,
}

// ── Wire types ────────────────────────────────────────────────────────────────

/// Client identity advertised during the handshake.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    /// Client name, e.g. the binary name.
    pub name: String,
    /// Client version string.
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

/// Capabilities advertised by the client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    /// Filesystem-roots capability.
    pub roots: RootsCapability,
    /// Sampling capability; omitted unless explicitly enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sampling: Option<Value>,
}

impl Default for ClientCapabilities {
    fn default() -> Self {
        Self {
            roots: RootsCapability { list_changed: true },
            sampling: None,
        }
    }
}

/// The `roots` capability block.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RootsCapability {
    /// Whether the client emits `notifications/roots/list_changed`.
    pub list_changed: bool,
}

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    /// Protocol revision the client speaks.
    pub protocol_version: String,
    /// Client capabilities.
    pub capabilities: ClientCapabilities,
    /// Client identity.
    pub client_info: ClientInfo,
}

/// Server identity returned by the handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version string.
    #[serde(default)]
    pub version: Option<String>,
}

/// Capabilities advertised by the server. Individual blocks are kept as raw
/// JSON: their shapes vary by revision and nothing here depends on them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerCapabilities {
    /// Tool support, when present.
    pub tools: Option<Value>,
    /// Resource support, when present.
    pub resources: Option<Value>,
    /// Prompt support, when present.
    pub prompts: Option<Value>,
    /// Any further capability blocks.
    #[serde(flatten)]
    pub other: serde_json::Map<String, Value>,
}

/// Result of the `initialize` request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    /// Protocol revision the server settled on.
    pub protocol_version: String,
    /// Server capabilities.
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    /// Server identity.
    pub server_info: ServerInfo,
}

// ── Negotiator ────────────────────────────────────────────────────────────────

/// Drives the handshake state machine over a transport.
#[derive(Debug)]
pub struct LifecycleNegotiator {
    state: LifecycleState,
    policy: VersionPolicy,
}

impl LifecycleNegotiator {
    /// A negotiator in [`LifecycleState::Uninitialized`].
    #[must_use]
    pub fn new(policy: VersionPolicy) -> Self {
        Self {
            state: LifecycleState::Uninitialized,
            policy,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Perform the full handshake: `initialize` request, version check,
    /// `initialized` notification.
    ///
    /// On failure the state reverts to [`LifecycleState::Uninitialized`] so
    /// a caller may retry on a fresh transport.
    ///
    /// # Errors
    ///
    /// - [`AppError::NotInitialized`] when called from any state other than
    ///   `Uninitialized` (the handshake is not repeatable).
    /// - [`AppError::Protocol`] when the server negotiates a different
    ///   revision under [`VersionPolicy::Strict`], or answers `initialize`
    ///   with an error object.
    /// - [`AppError::Codec`] when the result envelope cannot be decoded.
    /// - Transport errors ([`AppError::Timeout`], [`AppError::TransportClosed`])
    ///   pass through unchanged.
    pub async fn initialize(
        &mut self,
        transport: &StdioTransport,
        client_info: ClientInfo,
    ) -> Result<InitializeResult> {
        if self.state != LifecycleState::Uninitialized {
            return Err(AppError::NotInitialized(format!(
                "handshake already performed (state {})",
                self.state
            )));
        }
        self.state = LifecycleState::Initializing;

        match self.run_handshake(transport, client_info).await {
            Ok(result) => {
                self.state = LifecycleState::Ready;
                info!(
                    server = %result.server_info.name,
                    protocol_version = %result.protocol_version,
                    "handshake complete"
                );
                Ok(result)
            }
            Err(err) => {
                self.state = LifecycleState::Uninitialized;
                Err(err)
            }
        }
    }

    /// Require [`LifecycleState::Ready`] before `operation` proceeds.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::NotInitialized`] naming the current state.
    pub fn ensure_ready(&self, operation: &str) -> Result<()> {
        if self.state == LifecycleState::Ready {
            Ok(())
        } else {
            Err(AppError::NotInitialized(format!(
                "'{operation}' requires a completed handshake (state {})",
                self.state
            )))
        }
    }

    /// Enter the terminal [`LifecycleState::Closed`] state.
    pub fn close(&mut self) {
        self.state = LifecycleState::Closed;
    }

    async fn run_handshake(
        &self,
        transport: &StdioTransport,
        client_info: ClientInfo,
    ) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.to_owned(),
            capabilities: ClientCapabilities::default(),
            client_info,
        };
        let params = serde_json::to_value(&params)
            .map_err(|err| AppError::Codec(format!("failed to build initialize params: {err}")))?;

        debug!(protocol_version = PROTOCOL_VERSION, "handshake: initialize sent");
        let raw = transport.request(INITIALIZE_METHOD, Some(params)).await?;

        let result: InitializeResult = serde_json::from_value(raw)
            .map_err(|err| AppError::Codec(format!("malformed initialize result: {err}")))?;

        if result.protocol_version != PROTOCOL_VERSION {
            match self.policy {
                VersionPolicy::Lenient => {
                    warn!(
                        offered = %result.protocol_version,
                        expected = PROTOCOL_VERSION,
                        "server negotiated a different protocol revision, continuing"
                    );
                }
                VersionPolicy::Strict => {
                    return Err(AppError::Protocol(ErrorObject::new(
                        error_codes::INVALID_REQUEST,
                        format!(
                            "protocol version mismatch: server offered {}, client requires {}",
                            result.protocol_version, PROTOCOL_VERSION
                        ),
                    )));
                }
            }
        }

        transport.notify(INITIALIZED_NOTIFICATION, None)?;
        Ok(result)
    }
}
