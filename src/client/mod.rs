//! MCP client stack: transport, handshake, and the typed facade.
//!
//! [`McpClient`] is the surface most callers want: spawn a server, perform
//! the handshake, then issue `tools/…`, `resources/…`, and `prompts/…`
//! calls through thin typed wrappers. The shape of what a tool *does* is the
//! server's business; the facade only frames requests and decodes result
//! envelopes.
//!
//! Submodules:
//! - `transport`: child-process stdio transport with request correlation.
//! - `lifecycle`: the initialize/initialized handshake state machine.

pub mod lifecycle;
pub mod transport;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::jsonrpc::Message;
use crate::{AppError, Result};
use lifecycle::{ClientInfo, InitializeResult, LifecycleNegotiator, LifecycleState, VersionPolicy};
use transport::{StdioTransport, TransportOptions, DEFAULT_REQUEST_TIMEOUT};

// ── Options ───────────────────────────────────────────────────────────────────

/// Configuration for an [`McpClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Server executable to spawn.
    pub command: String,
    /// Arguments passed to the server executable.
    pub args: Vec<String>,
    /// Identity advertised during the handshake.
    pub client_info: ClientInfo,
    /// Deadline applied to every request.
    pub request_timeout: std::time::Duration,
    /// How to treat a mismatched protocol revision.
    pub version_policy: VersionPolicy,
}

impl ClientOptions {
    /// Options for `command` with defaults: 30 s request timeout, lenient
    /// version policy, this crate's name/version as the client identity.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            client_info: ClientInfo::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            version_policy: VersionPolicy::default(),
        }
    }
}

// ── Typed result rows ─────────────────────────────────────────────────────────

/// One tool advertised by `tools/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    /// Tool name, unique per server.
    pub name: String,
    /// Human-readable description shown to models.
    #[serde(default)]
    pub description: Option<String>,
    /// JSON schema of the tool's arguments.
    #[serde(default)]
    pub input_schema: Option<Value>,
    /// Behavioral annotations. Hints, not guarantees.
    #[serde(default)]
    pub annotations: Option<ToolAnnotations>,
}

/// Tool behavior annotations. Servers self-declare these; the defense rules
/// exist precisely because they can lie.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotations {
    /// Claimed read-only behavior.
    #[serde(default)]
    pub read_only_hint: Option<bool>,
    /// Any further annotation fields.
    #[serde(flatten)]
    pub other: serde_json::Map<String, Value>,
}

/// One resource advertised by `resources/list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    /// Resource URI, passed to `resources/read`.
    pub uri: String,
    /// Display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// MIME type of the content.
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// One prompt template advertised by `prompts/list`.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptDescriptor {
    /// Prompt name, passed to `prompts/get`.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// Declared template arguments.
    #[serde(default)]
    pub arguments: Option<Vec<PromptArgument>>,
}

/// One declared argument of a prompt template.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptArgument {
    /// Argument name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
    /// Whether the argument must be supplied.
    #[serde(default)]
    pub required: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ToolListResult {
    #[serde(default)]
    tools: Vec<Tool>,
}

#[derive(Debug, Deserialize)]
struct ResourceListResult {
    #[serde(default)]
    resources: Vec<ResourceDescriptor>,
}

#[derive(Debug, Deserialize)]
struct PromptListResult {
    #[serde(default)]
    prompts: Vec<PromptDescriptor>,
}

// ── Facade ────────────────────────────────────────────────────────────────────

/// High-level MCP client: one spawned server, one handshake, typed calls.
#[derive(Debug)]
pub struct McpClient {
    options: ClientOptions,
    transport: Option<StdioTransport>,
    negotiator: LifecycleNegotiator,
    initialize_result: Option<InitializeResult>,
}

impl McpClient {
    /// A disconnected client; call [`McpClient::connect`] before anything
    /// else.
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        let negotiator = LifecycleNegotiator::new(options.version_policy);
        Self {
            options,
            transport: None,
            negotiator,
            initialize_result: None,
        }
    }

    /// Spawn the server and perform the handshake.
    ///
    /// # Errors
    ///
    /// - [`AppError::Spawn`] when the server process cannot start.
    /// - Handshake failures per
    ///   [`LifecycleNegotiator::initialize`](lifecycle::LifecycleNegotiator::initialize);
    ///   the spawned process is torn down again before the error returns.
    pub async fn connect(&mut self) -> Result<InitializeResult> {
        let transport_options = TransportOptions {
            command: self.options.command.clone(),
            args: self.options.args.clone(),
            request_timeout: self.options.request_timeout,
        };
        let transport = StdioTransport::connect(&transport_options).await?;

        match self
            .negotiator
            .initialize(&transport, self.options.client_info.clone())
            .await
        {
            Ok(result) => {
                self.transport = Some(transport);
                self.initialize_result = Some(result.clone());
                Ok(result)
            }
            Err(err) => {
                transport.stop().await;
                Err(err)
            }
        }
    }

    /// Stop the transport and close the lifecycle. Idempotent.
    pub async fn disconnect(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.stop().await;
            debug!("client disconnected");
        }
        self.negotiator.close();
    }

    /// The handshake result, once connected.
    #[must_use]
    pub fn initialize_result(&self) -> Option<&InitializeResult> {
        self.initialize_result.as_ref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.negotiator.state()
    }

    /// List the server's tools.
    ///
    /// # Errors
    ///
    /// [`AppError::NotInitialized`] before [`McpClient::connect`]; otherwise
    /// transport/protocol errors pass through.
    pub async fn list_tools(&self) -> Result<Vec<Tool>> {
        let raw = self
            .ready_transport("tools/list")?
            .request("tools/list", None)
            .await?;
        let result: ToolListResult = parse_envelope("tools/list", raw)?;
        Ok(result.tools)
    }

    /// Invoke a tool by name. The result payload is domain-shaped and
    /// returned verbatim.
    ///
    /// # Errors
    ///
    /// [`AppError::NotInitialized`] before [`McpClient::connect`]; otherwise
    /// transport/protocol errors pass through.
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> Result<Value> {
        let params = json!({
            "name": name,
            "arguments": arguments.unwrap_or_else(|| json!({})),
        });
        self.ready_transport("tools/call")?
            .request("tools/call", Some(params))
            .await
    }

    /// List the server's resources.
    ///
    /// # Errors
    ///
    /// [`AppError::NotInitialized`] before [`McpClient::connect`]; otherwise
    /// transport/protocol errors pass through.
    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        let raw = self
            .ready_transport("resources/list")?
            .request("resources/list", None)
            .await?;
        let result: ResourceListResult = parse_envelope("resources/list", raw)?;
        Ok(result.resources)
    }

    /// Read a resource by URI.
    ///
    /// # Errors
    ///
    /// [`AppError::NotInitialized`] before [`McpClient::connect`]; otherwise
    /// transport/protocol errors pass through.
    pub async fn read_resource(&self, uri: &str) -> Result<Value> {
        self.ready_transport("resources/read")?
            .request("resources/read", Some(json!({ "uri": uri })))
            .await
    }

    /// List the server's prompt templates.
    ///
    /// # Errors
    ///
    /// [`AppError::NotInitialized`] before [`McpClient::connect`]; otherwise
    /// transport/protocol errors pass through.
    pub async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>> {
        let raw = self
            .ready_transport("prompts/list")?
            .request("prompts/list", None)
            .await?;
        let result: PromptListResult = parse_envelope("prompts/list", raw)?;
        Ok(result.prompts)
    }

    /// Fetch a rendered prompt by name.
    ///
    /// # Errors
    ///
    /// [`AppError::NotInitialized`] before [`McpClient::connect`]; otherwise
    /// transport/protocol errors pass through.
    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> Result<Value> {
        let params = json!({
            "name": name,
            "arguments": arguments.unwrap_or_else(|| json!({})),
        });
        self.ready_transport("prompts/get")?
            .request("prompts/get", Some(params))
            .await
    }

    /// Take the channel of server-initiated requests and notifications.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.transport.as_mut().and_then(StdioTransport::take_inbound)
    }

    fn ready_transport(&self, operation: &str) -> Result<&StdioTransport> {
        self.negotiator.ensure_ready(operation)?;
        self.transport
            .as_ref()
            .ok_or_else(|| AppError::TransportClosed("no active transport".into()))
    }
}

/// Decode a typed result envelope, naming the operation in the error.
fn parse_envelope<T: serde::de::DeserializeOwned>(operation: &str, raw: Value) -> Result<T> {
    serde_json::from_value(raw)
        .map_err(|err| AppError::Codec(format!("malformed {operation} result: {err}")))
}
