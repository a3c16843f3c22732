#![forbid(unsafe_code)]

//! `mcp-inspect` — transparent MCP protocol inspector.
//!
//! Sits between an MCP host and a server it spawns, relaying stdio traffic
//! byte-for-byte in both directions while writing a human-readable
//! transcript of every JSON-RPC frame to stderr. On server exit it prints
//! message statistics and mirrors the server's exit code.
//!
//! ```text
//! mcp-inspect -- <server-command> [args...]
//! ```

use std::io::IsTerminal;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use mcp_intercept::proxy::rules::RuleRegistry;
use mcp_intercept::proxy::{self, trace, ProxyMode, ProxyOptions};
use mcp_intercept::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "mcp-inspect", about = "Transparent MCP protocol inspector", version, long_about = None)]
struct Cli {
    /// Cut payload previews off after this many characters.
    #[arg(long, default_value_t = trace::DEFAULT_TRUNCATE_CHARS)]
    truncate: usize,

    /// Disable ANSI colors in the transcript.
    #[arg(long)]
    no_color: bool,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Server command line; everything after `--` is spawned as the server.
    #[arg(last = true, value_name = "SERVER")]
    server: Vec<String>,
}

fn main() {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }

    let Some((command, server_args)) = split_server_command(&args.server) else {
        eprintln!("Usage: mcp-inspect [OPTIONS] -- <server-command> [args...]");
        eprintln!("Example: mcp-inspect -- npx @modelcontextprotocol/server-filesystem /tmp");
        std::process::exit(2);
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to build tokio runtime: {err}");
            std::process::exit(1);
        }
    };

    let code = match runtime.block_on(run(&args, command, server_args)) {
        Ok(code) => code,
        Err(err) => {
            error!(%err, "inspector session failed");
            eprintln!("❌ {err}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: &Cli, command: &str, server_args: &[String]) -> Result<i32> {
    let color = !args.no_color && std::io::stderr().is_terminal();

    let options = ProxyOptions {
        command: command.to_owned(),
        args: server_args.to_vec(),
        mode: ProxyMode::Passive,
        registry: RuleRegistry::new(),
        color,
        truncate_chars: args.truncate,
    };

    let tracer = trace::FrameTracer::new(color, args.truncate);
    tracer.banner(
        "🔍 MCP Protocol Inspector",
        &format!("Spawning server: {command} {}", server_args.join(" ")),
    );
    info!(command = %command, "inspector starting");

    let outcome = proxy::run(options).await?;
    outcome.report.print();
    eprintln!("Server exited: {}", outcome.exit_description);
    Ok(outcome.exit_code)
}

/// `(command, args)` from the trailing command line, or `None` when the
/// `--` separator or the command itself is missing.
fn split_server_command(server: &[String]) -> Option<(&str, &[String])> {
    let (command, args) = server.split_first()?;
    Some((command.as_str(), args))
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    // diagnostics share stderr with the transcript; stdout belongs to the
    // relayed protocol stream
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
