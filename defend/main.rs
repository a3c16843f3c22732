#![forbid(unsafe_code)]

//! `mcp-defend` — security-aware MCP proxy.
//!
//! Relays stdio traffic between an MCP host and a spawned server like
//! `mcp-inspect`, but additionally evaluates every decoded frame against
//! the security-rule registry: prompt injection smuggled through tool
//! descriptions, destructive tools hiding behind a `readOnlyHint`
//! annotation. Matches are alerted on stderr and collected into the
//! end-of-session security report.
//!
//! Rules warn by default; a TOML config or `--enforce` upgrades them to
//! blocking, which suppresses the offending frame and answers a blocked
//! request with a synthesized error.
//!
//! ```text
//! mcp-defend [--config defend.toml] [--enforce] -- <server-command> [args...]
//! ```

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use mcp_intercept::config::DefendConfig;
use mcp_intercept::proxy::rules::{RuleAction, RuleRegistry};
use mcp_intercept::proxy::{self, trace, ProxyMode, ProxyOptions};
use mcp_intercept::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "mcp-defend", about = "Security-aware MCP proxy", version, long_about = None)]
struct Cli {
    /// Path to a TOML file tuning rule dispositions and the transcript.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Upgrade every rule to blocking, regardless of config.
    #[arg(long)]
    enforce: bool,

    /// Cut payload previews off after this many characters.
    #[arg(long)]
    truncate: Option<usize>,

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
        eprintln!("Usage: mcp-defend [OPTIONS] -- <server-command> [args...]");
        eprintln!("Example: mcp-defend --enforce -- npx some-untrusted-server");
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
            error!(%err, "defense session failed");
            eprintln!("❌ {err}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: &Cli, command: &str, server_args: &[String]) -> Result<i32> {
    let config = match &args.config {
        Some(path) => DefendConfig::load_from_path(path)?,
        None => DefendConfig::default(),
    };

    let mut registry = RuleRegistry::builtin();
    config.apply(&mut registry)?;
    if args.enforce {
        let names: Vec<String> = registry
            .rules()
            .iter()
            .map(|rule| rule.name.clone())
            .collect();
        for name in names {
            registry.set_action(&name, RuleAction::Block);
        }
    }

    let color = !args.no_color && std::io::stderr().is_terminal();
    let truncate_chars = args.truncate.unwrap_or(config.truncate_chars);

    let tracer = trace::FrameTracer::new(color, truncate_chars);
    tracer.banner(
        "🛡️  MCP Defense Proxy",
        &format!("Monitoring server: {command} {}", server_args.join(" ")),
    );
    info!(
        command = %command,
        rules = registry.len(),
        enforcing = registry.has_blocking(),
        "defense proxy starting"
    );

    let options = ProxyOptions {
        command: command.to_owned(),
        args: server_args.to_vec(),
        mode: ProxyMode::Active,
        registry,
        color,
        truncate_chars,
    };

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
