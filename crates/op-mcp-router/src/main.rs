//! op-mcp-router: one MCP endpoint over many MCP servers
//!
//! Usage:
//!   op-mcp-router --config router.yaml                 # stdio, all servers
//!   op-mcp-router --config router.yaml --profile dev   # stdio, dev profile only
//!   op-mcp-router --listen 127.0.0.1:3010              # one session per TCP client
//!   op-mcp-router --config router.yaml --watch         # reload on file change
//!   op-mcp-router --config router.yaml --status        # print server status and exit

use anyhow::{bail, Result};
use clap::Parser;
use op_mcp_router::{serve_stdio, serve_tcp, ConfigWatcher, Router, RouterConfig};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "op-mcp-router", version)]
#[command(about = "MCP protocol router - one namespaced endpoint over local and remote MCP servers")]
struct Cli {
    /// Configuration file (JSON or YAML). Defaults to the standard locations.
    #[arg(long, short, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Restrict the upstream session to a named profile
    #[arg(long, short)]
    profile: Option<String>,

    /// Accept clients over TCP instead of stdio
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Reload the configuration file when it changes
    #[arg(long)]
    watch: bool,

    /// How often the configuration file is checked
    #[arg(long, default_value_t = 2000)]
    poll_interval_ms: u64,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Connect, print server and profile status as JSON, and exit
    #[arg(long)]
    status: bool,
}

fn init_logging(cli: &Cli) {
    // stderr only: stdout belongs to the stdio transport
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = match &cli.config {
        Some(path) => RouterConfig::load(path)?,
        None => RouterConfig::load_default()?,
    };
    info!(
        servers = config.servers.len(),
        profiles = config.profiles.len(),
        strict = config.strict,
        "Starting op-mcp-router"
    );

    let router = Router::from_config(&config).await;

    if cli.status {
        let status = json!({
            "servers": router.list_servers(),
            "profiles": router.list_profiles(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        router.shutdown().await;
        return Ok(());
    }

    if cli.watch {
        let Some(path) = cli.config.clone() else {
            bail!("--watch needs an explicit --config file");
        };
        let watcher = Arc::new(ConfigWatcher::new(router.clone()));
        let interval = Duration::from_millis(cli.poll_interval_ms.max(100));
        tokio::spawn(async move { watcher.watch_file(path, interval).await });
    }

    let serve = async {
        match &cli.listen {
            Some(addr) => {
                let listener = TcpListener::bind(addr).await?;
                serve_tcp(router.clone(), listener, cli.profile.clone()).await
            }
            None => serve_stdio(router.clone(), cli.profile.as_deref()).await,
        }
    };

    let outcome = tokio::select! {
        result = serve => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted");
            Ok(())
        }
    };
    if let Err(e) = &outcome {
        error!("Serving failed: {:#}", e);
    }

    router.shutdown().await;
    outcome
}
