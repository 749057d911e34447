//! Backhaul Agent - Reverse tunnel agent CLI
//!
//! This binary provides a command-line interface for running the backhaul
//! tunnel agent, which maintains one packet stream per proxy-server replica
//! and serves the TCP dials the proxy forwards over them.

use anyhow::{Context, Result};
use backhaul_client::{ClientConfig, ClientSet};
use backhaul_transport::TcpConnector;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Backhaul reverse tunnel agent - exposes outbound TCP connectivity to a
/// proxy-server fleet
#[derive(Parser, Debug)]
#[command(name = "backhaul-agent")]
#[command(
    about = "Backhaul reverse tunnel agent - exposes outbound TCP connectivity to a proxy-server fleet"
)]
#[command(version)]
#[command(long_about = r#"
Backhaul Agent dials a proxy-server fleet, keeps one tunnel per replica,
and serves the TCP connections the proxy forwards over them.

EXAMPLES:
  # Start agent with basic configuration
  backhaul-agent --proxy-server proxy.example.com:8091 --agent-id edge-1

  # Start agent with a service account token
  backhaul-agent --proxy-server proxy.example.com:8091 \
    --agent-id edge-1 \
    --token-file /var/run/secrets/token

  # Start agent using config file
  backhaul-agent --config agent-config.yaml

  # Start agent with custom log level
  backhaul-agent --config agent-config.yaml --log-level debug

ENVIRONMENT VARIABLES:
  BACKHAUL_PROXY_SERVER  Proxy server address
  BACKHAUL_AGENT_ID      Agent identifier
  BACKHAUL_TOKEN_FILE    Path to the authentication token file
"#)]
struct Args {
    /// Proxy server address (e.g., proxy.example.com:8091)
    #[arg(long, env = "BACKHAUL_PROXY_SERVER")]
    proxy_server: Option<String>,

    /// Agent identifier presented during the handshake
    #[arg(long, env = "BACKHAUL_AGENT_ID")]
    agent_id: Option<String>,

    /// Path to a file holding the authentication token
    #[arg(long, env = "BACKHAUL_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    /// Seconds between sync dials toward uncovered replicas
    #[arg(long, default_value_t = 5)]
    sync_interval: u64,

    /// Seconds between transport health probes
    #[arg(long, default_value_t = 5)]
    probe_interval: u64,

    /// Seconds between reconnect attempts of a broken tunnel
    #[arg(long, default_value_t = 5)]
    reconnect_interval: u64,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Configuration file format
#[derive(Debug, Serialize, Deserialize)]
struct ConfigFile {
    /// Proxy server configuration
    proxy: ProxyConfig,

    /// Agent configuration
    #[serde(default)]
    agent: AgentConfigFile,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProxyConfig {
    /// Proxy server address
    address: String,

    /// Path to the authentication token file
    #[serde(skip_serializing_if = "Option::is_none")]
    token_file: Option<PathBuf>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AgentConfigFile {
    /// Agent ID
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
}

/// Resolved agent configuration
#[derive(Debug)]
struct AgentConfig {
    proxy_server: String,
    agent_id: String,
    token_file: Option<PathBuf>,
    client: ClientConfig,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Load configuration from YAML file
fn load_config_file(path: &PathBuf) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with config file, giving precedence to CLI args
fn build_agent_config(args: Args) -> Result<AgentConfig> {
    let (proxy_server, mut token_file, agent_id) = if let Some(config_path) = &args.config {
        info!("Loading configuration from: {}", config_path.display());
        let config_file = load_config_file(config_path)?;
        (
            config_file.proxy.address,
            config_file.proxy.token_file,
            config_file.agent.id,
        )
    } else {
        (String::new(), None, None)
    };

    // CLI args override config file
    let proxy_server = args.proxy_server.unwrap_or(proxy_server);
    if args.token_file.is_some() {
        token_file = args.token_file;
    }
    let agent_id = args.agent_id.or(agent_id);

    if proxy_server.is_empty() {
        anyhow::bail!("Proxy server address is required (use --proxy-server or config file)");
    }

    let agent_id = agent_id
        .ok_or_else(|| anyhow::anyhow!("Agent ID is required (use --agent-id or config file)"))?;

    validate_address(&proxy_server, "proxy server")?;

    Ok(AgentConfig {
        proxy_server,
        agent_id,
        token_file,
        client: ClientConfig {
            sync_interval: Duration::from_secs(args.sync_interval),
            probe_interval: Duration::from_secs(args.probe_interval),
            reconnect_interval: Duration::from_secs(args.reconnect_interval),
        },
    })
}

/// Validate address format (should be host:port)
fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
    if !addr.contains(':') {
        anyhow::bail!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            addr_type,
            addr
        );
    }

    let parts: Vec<&str> = addr.rsplitn(2, ':').collect();
    if parts.len() != 2 {
        anyhow::bail!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            addr_type,
            addr
        );
    }

    // Host is parts[1] because rsplitn reverses
    if parts[1].is_empty() {
        anyhow::bail!(
            "Invalid {} address format: '{}' (host cannot be empty)",
            addr_type,
            addr
        );
    }

    parts[0]
        .parse::<u16>()
        .with_context(|| format!("Invalid port in {} address: {}", addr_type, addr))?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    info!("Backhaul Agent starting...");

    let config = build_agent_config(args).context("Failed to build agent configuration")?;

    info!("Agent ID: {}", config.agent_id);
    info!("Proxy server: {}", config.proxy_server);

    let mut connector = TcpConnector::new(&config.proxy_server, &config.agent_id);
    if let Some(token_file) = config.token_file {
        info!("Token file: {}", token_file.display());
        connector = connector.with_token_file(token_file);
    }

    let set = ClientSet::new(Arc::new(connector), config.client);

    tokio::select! {
        _ = set.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Backhaul Agent stopped");
    Ok(())
}
