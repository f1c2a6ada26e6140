//! Fieldlink Node -- offline-first incident coordination node.
//!
//! Usage:
//!   fieldlink-node                      # Run with default config
//!   fieldlink-node --config path.toml   # Run with custom config
//!   fieldlink-node status               # Query the running node

use clap::{Parser, Subcommand};

use fieldlink_node::config::NodeConfig;
use fieldlink_node::node::Node;
use fieldlink_node::remote::InMemoryRemote;
use fieldlink_node::{expand_tilde, load_or_create_token};

#[derive(Parser)]
#[command(name = "fieldlink-node", about = "Offline-first incident coordination node")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.fieldlink/config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Show node status (queries local API)
    Status,
    /// List live incidents
    Incidents,
    /// List mesh peers
    Peers,
    /// List running dispatch timers
    Timers,
    /// Show recent notifications
    Notifications,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fieldlink_node=info,fieldlink_api=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Run) | None => run_node(cfg).await,
        Some(Commands::Status) => cli_api_call(&cfg, "/api/v1/status", "{}").await,
        Some(Commands::Incidents) => cli_api_call(&cfg, "/api/v1/incidents/list", "{}").await,
        Some(Commands::Peers) => cli_api_call(&cfg, "/api/v1/peers", "{}").await,
        Some(Commands::Timers) => cli_api_call(&cfg, "/api/v1/timers/list", "{}").await,
        Some(Commands::Notifications) => cli_api_call(&cfg, "/api/v1/notifications", "{}").await,
    }
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    let token_path = expand_tilde("~/.fieldlink/node-token");
    let bearer_token = load_or_create_token(&token_path)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        entity = %cfg.node.entity_id,
        "starting fieldlink-node"
    );

    // The cloud backend rides behind the RemoteSyncChannel seam; the
    // in-process store keeps the node fully functional standalone.
    let remote = InMemoryRemote::new();
    let handle = Node::start(cfg, remote, bearer_token).await?;

    tracing::info!("all tasks spawned, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");
    handle.shutdown();
    // Give tasks a moment to drain before the runtime drops them.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Make a POST request to the local node API and print the JSON response.
async fn cli_api_call(cfg: &NodeConfig, path: &str, body: &str) -> anyhow::Result<()> {
    let url = format!("http://{}{}", cfg.node.api_addr, path);

    let token_path = expand_tilde("~/.fieldlink/node-token");
    let token = if token_path.exists() {
        std::fs::read_to_string(&token_path)?.trim().to_string()
    } else {
        String::new()
    };

    let client = reqwest::Client::new();
    let resp = client
        .post(&url)
        .header("Content-Type", "application/json")
        .header("Authorization", format!("Bearer {}", token))
        .body(body.to_string())
        .send()
        .await?;

    let status = resp.status();
    let text = resp.text().await?;

    if status.is_success() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            println!("{}", text);
        }
    } else {
        eprintln!("Error ({}): {}", status, text);
        std::process::exit(1);
    }
    Ok(())
}
