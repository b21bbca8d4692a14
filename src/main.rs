use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ushadow::agent::{self, AgentOptions};
use ushadow::server;
use ushadow::settings::Settings;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control plane (HTTP API plus background loops)
    Server {},
    /// Run the per-node agent daemon
    Agent {
        /// Control plane base URL (e.g. http://leader.tailnet.ts.net:8010)
        #[arg(long)]
        server: String,
        /// This node's hostname as registered with the control plane
        #[arg(long)]
        hostname: String,
        /// Shared node secret (handed out at join time)
        #[arg(long, env = "USHADOW_NODE_SECRET")]
        node_secret: String,
        /// Port for the local deploy API
        #[arg(long, default_value = "8444")]
        port: u16,
        /// Heartbeat cadence in seconds
        #[arg(long, default_value = "15")]
        heartbeat_interval: u64,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server {} => {
            let settings = match Settings::new() {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::error!("Configuration error: {}", e);
                    std::process::exit(64);
                }
            };

            if let Err(e) = server::run_server(settings).await {
                tracing::error!("Server failed: {:#}", e.error());
                std::process::exit(e.exit_code());
            }
        }
        Commands::Agent {
            server,
            hostname,
            node_secret,
            port,
            heartbeat_interval,
        } => {
            let options = AgentOptions {
                server_url: server,
                hostname,
                node_secret,
                port,
                heartbeat_interval_secs: heartbeat_interval,
            };
            if let Err(e) = agent::run(options).await {
                tracing::error!("Agent failed: {:#}", e);
                std::process::exit(70);
            }
        }
    }
}
