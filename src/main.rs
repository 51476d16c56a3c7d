//! FleetGate CLI.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleetgate_kernel::{bootstrap, GatewayConfig};

/// FleetGate - one API endpoint over a fleet of browser-driven accounts
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (default)
    Serve {
        /// Listen port; overrides FLEETGATE_PORT
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List configured identities
    Identities,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fleetgate={level},{level}")));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command.unwrap_or(Commands::Serve { port: None }) {
        Commands::Serve { port } => {
            let mut cfg = GatewayConfig::from_env();
            if let Some(port) = port {
                cfg.listen_port = port;
            }
            info!(port = cfg.listen_port, "starting FleetGate");
            let state = bootstrap(cfg).await?;
            fleetgate_kernel::server::serve(state).await
        }
        Commands::Identities => {
            let cfg = GatewayConfig::from_env();
            let store = browser_fleet::IdentityStore::new(cfg.auth_dir.clone());
            let records = store.enumerate()?;
            if records.is_empty() {
                println!("no identities under {}", cfg.auth_dir.display());
                return Ok(());
            }
            for record in records {
                println!(
                    "auth-{}  {}",
                    record.auth_index,
                    record.email.as_deref().unwrap_or("<no email>")
                );
            }
            Ok(())
        }
    }
}
