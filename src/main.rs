use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use aplease::{Config, DhcpServer, Error, Result};

#[derive(Parser)]
#[command(name = "aplease")]
#[command(author, version, about = "DHCP lease server for a software access point", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve leases until Ctrl-C (default).
    Run,
    /// Print the effective configuration.
    ShowConfig,
    /// Write a configuration derived from the server's address, e.g. 192.168.100.1/24.
    Init {
        #[arg(long)]
        subnet: String,

        /// Overwrite an existing configuration file.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let config = Config::load_or_create(&cli.config).await?;
            info!("Starting DHCP server with config: {:?}", cli.config);

            let (server, mut events) = DhcpServer::new(config).await?;
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    info!(
                        "Lease: {} {} {}",
                        event.host_name.as_deref().unwrap_or("-"),
                        event.address,
                        event.client_id
                    );
                }
            });

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let run = server.run(shutdown_rx);
            tokio::pin!(run);

            tokio::select! {
                result = &mut run => return result,
                signal = tokio::signal::ctrl_c() => {
                    if let Err(error) = signal {
                        warn!("Failed to listen for Ctrl-C: {}", error);
                    }
                    info!("Received shutdown signal, stopping server...");
                    let _ = shutdown_tx.send(true);
                }
            }

            run.await
        }
        Commands::ShowConfig => {
            let config = Config::load_or_create(&cli.config).await?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Init { subnet, force } => {
            if !force && tokio::fs::try_exists(&cli.config).await? {
                return Err(Error::InvalidConfig(format!(
                    "{} already exists (use --force to overwrite)",
                    cli.config.display()
                )));
            }

            let config = Config::from_cidr(&subnet)?;
            config.save(&cli.config).await?;
            println!(
                "Wrote {}: pool {} - {} ({} addresses)",
                cli.config.display(),
                config.pool_start,
                config.pool_end(),
                config.pool_size()
            );
            Ok(())
        }
    }
}
