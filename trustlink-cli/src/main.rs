use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use escrow_engine::{node::EscrowNode, settings::Settings};
use rust_decimal::Decimal;
use tracing::{info, warn};
use trustlink_api::ApiState;

#[derive(Parser)]
#[command(name = "trustlink", version, about = "Escrow backend for Telegram group sales")]
struct Cli {
    /// Settings file (TOML); TRUSTLINK__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the API server and the deadline sweeper
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Show the seller payout for an amount
    Fee {
        #[arg(long)]
        amount: Decimal,
        /// Override the platform fee in basis points
        #[arg(long)]
        fee_bps: Option<u32>,
        /// Override the flat gas fee
        #[arg(long)]
        gas: Option<Decimal>,
    },
    /// Print the resolved settings with secrets masked
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trustlink=info,escrow_engine=info,tower_http=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;

    match cli.command {
        Commands::Serve { host, port } => serve(settings, host, port).await,
        Commands::Fee {
            amount,
            fee_bps,
            gas,
        } => {
            let mut fees = settings.settlement;
            if let Some(bps) = fee_bps {
                fees.platform_fee_bps = bps;
            }
            if let Some(gas) = gas {
                fees.gas_fee = gas;
            }

            let (platform_fee, net) = fees.seller_split(amount);
            println!("amount:       {}", amount);
            println!("platform fee: {} ({} bps)", platform_fee, fees.platform_fee_bps);
            println!("gas:          {}", fees.gas_fee);
            println!("seller net:   {}", net);
            Ok(())
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&settings.redacted())?);
            Ok(())
        }
    }
}

async fn serve(settings: Settings, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let host = host.unwrap_or_else(|| settings.server.host.clone());
    let port = port.unwrap_or(settings.server.port);

    let node = Arc::new(EscrowNode::new(settings.node_config()).context("starting escrow node")?);

    let sweeper = if node.sweeper_enabled() {
        Some(node.sweeper().spawn())
    } else {
        warn!("Deadline sweeper disabled; expired transactions will not be refunded");
        None
    };

    let state = ApiState {
        node,
        admin_token: settings.server.admin_token.clone(),
    };

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    trustlink_api::serve(listener, state, shutdown_signal()).await?;

    if let Some(handle) = sweeper {
        handle.shutdown().await;
    }
    info!("Trustlink stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_fee_arguments_parse() {
        let cli = Cli::try_parse_from(["trustlink", "fee", "--amount", "100", "--gas", "0.02"]).unwrap();
        match cli.command {
            Commands::Fee { amount, gas, fee_bps } => {
                assert_eq!(amount, Decimal::from(100));
                assert_eq!(gas, Some(Decimal::new(2, 2)));
                assert!(fee_bps.is_none());
            }
            _ => panic!("expected fee command"),
        }
    }
}
