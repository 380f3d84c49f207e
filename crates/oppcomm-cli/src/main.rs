use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use oppcomm_sync::{shutdown_signal, ReconcileService, SingleRequest, SyncConfig};
use oppcomm_web::AppState;
use serde_json::Value as JsonValue;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "oppcomm")]
#[command(about = "Keeps opportunity values in line with the commission on their loan amount")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile every open opportunity on the configured interval
    Poll {
        /// Stop after this many passes
        #[arg(long)]
        cycles: Option<usize>,
    },
    /// Run a single pass and print its summary
    Once,
    /// Reconcile one opportunity by id
    Process {
        id: String,
        #[arg(long)]
        pipeline_id: Option<String>,
        /// Loan amount to use instead of the record's custom field
        #[arg(long)]
        loan_amount: Option<String>,
    },
    /// Serve the webhook endpoint
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let config = SyncConfig::from_env().context("loading configuration")?;
    info!(?config, "configuration loaded");
    let service = Arc::new(ReconcileService::from_config(&config)?);

    match cli.command.unwrap_or(Commands::Poll { cycles: None }) {
        Commands::Poll { cycles } => {
            let ran = service
                .run_poll_loop(config.poll_interval, cycles, shutdown_signal())
                .await;
            info!(cycles = ran, "poll loop stopped");
        }
        Commands::Once => {
            let summary = service.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Process {
            id,
            pipeline_id,
            loan_amount,
        } => {
            let outcome = service
                .process_single(SingleRequest {
                    opportunity_id: id,
                    pipeline_id,
                    override_amount: loan_amount.map(JsonValue::String),
                })
                .await;
            println!("{}", outcome.message);
            if !outcome.success {
                anyhow::bail!("opportunity was not reconciled");
            }
        }
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.port);
            oppcomm_web::serve(AppState::new(service), port, shutdown_signal()).await?;
        }
    }

    Ok(())
}
