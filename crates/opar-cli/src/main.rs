use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use opar_client::{BackoffPolicy, CampaignClient, ClientConfig};
use opar_core::WindowParams;
use opar_store::PgLeadStore;
use opar_sync::{maybe_build_scheduler, PersonaResolver, ReconcileJob, RunParams, SyncConfig};
use opar_web::AppState;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "opar-cli")]
#[command(about = "Outreach persona-attribution reconciler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass.
    Run {
        #[arg(long)]
        date_from: Option<String>,
        #[arg(long)]
        date_to: Option<String>,
        #[arg(long)]
        days_back: Option<i64>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        campaign_id: Option<String>,
    },
    /// Apply lead-store migrations.
    Migrate,
    /// Serve the HTTP trigger surface (and the scheduler when enabled).
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run {
        date_from: None,
        date_to: None,
        days_back: None,
        dry_run: false,
        campaign_id: None,
    }) {
        Commands::Run {
            date_from,
            date_to,
            days_back,
            dry_run,
            campaign_id,
        } => {
            let job = build_job(&config).await?;
            let params = RunParams {
                window: WindowParams {
                    date_from,
                    date_to,
                    days_back,
                },
                dry_run,
                campaign_id,
            };
            let report = job.run(&params).await?;
            println!(
                "reconciliation complete: window={} status={} dry_run={} found={} updated={} skipped={} missing={} runtime_ms={}",
                report.window.label(),
                report.status.as_str(),
                report.dry_run,
                report.leads_found,
                report.merge.updated,
                report.merge.skipped,
                report.merge.missing.len(),
                report.runtime_ms,
            );
        }
        Commands::Migrate => {
            let store = PgLeadStore::connect(&config.database_url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            let job = Arc::new(build_job(&config).await?);
            // Keep the scheduler handle alive for the lifetime of the server.
            let mut scheduler = maybe_build_scheduler(job.clone(), &config).await?;
            if let Some(scheduler) = scheduler.as_mut() {
                scheduler.start().await.context("starting scheduler")?;
            }
            let state = Arc::new(AppState {
                job,
                internal_token: config.internal_token.clone(),
            });
            opar_web::serve(state, config.web_port).await?;
        }
    }

    Ok(())
}

async fn build_job(config: &SyncConfig) -> Result<ReconcileJob<CampaignClient, PgLeadStore>> {
    let api = CampaignClient::new(ClientConfig {
        base_url: config.campaign_api_base_url.clone(),
        api_key: config.campaign_api_key.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
        backoff: BackoffPolicy::default(),
    })?;
    let store = PgLeadStore::connect(&config.database_url).await?;
    let resolver = match &config.persona_overrides_path {
        Some(path) => PersonaResolver::from_overrides_file(path)?,
        None => PersonaResolver::default(),
    };
    Ok(ReconcileJob::new(Arc::new(api), Arc::new(store), resolver))
}
