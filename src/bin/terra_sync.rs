use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use terrascore_rs::client::{ClientConfig, TerraClient};
use terrascore_rs::store::SurveyStore;
use terrascore_rs::sync::SyncOrchestrator;
use terrascore_rs::upload::{UploadPipeline, UploadStrategy};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "terra_sync")]
#[command(about = "Run one reconciliation pass against the TerraScore service")]
struct Args {
    /// Path to the local evidence store
    #[arg(short, long, default_value = "terrascore.db")]
    db: String,

    /// Upload transport: presigned or multipart
    #[arg(short, long, default_value = "presigned")]
    strategy: String,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(format!("terrascore_rs={}", args.log_level))
        .init();

    let strategy = match args.strategy.as_str() {
        "presigned" => UploadStrategy::Presigned,
        "multipart" => UploadStrategy::MultipartProxy,
        other => {
            error!("Unknown upload strategy: {}", other);
            std::process::exit(1);
        }
    };

    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Missing client configuration: {}", e);
            std::process::exit(1);
        }
    };

    let client = Arc::new(TerraClient::new(config)?);
    let store = Arc::new(SurveyStore::open(&args.db)?);

    let pending_before = store.get_pending_uploads()?;
    let buffered = store.get_buffered_locations()?;
    info!("🚀 Starting sync pass");
    info!("   Store: {}", args.db);
    info!("   Pending uploads: {}", pending_before.len());
    info!("   Buffered locations: {}", buffered.len());

    let orchestrator = SyncOrchestrator::new(client, store.clone(), UploadPipeline::new(strategy));
    orchestrator.run_sync().await;

    let pending_after = store.get_pending_uploads()?;
    info!("✅ Sync pass finished");
    info!("   Pending uploads remaining: {}", pending_after.len());

    if !pending_after.is_empty() {
        for task in &pending_after {
            info!(
                "   - task {} job {} step {} ({} retries)",
                task.id, task.job_id, task.step_id, task.retry_count
            );
        }
    }

    Ok(())
}
