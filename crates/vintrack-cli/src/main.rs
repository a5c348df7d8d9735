use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vintrack_core::normalize_vin;
use vintrack_enrich::{decode, OptionCatalog, StaticOptionCatalog, OPTION_CATALOG_FILE};
use vintrack_storage::{InMemoryListingStore, ListingStore, PgListingStore};
use vintrack_sync::{
    export_snapshot, load_candidates, run_partitioned, write_reports, ListingPipeline, PipelineConfig,
};

#[derive(Debug, Parser)]
#[command(name = "vintrack")]
#[command(about = "Vehicle listing enrichment and identity resolution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Enrich, resolve and persist a JSON batch of listings.
    Process {
        #[arg(long)]
        input: PathBuf,
        /// Keep rows in memory instead of Postgres.
        #[arg(long)]
        memory: bool,
        #[arg(long)]
        workers: Option<usize>,
        /// Also write a parquet snapshot here after the batch.
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Apply database migrations.
    Migrate,
    /// Decode a single VIN and print the result as JSON.
    DecodeVin { vin: String },
    /// Write a parquet snapshot of the canonical dataset.
    Export {
        #[arg(long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    let config = PipelineConfig::from_env();

    match cli.command {
        Commands::Process {
            input,
            memory,
            workers,
            export,
        } => process(&config, input, memory, workers, export).await?,
        Commands::Migrate => {
            let store = connect(&config).await?;
            store.migrate().await?;
            let catalog = StaticOptionCatalog::from_path(&config.rules_dir.join(OPTION_CATALOG_FILE))?;
            let seeded = store.seed_option_catalog(catalog.entries()).await?;
            println!("migrations applied; option catalog rows seeded: {seeded}");
        }
        Commands::DecodeVin { vin } => {
            let Some(vin) = normalize_vin(&vin) else {
                bail!("empty VIN");
            };
            let decoded = decode(&vin);
            println!("{}", serde_json::to_string_pretty(&decoded)?);
        }
        Commands::Export { out } => {
            let store = connect(&config).await?;
            let manifest = export_snapshot(&store, &out).await?;
            println!("snapshot manifest: {}", manifest.display());
        }
    }

    Ok(())
}

async fn connect(config: &PipelineConfig) -> Result<PgListingStore> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set")?;
    PgListingStore::connect(url, config.workers.max(1) as u32 + 1).await
}

async fn process(
    config: &PipelineConfig,
    input: PathBuf,
    memory: bool,
    workers: Option<usize>,
    export: Option<PathBuf>,
) -> Result<()> {
    let candidates = load_candidates(&input)?;

    let (store, catalog): (Arc<dyn ListingStore>, Option<Arc<dyn OptionCatalog>>) = if memory {
        (Arc::new(InMemoryListingStore::new()), None)
    } else {
        let store = connect(config).await?;
        let entries = store
            .load_option_catalog()
            .await
            .context("loading option catalog")?;
        if entries.is_empty() {
            warn!("option catalog table is empty; every option will be unmatched");
        }
        let catalog: Arc<dyn OptionCatalog> = Arc::new(StaticOptionCatalog::new(entries));
        (Arc::new(store), Some(catalog))
    };

    let pipeline = Arc::new(ListingPipeline::from_config(config, store.clone(), catalog)?);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight listings");
            on_signal.cancel();
        }
    });

    let workers = workers.unwrap_or(config.workers);
    let summary = run_partitioned(pipeline, candidates, workers, cancel).await?;
    let reports_dir = write_reports(&config.reports_dir, &summary).await?;
    info!(reports = %reports_dir.display(), "reports written");

    if let Some(out) = export {
        export_snapshot(store.as_ref(), &out).await?;
    }

    println!(
        "batch complete: run_id={} new={} updated={} unchanged={} merged={} relisted={} errored={} skipped={} reports={}",
        summary.run_id,
        summary.new,
        summary.updated,
        summary.unchanged,
        summary.merged,
        summary.relisted,
        summary.errored,
        summary.skipped,
        reports_dir.display()
    );
    Ok(())
}
