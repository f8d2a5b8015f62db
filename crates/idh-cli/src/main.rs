use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use idh_adapters::{StatisticsClient, StatisticsSource};
use idh_core::{parse_instant, TimeRange};
use idh_storage::{HttpClientConfig, HttpFetcher, PayloadArchive};
use idh_sync::{
    export_snapshot, run_scheduler_until_shutdown, Backfill, HarvestConfig, IncrementalSync,
    LeaseStore, PgWarehouse, Trigger, Warehouse,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "idh")]
#[command(about = "ID-porten login statistics harvester")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Drop and reload the full history from both accounts.
    Backfill(RangeArgs),
    /// Append the hours recorded since the warehouse watermark, once.
    Sync,
    /// Run `sync` on the configured cron schedule until ctrl-c.
    Schedule,
    /// Write a parquet snapshot of the reconciled history without touching the warehouse.
    Export {
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long)]
        out: PathBuf,
    },
    /// Delete rows past the retention horizon.
    Purge,
}

#[derive(Debug, clap::Args)]
struct RangeArgs {
    /// Inclusive start instant, e.g. 2013-01-01T00:00:00Z. Defaults to `history_start`.
    #[arg(long)]
    from: Option<String>,
    /// Exclusive end instant. Defaults to now.
    #[arg(long)]
    to: Option<String>,
}

impl RangeArgs {
    fn resolve(&self, config: &HarvestConfig) -> Result<TimeRange> {
        let parse = |raw: &Option<String>, default: DateTime<Utc>| -> Result<DateTime<Utc>> {
            match raw {
                Some(text) => Ok(parse_instant(text)?),
                None => Ok(default),
            }
        };
        let from = parse(&self.from, config.history_start)?;
        let to = parse(&self.to, Utc::now())?;
        Ok(TimeRange::new(from, to)?)
    }
}

fn statistics_source(config: &HarvestConfig) -> Result<Arc<dyn StatisticsSource>> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: std::time::Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        min_interval: config.source_delay(),
    })?;
    let mut client = StatisticsClient::new(http, &config.source_base_url, &config.source_path);
    if let Some(dir) = &config.archive_dir {
        client = client.with_archive(PayloadArchive::new(dir));
    }
    Ok(Arc::new(client))
}

async fn warehouse(config: &HarvestConfig) -> Result<Arc<PgWarehouse>> {
    let warehouse = PgWarehouse::connect(config)
        .await
        .context("connecting to the warehouse")?;
    Ok(Arc::new(warehouse))
}

async fn incremental(config: &HarvestConfig) -> Result<Arc<IncrementalSync>> {
    let pg = warehouse(config).await?;
    let sink: Arc<dyn Warehouse> = pg.clone();
    let leases: Arc<dyn LeaseStore> = pg;
    let sync = IncrementalSync::new(config, statistics_source(config)?, sink, leases)?;
    Ok(Arc::new(sync))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = HarvestConfig::load().context("loading configuration")?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Backfill(range) => {
            let range = range.resolve(&config)?;
            let sink: Arc<dyn Warehouse> = warehouse(&config).await?;
            let backfill = Backfill::new(&config, statistics_source(&config)?, sink)?;
            let summary = backfill.run(&range).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Sync => {
            let sync = incremental(&config).await?;
            let outcome = sync.handle_trigger(Trigger::default()).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Commands::Schedule => {
            let sync = incremental(&config).await?;
            run_scheduler_until_shutdown(sync, &config.sync_cron).await?;
        }
        Commands::Export { range, out } => {
            let range = range.resolve(&config)?;
            // collect() never writes, so the sink is never opened
            let sink: Arc<dyn Warehouse> = Arc::new(NoSink);
            let backfill = Backfill::new(&config, statistics_source(&config)?, sink)?;
            let series = backfill.collect(&range).await?;
            let manifest = export_snapshot(&out, &range, &series)?;
            info!(observations = series.len(), manifest = %manifest.display(), "snapshot written");
            println!("{}", manifest.display());
        }
        Commands::Purge => {
            let pg = warehouse(&config).await?;
            let before = Utc::now() - config.retention();
            let purged = pg.purge_expired(before).await?;
            println!("purged {purged} rows older than {before}");
        }
    }

    Ok(())
}

/// Stand-in sink for commands that only read from the source.
struct NoSink;

#[async_trait::async_trait]
impl Warehouse for NoSink {
    async fn recreate_tables(&self) -> Result<(), idh_core::HarvestError> {
        Err(read_only())
    }

    async fn insert_observations(&self, _rows: &[idh_core::Observation]) -> Result<(), idh_core::HarvestError> {
        Err(read_only())
    }

    async fn insert_metrics(&self, _rows: &[idh_core::MetricRow]) -> Result<(), idh_core::HarvestError> {
        Err(read_only())
    }

    async fn watermark(&self) -> Result<Option<DateTime<Utc>>, idh_core::HarvestError> {
        Ok(None)
    }

    async fn purge_expired(&self, _before: DateTime<Utc>) -> Result<u64, idh_core::HarvestError> {
        Err(read_only())
    }
}

fn read_only() -> idh_core::HarvestError {
    idh_core::HarvestError::Configuration("export does not write to the warehouse".to_string())
}
