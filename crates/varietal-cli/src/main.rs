use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use varietal_core::check_compatibility;
use varietal_extract::ExtractorSet;
use varietal_harvest::{reextract_snapshot, HarvestConfig, Harvester, QualityReport};
use varietal_storage::SnapshotStore;
use varietal_web::{AppState, WebConfig};

mod logging;

#[derive(Debug, Parser)]
#[command(name = "varietal-cli")]
#[command(about = "Tomato variety catalog harvester and query API")]
struct Cli {
    /// More log output (`-v` for varietal debug events, `-vv` for everything).
    /// Ignored when `RUST_LOG` is set.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl the catalog and write a fresh snapshot.
    Harvest(HarvestArgs),
    /// Serve the JSON query API over the snapshot.
    Serve(ServeArgs),
    /// Validate a snapshot and print a data-quality summary.
    Check(SnapshotArgs),
    /// Re-run text extraction over a snapshot's retained page text.
    Reextract(SnapshotArgs),
}

#[derive(Debug, Default, Args)]
struct HarvestArgs {
    /// Concurrent page fetches.
    #[arg(long)]
    workers: Option<usize>,
    /// Only harvest the first N discovered varieties.
    #[arg(long)]
    max_varieties: Option<usize>,
    #[arg(long)]
    catalog_url: Option<String>,
    /// Snapshot destination.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Order varieties by slug instead of completion order.
    #[arg(long)]
    sort_by_slug: bool,
}

impl HarvestArgs {
    fn apply(&self, config: &mut HarvestConfig) {
        if let Some(workers) = self.workers {
            config.workers = workers.max(1);
        }
        if let Some(max) = self.max_varieties {
            config.max_varieties = (max > 0).then_some(max);
        }
        if let Some(url) = &self.catalog_url {
            config.catalog_url = url.clone();
        }
        if let Some(out) = &self.out {
            config.snapshot_path = out.clone();
        }
        config.sort_by_slug |= self.sort_by_slug;
    }
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long)]
    port: Option<u16>,
    /// Snapshot to serve and to write from `POST /scrape`.
    #[arg(long)]
    path: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct SnapshotArgs {
    #[arg(long)]
    path: Option<PathBuf>,
    /// How many of the most common keys to list.
    #[arg(long, default_value_t = 10)]
    top: usize,
}

impl SnapshotArgs {
    fn store(&self, config: &HarvestConfig) -> SnapshotStore {
        SnapshotStore::new(self.path.clone().unwrap_or_else(|| config.snapshot_path.clone()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;
    let mut config = HarvestConfig::from_env();

    match cli
        .command
        .unwrap_or_else(|| Commands::Harvest(HarvestArgs::default()))
    {
        Commands::Harvest(args) => {
            args.apply(&mut config);
            let harvester = Harvester::new(config).context("setting up harvester")?;
            let summary = harvester.run_and_write().await.context("harvest failed")?;
            if summary.failed > 0 {
                warn!(failed = summary.failed, "some variety pages could not be harvested");
            }
            println!(
                "harvest complete: run_id={} varieties={} failed={} workers={} \
                 elapsed={:.2}s snapshot={}",
                summary.run_id,
                summary.varieties,
                summary.failed,
                summary.workers,
                summary.total_time_seconds,
                summary.snapshot_path.display()
            );
            if let Some(note) = summary.note {
                println!("note: {note}");
            }
        }
        Commands::Serve(args) => {
            if let Some(path) = args.path {
                config.snapshot_path = path;
            }
            let port = args.port.unwrap_or(WebConfig::from_env().port);
            info!(
                port,
                snapshot = %config.snapshot_path.display(),
                workers = config.workers,
                "starting query api"
            );
            let harvester = Harvester::new(config).context("setting up harvester")?;
            varietal_web::serve(AppState::new(Arc::new(harvester)), port).await?;
        }
        Commands::Check(args) => {
            let store = args.store(&config);
            let value = store
                .load_value()
                .await
                .with_context(|| format!("reading {}", store.path().display()))?;
            if let Err(reason) = check_compatibility(&value) {
                warn!(
                    path = %store.path().display(),
                    reason = reason.as_str(),
                    "snapshot failed compatibility check"
                );
                anyhow::bail!("{} is not a compatible snapshot: {reason}", store.path().display());
            }
            let document = store.load().await?;
            info!(varieties = document.total_count, "snapshot passed compatibility check");
            println!(
                "{}: compatible (scraped_at={} source={} workers={} elapsed={}s)",
                store.path().display(),
                document.scraped_at,
                document.source,
                document.scraping_stats.workers_used,
                document.scraping_stats.total_time_seconds
            );
            print!("{}", QualityReport::from_document(&document, args.top).render());
        }
        Commands::Reextract(args) => {
            let store = args.store(&config);
            let summary = reextract_snapshot(&store, ExtractorSet::default())
                .await
                .context("re-extraction failed")?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
