//! Harvest orchestration: discover the catalog, extract every variety page on
//! a bounded worker pool, then hand the snapshot to the store.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;
use varietal_core::{
    disambiguate_slugs, ScrapingStats, SnapshotDocument, VariantLinkRef, VarietyRecord,
};
use varietal_extract::{
    discover, extract_variety, reextract_text_fields, DiscoveryRules, ExtractorSet,
};
use varietal_storage::{HttpClientConfig, HttpFetcher, PageSource, SnapshotError, SnapshotStore};

mod jobs;
mod quality;

pub use jobs::{HarvestJobs, JobError, JobHandle, JobState, JobStatus};
pub use quality::{key_frequencies, QualityReport, RichestRecord};

pub const CRATE_NAME: &str = "varietal-harvest";

pub const DEFAULT_CATALOG_URL: &str = "https://njaes.rutgers.edu/tomato-varieties/";

const PROGRESS_EVERY: usize = 10;

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub catalog_url: String,
    pub workers: usize,
    pub max_varieties: Option<usize>,
    pub snapshot_path: PathBuf,
    pub user_agent: String,
    pub discovery_timeout: Duration,
    pub page_timeout: Duration,
    pub job_timeout: Duration,
    pub sort_by_slug: bool,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`HarvestConfig::from_env`] with an arbitrary variable source.
    /// Unparseable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |key: &str, default: u64| {
            Duration::from_secs(parse_var(&lookup, key).unwrap_or(default))
        };
        Self {
            catalog_url: lookup("VARIETAL_CATALOG_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CATALOG_URL.to_string()),
            workers: parse_var(&lookup, "VARIETAL_WORKERS").unwrap_or(8usize).max(1),
            max_varieties: parse_var(&lookup, "VARIETAL_MAX_VARIETIES").filter(|n: &usize| *n > 0),
            snapshot_path: lookup("VARIETAL_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("tomato_varieties.json")),
            user_agent: lookup("VARIETAL_USER_AGENT")
                .unwrap_or_else(|| "varietal-bot/0.1".to_string()),
            discovery_timeout: secs("VARIETAL_DISCOVERY_TIMEOUT_SECS", 10),
            page_timeout: secs("VARIETAL_PAGE_TIMEOUT_SECS", 15),
            job_timeout: secs("VARIETAL_JOB_TIMEOUT_SECS", 300),
            sort_by_slug: lookup("VARIETAL_SORT_BY_SLUG")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        }
    }
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("invalid catalog url {url}: {reason}")]
    InvalidCatalogUrl { url: String, reason: String },
    #[error("http client setup failed: {0}")]
    Http(String),
    #[error(transparent)]
    Persist(SnapshotError),
    #[error(transparent)]
    Load(SnapshotError),
    #[error("harvest cancelled")]
    Cancelled,
    #[error("harvest timed out after {after:?}")]
    TimedOut { after: Duration },
}

/// What a finished harvest reports once its snapshot is on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestSummary {
    pub run_id: Uuid,
    pub varieties: usize,
    pub failed: usize,
    pub workers: usize,
    pub total_time_seconds: f64,
    pub snapshot_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReextractSummary {
    pub records: usize,
    pub changed: usize,
    pub snapshot_path: PathBuf,
}

pub struct Harvester {
    config: HarvestConfig,
    source: Arc<dyn PageSource>,
    rules: DiscoveryRules,
    extractors: ExtractorSet,
}

impl Harvester {
    pub fn new(config: HarvestConfig) -> Result<Self, HarvestError> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: Some(config.user_agent.clone()),
            ..HttpClientConfig::default()
        })
        .map_err(|err| HarvestError::Http(format!("{err:#}")))?;
        Ok(Self::with_source(config, Arc::new(fetcher)))
    }

    pub fn with_source(mut config: HarvestConfig, source: Arc<dyn PageSource>) -> Self {
        config.workers = config.workers.max(1);
        Self {
            config,
            source,
            rules: DiscoveryRules::default(),
            extractors: ExtractorSet::default(),
        }
    }

    pub fn with_discovery_rules(mut self, rules: DiscoveryRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_extractors(mut self, extractors: ExtractorSet) -> Self {
        self.extractors = extractors;
        self
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn store(&self) -> SnapshotStore {
        SnapshotStore::new(&self.config.snapshot_path)
    }

    /// Discover, fan out, collect. Page failures are counted, never raised;
    /// only an unusable catalog url fails the run.
    pub async fn run(&self) -> Result<SnapshotDocument, HarvestError> {
        let catalog_url = &self.config.catalog_url;
        Url::parse(catalog_url).map_err(|err| HarvestError::InvalidCatalogUrl {
            url: catalog_url.clone(),
            reason: err.to_string(),
        })?;

        let mut links = discover(
            self.source.as_ref(),
            catalog_url,
            self.config.discovery_timeout,
            &self.rules,
        )
        .await;
        if links.is_empty() {
            warn!(url = %catalog_url, "no variety links discovered; writing an empty snapshot");
            return Ok(SnapshotDocument::empty(
                catalog_url.clone(),
                self.config.workers,
                format!("no variety links were discovered at {catalog_url}"),
            ));
        }

        disambiguate_slugs(&mut links);
        if let Some(max) = self.config.max_varieties {
            links.truncate(max);
        }

        info!(
            varieties = links.len(),
            workers = self.config.workers,
            "extracting variety pages"
        );
        let started = Instant::now();
        let (varieties, failed) = self.harvest_links(links).await;
        let stats = ScrapingStats::compute(
            started.elapsed(),
            self.config.workers,
            varieties.len(),
            failed,
        );

        let mut document = SnapshotDocument::new(catalog_url.clone(), varieties, stats);
        if self.config.sort_by_slug {
            document.sort_by_slug();
        }
        info!(
            varieties = document.total_count,
            failed,
            seconds = stats.total_time_seconds,
            "harvest finished"
        );
        Ok(document)
    }

    /// [`Harvester::run`], abandoned as soon as `cancel` fires. Dropping the
    /// run aborts every in-flight page task.
    pub async fn run_until_cancelled(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SnapshotDocument, HarvestError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HarvestError::Cancelled),
            result = self.run() => result,
        }
    }

    pub async fn write_snapshot(
        &self,
        run_id: Uuid,
        document: &SnapshotDocument,
    ) -> Result<HarvestSummary, HarvestError> {
        let store = self.store();
        store.write(document).await.map_err(HarvestError::Persist)?;
        info!(%run_id, path = %store.path().display(), "snapshot written");
        Ok(HarvestSummary {
            run_id,
            varieties: document.total_count,
            failed: document.scraping_stats.failed_count,
            workers: document.scraping_stats.workers_used,
            total_time_seconds: document.scraping_stats.total_time_seconds,
            snapshot_path: store.path().to_path_buf(),
            note: document.note.clone(),
        })
    }

    pub async fn run_and_write(&self) -> Result<HarvestSummary, HarvestError> {
        let run_id = Uuid::new_v4();
        async {
            let document = self.run().await?;
            self.write_snapshot(run_id, &document).await
        }
        .instrument(info_span!("harvest", %run_id))
        .await
    }

    async fn harvest_links(&self, links: Vec<VariantLinkRef>) -> (Vec<VarietyRecord>, usize) {
        let total = links.len();
        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let mut tasks = JoinSet::new();

        for link in links {
            let semaphore = Arc::clone(&semaphore);
            let source = Arc::clone(&self.source);
            let timeout = self.config.page_timeout;
            let extractors = self.extractors;
            tasks.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("harvest semaphore is never closed");
                let result = extract_variety(
                    source.as_ref(),
                    &link.url,
                    &link.display_name,
                    timeout,
                    extractors,
                )
                .await;
                (link, result)
            });
        }

        let mut varieties = Vec::with_capacity(total);
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((link, Ok(mut record))) => {
                    debug!(slug = %link.slug, "extracted variety");
                    record.slug = link.slug;
                    varieties.push(record);
                }
                Ok((link, Err(err))) => {
                    failed += 1;
                    warn!(url = %link.url, error = %err, "variety extraction failed");
                }
                Err(err) => {
                    failed += 1;
                    warn!(error = %err, "variety task did not finish");
                }
            }
            let completed = varieties.len() + failed;
            if completed % PROGRESS_EVERY == 0 || completed == total {
                info!(completed, total, failed, "harvest progress");
            }
        }
        (varieties, failed)
    }
}

/// Re-run the text strategies over every record of the stored snapshot and
/// write it back. Nothing is fetched.
pub async fn reextract_snapshot(
    store: &SnapshotStore,
    extractors: ExtractorSet,
) -> Result<ReextractSummary, HarvestError> {
    let mut document = store.load().await.map_err(HarvestError::Load)?;
    let mut changed = 0usize;
    for record in &mut document.varieties {
        let before = (record.characteristics.clone(), record.growing_info.clone());
        reextract_text_fields(record, extractors);
        if before != (record.characteristics.clone(), record.growing_info.clone()) {
            changed += 1;
        }
    }
    store.write(&document).await.map_err(HarvestError::Persist)?;
    info!(records = document.total_count, changed, "re-extracted snapshot");
    Ok(ReextractSummary {
        records: document.total_count,
        changed,
        snapshot_path: store.path().to_path_buf(),
    })
}
