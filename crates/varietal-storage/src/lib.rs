//! Page fetching + snapshot persistence for the variety catalog.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;
use varietal_core::{check_compatibility, SnapshotDocument};

pub const CRATE_NAME: &str = "varietal-storage";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Anything that can hand back the HTML of a page.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_text(&self, url: &str, timeout: Duration) -> Result<String, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub user_agent: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Single-attempt HTTP fetcher. The timeout is chosen per request so that
/// the catalog root and the variety pages can use different bounds.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.connect_timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

fn request_error(url: &str, timeout: Duration, err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
            timeout,
        }
    } else {
        FetchError::Request {
            url: url.to_string(),
            source: err,
        }
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_text(&self, url: &str, timeout: Duration) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", url);
        async move {
            let resp = self
                .client
                .get(url)
                .timeout(timeout)
                .send()
                .await
                .map_err(|err| request_error(url, timeout, err))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let body = resp
                .text()
                .await
                .map_err(|err| request_error(url, timeout, err))?;
            debug!(bytes = body.len(), "fetched page");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

/// In-memory pages keyed by absolute URL. Unknown URLs answer 404.
#[derive(Debug, Clone, Default)]
pub struct StaticPages {
    pages: HashMap<String, String>,
    latency: HashMap<String, Duration>,
    default_latency: Duration,
}

impl StaticPages {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.insert(url, html);
        self
    }

    pub fn insert(&mut self, url: impl Into<String>, html: impl Into<String>) {
        self.pages.insert(url.into(), html.into());
    }

    /// Delay applied to every response without a page-specific latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.default_latency = latency;
        self
    }

    pub fn with_page_latency(mut self, url: impl Into<String>, latency: Duration) -> Self {
        self.latency.insert(url.into(), latency);
        self
    }
}

#[async_trait]
impl PageSource for StaticPages {
    async fn fetch_text(&self, url: &str, timeout: Duration) -> Result<String, FetchError> {
        let latency = self.latency.get(url).copied().unwrap_or(self.default_latency);
        if latency > timeout {
            tokio::time::sleep(timeout).await;
            return Err(FetchError::Timeout {
                url: url.to_string(),
                timeout,
            });
        }
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot not found at {path}; run a harvest first")]
    Missing { path: PathBuf },
    #[error("failed to read snapshot at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("snapshot at {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to persist snapshot to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The single file a harvest writes and the query layer reads.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Replace the persisted document using a temp file + rename in the same directory.
    pub async fn write(&self, document: &SnapshotDocument) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec_pretty(document)?;
        let parent = self.parent_dir();
        let persist_err = |path: &Path, source: std::io::Error| SnapshotError::Persist {
            path: path.to_path_buf(),
            source,
        };

        fs::create_dir_all(&parent)
            .await
            .map_err(|err| persist_err(&parent, err))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot.json".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4().simple()));

        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        if let Err(err) = write_result {
            let _ = fs::remove_file(&temp_path).await;
            return Err(persist_err(&temp_path, err));
        }

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(persist_err(&self.path, err));
        }

        debug!(path = %self.path.display(), bytes = bytes.len(), "snapshot written");
        Ok(())
    }

    /// Raw JSON without any shape validation.
    pub async fn load_value(&self) -> Result<JsonValue, SnapshotError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(SnapshotError::Missing {
                    path: self.path.clone(),
                })
            }
            Err(err) => {
                return Err(SnapshotError::Read {
                    path: self.path.clone(),
                    source: err,
                })
            }
        };
        serde_json::from_slice(&bytes).map_err(|err| self.malformed(err.to_string()))
    }

    pub async fn load(&self) -> Result<SnapshotDocument, SnapshotError> {
        let value = self.load_value().await?;
        check_compatibility(&value).map_err(|reason| self.malformed(reason))?;
        serde_json::from_value(value).map_err(|err| self.malformed(err.to_string()))
    }

    fn malformed(&self, reason: String) -> SnapshotError {
        SnapshotError::Malformed {
            path: self.path.clone(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;
    use varietal_core::{ScrapingStats, VarietyRecord};

    fn sample_document(names: &[&str]) -> SnapshotDocument {
        let varieties = names
            .iter()
            .map(|name| VarietyRecord {
                name: name.to_string(),
                url: format!("https://example.test/tomato-varieties/{}", name.to_lowercase()),
                slug: name.to_lowercase(),
                page_title: Some(format!("{name} | Tomato Varieties")),
                description: "Sweet and early.".to_string(),
                characteristics: BTreeMap::from([("origin".to_string(), "Italy".to_string())]),
                growing_info: BTreeMap::new(),
                images: Vec::new(),
                raw_text: "Origin: Italy".to_string(),
                block_text: "Origin: Italy".to_string(),
            })
            .collect();
        SnapshotDocument::new(
            "https://example.test/tomato-varieties/",
            varieties,
            ScrapingStats::default(),
        )
    }

    #[tokio::test]
    async fn written_snapshot_loads_back_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("nested/tomato_varieties.json"));
        let doc = sample_document(&["Brandywine", "Sungold"]);

        store.write(&doc).await.expect("write");
        let loaded = store.load().await.expect("load");
        assert_eq!(loaded, doc);

        let leftovers = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn write_fully_replaces_previous_document() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("tomato_varieties.json"));
        store.write(&sample_document(&["A", "B", "C"])).await.unwrap();
        store.write(&sample_document(&["Z"])).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.total_count, 1);
        assert_eq!(loaded.varieties[0].name, "Z");
    }

    #[tokio::test]
    async fn non_ascii_text_is_written_verbatim() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("s.json"));
        store.write(&sample_document(&["Cœur de Bœuf"])).await.unwrap();
        let text = std::fs::read_to_string(store.path()).unwrap();
        assert!(text.contains("Cœur de Bœuf"));
        assert!(text.contains("\n  \"varieties\""));
    }

    #[tokio::test]
    async fn missing_snapshot_is_reported_as_missing() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path().join("absent.json"));
        assert!(matches!(store.load().await, Err(SnapshotError::Missing { .. })));
    }

    #[tokio::test]
    async fn invalid_json_and_broken_contract_are_malformed() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("broken.json");
        let store = SnapshotStore::new(&path);

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(store.load().await, Err(SnapshotError::Malformed { .. })));

        std::fs::write(&path, r#"{"varieties": [], "scraped_at": "x"}"#).unwrap();
        match store.load().await {
            Err(SnapshotError::Malformed { reason, .. }) => assert!(reason.contains("total_count")),
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn persist_failure_is_surfaced() {
        let dir = tempdir().expect("tempdir");
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let store = SnapshotStore::new(blocker.join("snapshot.json"));
        assert!(matches!(
            store.write(&sample_document(&["A"])).await,
            Err(SnapshotError::Persist { .. })
        ));
    }

    #[tokio::test]
    async fn static_pages_serve_known_urls_and_404_the_rest() {
        let pages = StaticPages::new().with_page("https://example.test/a", "<p>a</p>");
        let timeout = Duration::from_secs(1);
        assert_eq!(pages.fetch_text("https://example.test/a", timeout).await.unwrap(), "<p>a</p>");
        assert!(matches!(
            pages.fetch_text("https://example.test/b", timeout).await,
            Err(FetchError::HttpStatus { status: 404, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn static_pages_time_out_slow_responses() {
        let pages = StaticPages::new()
            .with_page("https://example.test/slow", "<p>slow</p>")
            .with_page_latency("https://example.test/slow", Duration::from_secs(30));
        let result = pages
            .fetch_text("https://example.test/slow", Duration::from_secs(15))
            .await;
        assert!(matches!(result, Err(FetchError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn page_latency_overrides_the_default_latency() {
        let pages = StaticPages::new()
            .with_latency(Duration::from_secs(30))
            .with_page("https://example.test/slow", "<p>slow</p>")
            .with_page("https://example.test/fast", "<p>fast</p>")
            .with_page_latency("https://example.test/fast", Duration::from_millis(50));
        let timeout = Duration::from_secs(15);

        let started = tokio::time::Instant::now();
        assert_eq!(
            pages.fetch_text("https://example.test/fast", timeout).await.unwrap(),
            "<p>fast</p>"
        );
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(matches!(
            pages.fetch_text("https://example.test/slow", timeout).await,
            Err(FetchError::Timeout { .. })
        ));
    }
}
