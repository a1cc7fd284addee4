//! JSON query API over the harvested snapshot, plus harvest control.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;
use varietal_core::{now_timestamp, VarietyRecord};
use varietal_harvest::{key_frequencies, HarvestJobs, Harvester, JobError, JobHandle, JobState};
use varietal_storage::SnapshotError;

mod cache;

pub use cache::SnapshotCache;

pub const CRATE_NAME: &str = "varietal-web";

#[derive(Debug, Clone, Copy)]
pub struct WebConfig {
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("VARIETAL_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<SnapshotCache>,
    pub jobs: HarvestJobs,
}

impl AppState {
    /// The cache reads the same file the harvester writes.
    pub fn new(harvester: Arc<Harvester>) -> Self {
        Self {
            cache: Arc::new(SnapshotCache::new(harvester.store())),
            jobs: HarvestJobs::new(harvester),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/varieties", get(varieties_handler))
        .route("/variety/{name}", get(variety_handler))
        .route("/search", get(search_handler))
        .route("/stats", get(stats_handler))
        .route("/refresh", get(refresh_handler))
        .route("/scrape", post(scrape_handler))
        .route("/scrape/status", get(scrape_status_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "query api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

/// Reload `cache` once `handle` completes. Failed or cancelled jobs leave it alone.
pub fn reload_when_complete(cache: Arc<SnapshotCache>, handle: JobHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let status = handle.wait().await;
        if status.state != JobState::Completed {
            return;
        }
        if let Err(err) = cache.reload().await {
            warn!(error = %err, "snapshot reload after harvest failed");
        }
    })
}

struct ApiError {
    status: StatusCode,
    error: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error,
            message: message.into(),
        }
    }
}

impl From<SnapshotError> for ApiError {
    fn from(err: SnapshotError) -> Self {
        let error = match err {
            SnapshotError::Missing { .. } => "Data file not found",
            SnapshotError::Malformed { .. } => "Invalid data file",
            _ => "Failed to load data",
        };
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, error, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.error, "message": self.message })),
        )
            .into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

async fn index_handler() -> Json<serde_json::Value> {
    Json(json!({
        "message": "Tomato Varieties Database API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "/varieties": "Get all tomato varieties",
            "/variety/{name}": "Get specific variety by name or slug",
            "/search?q=<query>": "Search varieties",
            "/stats": "Get database statistics",
            "/refresh": "Reload data from the snapshot file",
            "/scrape": "Start a background harvest (POST)",
            "/scrape/status": "Check harvest status",
        }
    }))
}

#[derive(Serialize)]
struct VarietiesResponse<'a> {
    varieties: &'a [VarietyRecord],
    total_count: usize,
    scraped_at: &'a str,
    source: &'a str,
}

async fn varieties_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    let doc = state.cache.get().await?;
    Ok(Json(VarietiesResponse {
        varieties: &doc.varieties,
        total_count: doc.total_count,
        scraped_at: &doc.scraped_at,
        source: &doc.source,
    })
    .into_response())
}

async fn variety_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult {
    let doc = state.cache.get().await?;
    let wanted = name.to_lowercase();
    match doc
        .varieties
        .iter()
        .find(|v| v.name.to_lowercase() == wanted || v.slug.to_lowercase() == wanted)
    {
        Some(variety) => Ok(Json(variety).into_response()),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "Variety not found",
            format!("No variety found with name: {name}"),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
}

#[derive(Serialize)]
struct SearchResponse<'a> {
    query: String,
    results: Vec<&'a VarietyRecord>,
    total_results: usize,
    searched_at: String,
}

/// Name, description and every characteristic and growing-info value, lower-cased.
fn searchable_text(variety: &VarietyRecord) -> String {
    [variety.name.as_str(), variety.description.as_str()]
        .into_iter()
        .chain(variety.characteristics.values().map(String::as_str))
        .chain(variety.growing_info.values().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> ApiResult {
    let query = params.q.trim().to_lowercase();
    if query.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "No query provided",
            "Please provide a search query using ?q=<query>",
        ));
    }

    let doc = state.cache.get().await?;
    let results = doc
        .varieties
        .iter()
        .filter(|v| searchable_text(v).contains(&query))
        .collect::<Vec<_>>();
    Ok(Json(SearchResponse {
        query,
        total_results: results.len(),
        results,
        searched_at: now_timestamp(),
    })
    .into_response())
}

#[derive(Serialize)]
struct StatsResponse<'a> {
    total_varieties: usize,
    scraped_at: &'a str,
    source: &'a str,
    characteristics_stats: BTreeMap<String, usize>,
    growing_info_stats: BTreeMap<String, usize>,
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    let doc = state.cache.get().await?;
    Ok(Json(StatsResponse {
        total_varieties: doc.varieties.len(),
        scraped_at: &doc.scraped_at,
        source: &doc.source,
        characteristics_stats: key_frequencies(doc.varieties.iter().map(|v| &v.characteristics)),
        growing_info_stats: key_frequencies(doc.varieties.iter().map(|v| &v.growing_info)),
    })
    .into_response())
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    let doc = state.cache.reload().await?;
    Ok(Json(json!({
        "message": "Data refreshed successfully",
        "total_varieties": doc.varieties.len(),
        "refreshed_at": now_timestamp(),
    }))
    .into_response())
}

async fn scrape_handler(State(state): State<Arc<AppState>>) -> ApiResult {
    match state.jobs.start() {
        Ok(handle) => {
            let job_id = handle.id();
            info!(%job_id, "harvest requested over http");
            reload_when_complete(Arc::clone(&state.cache), handle);
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({
                    "message": "Scraper started successfully! This may take a few minutes.",
                    "status": JobState::Running,
                    "job_id": job_id,
                })),
            )
                .into_response())
        }
        Err(err @ JobError::AlreadyRunning { .. }) => Err(ApiError::new(
            StatusCode::CONFLICT,
            "Scraper already running",
            err.to_string(),
        )),
    }
}

#[derive(Serialize)]
struct ScrapeStatusResponse {
    scraper_running: bool,
    status: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<String>,
}

async fn scrape_status_handler(State(state): State<Arc<AppState>>) -> Json<ScrapeStatusResponse> {
    let status = state.jobs.status();
    Json(ScrapeStatusResponse {
        scraper_running: status.is_running(),
        status: status.state,
        job_id: status.job_id,
        detail: status.detail,
        started_at: status.started_at,
        finished_at: status.finished_at,
    })
}
