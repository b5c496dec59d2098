use crate::cache_store::{CacheOverview, CacheStore, ClearFilter, IntegrityReport, Namespace};
use crate::config::Config;
use crate::enrichment::WebsiteEnricher;
use crate::errors::{AppError, ResultExt};
use crate::geocode::GeocodeResolver;
use crate::keys::normalize;
use crate::models::*;
use crate::pager::PlaceSearchPager;
use crate::processor::LeadProcessor;
use crate::services::MapsClient;
use crate::tiler::RegionTiler;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use moka::future::Cache;
use serde::Deserialize;
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared application state injected into handlers.
pub struct AppState {
    pub config: Config,
    pub cache: CacheStore,
    pub tiler: RegionTiler,
    pub processor: LeadProcessor<WebsiteEnricher>,
    /// Searches currently running, keyed by their normalized parameters.
    /// Value is the start time in unix seconds.
    pub searches_in_flight: Cache<String, i64>,
    /// Cancelled on shutdown; every request works on a child token.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wires the cache, maps client and enrichment collaborators together.
    pub fn new(
        config: Config,
        pool: SqlitePool,
        shutdown: CancellationToken,
    ) -> Result<Self, AppError> {
        let cache = CacheStore::new(pool);
        let maps = MapsClient::new(&config)?;
        let geocoder = GeocodeResolver::new(maps.clone(), cache.clone(), &config);
        let pager = PlaceSearchPager::new(maps, cache.clone(), &config);
        let tiler = RegionTiler::new(geocoder, pager, cache.clone(), config.search_ttl());
        let processor = LeadProcessor::new(cache.clone(), WebsiteEnricher::new(&config)?, &config);

        // Entries outlive any realistic search so a stuck key cannot block forever
        let searches_in_flight = Cache::builder()
            .time_to_live(Duration::from_secs(1800))
            .max_capacity(1_000)
            .build();

        Ok(Self {
            config,
            cache,
            tiler,
            processor,
            searches_in_flight,
            shutdown,
        })
    }
}

fn default_radius() -> f64 {
    5.0
}

fn default_max_results() -> usize {
    60
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    pub keyword: String,
    pub location: String,
    #[serde(default = "default_radius")]
    pub radius_miles: f64,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Forces a tiled search with this grid size.
    #[serde(default)]
    pub tile_count: Option<usize>,
}

impl SearchBody {
    pub fn in_flight_key(&self) -> String {
        format!(
            "{}|{}|{:.2}|{}|{}",
            normalize(&self.keyword),
            normalize(&self.location),
            self.radius_miles,
            self.max_results,
            self.tile_count.map(|n| n.to_string()).unwrap_or_default()
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct ProcessLeadsBody {
    pub leads: Vec<LeadRecord>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClearBody {
    /// Namespace to clear; every namespace when absent.
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub older_than_days: Option<u64>,
    #[serde(default)]
    pub tag_contains: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
}

impl ClearBody {
    fn filter(&self) -> Result<ClearFilter, AppError> {
        match (&self.older_than_days, &self.tag_contains, &self.key) {
            (None, None, None) => Ok(ClearFilter::All),
            (Some(days), None, None) => Ok(ClearFilter::OlderThan(Duration::from_secs(
                days.saturating_mul(86_400),
            ))),
            (None, Some(needle), None) if !needle.is_empty() => {
                Ok(ClearFilter::TagContains(needle.clone()))
            }
            (None, None, Some(key)) => Ok(ClearFilter::Key(key.clone())),
            _ => Err(AppError::BadRequest(
                "Use at most one of older_than_days, tag_contains (non-empty) or key".to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LocationQuery {
    pub location: String,
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "leadscout",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Holds a `searches_in_flight` entry. The key is removed on [`release`] or,
/// when the request is abandoned or panics, from a task spawned on drop.
///
/// [`release`]: InFlightGuard::release
struct InFlightGuard {
    searches: Cache<String, i64>,
    key: Option<String>,
}

impl InFlightGuard {
    async fn release(mut self) {
        if let Some(key) = self.key.take() {
            self.searches.invalidate(&key).await;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        let searches = self.searches.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!("Search abandoned, releasing in-flight key");
                handle.spawn(async move { searches.invalidate(&key).await });
            }
            Err(_) => tracing::warn!("No runtime to release in-flight search {}", key),
        }
    }
}

/// Runs one search unless an identical one is already in flight.
async fn run_search(state: &AppState, body: &SearchBody) -> Result<RegionSearchOutcome, AppError> {
    let key = body.in_flight_key();
    let now = chrono::Utc::now().timestamp();
    let entry = state
        .searches_in_flight
        .entry(key.clone())
        .or_insert(now)
        .await;
    if !entry.is_fresh() {
        let seconds_ago = now - entry.into_value();
        tracing::warn!("Duplicate search blocked, started {} seconds ago", seconds_ago);
        return Err(AppError::Conflict(format!(
            "An identical search is already running (started {} seconds ago)",
            seconds_ago
        )));
    }
    let guard = InFlightGuard {
        searches: state.searches_in_flight.clone(),
        key: Some(key),
    };

    let cancel = state.shutdown.child_token();
    let result = match body.tile_count {
        Some(tile_count) => {
            let region = RegionSearch {
                keyword: body.keyword.clone(),
                location: body.location.clone(),
                radius_miles: body.radius_miles,
                max_results: body.max_results,
                tile_count,
            };
            state.tiler.search_region(&region, &cancel).await
        }
        None => {
            state
                .tiler
                .generate_leads(
                    &body.keyword,
                    &body.location,
                    body.radius_miles,
                    body.max_results,
                    &cancel,
                )
                .await
        }
    };
    guard.release().await;

    if let Err(e) = &result {
        if let Some(location) = e.location() {
            tracing::warn!("Search for '{}' failed to resolve '{}': {}", body.keyword, location, e);
        }
    }
    result.map_err(AppError::from)
}

/// POST /api/v1/search
///
/// Finds businesses matching `keyword` around `location`. Requests above the
/// single-search limit, or with an explicit `tile_count`, run as a tiled
/// search. An identical search already running yields 409.
pub async fn search(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SearchBody>,
) -> Result<Json<RegionSearchOutcome>, AppError> {
    tracing::info!("POST /search - {:?}", body);
    Ok(Json(run_search(&state, &body).await?))
}

#[derive(Debug, Deserialize)]
pub struct GenerateLeadsBody {
    #[serde(flatten)]
    pub search: SearchBody,
    /// Recorded as the business type of every lead; defaults to the keyword.
    #[serde(default)]
    pub business_type: Option<String>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

/// POST /api/v1/leads/generate
///
/// Search followed by enrichment of every place found.
pub async fn generate_leads(
    State(state): State<Arc<AppState>>,
    Json(body): Json<GenerateLeadsBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    tracing::info!("POST /leads/generate - {:?}", body);
    let outcome = run_search(&state, &body.search).await?;

    let business_type = body
        .business_type
        .as_deref()
        .unwrap_or(&body.search.keyword)
        .trim();
    let leads: Vec<LeadRecord> = outcome
        .places
        .iter()
        .map(|place| LeadRecord::from_place(place, business_type))
        .collect();

    let cancel = state.shutdown.child_token();
    let batch = state
        .processor
        .process_leads(&leads, body.use_cache, &cancel)
        .await;

    Ok(Json(json!({
        "search": {
            "places_found": outcome.places.len(),
            "tiles_total": outcome.tiles_total,
            "tiles_visited": outcome.tiles_visited,
            "tiles_from_cache": outcome.tiles_from_cache,
            "failed_tiles": outcome.failed_tiles,
            "cancelled": outcome.cancelled,
        },
        "leads": batch,
    })))
}

/// POST /api/v1/leads/process
///
/// Enriches a batch of leads. Rows repeating a website are skipped and
/// leads seen in earlier runs come from the cache unless `use_cache` is false.
pub async fn process_leads(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ProcessLeadsBody>,
) -> Result<Json<BatchOutcome>, AppError> {
    tracing::info!(
        "POST /leads/process - {} leads, use_cache={}",
        body.leads.len(),
        body.use_cache
    );
    if body.leads.is_empty() {
        return Err(AppError::BadRequest("No leads supplied".to_string()));
    }

    let cancel = state.shutdown.child_token();
    let outcome = state
        .processor
        .process_leads(&body.leads, body.use_cache, &cancel)
        .await;
    Ok(Json(outcome))
}

/// GET /api/v1/cache/stats
pub async fn cache_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<CacheOverview>, AppError> {
    let overview = state.cache.overview().await.context("Failed to read cache stats")?;
    Ok(Json(overview))
}

/// GET /api/v1/cache/integrity
pub async fn cache_integrity(
    State(state): State<Arc<AppState>>,
) -> Result<Json<IntegrityReport>, AppError> {
    let report = state
        .cache
        .integrity_check()
        .await
        .context("Failed to check cache integrity")?;
    if !report.is_clean() {
        tracing::warn!("Cache integrity check found corrupt entries");
    }
    Ok(Json(report))
}

/// POST /api/v1/cache/clear
pub async fn clear_cache(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ClearBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    tracing::info!("POST /cache/clear - {:?}", body);
    let filter = body.filter()?;

    let deleted = match &body.namespace {
        Some(name) => {
            let namespace: Namespace = name.parse().map_err(AppError::BadRequest)?;
            state.cache.clear(namespace, &filter).await?
        }
        None => state.cache.clear_all(&filter).await?,
    };

    Ok(Json(json!({ "deleted": deleted })))
}

/// DELETE /api/v1/cache/geocode?location=...
///
/// Forgets the cached coordinates of one location, e.g. after a typo was geocoded.
pub async fn forget_location(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LocationQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    if query.location.trim().is_empty() {
        return Err(AppError::BadRequest("location is required".to_string()));
    }
    let deleted = state.tiler.geocoder().invalidate(&query.location).await?;
    tracing::info!("Forgot geocode for '{}' ({} entries)", query.location.trim(), deleted);

    Ok(Json(json!({ "location": query.location.trim(), "deleted": deleted })))
}

/// API routes, without the middleware stack the server adds.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/search", post(search))
        .route("/api/v1/leads/generate", post(generate_leads))
        .route("/api/v1/leads/process", post(process_leads))
        .route("/api/v1/cache/stats", get(cache_stats))
        .route("/api/v1/cache/integrity", get(cache_integrity))
        .route("/api/v1/cache/clear", post(clear_cache))
        .route("/api/v1/cache/geocode", delete(forget_location))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear_body(json: serde_json::Value) -> ClearBody {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn clear_filter_from_body() {
        assert_eq!(clear_body(json!({})).filter().unwrap(), ClearFilter::All);
        assert_eq!(
            clear_body(json!({ "older_than_days": 7 })).filter().unwrap(),
            ClearFilter::OlderThan(Duration::from_secs(7 * 86_400))
        );
        assert_eq!(
            clear_body(json!({ "tag_contains": "austin" })).filter().unwrap(),
            ClearFilter::TagContains("austin".to_string())
        );
        assert!(clear_body(json!({ "older_than_days": 7, "key": "k" }))
            .filter()
            .is_err());
        assert!(clear_body(json!({ "tag_contains": "" })).filter().is_err());
    }

    #[test]
    fn in_flight_key_ignores_case_and_padding() {
        let a: SearchBody = serde_json::from_value(json!({
            "keyword": "Plumber", "location": "Austin, TX"
        }))
        .unwrap();
        let b: SearchBody = serde_json::from_value(json!({
            "keyword": " plumber", "location": "austin, tx ", "radius_miles": 5.0, "max_results": 60
        }))
        .unwrap();
        assert_eq!(a.in_flight_key(), b.in_flight_key());
    }
}
