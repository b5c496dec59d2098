/// Integration tests with a mocked maps service
/// Exercises geocoding, paging and tiled search against wiremock and an in-memory cache
use leadscout::cache_store::{CacheStore, Namespace};
use leadscout::config::Config;
use leadscout::db::Database;
use leadscout::errors::SearchError;
use leadscout::geocode::GeocodeResolver;
use leadscout::models::{LatLng, RegionSearch, SearchRequest};
use leadscout::pacing::{Pacing, RetryPolicy};
use leadscout::pager::PlaceSearchPager;
use leadscout::services::MapsClient;
use leadscout::tiler::RegionTiler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const WEEK: Duration = Duration::from_secs(7 * 86_400);
const MONTH: Duration = Duration::from_secs(30 * 86_400);

/// Helper function to create test config
fn create_test_config(maps_base_url: String) -> Config {
    Config {
        google_api_key: "test_key".to_string(),
        maps_base_url,
        database_url: "sqlite::memory:".to_string(),
        http_timeout_secs: 5,
        ..Config::default()
    }
}

async fn cache() -> CacheStore {
    let db = Database::in_memory().await.unwrap();
    CacheStore::new(db.pool)
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
    }
}

fn geocoder(server: &MockServer, cache: &CacheStore) -> GeocodeResolver {
    let maps = MapsClient::new(&create_test_config(server.uri())).unwrap();
    GeocodeResolver::with_policy(maps, cache.clone(), fast_retry(), WEEK)
}

fn pager(server: &MockServer, cache: &CacheStore) -> PlaceSearchPager {
    let maps = MapsClient::new(&create_test_config(server.uri())).unwrap();
    PlaceSearchPager::with_pacing(maps, cache.clone(), Pacing::none(), MONTH)
}

fn tiler(server: &MockServer, cache: &CacheStore) -> RegionTiler {
    RegionTiler::new(
        geocoder(server, cache),
        pager(server, cache),
        cache.clone(),
        WEEK,
    )
}

fn geocode_ok(lat: f64, lng: f64) -> serde_json::Value {
    serde_json::json!({
        "status": "OK",
        "results": [{ "geometry": { "location": { "lat": lat, "lng": lng } } }]
    })
}

async fn mount_geocode_ok(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/geocode/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(geocode_ok(30.2672, -97.7431)))
        .mount(server)
        .await;
}

async fn requests_to(server: &MockServer, endpoint: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == endpoint)
        .count()
}

fn query_value(request: &Request, name: &str) -> Option<String> {
    request
        .url
        .query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Details for any place id; ids starting with `missing` are reported not found.
struct DetailsEcho;

impl Respond for DetailsEcho {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let place_id = query_value(request, "place_id").unwrap_or_default();
        if place_id.starts_with("missing") {
            return ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "NOT_FOUND" }));
        }
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "OK",
            "result": {
                "name": format!("Business {}", place_id),
                "formatted_address": format!("{} Main St", place_id),
                "formatted_phone_number": "(512) 555-0100",
                "website": format!("https://{}.example.org", place_id)
            }
        }))
    }
}

async fn mount_details(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/place/details/json"))
        .respond_with(DetailsEcho)
        .mount(server)
        .await;
}

/// Every call returns `per_page` fresh place ids and no continuation token.
/// The calls listed in `fail_on` get a 500 instead.
struct FreshPlaces {
    calls: AtomicUsize,
    per_page: usize,
    fail_on: Vec<usize>,
}

impl FreshPlaces {
    fn new(per_page: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            per_page,
            fail_on: Vec::new(),
        }
    }
}

impl Respond for FreshPlaces {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.contains(&call) {
            return ResponseTemplate::new(500).set_body_string("backend unavailable");
        }
        let results: Vec<serde_json::Value> = (0..self.per_page)
            .map(|i| serde_json::json!({ "place_id": format!("c{}p{}", call, i) }))
            .collect();
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "OK",
            "results": results
        }))
    }
}

#[tokio::test]
async fn test_geocode_cached_across_case_and_whitespace() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/geocode/json"))
        .and(query_param("address", "Austin, TX"))
        .and(query_param("key", "test_key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(geocode_ok(30.2672, -97.7431)))
        .expect(1)
        .mount(&server)
        .await;

    let cache = cache().await;
    let resolver = geocoder(&server, &cache);
    let cancel = CancellationToken::new();

    let first = resolver.resolve("Austin, TX", &cancel).await.unwrap();
    let second = resolver.resolve("  austin, tx ", &cancel).await.unwrap();

    assert_eq!(first, LatLng::new(30.2672, -97.7431));
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_geocode_over_quota_backs_off_then_gives_up() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/geocode/json"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "OVER_QUERY_LIMIT" })),
        )
        .expect(3)
        .mount(&server)
        .await;

    let cache = cache().await;
    let resolver = geocoder(&server, &cache);

    let started = Instant::now();
    let err = resolver
        .resolve("Austin, TX", &CancellationToken::new())
        .await
        .unwrap_err();

    // 10ms after the first attempt, 20ms after the second
    assert!(started.elapsed() >= Duration::from_millis(30));
    match err {
        SearchError::RateLimitedOrDenied {
            location,
            status,
            attempts,
        } => {
            assert_eq!(location, "Austin, TX");
            assert_eq!(status, "OVER_QUERY_LIMIT");
            assert_eq!(attempts, 3);
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_geocode_zero_results_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/geocode/json"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "ZERO_RESULTS", "results": [] })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let cache = cache().await;
    let err = geocoder(&server, &cache)
        .resolve("Nowhereville", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SearchError::LocationNotFound { ref location } if location == "Nowhereville"));
    let stats = cache.stats(Namespace::Search).await.unwrap();
    assert_eq!(stats.count, 0);
}

#[tokio::test]
async fn test_geocode_recovers_after_transport_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/geocode/json"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_geocode_ok(&server).await;

    let cache = cache().await;
    let coords = geocoder(&server, &cache)
        .resolve("Austin, TX", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(coords, LatLng::new(30.2672, -97.7431));
    assert_eq!(requests_to(&server, "/geocode/json").await, 2);
}

#[tokio::test]
async fn test_geocode_backoff_is_cancellable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/geocode/json"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "REQUEST_DENIED" })),
        )
        .mount(&server)
        .await;

    let cache = cache().await;
    let maps = MapsClient::new(&create_test_config(server.uri())).unwrap();
    let resolver = GeocodeResolver::with_policy(
        maps,
        cache,
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(60),
        },
        WEEK,
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = resolver.resolve("Austin, TX", &cancel).await.unwrap_err();
    assert!(matches!(err, SearchError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_pager_follows_continuation_and_drops_missing_details() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/place/nearbysearch/json"))
        .and(query_param("keyword", "plumber"))
        .and(query_param_is_missing("pagetoken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "OK",
            "results": [
                { "place_id": "a", "name": "A" },
                { "place_id": "missing1" },
                { "place_id": "b" }
            ],
            "next_page_token": "tok-2"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/place/nearbysearch/json"))
        .and(query_param("pagetoken", "tok-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "OK",
            "results": [{ "place_id": "b" }, { "place_id": "c" }]
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_details(&server).await;

    let cache = cache().await;
    let request = SearchRequest {
        center: LatLng::new(30.0, -97.0),
        radius_meters: 1609.34,
        keyword: "plumber".to_string(),
    };
    let places = pager(&server, &cache)
        .search(&request, 10, &CancellationToken::new())
        .await
        .unwrap();

    let ids: Vec<&str> = places.iter().map(|p| p.place_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(places[0].company_name, "Business a");
    assert_eq!(places[0].phone, "(512) 555-0100");
    // b appears on both pages but details are fetched once
    assert_eq!(requests_to(&server, "/place/details/json").await, 4);
}

#[tokio::test]
async fn test_pager_stops_at_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/place/nearbysearch/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "OK",
            "results": [{ "place_id": "a" }, { "place_id": "b" }, { "place_id": "c" }],
            "next_page_token": "more"
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_details(&server).await;

    let cache = cache().await;
    let request = SearchRequest {
        center: LatLng::new(30.0, -97.0),
        radius_meters: 500.0,
        keyword: "dentist".to_string(),
    };
    let places = pager(&server, &cache)
        .search(&request, 2, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(places.len(), 2);
    assert_eq!(requests_to(&server, "/place/details/json").await, 2);
}

#[tokio::test]
async fn test_pager_first_page_failure_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/place/nearbysearch/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "REQUEST_DENIED",
            "error_message": "The provided API key is invalid."
        })))
        .mount(&server)
        .await;

    let cache = cache().await;
    let request = SearchRequest {
        center: LatLng::new(30.0, -97.0),
        radius_meters: 500.0,
        keyword: "dentist".to_string(),
    };
    let err = pager(&server, &cache)
        .search(&request, 20, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SearchError::PlacesServiceError(ref msg) if msg.contains("REQUEST_DENIED")));
}

async fn later_page_failure_keeps_earlier_places(second_page: ResponseTemplate) {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/place/nearbysearch/json"))
        .and(query_param_is_missing("pagetoken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "OK",
            "results": [{ "place_id": "a" }, { "place_id": "b" }],
            "next_page_token": "tok-2"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/place/nearbysearch/json"))
        .and(query_param("pagetoken", "tok-2"))
        .respond_with(second_page)
        .expect(1)
        .mount(&server)
        .await;
    mount_details(&server).await;

    let cache = cache().await;
    let request = SearchRequest {
        center: LatLng::new(30.0, -97.0),
        radius_meters: 1609.34,
        keyword: "electrician".to_string(),
    };
    let places = pager(&server, &cache)
        .search(&request, 20, &CancellationToken::new())
        .await
        .unwrap();

    let ids: Vec<&str> = places.iter().map(|p| p.place_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn test_pager_later_page_status_ends_paging() {
    later_page_failure_keeps_earlier_places(
        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "OVER_QUERY_LIMIT" })),
    )
    .await;
}

#[tokio::test]
async fn test_pager_later_page_http_error_ends_paging() {
    later_page_failure_keeps_earlier_places(ResponseTemplate::new(500).set_body_string("backend unavailable"))
        .await;
}

/// Two pages; records when each nearby-search request arrived.
struct TimedPages {
    arrivals: Mutex<Vec<Instant>>,
}

impl Respond for TimedPages {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        self.arrivals.lock().unwrap().push(Instant::now());
        let body = match query_value(request, "pagetoken") {
            None => serde_json::json!({
                "status": "OK",
                "results": [{ "place_id": "a" }],
                "next_page_token": "tok-2"
            }),
            Some(_) => serde_json::json!({ "status": "OK", "results": [{ "place_id": "b" }] }),
        };
        ResponseTemplate::new(200).set_body_json(body)
    }
}

#[tokio::test]
async fn test_pager_waits_for_token_to_settle() {
    let server = MockServer::start().await;
    let pages = std::sync::Arc::new(TimedPages {
        arrivals: Mutex::new(Vec::new()),
    });
    let responder = pages.clone();
    Mock::given(method("GET"))
        .and(path("/place/nearbysearch/json"))
        .respond_with(move |request: &Request| responder.respond(request))
        .mount(&server)
        .await;
    mount_details(&server).await;

    let settle = Duration::from_millis(150);
    let maps = MapsClient::new(&create_test_config(server.uri())).unwrap();
    let pager = PlaceSearchPager::with_pacing(
        maps,
        cache().await,
        Pacing {
            page_settle: settle,
            ..Pacing::none()
        },
        MONTH,
    );
    let request = SearchRequest {
        center: LatLng::new(30.0, -97.0),
        radius_meters: 500.0,
        keyword: "florist".to_string(),
    };

    let places = pager
        .search(&request, 20, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(places.len(), 2);

    let arrivals = pages.arrivals.lock().unwrap().clone();
    assert_eq!(arrivals.len(), 2);
    assert!(arrivals[1] - arrivals[0] >= settle);
}

#[tokio::test]
async fn test_place_details_shared_between_searches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/place/nearbysearch/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "OK",
            "results": [{ "place_id": "a" }, { "place_id": "b" }]
        })))
        .mount(&server)
        .await;
    mount_details(&server).await;

    let cache = cache().await;
    let pager = pager(&server, &cache);
    let cancel = CancellationToken::new();
    for keyword in ["plumber", "emergency plumber"] {
        let request = SearchRequest {
            center: LatLng::new(30.0, -97.0),
            radius_meters: 500.0,
            keyword: keyword.to_string(),
        };
        assert_eq!(pager.search(&request, 20, &cancel).await.unwrap().len(), 2);
    }

    assert_eq!(requests_to(&server, "/place/nearbysearch/json").await, 2);
    assert_eq!(requests_to(&server, "/place/details/json").await, 2);
}

#[tokio::test]
async fn test_tiled_search_stops_at_max_and_reruns_from_cache() {
    let server = MockServer::start().await;
    mount_geocode_ok(&server).await;
    Mock::given(method("GET"))
        .and(path("/place/nearbysearch/json"))
        .respond_with(FreshPlaces::new(6))
        .mount(&server)
        .await;
    mount_details(&server).await;

    let cache = cache().await;
    let tiler = tiler(&server, &cache);
    let search = RegionSearch {
        keyword: "roofing".to_string(),
        location: "Austin, TX".to_string(),
        radius_miles: 10.0,
        max_results: 10,
        tile_count: 2,
    };
    let cancel = CancellationToken::new();

    let first = tiler.search_region(&search, &cancel).await.unwrap();
    assert_eq!(first.places.len(), 10);
    assert_eq!(first.tiles_total, 4);
    assert_eq!(first.tiles_visited, 2);
    assert_eq!(first.failed_tiles, 0);
    assert_eq!(requests_to(&server, "/place/nearbysearch/json").await, 2);

    let requests_before = server.received_requests().await.unwrap_or_default().len();
    let second = tiler.search_region(&search, &cancel).await.unwrap();
    let requests_after = server.received_requests().await.unwrap_or_default().len();

    assert_eq!(requests_before, requests_after);
    assert_eq!(second.places, first.places);
    assert_eq!(second.tiles_from_cache, 2);
}

#[tokio::test]
async fn test_failed_tile_is_counted_and_not_cached() {
    let server = MockServer::start().await;
    mount_geocode_ok(&server).await;
    Mock::given(method("GET"))
        .and(path("/place/nearbysearch/json"))
        .respond_with(FreshPlaces {
            fail_on: vec![0],
            ..FreshPlaces::new(3)
        })
        .mount(&server)
        .await;
    mount_details(&server).await;

    let cache = cache().await;
    let tiler = tiler(&server, &cache);
    let search = RegionSearch {
        keyword: "roofing".to_string(),
        location: "Austin, TX".to_string(),
        radius_miles: 10.0,
        max_results: 100,
        tile_count: 2,
    };
    let cancel = CancellationToken::new();

    let outcome = tiler.search_region(&search, &cancel).await.unwrap();
    assert_eq!(outcome.failed_tiles, 1);
    assert_eq!(outcome.tiles_visited, 4);
    assert_eq!(outcome.places.len(), 9);

    // Only the failed tile is searched again
    let rerun = tiler.search_region(&search, &cancel).await.unwrap();
    assert_eq!(rerun.failed_tiles, 0);
    assert_eq!(rerun.tiles_from_cache, 3);
    assert_eq!(rerun.places.len(), 12);
    assert_eq!(requests_to(&server, "/place/nearbysearch/json").await, 5);
}

#[tokio::test]
async fn test_geocode_failure_aborts_region_search() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/geocode/json"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "ZERO_RESULTS" })),
        )
        .mount(&server)
        .await;

    let cache = cache().await;
    let search = RegionSearch {
        keyword: "roofing".to_string(),
        location: "Atlantis".to_string(),
        radius_miles: 10.0,
        max_results: 10,
        tile_count: 2,
    };
    let err = tiler(&server, &cache)
        .search_region(&search, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, SearchError::LocationNotFound { .. }));
    assert_eq!(requests_to(&server, "/place/nearbysearch/json").await, 0);
}

#[tokio::test]
async fn test_cancelled_region_search_visits_no_tiles() {
    let server = MockServer::start().await;
    mount_geocode_ok(&server).await;

    let cache = cache().await;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let search = RegionSearch {
        keyword: "roofing".to_string(),
        location: "Austin, TX".to_string(),
        radius_miles: 10.0,
        max_results: 10,
        tile_count: 3,
    };

    let outcome = tiler(&server, &cache)
        .search_region(&search, &cancel)
        .await
        .unwrap();
    assert!(outcome.cancelled);
    assert_eq!(outcome.tiles_visited, 0);
    assert!(outcome.places.is_empty());
}

#[tokio::test]
async fn test_small_request_runs_one_search() {
    let server = MockServer::start().await;
    mount_geocode_ok(&server).await;
    Mock::given(method("GET"))
        .and(path("/place/nearbysearch/json"))
        .and(query_param("radius", "8046.70"))
        .respond_with(FreshPlaces::new(5))
        .expect(1)
        .mount(&server)
        .await;
    mount_details(&server).await;

    let cache = cache().await;
    let outcome = tiler(&server, &cache)
        .generate_leads("Roofing", "Austin, TX", 5.0, 20, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.tiles_total, 1);
    assert_eq!(outcome.places.len(), 5);
}
