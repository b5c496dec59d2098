//! Tiled region search.
//!
//! A single nearby search caps its result count no matter how dense the area
//! is, so a large radius is split into an n x n grid of smaller searches whose
//! results are merged in row-major order, first `place_id` wins. Tile results
//! are cached per canonical request, making repeat runs over the same area
//! nearly free.

use crate::cache_store::{CacheStore, Namespace};
use crate::errors::SearchError;
use crate::geocode::GeocodeResolver;
use crate::keys::params_blob;
use crate::models::{LatLng, Place, RegionSearch, RegionSearchOutcome, SearchRequest};
use crate::pager::PlaceSearchPager;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Approximation used for both latitude and longitude; not geodesically exact.
pub const MILES_PER_DEGREE: f64 = 69.0;
pub const METERS_PER_MILE: f64 = 1609.34;
/// Floor for the per-tile result budget.
pub const MIN_TILE_BUDGET: usize = 20;
/// Largest request served by a single untiled search.
pub const SINGLE_SEARCH_LIMIT: usize = 60;
/// Largest accepted grid side.
pub const MAX_TILE_COUNT: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub row: usize,
    pub col: usize,
    pub center: LatLng,
    pub radius_meters: f64,
}

/// Row-major `tile_count x tile_count` grid around `center`.
///
/// Tile `(i, j)` is centred at `center - span/2 + (i, j) * span / tile_count`
/// where `span = radius_miles / 69` degrees, and searches a radius of
/// `radius_miles / tile_count` miles.
pub fn tile_grid(center: LatLng, radius_miles: f64, tile_count: usize) -> Vec<Tile> {
    let Some(cells) = tile_count.checked_mul(tile_count).filter(|&n| n > 0) else {
        return Vec::new();
    };
    let span = radius_miles / MILES_PER_DEGREE;
    let step = span / tile_count as f64;
    let radius_meters = radius_miles / tile_count as f64 * METERS_PER_MILE;

    let mut tiles = Vec::with_capacity(cells);
    for row in 0..tile_count {
        for col in 0..tile_count {
            tiles.push(Tile {
                row,
                col,
                center: LatLng::new(
                    center.lat - span / 2.0 + row as f64 * step,
                    center.lng - span / 2.0 + col as f64 * step,
                ),
                radius_meters,
            });
        }
    }
    tiles
}

/// `max(20, ceil(max_results / tile_count^2))`.
pub fn tile_budget(max_results: usize, tile_count: usize) -> usize {
    let tiles = tile_count.checked_mul(tile_count).unwrap_or(usize::MAX).max(1);
    max_results.div_ceil(tiles).max(MIN_TILE_BUDGET)
}

/// Grid size picked by [`RegionTiler::generate_leads`] for larger requests.
pub fn auto_tile_count(max_results: usize) -> usize {
    match max_results {
        n if n > 250 => 4,
        n if n > 150 => 3,
        _ => 2,
    }
}

fn validate(keyword: &str, radius_miles: f64, max_results: usize) -> Result<(), SearchError> {
    if keyword.trim().is_empty() {
        return Err(SearchError::InvalidRequest("keyword is required".to_string()));
    }
    if !radius_miles.is_finite() || radius_miles <= 0.0 {
        return Err(SearchError::InvalidRequest(
            "radius_miles must be a positive number".to_string(),
        ));
    }
    if max_results == 0 {
        return Err(SearchError::InvalidRequest(
            "max_results must be at least 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_tile_count(tile_count: usize) -> Result<(), SearchError> {
    if tile_count == 0 || tile_count > MAX_TILE_COUNT {
        return Err(SearchError::InvalidRequest(format!(
            "tile_count must be between 1 and {}",
            MAX_TILE_COUNT
        )));
    }
    Ok(())
}

/// Appends places not seen before, stopping at `max_results`. Returns true once full.
fn merge(
    accumulated: &mut Vec<Place>,
    seen: &mut HashSet<String>,
    places: Vec<Place>,
    max_results: usize,
) -> bool {
    for place in places {
        if accumulated.len() >= max_results {
            break;
        }
        if seen.insert(place.place_id.clone()) {
            accumulated.push(place);
        }
    }
    accumulated.len() >= max_results
}

pub struct RegionTiler {
    geocoder: GeocodeResolver,
    pager: PlaceSearchPager,
    cache: CacheStore,
    search_ttl: Duration,
}

impl RegionTiler {
    pub fn new(
        geocoder: GeocodeResolver,
        pager: PlaceSearchPager,
        cache: CacheStore,
        search_ttl: Duration,
    ) -> Self {
        Self {
            geocoder,
            pager,
            cache,
            search_ttl,
        }
    }

    pub fn geocoder(&self) -> &GeocodeResolver {
        &self.geocoder
    }

    /// Searches a `tile_count x tile_count` grid and merges the results.
    ///
    /// Geocoding failures abort the whole search. Per-tile failures are counted
    /// in `failed_tiles` and the remaining tiles are still searched. Stops as
    /// soon as `max_results` unique places are collected.
    pub async fn search_region(
        &self,
        search: &RegionSearch,
        cancel: &CancellationToken,
    ) -> Result<RegionSearchOutcome, SearchError> {
        validate(&search.keyword, search.radius_miles, search.max_results)?;
        validate_tile_count(search.tile_count)?;

        let center = self.geocoder.resolve(&search.location, cancel).await?;
        let tiles = tile_grid(center, search.radius_miles, search.tile_count);
        let budget = tile_budget(search.max_results, search.tile_count);

        let mut outcome = RegionSearchOutcome {
            tiles_total: tiles.len(),
            ..RegionSearchOutcome::default()
        };
        let mut seen = HashSet::new();

        for (index, tile) in tiles.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            tracing::info!(
                "Searching region {}/{}: {}",
                index + 1,
                outcome.tiles_total,
                search.keyword.trim()
            );

            let request = SearchRequest {
                center: tile.center,
                radius_meters: tile.radius_meters,
                keyword: search.keyword.trim().to_string(),
            };
            outcome.tiles_visited += 1;

            match self.search_tile(&request, budget, cancel).await {
                Ok((places, from_cache)) => {
                    if from_cache {
                        outcome.tiles_from_cache += 1;
                    }
                    if merge(&mut outcome.places, &mut seen, places, search.max_results) {
                        tracing::info!("Found maximum number of results: {}", search.max_results);
                        break;
                    }
                }
                Err(SearchError::Cancelled) => {
                    outcome.cancelled = true;
                    break;
                }
                Err(e) => {
                    outcome.failed_tiles += 1;
                    tracing::warn!(
                        "Region {}/{} ({}, {}) failed, continuing: {}",
                        index + 1,
                        outcome.tiles_total,
                        tile.row,
                        tile.col,
                        e
                    );
                }
            }
        }

        tracing::info!(
            "Found {} unique businesses ({} of {} regions visited, {} cached, {} failed)",
            outcome.places.len(),
            outcome.tiles_visited,
            outcome.tiles_total,
            outcome.tiles_from_cache,
            outcome.failed_tiles
        );
        Ok(outcome)
    }

    /// Picks a strategy from the requested size: one search around the centre
    /// for small requests, otherwise a tiled search sized by [`auto_tile_count`].
    pub async fn generate_leads(
        &self,
        keyword: &str,
        location: &str,
        radius_miles: f64,
        max_results: usize,
        cancel: &CancellationToken,
    ) -> Result<RegionSearchOutcome, SearchError> {
        if max_results > SINGLE_SEARCH_LIMIT {
            let search = RegionSearch {
                keyword: keyword.to_string(),
                location: location.to_string(),
                radius_miles,
                max_results,
                tile_count: auto_tile_count(max_results),
            };
            return self.search_region(&search, cancel).await;
        }

        validate(keyword, radius_miles, max_results)?;
        let center = self.geocoder.resolve(location, cancel).await?;
        let request = SearchRequest {
            center,
            radius_meters: radius_miles * METERS_PER_MILE,
            keyword: keyword.trim().to_string(),
        };

        let mut outcome = RegionSearchOutcome {
            tiles_total: 1,
            tiles_visited: 1,
            ..RegionSearchOutcome::default()
        };
        match self.search_tile(&request, max_results, cancel).await {
            Ok((places, from_cache)) => {
                outcome.tiles_from_cache = usize::from(from_cache);
                merge(&mut outcome.places, &mut HashSet::new(), places, max_results);
            }
            Err(SearchError::Cancelled) => outcome.cancelled = true,
            Err(e) => {
                outcome.failed_tiles = 1;
                tracing::warn!("Search for '{}' near {} failed: {}", keyword, location, e);
            }
        }
        Ok(outcome)
    }

    /// Cached result list for one request, or a fresh paged search that is then cached.
    async fn search_tile(
        &self,
        request: &SearchRequest,
        budget: usize,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Place>, bool), SearchError> {
        let key = request.cache_key();
        match self
            .cache
            .get::<Vec<Place>>(Namespace::Search, &key, Some(self.search_ttl))
            .await
        {
            Ok(Some(places)) => {
                tracing::info!("Using cached results for {}", request.center.to_param());
                return Ok((places, true));
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Search cache read failed for {}: {}", key, e),
        }

        let places = self.pager.search(request, budget, cancel).await?;

        let tag = params_blob(&request.canonical_params());
        if let Err(e) = self
            .cache
            .put(Namespace::Search, &key, Some(&tag), &places)
            .await
        {
            tracing::warn!("Failed to cache search results for {}: {}", key, e);
        }
        Ok((places, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn place(id: &str) -> Place {
        Place {
            place_id: id.to_string(),
            company_name: id.to_uppercase(),
            full_address: String::new(),
            phone: String::new(),
            website: String::new(),
        }
    }

    #[test]
    fn grid_is_row_major_with_shrunken_radius() {
        let tiles = tile_grid(LatLng::new(40.0, -100.0), 69.0, 2);
        assert_eq!(tiles.len(), 4);
        let order: Vec<(usize, usize)> = tiles.iter().map(|t| (t.row, t.col)).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);

        // span is 1 degree, step is half a degree
        assert!((tiles[0].center.lat - 39.5).abs() < 1e-9);
        assert!((tiles[0].center.lng + 100.5).abs() < 1e-9);
        assert!((tiles[3].center.lat - 40.0).abs() < 1e-9);
        assert!((tiles[3].center.lng + 100.0).abs() < 1e-9);
        assert!((tiles[0].radius_meters - 34.5 * METERS_PER_MILE).abs() < 1e-6);
    }

    #[test]
    fn budget_has_a_floor() {
        assert_eq!(tile_budget(10, 2), 20);
        assert_eq!(tile_budget(300, 2), 75);
        assert_eq!(tile_budget(301, 2), 76);
        assert_eq!(tile_budget(100, 1), 100);
        assert_eq!(tile_budget(100, usize::MAX), MIN_TILE_BUDGET);
    }

    #[test]
    fn oversized_grids_are_rejected() {
        assert!(validate_tile_count(0).is_err());
        assert!(validate_tile_count(1).is_ok());
        assert!(validate_tile_count(MAX_TILE_COUNT).is_ok());
        assert!(matches!(
            validate_tile_count(MAX_TILE_COUNT + 1),
            Err(SearchError::InvalidRequest(_))
        ));
        assert!(tile_grid(LatLng::new(0.0, 0.0), 5.0, usize::MAX).is_empty());
    }

    #[test]
    fn auto_tile_count_steps() {
        assert_eq!(auto_tile_count(61), 2);
        assert_eq!(auto_tile_count(150), 2);
        assert_eq!(auto_tile_count(151), 3);
        assert_eq!(auto_tile_count(251), 4);
    }

    #[test]
    fn merge_skips_seen_and_stops_at_budget() {
        let mut acc = Vec::new();
        let mut seen = HashSet::new();
        assert!(!merge(&mut acc, &mut seen, vec![place("a"), place("b")], 3));
        assert!(merge(
            &mut acc,
            &mut seen,
            vec![place("b"), place("c"), place("d")],
            3
        ));
        let ids: Vec<&str> = acc.iter().map(|p| p.place_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn rejects_bad_arguments() {
        assert!(validate(" ", 5.0, 10).is_err());
        assert!(validate("plumber", 0.0, 10).is_err());
        assert!(validate("plumber", f64::NAN, 10).is_err());
        assert!(validate("plumber", 5.0, 0).is_err());
        assert!(validate("plumber", 5.0, 10).is_ok());
    }
}
