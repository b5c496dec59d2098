use crate::cache_store::{CacheStore, ClearFilter, Namespace};
use crate::config::Config;
use crate::errors::SearchError;
use crate::keys::{geocode_key, geocode_params, normalize, params_blob};
use crate::models::{GeocodeResponse, LatLng};
use crate::pacing::{pause, RetryPolicy};
use crate::services::MapsClient;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What one geocoding attempt produced.
enum Attempt {
    Resolved(LatLng),
    /// Over quota, denied, or a transport failure: try again after backoff.
    Retry(SearchError),
    Fail(SearchError),
}

/// Resolves free-text locations to coordinates, cache first.
pub struct GeocodeResolver {
    maps: MapsClient,
    cache: CacheStore,
    policy: RetryPolicy,
    ttl: Duration,
}

impl GeocodeResolver {
    pub fn new(maps: MapsClient, cache: CacheStore, config: &Config) -> Self {
        Self::with_policy(maps, cache, config.retry_policy(), config.search_ttl())
    }

    pub fn with_policy(
        maps: MapsClient,
        cache: CacheStore,
        policy: RetryPolicy,
        ttl: Duration,
    ) -> Self {
        Self {
            maps,
            cache,
            policy,
            ttl,
        }
    }

    /// Returns the coordinates for `location`.
    ///
    /// Lookups are case and whitespace insensitive. Zero results fail at once;
    /// over-quota, denied and transport failures are retried with exponential
    /// backoff up to the policy's attempt budget.
    pub async fn resolve(
        &self,
        location: &str,
        cancel: &CancellationToken,
    ) -> Result<LatLng, SearchError> {
        let normalized = normalize(location);
        if normalized.is_empty() {
            return Err(SearchError::LocationNotFound {
                location: location.to_string(),
            });
        }

        let key = geocode_key(location);
        match self
            .cache
            .get::<LatLng>(Namespace::Search, &key, Some(self.ttl))
            .await
        {
            Ok(Some(coords)) => {
                tracing::info!("Using cached geocode for {}", location.trim());
                return Ok(coords);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Geocode cache read failed for {}: {}", location.trim(), e),
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.attempt(location).await {
                Attempt::Resolved(coords) => {
                    let tag = params_blob(&geocode_params(location));
                    if let Err(e) = self
                        .cache
                        .put(Namespace::Search, &key, Some(&tag), &coords)
                        .await
                    {
                        tracing::warn!("Failed to cache geocode for {}: {}", location.trim(), e);
                    }
                    tracing::info!(
                        "Geocoded {} to {} (attempt {})",
                        location.trim(),
                        coords.to_param(),
                        attempt
                    );
                    return Ok(coords);
                }
                Attempt::Fail(err) => {
                    tracing::error!("{}", err);
                    return Err(err);
                }
                Attempt::Retry(err) => err,
            };

            if attempt >= self.policy.max_attempts {
                tracing::error!("Giving up after {} attempts: {}", attempt, err);
                return Err(match err {
                    SearchError::RateLimitedOrDenied {
                        location, status, ..
                    } => SearchError::RateLimitedOrDenied {
                        location,
                        status,
                        attempts: attempt,
                    },
                    other => other,
                });
            }

            let delay = self.policy.delay_after(attempt);
            tracing::warn!(
                "Geocode attempt {}/{} failed ({}), retrying in {:?}",
                attempt,
                self.policy.max_attempts,
                err,
                delay
            );
            pause(delay, cancel).await?;
        }
    }

    /// Drops the cached coordinates for one location, e.g. after a typo.
    pub async fn invalidate(&self, location: &str) -> Result<u64, sqlx::Error> {
        self.cache
            .clear(Namespace::Search, &ClearFilter::Key(geocode_key(location)))
            .await
    }

    async fn attempt(&self, location: &str) -> Attempt {
        let response = match self.maps.geocode(location.trim()).await {
            Ok(response) => response,
            Err(e) => {
                return Attempt::Retry(SearchError::GeocodingError {
                    location: location.to_string(),
                    cause: e.to_string(),
                })
            }
        };
        classify(location, response)
    }
}

fn classify(location: &str, response: GeocodeResponse) -> Attempt {
    match response.status.as_str() {
        "OK" => match response.results.first() {
            Some(result) => Attempt::Resolved(result.geometry.location),
            None => Attempt::Fail(SearchError::LocationNotFound {
                location: location.to_string(),
            }),
        },
        "ZERO_RESULTS" => Attempt::Fail(SearchError::LocationNotFound {
            location: location.to_string(),
        }),
        "OVER_QUERY_LIMIT" | "REQUEST_DENIED" => Attempt::Retry(SearchError::RateLimitedOrDenied {
            location: location.to_string(),
            status: response.status,
            attempts: 0,
        }),
        other => Attempt::Fail(SearchError::GeocodingError {
            location: location.to_string(),
            cause: match response.error_message {
                Some(message) => format!("unexpected status {}: {}", other, message),
                None => format!("unexpected status {}", other),
            },
        }),
    }
}
