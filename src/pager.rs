use crate::cache_store::{CacheStore, Namespace};
use crate::config::Config;
use crate::errors::SearchError;
use crate::models::{Place, PlaceDetails, PlaceStub, SearchRequest};
use crate::pacing::{pause, Pacing};
use crate::services::MapsClient;
use std::collections::HashSet;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Runs one paginated nearby search and resolves each hit's details.
pub struct PlaceSearchPager {
    maps: MapsClient,
    cache: CacheStore,
    pacing: Pacing,
    details_ttl: Duration,
}

impl PlaceSearchPager {
    pub fn new(maps: MapsClient, cache: CacheStore, config: &Config) -> Self {
        Self::with_pacing(maps, cache, config.pacing(), config.details_ttl())
    }

    pub fn with_pacing(
        maps: MapsClient,
        cache: CacheStore,
        pacing: Pacing,
        details_ttl: Duration,
    ) -> Self {
        Self {
            maps,
            cache,
            pacing,
            details_ttl,
        }
    }

    /// Collects up to `max_results` places for `request`.
    ///
    /// Follows continuation tokens until the budget is met or the service stops
    /// returning them. A failure on the first page is an error; a failure on a
    /// later page ends pagination and keeps what was gathered. Hits without
    /// resolvable details are dropped.
    pub async fn search(
        &self,
        request: &SearchRequest,
        max_results: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Place>, SearchError> {
        let mut places: Vec<Place> = Vec::new();
        let mut seen = HashSet::new();
        let mut page_token: Option<String> = None;
        let mut page = 0;

        while places.len() < max_results {
            if cancel.is_cancelled() {
                return Err(SearchError::Cancelled);
            }
            if page_token.is_some() {
                // A fresh token is rejected until it has settled
                pause(self.pacing.page_settle, cancel).await?;
            }
            page += 1;

            let response = match self
                .maps
                .nearby_search(request, page_token.as_deref())
                .await
            {
                Ok(response) => response,
                Err(e) if page == 1 => return Err(SearchError::PlacesServiceError(e.to_string())),
                Err(e) => {
                    tracing::warn!(
                        "Page {} of '{}' failed, keeping {} places: {}",
                        page,
                        request.keyword,
                        places.len(),
                        e
                    );
                    break;
                }
            };

            match response.status.as_str() {
                "OK" => {}
                "ZERO_RESULTS" => break,
                status => {
                    let detail = response.error_message.unwrap_or_default();
                    if page == 1 {
                        return Err(SearchError::PlacesServiceError(format!(
                            "nearby search returned {} {}",
                            status, detail
                        )));
                    }
                    tracing::warn!(
                        "Page {} of '{}' returned {} {}, keeping {} places",
                        page,
                        request.keyword,
                        status,
                        detail,
                        places.len()
                    );
                    break;
                }
            }

            for stub in &response.results {
                if places.len() >= max_results {
                    break;
                }
                if !seen.insert(stub.place_id.clone()) {
                    continue;
                }
                if let Some(details) = self.details(stub, cancel).await? {
                    places.push(details.into_place(stub));
                }
            }

            page_token = response.next_page_token.filter(|t| !t.is_empty());
            if page_token.is_none() {
                break;
            }
        }

        tracing::debug!(
            "Nearby search '{}' at {} gathered {} places over {} pages",
            request.keyword,
            request.center.to_param(),
            places.len(),
            page
        );
        Ok(places)
    }

    /// Details for one hit, from the cache when fresh, otherwise fetched and cached.
    async fn details(
        &self,
        stub: &PlaceStub,
        cancel: &CancellationToken,
    ) -> Result<Option<PlaceDetails>, SearchError> {
        match self
            .cache
            .get::<PlaceDetails>(Namespace::PlaceDetails, &stub.place_id, Some(self.details_ttl))
            .await
        {
            Ok(Some(details)) => return Ok(Some(details)),
            Ok(None) => {}
            Err(e) => tracing::warn!("Details cache read failed for {}: {}", stub.place_id, e),
        }

        let details = match self.maps.place_details(&stub.place_id).await {
            Ok(response) if response.status == "OK" => match response.result {
                Some(details) => {
                    if let Err(e) = self
                        .cache
                        .put(Namespace::PlaceDetails, &stub.place_id, None, &details)
                        .await
                    {
                        tracing::warn!("Failed to cache details for {}: {}", stub.place_id, e);
                    }
                    Some(details)
                }
                None => None,
            },
            Ok(response) => {
                tracing::debug!(
                    "No details for {} (status {}), dropping",
                    stub.place_id,
                    response.status
                );
                None
            }
            Err(e) => {
                tracing::warn!("Details fetch failed for {}, dropping: {}", stub.place_id, e);
                None
            }
        };

        pause(self.pacing.detail_fetch, cancel).await?;
        Ok(details)
    }
}
