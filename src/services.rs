use crate::config::Config;
use crate::errors::AppError;
use crate::models::*;
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;

const DETAIL_FIELDS: &str = "name,formatted_address,formatted_phone_number,website";

/// Client for the geocoding, nearby-search and place-details endpoints.
///
/// Returns the decoded body whatever its `status`; interpreting the status is
/// up to the caller. Only transport failures, non-2xx responses and
/// undecodable bodies are errors here.
#[derive(Clone)]
pub struct MapsClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl MapsClient {
    pub fn new(config: &Config) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| AppError::ExternalApiError(format!("Failed to create maps client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.maps_base_url.trim_end_matches('/').to_string(),
            api_key: config.google_api_key.clone(),
        })
    }

    pub async fn geocode(&self, address: &str) -> Result<GeocodeResponse, AppError> {
        tracing::debug!("Geocode request: address={}&key=[REDACTED]", address);
        self.get_json("geocode/json", &[("address", address)]).await
    }

    pub async fn nearby_search(
        &self,
        request: &SearchRequest,
        page_token: Option<&str>,
    ) -> Result<NearbySearchResponse, AppError> {
        let location = request.center.to_param();
        let radius = format!("{:.2}", request.radius_meters);
        let mut params = vec![
            ("location", location.as_str()),
            ("radius", radius.as_str()),
            ("keyword", request.keyword.as_str()),
        ];
        if let Some(token) = page_token {
            params.push(("pagetoken", token));
        }

        tracing::debug!(
            "Nearby search: location={}&radius={}&keyword={}&key=[REDACTED]{}",
            location,
            radius,
            request.keyword,
            if page_token.is_some() { " (next page)" } else { "" }
        );
        self.get_json("place/nearbysearch/json", &params).await
    }

    pub async fn place_details(&self, place_id: &str) -> Result<PlaceDetailsResponse, AppError> {
        tracing::debug!("Place details: place_id={}&key=[REDACTED]", place_id);
        self.get_json(
            "place/details/json",
            &[("place_id", place_id), ("fields", DETAIL_FIELDS)],
        )
        .await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<T, AppError> {
        // Build URL with proper parameter encoding; the key goes last and is never logged
        let url = Url::parse_with_params(
            &format!("{}/{}", self.base_url, endpoint),
            params
                .iter()
                .copied()
                .chain(std::iter::once(("key", self.api_key.as_str()))),
        )
        .map_err(|e| AppError::ExternalApiError(format!("Failed to build URL: {}", e)))?;

        let response = self.client.get(url).send().await.map_err(|e| {
            AppError::ExternalApiError(format!("{} request failed: {}", endpoint, e.without_url()))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!("{} returned error {}: {}", endpoint, status, error_text);
            return Err(AppError::ExternalApiError(format!(
                "{} returned status {}: {}",
                endpoint, status, error_text
            )));
        }

        response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse {} response: {}", endpoint, e))
        })
    }
}
