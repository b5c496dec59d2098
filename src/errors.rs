use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Failures of the search pipeline (geocoding, paging, tiling).
#[derive(Debug)]
pub enum SearchError {
    /// The geocoder returned no match. Never retried.
    LocationNotFound { location: String },
    /// The geocoder kept answering over-quota or denied until the retry budget ran out.
    RateLimitedOrDenied {
        location: String,
        status: String,
        attempts: u32,
    },
    /// Transport failure or unexpected geocoder status.
    GeocodingError { location: String, cause: String },
    /// Transport failure or failure status from the places endpoints.
    PlacesServiceError(String),
    /// Arguments rejected before any network call.
    InvalidRequest(String),
    /// The caller's cancellation token fired during a wait.
    Cancelled,
    /// The cache database failed.
    Storage(sqlx::Error),
}

impl SearchError {
    /// The location string attached to a geocoding failure, if any.
    pub fn location(&self) -> Option<&str> {
        match self {
            SearchError::LocationNotFound { location }
            | SearchError::RateLimitedOrDenied { location, .. }
            | SearchError::GeocodingError { location, .. } => Some(location),
            _ => None,
        }
    }
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchError::LocationNotFound { location } => {
                write!(f, "Location not found: {}", location)
            }
            SearchError::RateLimitedOrDenied {
                location,
                status,
                attempts,
            } => write!(
                f,
                "Geocoding of '{}' rate limited or denied ({}) after {} attempts",
                location, status, attempts
            ),
            SearchError::GeocodingError { location, cause } => {
                write!(f, "Could not geocode '{}': {}", location, cause)
            }
            SearchError::PlacesServiceError(msg) => write!(f, "Places service error: {}", msg),
            SearchError::InvalidRequest(msg) => write!(f, "Invalid search request: {}", msg),
            SearchError::Cancelled => write!(f, "Search cancelled"),
            SearchError::Storage(e) => write!(f, "Cache storage error: {}", e),
        }
    }
}

impl std::error::Error for SearchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SearchError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for SearchError {
    fn from(err: sqlx::Error) -> Self {
        SearchError::Storage(err)
    }
}

impl From<crate::pacing::Cancelled> for SearchError {
    fn from(_: crate::pacing::Cancelled) -> Self {
        SearchError::Cancelled
    }
}

/// Application-specific error types.
#[derive(Debug)]
pub enum AppError {
    /// Database-related errors.
    DatabaseError(sqlx::Error),
    /// Resource not found error.
    NotFound(String),
    /// Bad request error (invalid input).
    BadRequest(String),
    /// The same work is already in flight.
    Conflict(String),
    /// Error interacting with an external API.
    ExternalApiError(String),
    /// Internal server error.
    InternalError(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::DatabaseError(e) => write!(f, "Database error: {}", e),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ExternalApiError(msg) => write!(f, "External API error: {}", msg),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    fn status_and_message(&self) -> (StatusCode, String) {
        match self {
            AppError::DatabaseError(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::ExternalApiError(msg) => {
                tracing::error!("External API error: {}", msg);
                (StatusCode::BAD_GATEWAY, msg.clone())
            }
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::WithContext { source, context } => {
                tracing::error!("Error with context: {} -> {}", context, source);
                source.status_and_message()
            }
        }
    }
}

impl IntoResponse for AppError {
    /// Maps each error variant to an HTTP status code and JSON body.
    fn into_response(self) -> Response {
        let (status, error_message) = self.status_and_message();
        let body = Json(json!({
            "error": error_message,
        }));
        (status, body).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::DatabaseError(err)
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ExternalApiError(err.to_string())
    }
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::LocationNotFound { .. } => AppError::NotFound(err.to_string()),
            SearchError::InvalidRequest(msg) => AppError::BadRequest(msg),
            SearchError::Storage(e) => AppError::DatabaseError(e),
            SearchError::Cancelled => AppError::InternalError(err.to_string()),
            SearchError::RateLimitedOrDenied { .. }
            | SearchError::GeocodingError { .. }
            | SearchError::PlacesServiceError(_) => AppError::ExternalApiError(err.to_string()),
        }
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;
}

impl<T, E: Into<AppError>> ResultExt<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e.into()),
            context: context.into(),
        })
    }
}
