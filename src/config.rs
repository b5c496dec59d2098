use crate::pacing::{Pacing, RetryPolicy};
use std::time::Duration;

/// Runtime configuration, passed explicitly into every component constructor.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub google_api_key: String,
    pub maps_base_url: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub search_ttl_days: i64,
    pub details_ttl_days: i64,
    pub geocode_max_attempts: u32,
    pub geocode_backoff_ms: u64,
    pub page_settle_delay_ms: u64,
    pub detail_pacing_ms: u64,
    pub lead_pacing_ms: u64,
    pub lead_cache_website_fallback: bool,
    pub http_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite:lead_cache.db".to_string(),
            port: 3000,
            google_api_key: String::new(),
            maps_base_url: "https://maps.googleapis.com/maps/api".to_string(),
            openai_api_key: None,
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_model: "gpt-4o-mini".to_string(),
            search_ttl_days: 7,
            details_ttl_days: 30,
            geocode_max_attempts: 3,
            geocode_backoff_ms: 1000,
            page_settle_delay_ms: 2000,
            detail_pacing_ms: 200,
            lead_pacing_ms: 500,
            lead_cache_website_fallback: true,
            http_timeout_secs: 30,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: {}", name, raw)),
        _ => Ok(default),
    }
}

fn http_url(name: &str, default: &str) -> anyhow::Result<String> {
    let url = std::env::var(name)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string());
    if !url.starts_with("http://") && !url.starts_with("https://") {
        anyhow::bail!("{} must start with http:// or https://", name);
    }
    Ok(url.trim_end_matches('/').to_string())
}

/// Negative counts become zero; huge ones saturate.
fn days(count: i64) -> Duration {
    Duration::from_secs(u64::try_from(count).unwrap_or(0).saturating_mul(86_400))
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Config::default();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| defaults.database_url.clone())
                .trim()
                .to_string(),
            port: std::env::var("PORT")
                .unwrap_or_else(|_| defaults.port.to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            google_api_key: std::env::var("GOOGLE_API_KEY")
                .or_else(|_| std::env::var("GOOGLE_MAPS_API_KEY"))
                .map_err(|_| {
                    anyhow::anyhow!("GOOGLE_API_KEY or GOOGLE_MAPS_API_KEY environment variable required")
                })
                .and_then(|key| {
                    if key.trim().is_empty() {
                        anyhow::bail!("GOOGLE_API_KEY cannot be empty");
                    }
                    Ok(key.trim().to_string())
                })?,
            maps_base_url: http_url("MAPS_BASE_URL", &defaults.maps_base_url)?,
            openai_api_key: std::env::var("OPENAI_API_KEY")
                .ok()
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            openai_base_url: http_url("OPENAI_BASE_URL", &defaults.openai_base_url)?,
            openai_model: std::env::var("OPENAI_MODEL")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.openai_model),
            search_ttl_days: parse_var("SEARCH_CACHE_TTL_DAYS", defaults.search_ttl_days)?,
            details_ttl_days: parse_var("DETAILS_CACHE_TTL_DAYS", defaults.details_ttl_days)?,
            geocode_max_attempts: parse_var("GEOCODE_MAX_ATTEMPTS", defaults.geocode_max_attempts)?,
            geocode_backoff_ms: parse_var("GEOCODE_BACKOFF_MS", defaults.geocode_backoff_ms)?,
            page_settle_delay_ms: parse_var("PAGE_SETTLE_DELAY_MS", defaults.page_settle_delay_ms)?,
            detail_pacing_ms: parse_var("DETAIL_PACING_MS", defaults.detail_pacing_ms)?,
            lead_pacing_ms: parse_var("LEAD_PACING_MS", defaults.lead_pacing_ms)?,
            lead_cache_website_fallback: parse_var(
                "LEAD_CACHE_WEBSITE_FALLBACK",
                defaults.lead_cache_website_fallback,
            )?,
            http_timeout_secs: parse_var("HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
        };

        config.validate()?;

        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Database URL: {}", config.database_url);
        tracing::debug!("Maps Base URL: {}", config.maps_base_url);
        if config.openai_api_key.is_some() {
            tracing::info!("LLM owner analysis enabled ({})", config.openai_model);
        } else {
            tracing::info!("OPENAI_API_KEY not set, owner analysis disabled");
        }
        let retry = config.retry_policy();
        tracing::debug!(
            "Geocode retries: {} attempts, up to {:?} of backoff",
            retry.max_attempts,
            retry.total_backoff()
        );
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.database_url.starts_with("sqlite:") {
            anyhow::bail!("DATABASE_URL must start with sqlite:");
        }
        if self.geocode_max_attempts == 0 {
            anyhow::bail!("GEOCODE_MAX_ATTEMPTS must be at least 1");
        }
        if self.search_ttl_days <= 0 || self.details_ttl_days <= 0 {
            anyhow::bail!("cache TTLs must be positive");
        }
        Ok(())
    }

    pub fn search_ttl(&self) -> Duration {
        days(self.search_ttl_days)
    }

    pub fn details_ttl(&self) -> Duration {
        days(self.details_ttl_days)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.geocode_max_attempts,
            base_delay: Duration::from_millis(self.geocode_backoff_ms),
        }
    }

    pub fn pacing(&self) -> Pacing {
        Pacing {
            page_settle: Duration::from_millis(self.page_settle_delay_ms),
            detail_fetch: Duration::from_millis(self.detail_pacing_ms),
            between_leads: Duration::from_millis(self.lead_pacing_ms),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
