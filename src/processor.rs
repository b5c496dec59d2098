//! Lead deduplication and write-through enrichment cache.
//!
//! A lead is identified by its normalized company name and website. Leads
//! already enriched in an earlier run come straight from the cache; everything
//! else goes through the [`LeadEnricher`] and the result is cached whether or
//! not the caller asked to read from the cache.

use crate::cache_store::{CacheStore, Namespace};
use crate::config::Config;
use crate::enrichment::LeadEnricher;
use crate::keys::{lead_identity, normalize};
use crate::models::{BatchOutcome, LeadRecord, ProcessedLead};
use crate::pacing::{pause, Pacing};
use std::collections::HashSet;
use tokio_util::sync::CancellationToken;

/// How a single lead was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    NoWebsite,
    Cached,
    Enriched,
    Failed,
}

pub struct LeadProcessor<E> {
    cache: CacheStore,
    enricher: E,
    pacing: Pacing,
    website_fallback: bool,
}

impl<E: LeadEnricher> LeadProcessor<E> {
    pub fn new(cache: CacheStore, enricher: E, config: &Config) -> Self {
        Self::with_options(
            cache,
            enricher,
            config.pacing(),
            config.lead_cache_website_fallback,
        )
    }

    /// `website_fallback` also accepts cache entries that match on website
    /// alone, as written by runs that keyed leads by website.
    pub fn with_options(
        cache: CacheStore,
        enricher: E,
        pacing: Pacing,
        website_fallback: bool,
    ) -> Self {
        Self {
            cache,
            enricher,
            pacing,
            website_fallback,
        }
    }

    /// Enriches one lead, reading the cache first when `use_cache` is set.
    ///
    /// Never fails: enrichment errors are returned as an unprocessed record
    /// with `error` filled in.
    pub async fn process(&self, lead: &LeadRecord, use_cache: bool) -> ProcessedLead {
        self.resolve(lead, use_cache).await.0
    }

    async fn resolve(&self, lead: &LeadRecord, use_cache: bool) -> (ProcessedLead, Resolution) {
        if !lead.has_usable_website() {
            tracing::debug!("Skipping {}: no website", lead.company_name.trim());
            return (ProcessedLead::unprocessed(lead, ""), Resolution::NoWebsite);
        }

        let identity = lead_identity(&lead.company_name, &lead.website);
        if use_cache {
            if let Some(cached) = self.cached(&identity, &lead.website).await {
                tracing::info!("Using cached result for {}", lead.company_name.trim());
                return (cached, Resolution::Cached);
            }
        }

        tracing::info!("Processing {} ({})", lead.company_name.trim(), lead.website.trim());
        match self.enricher.enrich(lead).await {
            Ok(enrichment) => {
                let result = ProcessedLead::enriched(lead, enrichment);
                let tag = normalize(&lead.website);
                if let Err(e) = self
                    .cache
                    .put(Namespace::ProcessedLead, &identity, Some(&tag), &result)
                    .await
                {
                    tracing::warn!("Failed to cache lead {}: {}", lead.company_name.trim(), e);
                }
                (result, Resolution::Enriched)
            }
            Err(e) => {
                tracing::error!("Error processing {}: {:#}", lead.company_name.trim(), e);
                (
                    ProcessedLead::unprocessed(lead, format!("{:#}", e)),
                    Resolution::Failed,
                )
            }
        }
    }

    async fn cached(&self, identity: &str, website: &str) -> Option<ProcessedLead> {
        match self
            .cache
            .get::<ProcessedLead>(Namespace::ProcessedLead, identity, None)
            .await
        {
            Ok(Some(hit)) => return Some(hit),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Lead cache read failed: {}", e);
                return None;
            }
        }

        if !self.website_fallback {
            return None;
        }
        self.cache
            .find_by_tag::<ProcessedLead>(Namespace::ProcessedLead, &normalize(website), None)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("Lead cache fallback read failed: {}", e);
                None
            })
    }

    /// Processes a batch in order.
    ///
    /// Rows repeating an earlier row's website are dropped before processing.
    /// Cancellation stops the batch between leads and keeps the finished results.
    pub async fn process_leads(
        &self,
        leads: &[LeadRecord],
        use_cache: bool,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let mut websites = HashSet::new();
        let mut first = true;

        for lead in leads {
            if lead.has_usable_website() && !websites.insert(normalize(&lead.website)) {
                tracing::debug!("Duplicate website {}, skipping", lead.website.trim());
                outcome.skipped_duplicates += 1;
                continue;
            }

            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            if !first && pause(self.pacing.between_leads, cancel).await.is_err() {
                outcome.cancelled = true;
                break;
            }
            first = false;

            let (result, resolution) = self.resolve(lead, use_cache).await;
            match resolution {
                Resolution::Cached => outcome.cache_hits += 1,
                Resolution::Failed => outcome.failures += 1,
                Resolution::NoWebsite | Resolution::Enriched => {}
            }
            if result.processed {
                outcome.processed += 1;
            }
            outcome.results.push(result);
        }

        tracing::info!(
            "Batch done: {} results, {} processed, {} from cache, {} duplicates skipped, {} failed",
            outcome.results.len(),
            outcome.processed,
            outcome.cache_hits,
            outcome.skipped_duplicates,
            outcome.failures
        );
        outcome
    }
}
