//! Persistent, namespaced TTL cache.
//!
//! Three tables share one pool and one contract: rows are keyed by a
//! deterministic key, replaced wholesale on write, and considered present only
//! while younger than the TTL the caller passes at read time. There is no
//! in-memory layer; every read is a storage round trip.

use crate::cache_validator::ValidatedCacheEntry;
use crate::models::{LatLng, Place, PlaceDetails, ProcessedLead};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Geocoded locations and per-tile search result lists.
    Search,
    /// Place details keyed by place identifier.
    PlaceDetails,
    /// Enriched leads keyed by lead identity.
    ProcessedLead,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [
        Namespace::Search,
        Namespace::PlaceDetails,
        Namespace::ProcessedLead,
    ];

    fn table(self) -> &'static str {
        match self {
            Namespace::Search => "search_cache",
            Namespace::PlaceDetails => "place_details_cache",
            Namespace::ProcessedLead => "processed_leads",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Search => "search",
            Namespace::PlaceDetails => "place_details",
            Namespace::ProcessedLead => "processed_lead",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "search" => Ok(Namespace::Search),
            "place_details" | "details" => Ok(Namespace::PlaceDetails),
            "processed_lead" | "processed_leads" | "leads" => Ok(Namespace::ProcessedLead),
            other => Err(format!("unknown cache namespace: {}", other)),
        }
    }
}

/// Which rows a clear operation deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearFilter {
    All,
    /// Rows written more than this long ago.
    OlderThan(Duration),
    /// Rows whose tag (raw parameter blob or website) contains the substring.
    TagContains(String),
    Key(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NamespaceStats {
    pub namespace: Namespace,
    pub count: i64,
    pub distinct_tags: i64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub row_counts: BTreeMap<Namespace, i64>,
    pub corrupt_keys: BTreeMap<Namespace, Vec<String>>,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.corrupt_keys.values().all(|keys| keys.is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheOverview {
    pub namespaces: Vec<NamespaceStats>,
    pub estimated_api_calls_saved: i64,
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn to_datetime(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::<Utc>::from_timestamp_millis)
}

/// Handle to the cache tables. Cheap to clone.
#[derive(Clone)]
pub struct CacheStore {
    pool: SqlitePool,
}

impl CacheStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Reads and decodes an entry younger than `ttl` (any age when `ttl` is `None`).
    ///
    /// Corrupt entries are logged and reported as absent.
    pub async fn get<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        key: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<T>, sqlx::Error> {
        let sql = format!(
            "SELECT payload FROM {} WHERE cache_key = ? AND written_at > ?",
            namespace.table()
        );
        let row: Option<(String,)> = sqlx::query_as(&sql)
            .bind(key)
            .bind(Self::cutoff(ttl))
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.and_then(|(payload,)| Self::decode(namespace, key, &payload)))
    }

    /// Newest usable entry whose tag equals `tag`.
    pub async fn find_by_tag<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        tag: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<T>, sqlx::Error> {
        let sql = format!(
            "SELECT cache_key, payload FROM {} WHERE tag = ? AND written_at > ? ORDER BY written_at DESC",
            namespace.table()
        );
        let rows: Vec<(String, String)> = sqlx::query_as(&sql)
            .bind(tag)
            .bind(Self::cutoff(ttl))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .find_map(|(key, payload)| Self::decode(namespace, &key, &payload)))
    }

    /// Upserts `value`, refreshing `written_at`.
    pub async fn put<T: Serialize>(
        &self,
        namespace: Namespace,
        key: &str,
        tag: Option<&str>,
        value: &T,
    ) -> Result<(), sqlx::Error> {
        self.put_at(namespace, key, tag, value, Utc::now()).await
    }

    /// Upserts with an explicit timestamp. Used for backfills and to age entries in tests.
    pub async fn put_at<T: Serialize>(
        &self,
        namespace: Namespace,
        key: &str,
        tag: Option<&str>,
        value: &T,
        written_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        let payload =
            ValidatedCacheEntry::seal(value).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        let sql = format!(
            "INSERT INTO {} (cache_key, tag, payload, written_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(cache_key) DO UPDATE SET
                tag = excluded.tag,
                payload = excluded.payload,
                written_at = excluded.written_at",
            namespace.table()
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(tag)
            .bind(payload)
            .bind(written_at.timestamp_millis())
            .execute(&self.pool)
            .await?;

        tracing::debug!("Cached {} entry {}", namespace, key);
        Ok(())
    }

    /// Deletes matching rows and returns how many went.
    pub async fn clear(&self, namespace: Namespace, filter: &ClearFilter) -> Result<u64, sqlx::Error> {
        let table = namespace.table();
        let result = match filter {
            ClearFilter::All => {
                sqlx::query(&format!("DELETE FROM {}", table))
                    .execute(&self.pool)
                    .await?
            }
            ClearFilter::OlderThan(age) => {
                let cutoff = Utc::now().timestamp_millis().saturating_sub(millis(*age));
                sqlx::query(&format!("DELETE FROM {} WHERE written_at < ?", table))
                    .bind(cutoff)
                    .execute(&self.pool)
                    .await?
            }
            ClearFilter::TagContains(needle) => {
                sqlx::query(&format!("DELETE FROM {} WHERE instr(tag, ?) > 0", table))
                    .bind(needle)
                    .execute(&self.pool)
                    .await?
            }
            ClearFilter::Key(key) => {
                sqlx::query(&format!("DELETE FROM {} WHERE cache_key = ?", table))
                    .bind(key)
                    .execute(&self.pool)
                    .await?
            }
        };

        let deleted = result.rows_affected();
        tracing::info!("Cleared {} {} cache entries ({:?})", deleted, namespace, filter);
        Ok(deleted)
    }

    /// Clears every namespace with the same filter.
    pub async fn clear_all(&self, filter: &ClearFilter) -> Result<u64, sqlx::Error> {
        let mut deleted = 0;
        for namespace in Namespace::ALL {
            deleted += self.clear(namespace, filter).await?;
        }
        Ok(deleted)
    }

    pub async fn stats(&self, namespace: Namespace) -> Result<NamespaceStats, sqlx::Error> {
        let sql = format!(
            "SELECT COUNT(*), COUNT(DISTINCT tag), MIN(written_at), MAX(written_at) FROM {}",
            namespace.table()
        );
        let (count, distinct_tags, oldest, newest): (i64, i64, Option<i64>, Option<i64>) =
            sqlx::query_as(&sql).fetch_one(&self.pool).await?;

        Ok(NamespaceStats {
            namespace,
            count,
            distinct_tags,
            oldest: to_datetime(oldest),
            newest: to_datetime(newest),
        })
    }

    /// Stats for every namespace. Each cached search or details row is one call not repeated.
    pub async fn overview(&self) -> Result<CacheOverview, sqlx::Error> {
        let mut namespaces = Vec::with_capacity(Namespace::ALL.len());
        for namespace in Namespace::ALL {
            namespaces.push(self.stats(namespace).await?);
        }
        let estimated_api_calls_saved = namespaces
            .iter()
            .filter(|s| s.namespace != Namespace::ProcessedLead)
            .map(|s| s.count)
            .sum();

        Ok(CacheOverview {
            namespaces,
            estimated_api_calls_saved,
        })
    }

    /// Counts rows and lists keys whose payload does not decode into the
    /// namespace's record type, i.e. rows `get` would treat as absent.
    pub async fn integrity_check(&self) -> Result<IntegrityReport, sqlx::Error> {
        let mut report = IntegrityReport::default();
        for namespace in Namespace::ALL {
            let sql = format!("SELECT cache_key, payload FROM {}", namespace.table());
            let rows: Vec<(String, String)> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

            let corrupt: Vec<String> = rows
                .iter()
                .filter(|(_, payload)| !Self::payload_decodes(namespace, payload))
                .map(|(key, _)| key.clone())
                .collect();

            if !corrupt.is_empty() {
                tracing::warn!("{} corrupt entries in {} cache", corrupt.len(), namespace);
            }
            report.row_counts.insert(namespace, rows.len() as i64);
            report.corrupt_keys.insert(namespace, corrupt);
        }
        Ok(report)
    }

    fn payload_decodes(namespace: Namespace, payload: &str) -> bool {
        match namespace {
            Namespace::Search => {
                ValidatedCacheEntry::open::<LatLng>(payload).is_ok()
                    || ValidatedCacheEntry::open::<Vec<Place>>(payload).is_ok()
            }
            Namespace::PlaceDetails => ValidatedCacheEntry::open::<PlaceDetails>(payload).is_ok(),
            Namespace::ProcessedLead => ValidatedCacheEntry::open::<ProcessedLead>(payload).is_ok(),
        }
    }

    fn cutoff(ttl: Option<Duration>) -> i64 {
        match ttl {
            Some(ttl) => Utc::now().timestamp_millis().saturating_sub(millis(ttl)),
            None => i64::MIN,
        }
    }

    fn decode<T: DeserializeOwned>(namespace: Namespace, key: &str, payload: &str) -> Option<T> {
        match ValidatedCacheEntry::open(payload) {
            Ok(value) => Some(value),
            Err(corruption) => {
                tracing::warn!(
                    "Ignoring corrupt {} cache entry {}: {}",
                    namespace,
                    key,
                    corruption
                );
                None
            }
        }
    }
}
