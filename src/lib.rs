//! Leadscout library.
//!
//! Finds businesses through a maps service and enriches them as sales leads,
//! with every external result cached in SQLite so repeat runs cost little.
//!
//! # Modules
//!
//! - `cache_store`: Namespaced TTL cache over SQLite.
//! - `cache_validator`: Checksummed payload envelope.
//! - `config`: Configuration management.
//! - `db`: Database connection and schema.
//! - `enrichment`: Website scraping, email extraction and owner analysis.
//! - `errors`: Error handling types.
//! - `geocode`: Location to coordinates, with retry.
//! - `handlers`: HTTP request handlers.
//! - `keys`: Cache key derivation.
//! - `models`: Core data models.
//! - `pacing`: Cancellable delays and backoff.
//! - `pager`: Paginated nearby search with cached details.
//! - `processor`: Lead deduplication and write-through enrichment.
//! - `services`: Maps service client.
//! - `tiler`: Grid search over large regions.

pub mod cache_store;
pub mod cache_validator;
pub mod config;
pub mod db;
pub mod enrichment;
pub mod errors;
pub mod geocode;
pub mod handlers;
pub mod keys;
pub mod models;
pub mod pacing;
pub mod pager;
pub mod processor;
pub mod services;
pub mod tiler;
