//! Cache key derivation.
//!
//! Keys are SHA-256 digests of a sorted-key JSON rendering of each namespace's
//! canonical input, so equal inputs produce equal keys regardless of field or
//! call order. Credentials never take part in a key.

use crate::models::SearchRequest;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Canonical parameters: a sorted map rendered as compact JSON.
pub type CanonicalParams = BTreeMap<&'static str, String>;

/// Trim and lowercase.
pub fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Sorted-key JSON of the parameters. Stored alongside search entries so
/// operators can clear them by substring.
pub fn params_blob(params: &CanonicalParams) -> String {
    serde_json::to_string(params).unwrap_or_default()
}

pub fn params_key(params: &CanonicalParams) -> String {
    sha256_hex(&params_blob(params))
}

pub fn geocode_params(location: &str) -> CanonicalParams {
    BTreeMap::from([("geocode", normalize(location))])
}

pub fn geocode_key(location: &str) -> String {
    params_key(&geocode_params(location))
}

impl SearchRequest {
    pub fn canonical_params(&self) -> CanonicalParams {
        BTreeMap::from([
            ("keyword", normalize(&self.keyword)),
            ("location", self.center.to_param()),
            ("radius", format!("{:.2}", self.radius_meters)),
        ])
    }

    pub fn cache_key(&self) -> String {
        params_key(&self.canonical_params())
    }
}

/// Stable identity of a lead: `hash(normalize(company) + "|" + normalize(website))`.
pub fn lead_identity(company_name: &str, website: &str) -> String {
    sha256_hex(&format!("{}|{}", normalize(company_name), normalize(website)))
}
