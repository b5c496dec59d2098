use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Checksummed envelope for every payload written to the cache store.
///
/// A row is only trusted when the envelope parses, the SHA-256 of `data`
/// matches `checksum`, and `data` deserializes into the type the caller asked
/// for. Anything else is reported as [`Corruption`] and the row is treated as
/// a cache miss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedCacheEntry {
    /// The cached value as a JSON string.
    pub data: String,
    /// SHA-256 checksum of `data` (hex encoded).
    pub checksum: String,
}

/// Why a stored payload could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Corruption {
    /// Not a JSON envelope at all.
    Envelope(String),
    /// Envelope parsed but the checksum does not match the data.
    ChecksumMismatch,
    /// Data is intact but does not decode into the requested type.
    Payload(String),
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Corruption::Envelope(e) => write!(f, "unreadable envelope: {}", e),
            Corruption::ChecksumMismatch => write!(f, "checksum mismatch"),
            Corruption::Payload(e) => write!(f, "payload does not decode: {}", e),
        }
    }
}

impl ValidatedCacheEntry {
    pub fn new(data: String) -> Self {
        let checksum = compute_checksum(&data);
        Self { data, checksum }
    }

    pub fn is_valid(&self) -> bool {
        compute_checksum(&self.data) == self.checksum
    }

    /// Serializes `value` and wraps it in an envelope ready for storage.
    pub fn seal<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
        let data = serde_json::to_string(value)?;
        serde_json::to_string(&Self::new(data))
    }

    /// Parses and verifies an envelope, returning the raw JSON data.
    fn open_raw(stored: &str) -> Result<String, Corruption> {
        let entry: ValidatedCacheEntry =
            serde_json::from_str(stored).map_err(|e| Corruption::Envelope(e.to_string()))?;
        if !entry.is_valid() {
            tracing::warn!(
                "Cache validation failed: checksum mismatch. Expected: {}, Data length: {}",
                entry.checksum,
                entry.data.len()
            );
            return Err(Corruption::ChecksumMismatch);
        }
        Ok(entry.data)
    }

    /// Parses, verifies and decodes an envelope.
    pub fn open<T: DeserializeOwned>(stored: &str) -> Result<T, Corruption> {
        let data = Self::open_raw(stored)?;
        serde_json::from_str(&data).map_err(|e| Corruption::Payload(e.to_string()))
    }
}

fn compute_checksum(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Coordinates {
        lat: f64,
        lng: f64,
    }

    #[test]
    fn sealed_value_opens_to_same_value() {
        let value = Coordinates {
            lat: 30.2672,
            lng: -97.7431,
        };
        let stored = ValidatedCacheEntry::seal(&value).unwrap();
        let opened: Coordinates = ValidatedCacheEntry::open(&stored).unwrap();
        assert_eq!(opened, value);
    }

    #[test]
    fn tampered_data_is_rejected() {
        let stored = ValidatedCacheEntry::seal(&vec!["a", "b"]).unwrap();
        let tampered = stored.replace("\\\"a\\\"", "\\\"z\\\"");
        assert_ne!(stored, tampered);
        let result = ValidatedCacheEntry::open::<Vec<String>>(&tampered);
        assert_eq!(result, Err(Corruption::ChecksumMismatch));
    }

    #[test]
    fn garbage_is_an_envelope_error() {
        let result = ValidatedCacheEntry::open::<Vec<String>>("{not json");
        assert!(matches!(result, Err(Corruption::Envelope(_))));
    }

    #[test]
    fn wrong_shape_is_a_payload_error() {
        let stored = ValidatedCacheEntry::seal(&"just a string").unwrap();
        let result = ValidatedCacheEntry::open::<Coordinates>(&stored);
        assert!(matches!(result, Err(Corruption::Payload(_))));
    }

    #[test]
    fn checksum_is_stable() {
        let first = ValidatedCacheEntry::new("test data".to_string());
        let second = ValidatedCacheEntry::new("test data".to_string());
        assert_eq!(first.checksum, second.checksum);
        assert!(first.is_valid());
    }
}
