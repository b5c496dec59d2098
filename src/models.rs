use serde::{Deserialize, Serialize};

/// Marker the places layer writes for a missing phone or website.
pub const NOT_AVAILABLE: &str = "N/A";

// ============ Search Models ============

/// A coordinate pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// `lat,lng` with fixed precision, as sent to the places endpoint and used in cache keys.
    pub fn to_param(&self) -> String {
        format!("{:.7},{:.7}", self.lat, self.lng)
    }
}

/// One nearby-search request: a circle plus a keyword.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub center: LatLng,
    pub radius_meters: f64,
    pub keyword: String,
}

/// A business location as emitted by the search pipeline.
///
/// `place_id` is the external service's identifier and the dedup key across
/// tiles and pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Place {
    pub place_id: String,
    pub company_name: String,
    pub full_address: String,
    pub phone: String,
    pub website: String,
}

/// Parameters of a tiled region search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionSearch {
    pub keyword: String,
    pub location: String,
    pub radius_miles: f64,
    pub max_results: usize,
    pub tile_count: usize,
}

/// Result of a tiled region search.
///
/// `failed_tiles` distinguishes "nothing found" from "some tiles errored".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionSearchOutcome {
    pub places: Vec<Place>,
    pub tiles_total: usize,
    pub tiles_visited: usize,
    pub tiles_from_cache: usize,
    pub failed_tiles: usize,
    pub cancelled: bool,
}

// ============ Maps API Models ============

#[derive(Debug, Clone, Deserialize)]
pub struct GeocodeResponse {
    pub status: String,
    #[serde(default)]
    pub results: Vec<GeocodeResult>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeocodeResult {
    pub geometry: Geometry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Geometry {
    pub location: LatLng,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NearbySearchResponse {
    pub status: String,
    #[serde(default)]
    pub results: Vec<PlaceStub>,
    #[serde(default)]
    pub next_page_token: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// Minimal hit returned by nearby search.
#[derive(Debug, Clone, Deserialize)]
pub struct PlaceStub {
    pub place_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaceDetailsResponse {
    pub status: String,
    #[serde(default)]
    pub result: Option<PlaceDetails>,
}

/// Place-intrinsic details, cached by place identifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceDetails {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub formatted_address: Option<String>,
    #[serde(default)]
    pub formatted_phone_number: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
}

impl PlaceDetails {
    /// Builds the emitted record, falling back to the stub name.
    pub fn into_place(self, stub: &PlaceStub) -> Place {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        Place {
            place_id: stub.place_id.clone(),
            company_name: non_empty(self.name)
                .or_else(|| stub.name.clone())
                .unwrap_or_default(),
            full_address: self.formatted_address.unwrap_or_default(),
            phone: non_empty(self.formatted_phone_number)
                .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
            website: non_empty(self.website).unwrap_or_else(|| NOT_AVAILABLE.to_string()),
        }
    }
}

// ============ Lead Models ============

/// Inbound lead row, as produced by a search or an uploaded sheet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadRecord {
    #[serde(default)]
    pub company_name: String,
    #[serde(default)]
    pub full_address: String,
    #[serde(default)]
    pub town: String,
    #[serde(default, alias = "Phone")]
    pub phone: String,
    #[serde(default, alias = "Website")]
    pub website: String,
    #[serde(default, alias = "Business Type")]
    pub business_type: String,
}

impl LeadRecord {
    pub fn from_place(place: &Place, business_type: &str) -> Self {
        Self {
            company_name: place.company_name.clone(),
            full_address: place.full_address.clone(),
            town: String::new(),
            phone: place.phone.clone(),
            website: place.website.clone(),
            business_type: business_type.to_string(),
        }
    }

    /// True when the website is blank or the explicit not-applicable marker.
    pub fn has_usable_website(&self) -> bool {
        let website = self.website.trim();
        !website.is_empty() && !website.eq_ignore_ascii_case(NOT_AVAILABLE)
    }
}

/// What the enrichment collaborators found for one lead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub owner_name: String,
    pub owner_title: String,
    pub confidence: String,
    pub confidence_reasoning: String,
    pub discovered_emails: Vec<String>,
    pub potential_emails: Vec<String>,
    pub key_facts: Vec<String>,
}

/// Flat output record consumed by export and reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedLead {
    pub company_name: String,
    pub full_address: String,
    pub town: String,
    pub phone: String,
    pub website: String,
    pub business_type: String,
    pub processed: bool,
    pub owner_name: String,
    pub owner_title: String,
    pub confidence: String,
    pub confidence_reasoning: String,
    pub discovered_emails: Vec<String>,
    pub potential_emails: Vec<String>,
    pub key_facts: Vec<String>,
    pub error: String,
}

impl ProcessedLead {
    /// Unprocessed record carrying only the inbound fields, plus an optional error.
    pub fn unprocessed(lead: &LeadRecord, error: impl Into<String>) -> Self {
        Self {
            company_name: lead.company_name.trim().to_string(),
            full_address: lead.full_address.trim().to_string(),
            town: lead.town.trim().to_string(),
            phone: lead.phone.trim().to_string(),
            website: lead.website.trim().to_string(),
            business_type: lead.business_type.trim().to_string(),
            processed: false,
            owner_name: String::new(),
            owner_title: String::new(),
            confidence: "none".to_string(),
            confidence_reasoning: String::new(),
            discovered_emails: Vec::new(),
            potential_emails: Vec::new(),
            key_facts: Vec::new(),
            error: error.into(),
        }
    }

    pub fn enriched(lead: &LeadRecord, enrichment: Enrichment) -> Self {
        let confidence = if enrichment.confidence.trim().is_empty() {
            "low".to_string()
        } else {
            enrichment.confidence.trim().to_string()
        };
        Self {
            processed: true,
            owner_name: enrichment.owner_name.trim().to_string(),
            owner_title: enrichment.owner_title.trim().to_string(),
            confidence,
            confidence_reasoning: enrichment.confidence_reasoning.trim().to_string(),
            discovered_emails: enrichment.discovered_emails,
            potential_emails: enrichment.potential_emails,
            key_facts: enrichment.key_facts,
            ..Self::unprocessed(lead, "")
        }
    }
}

/// Result of a batch run: per-lead results plus counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub results: Vec<ProcessedLead>,
    pub processed: usize,
    pub cache_hits: usize,
    pub skipped_duplicates: usize,
    pub failures: usize,
    pub cancelled: bool,
}
