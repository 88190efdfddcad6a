//! Geopin core types: positions, location descriptors, search results and
//! the error taxonomy shared by every crate in the workspace.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod coord;

pub use coord::{normalize, normalize_value, Component, Coordinate, Dms};

/// Maximum length (in chars) of a derived cache key.
pub const QUERY_KEY_MAX_LEN: usize = 48;

/// A plain decimal-degree pair, as produced and consumed by the map library.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Both components finite and inside the geographic ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Normalized position with optional altitude in meters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Position {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
}

impl Position {
    pub fn latlng(&self) -> LatLng {
        LatLng::new(self.lat, self.lng)
    }
}

/// Declarative description of one marker. A list of these is the source of
/// truth for which markers exist on the map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocationDescriptor {
    pub lat: Coordinate,
    pub lng: Coordinate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draggable: Option<bool>,
    /// Map-library marker options, passed through untouched.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, serde_json::Value>,
}

impl LocationDescriptor {
    pub fn at(lat: f64, lng: f64) -> Self {
        Self {
            lat: Coordinate::Decimal(lat),
            lng: Coordinate::Decimal(lng),
            text: None,
            class_name: None,
            draggable: None,
            options: serde_json::Map::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_class(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    /// Resolve both coordinates into decimal degrees.
    pub fn latlng(&self) -> GeoResult<LatLng> {
        Ok(LatLng::new(normalize(&self.lat)?, normalize(&self.lng)?))
    }
}

/// Bounding box as reported by the provider: south, north, west, east.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct Bounds {
    pub s: f64,
    pub n: f64,
    pub w: f64,
    pub e: f64,
}

/// One geocoding candidate. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    pub lat: f64,
    pub lng: f64,
    pub label: String,
    pub bounds: Bounds,
    /// Provider payload, kept opaque.
    #[serde(default)]
    pub raw: serde_json::Value,
}

impl SearchResult {
    pub fn latlng(&self) -> LatLng {
        LatLng::new(self.lat, self.lng)
    }

    pub fn query_key(&self) -> String {
        query_key(&self.label)
    }
}

/// Normalized cache key: drop backslashes, slashes, whitespace and commas,
/// keep a bounded prefix, lowercase.
pub fn query_key(text: &str) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| !matches!(c, '\\' | '/' | ',') && !c.is_whitespace())
        .take(QUERY_KEY_MAX_LEN)
        .collect();
    stripped.to_lowercase()
}

/// Cache key for an exact coordinate pair.
pub fn coord_key(lat: f64, lng: f64) -> String {
    format!("{lat},{lng}")
}

/// Tri-state search status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchStatus {
    #[default]
    Idle,
    Cached,
    Searching,
}

/// State of the single active search session of a controller.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SearchSession {
    pub status: SearchStatus,
    pub results: Vec<SearchResult>,
    pub selected: Option<SearchResult>,
}

/// Errors shared across the workspace.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum GeoError {
    #[error("invalid coordinate format: {0}")]
    InvalidCoordinateFormat(String),
    #[error("map not ready")]
    MapNotReady,
    #[error("geolocation denied: {0}")]
    GeolocationDenied(String),
    #[error("geolocation failed: {0}")]
    GeolocationFailed(String),
    #[error("search debounced")]
    SearchDebounced,
    #[error("search already in flight")]
    SearchInFlight,
    #[error("search failed: {0}")]
    SearchFailed(String),
}

impl GeoError {
    /// Expected cancellations that never reach the user.
    pub fn is_silent(&self) -> bool {
        matches!(self, GeoError::SearchDebounced | GeoError::SearchInFlight)
    }
}

pub type GeoResult<T> = Result<T, GeoError>;

pub mod prelude {
    pub use super::{
        coord_key, normalize, query_key, Bounds, Coordinate, Dms, GeoError, GeoResult, LatLng,
        LocationDescriptor, Position, SearchResult, SearchSession, SearchStatus,
    };
}
