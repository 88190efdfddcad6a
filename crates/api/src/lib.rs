//! Geopin collaborator seams.
//!
//! The widget talks to two external collaborators it does not implement: a
//! remote geocoding API ([`Geocoder`], async) and an imperative map library
//! ([`MapBackend`], synchronous). Map-originated events flow back as
//! [`MapEvent`]s fed in by the host. In-memory implementations for tests and
//! headless use live in [`mock`].

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use geopin_core::{GeoResult, LatLng, Position, SearchResult};
use serde::{Deserialize, Serialize};

pub mod mock;

pub use mock::{HeadlessMap, MockGeocoder};

pub const TILE_PROVIDER_URL: &str = "https://{s}.tile.openstreetmap.org/{z}/{x}/{y}.png";
pub const ATTRIBUTION: &str = "&copy; <a href=\"https://openstreetmap.org/copyright\">OpenStreetMap contributors</a>";
pub const MAX_ZOOM: u8 = 19;

/// Extra provider query parameters.
pub type SearchParams = BTreeMap<String, String>;

/// Provider object reference used by raw reverse lookups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OsmRef {
    pub osm_id: u64,
    /// `node`, `way` or `relation`.
    pub osm_type: String,
}

impl OsmRef {
    /// Pull the reference out of a result's raw provider payload.
    pub fn from_raw(raw: &serde_json::Value) -> Option<Self> {
        let osm_id = match raw.get("osm_id")? {
            serde_json::Value::Number(n) => n.as_u64()?,
            serde_json::Value::String(s) => s.parse().ok()?,
            _ => return None,
        };
        let osm_type = raw.get("osm_type")?.as_str()?.to_string();
        Some(Self { osm_id, osm_type })
    }
}

/// Remote geocoding API.
#[async_trait::async_trait]
pub trait Geocoder: Send + Sync {
    /// Free text to candidate places.
    async fn search(&self, query: &str, params: &SearchParams) -> GeoResult<Vec<SearchResult>>;

    /// Coordinates to the single best matching place.
    async fn reverse(&self, lat: f64, lng: f64, params: &SearchParams) -> GeoResult<SearchResult>;

    /// Provider object id to its place record.
    async fn reverse_raw(&self, osm: &OsmRef, params: &SearchParams) -> GeoResult<SearchResult>;
}

/// Handle assigned by the map library to an installed marker.
pub type MarkerId = u64;

/// Pixel offset of the icon relative to the marker coordinate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct IconAnchor {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IconSpec {
    pub class_name: String,
    pub html: String,
    pub anchor: IconAnchor,
}

/// Everything the map library needs to create one marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MarkerSpec {
    pub position: LatLng,
    pub icon: IconSpec,
    pub draggable: bool,
    pub popup: Option<String>,
    pub open_popup: bool,
    pub options: serde_json::Map<String, serde_json::Value>,
}

/// CSS-style color filter applied to the tile layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum TileFilter {
    HueRotate(f64),
    Invert(f64),
}

impl fmt::Display for TileFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TileFilter::HueRotate(deg) => write!(f, "hue:{}deg", deg),
            TileFilter::Invert(pct) => write!(f, "invert:{}%", pct),
        }
    }
}

pub const DARK_FILTER: [TileFilter; 2] = [TileFilter::HueRotate(180.0), TileFilter::Invert(100.0)];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TileLayerSpec {
    pub url: String,
    pub attribution: String,
    pub max_zoom: u8,
    pub filter: Vec<TileFilter>,
}

impl Default for TileLayerSpec {
    fn default() -> Self {
        Self {
            url: TILE_PROVIDER_URL.to_string(),
            attribution: ATTRIBUTION.to_string(),
            max_zoom: MAX_ZOOM,
            filter: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct LocateOptions {
    pub enable_high_accuracy: bool,
}

/// Payload of a successful device-location lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LocationEvent {
    pub latlng: LatLng,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Platform error code for a denied location permission.
pub const LOCATION_PERMISSION_DENIED: u16 = 1;

/// Events originated by the map library.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MapEvent {
    ZoomEnd,
    LocationFound(LocationEvent),
    LocationError { code: u16, message: String },
    MarkerDragEnd { marker: MarkerId, latlng: LatLng },
}

/// Imperative map library. All calls are synchronous and cheap.
pub trait MapBackend: Send {
    fn add_tile_layer(&mut self, layer: &TileLayerSpec);
    fn set_tile_filter(&mut self, filter: &[TileFilter]);
    fn set_view(&mut self, position: Position, zoom: f64, animate: bool);
    fn set_zoom(&mut self, zoom: f64, animate: bool);
    /// Authoritative zoom as currently shown.
    fn zoom(&self) -> f64;
    fn center(&self) -> LatLng;
    fn add_marker(&mut self, spec: &MarkerSpec) -> MarkerId;
    fn remove_marker(&mut self, id: MarkerId);
    fn add_scale_control(&mut self);
    /// Ask for the device location; the answer arrives as a `MapEvent`.
    fn locate(&mut self, opts: LocateOptions);
    fn invalidate_size(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dark_filter_renders_like_css() {
        let v: Vec<String> = DARK_FILTER.iter().map(|f| f.to_string()).collect();
        assert_eq!(v, vec!["hue:180deg", "invert:100%"]);
    }

    #[test]
    fn osm_ref_from_raw_payload() {
        let raw = serde_json::json!({"osm_id": 123, "osm_type": "way"});
        assert_eq!(OsmRef::from_raw(&raw), Some(OsmRef { osm_id: 123, osm_type: "way".into() }));
        let raw = serde_json::json!({"osm_id": "77", "osm_type": "node"});
        assert_eq!(OsmRef::from_raw(&raw).map(|r| r.osm_id), Some(77));
        assert!(OsmRef::from_raw(&serde_json::json!({"osm_type": "node"})).is_none());
    }
}
