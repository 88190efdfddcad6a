#![forbid(unsafe_code)]

use geopin_api::IconAnchor;
use geopin_core::{Coordinate, LocationDescriptor};

pub const BASE_ICON_CLASS: &str = "div-icon";
pub const ADDED_MARKER_CLASS: &str = "added-marker-icon";
pub const DEFAULT_ZOOM: f64 = 12.0;

/// Pin glyph cloned into every marker.
pub const PLACE_ICON_HTML: &str = "<svg viewBox=\"0 0 24 24\" class=\"marker-icon\"><path d=\"M12 2C8.13 2 5 5.13 5 9c0 5.25 7 13 7 13s7-7.75 7-13c0-3.87-3.13-7-7-7zm0 9.5a2.5 2.5 0 010-5 2.5 2.5 0 010 5z\"/></svg>";

// Dirty bits, one per input or derived value.
pub(crate) const ALT: u32 = 1 << 0;
pub(crate) const POS: u32 = 1 << 1;
pub(crate) const ZOOM: u32 = 1 << 2;
pub(crate) const DARK: u32 = 1 << 3;
pub(crate) const DRAGGABLE: u32 = 1 << 4;
pub(crate) const LOCATIONS: u32 = 1 << 5;
pub(crate) const EFFECTIVE: u32 = 1 << 6;
pub(crate) const SCALE: u32 = 1 << 7;
pub(crate) const MAP: u32 = 1 << 8;
pub(crate) const ICON: u32 = 1 << 9;
pub(crate) const LABEL: u32 = 1 << 10;

/// Marker icon source; measured to place the pin tip on the coordinate.
#[derive(Debug, Clone, PartialEq)]
pub struct IconTemplate {
    pub html: String,
    pub width: f64,
    pub height: f64,
}

impl IconTemplate {
    pub fn new(html: impl Into<String>, width: f64, height: f64) -> Self {
        Self { html: html.into(), width, height }
    }

    pub fn place(size: f64) -> Self {
        Self::new(PLACE_ICON_HTML, size, size)
    }

    /// Bottom-center anchor, or `None` while the icon has no layout size.
    pub fn measure(&self) -> Option<IconAnchor> {
        let measurable = self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0;
        measurable.then(|| IconAnchor { x: self.width / 2.0, y: self.height })
    }
}

/// Declarative inputs as last set by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct MapInputs {
    pub alt: Option<f64>,
    pub lat: Coordinate,
    pub lng: Coordinate,
    pub zoom: f64,
    pub dark_mode: bool,
    /// Applies to the implicit marker and as default for listed ones.
    pub draggable: bool,
    pub locations: Option<Vec<LocationDescriptor>>,
    pub scale: bool,
    /// Animate view and zoom changes.
    pub smooth: bool,
}

impl Default for MapInputs {
    fn default() -> Self {
        Self {
            alt: None,
            lat: Coordinate::default(),
            lng: Coordinate::default(),
            zoom: DEFAULT_ZOOM,
            dark_mode: false,
            draggable: false,
            locations: None,
            scale: false,
            smooth: false,
        }
    }
}

/// Options for a marker dropped at the map center. Every field set here
/// overrides the center position or the added-marker class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewMarker {
    pub lat: Option<Coordinate>,
    pub lng: Option<Coordinate>,
    pub text: Option<String>,
    pub class_name: Option<String>,
    pub draggable: Option<bool>,
    pub options: serde_json::Map<String, serde_json::Value>,
}
