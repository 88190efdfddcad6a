//! View state synchronization between the declarative inputs and the map.
//!
//! Push rules run from [`MapState::flush`] and only for inputs that changed
//! since the previous flush. Pull handlers run only for map-originated
//! events and never mark inputs dirty, so the two directions cannot feed
//! each other.

use std::sync::Arc;

use geopin_api::{
    IconAnchor, LocateOptions, LocationEvent, MapBackend, TileLayerSpec, DARK_FILTER,
};
use geopin_core::{
    normalize, Coordinate, GeoError, GeoResult, LatLng, LocationDescriptor, Position,
};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::markers::{compute_markers, MarkerReader, MarkerSet, MarkerTable};
use crate::model::*;
use crate::{EventBus, Notification};

pub struct MapState {
    inputs: MapInputs,
    // memoized per field so a change to one side does not renormalize the other
    lat: f64,
    lng: f64,
    label: Option<String>,
    effective: Option<Vec<LocationDescriptor>>,
    backend: Option<Box<dyn MapBackend>>,
    icon: Option<IconTemplate>,
    anchor: Option<IconAnchor>,
    markers: MarkerTable,
    scale_added: bool,
    zoom_listening: bool,
    dark_rx: Option<watch::Receiver<bool>>,
    dirty: u32,
    // bumped whenever the descriptors markers derive from change
    locations_rev: u64,
    bus: EventBus,
}

impl MapState {
    pub fn new(bus: EventBus) -> Self {
        Self {
            inputs: MapInputs::default(),
            lat: 0.0,
            lng: 0.0,
            label: None,
            effective: None,
            backend: None,
            icon: None,
            anchor: None,
            markers: MarkerTable::new(),
            scale_added: false,
            zoom_listening: false,
            dark_rx: None,
            dirty: 0,
            locations_rev: 0,
            bus,
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.bus.subscribe()
    }

    pub fn inputs(&self) -> &MapInputs {
        &self.inputs
    }

    /// Normalized position as last pushed (or about to be pushed).
    pub fn position(&self) -> Position {
        Position { lat: self.lat, lng: self.lng, alt: self.inputs.alt }
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// The location list markers are derived from (explicit or implicit).
    pub fn effective_locations(&self) -> Option<&[LocationDescriptor]> {
        self.effective.as_deref()
    }

    pub fn markers(&self) -> Arc<MarkerSet> {
        self.markers.current()
    }

    pub fn marker_reader(&self) -> MarkerReader {
        self.markers.reader()
    }

    pub fn is_ready(&self) -> bool {
        self.backend.is_some()
    }

    /// Revision of the marker descriptors: the location list, or the
    /// position and label of the implicit marker.
    pub fn locations_rev(&self) -> u64 {
        self.locations_rev
    }

    pub fn icon_anchor(&self) -> Option<IconAnchor> {
        self.anchor
    }

    // ----------------- lifecycle -----------------

    /// Bind a freshly created map: add the tile layer, keep the icon
    /// template and measure its anchor, start listening for zoom ends.
    pub fn attach(&mut self, mut backend: Box<dyn MapBackend>, icon: IconTemplate) {
        backend.add_tile_layer(&TileLayerSpec::default());
        self.anchor = icon.measure();
        if self.anchor.is_none() {
            debug!("icon has no layout size yet; markers wait for resize");
        }
        self.icon = Some(icon);
        self.backend = Some(backend);
        self.zoom_listening = true;
        self.scale_added = false;
        self.dirty |= MAP | ICON;
        info!("map attached");
    }

    /// Tear down: remove markers, stop listening, release the map.
    pub fn detach(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            let empty = self.markers.clear(backend.as_mut());
            self.bus.publish(Notification::MarkersChanged(empty));
        }
        self.backend = None;
        self.zoom_listening = false;
        self.scale_added = false;
        self.dark_rx = None;
        info!("map detached");
    }

    /// Re-measure the icon after a layout change and let the map resize.
    pub fn resize(&mut self, width: f64, height: f64) {
        let Some(backend) = self.backend.as_mut() else { return };
        if let Some(icon) = self.icon.as_mut() {
            icon.width = width;
            icon.height = height;
            let anchor = icon.measure();
            if anchor != self.anchor {
                self.anchor = anchor;
                self.dirty |= ICON;
            }
        }
        backend.invalidate_size();
    }

    pub fn subscribe_dark_mode(&mut self, mut rx: watch::Receiver<bool>) {
        let dark = *rx.borrow_and_update();
        self.dark_rx = Some(rx);
        self.set_dark_mode(dark);
    }

    pub fn unsubscribe_dark_mode(&mut self) {
        self.dark_rx = None;
    }

    // ----------------- setters -----------------

    pub fn set_alt(&mut self, alt: Option<f64>) {
        if self.inputs.alt != alt {
            self.inputs.alt = alt;
            self.dirty |= ALT;
        }
    }

    /// Normalizes eagerly: a malformed value is rejected before any state changes.
    pub fn set_lat(&mut self, lat: Coordinate) -> GeoResult<()> {
        let v = normalize(&lat)?;
        self.inputs.lat = lat;
        if v != self.lat {
            self.lat = v;
            self.touch_locations(POS);
        }
        Ok(())
    }

    pub fn set_lng(&mut self, lng: Coordinate) -> GeoResult<()> {
        let v = normalize(&lng)?;
        self.inputs.lng = lng;
        if v != self.lng {
            self.lng = v;
            self.touch_locations(POS);
        }
        Ok(())
    }

    pub fn set_position(&mut self, lat: Coordinate, lng: Coordinate) -> GeoResult<()> {
        // validate both before touching either
        normalize(&lat)?;
        normalize(&lng)?;
        self.set_lat(lat)?;
        self.set_lng(lng)
    }

    pub fn set_label(&mut self, label: Option<String>) {
        if self.label != label {
            self.label = label;
            self.touch_locations(LABEL);
        }
    }

    pub fn set_zoom(&mut self, zoom: f64) {
        if self.inputs.zoom != zoom {
            self.inputs.zoom = zoom;
            self.dirty |= ZOOM;
        }
    }

    pub fn set_dark_mode(&mut self, dark: bool) {
        if self.inputs.dark_mode != dark {
            self.inputs.dark_mode = dark;
            self.dirty |= DARK;
        }
    }

    pub fn set_draggable(&mut self, draggable: bool) {
        if self.inputs.draggable != draggable {
            self.inputs.draggable = draggable;
            self.dirty |= DRAGGABLE;
        }
    }

    pub fn set_scale(&mut self, scale: bool) {
        if self.inputs.scale != scale {
            self.inputs.scale = scale;
            self.dirty |= SCALE;
        }
    }

    pub fn set_smooth(&mut self, smooth: bool) {
        self.inputs.smooth = smooth;
    }

    /// Replace the explicit location list. Every descriptor is validated
    /// first; on error nothing changes.
    pub fn set_locations(&mut self, locations: Option<Vec<LocationDescriptor>>) -> GeoResult<()> {
        if let Some(list) = &locations {
            for loc in list {
                loc.latlng()?;
            }
        }
        self.inputs.locations = locations;
        self.touch_locations(LOCATIONS);
        Ok(())
    }

    fn touch_locations(&mut self, bits: u32) {
        self.dirty |= bits;
        self.locations_rev += 1;
    }

    // ----------------- operations needing the map -----------------

    pub fn center(&self) -> GeoResult<LatLng> {
        self.backend.as_ref().map(|b| b.center()).ok_or(GeoError::MapNotReady)
    }

    /// Append a marker at the map center. The implicit marker, if shown,
    /// is kept as the first entry of the new explicit list.
    pub fn add_marker(&mut self, new: NewMarker) -> GeoResult<()> {
        let (Some(backend), Some(_)) = (self.backend.as_ref(), self.anchor) else {
            return Err(GeoError::MapNotReady);
        };
        let center = backend.center();
        let loc = LocationDescriptor {
            lat: new.lat.unwrap_or(Coordinate::Decimal(center.lat)),
            lng: new.lng.unwrap_or(Coordinate::Decimal(center.lng)),
            text: new.text,
            class_name: Some(new.class_name.unwrap_or_else(|| ADDED_MARKER_CLASS.to_string())),
            draggable: new.draggable,
            options: new.options,
        };
        loc.latlng()?;
        let mut list = match self.inputs.locations.take() {
            Some(list) if !list.is_empty() => list,
            _ => self.effective.clone().unwrap_or_default(),
        };
        list.push(loc);
        self.inputs.locations = Some(list);
        self.touch_locations(LOCATIONS);
        Ok(())
    }

    /// Move the descriptor behind `slot` and relabel it; bumps
    /// [`MapState::locations_rev`]. For the implicit
    /// marker this moves the model position instead.
    pub fn update_slot(&mut self, slot: usize, latlng: LatLng, label: Option<String>) -> GeoResult<()> {
        match self.inputs.locations.as_mut() {
            Some(list) if !list.is_empty() => {
                let Some(loc) = list.get_mut(slot) else {
                    warn!(slot, "update for unknown marker slot ignored");
                    return Ok(());
                };
                loc.lat = Coordinate::Decimal(latlng.lat);
                loc.lng = Coordinate::Decimal(latlng.lng);
                loc.text = label;
                self.touch_locations(LOCATIONS);
                Ok(())
            }
            _ => {
                self.set_position(latlng.lat.into(), latlng.lng.into())?;
                self.set_label(label);
                Ok(())
            }
        }
    }

    pub fn request_locate(&mut self) -> GeoResult<()> {
        let backend = self.backend.as_mut().ok_or(GeoError::MapNotReady)?;
        backend.locate(LocateOptions { enable_high_accuracy: true });
        Ok(())
    }

    // ----------------- map -> model -----------------

    /// Map finished zooming: read the authoritative zoom back and publish it.
    pub fn on_zoom_end(&mut self) -> Option<f64> {
        if !self.zoom_listening {
            return None;
        }
        let zoom = self.backend.as_ref()?.zoom();
        // stored without marking dirty: the value came from the map
        self.inputs.zoom = zoom;
        self.bus.publish(Notification::ZoomChanged(zoom));
        Some(zoom)
    }

    /// Device location found: adopt it as the model position.
    pub fn on_location_found(&mut self, ev: &LocationEvent) -> GeoResult<()> {
        self.set_position(ev.latlng.lat.into(), ev.latlng.lng.into())
    }

    // ----------------- scheduler -----------------

    /// Run every rule whose inputs changed since the last flush.
    pub fn flush(&mut self) {
        self.poll_dark_mode();
        let mut d = std::mem::take(&mut self.dirty);
        if d == 0 {
            return;
        }

        // derived values first
        if d & LOCATIONS != 0 {
            self.effective = match &self.inputs.locations {
                Some(list) if !list.is_empty() => Some(list.clone()),
                _ => None,
            };
            d |= EFFECTIVE;
        }
        if d & (POS | LABEL | MAP | LOCATIONS) != 0 && self.sync_implicit_location() {
            d |= EFFECTIVE;
        }

        // model -> map
        if d & (ALT | POS | MAP) != 0 {
            self.push_view();
        }
        if d & (DARK | MAP) != 0 {
            self.push_dark_mode();
        }
        if d & (SCALE | MAP) != 0 {
            self.push_scale();
        }
        if d & (ZOOM | MAP) != 0 {
            self.push_zoom();
        }
        if d & (EFFECTIVE | DRAGGABLE | MAP | ICON) != 0 {
            self.recompute_markers();
        }
    }

    fn poll_dark_mode(&mut self) {
        let changed = match self.dark_rx.as_mut() {
            Some(rx) if rx.has_changed().unwrap_or(false) => Some(*rx.borrow_and_update()),
            _ => None,
        };
        if let Some(dark) = changed {
            self.set_dark_mode(dark);
        }
    }

    fn valid_position(&self) -> bool {
        let ok = LatLng::new(self.lat, self.lng).is_valid();
        if !ok {
            warn!(lat = self.lat, lng = self.lng, "position out of range; not pushed to map");
        }
        ok
    }

    /// Synthesize the single implicit marker when no explicit list exists.
    fn sync_implicit_location(&mut self) -> bool {
        let explicit = self.inputs.locations.as_ref().is_some_and(|l| !l.is_empty());
        if explicit || self.backend.is_none() || !self.valid_position() {
            return false;
        }
        let mut loc = LocationDescriptor::at(self.lat, self.lng);
        loc.text = self.label.clone();
        self.effective = Some(vec![loc]);
        true
    }

    fn push_view(&mut self) {
        if !self.valid_position() {
            return;
        }
        let position = self.position();
        let animate = self.inputs.smooth;
        let model_zoom = self.inputs.zoom;
        let Some(backend) = self.backend.as_mut() else { return };
        let zoom = if model_zoom.is_finite() { model_zoom } else { backend.zoom() };
        backend.set_view(position, zoom, animate);
    }

    fn push_dark_mode(&mut self) {
        let dark = self.inputs.dark_mode;
        let Some(backend) = self.backend.as_mut() else { return };
        if dark {
            backend.set_tile_filter(&DARK_FILTER);
        } else {
            backend.set_tile_filter(&[]);
        }
    }

    fn push_scale(&mut self) {
        if !self.inputs.scale || self.scale_added {
            return;
        }
        let Some(backend) = self.backend.as_mut() else { return };
        backend.add_scale_control();
        self.scale_added = true;
    }

    fn push_zoom(&mut self) {
        let zoom = self.inputs.zoom;
        let animate = self.inputs.smooth;
        if !zoom.is_finite() {
            return;
        }
        let Some(backend) = self.backend.as_mut() else { return };
        backend.set_zoom(zoom, animate);
    }

    fn recompute_markers(&mut self) {
        let specs = compute_markers(
            self.effective.as_deref(),
            self.inputs.draggable,
            self.backend.is_some(),
            self.icon.as_ref(),
            self.anchor,
        );
        let specs = match specs {
            Ok(Some(specs)) => specs,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "marker recomputation skipped");
                return;
            }
        };
        let Some(backend) = self.backend.as_mut() else { return };
        let set = self.markers.replace(backend.as_mut(), specs);
        self.bus.publish(Notification::MarkersChanged(set));
    }
}
