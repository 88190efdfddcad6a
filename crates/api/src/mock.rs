//! In-memory collaborators for tests and headless runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use geopin_core::{Bounds, GeoError, GeoResult, LatLng, Position, SearchResult};
use rustc_hash::FxHashMap;
use tokio::sync::Notify;

use crate::{
    Geocoder, LocateOptions, MapBackend, MarkerId, MarkerSpec, OsmRef, SearchParams, TileFilter,
    TileLayerSpec,
};

/// Canned geocoder. Forward queries are answered by exact query string;
/// reverse queries by a fixed result or a synthesized one at the coordinates.
#[derive(Default)]
pub struct MockGeocoder {
    forward: BTreeMap<String, Vec<SearchResult>>,
    reverse: Option<SearchResult>,
    fail: Option<String>,
    gate: Option<Arc<Notify>>,
    forward_calls: AtomicUsize,
    reverse_calls: AtomicUsize,
    seen_params: Mutex<Vec<SearchParams>>,
}

impl MockGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_forward(mut self, query: &str, results: Vec<SearchResult>) -> Self {
        self.forward.insert(query.to_string(), results);
        self
    }

    pub fn with_reverse(mut self, result: SearchResult) -> Self {
        self.reverse = Some(result);
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.fail = Some(message.to_string());
        self
    }

    /// Hold every request until the notify hands out a permit.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::SeqCst)
    }

    pub fn reverse_calls(&self) -> usize {
        self.reverse_calls.load(Ordering::SeqCst)
    }

    /// Provider parameters of every request, in call order.
    pub fn seen_params(&self) -> Vec<SearchParams> {
        self.seen_params.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn enter(&self, params: &SearchParams) -> GeoResult<()> {
        self.seen_params.lock().unwrap_or_else(|e| e.into_inner()).push(params.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        match &self.fail {
            Some(msg) => Err(GeoError::SearchFailed(msg.clone())),
            None => Ok(()),
        }
    }

    fn place_at(lat: f64, lng: f64) -> SearchResult {
        SearchResult {
            lat,
            lng,
            label: format!("{lat}, {lng}"),
            bounds: Bounds { s: lat, n: lat, w: lng, e: lng },
            raw: serde_json::Value::Null,
        }
    }
}

#[async_trait::async_trait]
impl Geocoder for MockGeocoder {
    async fn search(&self, query: &str, params: &SearchParams) -> GeoResult<Vec<SearchResult>> {
        self.forward_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(params).await?;
        Ok(self.forward.get(query).cloned().unwrap_or_default())
    }

    async fn reverse(&self, lat: f64, lng: f64, params: &SearchParams) -> GeoResult<SearchResult> {
        self.reverse_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(params).await?;
        Ok(self.reverse.clone().unwrap_or_else(|| Self::place_at(lat, lng)))
    }

    async fn reverse_raw(&self, osm: &OsmRef, params: &SearchParams) -> GeoResult<SearchResult> {
        self.reverse_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(params).await?;
        self.reverse
            .clone()
            .ok_or_else(|| GeoError::SearchFailed(format!("unknown object {}{}", osm.osm_type, osm.osm_id)))
    }
}

#[derive(Debug, Default)]
pub struct HeadlessState {
    pub center: LatLng,
    pub alt: Option<f64>,
    pub zoom: f64,
    pub last_animate: Option<bool>,
    pub view_calls: usize,
    pub zoom_calls: usize,
    pub markers: FxHashMap<MarkerId, MarkerSpec>,
    pub removed: Vec<MarkerId>,
    pub tile_layers: Vec<TileLayerSpec>,
    pub filter: Vec<TileFilter>,
    pub scale_controls: usize,
    pub locate_requests: Vec<LocateOptions>,
    pub size_invalidations: usize,
    next_id: MarkerId,
}

/// Map library stand-in that only records state. Clones share the same map,
/// so a test can keep one handle while the widget owns another.
#[derive(Clone, Default)]
pub struct HeadlessMap {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn marker_count(&self) -> usize {
        self.state().markers.len()
    }

    /// Markers sorted by id (creation order).
    pub fn markers(&self) -> Vec<(MarkerId, MarkerSpec)> {
        let st = self.state();
        let mut v: Vec<(MarkerId, MarkerSpec)> = st.markers.iter().map(|(k, m)| (*k, m.clone())).collect();
        v.sort_by_key(|(k, _)| *k);
        v
    }

    /// Simulate a user pinch/scroll zoom; the host then reports `ZoomEnd`.
    pub fn user_zoom(&self, zoom: f64) {
        self.state().zoom = zoom;
    }

    pub fn pan_to(&self, center: LatLng) {
        self.state().center = center;
    }
}

impl MapBackend for HeadlessMap {
    fn add_tile_layer(&mut self, layer: &TileLayerSpec) {
        let mut st = self.state();
        st.filter = layer.filter.clone();
        st.tile_layers.push(layer.clone());
    }

    fn set_tile_filter(&mut self, filter: &[TileFilter]) {
        self.state().filter = filter.to_vec();
    }

    fn set_view(&mut self, position: Position, zoom: f64, animate: bool) {
        let mut st = self.state();
        st.center = position.latlng();
        st.alt = position.alt;
        st.zoom = zoom;
        st.last_animate = Some(animate);
        st.view_calls += 1;
    }

    fn set_zoom(&mut self, zoom: f64, animate: bool) {
        let mut st = self.state();
        st.zoom = zoom;
        st.last_animate = Some(animate);
        st.zoom_calls += 1;
    }

    fn zoom(&self) -> f64 {
        self.state().zoom
    }

    fn center(&self) -> LatLng {
        self.state().center
    }

    fn add_marker(&mut self, spec: &MarkerSpec) -> MarkerId {
        let mut st = self.state();
        st.next_id += 1;
        let id = st.next_id;
        st.markers.insert(id, spec.clone());
        id
    }

    fn remove_marker(&mut self, id: MarkerId) {
        let mut st = self.state();
        if st.markers.remove(&id).is_some() {
            st.removed.push(id);
        }
    }

    fn add_scale_control(&mut self) {
        self.state().scale_controls += 1;
    }

    fn locate(&mut self, opts: LocateOptions) {
        self.state().locate_requests.push(opts);
    }

    fn invalidate_size(&mut self) {
        self.state().size_invalidations += 1;
    }
}
