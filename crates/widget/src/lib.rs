//! Geopin map widget.
//!
//! [`AppMap`] is the surface a host UI talks to: declarative setters for
//! the map inputs, marker and device-location operations, and forward and
//! reverse geocoding. Map-originated events are fed back through
//! [`AppMap::handle_map_event`]. Non-silent failures of user-triggered
//! operations are also pushed to [`AppMap::toasts`].

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use geopin_api::{Geocoder, LocationEvent, MapBackend, MapEvent, OsmRef, SearchParams, LOCATION_PERMISSION_DENIED};
use geopin_core::{normalize, Coordinate, GeoError, GeoResult, LatLng, LocationDescriptor, Position, SearchResult, SearchSession};
use geopin_persist::Store;
use geopin_search::GeocodeCache;
use geopin_store::{DarkModeSource, EventBus, IconTemplate, MapState, MarkerSet, NewMarker, Notification};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod bridge;
pub mod config;
pub mod tasks;
pub mod toasts;

pub use bridge::MarkerInteractionBridge;
pub use config::WidgetConfig;
pub use tasks::search::{GeocodeSearchController, Trigger};
pub use toasts::{Toast, ToastKind, Toasts, MAX_TOASTS};

/// Shown when the device position cannot be obtained.
pub const LOCATE_FAILED_MESSAGE: &str = "Could not locate your position.";

type PendingLocate = oneshot::Sender<GeoResult<LocationEvent>>;

struct Inner {
    state: Mutex<MapState>,
    search: GeocodeSearchController,
    bridge: Mutex<MarkerInteractionBridge>,
    pending_locates: Mutex<Vec<PendingLocate>>,
    dark_mode: Option<Arc<DarkModeSource>>,
    toasts: Toasts,
    config: WidgetConfig,
}

/// Cheap to clone; clones share one widget.
#[derive(Clone)]
pub struct AppMap {
    inner: Arc<Inner>,
}

pub struct AppMapBuilder {
    geocoder: Arc<dyn Geocoder>,
    store: Arc<dyn Store>,
    config: WidgetConfig,
    params: SearchParams,
    dark_mode: Option<Arc<DarkModeSource>>,
}

impl AppMapBuilder {
    pub fn config(mut self, config: WidgetConfig) -> Self {
        self.config = config;
        self
    }

    pub fn params(mut self, params: SearchParams) -> Self {
        self.params = params;
        self
    }

    /// Dark-mode provider, subscribed on attach and released on detach.
    pub fn dark_mode(mut self, source: Arc<DarkModeSource>) -> Self {
        self.dark_mode = Some(source);
        self
    }

    pub fn build(self) -> AppMap {
        let bus = EventBus::new();
        let mut state = MapState::new(bus.clone());
        state.set_zoom(self.config.default_zoom);
        let cache = GeocodeCache::new(self.store).with_limit(self.config.cache_limit);
        let search = GeocodeSearchController::new(self.geocoder, cache, self.config.clone(), bus)
            .with_params(self.params);
        AppMap {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                search,
                bridge: Mutex::new(MarkerInteractionBridge::new()),
                pending_locates: Mutex::new(Vec::new()),
                dark_mode: self.dark_mode,
                toasts: Toasts::default(),
                config: self.config,
            }),
        }
    }
}

impl AppMap {
    pub fn builder(geocoder: Arc<dyn Geocoder>, store: Arc<dyn Store>) -> AppMapBuilder {
        AppMapBuilder {
            geocoder,
            store,
            config: WidgetConfig::default(),
            params: SearchParams::new(),
            dark_mode: None,
        }
    }

    pub fn new(geocoder: Arc<dyn Geocoder>, store: Arc<dyn Store>) -> Self {
        Self::builder(geocoder, store).build()
    }

    // ----------------- lifecycle -----------------

    pub fn attach(&self, backend: Box<dyn MapBackend>, icon: IconTemplate) {
        let dark = self.inner.dark_mode.as_ref().map(|src| src.subscribe());
        self.apply(|st| {
            st.attach(backend, icon);
            if let Some(rx) = dark {
                st.subscribe_dark_mode(rx);
            }
        });
    }

    pub fn detach(&self) {
        self.state().detach();
        self.bridge().reset();
        // outstanding locate requests resolve as failed once their senders drop
        self.pending().clear();
    }

    pub fn resize(&self, width: f64, height: f64) {
        self.apply(|st| st.resize(width, height));
    }

    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    // ----------------- inputs -----------------

    pub fn set_lat(&self, lat: Coordinate) -> GeoResult<()> {
        self.update(|st| st.set_lat(lat))
    }

    pub fn set_lng(&self, lng: Coordinate) -> GeoResult<()> {
        self.update(|st| st.set_lng(lng))
    }

    pub fn set_position(&self, lat: Coordinate, lng: Coordinate) -> GeoResult<()> {
        self.update(|st| st.set_position(lat, lng))
    }

    pub fn set_alt(&self, alt: Option<f64>) {
        self.apply(|st| st.set_alt(alt));
    }

    pub fn set_zoom(&self, zoom: f64) {
        self.apply(|st| st.set_zoom(zoom));
    }

    pub fn set_dark_mode(&self, dark: bool) {
        self.apply(|st| st.set_dark_mode(dark));
    }

    pub fn set_draggable(&self, draggable: bool) {
        self.apply(|st| st.set_draggable(draggable));
    }

    pub fn set_scale(&self, scale: bool) {
        self.apply(|st| st.set_scale(scale));
    }

    pub fn set_smooth(&self, smooth: bool) {
        self.apply(|st| st.set_smooth(smooth));
    }

    /// Normalize a raw coordinate to signed decimal degrees.
    pub fn resolve_position(&self, raw: &Coordinate) -> GeoResult<f64> {
        normalize(raw)
    }

    /// Replace the location list and return the installed marker set.
    /// The set stays empty until the map is attached.
    pub fn set_markers(&self, locations: Option<Vec<LocationDescriptor>>) -> GeoResult<Arc<MarkerSet>> {
        self.update(|st| st.set_locations(locations))?;
        Ok(self.markers())
    }

    /// Drop a pin at the map center.
    pub fn add_marker(&self, new: NewMarker) -> GeoResult<()> {
        self.update(|st| st.add_marker(new))
    }

    // ----------------- observation -----------------

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.state().subscribe()
    }

    pub fn markers(&self) -> Arc<MarkerSet> {
        self.state().markers()
    }

    pub fn position(&self) -> Position {
        self.state().position()
    }

    pub fn zoom(&self) -> f64 {
        self.state().inputs().zoom
    }

    pub fn label(&self) -> Option<String> {
        self.state().label().map(str::to_string)
    }

    pub fn center(&self) -> GeoResult<LatLng> {
        self.state().center()
    }

    pub fn session(&self) -> SearchSession {
        self.inner.search.session()
    }

    pub fn active_marker(&self) -> Option<usize> {
        self.bridge().active()
    }

    pub fn toasts(&self) -> &Toasts {
        &self.inner.toasts
    }

    pub fn search_controller(&self) -> &GeocodeSearchController {
        &self.inner.search
    }

    // ----------------- device location -----------------

    /// Ask the map for the device position and wait for the outcome.
    pub async fn get_device_location(&self) -> GeoResult<LocationEvent> {
        let rx = {
            let mut st = self.state();
            st.request_locate()?;
            let (tx, rx) = oneshot::channel();
            self.pending().push(tx);
            rx
        };
        match tokio::time::timeout(self.inner.config.locate_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(GeoError::GeolocationFailed("map detached".into())),
            Err(_) => Err(GeoError::GeolocationFailed("timed out".into())),
        }
    }

    /// Locate the device, then label the position by reverse geocoding.
    pub async fn locate_and_label(&self) -> GeoResult<SearchResult> {
        let found = match self.get_device_location().await {
            Ok(ev) => ev,
            Err(e) => {
                warn!(error = %e, "locate failed");
                self.inner.toasts.push(LOCATE_FAILED_MESSAGE, ToastKind::Warn);
                return Err(e);
            }
        };
        let result = self
            .inner
            .search
            .reverse(found.latlng.lat, found.latlng.lng, Trigger::Locate)
            .await
            .map_err(|e| self.report(e))?;
        self.apply_label(found.latlng, &result)?;
        Ok(result)
    }

    // ----------------- geocoding -----------------

    /// Explicit search submission.
    pub async fn search(&self, query: &str) -> GeoResult<Vec<SearchResult>> {
        self.inner.search.search(query, Trigger::Submit).await.map_err(|e| self.report(e))
    }

    /// Live suggestions while typing.
    pub async fn autocomplete(&self, query: &str) -> GeoResult<Vec<SearchResult>> {
        self.inner.search.search(query, Trigger::Autocomplete).await.map_err(|e| self.report(e))
    }

    pub async fn reverse_search(&self, lat: f64, lng: f64) -> GeoResult<SearchResult> {
        let result = self.inner.search.reverse(lat, lng, Trigger::Reverse).await.map_err(|e| self.report(e))?;
        self.apply_selection(&result)?;
        Ok(result)
    }

    pub async fn reverse_raw(&self, osm: &OsmRef) -> GeoResult<SearchResult> {
        let result = self.inner.search.reverse_raw(osm).await.map_err(|e| self.report(e))?;
        self.apply_selection(&result)?;
        Ok(result)
    }

    /// Pick a suggestion: it becomes the selection and the model position.
    pub fn select(&self, result: SearchResult) -> GeoResult<()> {
        self.inner.search.select(result.clone());
        self.apply_selection(&result)
    }

    // ----------------- map events -----------------

    /// Feed an event fired by the map. Drag ends start a reverse lookup on
    /// the runtime; its handle is returned so callers can await it.
    pub fn handle_map_event(&self, event: MapEvent) -> Option<JoinHandle<()>> {
        match event {
            MapEvent::ZoomEnd => {
                if let Some(zoom) = self.state().on_zoom_end() {
                    debug!(zoom, "map zoom ended");
                }
                None
            }
            MapEvent::LocationFound(ev) => {
                if let Err(e) = self.update(|st| st.on_location_found(&ev)) {
                    warn!(error = %e, "location found with unusable coordinates");
                }
                self.resolve_locates(Ok(ev));
                None
            }
            MapEvent::LocationError { code, message } => {
                let err = if code == LOCATION_PERMISSION_DENIED {
                    GeoError::GeolocationDenied(message)
                } else {
                    GeoError::GeolocationFailed(message)
                };
                self.resolve_locates(Err(err));
                None
            }
            MapEvent::MarkerDragEnd { marker, latlng } => {
                let slot = self.bridge().on_drag_end(marker)?;
                // the new position is committed now; only the label waits for the lookup
                let committed = self.update(|st| {
                    let label = st.markers().handles.get(slot).and_then(|h| h.label.clone());
                    st.update_slot(slot, latlng, label)?;
                    Ok(st.locations_rev())
                });
                let rev = match committed {
                    Ok(rev) => rev,
                    Err(e) => {
                        warn!(error = %e, slot, "drag end could not be applied");
                        return None;
                    }
                };
                let this = self.clone();
                Some(tokio::spawn(async move {
                    this.relabel_dragged(slot, latlng, rev).await;
                }))
            }
        }
    }

    /// Label a dragged marker, unless its descriptors changed since the
    /// drag was committed at revision `rev`.
    async fn relabel_dragged(&self, slot: usize, latlng: LatLng, rev: u64) {
        let label = match self.inner.search.reverse(latlng.lat, latlng.lng, Trigger::Reverse).await {
            Ok(result) => result.label,
            Err(e) => {
                self.report(e);
                return;
            }
        };
        let outcome = self.update(|st| {
            if st.locations_rev() != rev {
                debug!(slot, "drag label dropped, locations changed meanwhile");
                return Ok(());
            }
            st.update_slot(slot, latlng, Some(label))
        });
        if let Err(e) = outcome {
            warn!(error = %e, slot, "drag label could not be applied");
        }
    }

    fn resolve_locates(&self, outcome: GeoResult<LocationEvent>) {
        let waiting = std::mem::take(&mut *self.pending());
        info!(waiting = waiting.len(), ok = outcome.is_ok(), "device location resolved");
        for tx in waiting {
            let _ = tx.send(outcome.clone());
        }
    }

    // ----------------- internals -----------------

    /// Selection moves the model position and labels the implicit marker.
    fn apply_selection(&self, result: &SearchResult) -> GeoResult<()> {
        self.apply_label(result.latlng(), result)
    }

    fn apply_label(&self, at: LatLng, result: &SearchResult) -> GeoResult<()> {
        self.update(|st| {
            st.set_position(at.lat.into(), at.lng.into())?;
            st.set_label(Some(result.label.clone()));
            Ok(())
        })
    }

    /// Run `f` against the state, flush, and rewire drag listeners. An
    /// error from `f` skips the flush.
    fn update<T>(&self, f: impl FnOnce(&mut MapState) -> GeoResult<T>) -> GeoResult<T> {
        let mut st = self.state();
        let out = f(&mut st)?;
        st.flush();
        let markers = st.markers();
        drop(st);
        self.bridge().sync(&markers);
        Ok(out)
    }

    fn apply(&self, f: impl FnOnce(&mut MapState)) {
        let _ = self.update(|st| {
            f(st);
            Ok(())
        });
    }

    /// Log, and toast unless silent; hands the error back.
    fn report(&self, e: GeoError) -> GeoError {
        if e.is_silent() {
            debug!(error = %e, "search cancelled");
        } else {
            warn!(error = %e, "search failed");
            self.inner.toasts.push(e.to_string(), ToastKind::Warn);
        }
        e
    }

    fn state(&self) -> MutexGuard<'_, MapState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bridge(&self) -> MutexGuard<'_, MarkerInteractionBridge> {
        self.inner.bridge.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, Vec<PendingLocate>> {
        self.inner.pending_locates.lock().unwrap_or_else(|e| e.into_inner())
    }
}
