#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use geopin_api::{Geocoder, OsmRef, SearchParams};
use geopin_core::{GeoError, GeoResult, SearchResult, SearchSession, SearchStatus};
use geopin_search::GeocodeCache;
use geopin_store::{EventBus, Notification};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use super::debounce::Debouncer;
use crate::WidgetConfig;

/// What started a search; each kind has its own debounce window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    Autocomplete,
    Submit,
    Reverse,
    Locate,
}

impl Trigger {
    fn quiet(self, cfg: &WidgetConfig) -> Duration {
        match self {
            Trigger::Autocomplete => cfg.autocomplete_debounce,
            Trigger::Submit | Trigger::Reverse | Trigger::Locate => cfg.search_debounce,
        }
    }
}

/// Debounced, cache-first geocoding with a single active session.
///
/// A request arriving while the session is `Searching` is dropped with
/// [`GeoError::SearchInFlight`]; nothing is queued.
pub struct GeocodeSearchController {
    geocoder: Arc<dyn Geocoder>,
    cache: GeocodeCache,
    session: Mutex<SearchSession>,
    debouncer: Debouncer<Trigger>,
    config: WidgetConfig,
    params: SearchParams,
    bus: EventBus,
}

/// Held while the session is `Searching`. Dropping it without finishing
/// resets the session to `Idle`, including when the request future is
/// dropped mid-flight.
struct InFlight<'a> {
    session: &'a Mutex<SearchSession>,
}

impl InFlight<'_> {
    fn cached(self, results: Vec<SearchResult>) {
        let mut s = self.session.lock().unwrap_or_else(|e| e.into_inner());
        s.status = SearchStatus::Cached;
        s.results = results;
    }

    fn done(self, results: Vec<SearchResult>) {
        let mut s = self.session.lock().unwrap_or_else(|e| e.into_inner());
        s.status = SearchStatus::Idle;
        s.results = results;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut s = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if s.status == SearchStatus::Searching {
            s.status = SearchStatus::Idle;
        }
    }
}

impl GeocodeSearchController {
    pub fn new(geocoder: Arc<dyn Geocoder>, cache: GeocodeCache, config: WidgetConfig, bus: EventBus) -> Self {
        Self {
            geocoder,
            cache,
            session: Mutex::new(SearchSession::default()),
            debouncer: Debouncer::new(),
            config,
            params: SearchParams::new(),
            bus,
        }
    }

    /// Extra provider parameters sent with every request.
    pub fn with_params(mut self, params: SearchParams) -> Self {
        self.params = params;
        self
    }

    pub fn session(&self) -> SearchSession {
        self.lock().clone()
    }

    pub fn status(&self) -> SearchStatus {
        self.lock().status
    }

    pub fn cache(&self) -> &GeocodeCache {
        &self.cache
    }

    pub fn clear(&self) {
        let mut s = self.lock();
        s.results.clear();
        s.selected = None;
    }

    /// Forward search: text to candidates.
    pub async fn search(&self, query: &str, trigger: Trigger) -> GeoResult<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            self.clear();
            return Ok(Vec::new());
        }
        let session = self.admit(trigger).await?;

        let cached = self.cache.lookup_forward(query);
        if !cached.is_empty() {
            debug!(query = %query, hits = cached.len(), "search: served from cache");
            session.cached(cached.clone());
            return Ok(cached);
        }

        let results = self.network("search", self.geocoder.search(query, &self.params)).await?;
        if let Err(e) = self.cache.record_forward(query, &results) {
            warn!(error = %e, query = %query, "search: cache write-back failed");
        }
        info!(query = %query, results = results.len(), "search: network results");
        session.done(results.clone());
        Ok(results)
    }

    /// Reverse search: coordinates to one address, which becomes the selection.
    pub async fn reverse(&self, lat: f64, lng: f64, trigger: Trigger) -> GeoResult<SearchResult> {
        let session = self.admit(trigger).await?;

        if let Some(hit) = self.cache.lookup_reverse(lat, lng) {
            debug!(lat, lng, label = %hit.label, "reverse: served from cache");
            session.cached(vec![hit.clone()]);
            self.select(hit.clone());
            return Ok(hit);
        }

        let result = self.network("reverse", self.geocoder.reverse(lat, lng, &self.params)).await?;
        if let Err(e) = self.cache.record_reverse(lat, lng, &result) {
            warn!(error = %e, lat, lng, "reverse: cache write-back failed");
        }
        session.done(vec![result.clone()]);
        self.select(result.clone());
        Ok(result)
    }

    /// Reverse search by provider object id. Results are written back but
    /// never read by id, since the id is not part of the cache key.
    pub async fn reverse_raw(&self, osm: &OsmRef) -> GeoResult<SearchResult> {
        let session = self.admit(Trigger::Reverse).await?;
        let result = self.network("reverse_raw", self.geocoder.reverse_raw(osm, &self.params)).await?;
        if let Err(e) = self.cache.put(&result) {
            warn!(error = %e, osm_id = osm.osm_id, "reverse_raw: cache write-back failed");
        }
        session.done(vec![result.clone()]);
        self.select(result.clone());
        Ok(result)
    }

    /// Make `result` the session selection and announce it.
    pub fn select(&self, result: SearchResult) {
        self.lock().selected = Some(result.clone());
        self.bus.publish(Notification::SelectedChanged(result));
    }

    /// Select one of the current suggestions by position.
    pub fn select_index(&self, index: usize) -> Option<SearchResult> {
        let picked = self.lock().results.get(index).cloned()?;
        self.select(picked.clone());
        Some(picked)
    }

    // Cheap rejection first, then debounce, then the real check-and-set:
    // another trigger may have started a request during the quiet period.
    async fn admit(&self, trigger: Trigger) -> GeoResult<InFlight<'_>> {
        if self.status() == SearchStatus::Searching {
            return Err(self.dropped(trigger));
        }
        self.debouncer.wait(trigger, trigger.quiet(&self.config)).await?;
        self.try_begin(trigger)
    }

    /// Move to `Searching` unless already there, under one lock.
    fn try_begin(&self, trigger: Trigger) -> GeoResult<InFlight<'_>> {
        let mut s = self.lock();
        if s.status == SearchStatus::Searching {
            drop(s);
            return Err(self.dropped(trigger));
        }
        s.status = SearchStatus::Searching;
        Ok(InFlight { session: &self.session })
    }

    fn dropped(&self, trigger: Trigger) -> GeoError {
        counter!("geocode_search_dropped_total", 1u64);
        debug!(?trigger, "search: dropped, another request is in flight");
        GeoError::SearchInFlight
    }

    async fn network<T>(&self, op: &'static str, call: impl Future<Output = GeoResult<T>>) -> GeoResult<T> {
        counter!("geocode_network_total", 1u64);
        let started = Instant::now();
        let out = match tokio::time::timeout(self.config.search_timeout, call).await {
            Ok(r) => r,
            Err(_) => Err(GeoError::SearchFailed("timed out".into())),
        };
        let took_ms = started.elapsed().as_millis() as u64;
        histogram!("geocode_network_ms", took_ms as f64);
        if let Err(e) = &out {
            warn!(op, error = %e, took_ms, "geocoder request failed");
        }
        out
    }

    fn lock(&self) -> MutexGuard<'_, SearchSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geopin_api::MockGeocoder;
    use geopin_core::Bounds;
    use geopin_persist::MemoryStore;
    use tokio::sync::Notify;

    fn place(label: &str, lat: f64, lng: f64) -> SearchResult {
        SearchResult {
            lat,
            lng,
            label: label.to_string(),
            bounds: Bounds { s: lat - 0.1, n: lat + 0.1, w: lng - 0.1, e: lng + 0.1 },
            raw: serde_json::json!({ "display_name": label }),
        }
    }

    fn controller(mock: Arc<MockGeocoder>) -> GeocodeSearchController {
        let cache = GeocodeCache::new(Arc::new(MemoryStore::new()));
        GeocodeSearchController::new(mock, cache, WidgetConfig::default(), EventBus::new())
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_query_is_served_from_cache() {
        let paris = place("Paris, Île-de-France, France", 48.8566, 2.3522);
        let mock = Arc::new(MockGeocoder::new().with_forward("Paris, France", vec![paris.clone()]));
        let c = controller(mock.clone());

        let first = c.search("Paris, France", Trigger::Submit).await.unwrap();
        assert_eq!(first, vec![paris.clone()]);
        assert_eq!(c.status(), SearchStatus::Idle);

        let second = c.search("paris france", Trigger::Submit).await.unwrap();
        assert_eq!(second, vec![paris]);
        assert_eq!(c.status(), SearchStatus::Cached);
        assert_eq!(mock.forward_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_request_while_searching_is_dropped() {
        let gate = Arc::new(Notify::new());
        let first_hit = place("Lisbon, Portugal", 38.72, -9.14);
        let mock = Arc::new(
            MockGeocoder::new()
                .with_forward("Lisbon", vec![first_hit.clone()])
                .with_forward("Porto", vec![place("Porto, Portugal", 41.15, -8.61)])
                .gated(gate.clone()),
        );
        let c = controller(mock.clone());

        let first = c.search("Lisbon", Trigger::Submit);
        let second = async {
            // past the first debounce window, while the first call is held
            tokio::time::sleep(Duration::from_millis(600)).await;
            assert_eq!(c.status(), SearchStatus::Searching);
            let dropped = c.search("Porto", Trigger::Autocomplete).await;
            gate.notify_one();
            dropped
        };
        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap(), vec![first_hit.clone()]);
        assert_eq!(b, Err(GeoError::SearchInFlight));
        assert_eq!(c.session().results, vec![first_hit]);
        assert_eq!(mock.forward_calls(), 1);
        assert_eq!(c.status(), SearchStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn typing_fast_debounces_earlier_keystrokes() {
        let mock = Arc::new(MockGeocoder::new().with_forward("Berl", vec![place("Berlin, Germany", 52.52, 13.4)]));
        let c = controller(mock.clone());
        let early = c.search("Ber", Trigger::Autocomplete);
        let late = async {
            tokio::time::sleep(Duration::from_millis(80)).await;
            c.search("Berl", Trigger::Autocomplete).await
        };
        let (a, b) = tokio::join!(early, late);
        assert_eq!(a, Err(GeoError::SearchDebounced));
        assert_eq!(b.unwrap().len(), 1);
        assert_eq!(mock.forward_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_resets_to_idle() {
        let mock = Arc::new(MockGeocoder::new().failing("503 Service Unavailable"));
        let c = controller(mock);
        let err = c.search("Atlantis", Trigger::Submit).await.unwrap_err();
        assert!(matches!(err, GeoError::SearchFailed(ref m) if m.contains("503")));
        assert!(!err.is_silent());
        assert_eq!(c.status(), SearchStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_provider_times_out() {
        // the gate is never opened
        let mock = Arc::new(MockGeocoder::new().gated(Arc::new(Notify::new())));
        let c = controller(mock);
        let err = c.reverse(1.0, 2.0, Trigger::Reverse).await.unwrap_err();
        assert_eq!(err, GeoError::SearchFailed("timed out".into()));
        assert_eq!(c.status(), SearchStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn reverse_selects_and_caches_by_coordinates() {
        let home = place("221B Baker Street, London", 51.5237, -0.1585);
        let mock = Arc::new(MockGeocoder::new().with_reverse(home.clone()));
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let cache = GeocodeCache::new(Arc::new(MemoryStore::new()));
        let c = GeocodeSearchController::new(mock.clone(), cache, WidgetConfig::default(), bus);

        let got = c.reverse(51.52, -0.158, Trigger::Reverse).await.unwrap();
        assert_eq!(got, home);
        assert_eq!(c.session().selected, Some(home.clone()));
        assert!(matches!(rx.try_recv(), Ok(Notification::SelectedChanged(r)) if r == home));

        let again = c.reverse(51.52, -0.158, Trigger::Reverse).await.unwrap();
        assert_eq!(again, home);
        assert_eq!(mock.reverse_calls(), 1);
        assert_eq!(c.status(), SearchStatus::Cached);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_query_clears_without_network() {
        let mock = Arc::new(MockGeocoder::new());
        let c = controller(mock.clone());
        assert_eq!(c.search("   ", Trigger::Autocomplete).await, Ok(Vec::new()));
        assert_eq!(mock.forward_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn select_index_picks_from_results() {
        let a = place("Springfield, IL", 39.8, -89.6);
        let b = place("Springfield, MA", 42.1, -72.6);
        let mock = Arc::new(MockGeocoder::new().with_forward("Springfield", vec![a, b.clone()]));
        let c = controller(mock);
        c.search("Springfield", Trigger::Submit).await.unwrap();
        assert_eq!(c.select_index(1), Some(b.clone()));
        assert_eq!(c.session().selected, Some(b));
        assert_eq!(c.select_index(9), None);
    }

    #[tokio::test(start_paused = true)]
    async fn reverse_raw_selects_caches_and_settles() {
        let tower = place("Tour Eiffel, Paris", 48.8584, 2.2945);
        let mock = Arc::new(MockGeocoder::new().with_reverse(tower.clone()));
        let c = controller(mock.clone());
        let osm = OsmRef { osm_id: 5013364, osm_type: "way".into() };

        assert_eq!(c.reverse_raw(&osm).await.unwrap(), tower);
        assert_eq!(c.session().selected, Some(tower.clone()));
        assert_eq!(c.session().results, vec![tower.clone()]);
        assert_eq!(c.status(), SearchStatus::Idle);
        assert_eq!(c.cache().get(&tower.query_key()), Some(tower));
        assert_eq!(mock.reverse_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reverse_raw_failure_resets_status() {
        let mock = Arc::new(MockGeocoder::new());
        let c = controller(mock);
        let osm = OsmRef { osm_id: 1, osm_type: "node".into() };
        assert!(matches!(c.reverse_raw(&osm).await, Err(GeoError::SearchFailed(_))));
        assert_eq!(c.status(), SearchStatus::Idle);
        assert_eq!(c.session().selected, None);
    }

    #[tokio::test(start_paused = true)]
    async fn provider_params_reach_every_request() {
        let mock = Arc::new(
            MockGeocoder::new()
                .with_forward("Kyiv", vec![place("Kyiv, Ukraine", 50.45, 30.52)])
                .with_reverse(place("Kyiv, Ukraine", 50.45, 30.52)),
        );
        let params: SearchParams =
            [("accept-language".to_string(), "uk".to_string()), ("countrycodes".to_string(), "ua".to_string())]
                .into_iter()
                .collect();
        let c = controller(mock.clone()).with_params(params.clone());

        c.search("Kyiv", Trigger::Submit).await.unwrap();
        c.reverse(50.0, 30.0, Trigger::Reverse).await.unwrap();
        c.reverse_raw(&OsmRef { osm_id: 421866, osm_type: "relation".into() }).await.unwrap();
        assert_eq!(mock.seen_params(), vec![params.clone(), params.clone(), params]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_never_both_reach_the_network() {
        let config = WidgetConfig {
            autocomplete_debounce: Duration::from_millis(1),
            search_debounce: Duration::from_millis(1),
            ..WidgetConfig::default()
        };
        for _ in 0..200 {
            let gate = Arc::new(Notify::new());
            let mock = Arc::new(
                MockGeocoder::new()
                    .with_forward("Quito", vec![place("Quito, Ecuador", -0.18, -78.47)])
                    .gated(gate.clone()),
            );
            let cache = GeocodeCache::new(Arc::new(MemoryStore::new()));
            let c = Arc::new(GeocodeSearchController::new(mock.clone(), cache, config.clone(), EventBus::new()));

            let forward = tokio::spawn({
                let c = c.clone();
                async move { c.search("Quito", Trigger::Submit).await.map(|_| ()) }
            });
            let backward = tokio::spawn({
                let c = c.clone();
                async move { c.reverse(-0.2, -78.5, Trigger::Reverse).await.map(|_| ()) }
            });
            // wait until one side was turned away, or both are stuck at the gate
            let started = std::time::Instant::now();
            while !forward.is_finished()
                && !backward.is_finished()
                && mock.forward_calls() + mock.reverse_calls() < 2
                && started.elapsed() < Duration::from_secs(2)
            {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            gate.notify_one();
            gate.notify_one();
            let outcomes = [forward.await.unwrap(), backward.await.unwrap()];
            let dropped = outcomes.iter().filter(|r| **r == Err(GeoError::SearchInFlight)).count();
            assert_eq!(dropped, 1, "outcomes: {outcomes:?}");
            assert_eq!(mock.forward_calls() + mock.reverse_calls(), 1);
            assert_eq!(c.status(), SearchStatus::Idle);
        }
    }
}
