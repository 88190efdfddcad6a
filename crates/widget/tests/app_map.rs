use std::sync::Arc;
use std::time::Duration;

use geopin_api::{HeadlessMap, LocationEvent, MapEvent, MockGeocoder};
use geopin_core::{Bounds, Coordinate, Dms, GeoError, LatLng, LocationDescriptor, SearchResult};
use geopin_persist::MemoryStore;
use geopin_store::{DarkModeSource, IconTemplate, NewMarker, Notification};
use geopin_widget::{AppMap, ToastKind, LOCATE_FAILED_MESSAGE};

fn place(label: &str, lat: f64, lng: f64) -> SearchResult {
    SearchResult {
        lat,
        lng,
        label: label.to_string(),
        bounds: Bounds { s: lat, n: lat, w: lng, e: lng },
        raw: serde_json::Value::Null,
    }
}

fn widget(mock: MockGeocoder) -> (HeadlessMap, AppMap) {
    let map = HeadlessMap::new();
    let app = AppMap::new(Arc::new(mock), Arc::new(MemoryStore::new()));
    app.attach(Box::new(map.clone()), IconTemplate::place(32.0));
    (map, app)
}

async fn until_locate_requested(map: &HeadlessMap) {
    while map.state().locate_requests.is_empty() {
        tokio::task::yield_now().await;
    }
}

#[test]
fn operations_before_attach_fail_with_map_not_ready() {
    let app = AppMap::new(Arc::new(MockGeocoder::new()), Arc::new(MemoryStore::new()));
    assert_eq!(app.add_marker(NewMarker::default()), Err(GeoError::MapNotReady));
    assert_eq!(app.center(), Err(GeoError::MapNotReady));
    assert!(app.markers().is_empty());
    // inputs are still accepted and applied once a map arrives
    app.set_position(Coordinate::Decimal(35.68), Coordinate::Decimal(139.69)).unwrap();
    let map = HeadlessMap::new();
    app.attach(Box::new(map.clone()), IconTemplate::place(32.0));
    assert_eq!(map.state().center, LatLng::new(35.68, 139.69));
    assert_eq!(app.markers().len(), 1);
}

#[tokio::test]
async fn device_location_before_attach_is_rejected() {
    let app = AppMap::new(Arc::new(MockGeocoder::new()), Arc::new(MemoryStore::new()));
    assert_eq!(app.get_device_location().await, Err(GeoError::MapNotReady));
}

#[test]
fn set_markers_replaces_whole_set() {
    let (map, app) = widget(MockGeocoder::new());
    assert_eq!(map.marker_count(), 1);
    let many: Vec<_> = (0..4).map(|i| LocationDescriptor::at(10.0 + i as f64, 20.0)).collect();
    assert_eq!(app.set_markers(Some(many)).unwrap().len(), 4);
    assert_eq!(map.marker_count(), 4);
    let set = app.set_markers(Some(vec![LocationDescriptor::at(1.0, 1.0)])).unwrap();
    assert_eq!(set.len(), 1);
    assert_eq!(map.marker_count(), 1);
    assert_eq!(app.set_markers(None).unwrap().len(), 1);
}

#[test]
fn malformed_coordinate_leaves_map_untouched() {
    let (map, app) = widget(MockGeocoder::new());
    let before = map.markers();
    let no_direction = Dms { direction: None, ..Dms::new(12.0, 0.0, 0.0, "N") };
    let err = app.set_lat(Coordinate::Dms(no_direction)).unwrap_err();
    assert!(matches!(err, GeoError::InvalidCoordinateFormat(_)));
    assert_eq!(map.markers(), before);
    assert_eq!(app.position().lat, 0.0);
    assert!(app.resolve_position(&Coordinate::Dms(Dms::new(45.0, 30.0, 0.0, "S"))).unwrap() == -45.5);
}

#[test]
fn user_zoom_is_published_once() {
    let (map, app) = widget(MockGeocoder::new());
    let mut rx = app.subscribe();
    map.user_zoom(16.0);
    app.handle_map_event(MapEvent::ZoomEnd);
    assert!(matches!(rx.try_recv(), Ok(Notification::ZoomChanged(z)) if z == 16.0));
    assert!(rx.try_recv().is_err());
    assert_eq!(app.zoom(), 16.0);
}

#[test]
fn dark_mode_provider_follows_attach_lifecycle() {
    let source = Arc::new(DarkModeSource::new(true));
    let app = AppMap::builder(Arc::new(MockGeocoder::new()), Arc::new(MemoryStore::new()))
        .dark_mode(source.clone())
        .build();
    let map = HeadlessMap::new();
    app.attach(Box::new(map.clone()), IconTemplate::place(32.0));
    assert_eq!(map.state().filter.len(), 2);
    assert_eq!(source.subscribers(), 1);

    source.set(false);
    app.set_scale(true); // any input change flushes
    assert!(map.state().filter.is_empty());

    app.detach();
    assert_eq!(source.subscribers(), 0);
    assert!(!app.is_ready());
}

#[tokio::test]
async fn device_location_found_moves_the_model() {
    let (map, app) = widget(MockGeocoder::new());
    let event = LocationEvent { latlng: LatLng::new(59.33, 18.07), accuracy: Some(12.0), ..LocationEvent::default() };
    let reporter = async {
        until_locate_requested(&map).await;
        app.handle_map_event(MapEvent::LocationFound(event.clone()));
    };
    let (found, ()) = tokio::join!(app.get_device_location(), reporter);
    assert_eq!(found.unwrap(), event);
    assert_eq!(app.position().latlng(), LatLng::new(59.33, 18.07));
    assert_eq!(map.state().center, LatLng::new(59.33, 18.07));
    assert!(map.state().locate_requests[0].enable_high_accuracy);
}

#[tokio::test]
async fn permission_denied_maps_to_denied() {
    let (map, app) = widget(MockGeocoder::new());
    let reporter = async {
        until_locate_requested(&map).await;
        app.handle_map_event(MapEvent::LocationError { code: 1, message: "User denied Geolocation".into() });
    };
    let (res, ()) = tokio::join!(app.get_device_location(), reporter);
    assert_eq!(res, Err(GeoError::GeolocationDenied("User denied Geolocation".into())));
}

#[tokio::test(start_paused = true)]
async fn locate_without_answer_times_out_with_warning() {
    let (_map, app) = widget(MockGeocoder::new());
    let err = app.locate_and_label().await.unwrap_err();
    assert_eq!(err, GeoError::GeolocationFailed("timed out".into()));
    let toasts = app.toasts().drain();
    assert_eq!(toasts.len(), 1);
    assert_eq!(toasts[0].text, LOCATE_FAILED_MESSAGE);
    assert_eq!(toasts[0].kind, ToastKind::Warn);
}

#[tokio::test(start_paused = true)]
async fn locate_and_label_names_the_position() {
    let mock = MockGeocoder::new().with_reverse(place("Gamla stan, Stockholm", 59.325, 18.07));
    let (map, app) = widget(mock);
    let reporter = async {
        until_locate_requested(&map).await;
        app.handle_map_event(MapEvent::LocationFound(LocationEvent {
            latlng: LatLng::new(59.3251, 18.0711),
            ..LocationEvent::default()
        }));
    };
    let (res, ()) = tokio::join!(app.locate_and_label(), reporter);
    assert_eq!(res.unwrap().label, "Gamla stan, Stockholm");
    assert_eq!(app.label().as_deref(), Some("Gamla stan, Stockholm"));
    let markers = map.markers();
    assert_eq!(markers[0].1.position, LatLng::new(59.3251, 18.0711));
    assert_eq!(markers[0].1.popup.as_deref(), Some("Gamla stan, Stockholm"));
}

#[tokio::test(start_paused = true)]
async fn dragging_a_marker_relabels_it() {
    let mock = MockGeocoder::new().with_reverse(place("Piazza Navona, Roma", 41.899, 12.473));
    let (map, app) = widget(mock);
    app.set_draggable(true);
    let set = app
        .set_markers(Some(vec![
            LocationDescriptor::at(41.9, 12.5).with_text("start"),
            LocationDescriptor::at(41.8, 12.4).with_text("other"),
        ]))
        .unwrap();
    let dragged = set.handles[0].id;
    let to = LatLng::new(41.899, 12.4731);

    let task = app
        .handle_map_event(MapEvent::MarkerDragEnd { marker: dragged, latlng: to })
        .expect("known marker starts a lookup");
    task.await.unwrap();

    assert_eq!(app.active_marker(), Some(0));
    let markers = map.markers();
    assert_eq!(markers.len(), 2);
    assert_eq!(markers[0].1.position, to);
    assert_eq!(markers[0].1.popup.as_deref(), Some("Piazza Navona, Roma"));
    assert_eq!(markers[1].1.popup.as_deref(), Some("other"));

    // ids of the replaced set are stale now
    assert!(app.handle_map_event(MapEvent::MarkerDragEnd { marker: dragged, latlng: to }).is_none());
}

#[tokio::test(start_paused = true)]
async fn failed_search_warns_and_debounce_stays_silent() {
    let (_map, app) = widget(MockGeocoder::new().failing("connection refused"));
    let first = app.autocomplete("Vien");
    let second = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        app.autocomplete("Vienna").await
    };
    let (a, b) = tokio::join!(first, second);
    assert_eq!(a, Err(GeoError::SearchDebounced));
    assert!(matches!(b, Err(GeoError::SearchFailed(_))));
    let toasts = app.toasts().drain();
    assert_eq!(toasts.len(), 1);
    assert!(toasts[0].text.contains("connection refused"));
}

#[tokio::test(start_paused = true)]
async fn selecting_a_suggestion_centers_and_labels() {
    let oslo = place("Oslo, Norway", 59.91, 10.75);
    let (map, app) = widget(MockGeocoder::new().with_forward("Oslo", vec![oslo.clone()]));
    let mut rx = app.subscribe();
    let hits = app.search("Oslo").await.unwrap();
    app.select(hits[0].clone()).unwrap();

    assert_eq!(app.session().selected, Some(oslo.clone()));
    assert_eq!(map.state().center, LatLng::new(59.91, 10.75));
    assert_eq!(map.markers()[0].1.popup.as_deref(), Some("Oslo, Norway"));
    let selected = std::iter::from_fn(|| rx.try_recv().ok())
        .any(|n| matches!(n, Notification::SelectedChanged(r) if r == oslo));
    assert!(selected);
}

#[test]
fn added_marker_lands_at_center_after_implicit_one() {
    let (map, app) = widget(MockGeocoder::new());
    app.set_position(Coordinate::Decimal(1.0), Coordinate::Decimal(2.0)).unwrap();
    map.pan_to(LatLng::new(3.0, 4.0));
    app.add_marker(NewMarker { text: Some("pin".into()), ..NewMarker::default() }).unwrap();
    let markers = map.markers();
    assert_eq!(markers.len(), 2);
    assert_eq!(markers[0].1.position, LatLng::new(1.0, 2.0));
    assert_eq!(markers[1].1.position, LatLng::new(3.0, 4.0));
    assert!(markers[1].1.icon.class_name.ends_with("added-marker-icon"));
}

fn two_pins(app: &AppMap) -> u64 {
    app.set_draggable(true);
    let set = app
        .set_markers(Some(vec![
            LocationDescriptor::at(10.0, 10.0).with_text("first"),
            LocationDescriptor::at(20.0, 20.0).with_text("second"),
        ]))
        .unwrap();
    set.handles[0].id
}

#[tokio::test(start_paused = true)]
async fn drag_label_is_dropped_when_the_list_is_replaced_meanwhile() {
    let (map, app) = widget(MockGeocoder::new().with_reverse(place("Somewhere else", 50.0, 50.0)));
    let dragged = two_pins(&app);
    let task = app
        .handle_map_event(MapEvent::MarkerDragEnd { marker: dragged, latlng: LatLng::new(50.0, 50.0) })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    app.set_markers(Some(vec![LocationDescriptor::at(-30.0, -30.0).with_text("unrelated")])).unwrap();
    task.await.unwrap();

    let markers = map.markers();
    assert_eq!(markers.len(), 1);
    assert_eq!(markers[0].1.position, LatLng::new(-30.0, -30.0));
    assert_eq!(markers[0].1.popup.as_deref(), Some("unrelated"));
}

#[tokio::test(start_paused = true)]
async fn dragged_pin_stays_put_while_its_label_is_looked_up() {
    let (map, app) = widget(MockGeocoder::new().with_reverse(place("Dropped here", 50.0, 50.0)));
    let dragged = two_pins(&app);
    let to = LatLng::new(50.0, 50.0);
    let task = app.handle_map_event(MapEvent::MarkerDragEnd { marker: dragged, latlng: to }).unwrap();

    // position is committed before the lookup returns
    assert_eq!(map.markers()[0].1.position, to);
    assert_eq!(map.markers()[0].1.popup.as_deref(), Some("first"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    app.set_draggable(true);
    app.set_scale(true);
    assert_eq!(map.markers()[0].1.position, to);

    task.await.unwrap();
    let markers = map.markers();
    assert_eq!(markers[0].1.position, to);
    assert_eq!(markers[0].1.popup.as_deref(), Some("Dropped here"));
    assert_eq!(markers[1].1.popup.as_deref(), Some("second"));
}

#[tokio::test(start_paused = true)]
async fn reverse_raw_moves_to_the_object_and_forwards_params() {
    let bridge = place("Tower Bridge, London", 51.5055, -0.0754);
    let mock = Arc::new(MockGeocoder::new().with_reverse(bridge.clone()));
    let params: geopin_api::SearchParams = [("accept-language".to_string(), "en".to_string())].into_iter().collect();
    let app = AppMap::builder(mock.clone(), Arc::new(MemoryStore::new())).params(params.clone()).build();
    let map = HeadlessMap::new();
    app.attach(Box::new(map.clone()), IconTemplate::place(32.0));

    let osm = geopin_api::OsmRef { osm_id: 2926969, osm_type: "way".into() };
    assert_eq!(app.reverse_raw(&osm).await.unwrap(), bridge);
    assert_eq!(map.state().center, LatLng::new(51.5055, -0.0754));
    assert_eq!(app.label().as_deref(), Some("Tower Bridge, London"));
    assert_eq!(mock.seen_params(), vec![params]);
}
