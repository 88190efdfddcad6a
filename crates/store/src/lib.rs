//! Geopin map state: an explicit reactive container binding declarative
//! inputs (position, zoom, locations, dark mode) to an imperative map.
//!
//! Inputs are set through [`MapState`] setters, which only record what
//! changed; [`MapState::flush`] then runs the dependent rules once, in a
//! fixed order. Observers receive [`Notification`]s over a broadcast bus.

#![forbid(unsafe_code)]

use std::sync::Arc;

use geopin_core::SearchResult;
use tokio::sync::broadcast;

pub mod markers;
pub mod model;
pub mod sync;
pub mod theme;

pub use markers::{compute_markers, MarkerHandle, MarkerReader, MarkerSet, MarkerTable};
pub use model::{IconTemplate, MapInputs, NewMarker, ADDED_MARKER_CLASS, BASE_ICON_CLASS};
pub use sync::MapState;
pub use theme::DarkModeSource;

/// Outbound notifications observed by UI collaborators.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Full replacement of the installed marker set.
    MarkersChanged(Arc<MarkerSet>),
    /// Authoritative zoom read back from the map after a zoom ended.
    ZoomChanged(f64),
    SelectedChanged(SearchResult),
}

const BUS_CAPACITY: usize = 256;

/// Explicit subscriber list; a send with no receivers is not an error.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Notification>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, n: Notification) {
        let _ = self.tx.send(n);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
