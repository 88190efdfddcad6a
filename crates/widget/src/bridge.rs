//! Drag-end wiring between installed markers and reverse geocoding.

use std::collections::HashMap;

use geopin_api::MarkerId;
use geopin_store::MarkerSet;
use tracing::debug;

/// Per-marker drag-end listeners, rebuilt whenever the marker set is
/// replaced. Listeners are keyed by marker id, so re-attaching the same set
/// never registers a marker twice.
#[derive(Debug, Default)]
pub struct MarkerInteractionBridge {
    epoch: Option<u64>,
    listeners: HashMap<MarkerId, usize>,
    active: Option<usize>,
}

impl MarkerInteractionBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detach every listener and attach one per marker of `set`.
    /// Returns false when `set` is the one already wired.
    pub fn sync(&mut self, set: &MarkerSet) -> bool {
        if self.epoch == Some(set.epoch) {
            return false;
        }
        self.listeners.clear();
        for h in &set.handles {
            self.listeners.insert(h.id, h.slot);
        }
        if self.active.is_some_and(|slot| slot >= set.len()) {
            self.active = None;
        }
        self.epoch = Some(set.epoch);
        debug!(epoch = set.epoch, listeners = self.listeners.len(), "bridge: listeners attached");
        true
    }

    /// A marker finished dragging. Returns its slot and makes it active,
    /// or `None` for a marker from a superseded set.
    pub fn on_drag_end(&mut self, marker: MarkerId) -> Option<usize> {
        let Some(&slot) = self.listeners.get(&marker) else {
            debug!(marker, "bridge: drag end from a stale marker ignored");
            return None;
        };
        self.active = Some(slot);
        Some(slot)
    }

    pub fn active(&self) -> Option<usize> {
        self.active
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
