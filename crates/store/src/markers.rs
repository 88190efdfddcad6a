//! Marker set derivation and the owned table of installed markers.
//!
//! Every recomputation replaces the whole set: the previous markers are
//! removed from the map before the new set is published, so no orphan
//! survives rapid changes. Handles are indexed by the slot of their
//! descriptor in the effective location list, not by library identity.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use geopin_api::{IconAnchor, IconSpec, MapBackend, MarkerId, MarkerSpec};
use geopin_core::{GeoResult, LatLng, LocationDescriptor};
use metrics::gauge;
use serde::Serialize;
use tracing::debug;

use crate::model::{IconTemplate, BASE_ICON_CLASS};

/// One installed marker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerHandle {
    /// Index of the descriptor in the effective location list.
    pub slot: usize,
    pub id: MarkerId,
    pub position: LatLng,
    pub label: Option<String>,
    pub class_name: String,
    pub draggable: bool,
}

/// A fully built marker set. `epoch` grows by one per replacement.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarkerSet {
    pub epoch: u64,
    pub handles: Vec<MarkerHandle>,
}

impl MarkerSet {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn by_marker(&self, id: MarkerId) -> Option<&MarkerHandle> {
        self.handles.iter().find(|h| h.id == id)
    }
}

/// Derive marker specs from the effective locations. `Ok(None)` means "not
/// yet computable": leave the installed set untouched.
pub fn compute_markers(
    locations: Option<&[LocationDescriptor]>,
    draggable: bool,
    map_ready: bool,
    icon: Option<&IconTemplate>,
    anchor: Option<IconAnchor>,
) -> GeoResult<Option<Vec<MarkerSpec>>> {
    let (Some(locations), true, Some(icon), Some(anchor)) = (locations, map_ready, icon, anchor) else {
        return Ok(None);
    };
    let mut out = Vec::with_capacity(locations.len());
    for loc in locations {
        let position = loc.latlng()?;
        let class_name = match loc.class_name.as_deref() {
            Some(extra) if !extra.is_empty() => format!("{} {}", BASE_ICON_CLASS, extra),
            _ => BASE_ICON_CLASS.to_string(),
        };
        // Library options win over the descriptor flag, which wins over the default.
        let draggable = loc
            .options
            .get("draggable")
            .and_then(serde_json::Value::as_bool)
            .or(loc.draggable)
            .unwrap_or(draggable);
        out.push(MarkerSpec {
            position,
            icon: IconSpec { class_name, html: icon.html.clone(), anchor },
            draggable,
            popup: loc.text.clone(),
            open_popup: true,
            options: loc.options.clone(),
        });
    }
    Ok(Some(out))
}

/// Cheap reader for the last published set.
#[derive(Clone)]
pub struct MarkerReader {
    published: Arc<ArcSwap<MarkerSet>>,
}

impl MarkerReader {
    pub fn current(&self) -> Arc<MarkerSet> {
        self.published.load_full()
    }
}

/// Owns the installed markers; the only writer of marker handles.
pub struct MarkerTable {
    current: Arc<MarkerSet>,
    published: Arc<ArcSwap<MarkerSet>>,
}

impl MarkerTable {
    pub fn new() -> Self {
        let current = Arc::new(MarkerSet::default());
        Self { published: Arc::new(ArcSwap::new(Arc::clone(&current))), current }
    }

    pub fn current(&self) -> Arc<MarkerSet> {
        Arc::clone(&self.current)
    }

    pub fn reader(&self) -> MarkerReader {
        MarkerReader { published: Arc::clone(&self.published) }
    }

    /// Remove every installed marker, then install `specs` as the new set.
    pub fn replace(&mut self, backend: &mut dyn MapBackend, specs: Vec<MarkerSpec>) -> Arc<MarkerSet> {
        for h in &self.current.handles {
            backend.remove_marker(h.id);
        }
        let handles: Vec<MarkerHandle> = specs
            .into_iter()
            .enumerate()
            .map(|(slot, spec)| {
                let id = backend.add_marker(&spec);
                MarkerHandle {
                    slot,
                    id,
                    position: spec.position,
                    label: spec.popup,
                    class_name: spec.icon.class_name,
                    draggable: spec.draggable,
                }
            })
            .collect();
        let next = Arc::new(MarkerSet { epoch: self.current.epoch + 1, handles });
        debug!(epoch = next.epoch, markers = next.len(), "markers replaced");
        gauge!("markers_installed", next.len() as f64);
        self.publish(next);
        self.current()
    }

    /// Remove every installed marker and publish an empty set.
    pub fn clear(&mut self, backend: &mut dyn MapBackend) -> Arc<MarkerSet> {
        self.replace(backend, Vec::new())
    }

    fn publish(&mut self, next: Arc<MarkerSet>) {
        self.published.store(Arc::clone(&next));
        self.current = next;
    }
}

impl Default for MarkerTable {
    fn default() -> Self {
        Self::new()
    }
}
