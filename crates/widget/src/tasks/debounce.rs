#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use geopin_core::{GeoError, GeoResult};
use tokio::sync::oneshot;

/// Named restartable timers. A new wait under a key cancels the pending one
/// under the same key; other keys are untouched.
pub struct Debouncer<K> {
    pending: Mutex<HashMap<K, (u64, oneshot::Sender<()>)>>,
    next: AtomicU64,
}

impl<K: Eq + Hash + Copy> Debouncer<K> {
    pub fn new() -> Self {
        Self { pending: Mutex::new(HashMap::new()), next: AtomicU64::new(1) }
    }

    /// Resolves after `quiet` unless superseded, in which case it fails
    /// with [`GeoError::SearchDebounced`].
    pub async fn wait(&self, key: K, quiet: Duration) -> GeoResult<()> {
        let gen = self.next.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        if let Some((_, prev)) = self.lock().insert(key, (gen, stop_tx)) {
            let _ = prev.send(());
        }
        let out = tokio::select! {
            _ = tokio::time::sleep(quiet) => Ok(()),
            _ = stop_rx => Err(GeoError::SearchDebounced),
        };
        let mut pending = self.lock();
        if pending.get(&key).is_some_and(|(g, _)| *g == gen) {
            pending.remove(&key);
        }
        out
    }

    #[cfg(test)]
    fn is_pending(&self, key: K) -> bool {
        self.lock().contains_key(&key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, (u64, oneshot::Sender<()>)>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<K: Eq + Hash + Copy> Default for Debouncer<K> {
    fn default() -> Self {
        Self::new()
    }
}
