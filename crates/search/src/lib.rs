//! Geopin geocode cache: a results cache in front of the rate-limited remote
//! geocoder. Results are stored as documents keyed by their `queryKey`;
//! two small index collections remember which results a forward query or a
//! reverse coordinate produced, so exact repeats never reach the network.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use geopin_core::{coord_key, query_key, SearchResult};
use geopin_persist::{Direction, Filter, Store};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const RESULTS: &str = "geocode_results";
pub const QUERIES: &str = "geocode_queries";
pub const REVERSE: &str = "geocode_reverse";

const DEFAULT_LIMIT: usize = 10;

/// Stored shape of a result: the result itself plus its derived key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedResult {
    #[serde(flatten)]
    pub result: SearchResult,
    #[serde(rename = "queryKey")]
    pub query_key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct QueryEntry {
    keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ReverseEntry {
    key: String,
}

#[derive(Clone)]
pub struct GeocodeCache {
    store: Arc<dyn Store>,
    limit: usize,
}

impl GeocodeCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, limit: DEFAULT_LIMIT }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Fetch a single result by its `queryKey`.
    pub fn get(&self, key: &str) -> Option<SearchResult> {
        match self.store.get(RESULTS, key) {
            Ok(Some(v)) => decode(v),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, key, "cache: read failed");
                None
            }
        }
    }

    /// Write a result back to the cache, returning its key.
    pub fn put(&self, result: &SearchResult) -> Result<String> {
        let key = result.query_key();
        let doc = CachedResult { result: result.clone(), query_key: key.clone() };
        self.store.set(RESULTS, &key, &serde_json::to_value(&doc)?)?;
        Ok(key)
    }

    /// Forward lookup: an exact repeat of a normalized query first, then any
    /// cached result whose key starts with the normalized query.
    pub fn lookup_forward(&self, query: &str) -> Vec<SearchResult> {
        let key = query_key(query);
        if key.is_empty() {
            return Vec::new();
        }
        let mut out = self.lookup_recorded_query(&key);
        if out.is_empty() {
            out = match self.store.prefix_search(RESULTS, "queryKey", &key, self.limit, Direction::Asc) {
                Ok(docs) => docs.into_iter().filter_map(|d| decode(d.data)).collect(),
                Err(e) => {
                    warn!(error = %e, key = %key, "cache: prefix search failed");
                    Vec::new()
                }
            };
            rank(query, &mut out);
        }
        if out.is_empty() {
            counter!("geocode_cache_miss_total", 1u64);
        } else {
            counter!("geocode_cache_hit_total", 1u64);
        }
        debug!(key = %key, hits = out.len(), "cache: forward lookup");
        out
    }

    fn lookup_recorded_query(&self, key: &str) -> Vec<SearchResult> {
        let entry = match self.store.get(QUERIES, key) {
            Ok(Some(v)) => serde_json::from_value::<QueryEntry>(v).unwrap_or_default(),
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(error = %e, key, "cache: query index read failed");
                return Vec::new();
            }
        };
        let out: Vec<SearchResult> = entry.keys.iter().filter_map(|k| self.get(k)).collect();
        // A partially evicted entry is treated as a miss.
        if out.len() == entry.keys.len() {
            out
        } else {
            Vec::new()
        }
    }

    /// Store every result of a forward search and remember the query.
    pub fn record_forward(&self, query: &str, results: &[SearchResult]) -> Result<()> {
        let mut keys = Vec::with_capacity(results.len());
        for r in results {
            keys.push(self.put(r)?);
        }
        let key = query_key(query);
        if !key.is_empty() && !keys.is_empty() {
            self.store.set(QUERIES, &key, &serde_json::to_value(QueryEntry { keys })?)?;
        }
        Ok(())
    }

    /// Reverse lookup by exact coordinate equality: first the requested
    /// coordinates, then results located exactly there.
    pub fn lookup_reverse(&self, lat: f64, lng: f64) -> Option<SearchResult> {
        let recorded = match self.store.get(REVERSE, &coord_key(lat, lng)) {
            Ok(Some(v)) => serde_json::from_value::<ReverseEntry>(v).ok().and_then(|e| self.get(&e.key)),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, lat, lng, "cache: reverse index read failed");
                None
            }
        };
        let hit = recorded.or_else(|| {
            match self.store.query(RESULTS, &[Filter::eq("lat", lat), Filter::eq("lng", lng)], 1, None) {
                Ok(docs) => docs.into_iter().find_map(|d| decode(d.data)),
                Err(e) => {
                    warn!(error = %e, lat, lng, "cache: reverse query failed");
                    None
                }
            }
        });
        if hit.is_some() {
            counter!("geocode_cache_hit_total", 1u64);
        } else {
            counter!("geocode_cache_miss_total", 1u64);
        }
        hit
    }

    pub fn record_reverse(&self, lat: f64, lng: f64, result: &SearchResult) -> Result<()> {
        let key = self.put(result)?;
        self.store.set(REVERSE, &coord_key(lat, lng), &serde_json::to_value(ReverseEntry { key })?)?;
        Ok(())
    }

    /// Cached results whose key starts with `prefix` (already normalized).
    pub fn browse(&self, prefix: &str, limit: usize) -> Result<Vec<CachedResult>> {
        let docs = self.store.prefix_search(RESULTS, "queryKey", prefix, limit, Direction::Asc)?;
        Ok(docs.into_iter().filter_map(|d| serde_json::from_value(d.data).ok()).collect())
    }
}

fn decode(v: serde_json::Value) -> Option<SearchResult> {
    match serde_json::from_value::<CachedResult>(v) {
        Ok(c) => Some(c.result),
        Err(e) => {
            warn!(error = %e, "cache: skipping undecodable document");
            None
        }
    }
}

/// Order cached candidates by fuzzy similarity to the raw query; ties keep
/// key order.
fn rank(query: &str, results: &mut [SearchResult]) {
    if results.len() < 2 {
        return;
    }
    let matcher = SkimMatcherV2::default();
    let needle = query.to_lowercase();
    let mut scored: Vec<(i64, usize)> = results
        .iter()
        .enumerate()
        .map(|(i, r)| (matcher.fuzzy_match(&r.label.to_lowercase(), &needle).unwrap_or(i64::MIN), i))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    let reordered: Vec<SearchResult> = scored.iter().map(|(_, i)| results[*i].clone()).collect();
    for (slot, r) in results.iter_mut().zip(reordered) {
        *slot = r;
    }
}
