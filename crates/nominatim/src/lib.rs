//! Geopin Nominatim integration.
//!
//! The free public instance allows at most one request per second and bans
//! clients repeating identical queries; callers are expected to sit behind
//! the geocode cache and the single-session search controller.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use geopin_api::{Geocoder, OsmRef, SearchParams};
use geopin_core::{Bounds, GeoError, GeoResult, SearchResult};
use reqwest::Url;
use serde_json::Value;
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_URL: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_USER_AGENT: &str = concat!("geopin/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct NominatimConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for NominatimConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl NominatimConfig {
    /// Defaults overridden by `GEOPIN_NOMINATIM_URL`, `GEOPIN_USER_AGENT`
    /// and `GEOPIN_SEARCH_TIMEOUT_MS`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(url) = std::env::var("GEOPIN_NOMINATIM_URL") {
            cfg.base_url = url;
        }
        if let Ok(ua) = std::env::var("GEOPIN_USER_AGENT") {
            cfg.user_agent = ua;
        }
        if let Some(ms) = std::env::var("GEOPIN_SEARCH_TIMEOUT_MS").ok().and_then(|s| s.parse::<u64>().ok()) {
            cfg.timeout = Duration::from_millis(ms);
        }
        cfg
    }
}

/// Single-letter object type expected by the reverse endpoint.
pub fn translate_osm_type(osm_type: &str) -> &'static str {
    match osm_type {
        "node" => "N",
        "way" => "W",
        "relation" => "R",
        _ => "",
    }
}

fn build_url(base: &str, path: &str, params: &SearchParams, fixed: &[(&str, String)]) -> Result<Url> {
    let mut merged: BTreeMap<&str, String> = params.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();
    merged.insert("format", "json".to_string());
    for (k, v) in fixed {
        merged.insert(*k, v.clone());
    }
    let url = format!("{}/{}", base.trim_end_matches('/'), path);
    Url::parse_with_params(&url, merged.iter()).with_context(|| format!("building url for {}", url))
}

pub fn endpoint(base: &str, query: &str, params: &SearchParams) -> Result<Url> {
    build_url(base, "search", params, &[("q", query.to_string())])
}

pub fn endpoint_reverse(base: &str, lat: f64, lng: f64, params: &SearchParams) -> Result<Url> {
    build_url(base, "reverse", params, &[("lat", lat.to_string()), ("lon", lng.to_string())])
}

pub fn endpoint_reverse_raw(base: &str, osm: &OsmRef, params: &SearchParams) -> Result<Url> {
    build_url(
        base,
        "reverse",
        params,
        &[("osm_id", osm.osm_id.to_string()), ("osm_type", translate_osm_type(&osm.osm_type).to_string())],
    )
}

fn float_field(raw: &Value, field: &str) -> GeoResult<f64> {
    let v = match raw.get(field) {
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(Value::Number(n)) => n.as_f64(),
        _ => None,
    };
    v.ok_or_else(|| GeoError::SearchFailed(format!("malformed response: bad or missing {}", field)))
}

/// Parse one provider record into a [`SearchResult`].
pub fn parse(raw: Value) -> GeoResult<SearchResult> {
    if let Some(err) = raw.get("error") {
        let msg = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
        return Err(GeoError::SearchFailed(msg));
    }
    let lat = float_field(&raw, "lat")?;
    let lng = float_field(&raw, "lon")?;
    let label = raw
        .get("display_name")
        .and_then(Value::as_str)
        .ok_or_else(|| GeoError::SearchFailed("malformed response: missing display_name".into()))?
        .to_string();
    let bb: Vec<f64> = match raw.get("boundingbox").and_then(Value::as_array) {
        Some(items) if items.len() == 4 => items
            .iter()
            .map(|v| match v {
                Value::String(s) => s.trim().parse::<f64>().ok(),
                Value::Number(n) => n.as_f64(),
                _ => None,
            })
            .collect::<Option<Vec<f64>>>()
            .ok_or_else(|| GeoError::SearchFailed("malformed response: bad boundingbox".into()))?,
        _ => return Err(GeoError::SearchFailed("malformed response: missing boundingbox".into())),
    };
    Ok(SearchResult { lat, lng, label, bounds: Bounds { s: bb[0], n: bb[1], w: bb[2], e: bb[3] }, raw })
}

pub struct NominatimClient {
    http: reqwest::Client,
    cfg: NominatimConfig,
}

impl NominatimClient {
    pub fn new(cfg: NominatimConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.timeout)
            .build()
            .context("building http client")?;
        Ok(Self { http, cfg })
    }

    pub fn config(&self) -> &NominatimConfig {
        &self.cfg
    }

    async fn fetch(&self, url: Url) -> GeoResult<Value> {
        debug!(url = %url, "nominatim: request");
        let resp = self.http.get(url).send().await.map_err(|e| {
            warn!(error = %e, "nominatim: request failed");
            GeoError::SearchFailed(e.to_string())
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(GeoError::SearchFailed(format!("nominatim returned status {}", status)));
        }
        let body = resp.text().await.map_err(|e| GeoError::SearchFailed(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| GeoError::SearchFailed(format!("failed to parse response: {}", e)))
    }

    fn url<F>(&self, f: F) -> GeoResult<Url>
    where
        F: FnOnce(&str) -> Result<Url>,
    {
        f(&self.cfg.base_url).map_err(|e| GeoError::SearchFailed(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Geocoder for NominatimClient {
    async fn search(&self, query: &str, params: &SearchParams) -> GeoResult<Vec<SearchResult>> {
        let t0 = Instant::now();
        let url = self.url(|base| endpoint(base, query, params))?;
        let body = self.fetch(url).await?;
        let items = match body {
            Value::Array(items) => items,
            other => return Err(GeoError::SearchFailed(format!("expected a list of places, got {}", other))),
        };
        let out = items.into_iter().map(parse).collect::<GeoResult<Vec<_>>>()?;
        info!(query = %query, results = out.len(), took_ms = %t0.elapsed().as_millis(), "nominatim: search ok");
        Ok(out)
    }

    async fn reverse(&self, lat: f64, lng: f64, params: &SearchParams) -> GeoResult<SearchResult> {
        let t0 = Instant::now();
        let url = self.url(|base| endpoint_reverse(base, lat, lng, params))?;
        let out = parse(self.fetch(url).await?)?;
        info!(lat, lng, label = %out.label, took_ms = %t0.elapsed().as_millis(), "nominatim: reverse ok");
        Ok(out)
    }

    async fn reverse_raw(&self, osm: &OsmRef, params: &SearchParams) -> GeoResult<SearchResult> {
        let t0 = Instant::now();
        let url = self.url(|base| endpoint_reverse_raw(base, osm, params))?;
        let out = parse(self.fetch(url).await?)?;
        info!(osm_id = osm.osm_id, osm_type = %osm.osm_type, took_ms = %t0.elapsed().as_millis(), "nominatim: reverse_raw ok");
        Ok(out)
    }
}
