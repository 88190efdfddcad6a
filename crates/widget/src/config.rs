use std::time::Duration;

/// Timing and default knobs for one widget instance.
#[derive(Debug, Clone, PartialEq)]
pub struct WidgetConfig {
    /// Quiet period for autocomplete-as-you-type.
    pub autocomplete_debounce: Duration,
    /// Quiet period for submit, reverse and locate triggers.
    pub search_debounce: Duration,
    pub search_timeout: Duration,
    pub locate_timeout: Duration,
    pub default_zoom: f64,
    /// Most cached results a forward lookup returns.
    pub cache_limit: usize,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            autocomplete_debounce: Duration::from_millis(200),
            search_debounce: Duration::from_millis(500),
            search_timeout: Duration::from_millis(10_000),
            locate_timeout: Duration::from_millis(10_000),
            default_zoom: 12.0,
            cache_limit: 10,
        }
    }
}

impl WidgetConfig {
    /// Defaults overridden by `GEOPIN_*` environment variables; unparsable values are ignored.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            autocomplete_debounce: env_ms("GEOPIN_AUTOCOMPLETE_DEBOUNCE_MS").unwrap_or(d.autocomplete_debounce),
            search_debounce: env_ms("GEOPIN_SEARCH_DEBOUNCE_MS").unwrap_or(d.search_debounce),
            search_timeout: env_ms("GEOPIN_SEARCH_TIMEOUT_MS").unwrap_or(d.search_timeout),
            locate_timeout: env_ms("GEOPIN_LOCATE_TIMEOUT_MS").unwrap_or(d.locate_timeout),
            default_zoom: std::env::var("GEOPIN_DEFAULT_ZOOM")
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .filter(|z| z.is_finite())
                .unwrap_or(d.default_zoom),
            cache_limit: std::env::var("GEOPIN_CACHE_LIMIT")
                .ok()
                .and_then(|s| s.trim().parse::<usize>().ok())
                .unwrap_or(d.cache_limit),
        }
    }
}

fn env_ms(name: &str) -> Option<Duration> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<u64>().ok()).map(Duration::from_millis)
}
