use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use geopin_api::{HeadlessMap, OsmRef};
use geopin_core::{normalize_value, query_key, LocationDescriptor, SearchResult};
use geopin_nominatim::{NominatimClient, NominatimConfig};
use geopin_persist::{MemoryStore, SqliteStore, Store};
use geopin_search::GeocodeCache;
use geopin_store::IconTemplate;
use geopin_widget::{AppMap, WidgetConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "geopinctl", version, about = "Geopin CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Cache database path
    #[arg(long = "db", env = "GEOPIN_DB_PATH", global = true)]
    db: Option<String>,

    /// Keep the cache in memory only
    #[arg(long = "no-cache", global = true)]
    no_cache: bool,

    /// Nominatim-compatible endpoint
    #[arg(long = "nominatim-url", env = "GEOPIN_NOMINATIM_URL", global = true)]
    nominatim_url: Option<String>,

    /// User agent sent to the geocoder
    #[arg(long = "user-agent", env = "GEOPIN_USER_AGENT", global = true)]
    user_agent: Option<String>,

    /// Quiet period before a request is sent
    #[arg(long = "debounce-ms", env = "GEOPIN_SEARCH_DEBOUNCE_MS", global = true)]
    debounce_ms: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Convert a decimal or DMS coordinate (JSON) into decimal degrees
    Normalize {
        /// e.g. 48.85 or '{"degrees":45,"minutes":30,"seconds":0,"direction":"S"}'
        value: String,
    },
    /// Forward search: free text to candidate places
    Search {
        query: String,
        /// Limit printed results
        #[arg(long = "limit", default_value_t = 10)]
        limit: usize,
    },
    /// Reverse search: coordinates to an address
    Reverse {
        #[arg(allow_hyphen_values = true)]
        lat: f64,
        #[arg(allow_hyphen_values = true)]
        lng: f64,
    },
    /// Reverse search by provider object (node, way or relation)
    ReverseRaw {
        osm_type: String,
        osm_id: u64,
    },
    /// List cached results whose key starts with the normalized prefix
    Cache {
        prefix: String,
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
    },
    /// Install a JSON list of locations on a headless map and print the markers
    Markers {
        /// e.g. '[{"lat":1,"lng":2,"text":"a"}]'; an empty list yields the implicit marker
        locations: String,
    },
}

fn init_tracing() {
    let env = std::env::var("GEOPIN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("GEOPIN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid GEOPIN_METRICS_ADDR; expected host:port");
        }
    }
}

impl Cli {
    fn open_store(&self) -> Result<Arc<dyn Store>> {
        if self.no_cache {
            return Ok(Arc::new(MemoryStore::new()));
        }
        let store = match self.db.as_deref() {
            Some(path) => SqliteStore::open(path)?,
            None => SqliteStore::open_default()?,
        };
        Ok(Arc::new(store))
    }

    fn widget_config(&self) -> WidgetConfig {
        let mut wcfg = WidgetConfig::from_env();
        if let Some(ms) = self.debounce_ms {
            wcfg.search_debounce = Duration::from_millis(ms);
        }
        wcfg
    }

    fn widget(&self, wcfg: WidgetConfig) -> Result<AppMap> {
        let mut ncfg = NominatimConfig::from_env();
        if let Some(url) = &self.nominatim_url {
            ncfg.base_url = url.clone();
        }
        if let Some(ua) = &self.user_agent {
            ncfg.user_agent = ua.clone();
        }
        let client = NominatimClient::new(ncfg).context("building geocoder client")?;
        Ok(AppMap::builder(Arc::new(client), self.open_store()?).config(wcfg).build())
    }
}

fn print_results(output: Output, results: &[SearchResult]) -> Result<()> {
    match output {
        Output::Human => {
            if results.is_empty() {
                println!("no results");
            }
            for r in results {
                println!("{:>10.5} {:>11.5}  {}", r.lat, r.lng, r.label);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(results)?),
    }
    Ok(())
}

/// Run one of the geocoding subcommands. A lookup failure is returned so the
/// process exits non-zero.
async fn geocode(command: &Commands, app: &AppMap, output: Output) -> Result<()> {
    match command {
        Commands::Search { query, limit } => {
            info!(query = %query, "search invoked");
            let mut results = app.search(query).await.with_context(|| format!("search {query:?} failed"))?;
            results.truncate(*limit);
            print_results(output, &results)
        }
        Commands::Reverse { lat, lng } => {
            info!(lat, lng, "reverse invoked");
            let r = app.reverse_search(*lat, *lng).await.with_context(|| format!("reverse {lat},{lng} failed"))?;
            print_results(output, std::slice::from_ref(&r))
        }
        Commands::ReverseRaw { osm_type, osm_id } => {
            info!(osm_type = %osm_type, osm_id, "reverse-raw invoked");
            let osm = OsmRef { osm_id: *osm_id, osm_type: osm_type.clone() };
            let r = app.reverse_raw(&osm).await.with_context(|| format!("reverse-raw {osm_type} {osm_id} failed"))?;
            print_results(output, std::slice::from_ref(&r))
        }
        other => anyhow::bail!("{other:?} is not a geocoding command"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Normalize { value } => {
            let raw: serde_json::Value = serde_json::from_str(value).context("value must be a number or a JSON object")?;
            let decimal = normalize_value(&raw)?;
            match cli.output {
                Output::Human => println!("{}", decimal),
                Output::Json => println!("{}", serde_json::json!({ "value": decimal })),
            }
        }
        Commands::Search { limit, .. } => {
            let mut wcfg = cli.widget_config();
            wcfg.cache_limit = *limit;
            geocode(&cli.command, &cli.widget(wcfg)?, cli.output).await?;
        }
        Commands::Reverse { .. } | Commands::ReverseRaw { .. } => {
            geocode(&cli.command, &cli.widget(cli.widget_config())?, cli.output).await?;
        }
        Commands::Cache { prefix, limit } => {
            let cache = GeocodeCache::new(cli.open_store()?);
            let key = query_key(prefix);
            let docs = cache.browse(&key, *limit)?;
            match cli.output {
                Output::Human => {
                    for d in &docs {
                        println!("{:<48}  {}", d.query_key, d.result.label);
                    }
                    println!("{} cached result(s) under {:?}", docs.len(), key);
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&docs)?),
            }
        }
        Commands::Markers { locations } => {
            let list: Vec<LocationDescriptor> = serde_json::from_str(locations).context("locations must be a JSON array")?;
            let app = AppMap::new(Arc::new(geopin_api::MockGeocoder::new()), Arc::new(MemoryStore::new()));
            let map = HeadlessMap::new();
            app.attach(Box::new(map.clone()), IconTemplate::place(32.0));
            let set = app.set_markers(Some(list))?;
            match cli.output {
                Output::Human => {
                    for h in &set.handles {
                        let label = h.label.as_deref().unwrap_or("-");
                        println!("#{} {:>10.5} {:>11.5}  {}  [{}]{}", h.slot, h.position.lat, h.position.lng, label, h.class_name, if h.draggable { " draggable" } else { "" });
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&*set)?),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use geopin_api::MockGeocoder;

    fn app(mock: MockGeocoder) -> AppMap {
        let app = AppMap::new(Arc::new(mock), Arc::new(MemoryStore::new()));
        app.attach(Box::new(HeadlessMap::new()), IconTemplate::place(32.0));
        app
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_failures_surface_as_errors() {
        let app = app(MockGeocoder::new().failing("connection refused"));
        let search = Commands::Search { query: "Lisbon".into(), limit: 5 };
        let err = geocode(&search, &app, Output::Json).await.unwrap_err();
        assert!(format!("{err:#}").contains("connection refused"));

        let reverse = Commands::Reverse { lat: 38.7, lng: -9.1 };
        assert!(geocode(&reverse, &app, Output::Json).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_object_fails_reverse_raw() {
        let app = app(MockGeocoder::new());
        let raw = Commands::ReverseRaw { osm_type: "node".into(), osm_id: 1 };
        assert!(geocode(&raw, &app, Output::Human).await.is_err());
        let reverse = Commands::Reverse { lat: 38.7, lng: -9.1 };
        assert!(geocode(&reverse, &app, Output::Human).await.is_ok());
    }
}
