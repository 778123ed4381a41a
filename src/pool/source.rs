//! Route list loading
//!
//! Two list formats are understood:
//! - text: one `host:port` or `scheme://[user:pass@]host:port` per line, `#` comments.
//!   Bare `host:port` lines take their protocol from the list name.
//! - JSON: an array (or an object with a `proxies`/`working` array) of entries with
//!   `ip`/`host`/`address`, `port`, `type`/`protocol`, and optional country,
//!   latency and score metadata.
//!
//! Loading is a one-time pool fill, never part of a collection's hot path.

use super::{ProtocolKind, Route};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Timeout for fetching a remote route list
const LIST_FETCH_TIMEOUT_SECS: u64 = 30;

/// Source of route lists
#[async_trait]
pub trait RouteSource: Send + Sync {
    /// Load all routes published under `source_name`
    async fn load_routes(&self, source_name: &str) -> Result<Vec<Route>>;
}

/// Route lists stored as files under a directory
///
/// `load_routes("socks5.txt")` reads `<dir>/socks5.txt`; files ending in `.json`
/// are parsed as JSON lists.
#[derive(Clone, Debug)]
pub struct FileRouteSource {
    dir: PathBuf,
}

impl FileRouteSource {
    /// Read lists relative to `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl RouteSource for FileRouteSource {
    async fn load_routes(&self, source_name: &str) -> Result<Vec<Route>> {
        let path = self.dir.join(source_name);
        let content = tokio::fs::read_to_string(&path).await?;

        let routes = if source_name.ends_with(".json") {
            parse_json_routes(&content)?
        } else {
            parse_text_routes(&content, ProtocolKind::infer(source_name))
        };

        tracing::info!(
            source = %path.display(),
            count = routes.len(),
            "loaded routes from file"
        );
        Ok(routes)
    }
}

/// Route lists published over HTTP(S)
///
/// Lists are registered by name; a name or URL path ending in `json` selects the
/// JSON format.
pub struct HttpRouteSource {
    client: reqwest::Client,
    sources: HashMap<String, String>,
}

impl HttpRouteSource {
    /// Create a source with no registered lists
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(LIST_FETCH_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            sources: HashMap::new(),
        })
    }

    /// Register a named list URL
    pub fn with_source(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.sources.insert(name.into(), url.into());
        self
    }

    /// Registered list names
    pub fn source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sources.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl RouteSource for HttpRouteSource {
    async fn load_routes(&self, source_name: &str) -> Result<Vec<Route>> {
        let url = self
            .sources
            .get(source_name)
            .ok_or_else(|| Error::NotFound(format!("route source '{}'", source_name)))?;

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Other(format!(
                "route list '{}' returned HTTP {}",
                source_name,
                status.as_u16()
            )));
        }
        let content = response.text().await?;

        let is_json = source_name.ends_with("json") || url.ends_with(".json");
        let routes = if is_json {
            parse_json_routes(&content)?
        } else {
            parse_text_routes(&content, ProtocolKind::infer(source_name))
        };

        tracing::info!(
            source = source_name,
            count = routes.len(),
            "loaded routes from url"
        );
        Ok(routes)
    }
}

/// Parse a text route list; malformed lines are skipped
pub fn parse_text_routes(content: &str, default_protocol: ProtocolKind) -> Vec<Route> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| parse_route_line(line, default_protocol))
        .collect()
}

fn parse_route_line(line: &str, default_protocol: ProtocolKind) -> Option<Route> {
    if line.contains("://") {
        let url = url::Url::parse(line).ok()?;
        let host = url.host_str()?;
        // `port()` is None for a scheme's default port, even when written out
        let port = url.port_or_known_default()?;
        let protocol = match url.scheme() {
            "http" => ProtocolKind::Http,
            "https" => ProtocolKind::Https,
            "socks4" | "socks4a" => ProtocolKind::Socks4,
            "socks5" | "socks5h" => ProtocolKind::Socks5,
            _ => default_protocol,
        };
        let mut route = Route::new(host, port, protocol);
        if !url.username().is_empty() {
            route = route.with_credentials(url.username(), url.password().unwrap_or_default());
        }
        Some(route)
    } else {
        let (host, port) = line.rsplit_once(':')?;
        let port: u16 = port.trim().parse().ok()?;
        if host.is_empty() || port == 0 {
            return None;
        }
        Some(Route::new(host, port, default_protocol))
    }
}

/// Parse a JSON route list with metadata; entries without host or port are skipped
///
/// # Errors
/// Returns error if `content` is not JSON at all
pub fn parse_json_routes(content: &str) -> Result<Vec<Route>> {
    let data: Value = serde_json::from_str(content)?;
    let entries = match &data {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map
            .get("proxies")
            .or_else(|| map.get("working"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default(),
        _ => &[],
    };

    Ok(entries.iter().filter_map(parse_json_entry).collect())
}

fn parse_json_entry(item: &Value) -> Option<Route> {
    let host = first_str(item, &["ip", "host", "address"])?;
    let port = match item.get("port")? {
        Value::Number(n) => u16::try_from(n.as_u64()?).ok()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    if port == 0 {
        return None;
    }

    let protocol = first_str(item, &["type", "protocol"])
        .map(ProtocolKind::infer)
        .unwrap_or(ProtocolKind::Socks5);

    let mut route = Route::new(host, port, protocol);
    route.country = first_str(item, &["country", "country_name"]).map(str::to_string);
    route.country_code =
        first_str(item, &["country_code", "cc"]).map(|code| code.to_ascii_uppercase());
    route.latency_ms = first_f64(item, &["latency", "response_time"]);
    route.score = first_f64(item, &["score", "hunt_score"]);
    if let (Some(user), Some(pass)) = (
        first_str(item, &["username", "user"]),
        first_str(item, &["password", "pass"]),
    ) {
        route = route.with_credentials(user, pass);
    }
    Some(route)
}

fn first_str<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| item.get(*key).and_then(Value::as_str))
        .find(|value| !value.is_empty())
}

fn first_f64(item: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| item.get(*key).and_then(Value::as_f64))
}
