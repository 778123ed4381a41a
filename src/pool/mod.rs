//! Egress route pool with health tracking
//!
//! Routes (outbound proxies) are selected by a weighted random draw over their
//! Laplace-smoothed success rate, biased toward routes that have been idle for a
//! while. Outcomes reported by collection sessions move routes between
//! `Active`, `Quarantined` and `Dead`.
//!
//! Each route sits behind its own mutex; the outer lock only guards the list
//! itself, so concurrent sessions reporting outcomes for different routes never
//! contend with each other.

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

pub mod source;

pub use source::{FileRouteSource, HttpRouteSource, RouteSource};

/// Lifetime failures a route needs before it can be declared dead
const DEATH_MIN_FAILURES: u64 = 3;

/// Success rate under which a failing route is declared dead
const DEATH_SUCCESS_RATE: f64 = 0.20;

/// Consecutive failures that take a route out of rotation
const QUARANTINE_CONSECUTIVE_FAILURES: u32 = 3;

/// Minimum selection weight so unproven routes still get explored
const MIN_WEIGHT: f64 = 0.05;

/// Proxy protocol of a route
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// Plain HTTP proxy
    Http,
    /// HTTP proxy reached over TLS
    Https,
    /// SOCKS4 proxy
    Socks4,
    /// SOCKS5 proxy
    Socks5,
}

impl ProtocolKind {
    /// URL scheme for this protocol
    pub fn scheme(&self) -> &'static str {
        match self {
            ProtocolKind::Http => "http",
            ProtocolKind::Https => "https",
            ProtocolKind::Socks4 => "socks4",
            ProtocolKind::Socks5 => "socks5",
        }
    }

    /// Infer a protocol from a free-form label such as a list name or a `type` field
    ///
    /// Anything that does not mention socks5, socks4 or https is treated as http.
    pub fn infer(label: &str) -> Self {
        let label = label.to_ascii_lowercase();
        if label.contains("socks5") {
            ProtocolKind::Socks5
        } else if label.contains("socks4") {
            ProtocolKind::Socks4
        } else if label.contains("https") {
            ProtocolKind::Https
        } else {
            ProtocolKind::Http
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Health state of a route
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum RouteState {
    /// Selectable
    Active,
    /// Temporarily out of rotation
    Quarantined {
        /// When the route becomes selectable again
        until: DateTime<Utc>,
    },
    /// Permanently excluded; kept for audit
    Dead,
}

/// Outcome of one attempt over a route, reported by a collection session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The request went through
    Success,
    /// Transport failure attributable to the route
    Failure,
    /// The remote throttled the request
    Throttled,
}

/// One egress route
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Stable identifier (`host:port`)
    pub route_id: String,
    /// Proxy host
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Proxy protocol
    pub protocol: ProtocolKind,
    /// Country name, if known
    pub country: Option<String>,
    /// ISO country code, if known
    pub country_code: Option<String>,
    /// Proxy username
    pub username: Option<String>,
    /// Proxy password
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// Measured latency reported by the list publisher
    pub latency_ms: Option<f64>,
    /// Quality score reported by the list publisher
    pub score: Option<f64>,
    /// Successful attempts
    pub success_count: u64,
    /// Failed attempts
    pub failure_count: u64,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Last time the route was handed to a session
    pub last_used_at: Option<DateTime<Utc>>,
    /// Health state
    pub state: RouteState,
    /// Times the route was handed to a session
    #[serde(skip)]
    selections: u64,
    /// Selection during which the route was last throttled
    #[serde(skip)]
    throttled_in_selection: Option<u64>,
}

impl Route {
    /// Create an active route with no history
    pub fn new(host: impl Into<String>, port: u16, protocol: ProtocolKind) -> Self {
        let host = host.into();
        Self {
            route_id: format!("{}:{}", host, port),
            host,
            port,
            protocol,
            country: None,
            country_code: None,
            username: None,
            password: None,
            latency_ms: None,
            score: None,
            success_count: 0,
            failure_count: 0,
            consecutive_failures: 0,
            last_used_at: None,
            state: RouteState::Active,
            selections: 0,
            throttled_in_selection: None,
        }
    }

    /// Set the ISO country code
    pub fn with_country(mut self, code: impl Into<String>) -> Self {
        self.country_code = Some(code.into().to_ascii_uppercase());
        self
    }

    /// Set proxy credentials
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Proxy URL (`scheme://[user:pass@]host:port`)
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}://{}:{}@{}:{}",
                self.protocol.scheme(),
                user,
                pass,
                self.host,
                self.port
            ),
            _ => format!("{}://{}:{}", self.protocol.scheme(), self.host, self.port),
        }
    }

    /// Lifetime success rate (1.0 before any attempt)
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    /// Whether the route may be handed out right now
    pub fn is_selectable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            RouteState::Active => true,
            RouteState::Quarantined { until } => until <= now,
            RouteState::Dead => false,
        }
    }
}

/// Selection constraints for [`RoutePool::select_route`]
#[derive(Clone, Debug, Default)]
pub struct RouteFilter {
    /// Acceptable protocols (empty = any)
    pub protocols: Vec<ProtocolKind>,
    /// Acceptable country codes (empty = any)
    pub countries: Vec<String>,
    /// Routes to avoid, e.g. the one a session is rotating away from
    pub exclude: HashSet<String>,
}

impl RouteFilter {
    /// Filter built from the configured preferences
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            protocols: config.preferred_protocols.clone(),
            countries: config.preferred_countries.clone(),
            exclude: HashSet::new(),
        }
    }

    /// Same preferences, avoiding `route_id`
    pub fn excluding(&self, route_id: &str) -> Self {
        let mut filter = self.clone();
        filter.exclude.insert(route_id.to_string());
        filter
    }

    fn matches_preferences(&self, route: &Route) -> bool {
        let protocol_ok = self.protocols.is_empty() || self.protocols.contains(&route.protocol);
        let country_ok = self.countries.is_empty()
            || route.country_code.as_deref().is_some_and(|code| {
                self.countries
                    .iter()
                    .any(|wanted| wanted.eq_ignore_ascii_case(code))
            });
        protocol_ok && country_ok
    }
}

/// Pool-wide counters for reporting
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// All routes, including dead ones
    pub total: usize,
    /// Selectable routes
    pub active: usize,
    /// Routes sitting out a quarantine
    pub quarantined: usize,
    /// Dead routes
    pub dead: usize,
    /// Route count per protocol
    pub by_protocol: HashMap<ProtocolKind, usize>,
    /// Route count per country code
    pub by_country: HashMap<String, usize>,
    /// Mean success rate over routes that have been tried
    pub avg_success_rate: f64,
}

type RouteSlot = Arc<Mutex<Route>>;

/// Shared pool of egress routes
pub struct RoutePool {
    routes: RwLock<Vec<RouteSlot>>,
    config: PoolConfig,
}

impl RoutePool {
    /// Create an empty pool
    pub fn new(config: PoolConfig) -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            config,
        }
    }

    /// Configured selection preferences
    pub fn default_filter(&self) -> RouteFilter {
        RouteFilter::from_config(&self.config)
    }

    /// Add routes, merging duplicates by `host:port`
    ///
    /// A duplicate keeps its health history; missing country metadata is filled
    /// in from the newcomer. Returns the number of routes that were new.
    pub async fn add_routes(&self, incoming: Vec<Route>) -> usize {
        let mut routes = self.routes.write().await;

        let mut index: HashMap<String, RouteSlot> = HashMap::with_capacity(routes.len());
        for slot in routes.iter() {
            let id = slot.lock().await.route_id.clone();
            index.insert(id, Arc::clone(slot));
        }

        let mut added = 0;
        for route in incoming {
            match index.get(&route.route_id) {
                Some(existing) => {
                    let mut existing = existing.lock().await;
                    if existing.country_code.is_none() && route.country_code.is_some() {
                        existing.country = route.country;
                        existing.country_code = route.country_code;
                    }
                    if existing.latency_ms.is_none() {
                        existing.latency_ms = route.latency_ms;
                    }
                    if existing.score.is_none() {
                        existing.score = route.score;
                    }
                }
                None => {
                    let slot = Arc::new(Mutex::new(route.clone()));
                    index.insert(route.route_id, Arc::clone(&slot));
                    routes.push(slot);
                    added += 1;
                }
            }
        }

        tracing::debug!(added, total = routes.len(), "routes added to pool");
        added
    }

    /// Number of routes in the pool, dead ones included
    pub async fn len(&self) -> usize {
        self.routes.read().await.len()
    }

    /// Whether the pool holds no routes at all
    pub async fn is_empty(&self) -> bool {
        self.routes.read().await.is_empty()
    }

    /// Snapshot of one route
    pub async fn get(&self, route_id: &str) -> Option<Route> {
        let routes = self.routes.read().await;
        for slot in routes.iter() {
            let route = slot.lock().await;
            if route.route_id == route_id {
                return Some(route.clone());
            }
        }
        None
    }

    /// Pick a route for the next connection attempt
    ///
    /// Candidates are the selectable routes matching `filter`. When none match,
    /// preferences are dropped (but exclusions kept), then exclusions are dropped
    /// too. Dead routes are never returned; when nothing is left the result is
    /// `Error::PoolExhausted`.
    pub async fn select_route(&self, filter: &RouteFilter) -> Result<Route> {
        loop {
            let routes = self.routes.read().await;
            let now = Utc::now();

            let mut usable = Vec::with_capacity(routes.len());
            for slot in routes.iter() {
                let route = slot.lock().await;
                if route.is_selectable(now) {
                    usable.push((Arc::clone(slot), route.clone()));
                }
            }

            let not_excluded = |r: &Route| !filter.exclude.contains(&r.route_id);
            let mut candidates: Vec<_> = usable
                .iter()
                .filter(|(_, r)| not_excluded(r) && filter.matches_preferences(r))
                .cloned()
                .collect();
            if candidates.is_empty() {
                candidates = usable
                    .iter()
                    .filter(|(_, r)| not_excluded(r))
                    .cloned()
                    .collect();
            }
            if candidates.is_empty() {
                candidates = usable;
            }
            if candidates.is_empty() {
                return Err(Error::PoolExhausted(format!(
                    "no usable route among {} routes",
                    routes.len()
                )));
            }

            let weights: Vec<f64> = candidates
                .iter()
                .map(|(_, r)| self.weight(r, now))
                .collect();
            let lru = candidates
                .iter()
                .map(|(_, r)| r.last_used_at)
                .collect::<Vec<_>>();
            let chosen = pick_index(&weights, &lru);

            let mut route = candidates[chosen].0.lock().await;
            // A concurrent report may have retired it since the snapshot
            if !route.is_selectable(now) {
                continue;
            }
            if matches!(route.state, RouteState::Quarantined { .. }) {
                tracing::info!(route = %route.route_id, "route released from quarantine");
                route.state = RouteState::Active;
                route.consecutive_failures = 0;
            }
            route.last_used_at = Some(now);
            route.selections += 1;
            return Ok(route.clone());
        }
    }

    /// Record the outcome of an attempt and recompute the route's state
    ///
    /// Returns the new state when it changed.
    pub async fn report_outcome(
        &self,
        route_id: &str,
        outcome: RouteOutcome,
    ) -> Result<Option<RouteState>> {
        let slot = self
            .find_slot(route_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("route {}", route_id)))?;
        let mut route = slot.lock().await;
        let before = route.state;

        match outcome {
            RouteOutcome::Success => {
                route.success_count += 1;
                route.consecutive_failures = 0;
                route.throttled_in_selection = None;
            }
            RouteOutcome::Failure => {
                route.failure_count += 1;
                route.consecutive_failures += 1;
            }
            RouteOutcome::Throttled => {
                // Soft failure: only counts once the throttling outlived a rotation
                // away from this route and back
                let current = route.selections;
                if route
                    .throttled_in_selection
                    .is_some_and(|earlier| earlier < current)
                {
                    route.consecutive_failures += 1;
                }
                route.throttled_in_selection = Some(current);
            }
        }

        if route.state != RouteState::Dead {
            if route.failure_count >= DEATH_MIN_FAILURES
                && route.success_rate() < DEATH_SUCCESS_RATE
            {
                route.state = RouteState::Dead;
                tracing::warn!(
                    route = %route.route_id,
                    failures = route.failure_count,
                    success_rate = route.success_rate(),
                    "route declared dead"
                );
            } else if route.consecutive_failures >= QUARANTINE_CONSECUTIVE_FAILURES
                && route.state == RouteState::Active
            {
                let period = chrono::Duration::from_std(self.config.quarantine_period)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60));
                let until = Utc::now() + period;
                route.state = RouteState::Quarantined { until };
                tracing::warn!(
                    route = %route.route_id,
                    consecutive_failures = route.consecutive_failures,
                    until = %until,
                    "route quarantined"
                );
            }
        }

        Ok((route.state != before).then_some(route.state))
    }

    /// Pool-wide counters
    pub async fn stats(&self) -> PoolStats {
        let routes = self.routes.read().await;
        let now = Utc::now();
        let mut stats = PoolStats {
            total: routes.len(),
            ..PoolStats::default()
        };

        let mut rate_sum = 0.0;
        let mut tried = 0usize;
        for slot in routes.iter() {
            let route = slot.lock().await;
            match route.state {
                RouteState::Dead => stats.dead += 1,
                RouteState::Quarantined { until } if until > now => stats.quarantined += 1,
                _ => stats.active += 1,
            }
            *stats.by_protocol.entry(route.protocol).or_default() += 1;
            if let Some(code) = &route.country_code {
                *stats.by_country.entry(code.clone()).or_default() += 1;
            }
            if route.success_count + route.failure_count > 0 {
                rate_sum += route.success_rate();
                tried += 1;
            }
        }
        if tried > 0 {
            stats.avg_success_rate = rate_sum / tried as f64;
        }
        stats
    }

    /// Revive every dead route with cleared counters
    ///
    /// Only ever invoked on operator request; selection never revives routes.
    pub async fn reset_dead(&self) -> usize {
        let routes = self.routes.read().await;
        let mut revived = 0;
        for slot in routes.iter() {
            let mut route = slot.lock().await;
            if route.state == RouteState::Dead {
                route.state = RouteState::Active;
                route.success_count = 0;
                route.failure_count = 0;
                route.consecutive_failures = 0;
                route.throttled_in_selection = None;
                revived += 1;
            }
        }
        if revived > 0 {
            tracing::info!(revived, "dead routes reset");
        }
        revived
    }

    async fn find_slot(&self, route_id: &str) -> Option<RouteSlot> {
        let routes = self.routes.read().await;
        for slot in routes.iter() {
            if slot.lock().await.route_id == route_id {
                return Some(Arc::clone(slot));
            }
        }
        None
    }

    /// Smoothed success rate, floored, scaled up to 2x for idle routes
    fn weight(&self, route: &Route, now: DateTime<Utc>) -> f64 {
        let smoothed = route.success_count as f64
            / (route.success_count + route.failure_count + 1) as f64;
        let base = smoothed.max(MIN_WEIGHT);

        let idle = match route.last_used_at {
            None => 1.0,
            Some(last) => {
                let horizon = self.config.idle_horizon.as_secs_f64();
                if horizon <= 0.0 {
                    1.0
                } else {
                    let elapsed = (now - last).num_milliseconds().max(0) as f64 / 1000.0;
                    (elapsed / horizon).min(1.0)
                }
            }
        };

        base * (1.0 + idle)
    }
}

/// Weighted random draw; equal weights fall back to least recently used
fn pick_index(weights: &[f64], last_used: &[Option<DateTime<Utc>>]) -> usize {
    let first = weights.first().copied().unwrap_or_default();
    let all_equal = weights.iter().all(|w| (w - first).abs() < f64::EPSILON);

    if all_equal {
        // None sorts before Some, so never-used routes go first
        return last_used
            .iter()
            .enumerate()
            .min_by_key(|(_, used)| **used)
            .map(|(i, _)| i)
            .unwrap_or(0);
    }

    let total: f64 = weights.iter().sum();
    let mut draw = rand::thread_rng().gen_range(0.0..total);
    for (i, w) in weights.iter().enumerate() {
        if draw < *w {
            return i;
        }
        draw -= w;
    }
    weights.len() - 1
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
