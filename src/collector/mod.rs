//! Collection engine split into focused submodules.
//!
//! The `Collector` struct and its methods are organized by domain:
//! - [`run`] - Run lifecycle (manifests, counters, cancellation, multi-target runs)
//! - [`session`] - The per-target page loop (fetch, persist, reconcile, checkpoint)
//!
//! A `Collector` owns no per-target state. Every call to [`Collector::collect`]
//! opens a fresh session with its own cursor, route and backoff controller, so
//! several targets can be collected concurrently against one shared route pool.

mod run;
mod session;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

pub use run::RunContext;
pub use session::ItemStream;

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::fetch::{BatchFetcher, MediaFetcher};
use crate::pool::{RoutePool, RouteSource};
use crate::storage::ItemStore;
use crate::types::{Checkpoint, ContinuityMetrics, Event, TargetId};
use std::sync::Arc;

/// Event channel capacity; slow subscribers miss events rather than block collection
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Main collector instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct Collector {
    /// Checkpoints, continuity ledger and run manifests
    /// Public for integration tests to inspect committed state
    pub db: Arc<Database>,
    /// Egress routes shared by every session
    pub(crate) pool: Arc<RoutePool>,
    /// Page source, chosen at construction time
    pub(crate) fetcher: Arc<dyn BatchFetcher>,
    /// Where collected items are persisted (defaults to the database)
    pub(crate) store: Arc<dyn ItemStore>,
    /// Attachment downloader, when media collection is wanted
    pub(crate) media_fetcher: Option<Arc<dyn MediaFetcher>>,
    /// Configuration (wrapped in Arc for sharing across sessions)
    pub(crate) config: Arc<Config>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
}

impl Collector {
    /// Open the database named in the configuration and build a collector around `fetcher`
    ///
    /// Items are stored in the same database; use [`with_store`](Self::with_store)
    /// to send them elsewhere.
    pub async fn new(config: Config, fetcher: Arc<dyn BatchFetcher>) -> Result<Self> {
        config.validate()?;
        let db = Arc::new(Database::new(&config.persistence.database_path).await?);
        Self::with_database(config, db, fetcher)
    }

    /// Build a collector on an already opened database
    pub fn with_database(
        config: Config,
        db: Arc<Database>,
        fetcher: Arc<dyn BatchFetcher>,
    ) -> Result<Self> {
        config.validate()?;
        let (event_tx, _rx) = tokio::sync::broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let pool = Arc::new(RoutePool::new(config.pool.clone()));
        let store: Arc<dyn ItemStore> = db.clone();

        tracing::info!(
            fetcher = fetcher.name(),
            page_size = config.collection.page_size,
            allow_direct = config.collection.allow_direct,
            "collector initialized"
        );

        Ok(Self {
            db,
            pool,
            fetcher,
            store,
            media_fetcher: None,
            config: Arc::new(config),
            event_tx,
        })
    }

    /// Persist items through `store` instead of the database
    pub fn with_store(mut self, store: Arc<dyn ItemStore>) -> Self {
        self.store = store;
        self
    }

    /// Download attachments with `fetcher` for runs that ask for media
    pub fn with_media_fetcher(mut self, fetcher: Arc<dyn MediaFetcher>) -> Self {
        self.media_fetcher = Some(fetcher);
        self
    }

    /// Share a route pool with other collectors
    pub fn with_pool(mut self, pool: Arc<RoutePool>) -> Self {
        self.pool = pool;
        self
    }

    /// Subscribe to collection events
    ///
    /// Events are dropped when nobody listens; a lagging subscriber misses the
    /// oldest ones.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// The shared route pool
    pub fn pool(&self) -> &Arc<RoutePool> {
        &self.pool
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fill the route pool from a route source
    ///
    /// Returns the number of routes added (duplicates are merged).
    pub async fn load_routes(&self, source: &dyn RouteSource, source_name: &str) -> Result<usize> {
        let routes = source.load_routes(source_name).await?;
        let loaded = routes.len();
        let added = self.pool.add_routes(routes).await;
        tracing::info!(source = source_name, loaded, added, "routes loaded");
        Ok(added)
    }

    /// Stored checkpoint of a target
    pub async fn checkpoint(&self, target: &TargetId) -> Result<Option<Checkpoint>> {
        self.db.get_checkpoint(target).await
    }

    /// Make the next collection of `target` start from the beginning of its stream
    pub async fn reset_checkpoint(&self, target: &TargetId) -> Result<bool> {
        self.db.reset_checkpoint(target).await
    }

    /// Completeness metrics of a target
    pub async fn metrics(&self, target: &TargetId) -> Result<ContinuityMetrics> {
        self.db.compute_metrics(target).await
    }
}
