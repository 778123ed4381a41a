//! Shared test helpers for creating Collector instances in tests.

use crate::collector::Collector;
use crate::config::Config;
use crate::db::Database;
use crate::error::{FetchError, StorageError};
use crate::fetch::{BatchFetcher, FetchRequest, FetchedPage, FetcherCapabilities};
use crate::pool::Route;
use crate::storage::ItemStore;
use crate::types::{CollectedItem, TargetId};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::tempdir;

/// One recorded fetch call
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FetchCall {
    pub(crate) target: TargetId,
    pub(crate) route: Option<String>,
    pub(crate) after: Option<i64>,
}

/// In-memory stream backend with scriptable failures
///
/// Serves the stored items of each target in id order. Errors queued with
/// [`fail_next`](Self::fail_next) are returned before any page is served.
pub(crate) struct ScriptedFetcher {
    items: Mutex<HashMap<TargetId, BTreeMap<i64, CollectedItem>>>,
    script: Mutex<HashMap<TargetId, VecDeque<FetchError>>>,
    calls: Mutex<Vec<FetchCall>>,
    capabilities: FetcherCapabilities,
}

impl ScriptedFetcher {
    pub(crate) fn new() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            capabilities: FetcherCapabilities::default(),
        }
    }

    pub(crate) fn with_capabilities(mut self, capabilities: FetcherCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Publish text items with the given ids
    pub(crate) fn publish(&self, target: &str, ids: impl IntoIterator<Item = i64>) {
        let target = TargetId::from(target);
        let mut items = self.items.lock().unwrap();
        let stream = items.entry(target.clone()).or_default();
        for id in ids {
            stream.insert(id, CollectedItem::new(target.clone(), id, format!("message {}", id)));
        }
    }

    /// Publish or replace one item
    pub(crate) fn publish_item(&self, item: CollectedItem) {
        let mut items = self.items.lock().unwrap();
        items
            .entry(item.target.clone())
            .or_default()
            .insert(item.item_id, item);
    }

    pub(crate) fn fail_next(&self, target: &str, error: FetchError) {
        self.script
            .lock()
            .unwrap()
            .entry(TargetId::from(target))
            .or_default()
            .push_back(error);
    }

    pub(crate) fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchFetcher for ScriptedFetcher {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> FetcherCapabilities {
        self.capabilities
    }

    async fn fetch_batch(
        &self,
        route: Option<&Route>,
        request: &FetchRequest,
    ) -> Result<FetchedPage, FetchError> {
        self.calls.lock().unwrap().push(FetchCall {
            target: request.target.clone(),
            route: route.map(|r| r.route_id.clone()),
            after: request.after,
        });

        if let Some(error) = self
            .script
            .lock()
            .unwrap()
            .get_mut(&request.target)
            .and_then(|errors| errors.pop_front())
        {
            return Err(error);
        }

        let items = self.items.lock().unwrap();
        let Some(stream) = items.get(&request.target) else {
            return Ok(FetchedPage {
                end_of_stream: true,
                ..FetchedPage::default()
            });
        };

        let start = request.after.map_or(i64::MIN, |after| after.saturating_add(1));
        let mut remaining = stream.range(start..).map(|(_, item)| item.clone());
        let page: Vec<CollectedItem> = remaining.by_ref().take(request.page_size).collect();
        let end_of_stream = remaining.next().is_none();

        Ok(FetchedPage {
            items: page,
            next_cursor: None,
            end_of_stream,
        })
    }
}

/// Item store that fails a set number of times before delegating to the database
pub(crate) struct FlakyStore {
    db: Arc<Database>,
    failures_left: AtomicUsize,
    pub(crate) calls: AtomicUsize,
}

impl FlakyStore {
    pub(crate) fn new(db: Arc<Database>, failures: usize) -> Self {
        Self {
            db,
            failures_left: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ItemStore for FlakyStore {
    async fn persist_items(
        &self,
        target: &TargetId,
        items: &[CollectedItem],
    ) -> Result<(), StorageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StorageError::new("disk full"));
        }
        self.db.persist_items(target, items).await
    }
}

/// Configuration with no pacing and millisecond backoff
pub(crate) fn fast_config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = dir.join("test.db");
    config.media.media_dir = dir.join("media");
    config.collection.page_size = 25;
    config.collection.min_request_interval = Duration::ZERO;
    config.backoff.base_delay = Duration::from_millis(5);
    config.backoff.max_delay = Duration::from_millis(50);
    config.backoff.jitter = false;
    config
}

/// Helper to create a test Collector with a persistent database.
/// Returns the collector, the fetcher and the tempdir (which must be kept alive).
pub(crate) async fn create_test_collector(
    configure: impl FnOnce(&mut Config),
) -> (Collector, Arc<ScriptedFetcher>, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let mut config = fast_config(temp_dir.path());
    configure(&mut config);

    let fetcher = Arc::new(ScriptedFetcher::new());
    let collector = Collector::new(config, fetcher.clone()).await.unwrap();
    (collector, fetcher, temp_dir)
}

/// `count` socks5 routes named `10.0.0.<n>:1080`
pub(crate) fn test_routes(count: u8) -> Vec<Route> {
    (1..=count)
        .map(|n| Route::new(format!("10.0.0.{}", n), 1080, crate::pool::ProtocolKind::Socks5))
        .collect()
}
