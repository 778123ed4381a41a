//! In-memory backend and collector setup shared by the integration tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stream_harvest::{
    BatchFetcher, CollectedItem, Collector, Config, FetchError, FetchRequest, FetchedPage,
    FetcherCapabilities, Route, TargetId,
};
use tempfile::TempDir;

/// Backend serving published items in id order, with queued failures per target
#[derive(Default)]
pub struct MemoryBackend {
    items: Mutex<HashMap<TargetId, BTreeMap<i64, CollectedItem>>>,
    failures: Mutex<HashMap<TargetId, VecDeque<FetchError>>>,
    requests: Mutex<Vec<(TargetId, Option<String>, Option<i64>)>>,
}

impl MemoryBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish(&self, target: &str, ids: impl IntoIterator<Item = i64>) {
        let target = TargetId::from(target);
        let mut items = self.items.lock().unwrap();
        let stream = items.entry(target.clone()).or_default();
        for id in ids {
            stream.insert(id, CollectedItem::new(target.clone(), id, format!("post {}", id)));
        }
    }

    pub fn publish_item(&self, item: CollectedItem) {
        self.items
            .lock()
            .unwrap()
            .entry(item.target.clone())
            .or_default()
            .insert(item.item_id, item);
    }

    pub fn fail_next(&self, target: &str, error: FetchError) {
        self.failures
            .lock()
            .unwrap()
            .entry(TargetId::from(target))
            .or_default()
            .push_back(error);
    }

    /// `after` cursor of every request made for `target`
    pub fn cursors(&self, target: &str) -> Vec<Option<i64>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t.as_str() == target)
            .map(|(_, _, after)| *after)
            .collect()
    }

    /// Route of every request made for `target`
    pub fn routes_used(&self, target: &str) -> Vec<Option<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t.as_str() == target)
            .map(|(_, route, _)| route.clone())
            .collect()
    }
}

#[async_trait]
impl BatchFetcher for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> FetcherCapabilities {
        FetcherCapabilities {
            deletion_detection: true,
            ..FetcherCapabilities::default()
        }
    }

    async fn fetch_batch(
        &self,
        route: Option<&Route>,
        request: &FetchRequest,
    ) -> Result<FetchedPage, FetchError> {
        self.requests.lock().unwrap().push((
            request.target.clone(),
            route.map(|r| r.route_id.clone()),
            request.after,
        ));

        if let Some(error) = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&request.target)
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }

        let items = self.items.lock().unwrap();
        let Some(stream) = items.get(&request.target) else {
            return Ok(FetchedPage {
                end_of_stream: true,
                ..Default::default()
            });
        };

        let start = request.after.map_or(i64::MIN, |after| after + 1);
        let mut rest = stream.range(start..).map(|(_, item)| item.clone());
        let page: Vec<_> = rest.by_ref().take(request.page_size).collect();
        let end_of_stream = rest.next().is_none();
        Ok(FetchedPage {
            items: page,
            next_cursor: None,
            end_of_stream,
        })
    }
}

/// Config with fast backoff, no pacing and state under `dir`
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = dir.join("harvest.db");
    config.media.media_dir = dir.join("media");
    config.collection.min_request_interval = Duration::ZERO;
    config.backoff.base_delay = Duration::from_millis(5);
    config.backoff.max_delay = Duration::from_millis(20);
    config.backoff.jitter = false;
    config
}

/// Open a collector over `backend` with its database in a fresh temp dir
pub async fn create_collector(
    backend: Arc<MemoryBackend>,
    configure: impl FnOnce(&mut Config),
) -> (Collector, TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let mut config = test_config(temp_dir.path());
    configure(&mut config);
    let collector = Collector::new(config, backend)
        .await
        .expect("Failed to create collector");
    (collector, temp_dir)
}

/// Reopen a collector on an existing state directory, as a restarted process would
pub async fn reopen_collector(
    backend: Arc<MemoryBackend>,
    dir: &Path,
    configure: impl FnOnce(&mut Config),
) -> Collector {
    let mut config = test_config(dir);
    configure(&mut config);
    Collector::new(config, backend)
        .await
        .expect("Failed to reopen collector")
}
