//! Media download workers
//!
//! Attachments of collected items are downloaded off the collection path by a
//! bounded set of workers fed from a queue. A failed download is retried on its
//! own budget and then recorded; it never stops the collection of the stream
//! the item came from.

use crate::config::MediaConfig;
use crate::db::{Database, NewMediaDownload, media_status};
use crate::error::FetchError;
use crate::fetch::{MediaFetcher, MediaTask};
use crate::retry::with_retry;
use crate::types::{CollectedItem, Event};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Longest file name written to disk
const MAX_FILE_NAME_LEN: usize = 200;

/// Make a remote-supplied name safe to use as a single path component
///
/// Path separators, control characters and characters Windows rejects become
/// `_`; leading dots are stripped so the result is never hidden or `..`.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = cleaned.trim().trim_start_matches('.');
    let mut result: String = trimmed.chars().take(MAX_FILE_NAME_LEN).collect();
    if result.is_empty() {
        result.push_str("file");
    }
    result
}

/// Totals of a media pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaSummary {
    /// Files written
    pub downloaded: u64,
    /// Downloads that failed after their retries
    pub failed: u64,
    /// Attachments not downloaded on purpose
    pub skipped: u64,
    /// Bytes written
    pub bytes: u64,
}

#[derive(Debug, Default)]
struct MediaCounters {
    downloaded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    bytes: AtomicU64,
}

impl MediaCounters {
    fn snapshot(&self) -> MediaSummary {
        MediaSummary {
            downloaded: self.downloaded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Handle used by collection sessions to queue downloads
#[derive(Clone)]
pub struct MediaQueue {
    task_tx: mpsc::UnboundedSender<MediaTask>,
    closing: CancellationToken,
}

impl MediaQueue {
    /// Queue one download; returns false once the pipeline is shutting down
    pub fn enqueue(&self, task: MediaTask) -> bool {
        if self.closing.is_cancelled() {
            return false;
        }
        self.task_tx.send(task).is_ok()
    }

    /// Queue every attachment of an item, returning how many were queued
    pub fn enqueue_item(&self, item: &CollectedItem) -> usize {
        item.media
            .iter()
            .enumerate()
            .filter(|(index, media)| {
                self.enqueue(MediaTask {
                    target: item.target.clone(),
                    item_id: item.item_id,
                    index: *index,
                    media: (*media).clone(),
                })
            })
            .count()
    }
}

struct WorkerContext {
    config: MediaConfig,
    fetcher: Arc<dyn MediaFetcher>,
    db: Arc<Database>,
    event_tx: broadcast::Sender<Event>,
    counters: Arc<MediaCounters>,
}

/// Bounded pool of download workers
pub struct MediaPipeline {
    queue: MediaQueue,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<MediaCounters>,
}

impl MediaPipeline {
    /// Spawn `config.concurrency` workers
    ///
    /// Cancelling `cancel_token` stops the workers after their current
    /// download; queued tasks are then dropped.
    pub fn start(
        config: MediaConfig,
        fetcher: Arc<dyn MediaFetcher>,
        db: Arc<Database>,
        event_tx: broadcast::Sender<Event>,
        cancel_token: CancellationToken,
    ) -> Self {
        let (task_tx, task_rx) = mpsc::unbounded_channel::<MediaTask>();
        let task_rx = Arc::new(Mutex::new(task_rx));
        let closing = CancellationToken::new();
        let counters = Arc::new(MediaCounters::default());
        let concurrency = config.concurrency.max(1);

        let ctx = Arc::new(WorkerContext {
            config,
            fetcher,
            db,
            event_tx,
            counters: Arc::clone(&counters),
        });

        let workers = (0..concurrency)
            .map(|worker| {
                let ctx = Arc::clone(&ctx);
                let task_rx = Arc::clone(&task_rx);
                let cancel = cancel_token.clone();
                let closing = closing.clone();
                tokio::spawn(async move {
                    loop {
                        let next = {
                            let mut rx = task_rx.lock().await;
                            tokio::select! {
                                biased;
                                _ = cancel.cancelled() => None,
                                task = rx.recv() => task,
                                // Drain what is already queued, then stop
                                _ = closing.cancelled() => rx.try_recv().ok(),
                            }
                        };
                        let Some(task) = next else { break };
                        ctx.process(task).await;
                    }
                    tracing::debug!(worker, "media worker stopped");
                })
            })
            .collect();

        tracing::debug!(concurrency, "media pipeline started");

        Self {
            queue: MediaQueue { task_tx, closing },
            workers,
            counters,
        }
    }

    /// Queue handle for collection sessions
    pub fn queue(&self) -> MediaQueue {
        self.queue.clone()
    }

    /// Current totals
    pub fn summary(&self) -> MediaSummary {
        self.counters.snapshot()
    }

    /// Stop accepting tasks, finish the queued ones and wait for the workers
    pub async fn finish(self) -> MediaSummary {
        self.queue.closing.cancel();
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "media worker panicked");
            }
        }
        let summary = self.counters.snapshot();
        tracing::info!(
            downloaded = summary.downloaded,
            failed = summary.failed,
            skipped = summary.skipped,
            "media pipeline finished"
        );
        summary
    }
}

impl WorkerContext {
    async fn process(&self, task: MediaTask) {
        if let Some(size) = task
            .media
            .size_bytes
            .filter(|size| *size > self.config.max_size_bytes)
        {
            tracing::debug!(
                target_id = %task.target,
                item_id = task.item_id,
                size,
                "media exceeds size limit, skipping"
            );
            self.record_skip(&task, None, format!("size {} exceeds limit", size))
                .await;
            return;
        }

        let dir = self
            .config
            .media_dir
            .join(sanitize_file_name(task.target.as_str()));
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            self.record_failure(&task, 0, format!("failed to create media directory: {}", e))
                .await;
            return;
        }

        let dest = dir.join(task.file_name());
        if tokio::fs::try_exists(&dest).await.unwrap_or(false) {
            self.record_skip(&task, Some(&dest), "already downloaded".to_string())
                .await;
            return;
        }

        // Written under a temporary name so a present file is always complete
        let partial = partial_path(&dest);
        let attempts = AtomicU32::new(0);
        let result = with_retry(&self.config.retry, || {
            attempts.fetch_add(1, Ordering::Relaxed);
            self.fetcher.download(&task, &partial)
        })
        .await;
        let attempts = attempts.load(Ordering::Relaxed);

        let outcome = match result {
            Ok(bytes) if bytes > self.config.max_size_bytes => {
                let _ = tokio::fs::remove_file(&partial).await;
                self.record_skip(&task, None, format!("size {} exceeds limit", bytes))
                    .await;
                return;
            }
            Ok(bytes) => tokio::fs::rename(&partial, &dest)
                .await
                .map(|_| bytes)
                .map_err(|e| format!("failed to move download into place: {}", e)),
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e.to_string())
            }
        };

        match outcome {
            Ok(bytes) => self.record_success(&task, &dest, bytes, attempts).await,
            Err(error) => self.record_failure(&task, attempts, error).await,
        }
    }

    async fn record_success(&self, task: &MediaTask, dest: &Path, bytes: u64, attempts: u32) {
        self.counters.downloaded.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes.fetch_add(bytes, Ordering::Relaxed);
        tracing::debug!(
            target_id = %task.target,
            item_id = task.item_id,
            bytes,
            "media downloaded"
        );

        self.persist(NewMediaDownload {
            target_id: task.target.clone(),
            item_id: task.item_id,
            locator: task.media.locator.clone(),
            status: media_status::DOWNLOADED,
            file_path: Some(dest.display().to_string()),
            bytes: bytes as i64,
            attempts: attempts as i64,
            error: None,
        })
        .await;

        self.event_tx
            .send(Event::MediaDownloaded {
                target: task.target.clone(),
                item_id: task.item_id,
                bytes,
            })
            .ok();
    }

    async fn record_failure(&self, task: &MediaTask, attempts: u32, error: String) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            target_id = %task.target,
            item_id = task.item_id,
            attempts,
            error = %error,
            "media download failed"
        );

        self.persist(NewMediaDownload {
            target_id: task.target.clone(),
            item_id: task.item_id,
            locator: task.media.locator.clone(),
            status: media_status::FAILED,
            file_path: None,
            bytes: 0,
            attempts: attempts as i64,
            error: Some(error.clone()),
        })
        .await;

        self.event_tx
            .send(Event::MediaFailed {
                target: task.target.clone(),
                item_id: task.item_id,
                error,
            })
            .ok();
    }

    async fn record_skip(&self, task: &MediaTask, dest: Option<&Path>, reason: String) {
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
        self.persist(NewMediaDownload {
            target_id: task.target.clone(),
            item_id: task.item_id,
            locator: task.media.locator.clone(),
            status: media_status::SKIPPED,
            file_path: dest.map(|p| p.display().to_string()),
            bytes: 0,
            attempts: 0,
            error: Some(reason),
        })
        .await;
    }

    async fn persist(&self, download: NewMediaDownload) {
        if let Err(e) = self.db.record_media_download(&download).await {
            tracing::error!(
                target_id = %download.target_id,
                item_id = download.item_id,
                error = %e,
                "failed to record media download outcome"
            );
        }
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Media fetcher for attachments whose locator is an HTTP(S) URL
pub struct HttpMediaFetcher {
    client: reqwest::Client,
}

impl HttpMediaFetcher {
    /// Create a fetcher with a 5 minute request timeout
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| Error::Other(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn download(&self, task: &MediaTask, dest: &Path) -> std::result::Result<u64, FetchError> {
        let url = url::Url::parse(&task.media.locator)
            .map_err(|e| FetchError::fatal(format!("invalid media locator: {}", e)))?;

        let mut response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                FetchError::retryable(e.to_string())
            } else {
                FetchError::fatal(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FetchError::throttled(retry_after));
        }
        if status.is_server_error() {
            return Err(FetchError::retryable(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(FetchError::fatal(format!("HTTP {}", status)));
        }

        let io_error = |e: std::io::Error| FetchError::fatal(format!("failed to write media: {}", e));
        let mut file = tokio::fs::File::create(dest).await.map_err(io_error)?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::retryable(format!("body interrupted: {}", e)))?
        {
            file.write_all(&chunk).await.map_err(io_error)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(io_error)?;

        Ok(written)
    }
}
