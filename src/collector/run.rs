//! Run lifecycle: manifests, shared counters, cancellation and multi-target runs.

use super::Collector;
use crate::error::Result;
use crate::media::MediaPipeline;
use crate::types::{
    CheckpointMode, CollectOptions, Event, RunCounts, RunManifest, TargetId, TargetOutcome,
    TargetReport,
};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// Atomic counters shared by every session of a run
#[derive(Debug, Default)]
pub(crate) struct RunCounters {
    pub(crate) collected: AtomicU64,
    pub(crate) throttle_events: AtomicU64,
    pub(crate) errors: AtomicU64,
    pub(crate) route_rotations: AtomicU64,
}

impl RunCounters {
    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> RunCounts {
        RunCounts {
            collected: self.collected.load(Ordering::Relaxed),
            throttle_events: self.throttle_events.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            route_rotations: self.route_rotations.load(Ordering::Relaxed),
            media_downloaded: 0,
            media_failed: 0,
        }
    }
}

/// One collection run: its manifest, counters and cancellation signal
///
/// Created by [`Collector::begin_run`] and closed by [`Collector::finish_run`],
/// which writes the final counters into the manifest.
pub struct RunContext {
    manifest: RunManifest,
    pub(crate) counters: Arc<RunCounters>,
    pub(crate) cancel_token: CancellationToken,
    pub(crate) media: Option<MediaPipeline>,
}

impl RunContext {
    /// Run identifier
    pub fn run_id(&self) -> &str {
        &self.manifest.run_id
    }

    /// Manifest as written at run start
    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    /// Counters so far
    pub fn counts(&self) -> RunCounts {
        let mut counts = self.counters.snapshot();
        if let Some(media) = &self.media {
            let summary = media.summary();
            counts.media_downloaded = summary.downloaded;
            counts.media_failed = summary.failed;
        }
        counts
    }

    /// Stop every session of this run before its next page request
    ///
    /// Pages already committed stay committed; nothing is partially checkpointed.
    pub fn cancel(&self) {
        tracing::info!(run_id = %self.manifest.run_id, "run cancellation requested");
        self.cancel_token.cancel();
    }

    /// Whether [`cancel`](Self::cancel) was called
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Token that cancels this run, for wiring into signal handlers
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }
}

impl Collector {
    /// Start a run over `targets` and record its manifest
    ///
    /// When `options.media_fetch` is set and a media fetcher is configured, the
    /// run gets its own pool of download workers.
    pub async fn begin_run(
        &self,
        targets: &[TargetId],
        options: CollectOptions,
    ) -> Result<RunContext> {
        let manifest = RunManifest {
            run_id: uuid::Uuid::new_v4().to_string(),
            fetcher: self.fetcher.name().to_string(),
            target_ids: targets.to_vec(),
            mode: if options.resume {
                CheckpointMode::Incremental
            } else {
                CheckpointMode::Full
            },
            item_limit: options.limit as u64,
            start_ts: chrono::Utc::now(),
            end_ts: None,
            counts: RunCounts::default(),
        };
        self.db.insert_run(&manifest).await?;

        let cancel_token = CancellationToken::new();
        let serves_media = self.fetcher.capabilities().media_download;
        let media = match (&self.media_fetcher, options.media_fetch) {
            (Some(_), true) if !serves_media => {
                tracing::warn!(
                    fetcher = self.fetcher.name(),
                    "media requested but the backend does not serve media, skipping media"
                );
                None
            }
            (Some(fetcher), true) => Some(MediaPipeline::start(
                self.config.media.clone(),
                Arc::clone(fetcher),
                Arc::clone(&self.db),
                self.event_tx.clone(),
                cancel_token.child_token(),
            )),
            (None, true) => {
                tracing::warn!("media requested but no media fetcher configured, skipping media");
                None
            }
            _ => None,
        };

        tracing::info!(
            run_id = %manifest.run_id,
            targets = targets.len(),
            mode = manifest.mode.as_str(),
            limit = options.limit,
            "run started"
        );
        self.event_tx
            .send(Event::RunStarted {
                run_id: manifest.run_id.clone(),
                targets: targets.to_vec(),
            })
            .ok();

        Ok(RunContext {
            manifest,
            counters: Arc::new(RunCounters::default()),
            cancel_token,
            media,
        })
    }

    /// Close a run: wait for queued media, then finalize the manifest
    pub async fn finish_run(&self, run: RunContext) -> Result<RunManifest> {
        let RunContext {
            mut manifest,
            counters,
            cancel_token: _,
            media,
        } = run;

        let mut counts = counters.snapshot();
        if let Some(pipeline) = media {
            let summary = pipeline.finish().await;
            counts.media_downloaded = summary.downloaded;
            counts.media_failed = summary.failed;
        }

        let end_ts = chrono::Utc::now();
        self.db.finalize_run(&manifest.run_id, end_ts, &counts).await?;
        manifest.end_ts = Some(end_ts);
        manifest.counts = counts;

        self.event_tx
            .send(Event::RunFinished {
                run_id: manifest.run_id.clone(),
                counts,
            })
            .ok();

        Ok(manifest)
    }

    /// Collect several targets within `run`
    ///
    /// Up to `max_concurrent_targets` targets are collected at once, each in its
    /// own session. A failing target is reported and does not affect the others.
    /// Reports come back in the order of `targets`.
    pub async fn collect_run(
        &self,
        run: &RunContext,
        targets: &[TargetId],
        options: CollectOptions,
    ) -> Vec<TargetReport> {
        futures::stream::iter(targets.iter().cloned())
            .map(|target| self.drive_target(run, target, options))
            .buffered(self.config.collection.max_concurrent_targets)
            .collect()
            .await
    }

    /// Begin a run, collect every target and finalize the manifest
    pub async fn collect_all(
        &self,
        targets: &[TargetId],
        options: CollectOptions,
    ) -> Result<(Vec<TargetReport>, RunManifest)> {
        let run = self.begin_run(targets, options).await?;
        let reports = self.collect_run(&run, targets, options).await;
        let manifest = self.finish_run(run).await?;
        Ok((reports, manifest))
    }

    async fn drive_target(
        &self,
        run: &RunContext,
        target: TargetId,
        options: CollectOptions,
    ) -> TargetReport {
        let (mut stream, outcome) = self.open_stream(run, target.clone(), options);

        let mut items = 0u64;
        while let Some(result) = stream.next().await {
            match result {
                Ok(_) => items += 1,
                Err(e) => {
                    return TargetReport {
                        target,
                        items,
                        last_checkpoint: e.last_checkpoint(),
                        outcome: TargetOutcome::Failed {
                            error: e.to_string(),
                        },
                    };
                }
            }
        }

        let last_checkpoint = match self.db.get_checkpoint(&target).await {
            Ok(checkpoint) => checkpoint
                .map(|c| c.last_item_id)
                .filter(|id| *id > 0),
            Err(e) => {
                tracing::warn!(target_id = %target, error = %e, "could not read final checkpoint");
                None
            }
        };

        TargetReport {
            target,
            items,
            last_checkpoint,
            outcome: outcome.get().cloned().unwrap_or(TargetOutcome::Exhausted),
        }
    }
}
