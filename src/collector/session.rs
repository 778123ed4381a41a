//! The per-target page loop.
//!
//! Each page goes through the same commit sequence: persist the items, reconcile
//! the continuity ledger, advance the checkpoint, and only then hand the items to
//! the caller. A crash anywhere in that sequence leaves the checkpoint at the
//! previous page, and replaying a page is harmless because every step is an
//! idempotent upsert.

use super::Collector;
use super::run::{RunContext, RunCounters};
use crate::backoff::{BackoffController, Decision, Signal};
use crate::db::{Observation, text_checksum};
use crate::error::{CollectionError, FetchError};
use crate::fetch::{FetchRequest, FetchedPage, FetcherCapabilities};
use crate::media::MediaQueue;
use crate::pacer::RequestPacer;
use crate::pool::{Route, RouteFilter, RouteOutcome, RouteState};
use crate::types::{
    CollectOptions, CollectedItem, ContinuityStatus, Event, ItemPresence, TargetId, TargetOutcome,
};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stream of committed items for one target
pub type ItemStream = BoxStream<'static, Result<CollectedItem, CollectionError>>;

impl Collector {
    /// Collect one target within `run`
    ///
    /// Returns a lazy, forward-only stream: a page is only requested once the
    /// previous one has been consumed, and every yielded item is already
    /// persisted and checkpointed. The stream ends when the remote reports the end
    /// of the target's stream, when `options.limit` items were yielded, or after
    /// the run is cancelled. Recoverable failures (throttling, retryable transport
    /// errors) are handled inside; anything else ends the stream with a
    /// [`CollectionError`].
    pub fn collect(&self, run: &RunContext, target: TargetId, options: CollectOptions) -> ItemStream {
        self.open_stream(run, target, options).0
    }

    pub(super) fn open_stream(
        &self,
        run: &RunContext,
        target: TargetId,
        options: CollectOptions,
    ) -> (ItemStream, Arc<OnceLock<TargetOutcome>>) {
        let outcome = Arc::new(OnceLock::new());
        let media = if options.media_fetch {
            run.media.as_ref().map(|pipeline| pipeline.queue())
        } else {
            None
        };

        let base_filter = self.pool.default_filter();
        let session = Session {
            collector: self.clone(),
            capabilities: self.fetcher.capabilities(),
            backoff: BackoffController::new(
                self.config.backoff.clone(),
                self.config.collection.max_transport_retries,
            ),
            pacer: RequestPacer::new(self.config.collection.min_request_interval),
            counters: Arc::clone(&run.counters),
            cancel: run.cancel_token.child_token(),
            outcome: Arc::clone(&outcome),
            filter: base_filter.clone(),
            base_filter,
            target,
            options,
            media,
            route: None,
            direct: false,
            started: false,
            cursor: None,
            last_checkpoint: None,
            yielded: 0,
            buffer: VecDeque::new(),
            finished: None,
        };

        let stream = futures::stream::unfold(Some(session), |state| async move {
            let mut session = state?;
            loop {
                if let Some(item) = session.buffer.pop_front() {
                    return Some((Ok(item), Some(session)));
                }
                if let Some(outcome) = session.finished.take() {
                    session.complete(outcome);
                    return None;
                }
                if let Err(e) = session.next_page().await {
                    session.fail(&e);
                    return Some((Err(e), None));
                }
            }
        })
        .boxed();

        (stream, outcome)
    }
}

/// State of one target's collection
struct Session {
    collector: Collector,
    capabilities: FetcherCapabilities,
    backoff: BackoffController,
    pacer: RequestPacer,
    counters: Arc<RunCounters>,
    cancel: CancellationToken,
    outcome: Arc<OnceLock<TargetOutcome>>,
    base_filter: RouteFilter,
    filter: RouteFilter,
    target: TargetId,
    options: CollectOptions,
    media: Option<MediaQueue>,
    route: Option<Route>,
    /// Running without a route because the pool had none to offer
    direct: bool,
    started: bool,
    /// Fetch items strictly after this id
    cursor: Option<i64>,
    /// Highest durably committed id
    last_checkpoint: Option<i64>,
    yielded: usize,
    /// Committed items not yet handed to the caller
    buffer: VecDeque<CollectedItem>,
    finished: Option<TargetOutcome>,
}

impl Session {
    /// Fetch and commit the next page, absorbing recoverable failures
    async fn next_page(&mut self) -> Result<(), CollectionError> {
        if !self.started {
            self.start().await?;
        }

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!(
                    target_id = %self.target,
                    last_checkpoint = ?self.last_checkpoint,
                    "collection cancelled"
                );
                self.finished = Some(TargetOutcome::Cancelled);
                return Ok(());
            }

            self.ensure_route().await?;
            self.pacer.acquire().await;

            let request = FetchRequest {
                target: self.target.clone(),
                after: self.cursor,
                page_size: self.collector.config.collection.page_size,
            };
            let result = self
                .collector
                .fetcher
                .fetch_batch(self.route.as_ref(), &request)
                .await;

            match result {
                Ok(page) => {
                    self.on_success().await;
                    return self.commit_page(page).await;
                }
                Err(FetchError::Throttled { retry_after }) => self.on_throttle(retry_after).await?,
                Err(FetchError::Transport {
                    retryable: true,
                    message,
                }) => self.on_transport_failure(message).await?,
                Err(FetchError::Transport {
                    retryable: false,
                    message,
                }) => return Err(self.on_fatal(message)),
            }
        }
    }

    async fn start(&mut self) -> Result<(), CollectionError> {
        let checkpoint = self
            .collector
            .db
            .get_checkpoint(&self.target)
            .await
            .map_err(|e| self.state_error(e))?;

        self.last_checkpoint = checkpoint
            .as_ref()
            .map(|c| c.last_item_id)
            .filter(|id| *id > 0);
        self.cursor = if self.options.resume {
            checkpoint.as_ref().and_then(|c| c.resume_after())
        } else {
            None
        };
        self.started = true;

        tracing::info!(
            target_id = %self.target,
            resume_after = ?self.cursor,
            limit = self.options.limit,
            fetcher = self.collector.fetcher.name(),
            "collection started"
        );
        Ok(())
    }

    /// Commit one fetched page and queue its items for the caller
    async fn commit_page(&mut self, page: FetchedPage) -> Result<(), CollectionError> {
        let FetchedPage {
            mut items,
            next_cursor,
            end_of_stream,
        } = page;

        let after = self.cursor;
        items.retain(|item| item.item_id > 0 && after.is_none_or(|c| item.item_id > c));
        items.sort_by_key(|item| item.item_id);
        items.dedup_by_key(|item| item.item_id);
        for item in &mut items {
            item.target = self.target.clone();
        }

        let mut limit_reached = false;
        if self.options.limit > 0 {
            let remaining = self.options.limit.saturating_sub(self.yielded);
            if items.len() >= remaining {
                items.truncate(remaining);
                limit_reached = true;
            }
        }

        let (Some(first), Some(last)) = (items.first(), items.last()) else {
            match next_cursor {
                Some(next) if !end_of_stream && after.is_none_or(|c| next > c) => {
                    self.cursor = Some(next);
                }
                _ => {
                    if !end_of_stream {
                        tracing::debug!(target_id = %self.target, "empty page without cursor, treating as end of stream");
                    }
                    self.finished = Some(if limit_reached {
                        TargetOutcome::LimitReached
                    } else {
                        TargetOutcome::Exhausted
                    });
                }
            }
            return Ok(());
        };
        let (page_min, page_max) = (first.item_id, last.item_id);

        if let Err(source) = self.collector.store.persist_items(&self.target, &items).await {
            RunCounters::bump(&self.counters.errors, 1);
            return Err(CollectionError::Storage {
                target: self.target.clone(),
                last_checkpoint: self.last_checkpoint,
                source,
            });
        }

        let range = self.capabilities.reliable_ids.then(|| {
            let low = self.last_checkpoint.map_or(page_min, |c| (c + 1).min(page_min));
            (low, page_max)
        });
        let observations: Vec<Observation> = items.iter().map(|item| self.observe(item)).collect();
        let update = self
            .collector
            .db
            .apply_page(&self.target, range, &observations)
            .await
            .map_err(|e| self.state_error(e))?;

        self.collector
            .db
            .advance_checkpoint(&self.target, page_max, chrono::Utc::now(), items.len() as u64)
            .await
            .map_err(|e| self.state_error(e))?;
        self.last_checkpoint = Some(self.last_checkpoint.map_or(page_max, |c| c.max(page_max)));
        self.cursor = Some(next_cursor.map_or(page_max, |next| next.max(page_max)));

        let count = items.len();
        RunCounters::bump(&self.counters.collected, count as u64);
        tracing::debug!(
            target_id = %self.target,
            items = count,
            checkpoint = page_max,
            gaps = update.gaps,
            edited = update.edited,
            "page committed"
        );
        self.collector
            .event_tx
            .send(Event::PageCommitted {
                target: self.target.clone(),
                items: count,
                checkpoint: page_max,
            })
            .ok();

        if let Some(queue) = &self.media {
            for item in &items {
                queue.enqueue_item(item);
            }
        }

        self.yielded += count;
        self.buffer.extend(items);

        if limit_reached {
            self.finished = Some(TargetOutcome::LimitReached);
        } else if end_of_stream {
            self.finished = Some(TargetOutcome::Exhausted);
        }
        Ok(())
    }

    /// What the ledger should record for an item, given what the fetcher can vouch for
    fn observe(&self, item: &CollectedItem) -> Observation {
        let status = match item.presence {
            ItemPresence::Present => ContinuityStatus::Observed,
            ItemPresence::Deleted if self.capabilities.deletion_detection => {
                ContinuityStatus::Deleted
            }
            // An unverifiable removal marker is no evidence either way
            ItemPresence::Deleted => ContinuityStatus::Unknown,
            ItemPresence::Inaccessible => ContinuityStatus::Inaccessible,
        };

        let text = item.text.as_deref().filter(|_| status.is_observed());
        Observation {
            item_id: item.item_id,
            status,
            text_checksum: text
                .filter(|_| self.capabilities.edit_detection)
                .map(text_checksum),
            text_length: text.map(|t| t.chars().count() as i64),
        }
    }

    /// Take a route from the pool unless the session already has one
    async fn ensure_route(&mut self) -> Result<(), CollectionError> {
        if self.route.is_some() || self.direct {
            return Ok(());
        }

        match self.collector.pool.select_route(&self.filter).await {
            Ok(route) => {
                tracing::debug!(target_id = %self.target, route = %route.route_id, "route selected");
                self.route = Some(route);
                Ok(())
            }
            Err(e) if self.collector.config.collection.allow_direct => {
                tracing::info!(target_id = %self.target, reason = %e, "no usable route, connecting directly");
                self.direct = true;
                Ok(())
            }
            Err(e) => {
                tracing::error!(target_id = %self.target, reason = %e, "no usable route and direct connections are disabled");
                RunCounters::bump(&self.counters.errors, 1);
                Err(CollectionError::PoolExhausted {
                    target: self.target.clone(),
                    last_checkpoint: self.last_checkpoint,
                })
            }
        }
    }

    /// Switch to a different route for the next attempt
    async fn rotate(&mut self) -> Result<(), CollectionError> {
        let from = self.route.take().map(|r| r.route_id);
        self.direct = false;
        self.filter = match &from {
            Some(id) => self.base_filter.excluding(id),
            None => self.base_filter.clone(),
        };
        self.ensure_route().await?;
        self.backoff.route_changed();

        let to = self.route.as_ref().map(|r| r.route_id.clone());
        if from == to {
            // Nowhere else to go; the same egress is retried
            return Ok(());
        }
        RunCounters::bump(&self.counters.route_rotations, 1);
        tracing::info!(
            target_id = %self.target,
            from = from.as_deref().unwrap_or("direct"),
            to = to.as_deref().unwrap_or("direct"),
            "route rotated"
        );
        self.collector
            .event_tx
            .send(Event::RouteRotated {
                target: self.target.clone(),
                from,
                to,
            })
            .ok();
        Ok(())
    }

    async fn on_success(&mut self) {
        self.report(RouteOutcome::Success).await;
        self.backoff.decide(Signal::Success);
    }

    async fn on_throttle(&mut self, retry_after: Option<Duration>) -> Result<(), CollectionError> {
        RunCounters::bump(&self.counters.throttle_events, 1);
        self.report(RouteOutcome::Throttled).await;

        if let Decision::Wait { delay, rotate } = self.backoff.decide(Signal::Throttled { retry_after }) {
            let route = self.route.as_ref().map(|r| r.route_id.clone());
            tracing::warn!(
                target_id = %self.target,
                route = route.as_deref().unwrap_or("direct"),
                retry_after = ?retry_after,
                wait_ms = delay.as_millis() as u64,
                rotate,
                "throttled"
            );
            self.collector
                .event_tx
                .send(Event::Throttled {
                    target: self.target.clone(),
                    route,
                    wait: delay,
                })
                .ok();

            // Only this session sleeps; cancellation cuts the wait short
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => return Ok(()),
            }

            if rotate {
                self.rotate().await?;
            }
        }
        Ok(())
    }

    async fn on_transport_failure(&mut self, message: String) -> Result<(), CollectionError> {
        RunCounters::bump(&self.counters.errors, 1);
        tracing::warn!(
            target_id = %self.target,
            route = self.route.as_ref().map(|r| r.route_id.as_str()).unwrap_or("direct"),
            error = %message,
            "transport failure"
        );
        self.report(RouteOutcome::Failure).await;

        match self.backoff.decide(Signal::TransportFailure) {
            Decision::Abort { attempts } => Err(CollectionError::RetriesExhausted {
                target: self.target.clone(),
                last_checkpoint: self.last_checkpoint,
                attempts,
                reason: message,
            }),
            _ => self.rotate().await,
        }
    }

    fn on_fatal(&mut self, message: String) -> CollectionError {
        RunCounters::bump(&self.counters.errors, 1);
        self.backoff.decide(Signal::Fatal);
        CollectionError::Fatal {
            target: self.target.clone(),
            last_checkpoint: self.last_checkpoint,
            reason: message,
        }
    }

    /// Tell the pool how the current route did
    async fn report(&self, outcome: RouteOutcome) {
        let Some(route) = &self.route else {
            return;
        };
        match self.collector.pool.report_outcome(&route.route_id, outcome).await {
            Ok(Some(RouteState::Dead)) => {
                self.collector
                    .event_tx
                    .send(Event::RouteDead {
                        route: route.route_id.clone(),
                    })
                    .ok();
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(route = %route.route_id, error = %e, "could not report route outcome");
            }
        }
    }

    fn state_error(&self, source: crate::Error) -> CollectionError {
        RunCounters::bump(&self.counters.errors, 1);
        CollectionError::State {
            target: self.target.clone(),
            last_checkpoint: self.last_checkpoint,
            source,
        }
    }

    fn complete(&self, outcome: TargetOutcome) {
        tracing::info!(
            target_id = %self.target,
            items = self.yielded,
            last_checkpoint = ?self.last_checkpoint,
            outcome = ?outcome,
            "collection finished"
        );
        self.collector
            .event_tx
            .send(Event::TargetComplete {
                target: self.target.clone(),
                items: self.yielded as u64,
                outcome: outcome.clone(),
            })
            .ok();
        let _ = self.outcome.set(outcome);
    }

    fn fail(&self, error: &CollectionError) {
        tracing::error!(
            target_id = %self.target,
            error = %error,
            last_checkpoint = ?error.last_checkpoint(),
            "collection failed"
        );
        self.collector
            .event_tx
            .send(Event::TargetFailed {
                target: self.target.clone(),
                error: error.to_string(),
                last_checkpoint: error.last_checkpoint(),
            })
            .ok();
        let _ = self.outcome.set(TargetOutcome::Failed {
            error: error.to_string(),
        });
    }
}
