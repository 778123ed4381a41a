//! # stream-harvest
//!
//! Incremental, resumable collection of ordered message streams.
//!
//! ## Design Philosophy
//!
//! stream-harvest is designed to be:
//! - **Resumable** - Every committed page advances a durable checkpoint, so a
//!   crashed or cancelled run picks up where it stopped
//! - **Auditable** - A continuity ledger records which item ids were seen, lost or
//!   edited, and why a stream has gaps
//! - **Throttle-aware** - Throttle signals back off and rotate through a weighted
//!   pool of egress routes
//! - **Library-first** - No CLI or UI; the remote protocol is supplied by the
//!   embedding application through [`BatchFetcher`]
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use stream_harvest::{
//!     BatchFetcher, CollectOptions, Collector, Config, FetchError, FetchRequest, FetchedPage,
//!     Route, TargetId,
//! };
//!
//! struct MyFetcher;
//!
//! #[async_trait::async_trait]
//! impl BatchFetcher for MyFetcher {
//!     fn name(&self) -> &str {
//!         "my-backend"
//!     }
//!
//!     async fn fetch_batch(
//!         &self,
//!         _route: Option<&Route>,
//!         _request: &FetchRequest,
//!     ) -> Result<FetchedPage, FetchError> {
//!         Ok(FetchedPage { end_of_stream: true, ..Default::default() })
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let collector = Collector::new(Config::default(), Arc::new(MyFetcher)).await?;
//!
//!     let target = TargetId::from("news");
//!     let options = CollectOptions::default();
//!     let run = collector.begin_run(&[target.clone()], options).await?;
//!
//!     let mut items = collector.collect(&run, target, options);
//!     while let Some(item) = items.next().await {
//!         println!("{:?}", item?);
//!     }
//!     drop(items);
//!
//!     let manifest = collector.finish_run(run).await?;
//!     println!("collected {}", manifest.counts.collected);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Throttle and transport-failure backoff decisions
pub mod backoff;
/// Collection engine (decomposed into focused submodules)
pub mod collector;
/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Fetch capability traits implemented by remote backends
pub mod fetch;
/// Media download workers
pub mod media;
/// Minimum spacing between requests
pub mod pacer;
/// Weighted egress route pool with health tracking
pub mod pool;
/// Retry logic with exponential backoff
pub mod retry;
/// Item persistence capability
pub mod storage;
/// Core types and events
pub mod types;

use std::future::Future;
use tokio_util::sync::CancellationToken;

// Re-export commonly used types
pub use collector::{Collector, ItemStream, RunContext};
pub use config::{
    BackoffConfig, CollectionConfig, Config, MediaConfig, PersistenceConfig, PoolConfig,
    RetryConfig,
};
pub use db::Database;
pub use error::{CollectionError, DatabaseError, Error, FetchError, Result, StorageError};
pub use fetch::{
    BatchFetcher, FetchRequest, FetchedPage, FetcherCapabilities, MediaFetcher, MediaTask,
};
pub use media::{HttpMediaFetcher, MediaSummary};
pub use pool::{
    FileRouteSource, HttpRouteSource, ProtocolKind, Route, RouteFilter, RoutePool, RouteSource,
    RouteState,
};
pub use storage::ItemStore;
pub use types::{
    Checkpoint, CheckpointMode, CollectOptions, CollectedItem, ContinuityMetrics,
    ContinuityStatus, Event, ItemPresence, MediaRef, RunCounts, RunManifest, TargetId,
    TargetOutcome, TargetReport,
};

/// Run `work` until it finishes or a termination signal arrives.
///
/// On a signal, `cancel_token` is cancelled and `work` is still awaited, so a
/// collection loop gets to stop at a page boundary and finalize its manifest.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// # use stream_harvest::{Collector, CollectOptions, TargetId, run_until_signal};
/// # async fn example(collector: Collector) -> stream_harvest::Result<()> {
/// let targets = vec![TargetId::from("news")];
/// let run = collector.begin_run(&targets, CollectOptions::default()).await?;
///
/// let reports = run_until_signal(
///     run.cancel_token(),
///     collector.collect_run(&run, &targets, CollectOptions::default()),
/// )
/// .await;
///
/// let manifest = collector.finish_run(run).await?;
/// # let _ = (reports, manifest);
/// # Ok(())
/// # }
/// ```
pub async fn run_until_signal<F: Future>(cancel_token: CancellationToken, work: F) -> F::Output {
    tokio::pin!(work);
    tokio::select! {
        output = &mut work => output,
        _ = wait_for_signal() => {
            tracing::info!("shutting down, waiting for in-flight pages to commit");
            cancel_token.cancel();
            work.await
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
