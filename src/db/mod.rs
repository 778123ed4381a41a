//! Database layer for stream-harvest
//!
//! Handles SQLite persistence for checkpoints, the continuity ledger, run
//! manifests, collected items and media download outcomes.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`checkpoints`] - Per-target resume positions
//! - [`continuity`] - Expected vs observed item ids, edit history, metrics
//! - [`manifests`] - Run manifests
//! - [`items`] - Collected item storage (the default [`ItemStore`](crate::storage::ItemStore))
//! - [`media`] - Media download outcomes
//!
//! Every connection runs in WAL mode with `synchronous = FULL`, so a write that
//! returned has reached the disk.

use crate::types::{
    Checkpoint, CheckpointMode, ContinuityRecord, ContinuityStatus, RunCounts, RunManifest,
    TargetId,
};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, sqlite::SqlitePool};

mod checkpoints;
mod continuity;
mod items;
mod manifests;
mod media;
mod migrations;

pub use continuity::text_checksum;

/// Checkpoint record from database
#[derive(Debug, Clone, FromRow)]
pub struct CheckpointRow {
    /// Target identifier
    pub target_id: TargetId,
    /// Highest committed item id (0 = no position)
    pub last_item_id: i64,
    /// Unix timestamp of the last advance or reset
    pub last_run_at: i64,
    /// "incremental" or "full"
    pub mode: String,
    /// Items committed across all runs
    pub items_collected: i64,
}

impl From<CheckpointRow> for Checkpoint {
    fn from(row: CheckpointRow) -> Self {
        Checkpoint {
            target_id: row.target_id,
            last_item_id: row.last_item_id,
            last_run_at: from_timestamp(row.last_run_at),
            mode: CheckpointMode::parse(&row.mode),
            items_collected: row.items_collected,
        }
    }
}

/// Continuity ledger record from database
#[derive(Debug, Clone, FromRow)]
pub struct ContinuityRow {
    /// Target identifier
    pub target_id: TargetId,
    /// Expected item id
    pub expected_item_id: i64,
    /// Status string
    pub status: String,
    /// Unix timestamp of first sighting
    pub first_seen_at: i64,
    /// Unix timestamp of last check
    pub last_checked_at: i64,
    /// Checksum of the last observed text
    pub text_checksum: Option<String>,
}

impl From<ContinuityRow> for ContinuityRecord {
    fn from(row: ContinuityRow) -> Self {
        ContinuityRecord {
            target_id: row.target_id,
            expected_item_id: row.expected_item_id,
            status: ContinuityStatus::parse(&row.status),
            first_seen_at: from_timestamp(row.first_seen_at),
            last_checked_at: from_timestamp(row.last_checked_at),
            text_checksum: row.text_checksum,
        }
    }
}

/// One entry of the append-only status history
#[derive(Debug, Clone, FromRow)]
pub struct StatusHistoryRow {
    /// Row id
    pub id: i64,
    /// Target identifier
    pub target_id: TargetId,
    /// Item id
    pub item_id: i64,
    /// Unix timestamp of the observation
    pub observed_at: i64,
    /// Status string
    pub status: String,
    /// Checksum of the text at that time
    pub text_checksum: Option<String>,
    /// Text length at that time
    pub text_length: Option<i64>,
}

/// What a page revealed about one item id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Item id
    pub item_id: i64,
    /// Observed, deleted or inaccessible
    pub status: ContinuityStatus,
    /// Text checksum, when edit detection applies
    pub text_checksum: Option<String>,
    /// Text length in characters
    pub text_length: Option<i64>,
}

/// Summary of one page's ledger reconciliation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerUpdate {
    /// New `unknown` rows created for the page's id span
    pub expected_added: u64,
    /// Ids in the span neither observed nor reported deleted
    pub gaps: u64,
    /// Observations written
    pub observed: u64,
    /// Observations that turned out to be edits
    pub edited: u64,
    /// Observations of explicit removals
    pub deleted: u64,
}

/// Run manifest record from database
#[derive(Debug, Clone, FromRow)]
pub struct RunManifestRow {
    /// Run identifier
    pub run_id: String,
    /// Fetch backend name
    pub fetcher: String,
    /// JSON array of target ids
    pub target_ids: String,
    /// "incremental" or "full"
    pub mode: String,
    /// Per-target item limit
    pub item_limit: i64,
    /// Unix timestamp of run start
    pub start_ts: i64,
    /// Unix timestamp of finalization
    pub end_ts: Option<i64>,
    /// Items committed
    pub collected: i64,
    /// Throttle signals received
    pub throttle_events: i64,
    /// Errors encountered
    pub errors: i64,
    /// Route rotations performed
    pub route_rotations: i64,
    /// Media files downloaded
    pub media_downloaded: i64,
    /// Media downloads that failed
    pub media_failed: i64,
}

impl From<RunManifestRow> for RunManifest {
    fn from(row: RunManifestRow) -> Self {
        let target_ids: Vec<TargetId> = serde_json::from_str(&row.target_ids).unwrap_or_else(|e| {
            tracing::warn!(run_id = %row.run_id, error = %e, "unreadable target list in run manifest");
            Vec::new()
        });
        RunManifest {
            run_id: row.run_id,
            fetcher: row.fetcher,
            target_ids,
            mode: CheckpointMode::parse(&row.mode),
            item_limit: row.item_limit.max(0) as u64,
            start_ts: from_timestamp(row.start_ts),
            end_ts: row.end_ts.map(from_timestamp),
            counts: RunCounts {
                collected: row.collected.max(0) as u64,
                throttle_events: row.throttle_events.max(0) as u64,
                errors: row.errors.max(0) as u64,
                route_rotations: row.route_rotations.max(0) as u64,
                media_downloaded: row.media_downloaded.max(0) as u64,
                media_failed: row.media_failed.max(0) as u64,
            },
        }
    }
}

/// Stored item record from database
#[derive(Debug, Clone, FromRow)]
pub struct ItemRow {
    /// Target identifier
    pub target_id: TargetId,
    /// Item id
    pub item_id: i64,
    /// Unix timestamp of publication
    pub posted_at: Option<i64>,
    /// Text body
    pub text: Option<String>,
    /// "present", "deleted" or "inaccessible"
    pub presence: String,
    /// JSON array of media references
    pub media: String,
    /// JSON payload
    pub payload: String,
    /// Unix timestamp of the last write
    pub stored_at: i64,
}

/// Media download status values
pub mod media_status {
    /// File written to disk
    pub const DOWNLOADED: &str = "downloaded";
    /// Download failed after all retries
    pub const FAILED: &str = "failed";
    /// Not downloaded on purpose (too large, already present)
    pub const SKIPPED: &str = "skipped";
}

/// Media download outcome to be recorded
#[derive(Debug, Clone)]
pub struct NewMediaDownload {
    /// Target identifier
    pub target_id: TargetId,
    /// Item carrying the attachment
    pub item_id: i64,
    /// Attachment locator
    pub locator: String,
    /// One of [`media_status`]
    pub status: &'static str,
    /// Destination path
    pub file_path: Option<String>,
    /// Bytes written
    pub bytes: i64,
    /// Attempts made
    pub attempts: i64,
    /// Failure or skip reason
    pub error: Option<String>,
}

/// Media download record from database
#[derive(Debug, Clone, FromRow)]
pub struct MediaDownloadRow {
    /// Target identifier
    pub target_id: TargetId,
    /// Item carrying the attachment
    pub item_id: i64,
    /// Attachment locator
    pub locator: String,
    /// One of [`media_status`]
    pub status: String,
    /// Destination path
    pub file_path: Option<String>,
    /// Bytes written
    pub bytes: i64,
    /// Attempts made
    pub attempts: i64,
    /// Failure or skip reason
    pub error: Option<String>,
    /// Unix timestamp of the last update
    pub updated_at: i64,
}

/// Database handle for stream-harvest
pub struct Database {
    pool: SqlitePool,
}

fn from_timestamp(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
