//! Core types for stream-harvest

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identifier of one collection target (e.g. a channel handle)
///
/// Opaque to the engine; it is only compared, stored and handed back to the
/// fetch capability.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(pub String);

impl TargetId {
    /// Create a new TargetId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TargetId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TargetId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TargetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// TEXT column encoding so target ids bind directly in queries
impl sqlx::Type<sqlx::Sqlite> for TargetId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <String as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <String as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TargetId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TargetId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <String as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Whether the remote still serves an item
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemPresence {
    /// Item content was returned
    #[default]
    Present,
    /// The remote explicitly reported the item as removed
    Deleted,
    /// The remote reported the item exists but cannot be read
    Inaccessible,
}

/// Reference to a media attachment that can be downloaded separately
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// Opaque locator understood by the media fetch capability
    pub locator: String,
    /// Media category (photo, video, document, audio, ...)
    pub kind: String,
    /// Original file name, if known
    pub file_name: Option<String>,
    /// MIME type, if known
    pub mime_type: Option<String>,
    /// Size in bytes, if known
    pub size_bytes: Option<u64>,
}

/// One item of a collected stream
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectedItem {
    /// Target the item belongs to
    pub target: TargetId,
    /// Remote item identifier (positive, increasing along the stream)
    pub item_id: i64,
    /// When the item was published
    pub posted_at: Option<DateTime<Utc>>,
    /// Text body, if any
    pub text: Option<String>,
    /// Explicit presence signal from the remote
    #[serde(default)]
    pub presence: ItemPresence,
    /// Attached media
    #[serde(default)]
    pub media: Vec<MediaRef>,
    /// Remaining fields, kept verbatim for the storage collaborator
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CollectedItem {
    /// Create a present text item
    pub fn new(target: TargetId, item_id: i64, text: impl Into<String>) -> Self {
        Self {
            target,
            item_id,
            posted_at: None,
            text: Some(text.into()),
            presence: ItemPresence::Present,
            media: Vec::new(),
            payload: serde_json::Value::Null,
        }
    }

    /// Create a removal marker for an item the remote reported as deleted
    pub fn deleted(target: TargetId, item_id: i64) -> Self {
        Self {
            target,
            item_id,
            posted_at: None,
            text: None,
            presence: ItemPresence::Deleted,
            media: Vec::new(),
            payload: serde_json::Value::Null,
        }
    }
}

/// Options for one collection of one target
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectOptions {
    /// Maximum number of items to yield (0 = unbounded)
    #[serde(default)]
    pub limit: usize,
    /// Resume after the stored checkpoint instead of starting over
    #[serde(default = "default_true")]
    pub resume: bool,
    /// Queue media attachments for download
    #[serde(default)]
    pub media_fetch: bool,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            limit: 0,
            resume: true,
            media_fetch: false,
        }
    }
}

fn default_true() -> bool {
    true
}

/// How the next collection of a target begins
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointMode {
    /// Continue strictly after `last_item_id`
    Incremental,
    /// Start again from the beginning of the stream
    Full,
}

impl CheckpointMode {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointMode::Incremental => "incremental",
            CheckpointMode::Full => "full",
        }
    }

    /// Parse the database representation (unknown values restart from scratch)
    pub fn parse(value: &str) -> Self {
        match value {
            "incremental" => CheckpointMode::Incremental,
            _ => CheckpointMode::Full,
        }
    }
}

/// Durable position of a target's collection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Target this checkpoint belongs to
    pub target_id: TargetId,
    /// Highest item id committed (0 = no position)
    pub last_item_id: i64,
    /// When the checkpoint was last advanced
    pub last_run_at: DateTime<Utc>,
    /// Resume or restart on the next run
    pub mode: CheckpointMode,
    /// Total items committed across all runs
    pub items_collected: i64,
}

impl Checkpoint {
    /// Position to resume after, if this checkpoint asks for an incremental run
    pub fn resume_after(&self) -> Option<i64> {
        match self.mode {
            CheckpointMode::Incremental if self.last_item_id > 0 => Some(self.last_item_id),
            _ => None,
        }
    }
}

/// Reconciliation status of one expected item id
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContinuityStatus {
    /// Item was collected
    Observed,
    /// Remote explicitly reported the item as removed
    Deleted,
    /// Item exists but cannot be accessed
    Inaccessible,
    /// Gap detected, status not yet determined
    Unknown,
    /// Item was collected and its text changed since an earlier observation
    Edited,
}

impl ContinuityStatus {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ContinuityStatus::Observed => "observed",
            ContinuityStatus::Deleted => "deleted",
            ContinuityStatus::Inaccessible => "inaccessible",
            ContinuityStatus::Unknown => "unknown",
            ContinuityStatus::Edited => "edited",
        }
    }

    /// Parse the database representation
    pub fn parse(value: &str) -> Self {
        match value {
            "observed" => ContinuityStatus::Observed,
            "deleted" => ContinuityStatus::Deleted,
            "inaccessible" => ContinuityStatus::Inaccessible,
            "edited" => ContinuityStatus::Edited,
            _ => ContinuityStatus::Unknown,
        }
    }

    /// Whether the item's content was collected
    pub fn is_observed(&self) -> bool {
        matches!(self, ContinuityStatus::Observed | ContinuityStatus::Edited)
    }
}

impl From<ItemPresence> for ContinuityStatus {
    fn from(presence: ItemPresence) -> Self {
        match presence {
            ItemPresence::Present => ContinuityStatus::Observed,
            ItemPresence::Deleted => ContinuityStatus::Deleted,
            ItemPresence::Inaccessible => ContinuityStatus::Inaccessible,
        }
    }
}

/// One row of the continuity ledger
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuityRecord {
    /// Target the id belongs to
    pub target_id: TargetId,
    /// Expected item id
    pub expected_item_id: i64,
    /// Current reconciliation status
    pub status: ContinuityStatus,
    /// First time this id was recorded
    pub first_seen_at: DateTime<Utc>,
    /// Last time this id was (re)checked
    pub last_checked_at: DateTime<Utc>,
    /// Checksum of the last observed text
    pub text_checksum: Option<String>,
}

/// Data-quality metrics for one target
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinuityMetrics {
    /// Ids in the dense range `[min_seen, max_seen]`
    pub expected: u64,
    /// Ids observed (including edited ones)
    pub observed: u64,
    /// Ids explicitly reported as deleted
    pub deleted: u64,
    /// Ids reported as inaccessible
    pub inaccessible: u64,
    /// Ids neither observed nor deleted (unknown rows, inaccessible rows and missing rows)
    pub gaps: u64,
    /// Observed ids whose text changed between observations
    pub edited: u64,
    /// Gaps over expected
    pub gap_ratio: f64,
    /// Deleted over expected
    pub deletion_rate: f64,
    /// Observed over expected
    pub coverage_rate: f64,
    /// Edited over observed
    pub edit_rate: f64,
    /// Earliest observation recorded in the status history
    pub first_observed_at: Option<DateTime<Utc>>,
    /// Latest observation recorded in the status history
    pub last_observed_at: Option<DateTime<Utc>>,
}

impl ContinuityMetrics {
    /// Build metrics from raw counts
    pub fn from_counts(
        expected: u64,
        observed: u64,
        deleted: u64,
        inaccessible: u64,
        edited: u64,
    ) -> Self {
        let gaps = expected.saturating_sub(observed + deleted);
        let ratio = |num: u64, den: u64| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        Self {
            expected,
            observed,
            deleted,
            inaccessible,
            gaps,
            edited,
            gap_ratio: ratio(gaps, expected),
            deletion_rate: ratio(deleted, expected),
            coverage_rate: ratio(observed, expected),
            edit_rate: ratio(edited, observed),
            first_observed_at: None,
            last_observed_at: None,
        }
    }

    /// Plain-language description of collection completeness for reports
    pub fn methodology_statement(&self, target: &TargetId) -> String {
        let mut statement = format!("Data collection for target '{}' ", target);
        if let (Some(start), Some(end)) = (self.first_observed_at, self.last_observed_at) {
            statement.push_str(&format!(
                "occurred between {} and {}. ",
                start.format("%Y-%m-%d"),
                end.format("%Y-%m-%d")
            ));
        }
        statement.push_str(&format!(
            "Approximately {:.1}% of item ids within the observed range were unavailable at \
             collection time, consistent with deletion or access restrictions. ",
            self.gap_ratio * 100.0
        ));
        if self.deletion_rate > 0.0 {
            statement.push_str(&format!(
                "The confirmed deletion rate was {:.1}%. ",
                self.deletion_rate * 100.0
            ));
        }
        if self.edit_rate > 0.0 {
            statement.push_str(&format!(
                "Approximately {:.1}% of collected items showed evidence of post-publication \
                 editing. ",
                self.edit_rate * 100.0
            ));
        }
        statement.trim_end().to_string()
    }
}

/// Counters accumulated during one run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Items committed
    pub collected: u64,
    /// Throttle signals received
    pub throttle_events: u64,
    /// Errors encountered (recovered or not)
    pub errors: u64,
    /// Route rotations performed
    pub route_rotations: u64,
    /// Media files downloaded
    pub media_downloaded: u64,
    /// Media downloads that failed after retries
    pub media_failed: u64,
}

/// Reporting record for one run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    /// Run identifier
    pub run_id: String,
    /// Name of the fetch capability used
    pub fetcher: String,
    /// Targets collected in this run
    pub target_ids: Vec<TargetId>,
    /// Whether targets resumed from checkpoints
    pub mode: CheckpointMode,
    /// Per-target item limit (0 = unbounded)
    pub item_limit: u64,
    /// When the run started
    pub start_ts: DateTime<Utc>,
    /// When the run was finalized
    pub end_ts: Option<DateTime<Utc>>,
    /// Run counters
    pub counts: RunCounts,
}

/// How a target's collection ended
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetOutcome {
    /// The remote signalled end of stream
    Exhausted,
    /// The item limit was reached
    LimitReached,
    /// The run was cancelled
    Cancelled,
    /// Collection failed
    Failed {
        /// Error description
        error: String,
    },
}

/// Per-target summary returned by `Collector::collect_all`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetReport {
    /// Target collected
    pub target: TargetId,
    /// Items yielded in this run
    pub items: u64,
    /// Last committed checkpoint
    pub last_checkpoint: Option<i64>,
    /// How collection ended
    pub outcome: TargetOutcome,
}

/// Progress events broadcast by the collector
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A run was started
    RunStarted {
        /// Run identifier
        run_id: String,
        /// Targets of the run
        targets: Vec<TargetId>,
    },

    /// A page was persisted and the checkpoint advanced
    PageCommitted {
        /// Target
        target: TargetId,
        /// Items in the page
        items: usize,
        /// New checkpoint
        checkpoint: i64,
    },

    /// A throttle signal was received
    Throttled {
        /// Target
        target: TargetId,
        /// Route in use, if any
        #[serde(skip_serializing_if = "Option::is_none")]
        route: Option<String>,
        /// How long the session waits
        wait: Duration,
    },

    /// A session switched routes
    RouteRotated {
        /// Target
        target: TargetId,
        /// Previous route
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        /// New route (None = direct)
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },

    /// A route was declared dead
    RouteDead {
        /// Route identifier
        route: String,
    },

    /// A target finished without error
    TargetComplete {
        /// Target
        target: TargetId,
        /// Items yielded in this run
        items: u64,
        /// How it ended
        outcome: TargetOutcome,
    },

    /// A target failed
    TargetFailed {
        /// Target
        target: TargetId,
        /// Error description
        error: String,
        /// Last committed checkpoint
        #[serde(skip_serializing_if = "Option::is_none")]
        last_checkpoint: Option<i64>,
    },

    /// A media file was downloaded
    MediaDownloaded {
        /// Target
        target: TargetId,
        /// Item the media belongs to
        item_id: i64,
        /// Bytes written
        bytes: u64,
    },

    /// A media download failed after its retries
    MediaFailed {
        /// Target
        target: TargetId,
        /// Item the media belongs to
        item_id: i64,
        /// Error description
        error: String,
    },

    /// A run was finalized
    RunFinished {
        /// Run identifier
        run_id: String,
        /// Final counters
        counts: RunCounts,
    },
}
