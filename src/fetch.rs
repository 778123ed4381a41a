//! Fetch capabilities the collection engine is built against
//!
//! The engine never talks to the remote service itself. It drives a
//! [`BatchFetcher`] chosen at construction time (an API client, a web scraper, a
//! test double) and, when media collection is enabled, a [`MediaFetcher`].

use crate::error::FetchError;
use crate::pool::Route;
use crate::types::{CollectedItem, MediaRef, TargetId};
use async_trait::async_trait;
use std::path::Path;

/// What a fetch backend can reliably report
///
/// The engine only trusts signals a backend declares: removal markers are
/// ignored unless `deletion_detection` is set, edit checksums are only kept when
/// `edit_detection` is set, and gap tracking is skipped without `reliable_ids`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetcherCapabilities {
    /// Explicit removal markers are trustworthy
    pub deletion_detection: bool,
    /// Item text is complete enough to detect edits
    pub edit_detection: bool,
    /// Item ids are dense and increasing, so missing ids are real gaps
    pub reliable_ids: bool,
    /// Media attachments can be downloaded; runs skip media without it
    pub media_download: bool,
}

impl Default for FetcherCapabilities {
    fn default() -> Self {
        Self {
            deletion_detection: false,
            edit_detection: true,
            reliable_ids: true,
            media_download: false,
        }
    }
}

/// One page request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Target to read
    pub target: TargetId,
    /// Return only items with ids strictly greater than this (None = from the start)
    pub after: Option<i64>,
    /// Maximum items to return
    pub page_size: usize,
}

/// One page of results
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedPage {
    /// Items in this page, in any order
    pub items: Vec<CollectedItem>,
    /// Where the next page starts, if the backend knows better than the highest id
    pub next_cursor: Option<i64>,
    /// No items exist beyond this page
    pub end_of_stream: bool,
}

/// Capability that reads pages of a target's stream
///
/// Implementations must be cheap to call repeatedly and must not keep
/// per-target state: the engine owns cursors, sessions and routes.
#[async_trait]
pub trait BatchFetcher: Send + Sync {
    /// Backend name, recorded in run manifests
    fn name(&self) -> &str;

    /// What the backend can reliably report
    fn capabilities(&self) -> FetcherCapabilities {
        FetcherCapabilities::default()
    }

    /// Fetch the next page, over `route` or directly when `route` is None
    ///
    /// # Errors
    ///
    /// `FetchError::Throttled` when the remote rate-limits the request,
    /// `FetchError::Transport` for connection or protocol failures.
    async fn fetch_batch(
        &self,
        route: Option<&Route>,
        request: &FetchRequest,
    ) -> Result<FetchedPage, FetchError>;
}

/// One pending media download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTask {
    /// Target the item belongs to
    pub target: TargetId,
    /// Item carrying the attachment
    pub item_id: i64,
    /// Position of the attachment within the item
    pub index: usize,
    /// Attachment to download
    pub media: MediaRef,
}

impl MediaTask {
    /// File name used on disk: the original name when known, else `<item>_<index>`
    pub fn file_name(&self) -> String {
        match &self.media.file_name {
            Some(name) if !name.is_empty() => format!(
                "{}_{}",
                self.item_id,
                crate::media::sanitize_file_name(name)
            ),
            _ => format!("{}_{}", self.item_id, self.index),
        }
    }
}

/// Capability that downloads media attachments
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Download `task` into `dest`, returning the bytes written
    async fn download(&self, task: &MediaTask, dest: &Path) -> Result<u64, FetchError>;
}
