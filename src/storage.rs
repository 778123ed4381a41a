//! Storage collaborator for collected items

use crate::error::StorageError;
use crate::types::{CollectedItem, TargetId};
use async_trait::async_trait;

/// Destination for collected items
///
/// `persist_items` must be an idempotent upsert keyed by item id: the engine
/// re-submits a page whenever a crash hit between persisting it and advancing
/// the checkpoint.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Store `items` for `target`, replacing earlier copies of the same ids
    async fn persist_items(
        &self,
        target: &TargetId,
        items: &[CollectedItem],
    ) -> Result<(), StorageError>;
}
