//! Collected item storage.
//!
//! Items are upserted by `(target_id, item_id)`, so persisting the same page
//! twice leaves exactly one copy of every item.

use crate::error::{DatabaseError, StorageError};
use crate::storage::ItemStore;
use crate::types::{CollectedItem, ItemPresence, TargetId};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::DateTime;

use super::{Database, ItemRow};

impl Database {
    /// Insert or replace items in a batch
    ///
    /// Automatically chunks the input to stay within SQLite's bind variable limit.
    pub async fn upsert_items(&self, target: &TargetId, items: &[CollectedItem]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }

        // SQLite default SQLITE_MAX_VARIABLE_NUMBER is 999.
        // Each item uses 8 bind variables, so max 124 items per batch.
        const MAX_ITEMS_PER_BATCH: usize = 124;

        let now = chrono::Utc::now().timestamp();
        let mut encoded = Vec::with_capacity(items.len());
        for item in items {
            encoded.push((
                item.item_id,
                item.posted_at.map(|ts| ts.timestamp()),
                item.text.clone(),
                presence_str(item.presence),
                serde_json::to_string(&item.media)?,
                serde_json::to_string(&item.payload)?,
            ));
        }

        // One transaction so a page is stored completely or not at all
        let mut tx = self.pool.begin().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to begin item transaction: {}",
                e
            )))
        })?;

        for chunk in encoded.chunks(MAX_ITEMS_PER_BATCH) {
            let mut query_builder = sqlx::QueryBuilder::new(
                "INSERT INTO items (target_id, item_id, posted_at, text, presence, media, payload, stored_at) ",
            );

            query_builder.push_values(chunk, |mut b, (item_id, posted_at, text, presence, media, payload)| {
                b.push_bind(target.as_str())
                    .push_bind(*item_id)
                    .push_bind(*posted_at)
                    .push_bind(text.as_deref())
                    .push_bind(*presence)
                    .push_bind(media.as_str())
                    .push_bind(payload.as_str())
                    .push_bind(now);
            });
            query_builder.push(
                r#"
                ON CONFLICT(target_id, item_id) DO UPDATE SET
                    posted_at = excluded.posted_at,
                    text = excluded.text,
                    presence = excluded.presence,
                    media = excluded.media,
                    payload = excluded.payload,
                    stored_at = excluded.stored_at
                "#,
            );

            query_builder.build().execute(&mut *tx).await.map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to upsert items batch: {}",
                    e
                )))
            })?;
        }

        tx.commit().await.map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to commit items: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Get one stored item
    pub async fn get_item(&self, target: &TargetId, item_id: i64) -> Result<Option<CollectedItem>> {
        let row = sqlx::query_as::<_, ItemRow>(
            r#"
            SELECT target_id, item_id, posted_at, text, presence, media, payload, stored_at
            FROM items
            WHERE target_id = ? AND item_id = ?
            "#,
        )
        .bind(target)
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get item: {}",
                e
            )))
        })?;

        row.map(item_from_row).transpose()
    }

    /// Number of stored items for a target
    pub async fn count_items(&self, target: &TargetId) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE target_id = ?")
            .bind(target)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to count items: {}",
                    e
                )))
            })?;

        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl ItemStore for Database {
    async fn persist_items(
        &self,
        target: &TargetId,
        items: &[CollectedItem],
    ) -> std::result::Result<(), StorageError> {
        self.upsert_items(target, items).await.map_err(StorageError::from)
    }
}

fn presence_str(presence: ItemPresence) -> &'static str {
    match presence {
        ItemPresence::Present => "present",
        ItemPresence::Deleted => "deleted",
        ItemPresence::Inaccessible => "inaccessible",
    }
}

fn item_from_row(row: ItemRow) -> Result<CollectedItem> {
    let presence = match row.presence.as_str() {
        "deleted" => ItemPresence::Deleted,
        "inaccessible" => ItemPresence::Inaccessible,
        _ => ItemPresence::Present,
    };

    Ok(CollectedItem {
        target: row.target_id,
        item_id: row.item_id,
        posted_at: row.posted_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        text: row.text,
        presence,
        media: serde_json::from_str(&row.media)?,
        payload: serde_json::from_str(&row.payload)?,
    })
}
