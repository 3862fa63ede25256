use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use hnr_core::{FeedMembership, FeedType, OrderingRow, PersistedPost, StoryId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{0}")]
    Message(String),
}

/// Table store the sync pipeline reads from and writes to.
///
/// Every write is an idempotent upsert or a delete keyed by immutable ids. No
/// cross-call transaction is implied: a failed call leaves earlier calls committed.
#[async_trait]
pub trait PostStore: Send + Sync {
    /// Last synced descendant counts from the primary post table, for the ids that exist.
    async fn descendant_counts(
        &self,
        ids: &[StoryId],
    ) -> Result<HashMap<StoryId, i64>, StoreError>;

    /// Upserts one post by `hn_id`. `created_at` is written on insert only.
    async fn upsert_post(&self, post: &PersistedPost) -> Result<(), StoreError>;

    async fn membership_ids(&self, feed: FeedType) -> Result<BTreeSet<StoryId>, StoreError>;

    /// Single batch upsert keyed by `(feed, story_id)`.
    async fn upsert_memberships(
        &self,
        feed: FeedType,
        rows: &[FeedMembership],
    ) -> Result<(), StoreError>;

    /// Single batch delete; returns the number of rows removed.
    async fn delete_memberships(&self, feed: FeedType, ids: &[StoryId])
        -> Result<u64, StoreError>;

    async fn upsert_ordering(&self, feed: FeedType, rows: &[OrderingRow])
        -> Result<(), StoreError>;

    async fn delete_ordering(&self, feed: FeedType, ids: &[StoryId]) -> Result<u64, StoreError>;
}
