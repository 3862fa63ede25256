use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use hnr_core::{FeedMembership, FeedType, OrderingRow, PersistedPost, StoryId};
use tokio::sync::Mutex;

use crate::gateway::{PostStore, StoreError};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct MemoryState {
    posts: BTreeMap<StoryId, PersistedPost>,
    memberships: BTreeMap<(FeedType, StoryId), FeedMembership>,
    ordering: BTreeMap<(FeedType, StoryId), OrderingRow>,
    post_upsert_log: Vec<StoryId>,
}

/// In-process store with the same upsert/delete semantics as the Postgres gateway.
#[derive(Debug, Default)]
pub struct MemoryPostStore {
    state: Mutex<MemoryState>,
}

impl MemoryPostStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn post(&self, id: StoryId) -> Option<PersistedPost> {
        self.state.lock().await.posts.get(&id).cloned()
    }

    pub async fn posts(&self) -> Vec<PersistedPost> {
        self.state.lock().await.posts.values().cloned().collect()
    }

    pub async fn memberships(&self, feed: FeedType) -> Vec<FeedMembership> {
        self.state
            .lock()
            .await
            .memberships
            .values()
            .filter(|m| m.feed_type == feed)
            .cloned()
            .collect()
    }

    pub async fn ordering(&self, feed: FeedType) -> Vec<OrderingRow> {
        let mut rows = self
            .state
            .lock()
            .await
            .ordering
            .values()
            .filter(|r| r.feed_type == feed)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|r| r.ordered_at_ms);
        rows
    }

    /// Ids passed to `upsert_post`, in call order.
    pub async fn post_upsert_log(&self) -> Vec<StoryId> {
        self.state.lock().await.post_upsert_log.clone()
    }

    pub async fn clear_post_upsert_log(&self) {
        self.state.lock().await.post_upsert_log.clear();
    }

    /// Copies posts, memberships and ordering rows into a fresh store.
    pub async fn snapshot(&self) -> MemoryPostStore {
        let state = self.state.lock().await.clone();
        MemoryPostStore {
            state: Mutex::new(MemoryState {
                post_upsert_log: Vec::new(),
                ..state
            }),
        }
    }

    /// Compares persisted tables, ignoring the upsert log.
    pub async fn same_contents(&self, other: &MemoryPostStore) -> bool {
        let a = self.state.lock().await;
        let b = other.state.lock().await;
        a.posts == b.posts && a.memberships == b.memberships && a.ordering == b.ordering
    }
}

#[async_trait]
impl PostStore for MemoryPostStore {
    async fn descendant_counts(
        &self,
        ids: &[StoryId],
    ) -> Result<HashMap<StoryId, i64>, StoreError> {
        let state = self.state.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.posts.get(id).map(|p| (*id, p.descendant_count)))
            .collect())
    }

    async fn upsert_post(&self, post: &PersistedPost) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.post_upsert_log.push(post.hn_id);
        match state.posts.get_mut(&post.hn_id) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = PersistedPost {
                    created_at,
                    ..post.clone()
                };
            }
            None => {
                state.posts.insert(post.hn_id, post.clone());
            }
        }
        Ok(())
    }

    async fn membership_ids(&self, feed: FeedType) -> Result<BTreeSet<StoryId>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .memberships
            .keys()
            .filter(|(f, _)| *f == feed)
            .map(|(_, id)| *id)
            .collect())
    }

    async fn upsert_memberships(
        &self,
        feed: FeedType,
        rows: &[FeedMembership],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for row in rows {
            if row.feed_type != feed {
                return Err(StoreError::Message(format!(
                    "membership row for {} in {} batch",
                    row.feed_type, feed
                )));
            }
        }
        for row in rows {
            state.memberships.insert((feed, row.story_id), row.clone());
        }
        Ok(())
    }

    async fn delete_memberships(
        &self,
        feed: FeedType,
        ids: &[StoryId],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let removed = ids
            .iter()
            .filter(|id| state.memberships.remove(&(feed, **id)).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn upsert_ordering(
        &self,
        feed: FeedType,
        rows: &[OrderingRow],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        for row in rows {
            state.ordering.insert((feed, row.story_id), row.clone());
        }
        Ok(())
    }

    async fn delete_ordering(&self, feed: FeedType, ids: &[StoryId]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let removed = ids
            .iter()
            .filter(|id| state.ordering.remove(&(feed, **id)).is_some())
            .count();
        Ok(removed as u64)
    }
}
