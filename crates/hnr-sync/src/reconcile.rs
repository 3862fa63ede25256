use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use hnr_core::{
    Classification, FeedMembership, FeedType, OrderingRow, PersistedPost, StoryId, StoryRecord,
};
use hnr_storage::PostStore;
use tracing::{debug, info, warn};

use crate::clock::{Clock, OrderingStamper};
use crate::detect::classify;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedStory {
    pub record: StoryRecord,
    pub classification: Classification,
}

/// Writes one run intends to make, computed before any of them is issued.
#[derive(Debug, Clone)]
pub struct ReconcilePlan {
    pub feed: FeedType,
    /// Fresh snapshot in upstream order.
    pub stories: Vec<ClassifiedStory>,
    /// Current members absent from the snapshot.
    pub stale: Vec<StoryId>,
    /// Prior state could not be read; stories default to NEW and nothing is deleted.
    pub degraded: bool,
}

impl ReconcilePlan {
    pub fn count(&self, classification: Classification) -> usize {
        self.stories
            .iter()
            .filter(|s| s.classification == classification)
            .count()
    }

    pub fn ids(&self) -> Vec<StoryId> {
        self.stories.iter().map(|s| s.record.id).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub new: usize,
    pub unchanged: usize,
    pub changed: usize,
    pub removed: usize,
    pub failed_post_writes: usize,
    pub partial_failure: bool,
}

/// Applies a fresh feed snapshot to the persistence gateway: primary upserts,
/// membership upsert, stale deletion, then the ordering index.
pub struct Reconciler {
    store: Arc<dyn PostStore>,
    stamper: Arc<OrderingStamper>,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn PostStore>,
        stamper: Arc<OrderingStamper>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            stamper,
            clock,
        }
    }

    /// Reads current membership and last synced counts, then classifies every
    /// record. Issues no writes.
    pub async fn plan(&self, feed: FeedType, records: Vec<StoryRecord>) -> ReconcilePlan {
        let ids = records.iter().map(|r| r.id).collect::<Vec<_>>();
        let mut degraded = false;

        let members = match self.store.membership_ids(feed).await {
            Ok(members) => Some(members),
            Err(err) => {
                warn!(feed = %feed, error = %err, "membership read failed, classifying all as new");
                degraded = true;
                None
            }
        };

        let counts = match &members {
            Some(members) => {
                let known = ids
                    .iter()
                    .copied()
                    .filter(|id| members.contains(id))
                    .collect::<Vec<_>>();
                match self.store.descendant_counts(&known).await {
                    Ok(counts) => counts,
                    Err(err) => {
                        warn!(feed = %feed, error = %err, "descendant count read failed, classifying all as new");
                        degraded = true;
                        HashMap::new()
                    }
                }
            }
            None => HashMap::new(),
        };

        let stories = records
            .into_iter()
            .map(|record| {
                let classification = classify(counts.get(&record.id).copied(), &record);
                ClassifiedStory {
                    record,
                    classification,
                }
            })
            .collect::<Vec<_>>();

        let stale = match members {
            Some(members) => stale_members(&members, &ids),
            None => Vec::new(),
        };

        ReconcilePlan {
            feed,
            stories,
            stale,
            degraded,
        }
    }

    pub async fn apply(&self, plan: &ReconcilePlan) -> ReconcileReport {
        let feed = plan.feed;
        let mut report = ReconcileReport {
            new: plan.count(Classification::New),
            unchanged: plan.count(Classification::Unchanged),
            changed: plan.count(Classification::Changed),
            partial_failure: plan.degraded,
            ..ReconcileReport::default()
        };

        // Sequential, upstream order.
        for story in &plan.stories {
            let post = PersistedPost::from(&story.record);
            if let Err(err) = self.store.upsert_post(&post).await {
                warn!(feed = %feed, hn_id = %post.hn_id, error = %err, "post upsert failed, continuing");
                report.failed_post_writes += 1;
            }
        }

        let seen_at = self.clock.now();
        let memberships = plan
            .stories
            .iter()
            .map(|s| FeedMembership {
                feed_type: feed,
                story_id: s.record.id,
                last_seen_at: seen_at,
                needs_enrichment: s.classification.needs_enrichment(),
            })
            .collect::<Vec<_>>();
        if !memberships.is_empty() {
            if let Err(err) = self.store.upsert_memberships(feed, &memberships).await {
                warn!(feed = %feed, rows = memberships.len(), error = %err, "membership upsert failed");
                report.partial_failure = true;
            }
        }

        if !plan.stale.is_empty() {
            match self.store.delete_memberships(feed, &plan.stale).await {
                Ok(removed) => report.removed = removed as usize,
                Err(err) => {
                    warn!(feed = %feed, rows = plan.stale.len(), error = %err, "stale membership delete failed");
                    report.partial_failure = true;
                }
            }
            if let Err(err) = self.store.delete_ordering(feed, &plan.stale).await {
                warn!(feed = %feed, error = %err, "stale ordering delete failed");
                report.partial_failure = true;
            }
        }

        let keys = self
            .stamper
            .reserve(seen_at.timestamp_millis(), plan.stories.len());
        let ordering = plan
            .stories
            .iter()
            .zip(keys)
            .map(|(s, ordered_at_ms)| OrderingRow {
                feed_type: feed,
                story_id: s.record.id,
                ordered_at_ms,
            })
            .collect::<Vec<_>>();
        if !ordering.is_empty() {
            if let Err(err) = self.store.upsert_ordering(feed, &ordering).await {
                warn!(feed = %feed, error = %err, "ordering upsert failed");
                report.partial_failure = true;
            }
        }

        info!(
            feed = %feed,
            new = report.new,
            unchanged = report.unchanged,
            changed = report.changed,
            removed = report.removed,
            failed_post_writes = report.failed_post_writes,
            partial_failure = report.partial_failure,
            "reconciled feed"
        );
        report
    }

    pub async fn reconcile(&self, feed: FeedType, records: Vec<StoryRecord>) -> ReconcileReport {
        let plan = self.plan(feed, records).await;
        debug!(feed = %feed, stories = plan.stories.len(), stale = plan.stale.len(), "planned reconcile");
        self.apply(&plan).await
    }
}

fn stale_members(members: &BTreeSet<StoryId>, fresh: &[StoryId]) -> Vec<StoryId> {
    let fresh = fresh.iter().collect::<HashSet<_>>();
    members
        .iter()
        .filter(|id| !fresh.contains(id))
        .copied()
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use hnr_storage::{MemoryPostStore, StoreError};

    use crate::clock::ManualClock;

    pub(crate) fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).single().unwrap()
    }

    pub(crate) fn record(id: i64, descendants: i64) -> StoryRecord {
        StoryRecord {
            id: StoryId(id),
            title: format!("story {id}"),
            url: None,
            score: 10,
            author: "alice".into(),
            created_at: Utc.with_ymd_and_hms(2026, 9, 30, 8, 0, 0).single().unwrap(),
            descendant_count: descendants,
            text: None,
        }
    }

    fn reconciler(store: Arc<dyn PostStore>) -> Reconciler {
        Reconciler::new(
            store,
            Arc::new(OrderingStamper::new()),
            Arc::new(ManualClock::new(at())),
        )
    }

    /// Seeds a store as if `records` had been synced into `feed` earlier.
    pub(crate) async fn seeded(feed: FeedType, records: &[StoryRecord]) -> Arc<MemoryPostStore> {
        let store = Arc::new(MemoryPostStore::new());
        reconciler(store.clone())
            .reconcile(feed, records.to_vec())
            .await;
        store.clear_post_upsert_log().await;
        store
    }

    #[derive(Default)]
    pub(crate) struct Failures {
        pub(crate) membership_read: bool,
        pub(crate) membership_upsert: bool,
        pub(crate) membership_delete: bool,
        pub(crate) posts: Vec<i64>,
    }

    pub(crate) struct FlakyStore {
        pub(crate) inner: Arc<MemoryPostStore>,
        pub(crate) fail: Failures,
    }

    fn boom() -> StoreError {
        StoreError::Message("connection reset".into())
    }

    #[async_trait]
    impl PostStore for FlakyStore {
        async fn descendant_counts(
            &self,
            ids: &[StoryId],
        ) -> Result<HashMap<StoryId, i64>, StoreError> {
            self.inner.descendant_counts(ids).await
        }

        async fn upsert_post(&self, post: &PersistedPost) -> Result<(), StoreError> {
            if self.fail.posts.contains(&post.hn_id.get()) {
                return Err(boom());
            }
            self.inner.upsert_post(post).await
        }

        async fn membership_ids(&self, feed: FeedType) -> Result<BTreeSet<StoryId>, StoreError> {
            if self.fail.membership_read {
                return Err(boom());
            }
            self.inner.membership_ids(feed).await
        }

        async fn upsert_memberships(
            &self,
            feed: FeedType,
            rows: &[FeedMembership],
        ) -> Result<(), StoreError> {
            if self.fail.membership_upsert {
                return Err(boom());
            }
            self.inner.upsert_memberships(feed, rows).await
        }

        async fn delete_memberships(
            &self,
            feed: FeedType,
            ids: &[StoryId],
        ) -> Result<u64, StoreError> {
            if self.fail.membership_delete {
                return Err(boom());
            }
            self.inner.delete_memberships(feed, ids).await
        }

        async fn upsert_ordering(
            &self,
            feed: FeedType,
            rows: &[OrderingRow],
        ) -> Result<(), StoreError> {
            self.inner.upsert_ordering(feed, rows).await
        }

        async fn delete_ordering(
            &self,
            feed: FeedType,
            ids: &[StoryId],
        ) -> Result<u64, StoreError> {
            self.inner.delete_ordering(feed, ids).await
        }
    }

    async fn membership_map(store: &MemoryPostStore, feed: FeedType) -> Vec<(i64, bool)> {
        store
            .memberships(feed)
            .await
            .into_iter()
            .map(|m| (m.story_id.get(), m.needs_enrichment))
            .collect()
    }

    #[tokio::test]
    async fn show_scenario_new_and_changed() {
        let store = seeded(FeedType::Show, &[record(502, 10), record(400, 1)]).await;
        let report = reconciler(store.clone())
            .reconcile(FeedType::Show, vec![record(501, 3), record(502, 12)])
            .await;

        assert_eq!((report.new, report.changed, report.unchanged), (1, 1, 0));
        assert_eq!(report.removed, 1);
        assert!(!report.partial_failure);
        assert_eq!(
            membership_map(&store, FeedType::Show).await,
            vec![(501, true), (502, true)]
        );
        assert_eq!(store.post(StoryId(502)).await.unwrap().descendant_count, 12);
        assert!(store.post(StoryId(501)).await.is_some());
        // Posts are never deleted.
        assert!(store.post(StoryId(400)).await.is_some());
    }

    #[tokio::test]
    async fn show_scenario_unchanged_count_clears_enrichment_flag() {
        let store = seeded(FeedType::Show, &[record(502, 10)]).await;
        let report = reconciler(store.clone())
            .reconcile(FeedType::Show, vec![record(501, 3), record(502, 10)])
            .await;

        assert_eq!((report.new, report.changed, report.unchanged), (1, 0, 1));
        assert_eq!(
            membership_map(&store, FeedType::Show).await,
            vec![(501, true), (502, false)]
        );
    }

    #[tokio::test]
    async fn classifications_partition_the_snapshot() {
        let store = seeded(FeedType::News, &[record(1, 5), record(2, 5), record(9, 0)]).await;
        let plan = reconciler(store)
            .plan(
                FeedType::News,
                vec![record(1, 5), record(2, 6), record(3, 0), record(4, 2)],
            )
            .await;

        let total = plan.count(Classification::New)
            + plan.count(Classification::Unchanged)
            + plan.count(Classification::Changed);
        assert_eq!(total, plan.stories.len());
        assert_eq!(plan.count(Classification::Unchanged), 1);
        assert_eq!(plan.count(Classification::Changed), 1);
        assert_eq!(plan.count(Classification::New), 2);
        assert_eq!(plan.stale, vec![StoryId(9)]);
    }

    #[tokio::test]
    async fn membership_in_another_feed_does_not_count_as_seen() {
        let store = seeded(FeedType::FrontPage, &[record(7, 4)]).await;
        let plan = reconciler(store)
            .plan(FeedType::Ask, vec![record(7, 4)])
            .await;
        assert_eq!(plan.stories[0].classification, Classification::New);
    }

    #[tokio::test]
    async fn membership_converges_to_snapshot() {
        let store = seeded(FeedType::Ask, &[record(1, 0), record(2, 0), record(3, 0)]).await;

        reconciler(store.clone())
            .reconcile(FeedType::Ask, vec![record(3, 1), record(4, 0)])
            .await;

        let ids = store
            .membership_ids(FeedType::Ask)
            .await
            .unwrap()
            .into_iter()
            .map(StoryId::get)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![3, 4]);
        let ordered = store
            .ordering(FeedType::Ask)
            .await
            .into_iter()
            .map(|r| r.story_id.get())
            .collect::<Vec<_>>();
        assert_eq!(ordered, vec![3, 4]);
    }

    #[tokio::test]
    async fn feeds_are_independent_partitions() {
        let store = seeded(FeedType::Show, &[record(5, 1)]).await;
        reconciler(store.clone())
            .reconcile(FeedType::FrontPage, vec![record(6, 1)])
            .await;

        assert_eq!(membership_map(&store, FeedType::Show).await, vec![(5, true)]);
        assert_eq!(
            membership_map(&store, FeedType::FrontPage).await,
            vec![(6, true)]
        );
    }

    #[tokio::test]
    async fn primary_upserts_follow_upstream_order() {
        let store = Arc::new(MemoryPostStore::new());
        let upstream = [42, 7, 99, 13];
        reconciler(store.clone())
            .reconcile(
                FeedType::News,
                upstream.iter().map(|id| record(*id, 0)).collect(),
            )
            .await;

        let log = store
            .post_upsert_log()
            .await
            .into_iter()
            .map(StoryId::get)
            .collect::<Vec<_>>();
        assert_eq!(log, upstream);
    }

    #[tokio::test]
    async fn same_snapshot_from_same_state_is_idempotent() {
        let snapshot = vec![record(1, 2), record(2, 8), record(3, 0)];
        let start = seeded(FeedType::News, &[record(2, 5), record(4, 1)]).await;
        let a = Arc::new(start.snapshot().await);
        let b = Arc::new(start.snapshot().await);

        reconciler(a.clone()).reconcile(FeedType::News, snapshot.clone()).await;
        reconciler(b.clone()).reconcile(FeedType::News, snapshot.clone()).await;
        assert!(a.same_contents(&b).await);

        let posts_before = a.posts().await;
        let second = reconciler(a.clone()).reconcile(FeedType::News, snapshot).await;
        assert_eq!(second.removed, 0);
        assert_eq!(second.unchanged, 3);
        assert_eq!(a.posts().await, posts_before);
        assert_eq!(
            a.membership_ids(FeedType::News).await.unwrap(),
            b.membership_ids(FeedType::News).await.unwrap()
        );
    }

    #[tokio::test]
    async fn created_at_survives_later_syncs() {
        let store = seeded(FeedType::News, &[record(1, 0)]).await;
        let original = store.post(StoryId(1)).await.unwrap().created_at;

        let mut moved = record(1, 3);
        moved.created_at = at();
        reconciler(store.clone()).reconcile(FeedType::News, vec![moved]).await;

        let post = store.post(StoryId(1)).await.unwrap();
        assert_eq!(post.created_at, original);
        assert_eq!(post.descendant_count, 3);
    }

    #[tokio::test]
    async fn ordering_keys_strictly_increase_within_a_batch() {
        let store = Arc::new(MemoryPostStore::new());
        let recon = reconciler(store.clone());
        recon
            .reconcile(FeedType::Show, (1..=50).map(|id| record(id, 0)).collect())
            .await;

        let rows = store.ordering(FeedType::Show).await;
        assert_eq!(rows.len(), 50);
        assert!(rows.windows(2).all(|w| w[0].ordered_at_ms < w[1].ordered_at_ms));
        let ranked = rows.iter().map(|r| r.story_id.get()).collect::<Vec<_>>();
        assert_eq!(ranked, (1..=50).collect::<Vec<_>>());
        assert_eq!(rows[0].ordered_at_ms, at().timestamp_millis());

        // Same clock reading, later batch: keys continue past the first batch.
        recon
            .reconcile(FeedType::Show, vec![record(1, 0)])
            .await;
        let first = store.ordering(FeedType::Show).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].ordered_at_ms, at().timestamp_millis() + 50);
    }

    #[tokio::test]
    async fn failed_post_write_is_skipped_without_partial_flag() {
        let inner = Arc::new(MemoryPostStore::new());
        let store = Arc::new(FlakyStore {
            inner: inner.clone(),
            fail: Failures {
                posts: vec![2],
                ..Failures::default()
            },
        });

        let report = reconciler(store)
            .reconcile(FeedType::Ask, vec![record(1, 0), record(2, 0), record(3, 0)])
            .await;

        assert_eq!(report.failed_post_writes, 1);
        assert!(!report.partial_failure);
        assert!(inner.post(StoryId(2)).await.is_none());
        assert_eq!(inner.posts().await.len(), 2);
        assert_eq!(inner.memberships(FeedType::Ask).await.len(), 3);
    }

    #[tokio::test]
    async fn batch_failures_flag_partial_without_rollback() {
        let inner = seeded(FeedType::Show, &[record(1, 0), record(9, 0)]).await;
        let store = Arc::new(FlakyStore {
            inner: inner.clone(),
            fail: Failures {
                membership_upsert: true,
                membership_delete: true,
                ..Failures::default()
            },
        });

        let report = reconciler(store)
            .reconcile(FeedType::Show, vec![record(1, 4), record(2, 0)])
            .await;

        assert!(report.partial_failure);
        assert_eq!(report.removed, 0);
        assert_eq!(inner.post(StoryId(1)).await.unwrap().descendant_count, 4);
        assert!(inner.post(StoryId(2)).await.is_some());
        let ids = inner.membership_ids(FeedType::Show).await.unwrap();
        assert!(ids.contains(&StoryId(9)));
    }

    #[tokio::test]
    async fn unreadable_membership_classifies_new_and_skips_deletion() {
        let inner = seeded(FeedType::Show, &[record(1, 0), record(9, 0)]).await;
        let store = Arc::new(FlakyStore {
            inner: inner.clone(),
            fail: Failures {
                membership_read: true,
                ..Failures::default()
            },
        });

        let report = reconciler(store)
            .reconcile(FeedType::Show, vec![record(1, 0)])
            .await;

        assert!(report.partial_failure);
        assert_eq!(report.new, 1);
        assert_eq!(report.removed, 0);
        assert!(inner
            .membership_ids(FeedType::Show)
            .await
            .unwrap()
            .contains(&StoryId(9)));
    }
}
