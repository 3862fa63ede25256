use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use hnr_adapters::{AdapterContext, AdapterError, ContentSource};
use hnr_core::{FeedType, StoryId, StoryRecord};
use hnr_storage::DispatchLimiter;
use tracing::{debug, info, warn};

/// Records fetched for one feed, in upstream order.
#[derive(Debug, Clone, Default)]
pub struct FetchedSnapshot {
    /// Unique ids the upstream listed, before truncation to the limit.
    pub listed: usize,
    pub requested: Vec<StoryId>,
    pub records: Vec<StoryRecord>,
    pub failed: Vec<StoryId>,
    pub invalid: Vec<StoryId>,
}

impl FetchedSnapshot {
    pub fn has_more(&self) -> bool {
        self.listed > self.requested.len()
    }

    pub fn ids(&self) -> Vec<StoryId> {
        self.records.iter().map(|r| r.id).collect()
    }
}

/// Fetches the top `limit` stories of a feed through a dispatch limiter.
/// Fetches may overlap, but results keep upstream order.
pub struct StoryFetcher {
    source: Arc<dyn ContentSource>,
    limiter: Arc<DispatchLimiter>,
}

enum ItemOutcome {
    Valid(StoryRecord),
    Invalid,
    Failed,
}

impl StoryFetcher {
    pub fn new(source: Arc<dyn ContentSource>, limiter: Arc<DispatchLimiter>) -> Self {
        Self { source, limiter }
    }

    /// Fails only when the id list itself cannot be fetched.
    pub async fn fetch(
        &self,
        ctx: &AdapterContext,
        feed: FeedType,
        limit: usize,
    ) -> Result<FetchedSnapshot, AdapterError> {
        let listed = self.source.list_story_ids(ctx, feed).await?;

        let mut seen = HashSet::with_capacity(listed.len());
        let unique = listed
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect::<Vec<_>>();
        let requested = unique.iter().copied().take(limit).collect::<Vec<_>>();

        let outcomes = stream::iter(requested.iter().copied())
            .map(|id| self.fetch_one(ctx, id))
            .buffered(self.limiter.max_in_flight())
            .collect::<Vec<_>>()
            .await;

        let mut snapshot = FetchedSnapshot {
            listed: unique.len(),
            requested,
            ..FetchedSnapshot::default()
        };
        for (id, outcome) in outcomes {
            match outcome {
                ItemOutcome::Valid(record) => snapshot.records.push(record),
                ItemOutcome::Invalid => snapshot.invalid.push(id),
                ItemOutcome::Failed => snapshot.failed.push(id),
            }
        }

        info!(
            feed = %feed,
            listed = snapshot.listed,
            requested = snapshot.requested.len(),
            fetched = snapshot.records.len(),
            failed = snapshot.failed.len(),
            invalid = snapshot.invalid.len(),
            "fetched feed snapshot"
        );
        Ok(snapshot)
    }

    async fn fetch_one(&self, ctx: &AdapterContext, id: StoryId) -> (StoryId, ItemOutcome) {
        let _permit = self.limiter.acquire().await;
        let outcome = match self.source.fetch_story(ctx, id).await {
            Ok(Some(item)) => match item.into_story_record(ctx.fetched_at) {
                Ok(record) if record.id == id => ItemOutcome::Valid(record),
                Ok(record) => {
                    warn!(hn_id = %id, returned = %record.id, "upstream returned a different item");
                    ItemOutcome::Invalid
                }
                Err(reason) => {
                    debug!(hn_id = %id, %reason, "dropping invalid story");
                    ItemOutcome::Invalid
                }
            },
            Ok(None) => {
                debug!(hn_id = %id, "upstream has no such item");
                ItemOutcome::Invalid
            }
            Err(err) => {
                warn!(hn_id = %id, error = %err, "story fetch failed, skipping");
                ItemOutcome::Failed
            }
        };
        (id, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet as Set;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use hnr_adapters::{FixtureContentSource, HnItem};
    use uuid::Uuid;

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }

    fn limiter() -> Arc<DispatchLimiter> {
        Arc::new(DispatchLimiter::new(4, Duration::ZERO))
    }

    /// Wraps a source, failing selected item fetches and optionally the list call.
    struct FlakySource {
        inner: FixtureContentSource,
        failing_items: Set<i64>,
        fail_list: bool,
    }

    #[async_trait]
    impl ContentSource for FlakySource {
        fn source_id(&self) -> &'static str {
            "flaky"
        }

        async fn list_story_ids(
            &self,
            ctx: &AdapterContext,
            feed: FeedType,
        ) -> Result<Vec<StoryId>, AdapterError> {
            if self.fail_list {
                return Err(AdapterError::Message("list unavailable".into()));
            }
            self.inner.list_story_ids(ctx, feed).await
        }

        async fn fetch_story(
            &self,
            ctx: &AdapterContext,
            id: StoryId,
        ) -> Result<Option<HnItem>, AdapterError> {
            if self.failing_items.contains(&id.get()) {
                // Stagger so later items finish first.
                tokio::time::sleep(Duration::from_millis(5)).await;
                return Err(AdapterError::Message("timeout".into()));
            }
            self.inner.fetch_story(ctx, id).await
        }
    }

    #[tokio::test]
    async fn keeps_upstream_order_and_truncates_to_limit() {
        let source = FixtureContentSource::new()
            .with_feed(FeedType::News, [30, 10, 20, 40])
            .with_story(30, "thirty", 1)
            .with_story(10, "ten", 1)
            .with_story(20, "twenty", 1)
            .with_story(40, "forty", 1);
        let fetcher = StoryFetcher::new(Arc::new(source), limiter());

        let snapshot = fetcher.fetch(&ctx(), FeedType::News, 3).await.unwrap();
        assert_eq!(snapshot.ids(), vec![StoryId(30), StoryId(10), StoryId(20)]);
        assert!(snapshot.has_more());
    }

    #[tokio::test]
    async fn duplicate_ids_are_fetched_once() {
        let source = FixtureContentSource::new()
            .with_feed(FeedType::Ask, [1, 2, 1, 3])
            .with_story(1, "one", 0)
            .with_story(2, "two", 0)
            .with_story(3, "three", 0);
        let fetcher = StoryFetcher::new(Arc::new(source), limiter());

        let snapshot = fetcher.fetch(&ctx(), FeedType::Ask, 10).await.unwrap();
        assert_eq!(snapshot.ids(), vec![StoryId(1), StoryId(2), StoryId(3)]);
        assert_eq!(snapshot.listed, 3);
        assert!(!snapshot.has_more());
    }

    #[tokio::test]
    async fn item_failures_and_invalid_records_are_skipped() {
        let inner = FixtureContentSource::new()
            .with_feed(FeedType::Show, [1, 2, 3, 4, 5])
            .with_story(1, "one", 0)
            .with_story(2, "two", 0)
            .with_item(HnItem {
                id: Some(3),
                title: None,
                ..HnItem::default()
            })
            .with_story(5, "five", 0);
        let source = FlakySource {
            inner,
            failing_items: Set::from([2]),
            fail_list: false,
        };
        let fetcher = StoryFetcher::new(Arc::new(source), limiter());

        let snapshot = fetcher.fetch(&ctx(), FeedType::Show, 5).await.unwrap();
        assert_eq!(snapshot.ids(), vec![StoryId(1), StoryId(5)]);
        assert_eq!(snapshot.failed, vec![StoryId(2), StoryId(4)]);
        assert_eq!(snapshot.invalid, vec![StoryId(3)]);
    }

    #[tokio::test]
    async fn list_failure_is_an_error() {
        let source = FlakySource {
            inner: FixtureContentSource::new(),
            failing_items: Set::new(),
            fail_list: true,
        };
        let fetcher = StoryFetcher::new(Arc::new(source), limiter());
        assert!(fetcher.fetch(&ctx(), FeedType::FrontPage, 5).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_respect_min_interval() {
        let source = FixtureContentSource::new()
            .with_feed(FeedType::News, [1, 2, 3])
            .with_story(1, "one", 0)
            .with_story(2, "two", 0)
            .with_story(3, "three", 0);
        let fetcher = StoryFetcher::new(
            Arc::new(source),
            Arc::new(DispatchLimiter::new(3, Duration::from_millis(250))),
        );

        let start = tokio::time::Instant::now();
        let snapshot = fetcher.fetch(&ctx(), FeedType::News, 3).await.unwrap();
        assert_eq!(snapshot.records.len(), 3);
        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}
