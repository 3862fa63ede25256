use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hnr_core::{FeedMembership, FeedType, OrderingRow, PersistedPost, StoryId};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::info;

use crate::gateway::{PostStore, StoreError};

/// Rewrites only when a content column changed, so a repeated write leaves
/// `updated_at` alone.
const UPSERT_POST_SQL: &str = r#"
    INSERT INTO hn_posts (hn_id, title, url, points, user_id, created_at, descendants, text, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
    ON CONFLICT (hn_id) DO UPDATE SET
      title = EXCLUDED.title,
      url = EXCLUDED.url,
      points = EXCLUDED.points,
      user_id = EXCLUDED.user_id,
      descendants = EXCLUDED.descendants,
      text = EXCLUDED.text,
      updated_at = NOW()
    WHERE (hn_posts.title, hn_posts.url, hn_posts.points, hn_posts.user_id, hn_posts.descendants, hn_posts.text)
      IS DISTINCT FROM
          (EXCLUDED.title, EXCLUDED.url, EXCLUDED.points, EXCLUDED.user_id, EXCLUDED.descendants, EXCLUDED.text)
"#;

/// Postgres-backed gateway. Each call is one statement, atomic per row.
#[derive(Debug, Clone)]
pub struct PgPostStore {
    pool: PgPool,
}

impl PgPostStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn raw_ids(ids: &[StoryId]) -> Vec<i64> {
    ids.iter().map(|id| id.get()).collect()
}

#[async_trait]
impl PostStore for PgPostStore {
    async fn descendant_counts(
        &self,
        ids: &[StoryId],
    ) -> Result<HashMap<StoryId, i64>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT hn_id, descendants
              FROM hn_posts
             WHERE hn_id = ANY($1)
            "#,
        )
        .bind(raw_ids(ids))
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("hn_id")?;
            let descendants: i64 = row.try_get("descendants")?;
            out.insert(StoryId(id), descendants);
        }
        Ok(out)
    }

    async fn upsert_post(&self, post: &PersistedPost) -> Result<(), StoreError> {
        sqlx::query(UPSERT_POST_SQL)
        .bind(post.hn_id.get())
        .bind(&post.title)
        .bind(&post.url)
        .bind(post.score)
        .bind(&post.author)
        .bind(post.created_at)
        .bind(post.descendant_count)
        .bind(&post.text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn membership_ids(&self, feed: FeedType) -> Result<BTreeSet<StoryId>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT post_id
              FROM hn_feed_posts
             WHERE feed_type = $1
            "#,
        )
        .bind(feed.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut out = BTreeSet::new();
        for row in rows {
            let id: i64 = row.try_get("post_id")?;
            out.insert(StoryId(id));
        }
        Ok(out)
    }

    async fn upsert_memberships(
        &self,
        feed: FeedType,
        rows: &[FeedMembership],
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let ids = rows.iter().map(|r| r.story_id.get()).collect::<Vec<_>>();
        let seen = rows
            .iter()
            .map(|r| r.last_seen_at)
            .collect::<Vec<DateTime<Utc>>>();
        let flags = rows.iter().map(|r| r.needs_enrichment).collect::<Vec<_>>();

        sqlx::query(
            r#"
            INSERT INTO hn_feed_posts (feed_type, post_id, last_seen_at, needs_enrichment)
            SELECT $1, t.post_id, t.last_seen_at, t.needs_enrichment
              FROM UNNEST($2::bigint[], $3::timestamptz[], $4::boolean[])
                AS t(post_id, last_seen_at, needs_enrichment)
            ON CONFLICT (feed_type, post_id) DO UPDATE SET
              last_seen_at = EXCLUDED.last_seen_at,
              needs_enrichment = EXCLUDED.needs_enrichment
            "#,
        )
        .bind(feed.as_str())
        .bind(ids)
        .bind(seen)
        .bind(flags)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_memberships(
        &self,
        feed: FeedType,
        ids: &[StoryId],
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            DELETE FROM hn_feed_posts
             WHERE feed_type = $1
               AND post_id = ANY($2)
            "#,
        )
        .bind(feed.as_str())
        .bind(raw_ids(ids))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_ordering(
        &self,
        feed: FeedType,
        rows: &[OrderingRow],
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let ids = rows.iter().map(|r| r.story_id.get()).collect::<Vec<_>>();
        let stamps = rows.iter().map(|r| r.ordered_at_ms).collect::<Vec<_>>();

        sqlx::query(
            r#"
            INSERT INTO hn_feed_ordering (feed_type, post_id, ordered_at_ms)
            SELECT $1, t.post_id, t.ordered_at_ms
              FROM UNNEST($2::bigint[], $3::bigint[]) AS t(post_id, ordered_at_ms)
            ON CONFLICT (feed_type, post_id) DO UPDATE SET
              ordered_at_ms = EXCLUDED.ordered_at_ms
            "#,
        )
        .bind(feed.as_str())
        .bind(ids)
        .bind(stamps)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_ordering(&self, feed: FeedType, ids: &[StoryId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            DELETE FROM hn_feed_ordering
             WHERE feed_type = $1
               AND post_id = ANY($2)
            "#,
        )
        .bind(feed.as_str())
        .bind(raw_ids(ids))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_upsert_only_touches_rows_whose_content_changed() {
        let (set_clause, guard) = UPSERT_POST_SQL
            .split_once("DO UPDATE SET")
            .and_then(|(_, rest)| rest.split_once("WHERE"))
            .expect("conflict clause with guard");

        let copied = set_clause
            .split(',')
            .filter_map(|assignment| assignment.trim().split_once(" = "))
            .filter(|(_, value)| value.starts_with("EXCLUDED."))
            .map(|(column, _)| column.trim())
            .collect::<Vec<_>>();
        assert_eq!(
            copied,
            vec!["title", "url", "points", "user_id", "descendants", "text"]
        );

        let (existing, incoming) = guard.split_once("IS DISTINCT FROM").expect("distinct guard");
        for column in copied {
            assert!(existing.contains(&format!("hn_posts.{column}")), "{column}");
            assert!(incoming.contains(&format!("EXCLUDED.{column}")), "{column}");
        }
        assert!(!guard.contains("updated_at"));
        assert!(!guard.contains("created_at"));
    }
}
