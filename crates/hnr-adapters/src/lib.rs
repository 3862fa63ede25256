//! Upstream content source contracts + the HN API and fixture adapters.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hnr_core::{FeedType, StoryId, StoryRecord};
use hnr_storage::{FetchError, HttpFetcher};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "hnr-adapters";

pub const HN_API_BASE_URL: &str = "https://hacker-news.firebaseio.com/v0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Read-only access to an upstream story source.
#[async_trait]
pub trait ContentSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Story ids for a feed type, in upstream rank order. Any count.
    async fn list_story_ids(
        &self,
        ctx: &AdapterContext,
        feed: FeedType,
    ) -> Result<Vec<StoryId>, AdapterError>;

    /// One raw item; `Ok(None)` when the upstream reports no such item.
    async fn fetch_story(
        &self,
        ctx: &AdapterContext,
        id: StoryId,
    ) -> Result<Option<HnItem>, AdapterError>;
}

/// Item payload as served by the upstream API. Every field is optional on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnItem {
    pub id: Option<i64>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    pub title: Option<String>,
    pub url: Option<String>,
    pub score: Option<i64>,
    pub by: Option<String>,
    pub descendants: Option<i64>,
    pub time: Option<i64>,
    pub text: Option<String>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub dead: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("item has no id")]
    MissingId,
    #[error("item {0} has no title")]
    MissingTitle(i64),
    #[error("item {0} is deleted or dead")]
    Removed(i64),
}

impl HnItem {
    /// Validates the payload into a story record. Missing engagement fields
    /// default to zero; a missing timestamp falls back to `fetched_at`.
    pub fn into_story_record(self, fetched_at: DateTime<Utc>) -> Result<StoryRecord, ValidationError> {
        let id = self.id.ok_or(ValidationError::MissingId)?;
        if self.deleted || self.dead {
            return Err(ValidationError::Removed(id));
        }
        let title = self
            .title
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or(ValidationError::MissingTitle(id))?;

        Ok(StoryRecord {
            id: StoryId(id),
            title,
            url: self.url.filter(|u| !u.trim().is_empty()),
            score: self.score.unwrap_or(0),
            author: self
                .by
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| "anonymous".to_string()),
            created_at: self
                .time
                .and_then(|t| DateTime::from_timestamp(t, 0))
                .unwrap_or(fetched_at),
            descendant_count: self.descendants.unwrap_or(0),
            text: self.text.filter(|t| !t.is_empty()),
        })
    }
}

/// Adapter for the public HN Firebase API.
#[derive(Debug, Clone)]
pub struct HnApiSource {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl HnApiSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn list_url(&self, feed: FeedType) -> String {
        let endpoint = match feed {
            FeedType::FrontPage => "topstories",
            FeedType::News => "newstories",
            FeedType::Ask => "askstories",
            FeedType::Show => "showstories",
        };
        format!("{}/{endpoint}.json", self.base_url)
    }

    pub fn item_url(&self, id: StoryId) -> String {
        format!("{}/item/{id}.json", self.base_url)
    }
}

#[async_trait]
impl ContentSource for HnApiSource {
    fn source_id(&self) -> &'static str {
        "hn-api"
    }

    async fn list_story_ids(
        &self,
        ctx: &AdapterContext,
        feed: FeedType,
    ) -> Result<Vec<StoryId>, AdapterError> {
        let url = self.list_url(feed);
        let resp = self.http.fetch_bytes(ctx.run_id, self.source_id(), &url).await?;
        let ids: Vec<i64> = serde_json::from_slice(&resp.body)?;
        debug!(feed = %feed, count = ids.len(), "listed story ids");
        Ok(ids.into_iter().map(StoryId).collect())
    }

    async fn fetch_story(
        &self,
        ctx: &AdapterContext,
        id: StoryId,
    ) -> Result<Option<HnItem>, AdapterError> {
        let url = self.item_url(id);
        let resp = self.http.fetch_bytes(ctx.run_id, self.source_id(), &url).await?;
        Ok(serde_json::from_slice::<Option<HnItem>>(&resp.body)?)
    }
}

/// Captured upstream snapshot: per-feed id lists plus the items they reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub feeds: BTreeMap<FeedType, Vec<i64>>,
    #[serde(default)]
    pub items: Vec<HnItem>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Serves a fixture bundle as if it were the live API. Feeds missing from the
/// bundle list no ids; items missing from it fail to fetch.
#[derive(Debug, Clone, Default)]
pub struct FixtureContentSource {
    feeds: BTreeMap<FeedType, Vec<StoryId>>,
    items: HashMap<StoryId, HnItem>,
}

impl FixtureContentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bundle(bundle: FixtureBundle) -> Self {
        let mut source = Self::new();
        for (feed, ids) in bundle.feeds {
            source = source.with_feed(feed, ids);
        }
        for item in bundle.items {
            source = source.with_item(item);
        }
        source
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::from_bundle(load_fixture_bundle(path)?))
    }

    pub fn with_feed(mut self, feed: FeedType, ids: impl IntoIterator<Item = i64>) -> Self {
        self.feeds
            .insert(feed, ids.into_iter().map(StoryId).collect());
        self
    }

    /// Items without an id are ignored.
    pub fn with_item(mut self, item: HnItem) -> Self {
        if let Some(id) = item.id {
            self.items.insert(StoryId(id), item);
        }
        self
    }

    /// Convenience for a plain story item.
    pub fn with_story(self, id: i64, title: &str, descendants: i64) -> Self {
        self.with_item(HnItem {
            id: Some(id),
            kind: Some("story".into()),
            title: Some(title.to_string()),
            score: Some(1),
            by: Some("fixture".into()),
            descendants: Some(descendants),
            time: Some(1_767_225_600),
            ..HnItem::default()
        })
    }
}

#[async_trait]
impl ContentSource for FixtureContentSource {
    fn source_id(&self) -> &'static str {
        "hn-fixture"
    }

    async fn list_story_ids(
        &self,
        _ctx: &AdapterContext,
        feed: FeedType,
    ) -> Result<Vec<StoryId>, AdapterError> {
        Ok(self.feeds.get(&feed).cloned().unwrap_or_default())
    }

    async fn fetch_story(
        &self,
        _ctx: &AdapterContext,
        id: StoryId,
    ) -> Result<Option<HnItem>, AdapterError> {
        self.items
            .get(&id)
            .cloned()
            .map(Some)
            .ok_or_else(|| AdapterError::Message(format!("item {id} not in fixture")))
    }
}
