//! Core domain model for the HN reader sync pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "hnr-core";

pub const HN_ITEM_URL: &str = "https://news.ycombinator.com/item?id=";

/// Identifier assigned by the upstream content source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoryId(pub i64);

impl StoryId {
    pub fn get(self) -> i64 {
        self.0
    }

    pub fn discussion_url(self) -> String {
        format!("{HN_ITEM_URL}{}", self.0)
    }
}

impl fmt::Display for StoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for StoryId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedType {
    #[default]
    FrontPage,
    News,
    Ask,
    Show,
}

impl FeedType {
    pub const ALL: [FeedType; 4] = [
        FeedType::FrontPage,
        FeedType::News,
        FeedType::Ask,
        FeedType::Show,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FeedType::FrontPage => "front_page",
            FeedType::News => "news",
            FeedType::Ask => "ask",
            FeedType::Show => "show",
        }
    }

    /// Strict parse; returns `None` for anything that is not a known feed name or alias.
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "front_page" | "front-page" | "frontpage" | "top" => Some(FeedType::FrontPage),
            "news" | "newest" => Some(FeedType::News),
            "ask" => Some(FeedType::Ask),
            "show" => Some(FeedType::Show),
            _ => None,
        }
    }

    /// Absent or unrecognized values fall back to the front page.
    pub fn parse_or_default(input: Option<&str>) -> Self {
        input.and_then(Self::parse).unwrap_or_default()
    }

    pub fn default_limit(self) -> usize {
        match self {
            FeedType::FrontPage | FeedType::News => 200,
            FeedType::Ask | FeedType::Show => 100,
        }
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one upstream story at fetch time. Only validated records are built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoryRecord {
    pub id: StoryId,
    pub title: String,
    pub url: Option<String>,
    pub score: i64,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub descendant_count: i64,
    pub text: Option<String>,
}

/// Durable representation of a story, keyed by `hn_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedPost {
    pub hn_id: StoryId,
    pub title: String,
    pub url: String,
    pub score: i64,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub descendant_count: i64,
    pub text: String,
}

impl From<&StoryRecord> for PersistedPost {
    fn from(record: &StoryRecord) -> Self {
        Self {
            hn_id: record.id,
            title: record.title.clone(),
            url: record
                .url
                .clone()
                .filter(|u| !u.trim().is_empty())
                .unwrap_or_else(|| record.id.discussion_url()),
            score: record.score,
            author: record.author.clone(),
            created_at: record.created_at,
            descendant_count: record.descendant_count,
            text: record.text.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedMembership {
    pub feed_type: FeedType,
    pub story_id: StoryId,
    pub last_seen_at: DateTime<Utc>,
    pub needs_enrichment: bool,
}

/// Row of the per-feed ordering index. `ordered_at_ms` is unique and strictly
/// increasing in upstream order within a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingRow {
    pub feed_type: FeedType,
    pub story_id: StoryId,
    pub ordered_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    New,
    Unchanged,
    Changed,
}

impl Classification {
    pub fn needs_enrichment(self) -> bool {
        !matches!(self, Classification::Unchanged)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Fetching,
    Classifying,
    Reconciling,
    Notifying,
    Done,
    Failed,
}

impl SyncPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, SyncPhase::Done | SyncPhase::Failed)
    }

    /// Phases only move forward. An empty snapshot goes straight to `Done`,
    /// and only fetching can fail the run.
    pub fn can_transition_to(self, next: SyncPhase) -> bool {
        use SyncPhase::*;
        matches!(
            (self, next),
            (Fetching, Classifying)
                | (Fetching, Done)
                | (Fetching, Failed)
                | (Classifying, Reconciling)
                | (Reconciling, Notifying)
                | (Reconciling, Done)
                | (Notifying, Done)
        )
    }
}

/// Result of one completed SyncRun.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub run_id: Uuid,
    pub feed_type: FeedType,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub processed: usize,
    pub has_more: bool,
    pub partial_failure: bool,
    pub new: usize,
    pub unchanged: usize,
    pub changed: usize,
    pub removed: usize,
    pub failed_fetches: usize,
    pub invalid_records: usize,
    pub failed_post_writes: usize,
    /// Phases the run passed through, starting with `Fetching`.
    pub phases: Vec<SyncPhase>,
}
