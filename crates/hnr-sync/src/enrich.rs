use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use hnr_core::{FeedType, StoryId};
use hnr_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Downstream job a completed sync can kick off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentJob {
    Summaries,
    CommentSummaries,
}

impl EnrichmentJob {
    pub fn slug(self) -> &'static str {
        match self {
            EnrichmentJob::Summaries => "generate-summaries",
            EnrichmentJob::CommentSummaries => "generate-comment-summaries",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentPayload {
    pub feed_type: FeedType,
    pub count: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitemapPayload {
    pub urls: Vec<String>,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no endpoint configured for {0}")]
    NotConfigured(&'static str),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Fire-and-forget notifications emitted after a run. Implementations must not
/// block the caller on delivery, and delivery failures never reach the run.
pub trait EnrichmentNotifier: Send + Sync {
    fn trigger(&self, job: EnrichmentJob, payload: EnrichmentPayload);

    fn sitemap_update(&self, ids: &[StoryId]);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEnrichmentNotifier;

impl EnrichmentNotifier for NoopEnrichmentNotifier {
    fn trigger(&self, _job: EnrichmentJob, _payload: EnrichmentPayload) {}

    fn sitemap_update(&self, _ids: &[StoryId]) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Enrichment(EnrichmentJob, EnrichmentPayload),
    Sitemap(Vec<StoryId>),
}

/// Keeps every notification in memory instead of sending it. Used by dry runs.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn push(&self, notification: Notification) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(notification);
    }
}

impl EnrichmentNotifier for RecordingNotifier {
    fn trigger(&self, job: EnrichmentJob, payload: EnrichmentPayload) {
        self.push(Notification::Enrichment(job, payload));
    }

    fn sitemap_update(&self, ids: &[StoryId]) {
        self.push(Notification::Sitemap(ids.to_vec()));
    }
}

/// POSTs notifications to the enrichment service and the public site, each on
/// its own spawned task. Must be called from within a tokio runtime.
#[derive(Debug, Clone)]
pub struct HttpEnrichmentNotifier {
    http: Arc<HttpFetcher>,
    enrichment_base_url: Option<String>,
    site_url: Option<String>,
    auth_token: Option<String>,
}

impl HttpEnrichmentNotifier {
    pub fn new(
        http: Arc<HttpFetcher>,
        enrichment_base_url: Option<String>,
        site_url: Option<String>,
        auth_token: Option<String>,
    ) -> Self {
        let trim = |u: String| u.trim_end_matches('/').to_string();
        Self {
            http,
            enrichment_base_url: enrichment_base_url.map(trim),
            site_url: site_url.map(trim),
            auth_token,
        }
    }

    pub fn job_url(&self, job: EnrichmentJob) -> Option<String> {
        self.enrichment_base_url
            .as_ref()
            .map(|base| format!("{base}/{}", job.slug()))
    }

    pub fn sitemap_url(&self) -> Option<String> {
        self.site_url
            .as_ref()
            .map(|site| format!("{site}/api/sitemap-update"))
    }

    pub fn post_urls(&self, ids: &[StoryId]) -> Vec<String> {
        match &self.site_url {
            Some(site) => ids.iter().map(|id| format!("{site}/posts/{id}")).collect(),
            None => Vec::new(),
        }
    }

    pub async fn send_trigger(
        &self,
        job: EnrichmentJob,
        payload: &EnrichmentPayload,
    ) -> Result<(), NotifyError> {
        let url = self.job_url(job).ok_or(NotifyError::NotConfigured(job.slug()))?;
        self.http
            .post_json("enrichment", &url, self.auth_token.as_deref(), payload)
            .await?;
        Ok(())
    }

    pub async fn send_sitemap_update(&self, ids: &[StoryId]) -> Result<(), NotifyError> {
        let url = self
            .sitemap_url()
            .ok_or(NotifyError::NotConfigured("sitemap-update"))?;
        let payload = SitemapPayload {
            urls: self.post_urls(ids),
        };
        self.http
            .post_json("site", &url, self.auth_token.as_deref(), &payload)
            .await?;
        Ok(())
    }
}

impl EnrichmentNotifier for HttpEnrichmentNotifier {
    fn trigger(&self, job: EnrichmentJob, payload: EnrichmentPayload) {
        let notifier = self.clone();
        tokio::spawn(async move {
            match notifier.send_trigger(job, &payload).await {
                Ok(()) => info!(job = job.slug(), feed = %payload.feed_type, count = payload.count, "enrichment triggered"),
                Err(err) => warn!(job = job.slug(), feed = %payload.feed_type, error = %err, "enrichment trigger failed"),
            }
        });
    }

    fn sitemap_update(&self, ids: &[StoryId]) {
        let notifier = self.clone();
        let ids = ids.to_vec();
        tokio::spawn(async move {
            match notifier.send_sitemap_update(&ids).await {
                Ok(()) => info!(urls = ids.len(), "sitemap update triggered"),
                Err(err) => warn!(error = %err, "sitemap update failed"),
            }
        });
    }
}
