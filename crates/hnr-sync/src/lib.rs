//! Sync pipeline orchestration: fetch, classify, reconcile, notify.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hnr_adapters::{AdapterContext, AdapterError, ContentSource, FixtureContentSource, HnApiSource};
use hnr_core::{FeedType, SyncOutcome, SyncPhase};
use hnr_storage::{DispatchLimiter, HttpClientConfig, HttpFetcher, MemoryPostStore, PgPostStore, PostStore};
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

pub mod clock;
pub mod config;
pub mod detect;
pub mod enrich;
pub mod fetch;
pub mod reconcile;

pub use clock::{Clock, ManualClock, OrderingStamper, SystemClock};
pub use config::{FeedPolicy, FeedRegistry, SyncConfig, FEED_REGISTRY_FILE};
pub use detect::classify;
pub use enrich::{
    EnrichmentJob, EnrichmentNotifier, EnrichmentPayload, HttpEnrichmentNotifier,
    NoopEnrichmentNotifier, Notification, NotifyError, RecordingNotifier,
};
pub use fetch::{FetchedSnapshot, StoryFetcher};
pub use reconcile::{ReconcilePlan, ReconcileReport, Reconciler};

pub const CRATE_NAME: &str = "hnr-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("listing {feed} failed: {source}")]
    UpstreamList {
        feed: FeedType,
        #[source]
        source: AdapterError,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Phase tracker for a single run.
#[derive(Debug)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub feed: FeedType,
    phase: SyncPhase,
    history: Vec<SyncPhase>,
}

impl SyncRun {
    pub fn new(run_id: Uuid, feed: FeedType) -> Self {
        Self {
            run_id,
            feed,
            phase: SyncPhase::Fetching,
            history: vec![SyncPhase::Fetching],
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn history(&self) -> &[SyncPhase] {
        &self.history
    }

    fn advance(&mut self, next: SyncPhase) {
        if !self.phase.can_transition_to(next) {
            warn!(from = ?self.phase, to = ?next, "unexpected sync phase transition");
        }
        debug!(from = ?self.phase, to = ?next, "sync phase");
        self.phase = next;
        self.history.push(next);
    }
}

/// How a pipeline built from configuration sources its stories and stores results.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    /// Serve upstream data from a fixture bundle instead of the live API.
    pub fixture: Option<PathBuf>,
    /// Write to an in-memory store and send no notifications.
    pub dry_run: bool,
}

pub struct SyncPipeline {
    source: Arc<dyn ContentSource>,
    store: Arc<dyn PostStore>,
    notifier: Arc<dyn EnrichmentNotifier>,
    clock: Arc<dyn Clock>,
    stamper: Arc<OrderingStamper>,
    limiter: Arc<DispatchLimiter>,
    registry: FeedRegistry,
}

impl SyncPipeline {
    pub fn new(source: Arc<dyn ContentSource>, store: Arc<dyn PostStore>) -> Self {
        Self {
            source,
            store,
            notifier: Arc::new(NoopEnrichmentNotifier),
            clock: Arc::new(SystemClock),
            stamper: Arc::new(OrderingStamper::new()),
            limiter: Arc::new(DispatchLimiter::new(4, Duration::from_millis(100))),
            registry: FeedRegistry::builtin(),
        }
    }

    pub async fn from_config(config: &SyncConfig, options: &PipelineOptions) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            per_source_concurrency: config.fetch_concurrency.max(1),
            ..Default::default()
        })?);

        let source: Arc<dyn ContentSource> = match &options.fixture {
            Some(path) => Arc::new(FixtureContentSource::from_path(path)?),
            None => Arc::new(HnApiSource::new(http.clone(), config.hn_api_base_url.clone())),
        };

        let store: Arc<dyn PostStore> = if options.dry_run {
            Arc::new(MemoryPostStore::new())
        } else {
            Arc::new(
                PgPostStore::connect(&config.database_url)
                    .await
                    .context("connecting to post store")?,
            )
        };

        let notifier: Arc<dyn EnrichmentNotifier> = if options.dry_run
            || (config.enrichment_base_url.is_none() && config.public_site_url.is_none())
        {
            Arc::new(NoopEnrichmentNotifier)
        } else {
            Arc::new(HttpEnrichmentNotifier::new(
                http,
                config.enrichment_base_url.clone(),
                config.public_site_url.clone(),
                config.cron_auth_token.clone(),
            ))
        };

        let registry = FeedRegistry::load(&config.workspace_root).await?;

        Ok(Self::new(source, store)
            .with_notifier(notifier)
            .with_registry(registry)
            .with_limiter(DispatchLimiter::new(
                config.fetch_concurrency,
                Duration::from_millis(config.fetch_interval_ms),
            )))
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn EnrichmentNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_registry(mut self, registry: FeedRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_limiter(mut self, limiter: DispatchLimiter) -> Self {
        self.limiter = Arc::new(limiter);
        self
    }

    pub fn registry(&self) -> &FeedRegistry {
        &self.registry
    }

    /// Runs one sync with the feed's configured limit.
    pub async fn run_default(&self, feed: FeedType) -> Result<SyncOutcome, SyncError> {
        let limit = self.registry.policy_for(feed).limit;
        self.run(feed, limit).await
    }

    /// Runs one SyncRun to completion. Only an upstream list failure or a zero
    /// limit is an error; everything else is reported through the outcome.
    pub async fn run(&self, feed: FeedType, limit: usize) -> Result<SyncOutcome, SyncError> {
        if limit == 0 {
            return Err(SyncError::InvalidRequest("limit must be greater than 0".into()));
        }
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("sync_run", %run_id, feed = %feed, limit);
        self.run_inner(run_id, feed, limit).instrument(span).await
    }

    async fn run_inner(
        &self,
        run_id: Uuid,
        feed: FeedType,
        limit: usize,
    ) -> Result<SyncOutcome, SyncError> {
        let started_at = self.clock.now();
        let mut run = SyncRun::new(run_id, feed);
        let ctx = AdapterContext {
            run_id,
            fetched_at: started_at,
        };

        let fetcher = StoryFetcher::new(self.source.clone(), self.limiter.clone());
        let snapshot = match fetcher.fetch(&ctx, feed, limit).await {
            Ok(snapshot) => snapshot,
            Err(source) => {
                run.advance(SyncPhase::Failed);
                error!(error = %source, "upstream id list failed");
                return Err(SyncError::UpstreamList { feed, source });
            }
        };

        let mut outcome = SyncOutcome {
            run_id,
            feed_type: feed,
            started_at,
            finished_at: started_at,
            processed: snapshot.records.len(),
            has_more: snapshot.has_more(),
            partial_failure: false,
            new: 0,
            unchanged: 0,
            changed: 0,
            removed: 0,
            failed_fetches: snapshot.failed.len(),
            invalid_records: snapshot.invalid.len(),
            failed_post_writes: 0,
            phases: Vec::new(),
        };

        if snapshot.records.is_empty() {
            // Nothing fetched: leave existing membership alone.
            run.advance(SyncPhase::Done);
            outcome.finished_at = self.clock.now();
            outcome.phases = run.history().to_vec();
            info!(listed = snapshot.listed, "empty snapshot, skipping reconcile");
            return Ok(outcome);
        }

        run.advance(SyncPhase::Classifying);
        let reconciler = Reconciler::new(self.store.clone(), self.stamper.clone(), self.clock.clone());
        let plan = reconciler.plan(feed, snapshot.records).await;

        run.advance(SyncPhase::Reconciling);
        let report = reconciler.apply(&plan).await;
        outcome.new = report.new;
        outcome.unchanged = report.unchanged;
        outcome.changed = report.changed;
        outcome.removed = report.removed;
        outcome.failed_post_writes = report.failed_post_writes;
        outcome.partial_failure = report.partial_failure;

        if report.partial_failure {
            // Batch writes did not land; downstream jobs would read stale flags.
            warn!("reconcile partially failed, skipping notifications");
        } else {
            run.advance(SyncPhase::Notifying);
            self.notify(feed, &plan);
        }

        run.advance(SyncPhase::Done);
        outcome.finished_at = self.clock.now();
        outcome.phases = run.history().to_vec();
        info!(
            processed = outcome.processed,
            has_more = outcome.has_more,
            partial_failure = outcome.partial_failure,
            "sync run complete"
        );
        Ok(outcome)
    }

    fn notify(&self, feed: FeedType, plan: &ReconcilePlan) {
        let policy = self.registry.policy_for(feed);
        for job in &policy.enrichment {
            self.notifier.trigger(
                *job,
                EnrichmentPayload {
                    feed_type: feed,
                    count: plan.stories.len(),
                    timestamp: self.clock.now(),
                },
            );
        }
        if policy.sitemap {
            self.notifier.sitemap_update(&plan.ids());
        }
    }
}

/// One cron job per enabled feed with a schedule. `None` when scheduling is off.
pub async fn maybe_build_scheduler(
    pipeline: Arc<SyncPipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let policies = pipeline.registry().enabled().collect::<Vec<_>>();
    for policy in policies {
        let Some(cron) = policy.cron.clone() else {
            continue;
        };
        let feed = policy.feed_type;
        let limit = policy.limit;
        let pipeline = pipeline.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run(feed, limit).await {
                    Ok(outcome) => info!(
                        feed = %feed,
                        processed = outcome.processed,
                        partial_failure = outcome.partial_failure,
                        "scheduled sync finished"
                    ),
                    Err(err) => warn!(feed = %feed, error = %err, "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for {feed} ({cron})"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

pub async fn run_sync_once_from_env(
    feed: FeedType,
    limit: Option<usize>,
    options: &PipelineOptions,
) -> Result<SyncOutcome> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(&config, options).await?;
    let outcome = match limit {
        Some(limit) => pipeline.run(feed, limit).await?,
        None => pipeline.run_default(feed).await?,
    };
    Ok(outcome)
}
