use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hnr_core::FeedType;
use hnr_storage::PgPostStore;
use hnr_sync::{Notification, PipelineOptions, RecordingNotifier, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "hnr-cli")]
#[command(about = "HN reader sync pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync for a feed and print the outcome.
    Sync {
        /// front_page, news, ask or show; anything else means front_page.
        #[arg(long)]
        feed: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        /// Read upstream data from a fixture bundle.
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Use an in-memory store and print notifications instead of sending them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the HTTP trigger surface and run scheduled syncs.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync {
        feed: None,
        limit: None,
        fixture: None,
        dry_run: false,
    }) {
        Commands::Sync {
            feed,
            limit,
            fixture,
            dry_run,
        } => {
            let feed = FeedType::parse_or_default(feed.as_deref());
            let options = PipelineOptions { fixture, dry_run };
            if dry_run {
                sync_dry_run(feed, limit, &options).await?;
            } else {
                let outcome = hnr_sync::run_sync_once_from_env(feed, limit, &options).await?;
                print_outcome(&outcome);
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgPostStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
        Commands::Serve => {
            hnr_web::serve_from_env().await?;
        }
    }

    Ok(())
}

async fn sync_dry_run(feed: FeedType, limit: Option<usize>, options: &PipelineOptions) -> Result<()> {
    let config = SyncConfig::from_env();
    let recorder = Arc::new(RecordingNotifier::new());
    let pipeline = SyncPipeline::from_config(&config, options)
        .await?
        .with_notifier(recorder.clone());

    let outcome = match limit {
        Some(limit) => pipeline.run(feed, limit).await?,
        None => pipeline.run_default(feed).await?,
    };
    print_outcome(&outcome);

    for notification in recorder.notifications() {
        match notification {
            Notification::Enrichment(job, payload) => println!(
                "would trigger {} feed={} count={}",
                job.slug(),
                payload.feed_type,
                payload.count
            ),
            Notification::Sitemap(ids) => println!("would update sitemap with {} posts", ids.len()),
        }
    }
    Ok(())
}

fn print_outcome(outcome: &hnr_core::SyncOutcome) {
    println!(
        "sync complete: run_id={} feed={} processed={} has_more={} new={} changed={} unchanged={} removed={} failed_fetches={} partial_failure={}",
        outcome.run_id,
        outcome.feed_type,
        outcome.processed,
        outcome.has_more,
        outcome.new,
        outcome.changed,
        outcome.unchanged,
        outcome.removed,
        outcome.failed_fetches,
        outcome.partial_failure
    );
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .try_init()
        .map_err(|err| anyhow::anyhow!("initializing logging: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_flags_parse() {
        let cli = Cli::try_parse_from([
            "hnr-cli", "sync", "--feed", "show", "--limit", "2", "--dry-run",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Sync {
                feed,
                limit,
                fixture,
                dry_run,
            }) => {
                assert_eq!(feed.as_deref(), Some("show"));
                assert_eq!(limit, Some(2));
                assert!(fixture.is_none());
                assert!(dry_run);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
