//! Ad-hoc operator tools: single-URL runs, the resumable overnight batch,
//! registry reconciliation, and comment backfill.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use lens_analysis::{EnricherConfig, PhenomenonEnricher};
use lens_common::{AppConfig, RawComment, ReprocessPolicy};
use lens_jobs::{run_resumable_batch, BatchResumeOptions};
use lens_pipeline::clients::{GeminiAnalyst, GeminiEmbedder, GeminiVision, ScraperFetcher};
use lens_pipeline::{NullReporter, PipelineRunner, RunnerDeps};
use lens_store::Store;

#[derive(Parser)]
#[command(name = "lens", about = "discourse-lens operator tools")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline for one post URL.
    RunUrl {
        url: String,
        /// Ingest source tag recorded on the post row.
        #[arg(long, default_value = "A")]
        ingest_source: String,
    },

    /// Overnight keyword batch with crash-resume state.
    Batch {
        #[arg(long)]
        keyword: String,
        #[arg(long, default_value_t = 50)]
        max_posts: usize,
        #[arg(long, default_value = "batch_state.json")]
        state_file: PathBuf,
        #[arg(long, default_value = "skip_if_exists")]
        reprocess_policy: String,
        #[arg(long, default_value_t = 3)]
        max_attempts: u32,
        /// Sleep longer every N successes.
        #[arg(long, default_value_t = 10)]
        cooldown_every: usize,
    },

    /// Reconcile narrative_phenomena from post-side references.
    SyncRegistry,

    /// Rebuild threads_comments for posts whose raw_comments never synced.
    BackfillComments {
        #[arg(long, default_value_t = 500)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    let store = Store::connect(&config.database_url).await?;
    store.migrate().await?;

    match cli.command {
        Command::RunUrl { url, ingest_source } => {
            let (runner, _) = build_runner(&config, store);
            let post_id = runner
                .run(&url, &ingest_source, &NullReporter)
                .await
                .context("pipeline run failed")?;
            println!("post_id={post_id}");
        }

        Command::Batch {
            keyword,
            max_posts,
            state_file,
            reprocess_policy,
            max_attempts,
            cooldown_every,
        } => {
            let (runner, fetcher) = build_runner(&config, store);
            let outcome = run_resumable_batch(
                &runner,
                fetcher.as_ref(),
                &BatchResumeOptions {
                    keyword,
                    max_posts,
                    state_file,
                    reprocess_policy: ReprocessPolicy::parse(&reprocess_policy),
                    max_attempts,
                    cooldown_every,
                },
            )
            .await?;
            println!(
                "total={} completed={} breaker_tripped={}",
                outcome.total, outcome.completed, outcome.breaker_tripped
            );
            if outcome.breaker_tripped {
                std::process::exit(2);
            }
        }

        Command::SyncRegistry => {
            let refs = store.phenomenon_refs_for_sync().await?;
            if refs.is_empty() {
                println!("No phenomenon references found in posts; nothing to sync.");
                return Ok(());
            }
            let mut synced = 0usize;
            let mut skipped = 0usize;
            for (id_str, count, case_id) in &refs {
                match Uuid::parse_str(id_str) {
                    Ok(id) => {
                        store
                            .reconcile_phenomenon(id, *count, case_id.as_deref())
                            .await?;
                        synced += 1;
                    }
                    Err(_) => {
                        tracing::warn!(phenomenon_id = id_str.as_str(), "Skipping non-UUID reference");
                        skipped += 1;
                    }
                }
            }
            println!("distinct_in_posts={} synced={synced} skipped={skipped}", refs.len());
        }

        Command::BackfillComments { limit } => {
            let posts = store.posts_missing_comment_rows(limit).await?;
            let mut total = 0usize;
            for (post_id, raw_comments) in posts {
                let comments: Vec<RawComment> =
                    serde_json::from_value(raw_comments).unwrap_or_default();
                if comments.is_empty() {
                    continue;
                }
                let sync = store.sync_comments(post_id, &comments).await;
                if sync.report.ok {
                    total += sync.report.count;
                } else {
                    tracing::warn!(post_id, error = ?sync.report.error, "Backfill failed for post");
                }
            }
            println!("comments_backfilled={total}");
        }
    }

    Ok(())
}

fn build_runner(config: &AppConfig, store: Store) -> (PipelineRunner, Arc<ScraperFetcher>) {
    let embedder = Arc::new(GeminiEmbedder::new(&config.gemini_api_key));
    let fetcher = Arc::new(ScraperFetcher::new(
        &config.scraper_url,
        config.scraper_token.as_deref(),
    ));
    let enricher = PhenomenonEnricher::new(
        store.clone(),
        embedder.clone(),
        EnricherConfig::from_app(config),
    );

    let runner = PipelineRunner::new(RunnerDeps {
        store,
        fetcher: fetcher.clone(),
        analyst: Arc::new(GeminiAnalyst::new(&config.gemini_api_key)),
        vision: Arc::new(GeminiVision::new(&config.gemini_api_key)),
        embedder,
        enricher,
        vision_mode: config.vision_mode.clone(),
        vision_stage_cap: config.vision_stage_cap.clone(),
        persist_assignments: config.persist_assignments,
    });
    (runner, fetcher)
}
