use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

mod routes;
mod views;

use lens_analysis::{EnricherConfig, PhenomenonEnricher};
use lens_common::AppConfig;
use lens_jobs::JobManager;
use lens_pipeline::clients::{GeminiAnalyst, GeminiEmbedder, GeminiVision, ScraperFetcher};
use lens_pipeline::{PipelineRunner, RunnerDeps};
use lens_store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting lens api");

    let config = AppConfig::from_env()?;
    config.log_redacted();

    let store = Store::connect(&config.database_url).await?;
    store.migrate().await?;
    tracing::info!("Connected to database, migrations complete");

    // Capability singletons.
    let embedder = Arc::new(GeminiEmbedder::new(&config.gemini_api_key));
    let analyst = Arc::new(GeminiAnalyst::new(&config.gemini_api_key));
    let vision = Arc::new(GeminiVision::new(&config.gemini_api_key));
    let fetcher = Arc::new(ScraperFetcher::new(
        &config.scraper_url,
        config.scraper_token.as_deref(),
    ));

    let enricher = PhenomenonEnricher::new(
        store.clone(),
        embedder.clone(),
        EnricherConfig::from_app(&config),
    );

    let runner = Arc::new(PipelineRunner::new(RunnerDeps {
        store: store.clone(),
        fetcher: fetcher.clone(),
        analyst,
        vision,
        embedder,
        enricher,
        vision_mode: config.vision_mode.clone(),
        vision_stage_cap: config.vision_stage_cap.clone(),
        persist_assignments: config.persist_assignments,
    }));

    let state = routes::AppState {
        manager: Arc::new(JobManager::new(store.clone())),
        runner,
        discoverer: fetcher,
        store,
        worker_count: config.worker_count,
    };

    let app = routes::build_router(state);
    let addr = format!("{}:{}", config.web_host, config.web_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "API listening");
    axum::serve(listener, app).await?;

    Ok(())
}
