use anyhow::{Context, Result};

use crate::types::{VisionMode, VisionStageCap};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Database
    pub database_url: String,
    /// False when running with the restricted anon role.
    pub service_role: bool,

    // AI provider (embeddings + analyst + vision)
    pub gemini_api_key: String,

    // External scraper service
    pub scraper_url: String,
    pub scraper_token: Option<String>,

    // Web server
    pub web_host: String,
    pub web_port: u16,

    // Vision
    pub vision_mode: VisionMode,
    pub vision_stage_cap: VisionStageCap,

    // Phenomenon enrichment
    pub enrichment_enabled: bool,
    pub enrich_inline: bool,
    pub match_threshold: f64,
    pub match_topk: i64,

    // Comment mapper
    pub persist_assignments: bool,

    // Job workers per job (hard cap 3)
    pub worker_count: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL environment variable is required")?,
            service_role: env_flag("SUPABASE_SERVICE_ROLE", true),
            gemini_api_key: std::env::var("GEMINI_API_KEY")
                .or_else(|_| std::env::var("GOOGLE_API_KEY"))
                .context("GEMINI_API_KEY environment variable is required")?,
            scraper_url: std::env::var("SCRAPER_URL")
                .unwrap_or_else(|_| "http://localhost:9222".to_string()),
            scraper_token: std::env::var("SCRAPER_TOKEN").ok(),
            web_host: std::env::var("WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            web_port: std::env::var("WEB_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .context("WEB_PORT must be a number")?,
            vision_mode: VisionMode::parse(
                &std::env::var("VISION_MODE").unwrap_or_else(|_| "auto".to_string()),
            ),
            vision_stage_cap: VisionStageCap::parse(
                &std::env::var("VISION_STAGE_CAP").unwrap_or_else(|_| "auto".to_string()),
            ),
            enrichment_enabled: env_flag("ENABLE_PHENOMENON_ENRICHMENT", true)
                && env_flag("DL_ENABLE_PHENOMENON_ENRICHER", true),
            enrich_inline: env_flag("DL_ENRICH_INLINE", true),
            match_threshold: env_parsed("PHENOMENON_MATCH_THRESHOLD", 0.86),
            match_topk: env_parsed("PHENOMENON_MATCH_TOPK", 5),
            persist_assignments: env_flag("DL_PERSIST_ASSIGNMENTS", false),
            worker_count: env_parsed::<usize>("JOB_WORKER_COUNT", 2).clamp(1, 3),
        };

        if !config.service_role {
            tracing::warn!("Database role: ANON (backend running restricted)");
        }

        Ok(config)
    }

    /// Log each sensitive value's presence without leaking it.
    pub fn log_redacted(&self) {
        let vars = [
            ("DATABASE_URL", &self.database_url),
            ("GEMINI_API_KEY", &self.gemini_api_key),
            ("SCRAPER_URL", &self.scraper_url),
        ];
        for (name, value) in vars {
            if value.is_empty() {
                tracing::info!("{name} = (empty)");
            } else {
                tracing::info!("{name} = ({} chars)", value.len());
            }
        }
    }
}

/// Env flag in the loose truthy form the deployment scripts use:
/// anything except "0"/"false"/"off"/"none" counts as on.
fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => !matches!(val.to_ascii_lowercase().as_str(), "0" | "false" | "off" | "none"),
        Err(_) => default,
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
