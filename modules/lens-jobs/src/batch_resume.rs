//! Overnight batch runner with crash-resume.
//!
//! Keeps a JSON state file with per-URL status/attempts/errors, written
//! atomically after every transition, so a killed run resumes where it
//! stopped. Three suspected rate-limits in a row (or five consecutive
//! failures of any kind) trip the circuit breaker for the rest of the run.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use lens_common::ReprocessPolicy;
use lens_pipeline::{NullReporter, PipelineRunner};

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_SKIPPED: &str = "skipped";

const RATE_LIMIT_TRIP: usize = 3;
const FAILURE_TRIP: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlState {
    pub status: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl UrlState {
    fn queued() -> Self {
        Self {
            status: STATUS_QUEUED.to_string(),
            attempts: 0,
            last_error: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchState {
    #[serde(default)]
    pub urls: BTreeMap<String, UrlState>,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl BatchState {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write-then-rename so a crash never leaves a torn state file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// 429s and provider overload strings count as suspected rate limits.
pub fn classify_rate_limit(err: &str) -> bool {
    let low = err.to_lowercase();
    low.contains("429") || low.contains("rate limit") || low.contains("too many requests")
}

#[derive(Debug, Clone)]
pub struct BatchResumeOptions {
    pub keyword: String,
    pub max_posts: usize,
    pub state_file: std::path::PathBuf,
    pub reprocess_policy: ReprocessPolicy,
    pub max_attempts: u32,
    /// Longer cooldown after every N successes.
    pub cooldown_every: usize,
}

#[derive(Debug, Default)]
pub struct BatchResumeOutcome {
    pub total: usize,
    pub completed: usize,
    pub breaker_tripped: bool,
}

/// Run (or resume) a keyword batch against the state file.
pub async fn run_resumable_batch(
    runner: &PipelineRunner,
    discoverer: &dyn lens_common::KeywordDiscoverer,
    opts: &BatchResumeOptions,
) -> anyhow::Result<BatchResumeOutcome> {
    let mut state = BatchState::load(&opts.state_file)?;

    if state.urls.is_empty() {
        let discovered = discoverer
            .discover(&opts.keyword, opts.max_posts * 2)
            .await?;
        let mut seen = std::collections::HashSet::new();
        for p in discovered {
            let canon = threads_client::canonicalize_url(&p.url);
            if canon.is_empty() || !seen.insert(canon.clone()) {
                continue;
            }
            state.urls.insert(canon, UrlState::queued());
            if state.urls.len() >= opts.max_posts {
                break;
            }
        }
        state.logs.push(format!(
            "Initialized {} URLs for keyword={}",
            state.urls.len(),
            opts.keyword
        ));
        state.save(&opts.state_file)?;
    }

    let mut suspected_rl = 0usize;
    let mut consecutive_failures = 0usize;
    let mut completed = 0usize;
    let total = state.urls.len();
    let mut breaker_tripped = false;

    let urls: Vec<String> = state.urls.keys().cloned().collect();
    for url in urls {
        {
            let meta = state.urls.get(&url).expect("url state present");
            if meta.status == STATUS_SUCCEEDED {
                continue;
            }
            if meta.status == STATUS_FAILED
                && meta.attempts >= opts.max_attempts
                && opts.reprocess_policy == ReprocessPolicy::SkipIfExists
            {
                continue;
            }
        }

        if suspected_rl >= RATE_LIMIT_TRIP || consecutive_failures >= FAILURE_TRIP {
            state.logs.push(format!(
                "Breaker tripped: suspected_rl={suspected_rl}, consecutive_failures={consecutive_failures}"
            ));
            breaker_tripped = true;
            break;
        }

        {
            let meta = state.urls.get_mut(&url).expect("url state present");
            meta.status = STATUS_RUNNING.to_string();
            meta.attempts += 1;
        }
        state.save(&opts.state_file)?;

        match runner.run(&url, "B", &NullReporter).await {
            Ok(post_id) => {
                let meta = state.urls.get_mut(&url).expect("url state present");
                meta.status = STATUS_SUCCEEDED.to_string();
                meta.last_error = None;
                suspected_rl = 0;
                consecutive_failures = 0;
                completed += 1;
                info!(url = url.as_str(), post_id, "Batch URL succeeded");
            }
            Err(e) => {
                let msg: String = e.to_string().chars().take(500).collect();
                let meta = state.urls.get_mut(&url).expect("url state present");
                meta.status = STATUS_FAILED.to_string();
                meta.last_error = Some(msg.clone());
                if classify_rate_limit(&msg) {
                    suspected_rl += 1;
                } else {
                    suspected_rl = 0;
                }
                consecutive_failures += 1;
                warn!(url = url.as_str(), error = msg.as_str(), "Batch URL failed");
            }
        }
        state.save(&opts.state_file)?;

        let jitter = rand::rng().random_range(1500..3500);
        tokio::time::sleep(Duration::from_millis(jitter)).await;
        if completed > 0 && opts.cooldown_every > 0 && completed % opts.cooldown_every == 0 {
            let cooldown = rand::rng().random_range(15_000..30_000);
            tokio::time::sleep(Duration::from_millis(cooldown)).await;
        }
    }

    state.logs.push(format!(
        "Batch run finished: total={total}, completed={completed}, rl={suspected_rl}, consecutive_failures={consecutive_failures}"
    ));
    state.save(&opts.state_file)?;

    Ok(BatchResumeOutcome {
        total,
        completed,
        breaker_tripped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_classifier() {
        assert!(classify_rate_limit("HTTP 429 from scraper"));
        assert!(classify_rate_limit("Rate limit exceeded"));
        assert!(classify_rate_limit("too many requests"));
        assert!(!classify_rate_limit("connection reset"));
        assert!(!classify_rate_limit(""));
    }

    #[test]
    fn state_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch_state.json");

        let mut state = BatchState::default();
        state.urls.insert(
            "https://www.threads.net/@u/post/A".to_string(),
            UrlState {
                status: STATUS_FAILED.to_string(),
                attempts: 2,
                last_error: Some("429".to_string()),
            },
        );
        state.logs.push("run 1".to_string());
        state.save(&path).unwrap();

        let loaded = BatchState::load(&path).unwrap();
        assert_eq!(loaded.urls.len(), 1);
        let meta = &loaded.urls["https://www.threads.net/@u/post/A"];
        assert_eq!(meta.status, STATUS_FAILED);
        assert_eq!(meta.attempts, 2);
        assert_eq!(loaded.logs, vec!["run 1"]);
        // No stray tmp file left behind.
        assert!(!dir.path().join("batch_state.tmp").exists());
    }

    #[test]
    fn missing_state_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = BatchState::load(&dir.path().join("nope.json")).unwrap();
        assert!(state.urls.is_empty());
    }
}
