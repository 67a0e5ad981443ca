//! Dedicated Pipeline B backend: keyword discovery, canonical dedup,
//! reprocess-policy selection, and a jittered, semaphore-bounded run over
//! the scheduled URLs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{Mutex, Semaphore};
use tracing::info;
use uuid::Uuid;

use lens_common::{KeywordDiscoverer, ReprocessPolicy};
use lens_pipeline::{NullReporter, PipelineRunner};
use lens_store::Store;

use threads_client::canonicalize_url;

const MAX_POSTS_CAP: usize = 20;
const CONCURRENCY_CAP: usize = 3;

#[derive(Debug, Clone)]
pub struct BatchParams {
    pub keyword: Option<String>,
    pub urls: Vec<String>,
    pub max_posts: usize,
    pub exclude_existing: bool,
    pub reprocess_policy: ReprocessPolicy,
    pub ingest_source: String,
    /// run | preview
    pub mode: String,
    /// ingest | full
    pub pipeline_mode: String,
    pub concurrency: usize,
}

impl BatchParams {
    pub fn from_config(config: &Value, job_mode: &str) -> Self {
        let str_list = |key: &str| -> Vec<String> {
            config
                .get(key)
                .and_then(Value::as_array)
                .map(|arr| {
                    arr.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut urls = str_list("targets");
        if urls.is_empty() {
            urls = str_list("urls");
        }

        Self {
            keyword: config
                .get("keyword")
                .and_then(Value::as_str)
                .filter(|k| !k.is_empty())
                .map(str::to_string),
            urls,
            max_posts: config
                .get("max_posts")
                .and_then(Value::as_u64)
                .unwrap_or(20)
                .clamp(1, MAX_POSTS_CAP as u64) as usize,
            exclude_existing: config
                .get("exclude_existing")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            reprocess_policy: ReprocessPolicy::parse(
                config
                    .get("reprocess_policy")
                    .and_then(Value::as_str)
                    .unwrap_or("skip_if_exists"),
            ),
            ingest_source: config
                .get("ingest_source")
                .and_then(Value::as_str)
                .unwrap_or("B")
                .to_string(),
            mode: config
                .get("mode")
                .and_then(Value::as_str)
                .unwrap_or(if job_mode.is_empty() { "run" } else { job_mode })
                .to_string(),
            pipeline_mode: config
                .get("pipeline_mode")
                .and_then(Value::as_str)
                .unwrap_or("full")
                .to_string(),
            concurrency: config
                .get("concurrency")
                .and_then(Value::as_u64)
                .unwrap_or(2)
                .clamp(1, CONCURRENCY_CAP as u64) as usize,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BatchSummary {
    pub discovery_count: usize,
    pub deduped_count: usize,
    pub selected_count: usize,
    pub skipped_exists: usize,
    pub skipped_policy: usize,
    pub success_count: usize,
    pub fail_count: usize,
    pub failures: Vec<String>,
    pub logs: Vec<String>,
    pub items: Vec<Value>,
}

struct BatchProgress {
    success: usize,
    fail: usize,
    failures: Vec<String>,
    logs: Vec<String>,
    items: Vec<Value>,
}

/// Run a keyword/URL batch. `preview` mode returns the selection summary
/// without dispatching any work.
pub async fn process_batch(
    store: &Store,
    runner: &PipelineRunner,
    discoverer: &dyn KeywordDiscoverer,
    params: &BatchParams,
    job_id: Option<Uuid>,
) -> anyhow::Result<BatchSummary> {
    let mut logs: Vec<String> = Vec::new();
    let mut candidates: Vec<String> = Vec::new();

    if let Some(keyword) = &params.keyword {
        let discovered = discoverer.discover(keyword, params.max_posts * 2).await?;
        logs.push(format!("discovered_via_keyword={}", discovered.len()));
        for p in &discovered {
            candidates.push(canonicalize_url(&p.url));
        }
    }
    for url in &params.urls {
        candidates.push(canonicalize_url(url));
    }

    let discovery_count = candidates.len();
    let mut seen = std::collections::HashSet::new();
    let mut deduped: Vec<String> = candidates
        .into_iter()
        .filter(|u| !u.is_empty() && seen.insert(u.clone()))
        .collect();
    let deduped_count = deduped.len();
    deduped.truncate(params.max_posts);

    let existing: HashMap<String, i64> = store.fetch_existing_post_ids(&deduped).await?;

    let keyword_hit = params.keyword.is_some();
    let mut scheduled: Vec<String> = Vec::new();
    let mut skipped_exists: Vec<String> = Vec::new();
    let mut skipped_policy: Vec<String> = Vec::new();
    let mut items: Vec<Value> = Vec::new();

    for canon in &deduped {
        let exists = existing.contains_key(canon);
        let reprocess = params.reprocess_policy.should_reprocess(keyword_hit);
        if exists && params.exclude_existing && !reprocess {
            skipped_exists.push(canon.clone());
            items.push(json!({
                "canonical_url": canon,
                "decision": "skipped_exists",
                "reason": "exists",
                "existing_post_id": existing.get(canon),
            }));
            continue;
        }
        if exists && !reprocess {
            skipped_policy.push(canon.clone());
            items.push(json!({
                "canonical_url": canon,
                "decision": "skipped_policy",
                "reason": "policy_skip",
                "existing_post_id": existing.get(canon),
            }));
            continue;
        }
        scheduled.push(canon.clone());
        items.push(json!({
            "canonical_url": canon,
            "decision": "selected",
            "reason": null,
            "existing_post_id": existing.get(canon),
        }));
    }

    logs.push(format!(
        "deduped={deduped_count}, selected={}, skipped_exists={}, skipped_policy={}, policy={}, exclude_existing={}",
        scheduled.len(),
        skipped_exists.len(),
        skipped_policy.len(),
        params.reprocess_policy,
        params.exclude_existing,
    ));

    let base = BatchSummary {
        discovery_count,
        deduped_count,
        selected_count: scheduled.len(),
        skipped_exists: skipped_exists.len(),
        skipped_policy: skipped_policy.len(),
        success_count: 0,
        fail_count: 0,
        failures: Vec::new(),
        logs: logs.clone(),
        items: items.clone(),
    };

    if params.mode == "preview" {
        return Ok(base);
    }

    let progress = Arc::new(Mutex::new(BatchProgress {
        success: 0,
        fail: 0,
        failures: Vec::new(),
        logs,
        items,
    }));

    let semaphore = Arc::new(Semaphore::new(params.concurrency));
    let total = scheduled.len();
    let mut handles = Vec::new();

    for (idx, url) in scheduled.iter().enumerate() {
        // Stagger task launches so the scraper never sees a thundering herd.
        let stagger = rand::rng().random_range(200..600);
        tokio::time::sleep(Duration::from_millis(stagger)).await;

        handles.push(run_one(
            Arc::clone(&semaphore),
            Arc::clone(&progress),
            store.clone(),
            runner,
            job_id,
            idx + 1,
            total,
            url.clone(),
            params.ingest_source.clone(),
            params.pipeline_mode.clone(),
        ));
    }

    futures::future::join_all(handles).await;

    let progress = Arc::try_unwrap(progress)
        .map_err(|_| anyhow::anyhow!("batch progress still shared"))?
        .into_inner();

    let mut failures = progress.failures;
    failures.truncate(20);

    info!(
        selected = total,
        success = progress.success,
        failed = progress.fail,
        "Batch run finished"
    );

    Ok(BatchSummary {
        success_count: progress.success,
        fail_count: progress.fail,
        failures,
        logs: progress.logs,
        items: progress.items,
        ..base
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_one(
    semaphore: Arc<Semaphore>,
    progress: Arc<Mutex<BatchProgress>>,
    store: Store,
    runner: &PipelineRunner,
    job_id: Option<Uuid>,
    idx: usize,
    total: usize,
    url: String,
    ingest_source: String,
    pipeline_mode: String,
) {
    let Ok(_permit) = semaphore.acquire().await else {
        return;
    };

    {
        let mut p = progress.lock().await;
        p.logs.push(format!("[{idx}/{total}] BEGIN {url}"));
    }
    if let Some(job_id) = job_id {
        store
            .progressive_item_update(job_id, &url, "running", "processing", None, None)
            .await;
    }

    let result = if pipeline_mode == "ingest" {
        runner.ingest(&url, &ingest_source).await
    } else {
        runner.run(&url, &ingest_source, &NullReporter).await
    };

    // Jitter between scrapes keeps request cadence organic.
    let jitter = rand::rng().random_range(500..1000);
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    match result {
        Ok(post_id) => {
            let mut p = progress.lock().await;
            p.success += 1;
            p.logs
                .push(format!("[{idx}/{total}] OK {pipeline_mode} {url} post_id={post_id}"));
            p.items.push(json!({
                "canonical_url": url,
                "post_id": post_id,
                "status": "succeeded",
                "reason": null,
                "stage": pipeline_mode,
            }));
            drop(p);
            if let Some(job_id) = job_id {
                store
                    .progressive_item_update(
                        job_id,
                        &url,
                        "completed_post",
                        "processing",
                        Some(&post_id.to_string()),
                        None,
                    )
                    .await;
            }
        }
        Err(e) => {
            let mut p = progress.lock().await;
            p.fail += 1;
            p.failures.push(format!("{url} ({e})"));
            p.logs.push(format!("[{idx}/{total}] FAIL {url}: {e}"));
            p.items.push(json!({
                "canonical_url": url,
                "decision": "selected",
                "status": "failed",
                "stage": if e.code() == "INGEST_NO_POST_ID" { "ingest" } else { "full" },
                "reason": e.to_string(),
            }));
            drop(p);
            if let Some(job_id) = job_id {
                store
                    .progressive_item_update(
                        job_id,
                        &url,
                        "failed_post",
                        "processing",
                        None,
                        Some(&e.to_string()),
                    )
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_clamp_caps() {
        let config = json!({
            "keyword": "tax",
            "max_posts": 500,
            "concurrency": 99,
        });
        let p = BatchParams::from_config(&config, "run");
        assert_eq!(p.max_posts, MAX_POSTS_CAP);
        assert_eq!(p.concurrency, CONCURRENCY_CAP);
        assert!(p.exclude_existing);
        assert_eq!(p.reprocess_policy, ReprocessPolicy::SkipIfExists);
    }

    #[test]
    fn params_read_targets_then_urls() {
        let config = json!({"urls": ["https://a"]});
        let p = BatchParams::from_config(&config, "run");
        assert_eq!(p.urls, vec!["https://a"]);

        let config = json!({"targets": ["https://t"], "urls": ["https://a"]});
        let p = BatchParams::from_config(&config, "run");
        assert_eq!(p.urls, vec!["https://t"]);
    }

    #[test]
    fn mode_falls_back_to_job_mode() {
        let p = BatchParams::from_config(&json!({}), "preview");
        assert_eq!(p.mode, "preview");
        let p = BatchParams::from_config(&json!({"mode": "run"}), "preview");
        assert_eq!(p.mode, "run");
    }
}
