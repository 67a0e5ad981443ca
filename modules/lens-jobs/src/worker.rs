//! Claim-loop workers: a small pool per job contends for items through the
//! atomic claim function and drives each claimed item through the pipeline.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use lens_common::Stage;
use lens_pipeline::{PipelineError, PipelineRunner, StageReporter, StoreStageReporter};
use lens_store::{JobItemRow, Store};

use crate::batch::{process_batch, BatchParams};
use crate::manager::JobManager;

const WORKER_NAMES: [&str; 3] = ["worker-alpha", "worker-beta", "worker-gamma"];
/// Item heartbeat interval; must stay well under the 60 s lease TTL.
const ITEM_HEARTBEAT: Duration = Duration::from_secs(3);

/// Run one job to completion. Pipeline B gets the dedicated batch backend;
/// everything else goes through the claim loop.
pub async fn run_job(
    manager: &JobManager,
    runner: Arc<PipelineRunner>,
    discoverer: Arc<dyn lens_common::KeywordDiscoverer>,
    job_id: Uuid,
    worker_count: usize,
) {
    info!(%job_id, "Starting workers");

    let job = match manager.get_job(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            error!(%job_id, "Job vanished before workers started");
            return;
        }
        Err(e) => {
            error!(%job_id, error = %e, "Failed to load job");
            return;
        }
    };

    let pipeline_type = job.pipeline_type.trim().to_uppercase();

    if pipeline_type == "B" {
        run_batch_job(manager, runner, discoverer, job_id, &job.input_config, &job.mode).await;
        return;
    }

    let worker_count = worker_count.clamp(1, WORKER_NAMES.len());
    let mut handles = Vec::new();
    for name in WORKER_NAMES.iter().take(worker_count) {
        let store = manager.store().clone();
        let runner = Arc::clone(&runner);
        handles.push(tokio::spawn(async move {
            worker_loop(store, runner, job_id, name).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
    info!(%job_id, "Workers drained");
}

async fn run_batch_job(
    manager: &JobManager,
    runner: Arc<PipelineRunner>,
    discoverer: Arc<dyn lens_common::KeywordDiscoverer>,
    job_id: Uuid,
    input_config: &Value,
    job_mode: &str,
) {
    let store = manager.store().clone();
    let params = BatchParams::from_config(input_config, job_mode);

    if let Err(e) = store.mark_job_processing(job_id, None).await {
        warn!(%job_id, error = %e, "Failed to mark batch job processing");
    }
    let _ = store.set_job_heartbeat(job_id).await;

    match process_batch(&store, runner.as_ref(), discoverer.as_ref(), &params, Some(job_id)).await {
        Ok(summary) => {
            let processed = summary.success_count + summary.fail_count;
            let status = if summary.fail_count == 0 { "completed" } else { "failed" };
            if let Err(e) = store
                .update_job_header(
                    job_id,
                    status,
                    Some(processed as i32),
                    Some(summary.success_count as i32),
                    Some(summary.fail_count as i32),
                    None,
                )
                .await
            {
                error!(%job_id, error = %e, "Failed to finalize batch job header");
            }
        }
        Err(e) => {
            error!(%job_id, error = %e, "Pipeline B backend failed");
            let _ = store
                .update_job_header(job_id, "failed", None, None, None, Some(&e.to_string()))
                .await;
        }
    }
}

async fn worker_loop(store: Store, runner: Arc<PipelineRunner>, job_id: Uuid, worker_id: &str) {
    loop {
        let _ = store.set_job_heartbeat(job_id).await;

        let item = match store.claim_job_item(job_id, worker_id).await {
            Ok(Some(item)) => item,
            Ok(None) => break,
            Err(e) => {
                error!(%job_id, worker_id, error = %e, "Claim failed; stopping worker");
                break;
            }
        };

        process_item(&store, runner.as_ref(), job_id, worker_id, &item).await;

        let _ = store.set_job_heartbeat(job_id).await;
        if let Err(e) = store.finalize_job_if_done(job_id).await {
            warn!(%job_id, error = %e, "Finalize check failed");
        }
    }
}

async fn process_item(
    store: &Store,
    runner: &PipelineRunner,
    job_id: Uuid,
    worker_id: &str,
    item: &JobItemRow,
) {
    let item_id = item.id;
    let target = item.target_id.clone();
    info!(%job_id, worker_id, %item_id, target = %target, "Item claimed");

    let _ = store.set_job_item_stage(item_id, Stage::Init.as_str()).await;

    // Keep the lease and heartbeat fresh while the pipeline runs.
    let hb_store = store.clone();
    let heartbeat = tokio::spawn(async move {
        loop {
            tokio::time::sleep(ITEM_HEARTBEAT).await;
            let _ = hb_store.touch_item(item_id, None).await;
            let _ = hb_store.set_job_heartbeat(job_id).await;
        }
    });

    let reporter = StoreStageReporter::new(store.clone(), item_id);
    let outcome = if target.starts_with("mock://") {
        run_mock_item(&reporter).await
    } else {
        runner.run(&target, "A", &reporter).await
    };
    heartbeat.abort();

    match outcome {
        Ok(post_id) => {
            finish_success(store, job_id, item_id, &post_id.to_string()).await;
        }
        Err(PipelineError::IngestNoPostId(e)) => {
            info!(%item_id, error = %e, "Runner returned no post id, recovering via store");
            match lens_pipeline::recovery::recover_post_id(store, &target).await {
                (Some(post_id), _) => {
                    // Only count success when the analysis actually landed.
                    let has_analysis = store
                        .get_post(post_id)
                        .await
                        .ok()
                        .flatten()
                        .map(|row| row.has_analysis())
                        .unwrap_or(false);
                    if has_analysis {
                        finish_success(store, job_id, item_id, &post_id.to_string()).await;
                    } else {
                        finish_failure(
                            store,
                            job_id,
                            item_id,
                            "analyst",
                            &format!("ANALYSIS_MISSING: post_id={post_id}"),
                        )
                        .await;
                    }
                }
                (None, tried) => {
                    finish_failure(
                        store,
                        job_id,
                        item_id,
                        "fetch",
                        &format!("POST_ID_NOT_FOUND: tried={tried:?}"),
                    )
                    .await;
                }
            }
        }
        Err(e) => {
            let stage = failure_stage(&e);
            error!(%job_id, worker_id, %item_id, error = %e, "Item failed");
            finish_failure(store, job_id, item_id, stage, &format!("{}: {e}", e.code())).await;
        }
    }
}

/// Mock targets walk the stage machine without touching external services.
async fn run_mock_item(reporter: &dyn StageReporter) -> Result<i64, PipelineError> {
    for stage in [Stage::Fetch, Stage::Vision, Stage::Analyst, Stage::Store] {
        tokio::time::sleep(Duration::from_millis(200)).await;
        reporter.report(&stage).await;
    }
    Ok(0)
}

fn failure_stage(e: &PipelineError) -> &'static str {
    match e {
        PipelineError::IngestNoPostId(_) | PipelineError::PostIdNotFound(_) => "fetch",
        PipelineError::AnalysisMissing(_) => "analyst",
        PipelineError::Runner(_) => "processing",
    }
}

async fn finish_success(store: &Store, job_id: Uuid, item_id: Uuid, post_id: &str) {
    let result = if post_id == "0" {
        format!("mock_res:{item_id}")
    } else {
        post_id.to_string()
    };
    if let Err(e) = store.complete_job_item(item_id, Some(&result)).await {
        error!(%item_id, error = %e, "Failed to complete item");
    }
    if let Err(e) = store.bump_job_counters(job_id, true, false).await {
        error!(%job_id, error = %e, "Failed to bump success counter");
    }
    info!(%item_id, result = %result, "Item done");
}

async fn finish_failure(store: &Store, job_id: Uuid, item_id: Uuid, stage: &str, log: &str) {
    if let Err(e) = store.fail_job_item(item_id, stage, log).await {
        error!(%item_id, error = %e, "Failed to mark item failed");
    }
    if let Err(e) = store.bump_job_counters(job_id, false, true).await {
        error!(%job_id, error = %e, "Failed to bump failure counter");
    }
}
