//! Stage emission. This is the only channel external observers rely on for
//! streaming progress, so transitions are reported on every edge with a
//! short wait budget and duplicate suppression.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use lens_common::Stage;
use lens_store::Store;

/// Budget for one stage emission; timeouts are logged and ignored.
pub const STAGE_REPORT_BUDGET: Duration = Duration::from_secs(2);

#[async_trait]
pub trait StageReporter: Send + Sync {
    async fn report(&self, stage: &Stage);
}

/// Reporter for runs with no observing job item (CLI, ad-hoc).
pub struct NullReporter;

#[async_trait]
impl StageReporter for NullReporter {
    async fn report(&self, _stage: &Stage) {}
}

/// Writes stage transitions onto the job item row. Consecutive duplicates
/// are suppressed; a timed-out write is dropped, not retried, so a slow
/// store can never stall the pipeline.
pub struct StoreStageReporter {
    store: Store,
    item_id: Uuid,
    last_emitted: Mutex<Option<Stage>>,
}

impl StoreStageReporter {
    pub fn new(store: Store, item_id: Uuid) -> Self {
        Self {
            store,
            item_id,
            last_emitted: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StageReporter for StoreStageReporter {
    async fn report(&self, stage: &Stage) {
        {
            let mut last = self.last_emitted.lock().expect("stage reporter lock poisoned");
            if last.as_ref() == Some(stage) {
                return;
            }
            *last = Some(stage.clone());
        }

        let write = self.store.set_job_item_stage(self.item_id, stage.as_str());
        match tokio::time::timeout(STAGE_REPORT_BUDGET, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(item_id = %self.item_id, stage = %stage, error = %e, "Stage update failed");
            }
            Err(_) => {
                warn!(item_id = %self.item_id, stage = %stage, "Stage update timed out");
            }
        }
    }
}
