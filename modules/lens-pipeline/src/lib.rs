//! Per-item pipeline: drives one target through
//! fetch → vision → analyst → store with progressive stage emission.

pub mod clients;
pub mod recovery;
pub mod runner;
pub mod stage;
pub mod vision;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use runner::{PipelineError, PipelineRunner, RunnerDeps};
pub use stage::{NullReporter, StageReporter, StoreStageReporter};
