//! Job orchestration: lifecycle, discovery, claim-loop workers, the
//! dedicated keyword-batch backend, and the crash-resume batch state file.

pub mod batch;
pub mod batch_resume;
pub mod manager;
pub mod worker;

pub use batch::{process_batch, BatchParams, BatchSummary};
pub use batch_resume::{run_resumable_batch, BatchResumeOptions, BatchState, UrlState};
pub use manager::{JobError, JobManager};
pub use worker::run_job;
