use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::error::is_transient;

const RETRIES: u32 = 3;
const BASE_SLEEP: Duration = Duration::from_millis(300);

/// Run a store call with exponential backoff on the transient allowlist.
///
/// Returns `Ok(Some(v))` on success, `Ok(None)` when transient retries are
/// exhausted (read paths degrade on this), and `Err` immediately for logic
/// errors, which never retry.
pub(crate) async fn retry_db<T, F, Fut>(op: &'static str, mut f: F) -> Result<Option<T>, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut last_error = None;
    for attempt in 0..RETRIES {
        match f().await {
            Ok(v) => return Ok(Some(v)),
            Err(e) if is_transient(&e) => {
                let wait = BASE_SLEEP * 2u32.pow(attempt);
                warn!(
                    op,
                    attempt = attempt + 1,
                    retries = RETRIES,
                    backoff_ms = wait.as_millis() as u64,
                    error = %e,
                    "Store retry"
                );
                last_error = Some(e);
                tokio::time::sleep(wait).await;
            }
            Err(e) => {
                error!(op, error = %e, "Store logic error (no retry)");
                return Err(e);
            }
        }
    }

    error!(op, error = ?last_error, "Store retries exhausted");
    Ok(None)
}
