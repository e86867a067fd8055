//! Retrying backend calls that fail transiently.

use beacon_core::backend::BackendResult;
use beacon_core::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Delay between attempts of a transiently failing backend call.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Run `op` until it succeeds or fails with a non-retryable error.
///
/// Server and transport failures are retried every `interval`. Cancelling
/// `cancel` aborts the loop with [`Error::Cancelled`].
pub async fn with_retry<T, F, Fut>(
    what: &str,
    interval: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BackendResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = op() => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() => {
                warn!(%err, attempt, operation = what, "backend call failed, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
}
