use rampart_document::{Document, DocumentError, DocumentKey, DocumentStore, Record};
use tracing::{info, warn};

use crate::{Decision, FailReason, FailureClass, OpenFailure, RetryPolicy, classify};

/// Opens `key` through `store`, retrying per `policy`.
///
/// Returns the document and whether this call opened it (`false` when it
/// was already open or another caller's open was shared). Attempts never
/// exceed [`RetryPolicy::max_attempts`]. The only suspension points are
/// the store call and the backoff sleep.
///
/// # Errors
/// Exactly one [`OpenFailure`] per failed call; see its variants.
pub async fn open_with_retry<T: Record>(
    store: &DocumentStore<T>,
    key: &DocumentKey,
    policy: &RetryPolicy,
) -> Result<(Document<T>, bool), OpenFailure> {
    let mut attempt = 1;
    loop {
        let err = match store.get_document(key).await {
            Ok(opened) => {
                if attempt > 1 {
                    info!(%key, attempt, "open succeeded after retry");
                }
                return Ok(opened);
            }
            Err(err) => err,
        };

        let class = classify(&err);
        match policy.decide(attempt, class) {
            Decision::RetryAfter(delay) => {
                let delay = delay + policy.jitter();
                warn!(
                    %key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "open failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Decision::Fail(reason) => {
                let failure = to_failure(class, reason, attempt, &err);
                warn!(%key, attempt, error = %failure, "open failed, giving up");
                return Err(failure);
            }
        }
    }
}

fn to_failure(
    class: FailureClass,
    reason: FailReason,
    attempts: u32,
    err: &DocumentError,
) -> OpenFailure {
    if matches!(err, DocumentError::StoreClosed) {
        return OpenFailure::ShuttingDown;
    }
    let detail = err.to_string();
    match (class, reason) {
        (FailureClass::BackwardsCompatibility, _) => OpenFailure::BackwardsCompatibility(detail),
        (FailureClass::BackendService, FailReason::Exhausted) => {
            OpenFailure::BackendService { attempts, detail }
        }
        (FailureClass::Unclassified, FailReason::Exhausted) => {
            OpenFailure::ExhaustedRetries { attempts, detail }
        }
        // Fatal, or a retryable class the policy refused outright.
        _ => OpenFailure::Other(detail),
    }
}
