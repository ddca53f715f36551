//! Capped exponential backoff around read-modify-write sequences against the
//! API server. Concurrent reconciliations regularly race on the same
//! objects, so conflicts are expected rather than exceptional.

use std::future::Future;
use std::time::Duration;

const STEPS: u32 = 5;
const BASE_DELAY: Duration = Duration::from_millis(200);
const FACTOR: f64 = 2.0;
const JITTER: f64 = 0.2;

/// Runs `op` up to five times, sleeping 200 ms, 400 ms, ... (with +/-20%
/// jitter) between attempts that fail with a retriable API error.
pub(crate) async fn with_backoff<T, F, Fut>(mut op: F) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    let mut delay = BASE_DELAY;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                attempt += 1;
                if attempt >= STEPS || !is_retriable(&error) {
                    return Err(error);
                }
                tracing::debug!(%error, attempt, "Retrying API operation");
                let jitter = 1.0 + JITTER * (rand::random::<f64>() * 2.0 - 1.0);
                tokio::time::sleep(delay.mul_f64(jitter)).await;
                delay = delay.mul_f64(FACTOR);
            }
        }
    }
}

fn is_retriable(error: &kube::Error) -> bool {
    match error {
        kube::Error::Api(rsp) => matches!(rsp.code, 409 | 429 | 500 | 502 | 503 | 504),
        _ => false,
    }
}
