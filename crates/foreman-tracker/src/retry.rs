use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

/// Which failures a request may be re-sent after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Reads: any transient status or transport failure.
    Idempotent,
    /// Writes that create something: only failures that prove the server
    /// never acted on the request (429, or no connection at all).
    SingleDelivery,
}

impl RetryPolicy {
    pub fn retries_status(self, status: u16) -> bool {
        match self {
            Self::Idempotent => should_retry_status(status),
            Self::SingleDelivery => status == 429,
        }
    }

    pub fn retries_transport(self, error: &reqwest::Error) -> bool {
        match self {
            Self::Idempotent => is_retryable_transport_error(error),
            Self::SingleDelivery => error.is_connect(),
        }
    }
}

pub fn should_retry_status(status: u16) -> bool {
    status == 408 || status == 409 || status == 425 || status == 429 || status >= 500
}

pub fn is_retryable_transport_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request() || error.is_body()
}

pub fn parse_retry_after_ms(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let raw = headers.get("retry-after")?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds.saturating_mul(1000));
    }

    let retry_at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let delay_ms = retry_at.signed_duration_since(Utc::now()).num_milliseconds();
    if delay_ms <= 0 {
        return Some(0);
    }
    u64::try_from(delay_ms).ok()
}

/// Exponential backoff with deterministic jitter in `[0, base_delay_ms / 2]`,
/// floored by any server-provided retry-after.
pub fn retry_delay_ms(
    base_delay_ms: u64,
    attempt: usize,
    jitter_seed: &str,
    retry_after_ms: Option<u64>,
) -> u64 {
    let exponent = attempt.saturating_sub(1).min(6) as u32;
    let backoff = base_delay_ms.saturating_mul(1_u64 << exponent);
    let jitter_width = base_delay_ms / 2;
    let jitter = if jitter_width == 0 {
        0
    } else {
        let mut hasher = Sha256::new();
        hasher.update(jitter_seed.as_bytes());
        hasher.update(attempt.to_le_bytes());
        let digest = hasher.finalize();
        let mut seed_bytes = [0_u8; 8];
        seed_bytes.copy_from_slice(&digest[..8]);
        u64::from_le_bytes(seed_bytes) % jitter_width.saturating_add(1)
    };
    let delay = backoff.saturating_add(jitter);
    match retry_after_ms {
        Some(retry_after_ms) => delay.max(retry_after_ms),
        None => delay,
    }
}

pub fn retry_delay(
    base_delay_ms: u64,
    attempt: usize,
    jitter_seed: &str,
    retry_after_ms: Option<u64>,
) -> Duration {
    Duration::from_millis(retry_delay_ms(
        base_delay_ms,
        attempt,
        jitter_seed,
        retry_after_ms,
    ))
}
