// walink Engine — Reconnect Backoff
//
// Escalating delay for the Telegram polling loop after transport failures.

use std::time::{Duration, SystemTime};

/// Initial reconnect delay in milliseconds (doubles each attempt).
const INITIAL_RECONNECT_DELAY_MS: u64 = 1_000;

/// Maximum reconnect delay cap in milliseconds (5 minutes).
const MAX_RECONNECT_DELAY_MS: u64 = 300_000;

/// Compute and sleep an exponential backoff delay with ±25% jitter.
/// `attempt` is 0-based. Returns the actual delay for logging.
pub async fn reconnect_delay(attempt: u32) -> Duration {
    let base_ms = INITIAL_RECONNECT_DELAY_MS * 2u64.pow(attempt.min(12));
    let capped_ms = base_ms.min(MAX_RECONNECT_DELAY_MS);
    let jittered = apply_jitter(capped_ms);
    let delay = Duration::from_millis(jittered);
    tokio::time::sleep(delay).await;
    delay
}

/// Apply ±25% jitter to prevent thundering-herd effects.
fn apply_jitter(base_ms: u64) -> u64 {
    let jitter_range = (base_ms / 4) as i64;
    if jitter_range == 0 {
        return base_ms.max(100);
    }
    let offset = (rand_jitter() % (2 * jitter_range + 1)) - jitter_range;
    let result = base_ms as i64 + offset;
    result.max(100) as u64
}

/// Simple jitter source using system clock nanos (no RNG state needed).
fn rand_jitter() -> i64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_range() {
        for base in [100, 1000, 5000, 30_000] {
            let result = apply_jitter(base);
            let lower = (base as f64 * 0.7) as u64;
            let upper = (base as f64 * 1.3) as u64;
            assert!(
                result >= lower.max(100) && result <= upper,
                "jitter({}) = {} not in [{}, {}]",
                base,
                result,
                lower,
                upper
            );
        }
    }
}
