use std::time::Duration;

/// Exponential backoff w/ "full jitter":
/// a delay drawn uniformly from [0, min(cap, base * 2^attempt)].
///
/// This tends to behave well under contention and avoids lockstep retries.
/// Used to space the platform poll loops (ephemeral-pod completion,
/// namespace-deletion wait).
pub fn backoff_full_jitter(base: Duration, cap: Duration, attempt: usize) -> Duration {
    // Millis math to avoid Duration overflow footguns.
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;

    // 2^attempt, saturating if attempt is huge.
    let pow = if attempt >= 63 {
        u64::MAX
    } else {
        1u64 << attempt
    };

    let exp_ms = base_ms.saturating_mul(pow);
    let upper = exp_ms.min(cap_ms).max(1); // avoid 0ms upper bound

    // Full jitter: uniform random in [0, upper]
    let jitter_ms = rand::random_range(0..=upper);
    Duration::from_millis(jitter_ms)
}
