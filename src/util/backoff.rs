use std::time::Duration;

use rand::Rng;

const DEFAULT_INTERVAL_MILLIS: u64 = 5_000;
const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
const MAX_BACKOFF_MILLIS: u64 = 30 * 60 * 1_000;
const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy)]
struct BackoffConfig {
    interval_millis: u64,
    backoff_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            interval_millis: DEFAULT_INTERVAL_MILLIS,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

/// Delay before retrying after `consecutive_failures` failed attempts in a row. Zero failures
/// means no backoff.
pub fn backoff_delay(consecutive_failures: u32) -> Duration {
    backoff_delay_with_rng(
        consecutive_failures,
        BackoffConfig::default(),
        &mut rand::thread_rng(),
    )
}

fn backoff_delay_with_rng<R: Rng + ?Sized>(
    consecutive_failures: u32,
    config: BackoffConfig,
    rng: &mut R,
) -> Duration {
    if consecutive_failures == 0 {
        return Duration::ZERO;
    }
    let exponent = (consecutive_failures - 1).min(32) as i32;
    let base = (config.interval_millis as f64) * config.backoff_factor.powi(exponent);
    let jitter = RANDOM_FACTOR * base * rng.gen_range(-1.0..=1.0);
    let millis = (base + jitter)
        .round()
        .clamp(0.0, MAX_BACKOFF_MILLIS as f64);
    Duration::from_millis(millis as u64)
}
