use std::time::Duration;

use skein_core::config::RetryConfig;

/// Backoff before re-dispatching a step whose target was missing:
/// `|wait * multiplier^attempts + jitter(±5s)|`, attempts counted from zero.
pub fn backoff(config: &RetryConfig, attempts: u32) -> Duration {
    let jitter = rand::random::<f64>() * 10.0 - 5.0;
    let secs = (config.wait_secs as f64 * config.multiplier.powi(attempts as i32) + jitter).abs();
    Duration::from_secs_f64(secs)
}
