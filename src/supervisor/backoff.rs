use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub min: Duration,
    /// Cap on every delay.
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff with jitter that can be reset.
///
/// Delays never decrease between resets and never exceed [`BackoffConfig::max`].
#[derive(Debug)]
pub struct Backoff {
    builder: ExponentialBuilder,
    current: Option<ExponentialBackoff>,
    last: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let max = config.max.max(config.min);
        Self {
            builder: ExponentialBuilder::default()
                .with_min_delay(config.min)
                .with_max_delay(max)
                .with_factor(2.0)
                .with_jitter()
                .with_max_times(usize::MAX),
            current: None,
            last: Duration::ZERO,
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self
            .current
            .get_or_insert_with(|| self.builder.clone().build())
            .next()
            .unwrap_or(self.max)
            // jitter may step below the previous delay or above the cap
            .max(self.last)
            .min(self.max);
        self.last = delay;
        delay
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.last = Duration::ZERO;
    }
}
