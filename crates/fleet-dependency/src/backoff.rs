//! ---
//! fleet_section: "02-dependency-engine"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Dependency engine orchestrating manifold workers."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::time::Duration;

use fleet_common::EngineConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Restart scheduling derived from [`EngineConfig`].
#[derive(Debug)]
pub struct Backoff {
    /// Delay before the first retry after a failure.
    pub error_delay: Duration,
    /// Growth factor applied per consecutive failure.
    pub factor: f64,
    /// Ceiling for failure delays, jitter included.
    pub max_delay: Duration,
    /// Maximum jitter added to each failure delay.
    pub jitter: Duration,
    rng: StdRng,
}

impl Backoff {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            error_delay: config.error_delay,
            factor: config.backoff_factor.max(1.0),
            max_delay: config.max_delay,
            jitter: config.jitter,
            rng: StdRng::from_entropy(),
        }
    }

    #[cfg(test)]
    fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Delay before the retry following the `failures`-th consecutive failure (1-indexed).
    pub fn delay(&mut self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(64) as i32;
        let max_secs = self.max_delay.as_secs_f64();
        let secs = (self.error_delay.as_secs_f64() * self.factor.powi(exponent)).min(max_secs);
        let base = Duration::from_secs_f64(secs.max(0.0));
        if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = self.rng.gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            (base + Duration::from_millis(jitter_ms)).min(self.max_delay)
        }
    }
}
