use backoff::backoff::Backoff as _;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::time::Duration;

/// Decides how long to wait before the next connection attempt.
///
/// Consulted before every attempt except the first; reset once a session is
/// established.
pub trait ReconnectPolicy: Send {
    fn next_delay(&mut self) -> Duration;
    fn reset(&mut self);
}

/// Reconnect without delay.
#[derive(Debug, Default, Clone, Copy)]
pub struct Immediate;

impl ReconnectPolicy for Immediate {
    fn next_delay(&mut self) -> Duration {
        Duration::ZERO
    }

    fn reset(&mut self) {}
}

/// Bounded exponential delay: `initial`, `initial * multiplier`, ... capped at `max`.
pub struct Exponential {
    backoff: ExponentialBackoff,
}

impl Exponential {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(initial)
            .with_max_interval(max)
            .with_multiplier(multiplier)
            .with_randomization_factor(jitter)
            .with_max_elapsed_time(None)
            .build();
        Self { backoff }
    }
}

impl ReconnectPolicy for Exponential {
    fn next_delay(&mut self) -> Duration {
        self.backoff
            .next_backoff()
            .unwrap_or(self.backoff.max_interval)
    }

    fn reset(&mut self) {
        self.backoff.reset();
    }
}
