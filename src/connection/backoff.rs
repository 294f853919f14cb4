use core::time::Duration;
use rand::Rng;

const BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_DELAY: Duration = Duration::from_secs(30);
const FACTOR: f64 = 2.0;
const JITTER: f64 = 0.2;

/// Exponential backoff for the redial loop. Delays start at 500 ms, double
/// per failed attempt up to 30 s, and carry a ±20% jitter so a fleet of
/// endpoints does not stampede a recovering broker.
#[derive(Clone, Debug)]
pub(crate) struct ExponentialBackoff {
    current: Duration,
}

impl ExponentialBackoff {
    pub(crate) fn new() -> Self {
        ExponentialBackoff { current: BASE_DELAY }
    }

    /// Returns the next sleep interval and advances the schedule.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = jittered(self.current);
        let grown = Duration::from_secs_f64(self.current.as_secs_f64() * FACTOR);
        self.current = grown.min(MAX_DELAY);
        delay
    }

    /// Back to the base delay. Called after a successful dial so the next
    /// outage starts from a short retry interval again.
    pub(crate) fn reset(&mut self) {
        self.current = BASE_DELAY;
    }
}

fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
