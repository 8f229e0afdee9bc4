use tokio::time::Instant;

use crate::util::safe_converter::SaturatingCast;

/// Monotonic microsecond clock, counting from the moment it was created. All membership
///  timestamps of one engine are taken from the same clock, so they are only comparable
///  within that engine.
#[derive(Debug, Clone, Copy)]
pub struct MicrosClock {
    reference_time: Instant,
}

impl MicrosClock {
    pub fn new() -> MicrosClock {
        MicrosClock {
            reference_time: Instant::now(),
        }
    }

    pub fn now_micros(&self) -> u64 {
        Instant::now()
            .duration_since(self.reference_time)
            .as_micros()
            .saturating_cast()
    }

    /// The instant corresponding to a timestamp of this clock, for sleeping until a deadline
    pub fn instant_at(&self, micros: u64) -> Instant {
        self.reference_time + std::time::Duration::from_micros(micros)
    }
}

impl Default for MicrosClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_now_micros_follows_time() {
        let clock = MicrosClock::new();
        assert_eq!(clock.now_micros(), 0);

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.now_micros(), 1_500_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_at() {
        let clock = MicrosClock::new();
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(clock.instant_at(3_000_000), Instant::now());
    }
}
