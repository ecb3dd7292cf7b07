//! Tick timing
//!
//! Each scheduler owns a [`TickClock`] that measures the wall time between
//! successive `update()` calls and hands it to systems as a [`DeltaTime`].

use std::time::{Duration, Instant};

/// Wall time between two consecutive ticks of one scheduler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct DeltaTime(Duration);

impl DeltaTime {
    pub fn duration(&self) -> Duration {
        self.0
    }

    /// Seconds, for integrating per-tick motion
    pub fn as_secs_f32(&self) -> f32 {
        self.0.as_secs_f32()
    }

    pub fn as_millis(&self) -> f64 {
        self.0.as_secs_f64() * 1000.0
    }
}

impl From<Duration> for DeltaTime {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

/// Interval and count of a scheduler's ticks
#[derive(Debug)]
pub struct TickClock {
    last_tick: Instant,
    delta: DeltaTime,
    tick_count: u64,
}

impl TickClock {
    /// Start a clock; the first tick measures from now
    pub fn new() -> Self {
        Self {
            last_tick: Instant::now(),
            delta: DeltaTime::default(),
            tick_count: 0,
        }
    }

    /// Capture the time elapsed since the previous tick
    pub fn tick(&mut self) -> DeltaTime {
        let now = Instant::now();
        self.delta = DeltaTime::from(now.duration_since(self.last_tick));
        self.last_tick = now;
        self.tick_count += 1;
        self.delta
    }

    /// Delta of the most recent tick
    pub fn delta(&self) -> DeltaTime {
        self.delta
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_counts_ticks() {
        let mut clock = TickClock::new();
        assert_eq!(clock.tick_count(), 0);
        assert_eq!(clock.delta(), DeltaTime::default());

        std::thread::sleep(Duration::from_millis(5));
        let dt = clock.tick();
        assert!(dt.duration() >= Duration::from_millis(5));
        assert!(dt.as_millis() >= 5.0);
        assert_eq!(clock.delta(), dt);

        clock.tick();
        assert_eq!(clock.tick_count(), 2);
    }
}
