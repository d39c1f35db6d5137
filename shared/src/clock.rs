use std::time::{Duration, Instant};

/// Source of simulation time and frame numbers
pub trait SimulationClock {
    /// Time elapsed since the simulation started
    fn time(&self) -> Duration;
    /// Number of the current simulation tick
    fn frame(&self) -> u32;
    /// Length of one simulation tick
    fn frame_duration(&self) -> Duration;
}

/// Fixed-step clock advanced once per main-loop tick
#[derive(Debug, Clone)]
pub struct TickClock {
    started: Instant,
    frame: u32,
    frame_duration: Duration,
}

impl TickClock {
    pub fn new(tick_rate: u32) -> Self {
        Self {
            started: Instant::now(),
            frame: 0,
            frame_duration: Duration::from_secs_f64(1.0 / f64::from(tick_rate.max(1))),
        }
    }

    /// Advances to the next frame and returns its number
    pub fn advance(&mut self) -> u32 {
        self.frame = self.frame.wrapping_add(1);
        self.frame
    }
}

impl SimulationClock for TickClock {
    fn time(&self) -> Duration {
        self.started.elapsed()
    }

    fn frame(&self) -> u32 {
        self.frame
    }

    fn frame_duration(&self) -> Duration {
        self.frame_duration
    }
}

/// Clock whose time and frame are set explicitly
#[derive(Debug, Clone)]
pub struct ManualClock {
    pub time: Duration,
    pub frame: u32,
    pub frame_duration: Duration,
}

impl ManualClock {
    pub fn new(frame_duration: Duration) -> Self {
        Self {
            time: Duration::ZERO,
            frame: 0,
            frame_duration,
        }
    }

    /// Moves forward by `frames` ticks
    pub fn step(&mut self, frames: u32) {
        self.frame = self.frame.wrapping_add(frames);
        self.time += self.frame_duration * frames;
    }
}

impl SimulationClock for ManualClock {
    fn time(&self) -> Duration {
        self.time
    }

    fn frame(&self) -> u32 {
        self.frame
    }

    fn frame_duration(&self) -> Duration {
        self.frame_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_clock_frame_duration() {
        let clock = TickClock::new(50);
        assert_eq!(clock.frame_duration(), Duration::from_millis(20));
        assert_eq!(clock.frame(), 0);
    }

    #[test]
    fn test_tick_clock_advance() {
        let mut clock = TickClock::new(60);
        assert_eq!(clock.advance(), 1);
        assert_eq!(clock.advance(), 2);
        assert_eq!(clock.frame(), 2);
    }

    #[test]
    fn test_zero_tick_rate_is_clamped() {
        let clock = TickClock::new(0);
        assert_eq!(clock.frame_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_manual_clock_step() {
        let mut clock = ManualClock::new(Duration::from_millis(10));
        clock.step(5);
        assert_eq!(clock.frame(), 5);
        assert_eq!(clock.time(), Duration::from_millis(50));
    }
}
