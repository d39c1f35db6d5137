use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_TICK_RATE: u32 = 60;
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_REPLY_TIMEOUT_FACTOR: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS: usize = 32;

/// Tunables shared by every connection of one process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Time between ping requests on a handshaken connection
    pub ping_interval: Duration,
    /// Missing-reply deadline as a multiple of `ping_interval`
    pub reply_timeout_factor: u32,
    /// Capacity of the connection identifier pool
    pub max_connections: usize,
    /// Minimum age before an inbound message may be dequeued. Zero outside
    /// latency testing.
    pub extra_latency: Duration,
    /// Unhandled inbound messages older than this are discarded
    pub max_message_age: Duration,
    /// Deadline extension granted while a peer loads an arena
    pub arena_load_grace: Duration,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            ping_interval: DEFAULT_PING_INTERVAL,
            reply_timeout_factor: DEFAULT_REPLY_TIMEOUT_FACTOR,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            extra_latency: Duration::ZERO,
            max_message_age: Duration::from_secs(10),
            arena_load_grace: Duration::from_secs(15),
        }
    }
}

impl NetworkSettings {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }

    pub fn reply_timeout(&self) -> Duration {
        self.ping_interval * self.reply_timeout_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = NetworkSettings::default();
        assert_eq!(settings.tick_rate, 60);
        assert_eq!(settings.max_connections, 32);
        assert_eq!(settings.extra_latency, Duration::ZERO);
        assert_eq!(settings.reply_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_frame_duration() {
        let settings = NetworkSettings {
            tick_rate: 20,
            ..NetworkSettings::default()
        };
        assert_eq!(settings.frame_duration(), Duration::from_millis(50));
    }
}
