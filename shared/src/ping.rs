//! Round-trip time and frame offset estimation.
//!
//! Each connection owns a [`PingClock`]. It asks for a ping once per
//! interval, answers the peer's pings with the local simulation time and
//! frame, and turns every pong into one RTT sample and one frame offset
//! sample. Both estimates are trimmed means over a four-slot window, so a
//! single late pong cannot drag the estimate around.

use crate::protocol::{Ping, Pong};
use std::time::Duration;

pub const SAMPLE_SLOTS: usize = 4;

/// Fixed-size ring buffer reporting the mean without its extremes
#[derive(Debug, Clone)]
pub struct SampleWindow<const N: usize> {
    slots: [i64; N],
    len: usize,
    next: usize,
}

impl<const N: usize> Default for SampleWindow<N> {
    fn default() -> Self {
        Self {
            slots: [0; N],
            len: 0,
            next: 0,
        }
    }
}

impl<const N: usize> SampleWindow<N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: i64) {
        self.slots[self.next] = sample;
        self.next = (self.next + 1) % N;
        self.len = (self.len + 1).min(N);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mean after discarding one minimum and one maximum. With fewer than
    /// three samples nothing can be discarded and the plain mean is used.
    pub fn trimmed_mean(&self) -> Option<f64> {
        if self.len == 0 {
            return None;
        }

        let samples = &self.slots[..self.len];
        let sum: i64 = samples.iter().sum();
        if self.len < 3 {
            return Some(sum as f64 / self.len as f64);
        }

        let min = samples.iter().copied().min().unwrap_or(0);
        let max = samples.iter().copied().max().unwrap_or(0);
        Some((sum - min - max) as f64 / (self.len - 2) as f64)
    }
}

#[derive(Debug, Clone)]
pub struct PingClock {
    interval: Duration,
    reply_timeout: Duration,
    next_ping_at: Duration,
    reply_deadline: Option<Duration>,
    rtt_micros: SampleWindow<SAMPLE_SLOTS>,
    frame_offsets: SampleWindow<SAMPLE_SLOTS>,
    round_trips: u32,
}

impl PingClock {
    /// `reply_timeout_factor` multiplies the interval to give the
    /// missing-reply deadline.
    pub fn new(interval: Duration, reply_timeout_factor: u32) -> Self {
        Self {
            interval,
            reply_timeout: interval * reply_timeout_factor,
            next_ping_at: Duration::ZERO,
            reply_deadline: None,
            rtt_micros: SampleWindow::new(),
            frame_offsets: SampleWindow::new(),
            round_trips: 0,
        }
    }

    /// Returns a ping to send when the interval has elapsed. The first call
    /// also starts the missing-reply deadline.
    pub fn poll(&mut self, now: Duration) -> Option<Ping> {
        if self.reply_deadline.is_none() {
            self.reply_deadline = Some(now + self.reply_timeout);
        }

        if now < self.next_ping_at {
            return None;
        }

        self.next_ping_at = now + self.interval;
        Some(Ping {
            timestamp_micros: micros(now),
        })
    }

    /// Answer to a peer's ping
    pub fn reply(&self, ping: &Ping, now: Duration, frame: u32) -> Pong {
        Pong {
            timestamp_micros: ping.timestamp_micros,
            sim_time_micros: micros(now),
            frame,
        }
    }

    /// Records the pong's round trip and frame offset, returning the RTT.
    /// Pongs stamped in the future are ignored.
    pub fn record_pong(
        &mut self,
        pong: &Pong,
        now: Duration,
        local_frame: u32,
        frame_duration: Duration,
    ) -> Option<Duration> {
        let now_micros = micros(now);
        if pong.timestamp_micros > now_micros {
            return None;
        }

        let rtt_micros = now_micros - pong.timestamp_micros;
        self.rtt_micros.push(rtt_micros as i64);

        let frame_micros = frame_duration.as_micros().max(1) as f64;
        let one_way_frames = (rtt_micros as f64 / 2.0) / frame_micros;
        let offset = f64::from(local_frame) - (f64::from(pong.frame) + one_way_frames);
        self.frame_offsets.push(offset.round() as i64);

        self.round_trips = self.round_trips.saturating_add(1);
        self.reply_deadline = Some(now + self.reply_timeout);
        Some(Duration::from_micros(rtt_micros))
    }

    /// Trimmed mean round-trip time
    pub fn ping_time(&self) -> Option<Duration> {
        self.rtt_micros
            .trimmed_mean()
            .map(|mean| Duration::from_micros(mean.max(0.0).round() as u64))
    }

    /// Trimmed mean of frames to add to a remote frame number to express it
    /// in local frames
    pub fn frame_offset(&self) -> Option<i64> {
        self.frame_offsets.trimmed_mean().map(|mean| mean.round() as i64)
    }

    pub fn round_trips(&self) -> u32 {
        self.round_trips
    }

    pub fn has_round_trip(&self) -> bool {
        self.round_trips > 0
    }

    /// True once the reply deadline passed without a pong
    pub fn is_missing_replies(&self, now: Duration) -> bool {
        self.reply_deadline.is_some_and(|deadline| now > deadline)
    }

    /// Pushes the reply deadline to at least `now + extra`, e.g. while the
    /// peer is loading an arena
    pub fn relax(&mut self, now: Duration, extra: Duration) {
        let relaxed = now + extra;
        self.reply_deadline = Some(match self.reply_deadline {
            Some(deadline) => deadline.max(relaxed),
            None => relaxed,
        });
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}
