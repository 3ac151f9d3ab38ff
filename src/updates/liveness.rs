use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleVerdict {
    Alive,
    /// Quiet too long; send one ping and re-check after the grace period.
    Probe,
    /// A probe is already in flight.
    AwaitingProbe,
    /// Quiet too long and the transport is not open, so probing is pointless.
    Reconnect,
}

/// Tracks the last inbound traffic on one channel.
#[derive(Debug, Clone)]
pub struct Liveness {
    last_seen: Instant,
    timeout: Duration,
    probe_pending: bool,
}

impl Liveness {
    pub fn new(now: Instant, timeout: Duration) -> Self {
        Self {
            last_seen: now,
            timeout,
            probe_pending: false,
        }
    }

    /// Any inbound frame counts, not only pongs.
    pub fn record(&mut self, now: Instant) {
        self.last_seen = now;
        self.probe_pending = false;
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_seen) > self.timeout
    }

    pub fn check(&mut self, now: Instant, channel_open: bool) -> StaleVerdict {
        if !self.is_stale(now) {
            return StaleVerdict::Alive;
        }
        if !channel_open {
            return StaleVerdict::Reconnect;
        }
        if self.probe_pending {
            return StaleVerdict::AwaitingProbe;
        }
        self.probe_pending = true;
        StaleVerdict::Probe
    }

    /// Called when the probe grace period ends; true means give up on the channel.
    pub fn confirm_stale(&mut self, now: Instant) -> bool {
        self.probe_pending = false;
        self.is_stale(now)
    }
}
