use std::time::Duration;

use tokio::time::Instant;

/// Length of one accounting slice.
pub const SLICE_TIME: Duration = Duration::from_millis(100);

/// Slice-based throughput limiter.
///
/// Each slice may dispatch `quota` bytes. Exceeding the quota extends the current slice in
/// proportion to the excess and the caller is told to wait until it ends.
#[derive(Debug, Clone)]
pub struct RateLimit {
    slice_quota: u64,
    slice: Duration,
    slice_start: Option<Instant>,
    slice_end: Option<Instant>,
    dispatched: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimit {
    /// An unlimited limiter.
    pub fn new() -> Self {
        Self {
            slice_quota: 0,
            slice: SLICE_TIME,
            slice_start: None,
            slice_end: None,
            dispatched: 0,
        }
    }

    /// Limit throughput to `bytes_per_sec`; zero disables throttling.
    pub fn set_speed(&mut self, bytes_per_sec: u64) {
        self.slice = SLICE_TIME;
        self.slice_quota = if bytes_per_sec == 0 {
            0
        } else {
            let quota = u128::from(bytes_per_sec) * self.slice.as_nanos() / 1_000_000_000;
            u64::try_from(quota).unwrap_or(u64::MAX).max(1)
        };
    }

    pub fn is_enabled(&self) -> bool {
        self.slice_quota != 0
    }

    /// Account `n` dispatched bytes at `now` and return how long to wait before the next request.
    pub fn calculate_delay(&mut self, n: u64, now: Instant) -> Duration {
        if self.slice_quota == 0 {
            return Duration::ZERO;
        }

        let expired = !matches!(self.slice_end, Some(end) if end >= now);
        if expired {
            self.slice_start = Some(now);
            self.slice_end = Some(now + self.slice);
            self.dispatched = 0;
        }

        self.dispatched = self.dispatched.saturating_add(n);
        if self.dispatched < self.slice_quota {
            return Duration::ZERO;
        }

        let start = self.slice_start.unwrap_or(now);
        let extended = u128::from(self.dispatched) * self.slice.as_nanos()
            / u128::from(self.slice_quota);
        let end = start + Duration::from_nanos(u64::try_from(extended).unwrap_or(u64::MAX));
        self.slice_end = Some(end);
        end.saturating_duration_since(now)
    }
}
