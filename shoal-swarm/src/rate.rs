use std::time::{Duration, Instant};

/// Sliding-window throughput estimate for one connection. Drives backlog
/// sizing: deep pipelines for fast peers, shallow ones for slow peers.
#[derive(Debug, Clone)]
pub struct RateMeter {
    window: Duration,
    since: Instant,
    last: Instant,
    rate: f64,
    total: u64,
}

impl RateMeter {
    pub fn new(window: Duration) -> RateMeter {
        let now = Instant::now();
        Self::new_at(window, now)
    }

    pub fn new_at(window: Duration, now: Instant) -> RateMeter {
        RateMeter {
            window,
            since: now.checked_sub(Duration::from_secs(1)).unwrap_or(now),
            last: now,
            rate: 0.0,
            total: 0,
        }
    }

    pub fn update(&mut self, bytes: u64) {
        self.update_at(Instant::now(), bytes)
    }

    pub fn update_at(&mut self, now: Instant, bytes: u64) {
        self.total += bytes;
        let now = now.max(self.last);
        let elapsed = now.duration_since(self.since).as_secs_f64().max(f64::EPSILON);
        let weight = self.last.duration_since(self.since).as_secs_f64();
        self.rate = (self.rate * weight + bytes as f64) / elapsed;
        self.last = now;
        if let Some(floor) = now.checked_sub(self.window) {
            if self.since < floor {
                self.since = floor;
            }
        }
    }

    /// Bytes per second over the window, decayed to now.
    pub fn rate(&mut self) -> f64 {
        self.rate_at(Instant::now())
    }

    pub fn rate_at(&mut self, now: Instant) -> f64 {
        self.update_at(now, 0);
        self.rate
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}
