//! Throttled transfer speed sampling and ETA estimation.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Minimum interval between speed samples.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

struct SpeedInner {
    last_loaded: u64,
    last_at: Option<Instant>,
    current: u64,
    limit: Option<u64>,
}

/// Instantaneous transfer speed, sampled at most once per second.
///
/// `speed = (loaded - last_loaded) / elapsed`, clamped to the
/// configured limit. Reset whenever the owning job leaves the Running
/// state, restarted at the beginning of each run.
pub struct SpeedCounter {
    inner: Mutex<SpeedInner>,
}

impl SpeedCounter {
    /// Creates a counter, optionally clamped to `limit` bytes/sec.
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                last_loaded: 0,
                last_at: None,
                current: 0,
                limit,
            }),
        }
    }

    pub fn set_limit(&self, limit: Option<u64>) {
        self.inner.lock().unwrap().limit = limit;
    }

    /// Begins a sampling run from the given byte offset.
    pub fn start(&self, loaded: u64) {
        let mut s = self.inner.lock().unwrap();
        s.last_loaded = loaded;
        s.last_at = Some(Instant::now());
        s.current = 0;
    }

    /// Records the current loaded count, returning the (possibly
    /// unchanged) speed in bytes/sec. Throttled: samples closer than
    /// one second to the previous one are ignored.
    pub fn sample(&self, loaded: u64) -> u64 {
        self.sample_at(loaded, Instant::now())
    }

    fn sample_at(&self, loaded: u64, now: Instant) -> u64 {
        let mut s = self.inner.lock().unwrap();
        let Some(last_at) = s.last_at else {
            s.last_loaded = loaded;
            s.last_at = Some(now);
            return s.current;
        };

        let elapsed = now.saturating_duration_since(last_at);
        if elapsed < SAMPLE_INTERVAL {
            return s.current;
        }

        let delta = loaded.saturating_sub(s.last_loaded);
        let mut speed = (delta as f64 / elapsed.as_secs_f64()) as u64;
        if let Some(limit) = s.limit
            && limit > 0
        {
            speed = speed.min(limit);
        }

        s.current = speed;
        s.last_loaded = loaded;
        s.last_at = Some(now);
        speed
    }

    /// Last sampled speed in bytes/sec.
    pub fn current(&self) -> u64 {
        self.inner.lock().unwrap().current
    }

    /// Estimated time to move the remaining bytes, `None` when the
    /// speed is zero.
    pub fn eta(&self, loaded: u64, total: u64) -> Option<Duration> {
        let speed = self.current();
        if speed == 0 {
            return None;
        }
        let remaining = total.saturating_sub(loaded);
        Some(Duration::from_secs_f64(remaining as f64 / speed as f64))
    }

    /// Zeroes the counter.
    pub fn reset(&self) {
        let mut s = self.inner.lock().unwrap();
        s.last_loaded = 0;
        s.last_at = None;
        s.current = 0;
    }
}
