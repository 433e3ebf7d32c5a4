use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const DEFAULT_FPS_SAMPLES: usize = 60;
pub const DEFAULT_FPS_WINDOW: Duration = Duration::from_secs(5);

/// Rolling rate estimator over completion timestamps.
///
/// Keeps at most `max_samples` instants, drops those older than `window`
/// (always retaining the latest two so slow cadences still report), and
/// computes `(n - 1) / (last - first)`. A series that has gone quiet for
/// longer than both `window` and twice its own mean interval reads as zero.
#[derive(Clone, Debug)]
pub struct FpsWindow {
    samples: VecDeque<Instant>,
    max_samples: usize,
    window: Duration,
    total: u64,
}

impl FpsWindow {
    pub fn new(max_samples: usize, window: Duration) -> Self {
        let max_samples = max_samples.max(2);
        Self {
            samples: VecDeque::with_capacity(max_samples),
            max_samples,
            window,
            total: 0,
        }
    }

    pub fn record(&mut self, at: Instant) {
        while self.samples.len() >= self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(at);
        self.total += 1;
        self.prune(at);
    }

    fn prune(&mut self, now: Instant) {
        while self.samples.len() > 2 {
            match self.samples.front() {
                Some(oldest) if now.saturating_duration_since(*oldest) > self.window => {
                    self.samples.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Current rate in events per second.
    pub fn fps(&self, now: Instant) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let span = last.saturating_duration_since(*first).as_secs_f64();
        if span <= 0.0 {
            return 0.0;
        }
        let mean_interval = span / (n - 1) as f64;
        let quiet = now.saturating_duration_since(*last).as_secs_f64();
        if quiet > self.window.as_secs_f64().max(2.0 * mean_interval) {
            return 0.0;
        }
        (n - 1) as f64 / span
    }

    /// Events recorded since creation.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn last(&self) -> Option<Instant> {
        self.samples.back().copied()
    }
}

impl Default for FpsWindow {
    fn default() -> Self {
        Self::new(DEFAULT_FPS_SAMPLES, DEFAULT_FPS_WINDOW)
    }
}

/// Round to one decimal for display, like the dashboard counters.
pub fn round_fps(fps: f64) -> f64 {
    (fps * 10.0).round() / 10.0
}
