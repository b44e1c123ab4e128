use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_MAX_SAMPLES: usize = 128;

/// Rolling throughput estimate over a recent time window.
///
/// Feed it byte deltas as they are acknowledged; it keeps at most
/// `max_samples` of them and forgets anything older than the window.
pub struct SpeedCalculator {
    window: Duration,
    max_samples: usize,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(None, None)
    }
}

impl SpeedCalculator {
    /// `window` defaults to 5 s and `max_samples` to 128.
    pub fn new(window: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            window: window.unwrap_or(DEFAULT_WINDOW),
            max_samples: max_samples.unwrap_or(DEFAULT_MAX_SAMPLES).max(2),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    fn samples(&self) -> MutexGuard<'_, VecDeque<(Instant, u64)>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `delta` bytes acknowledged now.
    pub fn add_sample(&self, delta: u64) {
        self.record_at(Instant::now(), delta);
    }

    fn record_at(&self, at: Instant, delta: u64) {
        let mut samples = self.samples();
        samples.push_back((at, delta));
        while samples
            .front()
            .is_some_and(|(t, _)| at.saturating_duration_since(*t) > self.window)
        {
            samples.pop_front();
        }
        while samples.len() > self.max_samples {
            samples.pop_front();
        }
    }

    /// Bytes per second across the retained samples.
    ///
    /// The oldest sample only marks the start of the interval, so its own
    /// bytes are not counted. Zero until two samples span a non-zero time.
    pub fn bytes_per_second(&self) -> f64 {
        let samples = self.samples();
        let (Some((start, _)), Some((end, _))) = (samples.front(), samples.back()) else {
            return 0.0;
        };
        let elapsed = end.saturating_duration_since(*start).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        let bytes: u64 = samples.iter().skip(1).map(|(_, delta)| delta).sum();
        bytes as f64 / elapsed
    }

    /// Time left for `remaining_bytes` at the current rate, if any.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let rate = self.bytes_per_second();
        (rate > 0.0).then(|| Duration::from_secs_f64(remaining_bytes as f64 / rate))
    }
}
