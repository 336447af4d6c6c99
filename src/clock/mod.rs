use std::time::{Duration, Instant};

/// Number of distinct clock readings sampled by [`granularity`].
const GRANULARITY_SAMPLES: usize = 20;

/// Smallest change between two readings that counts as a tick.
const MIN_TICK: Duration = Duration::from_micros(1);

/// Calibration passes shorter than this many ticks give unreliable timings.
pub const MIN_TICKS_PER_TEST: f64 = 20.0;

/// Wall-clock stopwatch reporting seconds as `f64`.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    /// Start measuring now.
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Seconds since [`Stopwatch::start`].
    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// Runs `f` and returns its result with the elapsed seconds.
pub fn timed<R>(f: impl FnOnce() -> R) -> (R, f64) {
    let watch = Stopwatch::start();
    let out = f();
    (out, watch.elapsed_secs())
}

/// Estimates the clock granularity as the smallest observed gap between
/// successive distinct readings.
pub fn granularity() -> Duration {
    let mut readings = [Instant::now(); GRANULARITY_SAMPLES];
    let mut prev = Instant::now();

    for slot in readings.iter_mut() {
        let mut now = Instant::now();
        while now.duration_since(prev) < MIN_TICK {
            now = Instant::now();
        }
        *slot = now;
        prev = now;
    }

    readings
        .windows(2)
        .map(|pair| pair[1].duration_since(pair[0]))
        .min()
        .unwrap_or(MIN_TICK)
}

/// How many clock ticks `elapsed_secs` spans.
pub fn ticks(elapsed_secs: f64, granularity: Duration) -> f64 {
    let tick = granularity.as_secs_f64();
    if tick <= 0.0 {
        return f64::INFINITY;
    }
    elapsed_secs / tick
}
