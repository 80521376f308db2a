//! Clock & metrics (C1).
//!
//! Monotonic timing and rolling render/decode statistics. Reads from the
//! render hot path are lock-free; writes happen once per frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Fixed-size ring of recent sample values used for percentile estimates.
/// `push` never allocates.
#[derive(Debug)]
struct SampleRing {
    samples: [f64; Self::CAPACITY],
    next: usize,
    len: usize,
}

impl SampleRing {
    const CAPACITY: usize = 600;

    fn new() -> Self {
        Self {
            samples: [0.0; Self::CAPACITY],
            next: 0,
            len: 0,
        }
    }

    fn push(&mut self, value: f64) {
        self.samples[self.next] = value;
        self.next = (self.next + 1) % Self::CAPACITY;
        self.len = (self.len + 1).min(Self::CAPACITY);
    }

    /// Linear-interpolated percentile, `p` in `[0.0, 1.0]`.
    fn percentile(&self, p: f64) -> Option<f64> {
        if self.len == 0 {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples[..self.len].to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let rank = (p * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[rank.min(sorted.len() - 1)])
    }

    fn mean(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        self.samples[..self.len].iter().sum::<f64>() / self.len as f64
    }
}

/// Per-stream decode timing, kept separately from render timing because
/// two streams advance independently (§5).
#[derive(Debug)]
pub struct StreamMetrics {
    decode_ms: parking_lot::Mutex<SampleRing>,
    frames_decoded: AtomicU64,
    frames_repeated: AtomicU64,
    frames_dropped: AtomicU64,
    hw_fallbacks: AtomicU64,
}

impl StreamMetrics {
    fn new() -> Self {
        Self {
            decode_ms: parking_lot::Mutex::new(SampleRing::new()),
            frames_decoded: AtomicU64::new(0),
            frames_repeated: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            hw_fallbacks: AtomicU64::new(0),
        }
    }

    pub fn record_decode(&self, elapsed: Duration) {
        self.decode_ms.lock().push(elapsed.as_secs_f64() * 1000.0);
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_repeat(&self) {
        self.frames_repeated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hw_fallback(&self) {
        self.hw_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_mean_ms(&self) -> f64 {
        self.decode_ms.lock().mean()
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded.load(Ordering::Relaxed)
    }

    pub fn frames_repeated(&self) -> u64 {
        self.frames_repeated.load(Ordering::Relaxed)
    }
}

/// Snapshot of the engine's rolling metrics, safe to poll from an
/// external launcher for an on-screen stats overlay (the overlay itself
/// is drawn by the external overlay hook, not the core).
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    pub render_mean_ms: f64,
    pub render_p99_ms: f64,
    pub frames_presented: u64,
    pub frames_repeated: u64,
    pub missed_vsyncs: u64,
}

/// Owns all timing state; one instance per engine.
pub struct Metrics {
    started_at: Instant,
    render_ms: parking_lot::Mutex<SampleRing>,
    frames_presented: AtomicU64,
    missed_vsyncs: AtomicU64,
    streams: Vec<StreamMetrics>,
}

impl Metrics {
    pub fn new(stream_count: usize) -> Self {
        Self {
            started_at: Instant::now(),
            render_ms: parking_lot::Mutex::new(SampleRing::new()),
            frames_presented: AtomicU64::new(0),
            missed_vsyncs: AtomicU64::new(0),
            streams: (0..stream_count).map(|_| StreamMetrics::new()).collect(),
        }
    }

    pub fn stream(&self, index: usize) -> &StreamMetrics {
        &self.streams[index]
    }

    pub fn record_frame(&self, render_time: Duration, missed_vsync: bool) {
        self.render_ms
            .lock()
            .push(render_time.as_secs_f64() * 1000.0);
        self.frames_presented.fetch_add(1, Ordering::Relaxed);
        if missed_vsync {
            self.missed_vsyncs.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> EngineMetrics {
        let ring = self.render_ms.lock();
        EngineMetrics {
            render_mean_ms: ring.mean(),
            render_p99_ms: ring.percentile(0.99).unwrap_or(0.0),
            frames_presented: self.frames_presented.load(Ordering::Relaxed),
            frames_repeated: self.streams.iter().map(|s| s.frames_repeated()).sum(),
            missed_vsyncs: self.missed_vsyncs.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_ring_wraps_without_growing() {
        let mut ring = SampleRing::new();
        for i in 0..(SampleRing::CAPACITY * 3) {
            ring.push(i as f64);
        }
        assert_eq!(ring.len, SampleRing::CAPACITY);
    }

    #[test]
    fn percentile_of_uniform_samples_is_close_to_expected() {
        let mut ring = SampleRing::new();
        for i in 0..600 {
            ring.push(i as f64);
        }
        let p99 = ring.percentile(0.99).unwrap();
        assert!((p99 - 593.0).abs() < 2.0);
    }

    #[test]
    fn metrics_track_per_stream_counters_independently() {
        let metrics = Metrics::new(2);
        metrics.stream(0).record_decode(Duration::from_millis(3));
        metrics.stream(1).record_repeat();
        assert_eq!(metrics.stream(0).frames_decoded(), 1);
        assert_eq!(metrics.stream(1).frames_decoded(), 0);
        assert_eq!(metrics.stream(1).frames_repeated(), 1);
    }

    #[test]
    fn snapshot_reflects_missed_vsync_count() {
        let metrics = Metrics::new(1);
        metrics.record_frame(Duration::from_millis(16), false);
        metrics.record_frame(Duration::from_millis(20), true);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_presented, 2);
        assert_eq!(snapshot.missed_vsyncs, 1);
    }
}
