use std::time::Duration;

use crate::ewma::Ewma;

/// Throughput estimator fed with request telemetry.
///
/// Two EWMAs over the same (weight = duration, sample = throughput)
/// pairs: the fast one reacts to drops, the slow one damps spikes. The
/// published estimate is the minimum of the two, which makes adaptation
/// quick to downgrade and slow to upgrade.
#[derive(Clone, Debug)]
pub struct BandwidthEstimator {
    fast_ewma: Ewma,
    slow_ewma: Ewma,
    bytes_sampled: u64,
    low_latency_mode: bool,
    /// Last accepted low-latency (chunk) throughput samples, in bps.
    low_latency_window: Vec<f64>,
}

impl BandwidthEstimator {
    const FAST_HALF_LIFE_SECS: f64 = 2.0;
    const SLOW_HALF_LIFE_SECS: f64 = 10.0;
    /// Samples smaller than this are connection noise, not throughput.
    const MINIMUM_CHUNK_BYTES: u64 = 16_000;
    /// No estimate is published before this many bytes were observed.
    const MINIMUM_TOTAL_BYTES: u64 = 150_000;
    const LOW_LATENCY_WINDOW_LEN: usize = 3;

    pub fn new(low_latency_mode: bool) -> Self {
        Self {
            fast_ewma: Ewma::new(Self::FAST_HALF_LIFE_SECS),
            slow_ewma: Ewma::new(Self::SLOW_HALF_LIFE_SECS),
            bytes_sampled: 0,
            low_latency_mode,
            low_latency_window: Vec::with_capacity(Self::LOW_LATENCY_WINDOW_LEN),
        }
    }

    /// Feed one request (or chunk) measurement.
    pub fn add_sample(&mut self, duration: Duration, num_bytes: u64, is_chunk: bool) {
        let duration_ms = (duration.as_secs_f64() * 1000.0).max(1.0);
        let bandwidth_bps = num_bytes as f64 * 8000.0 / duration_ms;

        if is_chunk
            && self.low_latency_mode
            && !self.should_consider_low_latency_sample(bandwidth_bps)
        {
            return;
        }
        if num_bytes < Self::MINIMUM_CHUNK_BYTES {
            return;
        }

        let weight = duration_ms / 1000.0;
        self.bytes_sampled = self.bytes_sampled.saturating_add(num_bytes);
        self.fast_ewma.add_sample(weight, bandwidth_bps);
        self.slow_ewma.add_sample(weight, bandwidth_bps);
    }

    /// Estimated throughput in bits per second.
    ///
    /// `None` until enough bytes have been observed to say anything.
    pub fn get_estimate(&self) -> Option<f64> {
        if self.bytes_sampled < Self::MINIMUM_TOTAL_BYTES {
            return None;
        }
        Some(
            self.fast_ewma
                .get_estimate()
                .min(self.slow_ewma.get_estimate()),
        )
    }

    pub fn reset(&mut self) {
        self.fast_ewma = Ewma::new(Self::FAST_HALF_LIFE_SECS);
        self.slow_ewma = Ewma::new(Self::SLOW_HALF_LIFE_SECS);
        self.bytes_sampled = 0;
        self.low_latency_window.clear();
    }

    /// Gate for in-flight chunk samples in low-latency mode.
    ///
    /// A candidate strictly between 80% and 100% of the rolling mean is a
    /// regression that most likely hides a transient server-side stall,
    /// not a real bandwidth drop, and is dropped.
    fn should_consider_low_latency_sample(&mut self, bandwidth_bps: f64) -> bool {
        if let Some(mean) = self.low_latency_window_mean() {
            if bandwidth_bps > mean * 0.8 && bandwidth_bps <= mean {
                return false;
            }
        }
        self.low_latency_window.push(bandwidth_bps);
        if self.low_latency_window.len() > Self::LOW_LATENCY_WINDOW_LEN {
            self.low_latency_window.remove(0);
        }
        true
    }

    fn low_latency_window_mean(&self) -> Option<f64> {
        if self.low_latency_window.len() < Self::LOW_LATENCY_WINDOW_LEN {
            return None;
        }
        let sum: f64 = self.low_latency_window.iter().sum();
        Some(sum / self.low_latency_window.len() as f64)
    }
}
