use std::time::Duration;

use crate::constants::{DEFAULT_RTT_ALPHA, RTT_DEFAULT_SD, RTT_TRACING_LOG_LEVEL};

/// Online mean and sample standard deviation (Welford).
#[derive(Debug, Clone, Copy, Default)]
struct SdTracker {
    n: u64,
    mean: f64,
    m2: f64,
}

impl SdTracker {
    fn add(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn sd(&self) -> f64 {
        if self.n < 2 {
            return 0.;
        }
        (self.m2 / (self.n - 1) as f64).sqrt()
    }
}

/// Round-trip time estimator: an EWMA of the samples plus their standard deviation.
///
/// All values are kept as f64 nanoseconds.
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    est: f64,
    alpha: f64,
    n: u64,
    sd: SdTracker,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_RTT_ALPHA)
    }
}

impl RttEstimator {
    pub fn new(alpha: f64) -> Self {
        Self {
            est: 0.,
            alpha,
            n: 0,
            sd: Default::default(),
        }
    }

    pub fn samples(&self) -> u64 {
        self.n
    }

    pub fn add_sample(&mut self, sample: Duration) {
        let cur = sample.as_nanos() as f64;
        self.n += 1;
        self.sd.add(cur);
        if self.n == 1 {
            // Don't drag the estimate towards an arbitrary seed.
            self.est = cur;
        } else {
            self.est = self.alpha * cur + (1. - self.alpha) * self.est;
        }
        tracing::event!(
            RTT_TRACING_LOG_LEVEL,
            ?sample,
            estimate = ?self.estimate(),
            sd = ?self.sd(),
            n = self.n,
            "rtt: sample"
        );
    }

    /// Zero until the first sample.
    pub fn estimate(&self) -> Duration {
        Duration::from_nanos(self.est.round() as u64)
    }

    /// The spread of the samples, with fallbacks while there are too few of them
    /// to compute one.
    pub fn sd(&self) -> Duration {
        match self.n {
            0 => RTT_DEFAULT_SD,
            1 => Duration::from_nanos((self.est / 2.).round() as u64),
            _ => Duration::from_nanos(self.sd.sd().round() as u64),
        }
    }

    /// `estimate + k * sd`, clamped to `[min_rto, max_rto]`.
    pub fn retransmission_timeout(&self, k: f64, min_rto: Duration, max_rto: Duration) -> Duration {
        let nanos = self.est + k * self.sd().as_nanos() as f64;
        let rto = if nanos.is_finite() && nanos < u64::MAX as f64 {
            Duration::from_nanos(nanos.max(0.).round() as u64)
        } else {
            max_rto
        };
        rto.clamp(min_rto, max_rto)
    }
}
