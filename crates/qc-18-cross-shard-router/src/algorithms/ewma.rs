//! EWMA smoothing and the adaptive batch-size controller.

/// Exponentially weighted moving average.
#[derive(Debug, Clone)]
pub struct Ewma {
    alpha: f64,
    value: Option<f64>,
}

impl Ewma {
    /// New average with smoothing factor `alpha` in (0, 1].
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::MIN_POSITIVE, 1.0),
            value: None,
        }
    }

    /// Fold in a sample; the first sample seeds the average.
    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(v) => self.alpha * sample + (1.0 - self.alpha) * v,
            None => sample,
        };
        self.value = Some(next);
        next
    }

    /// Current average (0 before any sample).
    pub fn value(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

/// Grows the batch target under sustained load and shrinks it when queues
/// run shallow.
///
/// Each adaptation doubles or halves the target, so it reaches either bound
/// within `log2(max / min)` cycles of a steady condition.
#[derive(Debug, Clone)]
pub struct AdaptiveBatchSizer {
    min: usize,
    max: usize,
    target: usize,
    throughput: Ewma,
    threshold: f64,
}

impl AdaptiveBatchSizer {
    /// Start at `min` with the given smoothing and growth threshold (msg/s).
    pub fn new(min: usize, max: usize, alpha: f64, threshold: f64) -> Self {
        let min = min.max(1);
        Self {
            min,
            max: max.max(min),
            target: min,
            throughput: Ewma::new(alpha),
            threshold,
        }
    }

    /// Feed one observation and return the new target.
    ///
    /// `throughput` is messages per second admitted since the last call,
    /// `queue_depth` the messages currently waiting.
    pub fn adapt(&mut self, throughput: f64, queue_depth: usize) -> usize {
        let smoothed = self.throughput.update(throughput);
        if smoothed >= self.threshold || queue_depth >= self.target.saturating_mul(2) {
            self.target = (self.target.saturating_mul(2)).min(self.max);
        } else if queue_depth < self.target {
            self.target = (self.target / 2).max(self.min);
        }
        self.target
    }

    /// Current batch target.
    pub fn target(&self) -> usize {
        self.target
    }

    /// Smoothed throughput.
    pub fn throughput(&self) -> f64 {
        self.throughput.value()
    }
}
