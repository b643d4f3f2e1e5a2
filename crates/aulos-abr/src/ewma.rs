/// Exponentially weighted moving average with a configurable half-life.
///
/// The startup correction divides out the weight the zero initial
/// estimate still carries, so early samples are not dragged down.
#[derive(Clone, Debug)]
pub(crate) struct Ewma {
    alpha: f64,
    last_estimate: f64,
    total_weight: f64,
}

impl Ewma {
    pub(crate) fn new(half_life_secs: f64) -> Self {
        Self {
            alpha: f64::exp(0.5_f64.ln() / half_life_secs.max(0.001)),
            last_estimate: 0.0,
            total_weight: 0.0,
        }
    }

    pub(crate) fn add_sample(&mut self, weight: f64, value: f64) {
        let adj_alpha = self.alpha.powf(weight.max(0.0));
        self.last_estimate = value * (1.0 - adj_alpha) + adj_alpha * self.last_estimate;
        self.total_weight += weight.max(0.0);
    }

    pub(crate) fn get_estimate(&self) -> f64 {
        if self.total_weight <= 0.0 {
            0.0
        } else {
            let zero_factor = 1.0 - self.alpha.powf(self.total_weight);
            self.last_estimate / zero_factor.max(1e-6)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_samples_means_zero() {
        assert_eq!(Ewma::new(2.0).get_estimate(), 0.0);
    }

    #[test]
    fn constant_input_converges_to_input() {
        let mut ewma = Ewma::new(2.0);
        for _ in 0..50 {
            ewma.add_sample(1.0, 1_000_000.0);
        }
        assert!((ewma.get_estimate() - 1_000_000.0).abs() < 1.0);
    }

    #[test]
    fn startup_correction_avoids_zero_bias() {
        let mut ewma = Ewma::new(10.0);
        ewma.add_sample(1.0, 8_000_000.0);
        // A single sample should already estimate close to itself, not be
        // dragged toward the zero initial state.
        assert!(ewma.get_estimate() > 7_000_000.0);
    }

    #[test]
    fn fast_half_life_reacts_quicker_than_slow() {
        let mut fast = Ewma::new(2.0);
        let mut slow = Ewma::new(10.0);
        for _ in 0..20 {
            fast.add_sample(1.0, 4_000_000.0);
            slow.add_sample(1.0, 4_000_000.0);
        }
        for _ in 0..2 {
            fast.add_sample(1.0, 500_000.0);
            slow.add_sample(1.0, 500_000.0);
        }
        assert!(fast.get_estimate() < slow.get_estimate());
    }
}
