//! Coherence score over the sample window.

use crate::{
    SampleWindow, CHAOTIC_ABOVE, FLOW_FLOOR, FLOW_SPAN, FROZEN_BELOW, FROZEN_GAIN, MAX_SCORE,
    NEUTRAL_SCORE, WINDOW_SIZE,
};

/// Which linear regime the current window falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Regime {
    /// Window not yet full.
    Calibrating,
    /// Almost no variation.
    Frozen,
    /// Moderate variation.
    Flow,
    /// Variation beyond the flow band.
    Chaotic,
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Calibrating => write!(f, "Calibrating"),
            Self::Frozen => write!(f, "Frozen"),
            Self::Flow => write!(f, "Flow"),
            Self::Chaotic => write!(f, "Chaotic"),
        }
    }
}

/// Scores the variability of recent motion magnitudes.
///
/// The score is a pure function of the current window. There is no state
/// beyond the samples themselves.
#[derive(Debug, Clone, Default)]
pub struct CoherenceEstimator {
    window: SampleWindow,
}

impl CoherenceEstimator {
    /// Create an estimator with the standard [`WINDOW_SIZE`].
    pub fn new() -> Self {
        Self::with_capacity(WINDOW_SIZE)
    }

    /// Create an estimator with a custom window size.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            window: SampleWindow::new(capacity),
        }
    }

    /// Push the magnitude of `(x, y, z)` into the window.
    pub fn add_sample(&mut self, x: f64, y: f64, z: f64) {
        let magnitude = (x * x + y * y + z * z).sqrt();
        self.window.push(magnitude);
    }

    /// Current 0-100 score.
    ///
    /// Returns [`NEUTRAL_SCORE`] until the window is full.
    pub fn score(&self) -> f64 {
        match self.deviation() {
            Some(sigma) => score_for_deviation(sigma),
            None => NEUTRAL_SCORE,
        }
    }

    /// Regime of the current window.
    pub fn regime(&self) -> Regime {
        match self.deviation() {
            None => Regime::Calibrating,
            Some(sigma) if sigma < FROZEN_BELOW => Regime::Frozen,
            Some(sigma) if sigma > CHAOTIC_ABOVE => Regime::Chaotic,
            Some(_) => Regime::Flow,
        }
    }

    /// Population standard deviation once the window is full.
    pub fn deviation(&self) -> Option<f64> {
        if self.window.is_full() {
            self.window.std_dev()
        } else {
            None
        }
    }

    pub fn window(&self) -> &SampleWindow {
        &self.window
    }

    /// Forget every sample and return to calibration.
    pub fn reset(&mut self) {
        self.window.clear();
    }
}

/// Map a standard deviation onto the 0-100 score.
pub fn score_for_deviation(sigma: f64) -> f64 {
    if !sigma.is_finite() {
        return MAX_SCORE;
    }
    if sigma < FROZEN_BELOW {
        return (sigma * FROZEN_GAIN).clamp(0.0, FLOW_FLOOR);
    }
    if sigma > CHAOTIC_ABOVE {
        return MAX_SCORE;
    }
    let t = (sigma - FROZEN_BELOW) / (CHAOTIC_ABOVE - FROZEN_BELOW);
    FLOW_FLOOR + t * FLOW_SPAN
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fill_alternating(estimator: &mut CoherenceEstimator, center: f64, offset: f64) {
        for i in 0..WINDOW_SIZE {
            let v = if i % 2 == 0 { center + offset } else { center - offset };
            estimator.add_sample(v, 0.0, 0.0);
        }
    }

    #[test]
    fn neutral_until_full() {
        let mut estimator = CoherenceEstimator::new();
        for i in 0..WINDOW_SIZE - 1 {
            estimator.add_sample(i as f64, 0.0, 0.0);
            assert_eq!(estimator.score(), NEUTRAL_SCORE);
            assert_eq!(estimator.regime(), Regime::Calibrating);
        }
    }

    #[test]
    fn small_deviation_scores_frozen() {
        let mut estimator = CoherenceEstimator::new();
        fill_alternating(&mut estimator, 1.0, 0.02);

        assert!((estimator.deviation().unwrap() - 0.02).abs() < 1e-9);
        assert!((estimator.score() - 8.0).abs() < 1e-6);
        assert_eq!(estimator.regime(), Regime::Frozen);
    }

    #[test]
    fn large_deviation_scores_chaotic() {
        let mut estimator = CoherenceEstimator::new();
        fill_alternating(&mut estimator, 5.0, 2.0);

        assert_eq!(estimator.score(), MAX_SCORE);
        assert_eq!(estimator.regime(), Regime::Chaotic);
    }

    #[test]
    fn flow_band_interpolates() {
        assert!((score_for_deviation(FROZEN_BELOW) - FLOW_FLOOR).abs() < 1e-9);
        assert!((score_for_deviation(CHAOTIC_ABOVE) - (FLOW_FLOOR + FLOW_SPAN)).abs() < 1e-9);
        assert!((score_for_deviation(0.275) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn magnitude_uses_all_axes() {
        let mut estimator = CoherenceEstimator::with_capacity(1);
        estimator.add_sample(3.0, 4.0, 12.0);
        assert_eq!(estimator.window().iter().next(), Some(13.0));
    }

    #[test]
    fn reset_returns_to_calibration() {
        let mut estimator = CoherenceEstimator::new();
        fill_alternating(&mut estimator, 1.0, 0.3);
        assert_eq!(estimator.regime(), Regime::Flow);

        estimator.reset();
        assert_eq!(estimator.score(), NEUTRAL_SCORE);
    }

    proptest! {
        #[test]
        fn full_window_score_is_bounded(samples in prop::collection::vec((-20.0f64..20.0, -20.0f64..20.0, -20.0f64..20.0), WINDOW_SIZE..200)) {
            let mut estimator = CoherenceEstimator::new();
            for (x, y, z) in samples {
                estimator.add_sample(x, y, z);
            }
            let score = estimator.score();
            prop_assert!((0.0..=MAX_SCORE).contains(&score));
        }
    }
}
