//! Lifeline Coherence
//!
//! Derives a 0-100 stability score from the variability of recent motion
//! samples.
//!
//! # Window
//!
//! Samples are vector magnitudes `√(x² + y² + z²)` kept in a fixed-capacity
//! FIFO of [`WINDOW_SIZE`] entries. The oldest sample is evicted on overflow
//! and nothing outside the window is remembered.
//!
//! # Regimes
//!
//! Once the window is full the population standard deviation σ is mapped
//! onto three linear regimes:
//!
//! ```text
//! σ < 0.05          Frozen    score = σ × 400        (0-20)
//! 0.05 ≤ σ ≤ 0.5    Flow      score = 20 + 60·t      (20-80)
//! σ > 0.5           Chaotic   score = 100
//! ```
//!
//! While the window is still filling the score is the neutral
//! [`NEUTRAL_SCORE`].

mod estimator;
mod window;

pub use estimator::{CoherenceEstimator, Regime};
pub use window::SampleWindow;

/// Number of samples the window holds before scoring starts.
pub const WINDOW_SIZE: usize = 50;

/// Score reported while the window is not yet full.
pub const NEUTRAL_SCORE: f64 = 50.0;

/// Deviation below which the signal is considered frozen.
pub const FROZEN_BELOW: f64 = 0.05;

/// Deviation above which the signal is considered chaotic.
pub const CHAOTIC_ABOVE: f64 = 0.5;

/// Multiplier applied to σ in the frozen regime.
pub const FROZEN_GAIN: f64 = 400.0;

/// Lowest score of the flow regime.
pub const FLOW_FLOOR: f64 = 20.0;

/// Width of the flow regime in score points.
pub const FLOW_SPAN: f64 = 60.0;

/// Highest possible score.
pub const MAX_SCORE: f64 = 100.0;

const _: () = assert!(FLOW_FLOOR + FLOW_SPAN < MAX_SCORE);
