//! Fixed-capacity sample FIFO.

use std::collections::VecDeque;

use crate::WINDOW_SIZE;

/// A bounded FIFO of scalar samples.
///
/// Pushing beyond capacity evicts the oldest sample, so `len()` never
/// exceeds `capacity()`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SampleWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl Default for SampleWindow {
    fn default() -> Self {
        Self::new(WINDOW_SIZE)
    }
}

impl SampleWindow {
    /// Create an empty window holding at most `capacity` samples.
    ///
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Push a sample, evicting the oldest one when full.
    ///
    /// Returns the evicted sample, if any.
    pub fn push(&mut self, sample: f64) -> Option<f64> {
        let evicted = if self.samples.len() >= self.capacity {
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// True once the window holds `capacity` samples.
    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    /// Drop every sample.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Iterate samples oldest first.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }

    /// Arithmetic mean, or `None` when empty.
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Population standard deviation, or `None` when empty.
    pub fn std_dev(&self) -> Option<f64> {
        let mean = self.mean()?;
        let sq_sum: f64 = self.samples.iter().map(|v| (v - mean).powi(2)).sum();
        Some((sq_sum / self.samples.len() as f64).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn evicts_oldest_on_overflow() {
        let mut window = SampleWindow::new(3);
        assert_eq!(window.push(1.0), None);
        assert_eq!(window.push(2.0), None);
        assert_eq!(window.push(3.0), None);
        assert!(window.is_full());

        assert_eq!(window.push(4.0), Some(1.0));
        assert_eq!(window.iter().collect::<Vec<_>>(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn empty_window_has_no_statistics() {
        let window = SampleWindow::default();
        assert!(window.is_empty());
        assert_eq!(window.mean(), None);
        assert_eq!(window.std_dev(), None);
        assert_eq!(window.capacity(), WINDOW_SIZE);
    }

    #[test]
    fn population_std_dev() {
        let mut window = SampleWindow::new(8);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            window.push(v);
        }
        assert_eq!(window.mean(), Some(5.0));
        assert!((window.std_dev().unwrap() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn zero_capacity_is_bumped() {
        let mut window = SampleWindow::new(0);
        window.push(1.0);
        window.push(2.0);
        assert_eq!(window.len(), 1);
    }

    proptest! {
        #[test]
        fn never_exceeds_capacity(cap in 1usize..64, samples in prop::collection::vec(-10.0f64..10.0, 0..500)) {
            let mut window = SampleWindow::new(cap);
            for s in samples {
                window.push(s);
                prop_assert!(window.len() <= cap);
            }
        }
    }
}
