//! Axis-aligned query bounds in original coordinate space.

use crate::errors::{IndexError, IndexResult};

/// An axis-aligned bounding box with one `(min, max)` pair per dimension.
///
/// A query's bounds must have the same number of dimensions as the index it
/// is run against; that is checked once when the search starts, after which
/// [`Bounds::contains`] performs the exact per-record membership test.
#[derive(Debug, Clone, PartialEq)]
pub struct Bounds {
    mins: Vec<f64>,
    maxes: Vec<f64>,
}

impl Bounds {
    /// Creates bounds from per-dimension minimums and maximums.
    ///
    /// Fails if the arrays differ in length or are empty.
    pub fn new(mins: Vec<f64>, maxes: Vec<f64>) -> IndexResult<Self> {
        if mins.len() != maxes.len() {
            return Err(IndexError::Config(format!(
                "bounds arrays must have equal length, got {} and {}",
                mins.len(),
                maxes.len()
            )));
        }
        if mins.is_empty() {
            return Err(IndexError::Config(
                "bounds must have at least one dimension".to_string(),
            ));
        }
        Ok(Bounds { mins, maxes })
    }

    pub fn dimensions(&self) -> usize {
        self.mins.len()
    }

    pub fn mins(&self) -> &[f64] {
        &self.mins
    }

    pub fn maxes(&self) -> &[f64] {
        &self.maxes
    }

    /// Exact membership test: every coordinate within `[min, max]` inclusive.
    ///
    /// The point must have the same dimension count as the bounds.
    pub fn contains(&self, point: &[f64]) -> bool {
        debug_assert_eq!(point.len(), self.mins.len());
        point
            .iter()
            .zip(self.mins.iter().zip(self.maxes.iter()))
            .all(|(&x, (&min, &max))| x >= min && x <= max)
    }

    /// True if this box intersects the box `[mins, maxes]`.
    pub(crate) fn intersects(&self, mins: &[f64], maxes: &[f64]) -> bool {
        self.mins
            .iter()
            .zip(self.maxes.iter())
            .zip(mins.iter().zip(maxes.iter()))
            .all(|((&qmin, &qmax), (&min, &max))| qmax >= min && qmin <= max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_length_rejected() {
        assert!(matches!(
            Bounds::new(vec![], vec![]),
            Err(IndexError::Config(_))
        ));
    }

    #[test]
    fn test_different_lengths_rejected() {
        assert!(matches!(
            Bounds::new(vec![0.0], vec![0.0, 1.0]),
            Err(IndexError::Config(_))
        ));
    }

    #[test]
    fn test_contains() {
        let b = Bounds::new(vec![0.0, -1.0], vec![10.0, 1.0]).unwrap();
        assert!(b.contains(&[0.0, -1.0]));
        assert!(b.contains(&[10.0, 1.0]));
        assert!(b.contains(&[5.0, 0.0]));
        assert!(!b.contains(&[10.1, 0.0]));
        assert!(!b.contains(&[5.0, -1.5]));
    }

    #[test]
    fn test_intersects() {
        let b = Bounds::new(vec![0.0, 0.0], vec![10.0, 10.0]).unwrap();
        assert!(b.intersects(&[5.0, 5.0], &[15.0, 15.0]));
        assert!(b.intersects(&[10.0, 10.0], &[20.0, 20.0]));
        assert!(!b.intersects(&[10.5, 0.0], &[20.0, 10.0]));
        assert!(!b.intersects(&[0.0, -5.0], &[10.0, -0.5]));
    }
}
