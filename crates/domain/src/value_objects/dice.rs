//! Dice results reported by the game client
//!
//! The client rolls physical (simulated) dice and reports every face value in
//! the order they were read, together with the total it computed.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Ordered, non-empty sequence of individual die results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<i64>", into = "Vec<i64>")]
pub struct DiceResults(Vec<i64>);

impl DiceResults {
    /// # Errors
    ///
    /// Returns `DomainError::Validation` when no results are given.
    pub fn new(results: Vec<i64>) -> Result<Self, DomainError> {
        if results.is_empty() {
            return Err(DomainError::validation("Roll must contain at least one result"));
        }
        Ok(Self(results))
    }

    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false; kept for clippy's `len_without_is_empty`.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of the individual results, or `None` if it does not fit in an `i64`.
    ///
    /// The reported total is stored as sent; this is only used for diagnostics
    /// when the client's arithmetic disagrees with the faces.
    pub fn checked_sum(&self) -> Option<i64> {
        self.0
            .iter()
            .try_fold(0i64, |acc, value| acc.checked_add(*value))
    }
}

impl TryFrom<Vec<i64>> for DiceResults {
    type Error = DomainError;

    fn try_from(results: Vec<i64>) -> Result<Self, Self::Error> {
        Self::new(results)
    }
}

impl From<DiceResults> for Vec<i64> {
    fn from(results: DiceResults) -> Self {
        results.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_order() {
        let results = DiceResults::new(vec![4, 5, 3]).expect("valid");
        assert_eq!(results.as_slice(), &[4, 5, 3]);
        assert_eq!(results.checked_sum(), Some(12));
    }

    #[test]
    fn sum_of_extreme_faces_does_not_overflow() {
        let results = DiceResults::new(vec![i64::MAX, 1]).expect("valid");
        assert_eq!(results.checked_sum(), None);

        let results = DiceResults::new(vec![i64::MAX, 1, -2]).expect("valid");
        assert_eq!(results.checked_sum(), None);

        let results = DiceResults::new(vec![i64::MIN, i64::MAX]).expect("valid");
        assert_eq!(results.checked_sum(), Some(-1));
    }

    #[test]
    fn rejects_empty() {
        assert!(DiceResults::new(vec![]).is_err());
        assert!(serde_json::from_str::<DiceResults>("[]").is_err());
    }
}
