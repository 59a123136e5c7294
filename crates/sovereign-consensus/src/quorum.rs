//! BFT quorum arithmetic
//!
//! With `n` voters the quorum is `floor(2n/3) + 1`. Any two quorums overlap in
//! `2q - n` voters, which exceeds the `f = floor((n - 1) / 3)` faulty voters
//! the protocol tolerates, so two conflicting proposals can never both commit.

use sovereign_core::SovereignError;

/// Votes required to commit among `n` voters
pub fn quorum_size(n: usize) -> usize {
    (2 * n) / 3 + 1
}

/// Largest number of Byzantine voters `n` voters tolerate
pub fn max_byzantine(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// Whether every pair of quorums shares at least one honest voter when up to
/// `f` voters are faulty
pub fn quorums_intersect(n: usize, f: usize) -> bool {
    let q = quorum_size(n);
    (2 * q).saturating_sub(n) > f
}

/// Honest voters must outnumber faulty ones: `n > 2f`
pub fn verify_byzantine_resilience(n: usize, f: usize) -> Result<(), SovereignError> {
    if n > 2 * f {
        Ok(())
    } else {
        Err(SovereignError::ResilienceViolation {
            total: n,
            faulty: f,
        })
    }
}

/// Robust selection needs more than `f + 2` contributions
pub fn verify_selection_bound(m: usize, f: usize) -> Result<(), SovereignError> {
    if m > f + 2 {
        Ok(())
    } else {
        Err(SovereignError::InsufficientContributions {
            required: f + 2,
            available: m,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_quorum_sizes() {
        assert_eq!(quorum_size(3), 3);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(10), 7);
        assert_eq!(quorum_size(21), 15);
        assert_eq!(quorum_size(100), 67);
        assert_eq!(quorum_size(200), 134);
    }

    #[test]
    fn test_max_byzantine() {
        assert_eq!(max_byzantine(0), 0);
        assert_eq!(max_byzantine(4), 1);
        assert_eq!(max_byzantine(21), 6);
        assert_eq!(max_byzantine(200), 66);
    }

    #[test]
    fn test_two_hundred_nodes() {
        let n = 200;
        let q = quorum_size(n);
        assert_eq!(q, 134);
        // Two quorums share 68 voters, more than the 66 tolerated faults
        assert_eq!(2 * q - n, 68);
        assert!(quorums_intersect(n, max_byzantine(n)));
        assert!(!quorums_intersect(n, 68));
    }

    #[test]
    fn test_byzantine_resilience() {
        assert!(verify_byzantine_resilience(200, 66).is_ok());
        assert!(verify_byzantine_resilience(200, 99).is_ok());
        assert_eq!(
            verify_byzantine_resilience(200, 111),
            Err(SovereignError::ResilienceViolation {
                total: 200,
                faulty: 111
            })
        );
        assert!(verify_byzantine_resilience(4, 2).is_err());
    }

    #[test]
    fn test_selection_bound() {
        assert!(verify_selection_bound(5, 2).is_ok());
        assert!(verify_selection_bound(4, 2).is_err());
    }

    proptest! {
        #[test]
        fn quorum_overlap_exceeds_tolerated_faults(n in 1usize..2000) {
            let f = max_byzantine(n);
            prop_assert!(quorums_intersect(n, f));
            prop_assert!(quorum_size(n) <= n);
            prop_assert!(3 * f < n);
        }
    }
}
