//! Fixed-point score arithmetic shared by estimates and snapshots
//!
//! Scores are `f64` for ranking, but pool partitioning must be exact. A score
//! is converted once to integer units (`score * precision`, floored) and all
//! further math is done on `u128` with checked operations.

use crate::error::{Result, TallyError};

/// Convert a non-negative score to integer units
pub fn score_units(score: f64, precision: u64) -> u128 {
    if !score.is_finite() || score <= 0.0 {
        return 0;
    }
    (score * precision as f64).floor() as u128
}

/// `floor(units * pool / total)` without overflowing on large pools
pub fn pro_rata(units: u128, pool: u128, total: u128) -> Result<u128> {
    if total == 0 {
        return Err(TallyError::Validation("total score units are zero".into()));
    }
    if units > total {
        return Err(TallyError::Validation(
            "share units exceed total units".into(),
        ));
    }

    // units * pool = units * (q * total + r) = units * q * total + units * r
    let q = pool / total;
    let r = pool % total;
    let whole = units
        .checked_mul(q)
        .ok_or_else(|| TallyError::Validation("allocation overflow".into()))?;
    let frac = units
        .checked_mul(r)
        .ok_or_else(|| TallyError::Validation("allocation overflow".into()))?
        / total;
    whole
        .checked_add(frac)
        .ok_or_else(|| TallyError::Validation("allocation overflow".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_units() {
        assert_eq!(score_units(300.0, 1_000_000), 300_000_000);
        assert_eq!(score_units(0.0000015, 1_000_000), 1);
        assert_eq!(score_units(-4.0, 1_000_000), 0);
        assert_eq!(score_units(f64::NAN, 1_000_000), 0);
    }

    #[test]
    fn test_pro_rata_exact() {
        assert_eq!(pro_rata(300, 1_000_000, 1000).unwrap(), 300_000);
        assert_eq!(pro_rata(1, 10, 3).unwrap(), 3);
        assert_eq!(pro_rata(2, 10, 3).unwrap(), 6);
    }

    #[test]
    fn test_pro_rata_large_pool() {
        let pool = u128::MAX / 3;
        let total = 7_000_000u128;
        let share = pro_rata(total, pool, total).unwrap();
        assert_eq!(share, pool);
    }

    #[test]
    fn test_pro_rata_rejects_zero_total() {
        assert!(pro_rata(0, 100, 0).is_err());
    }
}
