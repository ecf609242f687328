//! Splits a quantity into ledger-sized batches

use crate::error::EngineError;
use crate::models::mint::Batch;

/// Plan `ceil(total / cap)` batches of `cap` units, the last one taking the
/// remainder. Batch numbers are 1-based and contiguous.
pub fn plan_batches(total_quantity: i64, cap: usize) -> Result<Vec<Batch>, EngineError> {
    if total_quantity <= 0 {
        return Err(EngineError::InvalidQuantity(total_quantity));
    }
    if cap == 0 {
        return Err(EngineError::Config("batch size cap must be at least 1".to_string()));
    }

    let total = total_quantity as usize;
    let batches = (0..total)
        .step_by(cap)
        .enumerate()
        .map(|(i, offset)| Batch {
            batch_number: i + 1,
            offset,
            size: cap.min(total - offset),
        })
        .collect();

    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(batches: &[Batch]) -> Vec<usize> {
        batches.iter().map(|b| b.size).collect()
    }

    #[test]
    fn test_remainder_goes_to_last_batch() {
        let batches = plan_batches(23, 5).unwrap();
        assert_eq!(sizes(&batches), vec![5, 5, 5, 5, 3]);
        assert_eq!(batches[4].batch_number, 5);
        assert_eq!(batches[4].offset, 20);
    }

    #[test]
    fn test_exact_multiple_and_single() {
        assert_eq!(sizes(&plan_batches(10, 5).unwrap()), vec![5, 5]);
        assert_eq!(sizes(&plan_batches(1, 5).unwrap()), vec![1]);
    }

    #[test]
    fn test_batch_count_and_sum_hold_for_all_quantities() {
        for total in 1..=137i64 {
            let batches = plan_batches(total, 5).unwrap();
            assert_eq!(batches.len(), (total as usize).div_ceil(5));
            assert_eq!(batches.iter().map(|b| b.size).sum::<usize>(), total as usize);
            for (i, b) in batches.iter().enumerate() {
                assert_eq!(b.batch_number, i + 1);
                assert!(b.size <= 5);
            }
        }
    }

    #[test]
    fn test_rejects_non_positive_quantity() {
        assert!(matches!(plan_batches(0, 5), Err(EngineError::InvalidQuantity(0))));
        assert!(matches!(plan_batches(-3, 5), Err(EngineError::InvalidQuantity(-3))));
        assert!(matches!(plan_batches(3, 0), Err(EngineError::Config(_))));
    }
}
