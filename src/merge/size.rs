//! Per-column byte totals across the merge inputs, used for byte-weighted
//! progress and the vertical algorithm's bookkeeping.

use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub(crate) struct ColumnSizeEstimator {
    map: HashMap<String, u64>,
    sum_total: u64,
    sum_index: u64,
}

impl ColumnSizeEstimator {
    pub(crate) fn new(
        map: HashMap<String, u64>,
        merging_columns: &[String],
        gathering_columns: &[String],
    ) -> Self {
        let mut sum_index = 0;
        let mut sum_ordinary = 0;
        for column in merging_columns {
            sum_index += map.get(column).copied().unwrap_or(0);
        }
        for column in gathering_columns {
            sum_ordinary += map.get(column).copied().unwrap_or(0);
        }
        Self {
            map,
            sum_total: (sum_index + sum_ordinary).max(1),
            sum_index,
        }
    }

    /// Fraction of the merge spent in the key phase.
    pub(crate) fn key_columns_weight(&self) -> f64 {
        self.sum_index as f64 / self.sum_total as f64
    }

    /// Fraction of the merge spent gathering `column`.
    pub(crate) fn column_weight(&self, column: &str) -> f64 {
        self.map.get(column).copied().unwrap_or(0) as f64 / self.sum_total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_sum_to_one() {
        let mut map = HashMap::new();
        map.insert("k".to_string(), 25u64);
        map.insert("a".to_string(), 50u64);
        map.insert("b".to_string(), 25u64);
        let estimator = ColumnSizeEstimator::new(
            map,
            &["k".to_string()],
            &["a".to_string(), "b".to_string()],
        );
        let total = estimator.key_columns_weight()
            + estimator.column_weight("a")
            + estimator.column_weight("b");
        assert!((total - 1.0).abs() < 1e-9);
        assert!((estimator.key_columns_weight() - 0.25).abs() < 1e-9);
    }
}
