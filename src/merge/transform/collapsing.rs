//! Collapsing merge: a `+1` row cancels against a later `-1` row of the same
//! key. Malformed groups (surplus signs) are emitted as-is.

use std::collections::VecDeque;

use super::{GroupRow, MergingAlgorithm};
use crate::{block::Row, merge::error::MergeError};

pub(crate) struct CollapsingAlgorithm {
    sign_idx: usize,
}

impl CollapsingAlgorithm {
    pub(crate) fn new(sign_idx: usize) -> Self {
        Self { sign_idx }
    }
}

impl MergingAlgorithm for CollapsingAlgorithm {
    fn merge_group(
        &mut self,
        rows: &[GroupRow],
        _out: &mut Vec<Row>,
    ) -> Result<Vec<bool>, MergeError> {
        let mut keep = vec![true; rows.len()];
        let mut unmatched_positive: VecDeque<usize> = VecDeque::new();
        for (idx, group_row) in rows.iter().enumerate() {
            match group_row.row[self.sign_idx].as_i64() {
                Some(1) => unmatched_positive.push_back(idx),
                Some(-1) => {
                    if let Some(positive) = unmatched_positive.pop_front() {
                        keep[positive] = false;
                        keep[idx] = false;
                    }
                }
                _ => {
                    return Err(MergeError::Logical(format!(
                        "sign column value {:?} is neither 1 nor -1",
                        group_row.row[self.sign_idx]
                    )))
                }
            }
        }
        Ok(keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Value;

    fn group(signs: &[i8]) -> Vec<GroupRow> {
        signs
            .iter()
            .enumerate()
            .map(|(idx, sign)| GroupRow {
                source: idx,
                row: vec![Value::Int64(1), Value::Int8(*sign)],
            })
            .collect()
    }

    #[test]
    fn balanced_group_cancels_fully() {
        let mut algorithm = CollapsingAlgorithm::new(1);
        let keep = algorithm.merge_group(&group(&[1, -1]), &mut Vec::new()).unwrap();
        assert_eq!(keep, vec![false, false]);
    }

    #[test]
    fn surplus_positive_survives() {
        let mut algorithm = CollapsingAlgorithm::new(1);
        let keep = algorithm
            .merge_group(&group(&[1, 1, -1]), &mut Vec::new())
            .unwrap();
        // The earliest +1 pairs with the -1; the last positive stays.
        assert_eq!(keep, vec![false, true, false]);
    }

    #[test]
    fn malformed_group_is_emitted_as_is() {
        let mut algorithm = CollapsingAlgorithm::new(1);
        let keep = algorithm
            .merge_group(&group(&[-1, -1]), &mut Vec::new())
            .unwrap();
        assert_eq!(keep, vec![true, true]);
    }
}
