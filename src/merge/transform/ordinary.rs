//! Ordinary merge: equal-key groups pass through unchanged.

use super::{GroupRow, MergingAlgorithm};
use crate::{block::Row, merge::error::MergeError};

pub(crate) struct OrdinaryAlgorithm;

impl MergingAlgorithm for OrdinaryAlgorithm {
    fn merge_group(
        &mut self,
        rows: &[GroupRow],
        _out: &mut Vec<Row>,
    ) -> Result<Vec<bool>, MergeError> {
        Ok(vec![true; rows.len()])
    }
}
