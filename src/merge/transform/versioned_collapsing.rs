//! Versioned-collapsing merge: `+1`/`-1` rows cancel only when their
//! versions match.

use std::collections::{HashMap, VecDeque};

use super::{GroupRow, MergingAlgorithm};
use crate::{block::Row, merge::error::MergeError};

pub(crate) struct VersionedCollapsingAlgorithm {
    sign_idx: usize,
    version_idx: usize,
}

impl VersionedCollapsingAlgorithm {
    pub(crate) fn new(sign_idx: usize, version_idx: usize) -> Self {
        Self {
            sign_idx,
            version_idx,
        }
    }
}

impl MergingAlgorithm for VersionedCollapsingAlgorithm {
    fn merge_group(
        &mut self,
        rows: &[GroupRow],
        _out: &mut Vec<Row>,
    ) -> Result<Vec<bool>, MergeError> {
        let mut keep = vec![true; rows.len()];
        let mut unmatched_by_version: HashMap<u64, VecDeque<usize>> = HashMap::new();
        for (idx, group_row) in rows.iter().enumerate() {
            let version = group_row.row[self.version_idx].as_u64().unwrap_or(0);
            match group_row.row[self.sign_idx].as_i64() {
                Some(1) => unmatched_by_version.entry(version).or_default().push_back(idx),
                Some(-1) => {
                    if let Some(positive) = unmatched_by_version
                        .get_mut(&version)
                        .and_then(|queue| queue.pop_front())
                    {
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
