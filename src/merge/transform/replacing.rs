//! Replacing merge: the row with the maximum version survives; ties go to
//! the later source. A deleted survivor is dropped entirely when clean-up is
//! on.

use super::{GroupRow, MergingAlgorithm};
use crate::{block::Row, merge::error::MergeError};

pub(crate) struct ReplacingAlgorithm {
    version_idx: Option<usize>,
    is_deleted_idx: Option<usize>,
    cleanup: bool,
}

impl ReplacingAlgorithm {
    pub(crate) fn new(
        version_idx: Option<usize>,
        is_deleted_idx: Option<usize>,
        cleanup: bool,
    ) -> Self {
        Self {
            version_idx,
            is_deleted_idx,
            cleanup,
        }
    }
}

impl MergingAlgorithm for ReplacingAlgorithm {
    fn merge_group(
        &mut self,
        rows: &[GroupRow],
        _out: &mut Vec<Row>,
    ) -> Result<Vec<bool>, MergeError> {
        let mut survivor = 0usize;
        if let Some(version_idx) = self.version_idx {
            let mut best = rows[0].row[version_idx].as_u64().unwrap_or(0);
            for (idx, group_row) in rows.iter().enumerate().skip(1) {
                let version = group_row.row[version_idx].as_u64().unwrap_or(0);
                // `>=` keeps the last row on version ties.
                if version >= best {
                    best = version;
                    survivor = idx;
                }
            }
        } else {
            survivor = rows.len() - 1;
        }

        let mut keep = vec![false; rows.len()];
        let survivor_deleted = self
            .is_deleted_idx
            .map(|idx| rows[survivor].row[idx].as_u64().unwrap_or(0) != 0)
            .unwrap_or(false);
        if !(survivor_deleted && self.cleanup) {
            keep[survivor] = true;
        }
        Ok(keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Value;

    fn group(versions: &[u64]) -> Vec<GroupRow> {
        versions
            .iter()
            .enumerate()
            .map(|(idx, version)| GroupRow {
                source: idx,
                row: vec![Value::Int64(1), Value::UInt64(*version)],
            })
            .collect()
    }

    #[test]
    fn max_version_wins_and_ties_go_last() {
        let mut algorithm = ReplacingAlgorithm::new(Some(1), None, false);
        let keep = algorithm
            .merge_group(&group(&[3, 7, 7]), &mut Vec::new())
            .unwrap();
        assert_eq!(keep, vec![false, false, true]);
    }

    #[test]
    fn without_version_the_last_row_wins() {
        let mut algorithm = ReplacingAlgorithm::new(None, None, false);
        let keep = algorithm
            .merge_group(&group(&[0, 0]), &mut Vec::new())
            .unwrap();
        assert_eq!(keep, vec![false, true]);
    }

    #[test]
    fn cleanup_drops_deleted_survivor() {
        let rows = vec![
            GroupRow {
                source: 0,
                row: vec![Value::Int64(1), Value::UInt64(5), Value::UInt8(0)],
            },
            GroupRow {
                source: 1,
                row: vec![Value::Int64(1), Value::UInt64(7), Value::UInt8(1)],
            },
        ];
        let mut with_cleanup = ReplacingAlgorithm::new(Some(1), Some(2), true);
        assert_eq!(
            with_cleanup.merge_group(&rows, &mut Vec::new()).unwrap(),
            vec![false, false]
        );
        let mut without_cleanup = ReplacingAlgorithm::new(Some(1), Some(2), false);
        assert_eq!(
            without_cleanup.merge_group(&rows, &mut Vec::new()).unwrap(),
            vec![false, true]
        );
    }
}
