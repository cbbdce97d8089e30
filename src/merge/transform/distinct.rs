//! Distinct filter appended after the merge transform when the task asked
//! for deduplication.
//!
//! The input is sorted, so the seen-set only has to span one equal-sort-key
//! run: it resets whenever the sort key advances.

use std::collections::HashSet;

use arrow_array::{BooleanArray, RecordBatch};
use arrow_schema::SchemaRef;

use super::column_index;
use crate::{
    block::{project, row_at, Value},
    merge::error::MergeError,
};

pub(crate) struct DistinctTransform {
    key_indices: Vec<usize>,
    dedup_indices: Vec<usize>,
    current_key: Option<Vec<Value>>,
    seen: HashSet<Vec<Value>>,
}

impl DistinctTransform {
    /// `dedup_columns` empty means all columns.
    pub(crate) fn new(
        header: &SchemaRef,
        sort_key: &[String],
        dedup_columns: &[String],
    ) -> Result<Self, MergeError> {
        let key_indices = sort_key
            .iter()
            .map(|name| column_index(header, name))
            .collect::<Result<Vec<_>, _>>()?;
        let dedup_indices = if dedup_columns.is_empty() {
            (0..header.fields().len()).collect()
        } else {
            dedup_columns
                .iter()
                .map(|name| column_index(header, name))
                .collect::<Result<Vec<_>, _>>()?
        };
        Ok(Self {
            key_indices,
            dedup_indices,
            current_key: None,
            seen: HashSet::new(),
        })
    }

    /// Drops rows equal on the dedup columns; `None` when the whole block
    /// deduplicated away.
    pub(crate) fn filter(&mut self, block: &RecordBatch) -> Result<Option<RecordBatch>, MergeError> {
        let mut keep = Vec::with_capacity(block.num_rows());
        let mut kept = 0usize;
        for idx in 0..block.num_rows() {
            let row = row_at(block, idx);
            let key = project(&row, &self.key_indices);
            if self.current_key.as_ref() != Some(&key) {
                self.current_key = Some(key);
                self.seen.clear();
            }
            let fresh = self.seen.insert(project(&row, &self.dedup_indices));
            if fresh {
                kept += 1;
            }
            keep.push(fresh);
        }
        if kept == block.num_rows() {
            return Ok(Some(block.clone()));
        }
        if kept == 0 {
            return Ok(None);
        }
        let mask: BooleanArray = keep.into_iter().map(Some).collect();
        Ok(Some(arrow_select::filter::filter_record_batch(block, &mask)?))
    }
}
