//! Row-TTL filter appended after the merge transform when the merge must
//! drop expired rows.

use arrow_array::{BooleanArray, RecordBatch};
use arrow_schema::SchemaRef;

use super::column_index;
use crate::{block::Value, merge::error::MergeError, schema::RowTtl};

pub(crate) struct TtlFilterTransform {
    time_idx: usize,
    delta_seconds: i64,
    time_of_merge: i64,
}

impl TtlFilterTransform {
    pub(crate) fn new(
        header: &SchemaRef,
        ttl: &RowTtl,
        time_of_merge: i64,
    ) -> Result<Self, MergeError> {
        Ok(Self {
            time_idx: column_index(header, &ttl.time_column)?,
            delta_seconds: ttl.delta_seconds,
            time_of_merge,
        })
    }

    /// Drops expired rows; `None` when the whole block expired.
    pub(crate) fn filter(&mut self, block: &RecordBatch) -> Result<Option<RecordBatch>, MergeError> {
        let column = block.column(self.time_idx);
        let mut keep = Vec::with_capacity(block.num_rows());
        let mut kept = 0usize;
        for idx in 0..block.num_rows() {
            let alive = match Value::from_array(column.as_ref(), idx).as_i64() {
                Some(ts) => ts + self.delta_seconds > self.time_of_merge,
                None => true,
            };
            if alive {
                kept += 1;
            }
            keep.push(alive);
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
