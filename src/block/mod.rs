//! Dynamic row/value model used by the merge transforms.
//!
//! Blocks cross the engine as arrow [`RecordBatch`]es; the sorted-merge
//! reducers work row-at-a-time through the [`Value`] cell enum and rebuild
//! output blocks with [`BlockBuilder`].

pub(crate) mod builder;
pub(crate) mod value;

use arrow_array::RecordBatch;

pub use builder::BlockBuilder;
pub use value::Value;

/// One materialized row of a block.
pub type Row = Vec<Value>;

/// Extracts row `idx` of `batch` as owned values.
pub fn row_at(batch: &RecordBatch, idx: usize) -> Row {
    batch
        .columns()
        .iter()
        .map(|col| Value::from_array(col.as_ref(), idx))
        .collect()
}

/// Lexicographic comparison of two rows restricted to `key_indices`.
pub fn compare_on(a: &[Value], b: &[Value], key_indices: &[usize]) -> std::cmp::Ordering {
    for &idx in key_indices {
        match a[idx].cmp(&b[idx]) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

/// Projects a row onto `key_indices`.
pub fn project(row: &[Value], key_indices: &[usize]) -> Vec<Value> {
    key_indices.iter().map(|&idx| row[idx].clone()).collect()
}
