//! Summing merge: one row per equal-key group with numeric columns summed
//! and nested-table columns merged by their own key. All-zero results are
//! elided.

use std::collections::BTreeMap;

use arrow_schema::{DataType, SchemaRef};

use super::{column_index, GroupRow, MergingAlgorithm};
use crate::{
    block::{Row, Value},
    merge::{error::MergeError, MergingParams},
};

/// Dotted-name nested table: the first list column is the nested key, the
/// rest are value columns merged element-wise by that key.
struct NestedGroup {
    key_idx: usize,
    value_indices: Vec<usize>,
}

pub(crate) struct SummingAlgorithm {
    sum_indices: Vec<usize>,
    nested: Vec<NestedGroup>,
}

impl SummingAlgorithm {
    pub(crate) fn new(
        schema: &SchemaRef,
        params: &MergingParams,
        partition_key: &[String],
        sort_key: &[String],
    ) -> Result<Self, MergeError> {
        let is_key = |name: &str| {
            sort_key.iter().any(|key| key == name) || partition_key.iter().any(|key| key == name)
        };

        // Nested tables first: list columns sharing a dotted prefix.
        let mut by_prefix: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (idx, field) in schema.fields().iter().enumerate() {
            if let (Some((prefix, _)), DataType::List(_)) =
                (field.name().split_once('.'), field.data_type())
            {
                by_prefix.entry(prefix.to_string()).or_default().push(idx);
            }
        }
        let mut nested = Vec::new();
        let mut nested_indices = Vec::new();
        for (_, indices) in by_prefix {
            if indices.len() < 2 {
                continue;
            }
            nested_indices.extend(indices.iter().copied());
            nested.push(NestedGroup {
                key_idx: indices[0],
                value_indices: indices[1..].to_vec(),
            });
        }

        let mut sum_indices = Vec::new();
        if params.columns_to_sum.is_empty() {
            for (idx, field) in schema.fields().iter().enumerate() {
                let numeric = matches!(
                    field.data_type(),
                    DataType::Int8
                        | DataType::Int16
                        | DataType::Int32
                        | DataType::Int64
                        | DataType::UInt8
                        | DataType::UInt16
                        | DataType::UInt32
                        | DataType::UInt64
                        | DataType::Float32
                        | DataType::Float64
                );
                if numeric && !is_key(field.name()) && !nested_indices.contains(&idx) {
                    sum_indices.push(idx);
                }
            }
        } else {
            for name in &params.columns_to_sum {
                sum_indices.push(column_index(schema, name)?);
            }
        }

        Ok(Self {
            sum_indices,
            nested,
        })
    }
}

fn merge_nested(rows: &[GroupRow], group: &NestedGroup) -> Result<Vec<Vec<Value>>, MergeError> {
    // Nested key -> summed value per value column, ordered by key.
    let mut merged: BTreeMap<Value, Vec<Value>> = BTreeMap::new();
    for group_row in rows {
        let keys = match &group_row.row[group.key_idx] {
            Value::List(keys) => keys,
            Value::Null => continue,
            other => {
                return Err(MergeError::Logical(format!(
                    "nested key column holds non-list cell {other:?}"
                )))
            }
        };
        for (pos, key) in keys.iter().enumerate() {
            let entry = merged
                .entry(key.clone())
                .or_insert_with(|| vec![Value::Null; group.value_indices.len()]);
            for (slot, &value_idx) in group.value_indices.iter().enumerate() {
                let incoming = match &group_row.row[value_idx] {
                    Value::List(values) => values.get(pos).cloned().unwrap_or(Value::Null),
                    _ => Value::Null,
                };
                entry[slot] = entry[slot].checked_add(&incoming).unwrap_or(incoming);
            }
        }
    }
    // Drop nested entries whose every value summed to the default.
    merged.retain(|_, values| values.iter().any(|value| !value.is_default()));

    let mut columns = vec![Vec::with_capacity(merged.len()); group.value_indices.len() + 1];
    for (key, values) in merged {
        columns[0].push(key);
        for (slot, value) in values.into_iter().enumerate() {
            columns[slot + 1].push(value);
        }
    }
    Ok(columns)
}

impl MergingAlgorithm for SummingAlgorithm {
    fn merge_group(
        &mut self,
        rows: &[GroupRow],
        out: &mut Vec<Row>,
    ) -> Result<Vec<bool>, MergeError> {
        let mut result = rows[0].row.clone();

        for &idx in &self.sum_indices {
            let mut sum = Value::Null;
            for group_row in rows {
                let cell = &group_row.row[idx];
                sum = sum.checked_add(cell).ok_or_else(|| {
                    MergeError::Logical(format!("cannot sum cell {cell:?} of summed column"))
                })?;
            }
            result[idx] = sum;
        }

        let mut nested_all_empty = true;
        for group in &self.nested {
            let columns = merge_nested(rows, group)?;
            if !columns[0].is_empty() {
                nested_all_empty = false;
            }
            result[group.key_idx] = Value::List(columns[0].clone());
            for (slot, &value_idx) in group.value_indices.iter().enumerate() {
                result[value_idx] = Value::List(columns[slot + 1].clone());
            }
        }

        let all_sums_default = self
            .sum_indices
            .iter()
            .all(|&idx| result[idx].is_default());
        let elide = (!self.sum_indices.is_empty() || !self.nested.is_empty())
            && all_sums_default
            && nested_all_empty;
        if !elide {
            out.push(result);
        }
        Ok(vec![false; rows.len()])
    }
}
