//! Aggregating merge: one row per equal-key group with aggregate state
//! columns combined by their registered function.

use arrow_schema::SchemaRef;

use super::{column_index, GroupRow, MergingAlgorithm};
use crate::{
    block::{Row, Value},
    merge::{error::MergeError, AggregateFunction, MergingParams},
};

struct AggregateSlot {
    idx: usize,
    function: AggregateFunction,
}

pub(crate) struct AggregatingAlgorithm {
    aggregates: Vec<AggregateSlot>,
}

impl AggregatingAlgorithm {
    pub(crate) fn new(schema: &SchemaRef, params: &MergingParams) -> Result<Self, MergeError> {
        let aggregates = params
            .aggregates
            .iter()
            .map(|description| {
                Ok(AggregateSlot {
                    idx: column_index(schema, &description.column)?,
                    function: description.function,
                })
            })
            .collect::<Result<Vec<_>, MergeError>>()?;
        Ok(Self { aggregates })
    }
}

fn combine(function: AggregateFunction, state: &Value, incoming: &Value) -> Result<Value, MergeError> {
    Ok(match function {
        AggregateFunction::Sum | AggregateFunction::Count => {
            state.checked_add(incoming).ok_or_else(|| {
                MergeError::Logical(format!("cannot combine aggregate state {incoming:?}"))
            })?
        }
        AggregateFunction::Min => {
            if matches!(state, Value::Null) || (!matches!(incoming, Value::Null) && incoming < state)
            {
                incoming.clone()
            } else {
                state.clone()
            }
        }
        AggregateFunction::Max => {
            if matches!(state, Value::Null) || incoming > state {
                incoming.clone()
            } else {
                state.clone()
            }
        }
        AggregateFunction::Last => {
            if matches!(incoming, Value::Null) {
                state.clone()
            } else {
                incoming.clone()
            }
        }
    })
}

impl MergingAlgorithm for AggregatingAlgorithm {
    fn merge_group(
        &mut self,
        rows: &[GroupRow],
        out: &mut Vec<Row>,
    ) -> Result<Vec<bool>, MergeError> {
        let mut result = rows[0].row.clone();
        for slot in &self.aggregates {
            let mut state = result[slot.idx].clone();
            for group_row in rows.iter().skip(1) {
                state = combine(slot.function, &state, &group_row.row[slot.idx])?;
            }
            result[slot.idx] = state;
        }
        out.push(result);
        Ok(vec![false; rows.len()])
    }
}
