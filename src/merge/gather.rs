//! Column gatherer: rebuilds one non-key column of the merged part by
//! replaying the rows-sources stream against per-source column streams.

use std::collections::VecDeque;

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;

use crate::{
    block::{BlockBuilder, Value},
    merge::{error::MergeError, rows_source::RowsSourcesReader},
    part::SequentialPartReader,
};

struct ColumnCursor {
    reader: SequentialPartReader,
    values: VecDeque<Value>,
    exhausted: bool,
}

impl ColumnCursor {
    fn ensure(&mut self) -> Result<bool, MergeError> {
        while self.values.is_empty() && !self.exhausted {
            match self.reader.next_block()? {
                Some(block) => {
                    let column = block.column(0);
                    for idx in 0..column.len() {
                        self.values.push_back(Value::from_array(column.as_ref(), idx));
                    }
                }
                None => self.exhausted = true,
            }
        }
        Ok(!self.values.is_empty())
    }
}

/// Emits one value per non-skipped rows-sources record, taken from the
/// source the record names. Skipped records still consume their source's
/// next value.
pub(crate) struct ColumnGatherer {
    cursors: Vec<ColumnCursor>,
    builder: BlockBuilder,
    block_size: usize,
}

impl ColumnGatherer {
    pub(crate) fn new(
        header: SchemaRef,
        readers: Vec<SequentialPartReader>,
        block_size: usize,
    ) -> Result<Self, MergeError> {
        Ok(Self {
            cursors: readers
                .into_iter()
                .map(|reader| ColumnCursor {
                    reader,
                    values: VecDeque::new(),
                    exhausted: false,
                })
                .collect(),
            builder: BlockBuilder::new(header)?,
            block_size: block_size.max(1),
        })
    }

    pub(crate) fn next_block(
        &mut self,
        sources_stream: &mut RowsSourcesReader,
    ) -> Result<Option<RecordBatch>, MergeError> {
        while let Some(source) = sources_stream.next()? {
            let source_num = source.source_num();
            let cursors_len = self.cursors.len();
            let cursor = self.cursors.get_mut(source_num).ok_or_else(|| {
                MergeError::Logical(format!(
                    "rows-sources record names source {source_num} of {cursors_len}"
                ))
            })?;
            if !cursor.ensure()? {
                return Err(MergeError::Logical(format!(
                    "rows-sources stream overruns source {source_num} column stream"
                )));
            }
            let value = cursor.values.pop_front().expect("cursor ensured");
            if !source.skip_flag() {
                self.builder.push_row(std::slice::from_ref(&value))?;
            }
            if self.builder.len() >= self.block_size {
                return Ok(Some(self.builder.finish()?));
            }
        }
        if self.builder.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.builder.finish()?))
        }
    }
}
