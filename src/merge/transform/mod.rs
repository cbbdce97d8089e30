//! Sorted-merge transforms: the N-way key merge and its per-mode reducers.
//!
//! All modes consume N sorted part readers with identical schemas and emit
//! one sorted block stream. Ties on the sort key break by ascending source
//! number, so rows with equal keys keep insertion order. The four
//! rows-sources-capable modes additionally record one [`RowSource`] per
//! consumed input row.

pub(crate) mod aggregating;
pub(crate) mod collapsing;
pub(crate) mod distinct;
pub(crate) mod graphite;
pub(crate) mod ordinary;
pub(crate) mod replacing;
pub(crate) mod summing;
pub(crate) mod ttl;
pub(crate) mod versioned_collapsing;

use std::{cmp::Ordering, collections::BinaryHeap, collections::VecDeque};

use arrow_array::RecordBatch;
use arrow_schema::SchemaRef;

use crate::{
    block::{project, row_at, BlockBuilder, Row, Value},
    merge::{
        error::MergeError,
        rows_source::{RowSource, RowsSourcesWriter},
        MergeMode, MergingParams,
    },
    option::CleanDeletedRows,
    part::SequentialPartReader,
};

pub(crate) use distinct::DistinctTransform;
pub(crate) use ttl::TtlFilterTransform;

/// One input row of an equal-key group, tagged with its source part number.
pub(crate) struct GroupRow {
    pub source: usize,
    pub row: Row,
}

/// Reduces one equal-key group to output rows.
///
/// `merge_group` returns per-input-row keep flags; kept rows are emitted by
/// the driver in input order. Modes that synthesize rows (Summing,
/// Aggregating, Graphite) mark every input row skipped and push their output
/// through `out`.
pub(crate) trait MergingAlgorithm: Send {
    fn merge_group(
        &mut self,
        rows: &[GroupRow],
        out: &mut Vec<Row>,
    ) -> Result<Vec<bool>, MergeError>;

    fn finish(&mut self, _out: &mut Vec<Row>) -> Result<(), MergeError> {
        Ok(())
    }
}

/// Resolves a column name to its position in the merge header.
pub(crate) fn column_index(schema: &SchemaRef, name: &str) -> Result<usize, MergeError> {
    schema
        .index_of(name)
        .map_err(|_| MergeError::Logical(format!("column {name} is missing from merge header")))
}

/// Builds the reducer for the configured merge mode.
pub(crate) fn build_merging_algorithm(
    schema: &SchemaRef,
    params: &MergingParams,
    partition_key: &[String],
    sort_key: &[String],
    cleanup: bool,
    clean_deleted_rows: CleanDeletedRows,
    time_of_merge: i64,
) -> Result<Box<dyn MergingAlgorithm>, MergeError> {
    Ok(match params.mode {
        MergeMode::Ordinary => Box::new(ordinary::OrdinaryAlgorithm),
        MergeMode::Collapsing => Box::new(collapsing::CollapsingAlgorithm::new(column_index(
            schema,
            &params.sign_column,
        )?)),
        MergeMode::Replacing => {
            let version = if params.version_column.is_empty() {
                None
            } else {
                Some(column_index(schema, &params.version_column)?)
            };
            let is_deleted = if params.is_deleted_column.is_empty() {
                None
            } else {
                Some(column_index(schema, &params.is_deleted_column)?)
            };
            let clean = cleanup || clean_deleted_rows == CleanDeletedRows::Always;
            Box::new(replacing::ReplacingAlgorithm::new(version, is_deleted, clean))
        }
        MergeMode::Summing => Box::new(summing::SummingAlgorithm::new(
            schema,
            params,
            partition_key,
            sort_key,
        )?),
        MergeMode::Aggregating => Box::new(aggregating::AggregatingAlgorithm::new(schema, params)?),
        MergeMode::VersionedCollapsing => {
            Box::new(versioned_collapsing::VersionedCollapsingAlgorithm::new(
                column_index(schema, &params.sign_column)?,
                column_index(schema, &params.version_column)?,
            ))
        }
        MergeMode::Graphite => {
            let graphite = params.graphite.as_ref().ok_or_else(|| {
                MergeError::Logical("graphite merge without graphite params".to_string())
            })?;
            Box::new(graphite::GraphiteRollupAlgorithm::new(
                schema,
                graphite,
                time_of_merge,
            )?)
        }
    })
}

struct SourceCursor {
    reader: SequentialPartReader,
    rows: VecDeque<Row>,
    exhausted: bool,
}

impl SourceCursor {
    fn new(reader: SequentialPartReader) -> Self {
        Self {
            reader,
            rows: VecDeque::new(),
            exhausted: false,
        }
    }

    fn ensure(&mut self) -> Result<bool, MergeError> {
        while self.rows.is_empty() && !self.exhausted {
            match self.reader.next_block()? {
                Some(block) => {
                    for idx in 0..block.num_rows() {
                        self.rows.push_back(row_at(&block, idx));
                    }
                }
                None => self.exhausted = true,
            }
        }
        Ok(!self.rows.is_empty())
    }

    fn current(&self) -> &Row {
        self.rows.front().expect("cursor not ensured")
    }

    fn pop(&mut self) -> Row {
        self.rows.pop_front().expect("cursor not ensured")
    }
}

struct HeapEntry {
    key: Vec<Value>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Equal keys pop in ascending source order: insertion order wins.
        self.key
            .cmp(&other.key)
            .then(self.source.cmp(&other.source))
            .reverse()
    }
}

/// N-way sorted merge driving one mode reducer.
pub(crate) struct MergingTransform {
    cursors: Vec<SourceCursor>,
    heap: BinaryHeap<HeapEntry>,
    key_indices: Vec<usize>,
    algorithm: Box<dyn MergingAlgorithm>,
    rows_sources: Option<RowsSourcesWriter>,
    builder: BlockBuilder,
    block_size: usize,
    initialized: bool,
    drained: bool,
}

impl MergingTransform {
    pub(crate) fn new(
        header: SchemaRef,
        readers: Vec<SequentialPartReader>,
        sort_key: &[String],
        algorithm: Box<dyn MergingAlgorithm>,
        rows_sources: Option<RowsSourcesWriter>,
        block_size: usize,
    ) -> Result<Self, MergeError> {
        let key_indices = sort_key
            .iter()
            .map(|name| column_index(&header, name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            cursors: readers.into_iter().map(SourceCursor::new).collect(),
            heap: BinaryHeap::new(),
            key_indices,
            algorithm,
            rows_sources,
            builder: BlockBuilder::new(header)?,
            block_size: block_size.max(1),
            initialized: false,
            drained: false,
        })
    }

    /// Hands the rows-sources writer back once the stream is drained.
    pub(crate) fn take_rows_sources(&mut self) -> Option<RowsSourcesWriter> {
        self.rows_sources.take()
    }

    fn init(&mut self) -> Result<(), MergeError> {
        for (source, cursor) in self.cursors.iter_mut().enumerate() {
            if cursor.ensure()? {
                self.heap.push(HeapEntry {
                    key: project(cursor.current(), &self.key_indices),
                    source,
                });
            }
        }
        self.initialized = true;
        Ok(())
    }

    fn next_group(&mut self) -> Result<Option<(Vec<Value>, Vec<GroupRow>)>, MergeError> {
        let Some(first) = self.heap.pop() else {
            return Ok(None);
        };
        let group_key = first.key;
        let mut sources = vec![first.source];
        while let Some(next) = self.heap.peek() {
            if next.key == group_key {
                sources.push(self.heap.pop().expect("peeked entry").source);
            } else {
                break;
            }
        }

        let mut rows = Vec::new();
        for source in sources {
            let cursor = &mut self.cursors[source];
            loop {
                rows.push(GroupRow {
                    source,
                    row: cursor.pop(),
                });
                if !cursor.ensure()? {
                    break;
                }
                let key = project(cursor.current(), &self.key_indices);
                if key == group_key {
                    continue;
                }
                self.heap.push(HeapEntry { key, source });
                break;
            }
        }
        Ok(Some((group_key, rows)))
    }

    /// Next merged block, or `None` when every input is drained.
    pub(crate) fn next_block(&mut self) -> Result<Option<RecordBatch>, MergeError> {
        if !self.initialized {
            self.init()?;
        }
        let mut extra = Vec::new();
        while !self.drained {
            match self.next_group()? {
                Some((_, rows)) => {
                    extra.clear();
                    let keep = self.algorithm.merge_group(&rows, &mut extra)?;
                    debug_assert_eq!(keep.len(), rows.len());
                    if let Some(sink) = &mut self.rows_sources {
                        for (row, kept) in rows.iter().zip(&keep) {
                            sink.write(RowSource::with_skip(row.source, !kept))?;
                        }
                    }
                    for (row, kept) in rows.iter().zip(&keep) {
                        if *kept {
                            self.builder.push_row(&row.row)?;
                        }
                    }
                    for row in &extra {
                        self.builder.push_row(row)?;
                    }
                    if self.builder.len() >= self.block_size {
                        return Ok(Some(self.builder.finish()?));
                    }
                }
                None => {
                    self.drained = true;
                    extra.clear();
                    self.algorithm.finish(&mut extra)?;
                    for row in &extra {
                        self.builder.push_row(row)?;
                    }
                }
            }
        }
        if self.builder.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.builder.finish()?))
        }
    }
}

/// The key-merge pipeline: mode transform plus the optional downstream
/// distinct and TTL filters.
pub(crate) struct MergedStream {
    transform: MergingTransform,
    distinct: Option<DistinctTransform>,
    ttl: Option<TtlFilterTransform>,
}

impl MergedStream {
    pub(crate) fn new(
        transform: MergingTransform,
        distinct: Option<DistinctTransform>,
        ttl: Option<TtlFilterTransform>,
    ) -> Self {
        Self {
            transform,
            distinct,
            ttl,
        }
    }

    pub(crate) fn next_block(&mut self) -> Result<Option<RecordBatch>, MergeError> {
        loop {
            let Some(block) = self.transform.next_block()? else {
                return Ok(None);
            };
            let block = match &mut self.distinct {
                Some(distinct) => match distinct.filter(&block)? {
                    Some(block) => block,
                    None => continue,
                },
                None => block,
            };
            let block = match &mut self.ttl {
                Some(ttl) => match ttl.filter(&block)? {
                    Some(block) => block,
                    None => continue,
                },
                None => block,
            };
            return Ok(Some(block));
        }
    }

    pub(crate) fn take_rows_sources(&mut self) -> Option<RowsSourcesWriter> {
        self.transform.take_rows_sources()
    }
}
