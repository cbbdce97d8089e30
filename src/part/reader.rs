//! Sequential part reader: yields blocks in primary-key order.
//!
//! Wide parts are read one parquet file per column and re-zipped into
//! blocks; Compact parts are read through a root projection over the packed
//! file. On request the reader appends a `_part_offset` virtual column and
//! filters rows masked by the lightweight-delete bitmap, counting what it
//! dropped into the shared filtered-rows counter.

use std::{
    fs::File,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use arrow_array::{ArrayRef, BooleanArray, RecordBatch, UInt64Array};
use arrow_schema::{Field, Schema, SchemaRef};
use parquet::arrow::{
    arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder},
    ProjectionMask,
};

use super::{DataPart, PartError, PartType, COMPACT_DATA_FILE};
use crate::{merge::MergeProgress, part::DeleteBitmap};

/// Name of the virtual column carrying each row's offset within its part.
pub const PART_OFFSET_COLUMN: &str = "_part_offset";

/// Knobs for one sequential read.
#[derive(Clone, Default)]
pub struct ReadOptions {
    pub batch_size: usize,
    pub with_part_offset: bool,
    pub apply_deletes: bool,
    /// Advisory; local storage may ignore the hint.
    pub direct_io: bool,
    pub progress: Option<Arc<MergeProgress>>,
    pub filtered_rows: Option<Arc<AtomicU64>>,
}

/// Per-column feed with carry-over between aligned output blocks.
struct ColumnFeed {
    reader: ParquetRecordBatchReader,
    pending: Option<ArrayRef>,
    pos: usize,
}

impl ColumnFeed {
    fn ensure(&mut self) -> Result<bool, PartError> {
        while self.pending.is_none() {
            match self.reader.next() {
                Some(batch) => {
                    let batch = batch?;
                    if batch.num_rows() == 0 {
                        continue;
                    }
                    self.pending = Some(batch.column(0).clone());
                    self.pos = 0;
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    fn available(&self) -> usize {
        self.pending
            .as_ref()
            .map(|array| array.len() - self.pos)
            .unwrap_or(0)
    }

    fn take(&mut self, rows: usize) -> ArrayRef {
        let array = self.pending.as_ref().expect("feed not ensured");
        let slice = array.slice(self.pos, rows);
        self.pos += rows;
        if self.pos == array.len() {
            self.pending = None;
        }
        slice
    }
}

enum Source {
    Wide(Vec<ColumnFeed>),
    Compact {
        reader: ParquetRecordBatchReader,
        /// Maps requested column position to the projected batch position.
        reorder: Vec<usize>,
        pending: Option<RecordBatch>,
        pos: usize,
    },
}

/// Streams one part's rows in stored (primary-key) order.
pub struct SequentialPartReader {
    part: Arc<DataPart>,
    schema: SchemaRef,
    source: Source,
    options: ReadOptions,
    delete_bitmap: Option<DeleteBitmap>,
    next_offset: u64,
    done: bool,
}

impl SequentialPartReader {
    pub fn new(
        part: Arc<DataPart>,
        columns: Vec<String>,
        options: ReadOptions,
    ) -> Result<Self, PartError> {
        let batch_size = options.batch_size.max(1);
        let mut fields = Vec::with_capacity(columns.len() + 1);
        for column in &columns {
            let (_, column_type) = part
                .meta()
                .columns
                .iter()
                .find(|(name, _)| name == column)
                .ok_or_else(|| PartError::MissingColumn(column.clone()))?;
            fields.push(Field::new(column.clone(), column_type.to_arrow(), true));
        }
        if options.with_part_offset {
            fields.push(Field::new(PART_OFFSET_COLUMN, arrow_schema::DataType::UInt64, false));
        }
        let schema = Arc::new(Schema::new(fields));

        let source = match part.part_type() {
            PartType::Wide => {
                let mut feeds = Vec::with_capacity(columns.len());
                for column in &columns {
                    let file = File::open(part.dir().join(format!("{column}.parquet")))?;
                    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?
                        .with_batch_size(batch_size)
                        .build()?;
                    feeds.push(ColumnFeed {
                        reader,
                        pending: None,
                        pos: 0,
                    });
                }
                Source::Wide(feeds)
            }
            PartType::Compact => {
                let file = File::open(part.dir().join(COMPACT_DATA_FILE))?;
                let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
                let file_schema = builder.schema().clone();
                let mut roots = Vec::with_capacity(columns.len());
                for column in &columns {
                    let idx = file_schema
                        .index_of(column)
                        .map_err(|_| PartError::MissingColumn(column.clone()))?;
                    roots.push(idx);
                }
                // The projected batch keeps file order; remember where each
                // requested column landed.
                let mut sorted = roots.clone();
                sorted.sort_unstable();
                let reorder = roots
                    .iter()
                    .map(|idx| sorted.iter().position(|s| s == idx).unwrap())
                    .collect();
                let mask = ProjectionMask::roots(builder.parquet_schema(), sorted);
                let reader = builder
                    .with_projection(mask)
                    .with_batch_size(batch_size)
                    .build()?;
                Source::Compact {
                    reader,
                    reorder,
                    pending: None,
                    pos: 0,
                }
            }
        };

        let delete_bitmap = if options.apply_deletes {
            part.delete_bitmap().cloned()
        } else {
            None
        };

        Ok(Self {
            part,
            schema,
            source,
            options: ReadOptions {
                batch_size,
                ..options
            },
            delete_bitmap,
            next_offset: 0,
            done: false,
        })
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    pub fn part(&self) -> &Arc<DataPart> {
        &self.part
    }

    fn next_columns(&mut self) -> Result<Option<Vec<ArrayRef>>, PartError> {
        match &mut self.source {
            Source::Wide(feeds) => {
                let mut rows = self.options.batch_size;
                for feed in feeds.iter_mut() {
                    if !feed.ensure()? {
                        return Ok(None);
                    }
                    rows = rows.min(feed.available());
                }
                Ok(Some(feeds.iter_mut().map(|feed| feed.take(rows)).collect()))
            }
            Source::Compact {
                reader,
                reorder,
                pending,
                pos,
            } => {
                if pending.is_none() {
                    match reader.next() {
                        Some(batch) => {
                            *pending = Some(batch?);
                            *pos = 0;
                        }
                        None => return Ok(None),
                    }
                }
                let batch = pending.take().expect("pending batch");
                let rows = batch.num_rows() - *pos;
                let rows = rows.min(self.options.batch_size);
                let columns = reorder
                    .iter()
                    .map(|&idx| batch.column(idx).slice(*pos, rows))
                    .collect();
                *pos += rows;
                if *pos < batch.num_rows() {
                    *pending = Some(batch);
                }
                Ok(Some(columns))
            }
        }
    }

    /// Next block in part order, or `None` once the part is drained.
    pub fn next_block(&mut self) -> Result<Option<RecordBatch>, PartError> {
        loop {
            if self.done || self.part.rows_count() == 0 {
                self.done = true;
                return Ok(None);
            }
            let Some(mut columns) = self.next_columns()? else {
                self.done = true;
                return Ok(None);
            };
            let rows = columns.first().map(|c| c.len()).unwrap_or(0);
            let offset_base = self.next_offset;
            self.next_offset += rows as u64;

            if self.options.with_part_offset {
                let offsets: UInt64Array =
                    (offset_base..offset_base + rows as u64).collect::<Vec<_>>().into();
                columns.push(Arc::new(offsets));
            }
            let mut batch = RecordBatch::try_new(self.schema.clone(), columns)?;

            if let Some(progress) = &self.options.progress {
                progress.add_rows_read(rows as u64);
                progress.add_bytes_read_uncompressed(batch.get_array_memory_size() as u64);
            }

            if let Some(bitmap) = &self.delete_bitmap {
                let keep: BooleanArray = (0..rows as u64)
                    .map(|row| Some(!bitmap.contains(offset_base + row)))
                    .collect();
                let kept = keep.values().count_set_bits();
                if kept != rows {
                    if let Some(counter) = &self.options.filtered_rows {
                        counter.fetch_add((rows - kept) as u64, Ordering::Relaxed);
                    }
                    batch = arrow_select::filter::filter_record_batch(&batch, &keep)?;
                }
            }

            if batch.num_rows() == 0 {
                // Whole block deleted; keep pulling.
                continue;
            }
            return Ok(Some(batch));
        }
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::Int64Array;
    use arrow_schema::DataType;

    use super::*;
    use crate::{
        block::{row_at, Value},
        part::{writer::PartBuilder, PartInfo},
    };

    fn build_part(dir: &std::path::Path, deleted: &[u64]) -> Arc<DataPart> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3, 4])),
                Arc::new(arrow_array::StringArray::from(vec!["a", "b", "c", "d"])),
            ],
        )
        .unwrap();
        let mut builder = PartBuilder::new(
            dir.join(PartInfo::new("all", 1, 1, 0).name()),
            schema,
            PartType::Wide,
            vec!["k".to_string()],
        )
        .unwrap();
        builder.write(&batch).unwrap();
        if !deleted.is_empty() {
            builder = builder.with_delete_bitmap(deleted.iter().copied());
        }
        Arc::new(builder.finish().unwrap())
    }

    #[test]
    fn reads_rows_in_order_with_offsets() {
        let tmp = tempfile::tempdir().unwrap();
        let part = build_part(tmp.path(), &[]);
        let mut reader = SequentialPartReader::new(
            part,
            vec!["k".to_string(), "v".to_string()],
            ReadOptions {
                batch_size: 3,
                with_part_offset: true,
                apply_deletes: true,
                ..Default::default()
            },
        )
        .unwrap();

        let mut rows = Vec::new();
        while let Some(block) = reader.next_block().unwrap() {
            for idx in 0..block.num_rows() {
                rows.push(row_at(&block, idx));
            }
        }
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0][0], Value::Int64(1));
        assert_eq!(rows[3][2], Value::UInt64(3));
    }

    #[test]
    fn delete_bitmap_filters_and_counts() {
        let tmp = tempfile::tempdir().unwrap();
        let part = build_part(tmp.path(), &[1, 3]);
        let filtered = Arc::new(AtomicU64::new(0));
        let mut reader = SequentialPartReader::new(
            part,
            vec!["k".to_string()],
            ReadOptions {
                batch_size: 8,
                with_part_offset: true,
                apply_deletes: true,
                filtered_rows: Some(filtered.clone()),
                ..Default::default()
            },
        )
        .unwrap();

        let block = reader.next_block().unwrap().unwrap();
        assert_eq!(block.num_rows(), 2);
        assert_eq!(row_at(&block, 0)[1], Value::UInt64(0));
        assert_eq!(row_at(&block, 1)[1], Value::UInt64(2));
        assert!(reader.next_block().unwrap().is_none());
        assert_eq!(filtered.load(Ordering::Relaxed), 2);
    }
}
