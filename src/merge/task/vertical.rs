//! Vertical stage: gathers non-key columns one at a time, driven by the
//! rows-sources stream written during the key merge.

use std::{collections::VecDeque, sync::Arc};

use arrow_schema::{Field, Schema};
use log::Level;
use parquet::file::properties::WriterProperties;

use super::{horizontal::VerticalCarry, projections::ProjectionsCarry, GlobalContext};
use crate::{
    logging::merge_log,
    merge::{
        error::MergeError,
        gather::ColumnGatherer,
        rows_source::{RowsSourcesReader, RowsSourcesWriter},
        size::ColumnSizeEstimator,
        MergeAlgorithm,
    },
    part::{reader::ReadOptions, GatheredColumnWriter, SequentialPartReader},
};

enum OneColumnState {
    NeedPrepare,
    NeedExecute,
    NeedFinish,
}

pub(crate) struct VerticalCtx {
    rows_sources_writer: Option<RowsSourcesWriter>,
    rows_sources_reader: Option<RowsSourcesReader>,
    column_sizes: Option<ColumnSizeEstimator>,
    write_props: WriterProperties,
    read_with_direct_io: bool,
    need_sync: bool,
    column_idx: usize,
    state: OneColumnState,
    gatherer: Option<ColumnGatherer>,
    column_to: Option<GatheredColumnWriter>,
    column_elems_written: u64,
    progress_before: f64,
    delayed_streams: VecDeque<GatheredColumnWriter>,
    max_delayed_streams: usize,
}

pub(crate) struct VerticalStage {
    ctx: VerticalCtx,
    subtask: usize,
}

type Subtask = fn(&mut VerticalStage, &mut GlobalContext) -> Result<bool, MergeError>;

impl VerticalStage {
    const SUBTASKS: &'static [Subtask] = &[
        Self::prepare_vertical_merge_for_all_columns,
        Self::execute_vertical_merge_for_all_columns,
        Self::finalize_vertical_merge_for_all_columns,
    ];

    pub(crate) fn new(carry: VerticalCarry) -> Self {
        Self {
            ctx: VerticalCtx {
                rows_sources_writer: carry.rows_sources_writer,
                rows_sources_reader: None,
                column_sizes: carry.column_sizes,
                write_props: carry.write_props,
                read_with_direct_io: carry.read_with_direct_io,
                need_sync: carry.need_sync,
                column_idx: 0,
                state: OneColumnState::NeedPrepare,
                gatherer: None,
                column_to: None,
                column_elems_written: 0,
                progress_before: 0.0,
                delayed_streams: VecDeque::new(),
                max_delayed_streams: 0,
            },
            subtask: 0,
        }
    }

    pub(crate) fn execute(&mut self, global: &mut GlobalContext) -> Result<bool, MergeError> {
        debug_assert!(self.subtask < Self::SUBTASKS.len());
        if (Self::SUBTASKS[self.subtask])(self, global)? {
            return Ok(true);
        }
        self.subtask += 1;
        Ok(self.subtask < Self::SUBTASKS.len())
    }

    pub(crate) fn into_carry(self) -> ProjectionsCarry {
        ProjectionsCarry {
            need_sync: self.ctx.need_sync,
        }
    }

    fn prepare_vertical_merge_for_all_columns(
        &mut self,
        global: &mut GlobalContext,
    ) -> Result<bool, MergeError> {
        if global.chosen_merge_algorithm != Some(MergeAlgorithm::Vertical) {
            return Ok(false);
        }

        let sum_input_rows_exact = global.progress.rows_read();
        let input_rows_filtered = global
            .input_rows_filtered
            .load(std::sync::atomic::Ordering::Relaxed);
        global
            .progress
            .set_columns_written(global.merging_column_names.len() as u64);
        let key_weight = self
            .ctx
            .column_sizes
            .as_ref()
            .map(|sizes| sizes.key_columns_weight())
            .unwrap_or(1.0);
        global.progress.set_progress(key_weight);

        let mut rows_sources_count = 0;
        if let Some(writer) = &mut self.ctx.rows_sources_writer {
            writer.finalize()?;
            rows_sources_count = writer.count();
        }
        // A single source with no skipped rows may have skipped writing the
        // stream entirely; anything else must account for every input row.
        if (rows_sources_count > 0 || global.future_part.parts.len() > 1)
            && sum_input_rows_exact != rows_sources_count + input_rows_filtered
        {
            return Err(MergeError::Logical(format!(
                "number of rows in source parts ({sum_input_rows_exact}) excluding filtered rows \
                 ({input_rows_filtered}) differs from number of bytes written to rows_sources file \
                 ({rows_sources_count}). It is a bug."
            )));
        }

        let file = global.rows_sources_file.as_ref().ok_or_else(|| {
            MergeError::Logical("vertical merge lost its rows-sources file".to_string())
        })?;
        self.ctx.rows_sources_reader = Some(file.reader()?);

        self.ctx.column_idx = 0;
        self.ctx.state = OneColumnState::NeedPrepare;
        self.ctx.max_delayed_streams = if global.new_part().storage.supports_parallel_write() {
            global.data.options().max_delayed_streams
        } else {
            0
        };
        Ok(false)
    }

    fn execute_vertical_merge_for_all_columns(
        &mut self,
        global: &mut GlobalContext,
    ) -> Result<bool, MergeError> {
        if global.chosen_merge_algorithm != Some(MergeAlgorithm::Vertical) {
            return Ok(false);
        }
        if self.ctx.column_idx >= global.gathering_column_names.len() {
            return Ok(false);
        }

        match self.ctx.state {
            OneColumnState::NeedPrepare => {
                self.prepare_vertical_merge_for_one_column(global)?;
                self.ctx.state = OneColumnState::NeedExecute;
                Ok(true)
            }
            OneColumnState::NeedExecute => {
                if self.execute_vertical_merge_for_one_column(global)? {
                    return Ok(true);
                }
                self.ctx.state = OneColumnState::NeedFinish;
                Ok(true)
            }
            OneColumnState::NeedFinish => {
                self.finalize_vertical_merge_for_one_column(global)?;
                self.ctx.state = OneColumnState::NeedPrepare;
                Ok(true)
            }
        }
    }

    fn prepare_vertical_merge_for_one_column(
        &mut self,
        global: &mut GlobalContext,
    ) -> Result<(), MergeError> {
        let column_name = global.gathering_column_names[self.ctx.column_idx].clone();
        let data_type = global.schema.data_type(&column_name).cloned().ok_or_else(|| {
            MergeError::Logical(format!("gathered column {column_name} missing from schema"))
        })?;
        let field = Field::new(column_name.clone(), data_type, true);

        self.ctx.progress_before = global.progress.progress();

        let options = global.data.options();
        let mut readers = Vec::with_capacity(global.future_part.parts.len());
        for part in &global.future_part.parts {
            readers.push(SequentialPartReader::new(
                part.clone(),
                vec![column_name.clone()],
                ReadOptions {
                    batch_size: options.merge_block_size,
                    with_part_offset: false,
                    apply_deletes: true,
                    direct_io: self.ctx.read_with_direct_io,
                    ..Default::default()
                },
            )?);
        }

        // The rows-sources stream replays from the top for every column.
        self.ctx
            .rows_sources_reader
            .as_mut()
            .expect("rows sources reader prepared")
            .rewind()?;
        self.ctx.gatherer = Some(ColumnGatherer::new(
            Arc::new(Schema::new(vec![field.clone()])),
            readers,
            options.merge_block_size,
        )?);
        self.ctx.column_to = Some(GatheredColumnWriter::new(
            global.new_part().storage.clone(),
            &field,
            &self.ctx.write_props,
        )?);
        self.ctx.column_elems_written = 0;
        Ok(())
    }

    fn execute_vertical_merge_for_one_column(
        &mut self,
        global: &mut GlobalContext,
    ) -> Result<bool, MergeError> {
        if global.merges_blocker.is_cancelled() || global.progress.is_cancelled() {
            return Ok(false);
        }
        let VerticalCtx {
            rows_sources_reader,
            gatherer,
            ..
        } = &mut self.ctx;
        let reader = rows_sources_reader
            .as_mut()
            .expect("rows sources reader prepared");
        let block = gatherer
            .as_mut()
            .expect("gatherer prepared")
            .next_block(reader)?;
        match block {
            Some(block) => {
                self.ctx.column_elems_written += block.num_rows() as u64;
                global
                    .progress
                    .add_bytes_written_uncompressed(block.get_array_memory_size() as u64);
                self.ctx
                    .column_to
                    .as_mut()
                    .expect("column writer prepared")
                    .write(&block)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn finalize_vertical_merge_for_one_column(
        &mut self,
        global: &mut GlobalContext,
    ) -> Result<(), MergeError> {
        let column_name = global.gathering_column_names[self.ctx.column_idx].clone();
        if global.merges_blocker.is_cancelled() || global.progress.is_cancelled() {
            return Err(MergeError::aborted());
        }
        self.ctx.gatherer = None;

        let mut column_to = self
            .ctx
            .column_to
            .take()
            .expect("column writer prepared");
        let written = column_to.fill_checksums()?;
        global
            .checksums_gathered_columns
            .add_file(&written.file_name, written.checksum);
        global.gathered_columns.push(written);

        self.ctx.delayed_streams.push_back(column_to);
        while self.ctx.delayed_streams.len() > self.ctx.max_delayed_streams {
            let stream = self
                .ctx
                .delayed_streams
                .pop_front()
                .expect("delayed stream present");
            stream.finish(self.ctx.need_sync)?;
        }

        if global.rows_written != self.ctx.column_elems_written {
            return Err(MergeError::Logical(format!(
                "written {} elements of column {column_name}, but {} rows of PK columns",
                self.ctx.column_elems_written, global.rows_written
            )));
        }

        let column_weight = self
            .ctx
            .column_sizes
            .as_ref()
            .map(|sizes| sizes.column_weight(&column_name))
            .unwrap_or(0.0);
        global.progress.add_columns_written(1);
        global
            .progress
            .set_progress(self.ctx.progress_before + column_weight);
        merge_log!(
            Level::Trace,
            "gathered_column",
            "column={column_name} rows={}",
            self.ctx.column_elems_written,
        );

        self.ctx.column_idx += 1;
        Ok(())
    }

    fn finalize_vertical_merge_for_all_columns(
        &mut self,
        _global: &mut GlobalContext,
    ) -> Result<bool, MergeError> {
        for stream in self.ctx.delayed_streams.drain(..) {
            stream.finish(self.ctx.need_sync)?;
        }
        Ok(false)
    }
}
