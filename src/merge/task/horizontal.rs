//! Horizontal stage: prepares the new part and runs the key merge.
//!
//! For a horizontal merge this writes the complete part; for a vertical one
//! it writes only sort-key and index columns and persists the rows-sources
//! stream for the gather stage. The row-id-map subtask runs here as well, at
//! the boundary between the key phase and the gather phase.

use std::{collections::BTreeMap, sync::Arc};

use arrow_array::RecordBatch;
use arrow_schema::Schema;
use log::Level;
use parquet::file::properties::WriterProperties;

use super::{GlobalContext, NewPartState, TMP_MERGE_PREFIX};
use crate::{
    logging::merge_log,
    merge::{
        choose_merge_algorithm,
        error::MergeError,
        row_id_map::RowIdMapBuilder,
        rows_source::{RowsSourcesFile, RowsSourcesWriter},
        size::ColumnSizeEstimator,
        transform::{
            build_merging_algorithm, DistinctTransform, MergedStream, MergingTransform,
            TtlFilterTransform,
        },
        MergeAlgorithm, MergeMode,
    },
    part::{
        reader::ReadOptions, LocalPartStorage, MergedPartWriter, MergedSourcePart, PartError,
        PartStorage, SequentialPartReader, SerializationInfo, TtlInfos, VectorIndexState,
        VECTOR_INDEX_FILE_SUFFIX,
    },
    schema::extract_merging_and_gathering_columns,
};

/// Context handed from the horizontal stage to the vertical stage.
pub(crate) struct VerticalCarry {
    pub rows_sources_writer: Option<RowsSourcesWriter>,
    pub column_sizes: Option<ColumnSizeEstimator>,
    pub write_props: WriterProperties,
    pub read_with_direct_io: bool,
    pub need_sync: bool,
}

pub(crate) struct HorizontalCtx {
    rows_sources_writer: Option<RowsSourcesWriter>,
    column_sizes: Option<ColumnSizeEstimator>,
    write_props: WriterProperties,
    read_with_direct_io: bool,
    need_remove_expired_values: bool,
    force_ttl: bool,
    sum_input_rows_upper_bound: u64,
    sum_compressed_bytes_upper_bound: u64,
    initial_reservation: u64,
    need_sync: bool,
    /// Header positions the writer keeps once expired columns are elided.
    writer_projection: Option<Vec<usize>>,
}

pub(crate) struct HorizontalStage {
    ctx: HorizontalCtx,
    subtask: usize,
}

type Subtask = fn(&mut HorizontalStage, &mut GlobalContext) -> Result<bool, MergeError>;

impl HorizontalStage {
    const SUBTASKS: &'static [Subtask] = &[
        Self::prepare,
        Self::execute_impl,
        Self::generate_row_id_maps,
    ];

    pub(crate) fn new() -> Self {
        Self {
            ctx: HorizontalCtx {
                rows_sources_writer: None,
                column_sizes: None,
                write_props: WriterProperties::builder().build(),
                read_with_direct_io: false,
                need_remove_expired_values: false,
                force_ttl: false,
                sum_input_rows_upper_bound: 0,
                sum_compressed_bytes_upper_bound: 0,
                initial_reservation: 0,
                need_sync: false,
                writer_projection: None,
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

    pub(crate) fn into_carry(self) -> VerticalCarry {
        VerticalCarry {
            rows_sources_writer: self.ctx.rows_sources_writer,
            column_sizes: self.ctx.column_sizes,
            write_props: self.ctx.write_props,
            read_with_direct_io: self.ctx.read_with_direct_io,
            need_sync: self.ctx.need_sync,
        }
    }

    fn prepare(&mut self, global: &mut GlobalContext) -> Result<bool, MergeError> {
        if global.merges_blocker.is_cancelled() || global.progress.is_cancelled() {
            return Err(MergeError::aborted());
        }
        // A TTL-typed merge must not run while TTL merges are blocked.
        if global.future_part.merge_type.is_ttl() && global.ttl_merges_blocker.is_cancelled() {
            return Err(MergeError::aborted_ttl());
        }

        let future_part = global.future_part.clone();
        let schema = global.schema.clone();
        let options = global.data.options().clone();

        merge_log!(
            Level::Debug,
            "merge_begin",
            "parts={} from={} to={} part_type={:?}",
            future_part.parts.len(),
            future_part.parts.first().map(|p| p.name()).unwrap_or_default(),
            future_part.parts.last().map(|p| p.name()).unwrap_or_default(),
            future_part.part_type,
        );
        if global.deduplicate {
            if global.deduplicate_by_columns.is_empty() {
                merge_log!(Level::Debug, "merge_deduplicate", "by=all_columns");
            } else {
                merge_log!(
                    Level::Debug,
                    "merge_deduplicate",
                    "by={:?}",
                    global.deduplicate_by_columns
                );
            }
        }

        // Projection sub-parts carry their own prefix/suffix convention.
        let local_tmp_prefix = if global.need_prefix && global.parent.is_none() {
            TMP_MERGE_PREFIX
        } else {
            ""
        };
        let local_tmp_suffix = global
            .parent
            .as_ref()
            .map(|parent| parent.suffix.clone())
            .unwrap_or_default();
        let dir_name = format!("{local_tmp_prefix}{}{local_tmp_suffix}", future_part.name);

        let storage: Arc<dyn PartStorage> = match &global.parent {
            Some(parent) => parent.storage.projection(&dir_name),
            None => Arc::new(LocalPartStorage::new(global.data.parts_dir().join(&dir_name))),
        };
        if storage.exists() {
            return Err(MergeError::Part(PartError::DirectoryAlreadyExists(
                storage.path().display().to_string(),
            )));
        }
        storage.begin_transaction()?;
        if global.parent.is_none() {
            global.temporary_directory_lock =
                Some(global.data.temporary_directory_lock(dir_name.clone()));
        }

        global.all_column_names = schema.physical_column_names();
        let (merging, gathering) =
            extract_merging_and_gathering_columns(&schema, &global.merging_params);
        global.merging_column_names = merging;
        global.gathering_column_names = gathering;

        // Fold TTL infos and serialization infos across sources.
        let mut ttl = TtlInfos::default();
        let mut serialization: BTreeMap<String, SerializationInfo> = BTreeMap::new();
        self.ctx.need_remove_expired_values = false;
        self.ctx.force_ttl = false;
        for part in &future_part.parts {
            ttl.update(&part.meta().ttl);
            if schema.has_any_ttl() && !part.all_ttl_calculated(&schema) {
                merge_log!(
                    Level::Info,
                    "merge_force_ttl",
                    "part={} lacks calculated TTL",
                    part.name(),
                );
                self.ctx.need_remove_expired_values = true;
                self.ctx.force_ttl = true;
            }

            for (column, (info, _)) in &part.meta().serialization {
                serialization.entry(column.clone()).or_default().add(info);
            }
            // Columns missing from a part with an expression-less DEFAULT
            // contribute pure defaults.
            for column in &global.all_column_names {
                let present = part.meta().columns.iter().any(|(name, _)| name == column);
                if present {
                    continue;
                }
                let Some(default) = schema.default_of(column) else {
                    continue;
                };
                if default.kind != crate::schema::DefaultKind::Default || default.has_expression {
                    continue;
                }
                serialization
                    .entry(column.clone())
                    .or_default()
                    .add_defaults(part.rows_count());
            }
        }

        if let Some(min_ttl) = ttl.part_min_ttl() {
            if min_ttl <= global.time_of_merge {
                self.ctx.need_remove_expired_values = true;
            }
        }
        if self.ctx.need_remove_expired_values && global.ttl_merges_blocker.is_cancelled() {
            merge_log!(
                Level::Info,
                "merge_ttl_blocked",
                "part={} has expired values but TTL merges are cancelled",
                future_part.name,
            );
            self.ctx.need_remove_expired_values = false;
        }

        self.ctx.sum_input_rows_upper_bound = global.progress.total_rows_count();
        self.ctx.sum_compressed_bytes_upper_bound = global.progress.total_size_bytes_compressed();

        let chosen = choose_merge_algorithm(
            &future_part,
            &global.merging_params,
            &options,
            global.gathering_column_names.len(),
            self.ctx.sum_input_rows_upper_bound,
            global.deduplicate,
            self.ctx.need_remove_expired_values,
        );
        global.chosen_merge_algorithm = Some(chosen);
        merge_log!(Level::Debug, "merge_algorithm", "selected={chosen}");

        // Codec selection consults the parts registry lock; keep it ahead of
        // input reader creation so the lock order never reverses.
        self.ctx.write_props = global.data.compression_codec_for_part(
            self.ctx.sum_compressed_bytes_upper_bound,
            &ttl,
            future_part.merge_type,
            global.time_of_merge,
        );

        match chosen {
            MergeAlgorithm::Horizontal => {
                global.merging_column_names = global.all_column_names.clone();
                global.gathering_column_names.clear();
            }
            MergeAlgorithm::Vertical => {
                let file = RowsSourcesFile::create(global.data.tmp_volume_dir())?;
                self.ctx.rows_sources_writer = Some(file.writer()?);
                global.rows_sources_file = Some(file);

                let mut sizes = std::collections::HashMap::new();
                for part in &future_part.parts {
                    part.accumulate_column_sizes(&mut sizes);
                }
                self.ctx.column_sizes = Some(ColumnSizeEstimator::new(
                    sizes,
                    &global.merging_column_names,
                    &global.gathering_column_names,
                ));
            }
        }

        self.decide_decouple(global)?;

        let mut merged_source_parts = Vec::with_capacity(future_part.parts.len());
        for (idx, part) in future_part.parts.iter().enumerate() {
            merged_source_parts.push(MergedSourcePart {
                name: part.name(),
                id: idx as u32,
                non_empty: !part.is_empty(),
            });
        }

        if global.can_be_decouple {
            // The decouple path replays rows-sources at finalize even when
            // the merge itself runs horizontally.
            if self.ctx.rows_sources_writer.is_none() {
                let file = RowsSourcesFile::create(global.data.tmp_volume_dir())?;
                self.ctx.rows_sources_writer = Some(file.writer()?);
                global.rows_sources_file = Some(file);
            }
            if let Some(file) = global.rows_sources_file.as_mut() {
                file.keep()?;
            }
            global.inverted_row_ids_map_file =
                Some(format!("merged-inverted_row_ids_map{VECTOR_INDEX_FILE_SUFFIX}"));
            global.row_ids_map_files = future_part
                .parts
                .iter()
                .enumerate()
                .map(|(idx, part)| {
                    format!(
                        "merged-{idx}-{}-row_ids_map{VECTOR_INDEX_FILE_SUFFIX}",
                        part.name()
                    )
                })
                .collect();
        }

        let mut vector_indices = BTreeMap::new();
        for description in schema.vector_indices() {
            let moved = global
                .all_parts_have_vector_index
                .get(&description.name)
                .copied()
                .unwrap_or(false);
            let state = if moved && (global.can_be_decouple || global.only_one_vpart_merged) {
                VectorIndexState::Built
            } else {
                VectorIndexState::Absent
            };
            vector_indices.insert(description.name.clone(), state);
        }

        global.new_part = Some(NewPartState {
            name: future_part.name.clone(),
            dir_name,
            storage: storage.clone(),
            ttl,
            serialization,
            expired_columns: Vec::new(),
            merged_source_parts,
            minmax: Default::default(),
            vector_indices,
            projections: Vec::new(),
        });

        self.create_merged_stream(global)?;

        // Skip fully expired columns when the TTL transform will not run, or
        // they would come back as defaults.
        if !self.ctx.need_remove_expired_values {
            let mut expired = Vec::new();
            {
                let new_part = global.new_part.as_ref().expect("new part state");
                for (column, range) in &new_part.ttl.columns {
                    if range.finished(global.time_of_merge) {
                        merge_log!(
                            Level::Trace,
                            "merge_expired_column",
                            "column={column} part={}",
                            new_part.name,
                        );
                        expired.push(column.clone());
                    }
                }
            }
            if !expired.is_empty() {
                global.merging_column_names.retain(|c| !expired.contains(c));
                global.gathering_column_names.retain(|c| !expired.contains(c));
                global.new_part_mut().expired_columns = expired;
            }
        }

        // The output stream writes the post-elision merging columns.
        let header = global
            .merged_stream_header
            .clone()
            .expect("merged stream prepared");
        let mut kept_fields = Vec::new();
        let mut kept_indices = Vec::new();
        for (idx, field) in header.fields().iter().enumerate() {
            if global.merging_column_names.contains(field.name()) {
                kept_fields.push(field.as_ref().clone());
                kept_indices.push(idx);
            }
        }
        self.ctx.writer_projection = if kept_indices.len() == header.fields().len() {
            None
        } else {
            Some(kept_indices)
        };
        let blocks_are_granules = global.chosen_merge_algorithm == Some(MergeAlgorithm::Vertical);
        global.to = Some(MergedPartWriter::new(
            storage,
            future_part.part_type,
            Arc::new(Schema::new(kept_fields)),
            Vec::new(),
            &self.ctx.write_props,
            blocks_are_granules,
        )?);

        global.rows_written = 0;
        self.ctx.initial_reservation = global
            .space_reservation
            .as_ref()
            .map(|reservation| reservation.size())
            .unwrap_or(0);

        Ok(false)
    }

    /// Checks whether BUILT vector indexes of the sources can be reused.
    fn decide_decouple(&mut self, global: &mut GlobalContext) -> Result<(), MergeError> {
        let schema = global.schema.clone();
        if !global.data.options().enable_decouple_vector_index || schema.vector_indices().is_empty()
        {
            return Ok(());
        }
        let parts = global.future_part.parts.clone();
        let num_parts = parts.len();
        let mut max_part_with_index = 0usize;

        for description in schema.vector_indices() {
            let mut num_parts_with_vector_index = 0usize;
            let mut empty_parts_count = 0usize;
            let mut not_empty_part_size = 0usize;

            for (idx, part) in parts.iter().enumerate() {
                let state = part.vector_index_state(&description.name);
                if state == VectorIndexState::Absent {
                    continue;
                }
                if state == VectorIndexState::Built {
                    num_parts_with_vector_index += 1;
                }
                if part.is_empty() {
                    empty_parts_count += 1;
                }
                if global.first_part_with_data == -1 && !part.is_empty() {
                    global.first_part_with_data = idx as i64;
                }
            }
            max_part_with_index = max_part_with_index.max(num_parts_with_vector_index);
            if not_empty_part_size == 0 {
                not_empty_part_size = num_parts - empty_parts_count;
            }
            merge_log!(
                Level::Debug,
                "merge_decouple_scan",
                "index={} built={num_parts_with_vector_index} empty={empty_parts_count} not_empty={not_empty_part_size}",
                description.name,
            );

            if num_parts > 0 && num_parts_with_vector_index + empty_parts_count == num_parts {
                global
                    .all_parts_have_vector_index
                    .insert(description.name.clone(), true);
                global.can_be_decouple = true;
            }
        }

        // A single indexed part without lightweight deletes moves its index
        // files instead of building row-id maps.
        if global.can_be_decouple && max_part_with_index == 1 && global.first_part_with_data >= 0 {
            let first = &parts[global.first_part_with_data as usize];
            if !first.has_lightweight_delete() {
                merge_log!(
                    Level::Debug,
                    "merge_single_vpart",
                    "part_id={}",
                    global.first_part_with_data,
                );
                global.only_one_vpart_merged = true;
                global.can_be_decouple = false;
            }
        }
        Ok(())
    }

    fn create_merged_stream(&mut self, global: &mut GlobalContext) -> Result<(), MergeError> {
        let future_part = global.future_part.clone();
        let schema = global.schema.clone();
        let options = global.data.options().clone();

        // Large merges bypass the page cache.
        self.ctx.read_with_direct_io = false;
        if options.min_merge_bytes_to_use_direct_io != 0 {
            let mut total_size = 0u64;
            for part in &future_part.parts {
                total_size += part.bytes_on_disk();
                if total_size >= options.min_merge_bytes_to_use_direct_io {
                    merge_log!(Level::Debug, "merge_direct_io", "total_bytes={total_size}");
                    self.ctx.read_with_direct_io = true;
                    break;
                }
            }
        }

        let mut readers = Vec::with_capacity(future_part.parts.len());
        for part in &future_part.parts {
            readers.push(SequentialPartReader::new(
                part.clone(),
                global.merging_column_names.clone(),
                ReadOptions {
                    batch_size: options.merge_block_size,
                    with_part_offset: false,
                    apply_deletes: true,
                    direct_io: self.ctx.read_with_direct_io,
                    progress: Some(global.progress.clone()),
                    filtered_rows: Some(global.input_rows_filtered.clone()),
                },
            )?);
        }
        let header = readers
            .first()
            .map(|reader| reader.schema())
            .unwrap_or_else(|| Arc::new(Schema::empty()));

        let algorithm = build_merging_algorithm(
            &header,
            &global.merging_params,
            schema.partition_key(),
            schema.sort_key(),
            global.cleanup,
            options.clean_deleted_rows,
            global.time_of_merge,
        )?;

        // When keys match, rows must keep ascending source-part order: the
        // transform breaks ties by source number, which is insertion order.
        let rows_sources = if global.merging_params.writes_rows_sources() {
            self.ctx.rows_sources_writer.take()
        } else {
            None
        };
        let transform = MergingTransform::new(
            header.clone(),
            readers,
            schema.sort_key(),
            algorithm,
            rows_sources,
            options.merge_block_size,
        )?;

        let distinct = if global.deduplicate {
            Some(DistinctTransform::new(
                &header,
                schema.sort_key(),
                &global.deduplicate_by_columns,
            )?)
        } else {
            None
        };
        let ttl = match (self.ctx.need_remove_expired_values, schema.row_ttl()) {
            (true, Some(row_ttl)) => {
                merge_log!(
                    Level::Debug,
                    "merge_ttl_filter",
                    "column={} force={}",
                    row_ttl.time_column,
                    self.ctx.force_ttl,
                );
                Some(TtlFilterTransform::new(
                    &header,
                    row_ttl,
                    global.time_of_merge,
                )?)
            }
            _ => None,
        };

        global.merged_stream_header = Some(header);
        global.merged_stream = Some(MergedStream::new(transform, distinct, ttl));
        Ok(())
    }

    fn execute_impl(&mut self, global: &mut GlobalContext) -> Result<bool, MergeError> {
        let cancelled = global.merge_cancelled(self.ctx.need_remove_expired_values);
        if !cancelled {
            let block = global
                .merged_stream
                .as_mut()
                .expect("merged stream prepared")
                .next_block()?;
            if let Some(block) = block {
                let rows = block.num_rows() as u64;
                global.rows_written += rows;

                let out_block = match &self.ctx.writer_projection {
                    Some(kept) => {
                        let schema_fields: Vec<_> = kept
                            .iter()
                            .map(|&idx| block.schema().field(idx).clone())
                            .collect();
                        let columns: Vec<_> =
                            kept.iter().map(|&idx| block.column(idx).clone()).collect();
                        RecordBatch::try_new(Arc::new(Schema::new(schema_fields)), columns)?
                    }
                    None => block,
                };
                global
                    .to
                    .as_mut()
                    .expect("output stream prepared")
                    .write(&out_block)?;
                global.progress.add_rows_written(rows);
                global
                    .progress
                    .add_bytes_written_uncompressed(out_block.get_array_memory_size() as u64);

                if self.ctx.sum_input_rows_upper_bound > 0 {
                    // Row-based estimate for Horizontal; the Vertical share
                    // is scaled by the key columns' byte weight.
                    let fraction = (global.rows_written as f64
                        / self.ctx.sum_input_rows_upper_bound as f64)
                        .min(1.0);
                    let fraction = match global.chosen_merge_algorithm {
                        Some(MergeAlgorithm::Vertical) => {
                            let weight = self
                                .ctx
                                .column_sizes
                                .as_ref()
                                .map(|sizes| sizes.key_columns_weight())
                                .unwrap_or(1.0);
                            weight * fraction
                        }
                        _ => fraction,
                    };
                    global.progress.set_progress(fraction);
                    if let Some(reservation) = &global.space_reservation {
                        reservation
                            .update(((1.0 - fraction) * self.ctx.initial_reservation as f64) as u64);
                    }
                }
                return Ok(true);
            }
        }

        // Pipeline drained (or cancellation pending): reclaim the
        // rows-sources writer and tear the stream down.
        if let Some(stream) = global.merged_stream.as_mut() {
            if let Some(writer) = stream.take_rows_sources() {
                self.ctx.rows_sources_writer = Some(writer);
            }
        }
        global.merged_stream = None;
        global.merged_stream_header = None;

        if global.merges_blocker.is_cancelled() || global.progress.is_cancelled() {
            return Err(MergeError::aborted());
        }
        if self.ctx.need_remove_expired_values && global.ttl_merges_blocker.is_cancelled() {
            return Err(MergeError::aborted_ttl());
        }

        self.ctx.need_sync = global.data.options().need_sync_part(
            self.ctx.sum_input_rows_upper_bound,
            self.ctx.sum_compressed_bytes_upper_bound,
        );
        Ok(false)
    }

    /// Builds the row-id maps linking the merged part to its sources. Only
    /// runs when the merge decouples a vector index.
    fn generate_row_id_maps(&mut self, global: &mut GlobalContext) -> Result<bool, MergeError> {
        let Some(inverted_map_file) = global.inverted_row_ids_map_file.clone() else {
            return Ok(false);
        };

        if let Some(writer) = &mut self.ctx.rows_sources_writer {
            writer.finalize()?;
        }
        let file = global.rows_sources_file.as_ref().ok_or_else(|| {
            MergeError::Logical("decoupled merge lost its rows-sources file".to_string())
        })?;
        let mut reader = file.reader()?;

        let schema = global.schema.clone();
        let parts = global.future_part.parts.clone();
        let row_ids_map_files = global.row_ids_map_files.clone();
        let collapsing_family = matches!(
            global.merging_params.mode,
            MergeMode::Collapsing | MergeMode::Replacing | MergeMode::VersionedCollapsing
        );
        let builder = RowIdMapBuilder {
            parts: &parts,
            sort_key: schema.sort_key(),
            collapsing_family,
            vector_indices: schema.vector_indices(),
            new_part_storage: global.new_part().storage.as_ref(),
            inverted_map_file: &inverted_map_file,
            row_ids_map_files: &row_ids_map_files,
            batch_size: global.data.options().merge_block_size,
        };
        builder.build(&mut reader)?;

        if global.chosen_merge_algorithm == Some(MergeAlgorithm::Horizontal) {
            // The kept temp file stays for finalize; the writer is done.
            self.ctx.rows_sources_writer = None;
        }
        Ok(false)
    }
}
