//! Projections stage: recursive sub-merges, part sealing and vector-index
//! finalization.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use log::Level;

use super::{GlobalContext, MergeTask, MergeTaskParams, ParentPart};
use crate::{
    io::{copy_all, CompressedWriter},
    logging::merge_log,
    merge::{error::MergeError, progress::MergeProgress, MergeMode, MergingParams},
    part::{
        writer::{seal_part, serialization_table, WrittenColumn},
        Checksums, DataPart, FuturePart, MergeType, PartInfo, PartMeta, StorageType,
        VectorIndexState, PROJECTION_DIR_SUFFIX, VECTOR_INDEX_FILE_SUFFIX,
    },
    vector,
};

/// Context handed from the vertical stage to this one.
pub(crate) struct ProjectionsCarry {
    pub need_sync: bool,
}

pub(crate) struct ProjectionsCtx {
    need_sync: bool,
    tasks: Vec<MergeTask>,
    results: Vec<flume::Receiver<Arc<DataPart>>>,
    names: Vec<String>,
    task_idx: usize,
}

pub(crate) struct ProjectionsStage {
    ctx: ProjectionsCtx,
    subtask: usize,
}

type Subtask = fn(&mut ProjectionsStage, &mut GlobalContext) -> Result<bool, MergeError>;

impl ProjectionsStage {
    const SUBTASKS: &'static [Subtask] = &[
        Self::merge_min_max_index_and_prepare_projections,
        Self::execute_projections,
        Self::finalize_projections_and_whole_merge,
    ];

    pub(crate) fn new(carry: ProjectionsCarry) -> Self {
        Self {
            ctx: ProjectionsCtx {
                need_sync: carry.need_sync,
                tasks: Vec::new(),
                results: Vec::new(),
                names: Vec::new(),
                task_idx: 0,
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

    fn merge_min_max_index_and_prepare_projections(
        &mut self,
        global: &mut GlobalContext,
    ) -> Result<bool, MergeError> {
        // Empty parts must not poison the min-max bounds.
        let parts = global.future_part.parts.clone();
        {
            let new_part = global.new_part_mut();
            for part in &parts {
                if !part.is_empty() {
                    new_part.minmax.merge(&part.meta().minmax);
                }
            }
        }

        merge_log!(
            Level::Debug,
            "merge_sorted",
            "rows={} columns={} merged={} gathered={}",
            global.progress.rows_read(),
            global.all_column_names.len(),
            global.merging_column_names.len(),
            global.gathering_column_names.len(),
        );

        let schema = global.schema.clone();
        for projection in schema.projections() {
            let mut projection_parts = Vec::new();
            for part in &parts {
                if let Some(sub_part) = part.projection_part(&projection.name) {
                    projection_parts.push(Arc::new(sub_part));
                }
            }
            if projection_parts.len() < parts.len() {
                merge_log!(
                    Level::Debug,
                    "projection_skipped",
                    "projection={} has_parts={} need={}",
                    projection.name,
                    projection_parts.len(),
                    parts.len(),
                );
                continue;
            }

            let part_type = projection_parts[0].part_type();
            let future_part = Arc::new(FuturePart {
                name: projection.name.clone(),
                part_info: PartInfo::new("all", 0, 0, 0),
                part_type,
                storage_type: StorageType::Full,
                parts: projection_parts,
                merge_type: MergeType::Regular,
            });
            let progress = Arc::new(MergeProgress::for_future_part(&future_part));
            let merging_params = if projection.aggregating {
                MergingParams::new(MergeMode::Aggregating)
            } else {
                MergingParams::new(MergeMode::Ordinary)
            };

            let child = MergeTask::new_projection_child(
                MergeTaskParams {
                    data: global.data.clone(),
                    future_part,
                    progress,
                    merges_blocker: global.merges_blocker.clone(),
                    ttl_merges_blocker: global.ttl_merges_blocker.clone(),
                    space_reservation: None,
                    deduplicate: global.deduplicate,
                    deduplicate_by_columns: global.deduplicate_by_columns.clone(),
                    cleanup: global.cleanup,
                    merging_params: Some(merging_params),
                    schema: Some(Arc::new(schema.projection_schema(projection))),
                    time_of_merge: global.time_of_merge,
                    need_prefix: global.need_prefix,
                },
                ParentPart {
                    storage: global.new_part().storage.clone(),
                    suffix: PROJECTION_DIR_SUFFIX.to_string(),
                },
            );
            self.ctx.results.push(child.result_future());
            self.ctx.names.push(projection.name.clone());
            self.ctx.tasks.push(child);
        }
        self.ctx.task_idx = 0;
        Ok(false)
    }

    fn execute_projections(&mut self, _global: &mut GlobalContext) -> Result<bool, MergeError> {
        if self.ctx.task_idx >= self.ctx.tasks.len() {
            return Ok(false);
        }
        if self.ctx.tasks[self.ctx.task_idx].execute()? {
            return Ok(true);
        }
        self.ctx.task_idx += 1;
        Ok(true)
    }

    fn finalize_projections_and_whole_merge(
        &mut self,
        global: &mut GlobalContext,
    ) -> Result<bool, MergeError> {
        for (name, result) in self.ctx.names.iter().zip(&self.ctx.results) {
            let part = result.try_recv().map_err(|_| {
                MergeError::Logical(format!("projection {name} merge produced no part"))
            })?;
            global.new_part_mut().projections.push(name.clone());
            merge_log!(
                Level::Debug,
                "projection_attached",
                "projection={name} rows={}",
                part.rows_count(),
            );
        }

        let written = global
            .to
            .take()
            .ok_or_else(|| MergeError::Logical("output stream already finalized".to_string()))?
            .finalize()?;

        if written.rows == 0 {
            global.can_be_decouple = false;
            global.only_one_vpart_merged = false;
            for state in global.new_part_mut().vector_indices.values_mut() {
                *state = VectorIndexState::Absent;
            }
        }

        // Assemble metadata in table column order: key columns from the
        // horizontal phase, gathered columns from the vertical one.
        let mut by_name: HashMap<String, &WrittenColumn> = HashMap::new();
        for column in written.columns.iter().chain(global.gathered_columns.iter()) {
            by_name.insert(column.name.clone(), column);
        }
        let mut checksums = Checksums::default();
        let options_ratio = global.data.options().ratio_of_defaults_for_sparse;
        let meta = {
            let new_part = global.new_part.as_ref().expect("new part state");
            let mut meta = PartMeta {
                rows_count: written.rows,
                ttl: new_part.ttl.clone(),
                minmax: new_part.minmax.clone(),
                granules: written.granules.clone(),
                merged_source_parts: new_part.merged_source_parts.clone(),
                expired_columns: new_part.expired_columns.clone(),
                vector_indices: new_part.vector_indices.clone(),
                projections: new_part.projections.clone(),
                ..PartMeta::default()
            };
            let mut serialization = BTreeMap::new();
            for name in &global.all_column_names {
                let Some(column) = by_name.get(name) else {
                    continue;
                };
                meta.columns.push((name.clone(), column.column_type.clone()));
                meta.column_sizes.insert(name.clone(), column.size);
                checksums.add_file(&column.file_name, column.checksum);
                let info = new_part
                    .serialization
                    .get(name)
                    .copied()
                    .unwrap_or(column.serialization);
                serialization.insert(name.clone(), info);
            }
            meta.serialization = serialization_table(&serialization, options_ratio);
            meta
        };
        checksums.add(global.checksums_gathered_columns.clone());

        let storage = global.new_part().storage.clone();
        seal_part(storage.as_ref(), &meta, checksums, self.ctx.need_sync)?;

        if global.can_be_decouple {
            self.finalize_decoupled_indexes(global)?;
        } else if global.only_one_vpart_merged {
            self.finalize_single_vpart(global)?;
        }

        storage.precommit()?;
        merge_log!(
            Level::Debug,
            "merge_precommitted",
            "dir={} rows={}",
            global.new_part().dir_name,
            written.rows,
        );
        let part = Arc::new(DataPart::load(storage.path().to_path_buf())?);
        if let Some(promise) = global.promise.take() {
            let _ = promise.send(part);
        }
        Ok(false)
    }

    /// Moves every source's index files in, copies the rows-sources trail
    /// and the row-id maps into the part, and writes per-index checksums.
    fn finalize_decoupled_indexes(&mut self, global: &mut GlobalContext) -> Result<(), MergeError> {
        let schema = global.schema.clone();
        let parts = global.future_part.parts.clone();
        let storage = global.new_part().storage.clone();

        let mut checksums_per_index: HashMap<String, Checksums> = HashMap::new();
        for description in schema.vector_indices() {
            if !global
                .all_parts_have_vector_index
                .get(&description.name)
                .copied()
                .unwrap_or(false)
            {
                continue;
            }
            for (idx, old_part) in parts.iter().enumerate() {
                if old_part.is_empty() {
                    continue;
                }
                let moved = vector::move_index_files(
                    true,
                    idx as u32,
                    &old_part.name(),
                    &description.name,
                    old_part,
                    storage.as_ref(),
                )?;
                checksums_per_index
                    .entry(description.name.clone())
                    .or_default()
                    .add(moved);
            }
        }

        // The rows-sources trail becomes part of the decoupled part.
        let sources_map_file = format!("merged-inverted_row_sources_map{VECTOR_INDEX_FILE_SUFFIX}");
        {
            let file = global.rows_sources_file.as_mut().ok_or_else(|| {
                MergeError::Logical("decoupled merge lost its rows-sources file".to_string())
            })?;
            let mut reader = file.reader()?.into_compressed();
            let mut writer = CompressedWriter::new(storage.write_file(&sources_map_file)?);
            copy_all(&mut reader, &mut writer)?;
            writer.finalize()?;
            // The scratch file was kept through the merge; drop it now.
            file.remove_kept()?;
        }

        let inverted_map_file = global
            .inverted_row_ids_map_file
            .clone()
            .ok_or_else(|| MergeError::Logical("inverted row-ids map missing".to_string()))?;
        let mut map_files = vec![sources_map_file, inverted_map_file];
        for (idx, part) in parts.iter().enumerate() {
            if part.is_empty() {
                continue;
            }
            map_files.push(global.row_ids_map_files[idx].clone());
        }
        let mut map_checksums = Vec::with_capacity(map_files.len());
        for file_name in &map_files {
            map_checksums.push((
                file_name.clone(),
                vector::storage_file_checksum(storage.as_ref(), file_name)?,
            ));
        }

        let mut decoupled_indexes = Vec::new();
        for (index_name, mut index_checksums) in checksums_per_index {
            for (file_name, checksum) in &map_checksums {
                index_checksums.add_file(file_name, *checksum);
            }
            vector::dump_checksums(storage.as_ref(), &index_name, &index_checksums, true)?;
            decoupled_indexes.push(index_name);
        }

        // Prime the decouple cache so the first search skips the map read.
        let new_part_name = global.new_part().name.clone();
        for index_name in &decoupled_indexes {
            for (idx, part) in parts.iter().enumerate() {
                if part.is_empty() {
                    continue;
                }
                vector::load_decouple_cache(
                    &global.data,
                    &new_part_name,
                    index_name,
                    storage.as_ref(),
                    &global.row_ids_map_files[idx],
                    idx as u32,
                )?;
            }
        }
        Ok(())
    }

    /// One indexed source, no lightweight deletes: the index files move over
    /// unchanged and the part stays a plain indexed part.
    fn finalize_single_vpart(&mut self, global: &mut GlobalContext) -> Result<(), MergeError> {
        let schema = global.schema.clone();
        let storage = global.new_part().storage.clone();
        let old_part = global
            .future_part
            .parts
            .get(global.first_part_with_data as usize)
            .ok_or_else(|| {
                MergeError::Logical("single-vpart merge lost its source part".to_string())
            })?
            .clone();

        for description in schema.vector_indices() {
            if !global
                .all_parts_have_vector_index
                .get(&description.name)
                .copied()
                .unwrap_or(false)
            {
                continue;
            }
            let checksums = vector::move_index_files(
                false,
                0,
                &old_part.name(),
                &description.name,
                &old_part,
                storage.as_ref(),
            )?;
            vector::dump_checksums(storage.as_ref(), &description.name, &checksums, false)?;
        }
        Ok(())
    }
}
