//! The staged merge task and its step driver.
//!
//! One merge runs as three stages — horizontal, vertical, projections — each
//! a fixed table of subtasks. An external worker drives the task by calling
//! [`MergeTask::execute`] until it returns `false`; every `true` return is a
//! cooperative yield point. At a stage boundary only a small carry struct
//! moves forward; the global context stays owned by the task.

pub(crate) mod horizontal;
pub(crate) mod projections;
pub(crate) mod vertical;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{atomic::AtomicU64, Arc},
};

use crate::{
    merge::{
        error::MergeError,
        progress::{ActionBlocker, MergeProgress, Reservation},
        rows_source::RowsSourcesFile,
        transform::MergedStream,
        MergeAlgorithm, MergingParams,
    },
    part::{
        writer::WrittenColumn, Checksums, DataPart, FuturePart, MergedPartWriter, MergedSourcePart,
        MinMaxIndex, PartStorage, SerializationInfo, TtlInfos, VectorIndexState,
    },
    schema::TableSchema,
    table::{TableData, TempDirLock},
};

pub(crate) use horizontal::HorizontalStage;
pub(crate) use projections::ProjectionsStage;
pub(crate) use vertical::VerticalStage;

pub(crate) use crate::part::TMP_MERGE_PREFIX;

/// Parent-part hookup for projection sub-merges.
pub(crate) struct ParentPart {
    pub storage: Arc<dyn PartStorage>,
    pub suffix: String,
}

/// Single-shot future yielding the finished part.
pub type MergeResultFuture = flume::Receiver<Arc<DataPart>>;

/// Constructor arguments of a merge task.
pub struct MergeTaskParams {
    pub data: Arc<TableData>,
    pub future_part: Arc<FuturePart>,
    pub progress: Arc<MergeProgress>,
    pub merges_blocker: Arc<ActionBlocker>,
    pub ttl_merges_blocker: Arc<ActionBlocker>,
    pub space_reservation: Option<Arc<Reservation>>,
    pub deduplicate: bool,
    pub deduplicate_by_columns: Vec<String>,
    pub cleanup: bool,
    /// `None` uses the table's merging params; projections override.
    pub merging_params: Option<MergingParams>,
    /// `None` uses the table's schema; projections override.
    pub schema: Option<Arc<TableSchema>>,
    pub time_of_merge: i64,
    pub need_prefix: bool,
}

/// The mutable state shared by all three stages.
pub(crate) struct GlobalContext {
    pub data: Arc<TableData>,
    pub schema: Arc<TableSchema>,
    pub future_part: Arc<FuturePart>,
    pub progress: Arc<MergeProgress>,
    pub merges_blocker: Arc<ActionBlocker>,
    pub ttl_merges_blocker: Arc<ActionBlocker>,
    pub space_reservation: Option<Arc<Reservation>>,
    pub deduplicate: bool,
    pub deduplicate_by_columns: Vec<String>,
    pub cleanup: bool,
    pub merging_params: MergingParams,
    pub time_of_merge: i64,
    pub need_prefix: bool,
    pub parent: Option<ParentPart>,
    pub promise: Option<flume::Sender<Arc<DataPart>>>,

    pub new_part: Option<NewPartState>,
    pub all_column_names: Vec<String>,
    pub merging_column_names: Vec<String>,
    pub gathering_column_names: Vec<String>,
    pub chosen_merge_algorithm: Option<MergeAlgorithm>,
    pub rows_written: u64,
    pub input_rows_filtered: Arc<AtomicU64>,
    pub merged_stream: Option<MergedStream>,
    pub merged_stream_header: Option<arrow_schema::SchemaRef>,
    pub to: Option<MergedPartWriter>,
    pub gathered_columns: Vec<WrittenColumn>,
    pub checksums_gathered_columns: Checksums,

    pub can_be_decouple: bool,
    pub only_one_vpart_merged: bool,
    pub first_part_with_data: i64,
    pub all_parts_have_vector_index: HashMap<String, bool>,
    pub inverted_row_ids_map_file: Option<String>,
    pub row_ids_map_files: Vec<String>,
    pub rows_sources_file: Option<RowsSourcesFile>,
    /// Held for the lifetime of the task; releases the claimed tmp name.
    #[allow(unused)]
    pub temporary_directory_lock: Option<TempDirLock>,
}

impl GlobalContext {
    /// Composite cancellation poll: global blocker, TTL blocker when TTL
    /// rows are being removed, and the per-task flag.
    pub(crate) fn merge_cancelled(&self, need_remove_expired_values: bool) -> bool {
        self.merges_blocker.is_cancelled()
            || (need_remove_expired_values && self.ttl_merges_blocker.is_cancelled())
            || self.progress.is_cancelled()
    }

    pub(crate) fn new_part(&self) -> &NewPartState {
        self.new_part.as_ref().expect("new part not prepared")
    }

    pub(crate) fn new_part_mut(&mut self) -> &mut NewPartState {
        self.new_part.as_mut().expect("new part not prepared")
    }
}

/// The merge output while it is being built.
pub(crate) struct NewPartState {
    pub name: String,
    pub dir_name: String,
    pub storage: Arc<dyn PartStorage>,
    pub ttl: TtlInfos,
    pub serialization: BTreeMap<String, SerializationInfo>,
    pub expired_columns: Vec<String>,
    pub merged_source_parts: Vec<MergedSourcePart>,
    pub minmax: MinMaxIndex,
    pub vector_indices: BTreeMap<String, VectorIndexState>,
    pub projections: Vec<String>,
}

enum Stage {
    Horizontal(HorizontalStage),
    Vertical(VerticalStage),
    Projections(ProjectionsStage),
    Done,
}

/// A single part merge, drivable step by step.
pub struct MergeTask {
    global: GlobalContext,
    stage: Stage,
    result: flume::Receiver<Arc<DataPart>>,
}

impl MergeTask {
    pub fn new(params: MergeTaskParams) -> Self {
        let (promise, result) = flume::bounded(1);
        let schema = params
            .schema
            .unwrap_or_else(|| params.data.schema().clone());
        let merging_params = params
            .merging_params
            .unwrap_or_else(|| params.data.merging_params().clone());
        let global = GlobalContext {
            data: params.data,
            schema,
            future_part: params.future_part,
            progress: params.progress,
            merges_blocker: params.merges_blocker,
            ttl_merges_blocker: params.ttl_merges_blocker,
            space_reservation: params.space_reservation,
            deduplicate: params.deduplicate,
            deduplicate_by_columns: params.deduplicate_by_columns,
            cleanup: params.cleanup,
            merging_params,
            time_of_merge: params.time_of_merge,
            need_prefix: params.need_prefix,
            parent: None,
            promise: Some(promise),
            new_part: None,
            all_column_names: Vec::new(),
            merging_column_names: Vec::new(),
            gathering_column_names: Vec::new(),
            chosen_merge_algorithm: None,
            rows_written: 0,
            input_rows_filtered: Arc::new(AtomicU64::new(0)),
            merged_stream: None,
            merged_stream_header: None,
            to: None,
            gathered_columns: Vec::new(),
            checksums_gathered_columns: Checksums::default(),
            can_be_decouple: false,
            only_one_vpart_merged: false,
            first_part_with_data: -1,
            all_parts_have_vector_index: HashMap::new(),
            inverted_row_ids_map_file: None,
            row_ids_map_files: Vec::new(),
            rows_sources_file: None,
            temporary_directory_lock: None,
        };
        Self {
            global,
            stage: Stage::Horizontal(HorizontalStage::new()),
            result,
        }
    }

    pub(crate) fn new_projection_child(params: MergeTaskParams, parent: ParentPart) -> Self {
        let mut task = Self::new(params);
        task.global.parent = Some(parent);
        task
    }

    /// Single-shot future carrying the finished part.
    pub fn result_future(&self) -> MergeResultFuture {
        self.result.clone()
    }

    /// Advances one subtask. `true` means more work remains; call again.
    pub fn execute(&mut self) -> Result<bool, MergeError> {
        let more = match &mut self.stage {
            Stage::Horizontal(stage) => stage.execute(&mut self.global)?,
            Stage::Vertical(stage) => stage.execute(&mut self.global)?,
            Stage::Projections(stage) => stage.execute(&mut self.global)?,
            Stage::Done => return Ok(false),
        };
        if more {
            return Ok(true);
        }

        // Stage finished: install the next stage's runtime context.
        self.stage = match std::mem::replace(&mut self.stage, Stage::Done) {
            Stage::Horizontal(stage) => Stage::Vertical(VerticalStage::new(stage.into_carry())),
            Stage::Vertical(stage) => Stage::Projections(ProjectionsStage::new(stage.into_carry())),
            Stage::Projections(_) | Stage::Done => Stage::Done,
        };
        Ok(!matches!(self.stage, Stage::Done))
    }
}
