//! The part-merge engine: merge modes, algorithm choice, transforms and the
//! staged merge task.

pub(crate) mod error;
pub(crate) mod gather;
pub(crate) mod progress;
pub(crate) mod row_id_map;
pub(crate) mod rows_source;
pub(crate) mod size;
pub(crate) mod task;
pub(crate) mod transform;

pub use error::MergeError;
pub use progress::{ActionBlocker, ActionLock, MergeProgress, MergeProgressSnapshot, Reservation};
pub use rows_source::RowSource;
pub use task::{MergeResultFuture, MergeTask, MergeTaskParams};
pub use transform::graphite::{
    GraphiteAggregation, GraphiteParams, GraphitePattern, GraphiteRetention,
};

use crate::{
    option::MergeTreeOptions,
    part::{FuturePart, PartType, StorageType},
};

/// Row-reduction semantics applied within equal-key groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    Ordinary,
    Collapsing,
    Replacing,
    Summing,
    Aggregating,
    VersionedCollapsing,
    Graphite,
}

/// How an aggregate state column combines across an equal-key group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFunction {
    Sum,
    Count,
    Min,
    Max,
    Last,
}

/// One aggregate state column of an Aggregating table.
#[derive(Debug, Clone)]
pub struct AggregateDescription {
    pub column: String,
    pub function: AggregateFunction,
}

/// Mode plus the mode-specific columns it needs.
#[derive(Debug, Clone)]
pub struct MergingParams {
    pub mode: MergeMode,
    pub sign_column: String,
    pub version_column: String,
    pub is_deleted_column: String,
    /// Empty means every numeric non-key column.
    pub columns_to_sum: Vec<String>,
    pub aggregates: Vec<AggregateDescription>,
    pub graphite: Option<GraphiteParams>,
}

impl MergingParams {
    pub fn new(mode: MergeMode) -> Self {
        Self {
            mode,
            sign_column: String::new(),
            version_column: String::new(),
            is_deleted_column: String::new(),
            columns_to_sum: Vec::new(),
            aggregates: Vec::new(),
            graphite: None,
        }
    }

    pub fn collapsing(sign_column: impl Into<String>) -> Self {
        Self {
            sign_column: sign_column.into(),
            ..Self::new(MergeMode::Collapsing)
        }
    }

    pub fn replacing(version_column: impl Into<String>) -> Self {
        Self {
            version_column: version_column.into(),
            ..Self::new(MergeMode::Replacing)
        }
    }

    pub fn replacing_with_is_deleted(
        version_column: impl Into<String>,
        is_deleted_column: impl Into<String>,
    ) -> Self {
        Self {
            version_column: version_column.into(),
            is_deleted_column: is_deleted_column.into(),
            ..Self::new(MergeMode::Replacing)
        }
    }

    pub fn summing(columns_to_sum: Vec<String>) -> Self {
        Self {
            columns_to_sum,
            ..Self::new(MergeMode::Summing)
        }
    }

    pub fn aggregating(aggregates: Vec<AggregateDescription>) -> Self {
        Self {
            aggregates,
            ..Self::new(MergeMode::Aggregating)
        }
    }

    pub fn versioned_collapsing(
        sign_column: impl Into<String>,
        version_column: impl Into<String>,
    ) -> Self {
        Self {
            sign_column: sign_column.into(),
            version_column: version_column.into(),
            ..Self::new(MergeMode::VersionedCollapsing)
        }
    }

    pub fn graphite(params: GraphiteParams) -> Self {
        Self {
            graphite: Some(params),
            ..Self::new(MergeMode::Graphite)
        }
    }

    /// Columns the mode forces into the merging set.
    pub(crate) fn mode_required_columns(&self) -> Vec<String> {
        let mut columns = Vec::new();
        match self.mode {
            MergeMode::Collapsing => columns.push(self.sign_column.clone()),
            MergeMode::Replacing => {
                if !self.is_deleted_column.is_empty() {
                    columns.push(self.is_deleted_column.clone());
                }
                if !self.version_column.is_empty() {
                    columns.push(self.version_column.clone());
                }
            }
            // Version is expected in the sort key already.
            MergeMode::VersionedCollapsing => columns.push(self.sign_column.clone()),
            _ => {}
        }
        columns.retain(|column| !column.is_empty());
        columns
    }

    /// Modes that emit the rows-sources stream.
    pub(crate) fn writes_rows_sources(&self) -> bool {
        matches!(
            self.mode,
            MergeMode::Ordinary
                | MergeMode::Collapsing
                | MergeMode::Replacing
                | MergeMode::VersionedCollapsing
        )
    }
}

/// The two ways of materializing a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAlgorithm {
    /// All columns flow through the key merge in one pass.
    Horizontal,
    /// Key columns first; the rest gathered per column from the
    /// rows-sources trail.
    Vertical,
}

impl std::fmt::Display for MergeAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeAlgorithm::Horizontal => f.write_str("Horizontal"),
            MergeAlgorithm::Vertical => f.write_str("Vertical"),
        }
    }
}

/// Picks the merge algorithm from input statistics and settings. The choice
/// is recorded once; the only later change allowed is a downgrade to
/// Horizontal.
pub(crate) fn choose_merge_algorithm(
    future_part: &FuturePart,
    params: &MergingParams,
    options: &MergeTreeOptions,
    gathering_columns: usize,
    sum_rows_upper_bound: u64,
    deduplicate: bool,
    need_remove_expired_values: bool,
) -> MergeAlgorithm {
    if deduplicate {
        return MergeAlgorithm::Horizontal;
    }
    if !options.enable_vertical_merge {
        return MergeAlgorithm::Horizontal;
    }
    if need_remove_expired_values {
        return MergeAlgorithm::Horizontal;
    }
    if future_part.part_type != PartType::Wide {
        return MergeAlgorithm::Horizontal;
    }
    if future_part.storage_type != StorageType::Full {
        return MergeAlgorithm::Horizontal;
    }
    if !options.allow_vertical_merges_from_compact_to_wide_parts
        && future_part
            .parts
            .iter()
            .any(|part| part.part_type() != PartType::Wide)
    {
        return MergeAlgorithm::Horizontal;
    }

    let supported_mode = params.writes_rows_sources();
    let enough_ordinary_columns = gathering_columns >= options.vertical_merge_min_columns;
    let enough_total_rows = sum_rows_upper_bound >= options.vertical_merge_min_rows;
    let no_parts_overflow = future_part.parts.len() <= RowSource::MAX_PARTS;

    if supported_mode && enough_ordinary_columns && enough_total_rows && no_parts_overflow {
        MergeAlgorithm::Vertical
    } else {
        MergeAlgorithm::Horizontal
    }
}
