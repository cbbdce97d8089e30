//! Operating parameters for the merge engine.

use parquet::{
    basic::{Compression, ZstdLevel},
    file::properties::WriterProperties,
};

/// Policy for rows carrying an `is_deleted` flag in Replacing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanDeletedRows {
    /// Deleted survivors stay in the output unless the task asks for cleanup.
    #[default]
    Never,
    /// Deleted survivors are always dropped during merges.
    Always,
}

/// Configure the operating parameters of the merge engine.
#[derive(Debug, Clone)]
pub struct MergeTreeOptions {
    /// Upper bound on rows per merged output block.
    pub(crate) merge_block_size: usize,

    /// Master switch for the vertical merge algorithm.
    pub(crate) enable_vertical_merge: bool,

    /// Minimum number of gathering columns before vertical activates.
    pub(crate) vertical_merge_min_columns: usize,

    /// Minimum total input rows before vertical activates.
    pub(crate) vertical_merge_min_rows: u64,

    /// Allow vertical merges whose sources mix Compact parts into a Wide output.
    pub(crate) allow_vertical_merges_from_compact_to_wide_parts: bool,

    /// Input byte total above which part files are read with direct I/O. Zero disables.
    pub(crate) min_merge_bytes_to_use_direct_io: u64,

    /// Row count above which the finished part is fsynced. Zero disables.
    pub(crate) min_rows_to_fsync_after_merge: u64,

    /// Compressed byte total above which the finished part is fsynced. Zero disables.
    pub(crate) min_compressed_bytes_to_fsync_after_merge: u64,

    /// Cap on gathered-column writers kept open before the oldest is finalized.
    pub(crate) max_delayed_streams: usize,

    /// Reuse BUILT vector indexes from source parts via row-id maps.
    pub(crate) enable_decouple_vector_index: bool,

    /// Replacing-mode policy for deleted survivors.
    pub(crate) clean_deleted_rows: CleanDeletedRows,

    /// Share of default values above which a column serializes sparsely.
    pub(crate) ratio_of_defaults_for_sparse: f64,

    /// Parquet writer properties for part payload files.
    pub(crate) write_parquet_properties: WriterProperties,

    /// Parquet writer properties once a recompression TTL has fired.
    pub(crate) recompression_parquet_properties: WriterProperties,
}

impl Default for MergeTreeOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeTreeOptions {
    /// Default-configured options.
    pub fn new() -> Self {
        Self {
            merge_block_size: 8192,
            enable_vertical_merge: true,
            vertical_merge_min_columns: 11,
            vertical_merge_min_rows: 16 * 8192,
            allow_vertical_merges_from_compact_to_wide_parts: false,
            min_merge_bytes_to_use_direct_io: 10 * 1024 * 1024 * 1024,
            min_rows_to_fsync_after_merge: 0,
            min_compressed_bytes_to_fsync_after_merge: 0,
            max_delayed_streams: 1000,
            enable_decouple_vector_index: true,
            clean_deleted_rows: CleanDeletedRows::Never,
            ratio_of_defaults_for_sparse: 0.9375,
            write_parquet_properties: WriterProperties::builder()
                .set_compression(Compression::LZ4)
                .set_created_by(concat!("coppice version ", env!("CARGO_PKG_VERSION")).to_owned())
                .build(),
            recompression_parquet_properties: WriterProperties::builder()
                .set_compression(Compression::ZSTD(ZstdLevel::default()))
                .set_created_by(concat!("coppice version ", env!("CARGO_PKG_VERSION")).to_owned())
                .build(),
        }
    }

    /// Upper bound on rows per merged output block.
    pub fn with_merge_block_size(mut self, rows: usize) -> Self {
        self.merge_block_size = rows.max(1);
        self
    }

    /// Enable or disable the vertical merge algorithm.
    pub fn with_vertical_merge(mut self, enabled: bool) -> Self {
        self.enable_vertical_merge = enabled;
        self
    }

    /// Activation thresholds for the vertical algorithm.
    pub fn with_vertical_merge_thresholds(mut self, min_columns: usize, min_rows: u64) -> Self {
        self.vertical_merge_min_columns = min_columns;
        self.vertical_merge_min_rows = min_rows;
        self
    }

    /// Allow Compact source parts in a vertical merge to a Wide part.
    pub fn with_vertical_merges_from_compact_parts(mut self, allowed: bool) -> Self {
        self.allow_vertical_merges_from_compact_to_wide_parts = allowed;
        self
    }

    /// Input byte total above which sources are read with direct I/O.
    pub fn with_direct_io_threshold(mut self, bytes: u64) -> Self {
        self.min_merge_bytes_to_use_direct_io = bytes;
        self
    }

    /// Fsync thresholds for the finished part.
    pub fn with_fsync_thresholds(mut self, min_rows: u64, min_compressed_bytes: u64) -> Self {
        self.min_rows_to_fsync_after_merge = min_rows;
        self.min_compressed_bytes_to_fsync_after_merge = min_compressed_bytes;
        self
    }

    /// Cap on gathered-column writers kept open during a vertical merge.
    pub fn with_max_delayed_streams(mut self, cap: usize) -> Self {
        self.max_delayed_streams = cap;
        self
    }

    /// Reuse BUILT vector indexes from source parts via row-id maps.
    pub fn with_decouple_vector_index(mut self, enabled: bool) -> Self {
        self.enable_decouple_vector_index = enabled;
        self
    }

    /// Replacing-mode policy for deleted survivors.
    pub fn with_clean_deleted_rows(mut self, policy: CleanDeletedRows) -> Self {
        self.clean_deleted_rows = policy;
        self
    }

    /// Share of default values above which a column serializes sparsely.
    pub fn with_sparse_serialization_ratio(mut self, ratio: f64) -> Self {
        self.ratio_of_defaults_for_sparse = ratio;
        self
    }

    /// Parquet writer properties for part payload files.
    pub fn with_parquet_properties(mut self, properties: WriterProperties) -> Self {
        self.write_parquet_properties = properties;
        self
    }

    pub(crate) fn need_sync_part(&self, rows: u64, compressed_bytes: u64) -> bool {
        (self.min_rows_to_fsync_after_merge != 0 && rows >= self.min_rows_to_fsync_after_merge)
            || (self.min_compressed_bytes_to_fsync_after_merge != 0
                && compressed_bytes >= self.min_compressed_bytes_to_fsync_after_merge)
    }
}
