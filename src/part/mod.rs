//! Immutable data parts and the handles that describe merges over them.

pub(crate) mod meta;
pub(crate) mod reader;
pub(crate) mod storage;
pub(crate) mod writer;

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use meta::{
    Checksums, ColumnSize, ColumnType, DeleteBitmap, MergedSourcePart, MinMaxIndex, PartMeta,
    SerializationInfo, SerializationKind, TtlInfos, TtlRange, VectorIndexState,
};
pub use reader::{ReadOptions, SequentialPartReader, PART_OFFSET_COLUMN};
pub use storage::{LocalPartStorage, PartStorage};
pub use writer::{GatheredColumnWriter, MergedPartWriter, PartBuilder};

use crate::schema::TableSchema;

/// File names shared by every part layout.
pub(crate) const META_FILE: &str = "meta.json";
pub(crate) const CHECKSUMS_FILE: &str = "checksums.json";
pub(crate) const COUNT_FILE: &str = "count.txt";
pub(crate) const DELETE_BITMAP_FILE: &str = "deleted_rows.bitmap";
pub(crate) const COMPACT_DATA_FILE: &str = "data.parquet";
/// Suffix of vector-index artifact files and the merged row-id maps.
pub const VECTOR_INDEX_FILE_SUFFIX: &str = ".vidx";
/// Suffix of projection sub-part directories.
pub(crate) const PROJECTION_DIR_SUFFIX: &str = ".proj";
/// Directory prefix of in-progress merge outputs.
pub const TMP_MERGE_PREFIX: &str = "tmp_merge_";

/// Errors raised by part metadata, layout and payload handling.
#[derive(Debug, Error)]
pub enum PartError {
    #[error("part io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("part metadata error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("part payload error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("part arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),
    #[error("directory {0} already exists")]
    DirectoryAlreadyExists(String),
    #[error("column type {0} is not supported by the part layout")]
    UnsupportedColumnType(String),
    #[error("column {0} is missing from the part")]
    MissingColumn(String),
    #[error("part file {0} is missing")]
    MissingFile(String),
    #[error("{0} is not a valid part name")]
    InvalidPartName(String),
    #[error("merge inputs are not ordered by part info")]
    UnorderedInputs,
}

/// Physical layout of a part: one file per column, or one packed file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartType {
    Wide,
    Compact,
}

/// Where the part's files live. Vertical merge requires `Full` local storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    Full,
    Shared,
}

/// Why a merge was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeType {
    Regular,
    TtlDelete,
    TtlRecompress,
}

impl MergeType {
    pub fn is_ttl(&self) -> bool {
        matches!(self, MergeType::TtlDelete | MergeType::TtlRecompress)
    }
}

/// Block range identity of a part: `{partition}_{min}_{max}_{level}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartInfo {
    pub partition_id: String,
    pub min_block: i64,
    pub max_block: i64,
    pub level: u32,
}

impl PartInfo {
    pub fn new(partition_id: impl Into<String>, min_block: i64, max_block: i64, level: u32) -> Self {
        Self {
            partition_id: partition_id.into(),
            min_block,
            max_block,
            level,
        }
    }

    pub fn name(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.partition_id, self.min_block, self.max_block, self.level
        )
    }

    pub fn parse(name: &str) -> Result<Self, PartError> {
        let pieces: Vec<&str> = name.rsplitn(4, '_').collect();
        if pieces.len() != 4 {
            return Err(PartError::InvalidPartName(name.to_string()));
        }
        let level = pieces[0]
            .parse()
            .map_err(|_| PartError::InvalidPartName(name.to_string()))?;
        let max_block = pieces[1]
            .parse()
            .map_err(|_| PartError::InvalidPartName(name.to_string()))?;
        let min_block = pieces[2]
            .parse()
            .map_err(|_| PartError::InvalidPartName(name.to_string()))?;
        Ok(Self {
            partition_id: pieces[3].to_string(),
            min_block,
            max_block,
            level,
        })
    }
}

impl fmt::Display for PartInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// An immutable, sorted, self-contained slice of a table.
#[derive(Debug)]
pub struct DataPart {
    info: PartInfo,
    dir: PathBuf,
    meta: PartMeta,
    delete_bitmap: Option<DeleteBitmap>,
}

impl DataPart {
    /// Loads a part from its directory; the directory name is the part name.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, PartError> {
        let dir = dir.into();
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PartError::InvalidPartName(dir.display().to_string()))?
            .to_string();
        // Projection sub-parts are named `<projection>.proj` and carry a
        // synthetic full-range info; in-progress merge outputs still wear
        // the temporary prefix.
        let trimmed = name.strip_prefix(TMP_MERGE_PREFIX).unwrap_or(&name);
        let info = if let Some(projection) = trimmed.strip_suffix(PROJECTION_DIR_SUFFIX) {
            PartInfo::new(projection, 0, 0, 0)
        } else {
            PartInfo::parse(trimmed)?
        };

        let meta_path = dir.join(META_FILE);
        let meta: PartMeta = serde_json::from_reader(std::fs::File::open(&meta_path)?)?;

        let bitmap_path = dir.join(DELETE_BITMAP_FILE);
        let delete_bitmap = if bitmap_path.exists() {
            Some(serde_json::from_reader(std::fs::File::open(&bitmap_path)?)?)
        } else {
            None
        };

        Ok(Self {
            info,
            dir,
            meta,
            delete_bitmap,
        })
    }

    pub fn info(&self) -> &PartInfo {
        &self.info
    }

    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.to_string())
            .unwrap_or_else(|| self.info.name())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta(&self) -> &PartMeta {
        &self.meta
    }

    pub fn rows_count(&self) -> u64 {
        self.meta.rows_count
    }

    pub fn is_empty(&self) -> bool {
        self.meta.rows_count == 0
    }

    pub fn part_type(&self) -> PartType {
        if self.dir.join(COMPACT_DATA_FILE).exists() {
            PartType::Compact
        } else {
            PartType::Wide
        }
    }

    pub fn bytes_on_disk(&self) -> u64 {
        self.meta
            .column_sizes
            .values()
            .map(|size| size.compressed)
            .sum()
    }

    pub fn column_size(&self, column: &str) -> ColumnSize {
        self.meta
            .column_sizes
            .get(column)
            .copied()
            .unwrap_or_default()
    }

    pub fn accumulate_column_sizes(&self, sizes: &mut HashMap<String, u64>) {
        for (column, size) in &self.meta.column_sizes {
            *sizes.entry(column.clone()).or_default() += size.compressed;
        }
    }

    pub fn column_names(&self) -> Vec<String> {
        self.meta
            .columns
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn delete_bitmap(&self) -> Option<&DeleteBitmap> {
        self.delete_bitmap.as_ref()
    }

    pub fn has_lightweight_delete(&self) -> bool {
        self.delete_bitmap
            .as_ref()
            .map(|bitmap| !bitmap.is_empty())
            .unwrap_or(false)
    }

    pub fn vector_index_state(&self, index: &str) -> VectorIndexState {
        self.meta
            .vector_indices
            .get(index)
            .copied()
            .unwrap_or_default()
    }

    /// Loads the named projection sub-part, if present.
    pub fn projection_part(&self, projection: &str) -> Option<DataPart> {
        let dir = self
            .dir
            .join(format!("{projection}{PROJECTION_DIR_SUFFIX}"));
        if dir.join(META_FILE).exists() {
            DataPart::load(dir).ok()
        } else {
            None
        }
    }

    /// True when every TTL rule of `schema` has a computed watermark here.
    pub fn all_ttl_calculated(&self, schema: &TableSchema) -> bool {
        if schema.row_ttl().is_some() && self.meta.ttl.part.is_none() {
            return false;
        }
        schema
            .column_ttls()
            .iter()
            .all(|ttl| self.meta.ttl.columns.contains_key(&ttl.target_column))
    }
}

/// A handle naming the merge output before it exists.
#[derive(Debug, Clone)]
pub struct FuturePart {
    pub name: String,
    pub part_info: PartInfo,
    pub part_type: PartType,
    pub storage_type: StorageType,
    pub parts: Vec<Arc<DataPart>>,
    pub merge_type: MergeType,
}

impl FuturePart {
    /// Names the merge of `parts`, which must be non-overlapping and ordered
    /// by part info.
    pub fn assign(
        parts: Vec<Arc<DataPart>>,
        part_type: PartType,
        storage_type: StorageType,
        merge_type: MergeType,
    ) -> Result<Self, PartError> {
        assert!(!parts.is_empty(), "future part requires at least one input");
        for pair in parts.windows(2) {
            if pair[0].info() >= pair[1].info() {
                return Err(PartError::UnorderedInputs);
            }
        }
        let part_info = PartInfo::new(
            parts[0].info().partition_id.clone(),
            parts[0].info().min_block,
            parts[parts.len() - 1].info().max_block,
            parts.iter().map(|p| p.info().level).max().unwrap_or(0) + 1,
        );
        Ok(Self {
            name: part_info.name(),
            part_info,
            part_type,
            storage_type,
            parts,
            merge_type,
        })
    }

    pub fn total_rows(&self) -> u64 {
        self.parts.iter().map(|p| p.rows_count()).sum()
    }

    pub fn total_bytes_on_disk(&self) -> u64 {
        self.parts.iter().map(|p| p.bytes_on_disk()).sum()
    }
}
