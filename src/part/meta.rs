//! Serialized part metadata: columns, sizes, serialization infos, TTL infos,
//! min-max index, checksums and the lightweight-delete bitmap.

use std::{
    collections::{BTreeMap, BTreeSet},
    io::{Read, Write},
};

use arrow_schema::DataType;
use serde::{Deserialize, Serialize};

use crate::{block::Value, io::FileChecksum, part::PartError};

/// Storable mirror of the supported arrow column types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Utf8,
    Binary,
    List(Box<ColumnType>),
}

impl ColumnType {
    pub fn from_arrow(data_type: &DataType) -> Result<Self, PartError> {
        Ok(match data_type {
            DataType::Int8 => ColumnType::Int8,
            DataType::Int16 => ColumnType::Int16,
            DataType::Int32 => ColumnType::Int32,
            DataType::Int64 => ColumnType::Int64,
            DataType::UInt8 => ColumnType::UInt8,
            DataType::UInt16 => ColumnType::UInt16,
            DataType::UInt32 => ColumnType::UInt32,
            DataType::UInt64 => ColumnType::UInt64,
            DataType::Float32 => ColumnType::Float32,
            DataType::Float64 => ColumnType::Float64,
            DataType::Utf8 => ColumnType::Utf8,
            DataType::Binary => ColumnType::Binary,
            DataType::List(field) => {
                ColumnType::List(Box::new(ColumnType::from_arrow(field.data_type())?))
            }
            other => return Err(PartError::UnsupportedColumnType(other.to_string())),
        })
    }

    pub fn to_arrow(&self) -> DataType {
        match self {
            ColumnType::Int8 => DataType::Int8,
            ColumnType::Int16 => DataType::Int16,
            ColumnType::Int32 => DataType::Int32,
            ColumnType::Int64 => DataType::Int64,
            ColumnType::UInt8 => DataType::UInt8,
            ColumnType::UInt16 => DataType::UInt16,
            ColumnType::UInt32 => DataType::UInt32,
            ColumnType::UInt64 => DataType::UInt64,
            ColumnType::Float32 => DataType::Float32,
            ColumnType::Float64 => DataType::Float64,
            ColumnType::Utf8 => DataType::Utf8,
            ColumnType::Binary => DataType::Binary,
            ColumnType::List(element) => DataType::List(std::sync::Arc::new(
                arrow_schema::Field::new_list_field(element.to_arrow(), true),
            )),
        }
    }
}

/// Per-column byte sizes accumulated at write time.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ColumnSize {
    pub compressed: u64,
    pub uncompressed: u64,
}

impl ColumnSize {
    pub fn add(&mut self, other: &ColumnSize) {
        self.compressed += other.compressed;
        self.uncompressed += other.uncompressed;
    }
}

/// Serialization kind chosen from the default-value ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerializationKind {
    Full,
    Sparse,
}

/// Default-value statistics for one column, folded across source parts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SerializationInfo {
    pub num_rows: u64,
    pub num_defaults: u64,
}

impl SerializationInfo {
    pub fn add(&mut self, other: &SerializationInfo) {
        self.num_rows += other.num_rows;
        self.num_defaults += other.num_defaults;
    }

    /// Accounts `rows` implicit default values (column absent from a part).
    pub fn add_defaults(&mut self, rows: u64) {
        self.num_rows += rows;
        self.num_defaults += rows;
    }

    pub fn kind(&self, ratio_for_sparse: f64) -> SerializationKind {
        if self.num_rows > 0 && self.num_defaults as f64 / self.num_rows as f64 >= ratio_for_sparse
        {
            SerializationKind::Sparse
        } else {
            SerializationKind::Full
        }
    }
}

/// TTL watermark for one column or the whole part.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TtlRange {
    pub min: i64,
    pub max: i64,
}

impl TtlRange {
    pub fn update(&mut self, other: &TtlRange) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Every row's clock has run out.
    pub fn finished(&self, now: i64) -> bool {
        self.max <= now
    }
}

/// Per-part TTL metadata, folded across sources during merge preparation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtlInfos {
    pub part: Option<TtlRange>,
    pub columns: BTreeMap<String, TtlRange>,
}

impl TtlInfos {
    pub fn update(&mut self, other: &TtlInfos) {
        if let Some(other_part) = &other.part {
            match &mut self.part {
                Some(part) => part.update(other_part),
                None => self.part = Some(*other_part),
            }
        }
        for (column, range) in &other.columns {
            match self.columns.get_mut(column) {
                Some(existing) => existing.update(range),
                None => {
                    self.columns.insert(column.clone(), *range);
                }
            }
        }
    }

    pub fn part_min_ttl(&self) -> Option<i64> {
        self.part.map(|range| range.min)
    }
}

/// Min/max of one column over the whole part.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinMaxColumn {
    pub column: String,
    pub min: Value,
    pub max: Value,
}

/// Part-level min-max index, merged across sources at finalize.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MinMaxIndex {
    pub columns: Vec<MinMaxColumn>,
}

impl MinMaxIndex {
    pub fn merge(&mut self, other: &MinMaxIndex) {
        for incoming in &other.columns {
            match self
                .columns
                .iter_mut()
                .find(|existing| existing.column == incoming.column)
            {
                Some(existing) => {
                    if incoming.min < existing.min {
                        existing.min = incoming.min.clone();
                    }
                    if incoming.max > existing.max {
                        existing.max = incoming.max.clone();
                    }
                }
                None => self.columns.push(incoming.clone()),
            }
        }
    }

    pub fn update_row(&mut self, column: &str, value: &Value) {
        if matches!(value, Value::Null) {
            return;
        }
        match self
            .columns
            .iter_mut()
            .find(|existing| existing.column == column)
        {
            Some(existing) => {
                if *value < existing.min {
                    existing.min = value.clone();
                }
                if *value > existing.max {
                    existing.max = value.clone();
                }
            }
            None => self.columns.push(MinMaxColumn {
                column: column.to_string(),
                min: value.clone(),
                max: value.clone(),
            }),
        }
    }
}

/// One source part recorded in the merged part's metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedSourcePart {
    pub name: String,
    pub id: u32,
    pub non_empty: bool,
}

/// Build state of one vector index inside a part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VectorIndexState {
    #[default]
    Absent,
    Pending,
    Built,
}

/// Checksum manifest for a set of part files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checksums {
    pub files: BTreeMap<String, FileChecksum>,
}

impl Checksums {
    pub fn add_file(&mut self, name: impl Into<String>, checksum: FileChecksum) {
        self.files.insert(name.into(), checksum);
    }

    pub fn add(&mut self, other: Checksums) {
        self.files.extend(other.files);
    }

    pub fn write_to(&self, writer: &mut dyn Write) -> Result<(), PartError> {
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn read_from(reader: &mut dyn Read) -> Result<Self, PartError> {
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Lightweight-delete bitmap: row offsets masked out of a part.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteBitmap {
    deleted: BTreeSet<u64>,
}

impl DeleteBitmap {
    pub fn from_rows(rows: impl IntoIterator<Item = u64>) -> Self {
        Self {
            deleted: rows.into_iter().collect(),
        }
    }

    pub fn contains(&self, row: u64) -> bool {
        self.deleted.contains(&row)
    }

    pub fn insert(&mut self, row: u64) {
        self.deleted.insert(row);
    }

    pub fn extend(&mut self, rows: impl IntoIterator<Item = u64>) {
        self.deleted.extend(rows);
    }

    pub fn len(&self) -> usize {
        self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deleted.is_empty()
    }
}

/// Everything `meta.json` records about a part.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartMeta {
    pub rows_count: u64,
    pub columns: Vec<(String, ColumnType)>,
    pub column_sizes: BTreeMap<String, ColumnSize>,
    pub serialization: BTreeMap<String, (SerializationInfo, SerializationKind)>,
    pub ttl: TtlInfos,
    pub minmax: MinMaxIndex,
    /// Output block row counts when blocks-are-granules was in effect.
    pub granules: Vec<u64>,
    pub merged_source_parts: Vec<MergedSourcePart>,
    pub expired_columns: Vec<String>,
    pub vector_indices: BTreeMap<String, VectorIndexState>,
    /// Names of projection sub-parts attached under this part.
    pub projections: Vec<String>,
}
