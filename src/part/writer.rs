//! Writers for merged parts.
//!
//! [`MergedPartWriter`] materializes the key-merge output (all columns for a
//! horizontal merge, key columns only for a vertical one);
//! [`GatheredColumnWriter`] appends one gathered column file at a time;
//! [`PartBuilder`] is the standalone flush-path writer used to create source
//! parts. All three share the per-column parquet plumbing and the part is
//! sealed once by [`seal_part`].

use std::{
    collections::BTreeMap,
    io::Write,
    path::PathBuf,
    sync::Arc,
};

use arrow_array::{ArrayRef, RecordBatch};
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use parquet::{arrow::ArrowWriter, file::properties::WriterProperties};

use super::{
    meta::{
        Checksums, ColumnSize, ColumnType, DeleteBitmap, MinMaxIndex, PartMeta, SerializationInfo,
        SerializationKind, TtlInfos, VectorIndexState,
    },
    storage::{LocalPartStorage, PartStorage},
    DataPart, PartError, PartType, CHECKSUMS_FILE, COMPACT_DATA_FILE, COUNT_FILE,
    DELETE_BITMAP_FILE, META_FILE, VECTOR_INDEX_FILE_SUFFIX,
};
use crate::io::{file_checksum, FileChecksum, HashWriter};

/// Stats for one finished column file.
#[derive(Debug, Clone)]
pub(crate) struct WrittenColumn {
    pub name: String,
    pub column_type: ColumnType,
    pub file_name: String,
    pub checksum: FileChecksum,
    pub size: ColumnSize,
    pub serialization: SerializationInfo,
}

/// Everything the key/column writers produced, ready for sealing.
#[derive(Debug, Default)]
pub(crate) struct WrittenData {
    pub columns: Vec<WrittenColumn>,
    pub rows: u64,
    pub granules: Vec<u64>,
    pub minmax: MinMaxIndex,
}

struct ColumnFileWriter {
    name: String,
    data_type: DataType,
    file_name: String,
    writer: Option<ArrowWriter<Box<dyn Write + Send>>>,
    schema: SchemaRef,
    uncompressed: u64,
    defaults: SerializationInfo,
}

impl ColumnFileWriter {
    fn new(
        storage: &dyn PartStorage,
        field: &Field,
        props: &WriterProperties,
    ) -> Result<Self, PartError> {
        let file_name = format!("{}.parquet", field.name());
        let schema = Arc::new(Schema::new(vec![field.clone()]));
        let writer = ArrowWriter::try_new(
            storage.write_file(&file_name)?,
            schema.clone(),
            Some(props.clone()),
        )?;
        Ok(Self {
            name: field.name().clone(),
            data_type: field.data_type().clone(),
            file_name,
            writer: Some(writer),
            schema,
            uncompressed: 0,
            defaults: SerializationInfo::default(),
        })
    }

    fn write(&mut self, column: &ArrayRef) -> Result<(), PartError> {
        self.uncompressed += column.get_array_memory_size() as u64;
        track_defaults(&mut self.defaults, column);
        let batch = RecordBatch::try_new(self.schema.clone(), vec![column.clone()])?;
        self.writer
            .as_mut()
            .expect("column writer already closed")
            .write(&batch)?;
        Ok(())
    }

    fn close(&mut self, storage: &dyn PartStorage) -> Result<WrittenColumn, PartError> {
        if let Some(writer) = self.writer.take() {
            let mut inner = writer.into_inner()?;
            inner.flush()?;
        }
        let checksum = file_checksum(&storage.path().join(&self.file_name))?;
        Ok(WrittenColumn {
            name: self.name.clone(),
            column_type: ColumnType::from_arrow(&self.data_type)?,
            file_name: self.file_name.clone(),
            checksum,
            size: ColumnSize {
                compressed: checksum.size,
                uncompressed: self.uncompressed,
            },
            serialization: self.defaults,
        })
    }
}

fn track_defaults(info: &mut SerializationInfo, column: &ArrayRef) {
    use crate::block::Value;
    info.num_rows += column.len() as u64;
    for idx in 0..column.len() {
        if Value::from_array(column.as_ref(), idx).is_default() {
            info.num_defaults += 1;
        }
    }
}

enum PayloadWriters {
    Wide(Vec<ColumnFileWriter>),
    Compact {
        writer: Option<ArrowWriter<Box<dyn Write + Send>>>,
        schema: SchemaRef,
        uncompressed: Vec<u64>,
        defaults: Vec<SerializationInfo>,
    },
}

/// Writes the merged block stream into the new part's payload files.
pub struct MergedPartWriter {
    storage: Arc<dyn PartStorage>,
    payload: PayloadWriters,
    minmax_columns: Vec<String>,
    blocks_are_granules: bool,
    written: WrittenData,
}

impl MergedPartWriter {
    pub(crate) fn new(
        storage: Arc<dyn PartStorage>,
        part_type: PartType,
        schema: SchemaRef,
        minmax_columns: Vec<String>,
        props: &WriterProperties,
        blocks_are_granules: bool,
    ) -> Result<Self, PartError> {
        let payload = match part_type {
            PartType::Wide => {
                let mut writers = Vec::with_capacity(schema.fields().len());
                for field in schema.fields() {
                    writers.push(ColumnFileWriter::new(storage.as_ref(), field, props)?);
                }
                PayloadWriters::Wide(writers)
            }
            PartType::Compact => {
                let writer = ArrowWriter::try_new(
                    storage.write_file(COMPACT_DATA_FILE)?,
                    schema.clone(),
                    Some(props.clone()),
                )?;
                let columns = schema.fields().len();
                PayloadWriters::Compact {
                    writer: Some(writer),
                    schema,
                    uncompressed: vec![0; columns],
                    defaults: vec![SerializationInfo::default(); columns],
                }
            }
        };
        Ok(Self {
            storage,
            payload,
            minmax_columns,
            blocks_are_granules,
            written: WrittenData::default(),
        })
    }

    pub(crate) fn write(&mut self, block: &RecordBatch) -> Result<(), PartError> {
        let rows = block.num_rows();
        self.written.rows += rows as u64;
        if self.blocks_are_granules {
            self.written.granules.push(rows as u64);
        }
        let minmax_columns = self.minmax_columns.clone();
        for column_name in &minmax_columns {
            if let Ok(idx) = block.schema().index_of(column_name) {
                let column = block.column(idx);
                for row in 0..rows {
                    let value = crate::block::Value::from_array(column.as_ref(), row);
                    self.written.minmax.update_row(column_name, &value);
                }
            }
        }
        match &mut self.payload {
            PayloadWriters::Wide(writers) => {
                for (writer, column) in writers.iter_mut().zip(block.columns()) {
                    writer.write(column)?;
                }
            }
            PayloadWriters::Compact {
                writer,
                schema,
                uncompressed,
                defaults,
            } => {
                for (idx, column) in block.columns().iter().enumerate() {
                    uncompressed[idx] += column.get_array_memory_size() as u64;
                    track_defaults(&mut defaults[idx], column);
                }
                let batch = RecordBatch::try_new(schema.clone(), block.columns().to_vec())?;
                writer
                    .as_mut()
                    .expect("part writer already finalized")
                    .write(&batch)?;
            }
        }
        Ok(())
    }

    /// Closes the payload files and returns their stats.
    pub(crate) fn finalize(&mut self) -> Result<WrittenData, PartError> {
        match &mut self.payload {
            PayloadWriters::Wide(writers) => {
                for writer in writers.iter_mut() {
                    let column = writer.close(self.storage.as_ref())?;
                    self.written.columns.push(column);
                }
            }
            PayloadWriters::Compact {
                writer,
                schema,
                uncompressed,
                defaults,
            } => {
                if let Some(writer) = writer.take() {
                    let mut inner = writer.into_inner()?;
                    inner.flush()?;
                }
                let checksum = file_checksum(&self.storage.path().join(COMPACT_DATA_FILE))?;
                let total_uncompressed: u64 = uncompressed.iter().sum::<u64>().max(1);
                for (idx, field) in schema.fields().iter().enumerate() {
                    // Compressed size split proportionally to each column's
                    // uncompressed share of the packed file.
                    let share = checksum.size * uncompressed[idx] / total_uncompressed;
                    self.written.columns.push(WrittenColumn {
                        name: field.name().clone(),
                        column_type: ColumnType::from_arrow(field.data_type())?,
                        file_name: COMPACT_DATA_FILE.to_string(),
                        checksum,
                        size: ColumnSize {
                            compressed: share,
                            uncompressed: uncompressed[idx],
                        },
                        serialization: defaults[idx],
                    });
                }
            }
        }
        Ok(std::mem::take(&mut self.written))
    }
}

/// Writes one gathered column during the vertical stage.
pub struct GatheredColumnWriter {
    storage: Arc<dyn PartStorage>,
    writer: ColumnFileWriter,
    column: Option<WrittenColumn>,
}

impl GatheredColumnWriter {
    pub(crate) fn new(
        storage: Arc<dyn PartStorage>,
        field: &Field,
        props: &WriterProperties,
    ) -> Result<Self, PartError> {
        let writer = ColumnFileWriter::new(storage.as_ref(), field, props)?;
        Ok(Self {
            storage,
            writer,
            column: None,
        })
    }

    pub(crate) fn write(&mut self, block: &RecordBatch) -> Result<(), PartError> {
        self.writer.write(block.column(0))
    }

    /// Closes the column file and reports its checksum and stats.
    pub(crate) fn fill_checksums(&mut self) -> Result<WrittenColumn, PartError> {
        let column = self.writer.close(self.storage.as_ref())?;
        self.column = Some(column.clone());
        Ok(column)
    }

    /// Late fsync, deferred through the delayed-streams queue.
    pub(crate) fn finish(&self, need_sync: bool) -> Result<(), PartError> {
        if need_sync {
            if let Some(column) = &self.column {
                self.storage.sync_file(&column.file_name)?;
            }
        }
        Ok(())
    }
}

/// Writes `count.txt`, `meta.json` and `checksums.json`, making the part
/// loadable. Payload files must be closed first.
pub(crate) fn seal_part(
    storage: &dyn PartStorage,
    meta: &PartMeta,
    mut checksums: Checksums,
    need_sync: bool,
) -> Result<(), PartError> {
    {
        let mut writer = HashWriter::new(storage.write_file(COUNT_FILE)?);
        write!(writer, "{}", meta.rows_count).map_err(PartError::Io)?;
        writer.flush()?;
        let (_, checksum) = writer.finish();
        checksums.add_file(COUNT_FILE, checksum);
    }
    {
        let mut writer = HashWriter::new(storage.write_file(META_FILE)?);
        serde_json::to_writer_pretty(&mut writer, meta)?;
        writer.flush()?;
        let (_, checksum) = writer.finish();
        checksums.add_file(META_FILE, checksum);
    }
    {
        let mut writer = storage.write_file(CHECKSUMS_FILE)?;
        checksums.write_to(writer.as_mut())?;
        writer.flush()?;
    }
    if need_sync {
        for name in checksums.files.keys() {
            storage.sync_file(name)?;
        }
        storage.sync_file(CHECKSUMS_FILE)?;
    }
    Ok(())
}

/// Builds the serialization table recorded in part metadata.
pub(crate) fn serialization_table(
    infos: &BTreeMap<String, SerializationInfo>,
    ratio_for_sparse: f64,
) -> BTreeMap<String, (SerializationInfo, SerializationKind)> {
    infos
        .iter()
        .map(|(name, info)| (name.clone(), (*info, info.kind(ratio_for_sparse))))
        .collect()
}

/// Standalone part writer for the flush path (and tests): takes sorted
/// blocks, produces a loadable [`DataPart`].
pub struct PartBuilder {
    dir: PathBuf,
    storage: Arc<LocalPartStorage>,
    writer: MergedPartWriter,
    ttl: TtlInfos,
    delete_bitmap: Option<DeleteBitmap>,
    vector_indices: BTreeMap<String, VectorIndexState>,
    vector_payloads: Vec<(String, Vec<u8>)>,
}

impl std::fmt::Debug for PartBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartBuilder").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl PartBuilder {
    pub fn new(
        dir: impl Into<PathBuf>,
        schema: SchemaRef,
        part_type: PartType,
        minmax_columns: Vec<String>,
    ) -> Result<Self, PartError> {
        let dir = dir.into();
        let storage = Arc::new(LocalPartStorage::new(dir.clone()));
        if storage.exists() {
            return Err(PartError::DirectoryAlreadyExists(dir.display().to_string()));
        }
        storage.begin_transaction()?;
        let props = WriterProperties::builder()
            .set_compression(parquet::basic::Compression::LZ4)
            .build();
        let writer = MergedPartWriter::new(
            storage.clone() as Arc<dyn PartStorage>,
            part_type,
            schema,
            minmax_columns,
            &props,
            false,
        )?;
        Ok(Self {
            dir,
            storage,
            writer,
            ttl: TtlInfos::default(),
            delete_bitmap: None,
            vector_indices: BTreeMap::new(),
            vector_payloads: Vec::new(),
        })
    }

    pub fn write(&mut self, block: &RecordBatch) -> Result<(), PartError> {
        self.writer.write(block)
    }

    pub fn with_ttl(mut self, ttl: TtlInfos) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_delete_bitmap(mut self, deleted_rows: impl IntoIterator<Item = u64>) -> Self {
        self.delete_bitmap = Some(DeleteBitmap::from_rows(deleted_rows));
        self
    }

    /// Declares a vector index in the given state; `Built` indexes get a
    /// small artifact file so index moves have something to carry.
    pub fn with_vector_index(mut self, name: &str, state: VectorIndexState, payload: &[u8]) -> Self {
        self.vector_indices.insert(name.to_string(), state);
        if state == VectorIndexState::Built {
            self.vector_payloads
                .push((format!("{name}-data{VECTOR_INDEX_FILE_SUFFIX}"), payload.to_vec()));
        }
        self
    }

    pub fn finish(mut self) -> Result<DataPart, PartError> {
        let written = self.writer.finalize()?;

        let mut checksums = Checksums::default();
        let mut meta = PartMeta {
            rows_count: written.rows,
            minmax: written.minmax,
            granules: written.granules,
            ttl: self.ttl,
            vector_indices: self.vector_indices,
            ..PartMeta::default()
        };
        let mut infos = BTreeMap::new();
        for column in &written.columns {
            meta.columns
                .push((column.name.clone(), column.column_type.clone()));
            meta.column_sizes.insert(column.name.clone(), column.size);
            infos.insert(column.name.clone(), column.serialization);
            checksums.add_file(&column.file_name, column.checksum);
        }
        meta.serialization = serialization_table(&infos, 0.9375);

        for (file_name, payload) in &self.vector_payloads {
            let mut writer = HashWriter::new(self.storage.write_file(file_name)?);
            writer.write_all(payload)?;
            writer.flush()?;
            let (_, checksum) = writer.finish();
            checksums.add_file(file_name, checksum);
        }

        if let Some(bitmap) = &self.delete_bitmap {
            let mut writer = self.storage.write_file(DELETE_BITMAP_FILE)?;
            serde_json::to_writer(writer.as_mut(), bitmap)?;
            writer.flush()?;
        }

        seal_part(self.storage.as_ref(), &meta, checksums, false)?;
        DataPart::load(self.dir)
    }
}

#[cfg(test)]
mod tests {
    use arrow_array::{Int64Array, StringArray};

    use super::*;
    use crate::part::PartInfo;

    #[test]
    fn built_part_loads_with_meta() {
        let tmp = tempfile::tempdir().unwrap();
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![5, 7])),
                Arc::new(StringArray::from(vec![Some("x"), None])),
            ],
        )
        .unwrap();

        let dir = tmp.path().join(PartInfo::new("all", 1, 1, 0).name());
        let mut builder =
            PartBuilder::new(dir, schema, PartType::Wide, vec!["k".to_string()]).unwrap();
        builder.write(&batch).unwrap();
        let part = builder.finish().unwrap();

        assert_eq!(part.rows_count(), 2);
        assert_eq!(part.column_names(), vec!["k".to_string(), "v".to_string()]);
        assert!(part.bytes_on_disk() > 0);
        assert_eq!(
            part.meta().minmax.columns[0].min,
            crate::block::Value::Int64(5)
        );
        assert_eq!(
            part.meta().minmax.columns[0].max,
            crate::block::Value::Int64(7)
        );
        assert_eq!(part.part_type(), PartType::Wide);
    }

    #[test]
    fn compact_part_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![Arc::new(Int64Array::from(vec![1, 2, 3]))],
        )
        .unwrap();

        let dir = tmp.path().join(PartInfo::new("all", 2, 2, 0).name());
        let mut builder =
            PartBuilder::new(dir, schema, PartType::Compact, vec!["k".to_string()]).unwrap();
        builder.write(&batch).unwrap();
        let part = builder.finish().unwrap();
        assert_eq!(part.part_type(), PartType::Compact);
        assert_eq!(part.rows_count(), 3);
    }

    #[test]
    fn duplicate_directory_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int64, false)]));
        let dir = tmp.path().join("all_1_1_0");
        let builder =
            PartBuilder::new(dir.clone(), schema.clone(), PartType::Wide, vec![]).unwrap();
        drop(builder);
        let err = PartBuilder::new(dir, schema, PartType::Wide, vec![]).unwrap_err();
        assert!(matches!(err, PartError::DirectoryAlreadyExists(_)));
    }
}
