//! Row-id map builder: replays the rows-sources stream against per-part
//! `_part_offset` sequences to link a decoupled part with its sources.
//!
//! Two files per merge plus one per source: the inverted map (new row id →
//! old offset) and one map per source part (old offset → new row id, or the
//! all-ones tombstone for rows that did not survive). Values are
//! text-decimal separated by tabs inside block-compressed files — the format
//! existing decoupled parts already carry.

use std::{collections::HashMap, io::Write, sync::Arc};

use log::Level;

use crate::{
    io::CompressedWriter,
    logging::merge_log,
    merge::{error::MergeError, rows_source::RowsSourcesReader},
    part::{
        reader::{ReadOptions, PART_OFFSET_COLUMN},
        DataPart, PartStorage, SequentialPartReader,
    },
    schema::VectorIndexDescription,
    vector,
};

/// Tombstone written for old rows absent from the merged part. Readers must
/// treat the all-ones value as "deleted".
pub const ROW_ID_TOMBSTONE: u64 = u64::MAX;

type MapWriter = CompressedWriter<Box<dyn Write + Send>>;

pub(crate) struct RowIdMapBuilder<'a> {
    pub parts: &'a [Arc<DataPart>],
    pub sort_key: &'a [String],
    /// Collapsing/Replacing/VersionedCollapsing keep tombstones out of the
    /// per-source maps and feed them into the index delete bitmaps instead.
    pub collapsing_family: bool,
    pub vector_indices: &'a [VectorIndexDescription],
    pub new_part_storage: &'a dyn PartStorage,
    pub inverted_map_file: &'a str,
    pub row_ids_map_files: &'a [String],
    pub batch_size: usize,
}

impl RowIdMapBuilder<'_> {
    /// Collects the `_part_offset` sequence each source contributed to the
    /// merge (lightweight deletes already applied).
    fn collect_part_offsets(&self) -> Result<Vec<Vec<u64>>, MergeError> {
        let mut part_offsets = Vec::with_capacity(self.parts.len());
        for part in self.parts {
            let mut offsets = Vec::with_capacity(part.rows_count() as usize);
            if !part.is_empty() {
                let mut reader = SequentialPartReader::new(
                    part.clone(),
                    self.sort_key.to_vec(),
                    ReadOptions {
                        batch_size: self.batch_size,
                        with_part_offset: true,
                        apply_deletes: true,
                        ..Default::default()
                    },
                )?;
                while let Some(block) = reader.next_block()? {
                    let column = block
                        .column(block.schema().index_of(PART_OFFSET_COLUMN).map_err(|_| {
                            MergeError::Logical("part offset column missing".to_string())
                        })?)
                        .clone();
                    let offsets_array = column
                        .as_any()
                        .downcast_ref::<arrow_array::UInt64Array>()
                        .ok_or_else(|| {
                            MergeError::Logical("part offset column is not u64".to_string())
                        })?;
                    offsets.extend(offsets_array.values().iter().copied());
                }
            }
            part_offsets.push(offsets);
        }
        Ok(part_offsets)
    }

    pub(crate) fn build(&self, rows_sources: &mut RowsSourcesReader) -> Result<(), MergeError> {
        let part_offsets = self.collect_part_offsets()?;

        let mut inverted_writer: MapWriter =
            CompressedWriter::new(self.new_part_storage.write_file(self.inverted_map_file)?);
        let mut map_writers: Vec<MapWriter> = Vec::with_capacity(self.row_ids_map_files.len());
        for file_name in self.row_ids_map_files {
            map_writers.push(CompressedWriter::new(
                self.new_part_storage.write_file(file_name)?,
            ));
        }

        let result = self.write_maps(
            rows_sources,
            &part_offsets,
            &mut inverted_writer,
            &mut map_writers,
        );
        match result {
            Ok(()) => {
                for writer in &mut map_writers {
                    writer.finalize()?;
                }
                inverted_writer.finalize()?;
                merge_log!(
                    Level::Debug,
                    "row_id_maps_written",
                    "inverted_bytes={} sources={}",
                    inverted_writer.count(),
                    map_writers.len(),
                );
                Ok(())
            }
            Err(err) => {
                // Drop buffered state first so no flush runs on broken
                // streams during unwind.
                for writer in &mut map_writers {
                    writer.reset();
                }
                inverted_writer.reset();
                Err(err)
            }
        }
    }

    fn write_maps(
        &self,
        rows_sources: &mut RowsSourcesReader,
        part_offsets: &[Vec<u64>],
        inverted_writer: &mut MapWriter,
        map_writers: &mut [MapWriter],
    ) -> Result<(), MergeError> {
        let parts_count = self.parts.len();
        let mut new_row_id: u64 = 0;
        let mut cursors = vec![0usize; parts_count];
        let mut parts_new_row_ids: Vec<HashMap<u64, u64>> = vec![HashMap::new(); parts_count];

        while let Some(source) = rows_sources.next()? {
            let source_num = source.source_num();
            if source_num >= parts_count {
                return Err(MergeError::Logical(format!(
                    "rows-sources record names source {source_num} of {parts_count}"
                )));
            }
            let skipped = self.collapsing_family && source.skip_flag();
            if !skipped {
                let old_offset = *part_offsets[source_num]
                    .get(cursors[source_num])
                    .ok_or_else(|| {
                        MergeError::Logical(format!(
                            "rows-sources stream overruns offsets of source {source_num}"
                        ))
                    })?;
                parts_new_row_ids[source_num].insert(old_offset, new_row_id);
                write!(text_writer(inverted_writer), "{old_offset}\t")?;
                new_row_id += 1;
            }
            cursors[source_num] += 1;
        }

        for (source_num, part) in self.parts.iter().enumerate() {
            let rows = part.rows_count();
            if self.collapsing_family {
                // Map only rows that survived; tombstoned offsets feed the
                // index delete bitmaps.
                let mut delete_row_ids = Vec::new();
                for old_row_id in 0..rows {
                    match parts_new_row_ids[source_num].get(&old_row_id) {
                        Some(mapped) => {
                            write!(text_writer(&mut map_writers[source_num]), "{mapped}\t")?;
                        }
                        None => delete_row_ids.push(old_row_id),
                    }
                }
                if !delete_row_ids.is_empty() {
                    for description in self.vector_indices {
                        let segment = vector::SegmentId::new(
                            part,
                            description.name.clone(),
                            description.column.clone(),
                        );
                        vector::update_bitmap(&segment, &delete_row_ids)?;
                    }
                }
            } else {
                for old_row_id in 0..rows {
                    let mapped = parts_new_row_ids[source_num]
                        .get(&old_row_id)
                        .copied()
                        .unwrap_or(ROW_ID_TOMBSTONE);
                    write!(text_writer(&mut map_writers[source_num]), "{mapped}\t")?;
                }
            }
        }
        Ok(())
    }
}

/// Adapter so `write!` text formatting lands in a compressed stream.
fn text_writer(writer: &mut MapWriter) -> impl std::io::Write + '_ {
    struct Fmt<'a>(&'a mut MapWriter);
    impl std::io::Write for Fmt<'_> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.write_all(buf)?;
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }
    Fmt(writer)
}
