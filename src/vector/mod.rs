//! Vector-index support for merged parts: moving index artifacts between
//! parts, delete-bitmap maintenance and the decoupled-part cache plumbing.

use std::{io::Write, path::PathBuf, sync::Arc};

use log::Level;

use crate::{
    io::{CompressedReader, FileChecksum, HashReader},
    logging::merge_log,
    merge::MergeError,
    part::{Checksums, DataPart, PartStorage, VECTOR_INDEX_FILE_SUFFIX},
    table::TableData,
};

/// One vector-index segment inside one part.
#[derive(Debug, Clone)]
pub struct SegmentId {
    pub part_dir: PathBuf,
    pub part_name: String,
    pub index_name: String,
    pub column: String,
}

impl SegmentId {
    pub fn new(part: &DataPart, index_name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            part_dir: part.dir().to_path_buf(),
            part_name: part.name(),
            index_name: index_name.into(),
            column: column.into(),
        }
    }

    fn deletes_file(&self) -> PathBuf {
        self.part_dir
            .join(format!("{}-deletes.bitmap", self.index_name))
    }
}

/// Artifact files of one index inside a part directory.
pub(crate) fn index_file_names(part: &DataPart, index_name: &str) -> Result<Vec<String>, MergeError> {
    let prefix = format!("{index_name}-");
    let mut names = Vec::new();
    for entry in std::fs::read_dir(part.dir()).map_err(MergeError::Io)? {
        let entry = entry.map_err(MergeError::Io)?;
        if let Some(name) = entry.file_name().to_str() {
            if name.starts_with(&prefix) && name.ends_with(VECTOR_INDEX_FILE_SUFFIX) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// Moves one index's artifact files from a source part into the new part
/// under the `merged-<i>-<source_name>-` naming, returning their checksums.
pub(crate) fn move_index_files(
    decouple: bool,
    source_id: u32,
    source_name: &str,
    index_name: &str,
    source_part: &DataPart,
    new_part_storage: &dyn PartStorage,
) -> Result<Checksums, MergeError> {
    let mut checksums = Checksums::default();
    for file_name in index_file_names(source_part, index_name)? {
        let dst_name = format!("merged-{source_id}-{source_name}-{file_name}");
        new_part_storage.adopt_file(source_part.dir(), &file_name, &dst_name)?;
        let checksum = storage_file_checksum(new_part_storage, &dst_name)?;
        checksums.add_file(&dst_name, checksum);
    }
    merge_log!(
        Level::Debug,
        "vector_index_moved",
        "index={index_name} source={source_name} decouple={decouple} files={}",
        checksums.files.len(),
    );
    Ok(checksums)
}

/// Folds freshly tombstoned rows into the index's delete bitmap for one
/// source segment, so decoupled searches skip them.
pub(crate) fn update_bitmap(segment: &SegmentId, delete_row_ids: &[u64]) -> Result<(), MergeError> {
    use crate::part::DeleteBitmap;

    let path = segment.deletes_file();
    let mut bitmap: DeleteBitmap = if path.exists() {
        serde_json::from_reader(std::fs::File::open(&path)?)
            .map_err(|err| MergeError::BadArguments(format!("corrupt index bitmap: {err}")))?
    } else {
        DeleteBitmap::default()
    };
    bitmap.extend(delete_row_ids.iter().copied());
    let mut file = std::fs::File::create(&path)?;
    serde_json::to_writer(&mut file, &bitmap)
        .map_err(|err| MergeError::BadArguments(format!("cannot write index bitmap: {err}")))?;
    file.flush()?;
    merge_log!(
        Level::Debug,
        "vector_index_bitmap",
        "part={} index={} deleted={}",
        segment.part_name,
        segment.index_name,
        delete_row_ids.len(),
    );
    Ok(())
}

/// Writes the per-index checksums manifest of the new part.
pub(crate) fn dump_checksums(
    storage: &dyn PartStorage,
    index_name: &str,
    checksums: &Checksums,
    decoupled: bool,
) -> Result<(), MergeError> {
    let file_name = if decoupled {
        format!("{index_name}-decouple-checksums.json")
    } else {
        format!("{index_name}-checksums.json")
    };
    let mut writer = storage.write_file(&file_name)?;
    checksums.write_to(writer.as_mut())?;
    writer.flush().map_err(MergeError::Io)?;
    Ok(())
}

/// Checksums a file through the part-storage seam.
pub(crate) fn storage_file_checksum(
    storage: &dyn PartStorage,
    name: &str,
) -> Result<FileChecksum, MergeError> {
    let reader = HashReader::new(storage.read_file(name)?);
    Ok(reader.ignore_all()?)
}

/// Reads a text-decimal row-id map back into memory.
pub(crate) fn read_row_id_map(
    storage: &dyn PartStorage,
    name: &str,
) -> Result<Vec<u64>, MergeError> {
    let mut reader = CompressedReader::new(storage.read_file(name)?);
    let mut payload = Vec::new();
    reader.read_to_end(&mut payload)?;
    let text = String::from_utf8(payload)
        .map_err(|err| MergeError::Logical(format!("row-id map is not text: {err}")))?;
    let mut row_ids = Vec::new();
    for token in text.split('\t') {
        if token.is_empty() {
            continue;
        }
        let row_id = token
            .parse::<u64>()
            .map_err(|err| MergeError::Logical(format!("row-id map entry {token:?}: {err}")))?;
        row_ids.push(row_id);
    }
    Ok(row_ids)
}

/// Primes the decouple cache with one segment's row-id map.
pub(crate) fn load_decouple_cache(
    data: &TableData,
    new_part_name: &str,
    index_name: &str,
    storage: &dyn PartStorage,
    map_file: &str,
    source_ordinal: u32,
) -> Result<(), MergeError> {
    let row_ids = Arc::new(read_row_id_map(storage, map_file)?);
    data.prime_decouple_cache(
        decouple_cache_key(new_part_name, index_name, source_ordinal),
        row_ids,
    );
    Ok(())
}

/// Cache key for one decoupled segment's row-id map.
pub fn decouple_cache_key(part_name: &str, index_name: &str, source_ordinal: u32) -> String {
    format!("{part_name}:{index_name}:{source_ordinal}")
}
