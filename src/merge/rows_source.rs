//! The rows-sources stream: a per-output-row decision trail.
//!
//! The key merge emits exactly one [`RowSource`] per input row it consumed,
//! in output order; the vertical column gather and the row-id-map builder
//! replay the stream. One record packs into one byte, so the format caps the
//! number of source parts a single merge can take.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;

use crate::io::{CompressedReader, CompressedWriter};

/// One byte of the rows-sources stream: source part number plus a skip flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowSource(u8);

const SKIP_FLAG: u8 = 0x80;

impl RowSource {
    /// Highest representable source part count.
    pub const MAX_PARTS: usize = 0x7f;

    pub fn new(source_num: usize) -> Self {
        debug_assert!(source_num <= Self::MAX_PARTS);
        Self(source_num as u8 & !SKIP_FLAG)
    }

    pub fn with_skip(source_num: usize, skip: bool) -> Self {
        let mut source = Self::new(source_num);
        source.set_skip_flag(skip);
        source
    }

    pub fn source_num(&self) -> usize {
        (self.0 & !SKIP_FLAG) as usize
    }

    pub fn skip_flag(&self) -> bool {
        self.0 & SKIP_FLAG != 0
    }

    pub fn set_skip_flag(&mut self, skip: bool) {
        if skip {
            self.0 |= SKIP_FLAG;
        } else {
            self.0 &= !SKIP_FLAG;
        }
    }

    pub fn to_byte(self) -> u8 {
        self.0
    }

    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }
}

/// Scratch file holding the compressed rows-sources stream.
///
/// Auto-deleted with the merge task unless [`RowsSourcesFile::keep`] was
/// called (the decouple path copies the stream into the new part at
/// finalize, then removes the kept file itself).
pub(crate) struct RowsSourcesFile {
    file: Option<NamedTempFile>,
    kept_path: Option<PathBuf>,
}

impl RowsSourcesFile {
    pub(crate) fn create(tmp_dir: &Path) -> io::Result<Self> {
        Ok(Self {
            file: Some(NamedTempFile::new_in(tmp_dir)?),
            kept_path: None,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        match (&self.file, &self.kept_path) {
            (Some(file), _) => file.path(),
            (None, Some(path)) => path,
            (None, None) => unreachable!("rows-sources file gone"),
        }
    }

    /// Detaches the file from auto-deletion.
    pub(crate) fn keep(&mut self) -> io::Result<()> {
        if let Some(file) = self.file.take() {
            let (_, path) = file.keep().map_err(|err| err.error)?;
            self.kept_path = Some(path);
        }
        Ok(())
    }

    /// Removes a file previously detached with `keep`.
    pub(crate) fn remove_kept(&mut self) -> io::Result<()> {
        if let Some(path) = self.kept_path.take() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub(crate) fn writer(&self) -> io::Result<RowsSourcesWriter> {
        Ok(RowsSourcesWriter {
            inner: CompressedWriter::new(File::create(self.path())?),
        })
    }

    pub(crate) fn reader(&self) -> io::Result<RowsSourcesReader> {
        Ok(RowsSourcesReader {
            inner: CompressedReader::new(File::open(self.path())?),
        })
    }
}

/// Appends records to the rows-sources stream.
pub(crate) struct RowsSourcesWriter {
    inner: CompressedWriter<File>,
}

impl RowsSourcesWriter {
    pub(crate) fn write(&mut self, source: RowSource) -> io::Result<()> {
        self.inner.write_u8(source.to_byte())
    }

    /// Uncompressed record count written so far.
    pub(crate) fn count(&self) -> u64 {
        self.inner.count()
    }

    pub(crate) fn finalize(&mut self) -> io::Result<()> {
        self.inner.finalize()?;
        self.inner.get_ref().sync_all()
    }
}

/// Replays the rows-sources stream; rewindable once per gathered column.
pub(crate) struct RowsSourcesReader {
    inner: CompressedReader<File>,
}

impl RowsSourcesReader {
    pub(crate) fn next(&mut self) -> io::Result<Option<RowSource>> {
        Ok(self.inner.read_u8()?.map(RowSource::from_byte))
    }

    pub(crate) fn rewind(&mut self) -> io::Result<()> {
        self.inner.rewind()
    }

    pub(crate) fn into_compressed(self) -> CompressedReader<File> {
        self.inner
    }
}
