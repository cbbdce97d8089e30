//! Checksum-hashing wrappers around byte streams.

use std::{
    fs::File,
    io::{self, BufReader, Read, Write},
    path::Path,
};

use serde::{Deserialize, Serialize};

/// Size and crc32 of a finished file, as recorded in checksum manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChecksum {
    /// File size in bytes.
    pub size: u64,
    /// crc32 of the file contents.
    pub crc32: u32,
}

/// Writer that hashes every byte passing through it.
pub struct HashWriter<W: Write> {
    hasher: crc32fast::Hasher,
    count: u64,
    writer: W,
}

impl<W: Write> HashWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            hasher: crc32fast::Hasher::new(),
            count: 0,
            writer,
        }
    }

    pub fn finish(self) -> (W, FileChecksum) {
        (
            self.writer,
            FileChecksum {
                size: self.count,
                crc32: self.hasher.finalize(),
            },
        )
    }
}

impl<W: Write> Write for HashWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.writer.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.count += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Reader that hashes every byte passing through it.
pub struct HashReader<R: Read> {
    hasher: crc32fast::Hasher,
    count: u64,
    reader: R,
}

impl<R: Read> HashReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            hasher: crc32fast::Hasher::new(),
            count: 0,
            reader,
        }
    }

    /// Consumes the rest of the stream and returns its checksum.
    pub fn ignore_all(mut self) -> io::Result<FileChecksum> {
        let mut sink = [0u8; 8192];
        loop {
            let read = self.reader.read(&mut sink)?;
            if read == 0 {
                break;
            }
            self.hasher.update(&sink[..read]);
            self.count += read as u64;
        }
        Ok(FileChecksum {
            size: self.count,
            crc32: self.hasher.finalize(),
        })
    }
}

impl<R: Read> Read for HashReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.reader.read(buf)?;
        self.hasher.update(&buf[..read]);
        self.count += read as u64;
        Ok(read)
    }
}

/// Checksums a file on disk.
pub fn file_checksum(path: &Path) -> io::Result<FileChecksum> {
    let reader = HashReader::new(BufReader::new(File::open(path)?));
    reader.ignore_all()
}
