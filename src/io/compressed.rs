//! Block-compressed byte streams for merge scratch files.
//!
//! Frames are self-describing: a little-endian `u32` frame length followed by
//! an lz4 payload that carries its own uncompressed size. Row-id maps and the
//! rows-sources stream are persisted through these writers, so the framing is
//! part of the on-disk format and must stay stable.

use std::io::{self, Read, Seek, SeekFrom, Write};

/// Uncompressed bytes accumulated before a frame is cut.
const FRAME_CAPACITY: usize = 64 * 1024;

/// Buffering writer that cuts lz4 frames into an underlying byte sink.
///
/// `finalize` must be called on the success path; on error paths callers are
/// expected to `reset` the writer so that drop never runs on half-written
/// state.
pub struct CompressedWriter<W: Write> {
    inner: W,
    buf: Vec<u8>,
    raw_count: u64,
    finalized: bool,
}

impl<W: Write> CompressedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(FRAME_CAPACITY),
            raw_count: 0,
            finalized: false,
        }
    }

    /// Total number of uncompressed bytes accepted so far.
    pub fn count(&self) -> u64 {
        self.raw_count
    }

    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        debug_assert!(!self.finalized, "write into finalized compressed stream");
        self.raw_count += data.len() as u64;
        let mut rest = data;
        while !rest.is_empty() {
            let room = FRAME_CAPACITY - self.buf.len();
            let take = room.min(rest.len());
            self.buf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.buf.len() == FRAME_CAPACITY {
                self.flush_frame()?;
            }
        }
        Ok(())
    }

    pub fn write_u8(&mut self, byte: u8) -> io::Result<()> {
        self.write_all(&[byte])
    }

    fn flush_frame(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let compressed = lz4_flex::compress_prepend_size(&self.buf);
        self.inner.write_all(&(compressed.len() as u32).to_le_bytes())?;
        self.inner.write_all(&compressed)?;
        self.buf.clear();
        Ok(())
    }

    /// Flushes the trailing frame and the underlying sink.
    pub fn finalize(&mut self) -> io::Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.flush_frame()?;
        self.inner.flush()?;
        self.finalized = true;
        Ok(())
    }

    /// Abandons buffered data without touching the sink. Used on error paths
    /// so that no flush runs on broken state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.finalized = true;
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

/// Reader for streams produced by [`CompressedWriter`].
pub struct CompressedReader<R: Read> {
    inner: R,
    frame: Vec<u8>,
    pos: usize,
}

impl<R: Read> CompressedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            frame: Vec::new(),
            pos: 0,
        }
    }

    fn refill(&mut self) -> io::Result<bool> {
        let mut len_bytes = [0u8; 4];
        match self.inner.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(false),
            Err(err) => return Err(err),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut compressed = vec![0u8; len];
        self.inner.read_exact(&mut compressed)?;
        self.frame = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        self.pos = 0;
        Ok(true)
    }

    /// Next uncompressed byte, or `None` at end of stream.
    pub fn read_u8(&mut self) -> io::Result<Option<u8>> {
        if self.pos == self.frame.len() && !self.refill()? {
            return Ok(None);
        }
        let byte = self.frame[self.pos];
        self.pos += 1;
        Ok(Some(byte))
    }

    /// Drains the rest of the stream into `out`.
    pub fn read_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<()> {
        loop {
            out.extend_from_slice(&self.frame[self.pos..]);
            self.pos = self.frame.len();
            if !self.refill()? {
                return Ok(());
            }
        }
    }
}

impl<R: Read + Seek> CompressedReader<R> {
    /// Rewinds to the first frame so the stream can be replayed.
    pub fn rewind(&mut self) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(0))?;
        self.frame.clear();
        self.pos = 0;
        Ok(())
    }
}

/// Copies every remaining byte of `reader` into `writer`.
pub fn copy_all<R: Read, W: Write>(
    reader: &mut CompressedReader<R>,
    writer: &mut CompressedWriter<W>,
) -> io::Result<u64> {
    let mut payload = Vec::new();
    reader.read_to_end(&mut payload)?;
    writer.write_all(&payload)?;
    Ok(payload.len() as u64)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn round_trip_bytes() {
        let mut writer = CompressedWriter::new(Vec::new());
        let payload: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
        writer.write_all(&payload).unwrap();
        assert_eq!(writer.count(), payload.len() as u64);
        writer.finalize().unwrap();

        let encoded = writer.into_inner();
        let mut reader = CompressedReader::new(Cursor::new(encoded));
        let mut decoded = Vec::new();
        reader.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn rewind_replays_from_start() {
        let mut writer = CompressedWriter::new(Cursor::new(Vec::new()));
        writer.write_all(b"abcdef").unwrap();
        writer.finalize().unwrap();

        let mut cursor = writer.into_inner();
        cursor.seek(SeekFrom::Start(0)).unwrap();
        let mut reader = CompressedReader::new(cursor);
        assert_eq!(reader.read_u8().unwrap(), Some(b'a'));
        assert_eq!(reader.read_u8().unwrap(), Some(b'b'));
        reader.rewind().unwrap();
        assert_eq!(reader.read_u8().unwrap(), Some(b'a'));
    }

    #[test]
    fn empty_stream_reads_none() {
        let mut writer = CompressedWriter::new(Vec::new());
        writer.finalize().unwrap();
        let mut reader = CompressedReader::new(Cursor::new(writer.into_inner()));
        assert_eq!(reader.read_u8().unwrap(), None);
    }

    #[test]
    fn reset_discards_buffered_data() {
        let mut writer = CompressedWriter::new(Vec::new());
        writer.write_all(b"doomed").unwrap();
        writer.reset();
        assert!(writer.into_inner().is_empty());
    }
}
