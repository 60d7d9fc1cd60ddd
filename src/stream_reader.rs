use crate::error::DecodeError;
use crate::source::{Fetch, StreamingSource};

/// Size of each refill of the header reader's buffer.
const CHUNK_SIZE: usize = 4096;

/// Big-endian field reader over a [`StreamingSource`].
///
/// Header parsing reads many small fields; the reader pulls the source at
/// most a chunk per read and tracks its own logical offset, so the source may
/// run ahead of it.
pub struct SourceReader<'a> {
    source: &'a StreamingSource,
    buffer: Vec<u8>,
    position: usize,
    /// Source offset of `buffer[0]`.
    base: u64,
}

impl<'a> SourceReader<'a> {
    /// Starts reading at `offset`.
    pub fn new(source: &'a StreamingSource, offset: u64) -> Result<Self, DecodeError> {
        source.seek(offset)?;
        Ok(Self {
            source,
            buffer: Vec::new(),
            position: 0,
            base: offset,
        })
    }

    /// Logical offset of the next byte to be read.
    pub fn offset(&self) -> u64 {
        self.base + self.position as u64
    }

    fn refill(&mut self) -> Result<(), DecodeError> {
        self.base += self.buffer.len() as u64;
        self.buffer.resize(CHUNK_SIZE, 0);
        self.position = 0;
        // One read per refill; the source may return less than a chunk.
        let read = match self.source.fetch(&mut self.buffer, true)? {
            Fetch::Bytes(read) => read,
            Fetch::WouldBlock => 0,
        };
        self.buffer.truncate(read);
        if read == 0 {
            return Err(DecodeError::InvalidContainer("unexpected end of data"));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        if self.position >= self.buffer.len() {
            self.refill()?;
        }
        let val = self.buffer[self.position];
        self.position += 1;
        Ok(val)
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b1 = self.read_u8()? as u16;
        let b2 = self.read_u8()? as u16;
        Ok((b1 << 8) | b2)
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let hi = self.read_u16()? as u32;
        let lo = self.read_u16()? as u32;
        Ok((hi << 16) | lo)
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let hi = self.read_u32()? as u64;
        let lo = self.read_u32()? as u64;
        Ok((hi << 32) | lo)
    }

    pub fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        for byte in &mut out {
            *byte = self.read_u8()?;
        }
        Ok(out)
    }

    /// Skips `count` bytes, seeking the source when they are not buffered.
    pub fn advance(&mut self, count: u64) -> Result<(), DecodeError> {
        let buffered = (self.buffer.len() - self.position) as u64;
        if count <= buffered {
            self.position += count as usize;
            return Ok(());
        }
        let target = self.offset() + count;
        self.source.seek(target)?;
        self.buffer.clear();
        self.position = 0;
        self.base = target;
        Ok(())
    }

    /// Moves to an absolute source offset.
    pub fn seek(&mut self, offset: u64) -> Result<(), DecodeError> {
        if offset >= self.base && offset <= self.base + self.buffer.len() as u64 {
            self.position = (offset - self.base) as usize;
            return Ok(());
        }
        self.source.seek(offset)?;
        self.buffer.clear();
        self.position = 0;
        self.base = offset;
        Ok(())
    }
}
