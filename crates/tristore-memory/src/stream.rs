//! Binary stream codec for saving and loading store components.
//!
//! Layout of the primitives:
//! - string: u32 length + UTF-8 bytes
//! - u64 / f64: 8 bytes little-endian
//! - bool: 1 byte
//! - region: element width (u8) + element count (u64) + raw little-endian
//!   elements + CRC32 of the element bytes (u32)

use bytes::{Buf, BufMut, BytesMut};
use std::io::{Read, Write};
use tristore_common::{Result, StoreError};

/// Bytes buffered before a write reaches the underlying writer.
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Elements decoded per read while loading a region.
const READ_CHUNK_ELEMENTS: usize = 8192;

/// Fixed-width element that can be stored in a region.
pub trait RegionValue: Copy + Default {
    /// Encoded width in bytes.
    const WIDTH: u8;

    fn put(self, buf: &mut BytesMut);

    fn get(buf: &mut &[u8]) -> Self;
}

impl RegionValue for u8 {
    const WIDTH: u8 = 1;

    #[inline]
    fn put(self, buf: &mut BytesMut) {
        buf.put_u8(self);
    }

    #[inline]
    fn get(buf: &mut &[u8]) -> Self {
        buf.get_u8()
    }
}

impl RegionValue for u32 {
    const WIDTH: u8 = 4;

    #[inline]
    fn put(self, buf: &mut BytesMut) {
        buf.put_u32_le(self);
    }

    #[inline]
    fn get(buf: &mut &[u8]) -> Self {
        buf.get_u32_le()
    }
}

impl RegionValue for u64 {
    const WIDTH: u8 = 8;

    #[inline]
    fn put(self, buf: &mut BytesMut) {
        buf.put_u64_le(self);
    }

    #[inline]
    fn get(buf: &mut &[u8]) -> Self {
        buf.get_u64_le()
    }
}

/// Buffered writer for store components.
pub struct OutputStream<W: Write> {
    writer: W,
    buffer: BytesMut,
}

impl<W: Write> OutputStream<W> {
    /// Wraps a writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            buffer: BytesMut::with_capacity(FLUSH_THRESHOLD),
        }
    }

    /// Writes a length-prefixed string, typically a component tag.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.buffer.put_u32_le(value.len() as u32);
        self.buffer.put_slice(value.as_bytes());
        self.flush_if_full()
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.buffer.put_u64_le(value);
        self.flush_if_full()
    }

    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.buffer.put_f64_le(value);
        self.flush_if_full()
    }

    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.buffer.put_u8(value as u8);
        self.flush_if_full()
    }

    /// Writes a length-prefixed, checksummed region of fixed-width values.
    pub fn write_region<T, I>(&mut self, values: I) -> Result<()>
    where
        T: RegionValue,
        I: ExactSizeIterator<Item = T>,
    {
        self.buffer.put_u8(T::WIDTH);
        self.buffer.put_u64_le(values.len() as u64);

        let mut hasher = crc32fast::Hasher::new();
        let mut chunk_start = self.buffer.len();
        for value in values {
            value.put(&mut self.buffer);
            if self.buffer.len() >= FLUSH_THRESHOLD {
                hasher.update(&self.buffer[chunk_start..]);
                self.flush()?;
                chunk_start = 0;
            }
        }
        hasher.update(&self.buffer[chunk_start..]);
        self.buffer.put_u32_le(hasher.finalize());
        self.flush_if_full()
    }

    /// Pushes buffered bytes to the underlying writer.
    pub fn flush(&mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.writer.write_all(&self.buffer)?;
            self.buffer.clear();
        }
        Ok(())
    }

    /// Flushes and returns the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.flush()?;
        self.writer.flush()?;
        Ok(self.writer)
    }

    #[inline]
    fn flush_if_full(&mut self) -> Result<()> {
        if self.buffer.len() >= FLUSH_THRESHOLD {
            self.flush()?;
        }
        Ok(())
    }
}

/// Reader counterpart of `OutputStream`.
pub struct InputStream<R: Read> {
    reader: R,
    scratch: Vec<u8>,
}

impl<R: Read> InputStream<R> {
    /// Wraps a reader.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            scratch: Vec::new(),
        }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&[u8]> {
        self.scratch.resize(len, 0);
        self.reader.read_exact(&mut self.scratch)?;
        Ok(&self.scratch)
    }

    /// Reads a length-prefixed string.
    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_bytes(4)?.get_u32_le() as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| StoreError::invalid_format("string", e.to_string()))
    }

    /// Reads the next string and returns true if it equals `expected`.
    pub fn check_next_string(&mut self, expected: &str) -> Result<bool> {
        let len = self.read_bytes(4)?.get_u32_le() as usize;
        if len != expected.len() {
            return Ok(false);
        }
        Ok(self.read_bytes(len)? == expected.as_bytes())
    }

    /// Fails with a format error unless the next string is `tag`.
    pub fn expect_tag(&mut self, tag: &str) -> Result<()> {
        match self.check_next_string(tag) {
            Ok(true) => Ok(()),
            Ok(false) => Err(StoreError::invalid_format(tag, "tag mismatch")),
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(StoreError::invalid_format(tag, "stream ended before tag"))
            }
            Err(e) => Err(e),
        }
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(self.read_bytes(8)?.get_u64_le())
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(self.read_bytes(8)?.get_f64_le())
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_bytes(1)?[0] != 0)
    }

    /// Reads a region written by `OutputStream::write_region`, handing each
    /// decoded value and its position to `sink`. Returns the element count.
    pub fn read_region<T, F>(&mut self, mut sink: F) -> Result<usize>
    where
        T: RegionValue,
        F: FnMut(usize, T) -> Result<()>,
    {
        let width = self.read_bytes(1)?[0];
        if width != T::WIDTH {
            return Err(StoreError::invalid_format(
                "region",
                format!("element width {} where {} was expected", width, T::WIDTH),
            ));
        }
        let count = self.read_u64()? as usize;

        let mut hasher = crc32fast::Hasher::new();
        let mut position = 0;
        while position < count {
            let chunk = (count - position).min(READ_CHUNK_ELEMENTS);
            let bytes = self.read_bytes(chunk * T::WIDTH as usize)?;
            hasher.update(bytes);
            let mut cursor: &[u8] = bytes;
            let mut decoded = Vec::with_capacity(chunk);
            for _ in 0..chunk {
                decoded.push(T::get(&mut cursor));
            }
            for value in decoded {
                sink(position, value)?;
                position += 1;
            }
        }

        let stored = self.read_bytes(4)?.get_u32_le();
        let computed = hasher.finalize();
        if stored != computed {
            return Err(StoreError::invalid_format(
                "region",
                format!("checksum mismatch: stored={}, computed={}", stored, computed),
            ));
        }
        Ok(count)
    }

    /// Reads a region into a vector.
    pub fn read_region_vec<T: RegionValue>(&mut self) -> Result<Vec<T>> {
        let mut values = Vec::new();
        self.read_region::<T, _>(|_, value| {
            values.push(value);
            Ok(())
        })?;
        Ok(values)
    }

    /// Returns the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}
