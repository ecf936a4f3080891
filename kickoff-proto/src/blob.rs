//! Little-endian blob stream primitives.
//!
//! The writer appends raw scalars and length-prefixed blobs to a growable
//! buffer; the reader consumes a byte view and fails on any truncation or
//! malformed prefix. Every protocol message is built from these two.

use bytes::{BufMut, Bytes, BytesMut};

/// Decode failure. The enclosing message decode aborts on the first error;
/// the server maps all of these to a `BadRequest` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unexpected end of input")]
    Truncated,
    #[error("negative blob length")]
    NegativeLength,
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("invalid enum or bool byte: {0:#04x}")]
    InvalidByte(u8),
}

pub type WireResult<T> = Result<T, WireError>;

/// Append-only wire buffer.
#[derive(Debug, Default)]
pub struct BlobWriter {
    buf: BytesMut,
}

impl BlobWriter {
    pub fn new() -> BlobWriter {
        BlobWriter::default()
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.put_u8(value as u8);
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    /// Length-prefixed byte blob: `i32` byte count, then the bytes.
    pub fn put_blob(&mut self, bytes: &[u8]) {
        self.buf.put_i32_le(bytes.len() as i32);
        self.buf.put_slice(bytes);
    }

    /// A string is a blob of its UTF-8 bytes. Empty is fine.
    pub fn put_string(&mut self, value: &str) {
        self.put_blob(value.as_bytes());
    }

    /// A list of strings: `u64` element count, then each string.
    pub fn put_string_list(&mut self, items: &[String]) {
        self.put_u64(items.len() as u64);
        for item in items {
            self.put_string(item);
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Consuming view over received wire bytes.
#[derive(Debug)]
pub struct BlobReader<'a> {
    data: &'a [u8],
}

impl<'a> BlobReader<'a> {
    pub fn new(data: &'a [u8]) -> BlobReader<'a> {
        BlobReader { data }
    }

    /// True while any unconsumed bytes remain. Variable-length trailing
    /// sequences read elements until this turns false.
    pub fn has_more(&self) -> bool {
        !self.data.is_empty()
    }

    fn take(&mut self, count: usize) -> WireResult<&'a [u8]> {
        if self.data.len() < count {
            return Err(WireError::Truncated);
        }
        let (head, tail) = self.data.split_at(count);
        self.data = tail;
        Ok(head)
    }

    pub fn get_u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> WireResult<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidByte(other)),
        }
    }

    pub fn get_i32(&mut self) -> WireResult<i32> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    pub fn get_u64(&mut self) -> WireResult<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }

    pub fn get_i64(&mut self) -> WireResult<i64> {
        let bytes = self.take(8)?;
        Ok(i64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }

    pub fn get_blob(&mut self) -> WireResult<&'a [u8]> {
        let len = self.get_i32()?;
        if len < 0 {
            return Err(WireError::NegativeLength);
        }
        self.take(len as usize)
    }

    pub fn get_string(&mut self) -> WireResult<String> {
        let bytes = self.get_blob()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    pub fn get_string_list(&mut self) -> WireResult<Vec<String>> {
        let count = self.get_u64()?;
        // No up-front allocation by the advertised count: a corrupt frame
        // must fail on truncation, not abort on a giant reserve.
        let mut items = Vec::new();
        for _ in 0..count {
            items.push(self.get_string()?);
        }
        Ok(items)
    }
}
