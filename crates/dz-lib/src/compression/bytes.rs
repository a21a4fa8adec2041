//! Varint, zig-zag and length-prefixed helpers plus a bounds-checked reader.

use anyhow::Result;

use crate::DzError;

/// Maximum varint size in bytes (10 bytes = up to 70 bits, enough for u64)
const MAX_VARINT_BYTES: usize = 10;

/// Write variable-length integer
#[inline]
pub(crate) fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push(((value & 0x7F) | 0x80) as u8);
        value >>= 7;
    }
    buf.push(value as u8);
}

#[inline]
pub(crate) fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub(crate) fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[inline]
pub(crate) fn write_zigzag(buf: &mut Vec<u8>, value: i64) {
    write_varint(buf, zigzag_encode(value));
}

#[inline]
pub(crate) fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn write_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Append `bytes` followed by a NUL terminator.
#[inline]
pub(crate) fn write_cstr(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(bytes);
    buf.push(0);
}

/// Append a `u64` length prefix followed by `bytes`.
#[inline]
pub(crate) fn write_sized(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_u64(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Cursor over an in-memory buffer; every read fails with a format error on
/// truncation instead of panicking.
#[derive(Debug, Clone)]
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn truncated(&self, what: &str) -> anyhow::Error {
        DzError::format(format!("truncated {what} at offset {}", self.pos))
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| self.truncated("data"))?;
        let data = self.data;
        let slice = &data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        let byte = *self.data.get(self.pos).ok_or_else(|| self.truncated("byte"))?;
        self.pos += 1;
        Ok(byte)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        let mut array = [0u8; 8];
        array.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(array))
    }

    pub(crate) fn read_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0;
        for _ in 0..MAX_VARINT_BYTES {
            let byte = self.read_u8().map_err(|_| self.truncated("varint"))?;
            value |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
        Err(DzError::format(format!("malformed varint at offset {}", self.pos)))
    }

    pub(crate) fn read_zigzag(&mut self) -> Result<i64> {
        self.read_varint().map(zigzag_decode)
    }

    /// Read a varint that must fit a `usize` length or count.
    pub(crate) fn read_len(&mut self) -> Result<usize> {
        let value = self.read_varint()?;
        usize::try_from(value).map_err(|_| DzError::format(format!("length {value} out of range")))
    }

    /// Read bytes up to (not including) the next NUL, consuming the NUL.
    pub(crate) fn read_cstr(&mut self) -> Result<&'a [u8]> {
        let data = self.data;
        let rest = &data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.truncated("string"))?;
        self.pos += nul + 1;
        Ok(&rest[..nul])
    }

    pub(crate) fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_cstr()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DzError::format(format!("invalid UTF-8 string before offset {}", self.pos)))
    }

    /// Read a `u64` length prefix followed by that many bytes.
    pub(crate) fn read_sized(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u64()?;
        let len = usize::try_from(len)
            .map_err(|_| DzError::format(format!("section length {len} out of range")))?;
        self.read_bytes(len)
    }
}
