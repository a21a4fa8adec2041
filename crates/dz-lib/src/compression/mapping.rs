//! Mapping flag (`u16`) and mapping quality (`u8`) columns.

use anyhow::Result;
use std::marker::PhantomData;

use super::backend::ByteBackend;
use super::bytes::ByteReader;
use super::edit_operation::EditOperation;
use super::{BlockCompressor, BlockDecompressor};
use crate::DzError;

/// Fixed-width little-endian integer column.
pub(crate) trait PackedInt: Copy + Send + 'static {
    const WIDTH: usize;
    const NAME: &'static str;
    fn write(self, out: &mut Vec<u8>);
    fn read(bytes: &[u8]) -> Self;
}

impl PackedInt for u16 {
    const WIDTH: usize = 2;
    const NAME: &'static str = "mapping flag";
    fn write(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read(bytes: &[u8]) -> Self {
        u16::from_le_bytes([bytes[0], bytes[1]])
    }
}

impl PackedInt for u8 {
    const WIDTH: usize = 1;
    const NAME: &'static str = "mapping quality";
    fn write(self, out: &mut Vec<u8>) {
        out.push(self);
    }
    fn read(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

pub(crate) struct IntegerCompressor<T: PackedInt> {
    backend: ByteBackend,
    values: Vec<T>,
}

impl<T: PackedInt> IntegerCompressor<T> {
    pub(crate) fn new(backend: ByteBackend) -> Self {
        Self { backend, values: Vec::new() }
    }

    pub(crate) fn add_record(&mut self, value: T) {
        self.values.push(value);
    }
}

impl<T: PackedInt> BlockCompressor for IntegerCompressor<T> {
    fn output_records(&mut self, k: usize, _edit_ops: &[EditOperation]) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(k * T::WIDTH);
        for value in self.values.drain(..k) {
            value.write(&mut buffer);
        }
        let mut out = Vec::new();
        self.backend.write_stream(&mut out, &buffer)?;
        Ok(out)
    }
}

pub(crate) struct IntegerDecompressor<T: PackedInt> {
    backend: ByteBackend,
    buffer: Vec<u8>,
    next: usize,
    _marker: PhantomData<T>,
}

impl<T: PackedInt> IntegerDecompressor<T> {
    pub(crate) fn new(backend: ByteBackend) -> Self {
        Self {
            backend,
            buffer: Vec::new(),
            next: 0,
            _marker: PhantomData,
        }
    }

    pub(crate) fn get_record(&mut self) -> Result<T> {
        let offset = self.next * T::WIDTH;
        let bytes = self
            .buffer
            .get(offset..offset + T::WIDTH)
            .ok_or_else(|| DzError::format(format!("{} stream exhausted", T::NAME)))?;
        self.next += 1;
        Ok(T::read(bytes))
    }
}

impl<T: PackedInt> BlockDecompressor for IntegerDecompressor<T> {
    fn import_records(&mut self, data: &[u8]) -> Result<()> {
        self.buffer = self.backend.read_stream(&mut ByteReader::new(data))?;
        self.next = 0;
        if self.buffer.len() % T::WIDTH != 0 {
            return Err(DzError::format(format!("{} stream has a partial value", T::NAME)));
        }
        Ok(())
    }

    fn has_record(&self) -> bool {
        (self.next + 1) * T::WIDTH <= self.buffer.len()
    }
}

pub(crate) type MappingFlagCompressor = IntegerCompressor<u16>;
pub(crate) type MappingFlagDecompressor = IntegerDecompressor<u16>;
pub(crate) type MappingQualityCompressor = IntegerCompressor<u8>;
pub(crate) type MappingQualityDecompressor = IntegerDecompressor<u8>;
