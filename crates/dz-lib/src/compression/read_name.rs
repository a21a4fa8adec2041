//! Read names: shared-prefix delta against the previous name.

use anyhow::Result;

use super::backend::ByteBackend;
use super::bytes::{write_cstr, write_varint, ByteReader};
use super::edit_operation::EditOperation;
use super::{BlockCompressor, BlockDecompressor};
use crate::DzError;

pub(crate) struct ReadNameCompressor {
    backend: ByteBackend,
    names: Vec<Vec<u8>>,
}

impl ReadNameCompressor {
    pub(crate) fn new(backend: ByteBackend) -> Self {
        Self { backend, names: Vec::new() }
    }

    pub(crate) fn add_record(&mut self, name: &[u8]) -> Result<()> {
        if name.contains(&0) {
            return Err(DzError::format("read name contains a NUL byte"));
        }
        self.names.push(name.to_vec());
        Ok(())
    }
}

fn shared_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

impl BlockCompressor for ReadNameCompressor {
    fn output_records(&mut self, k: usize, _edit_ops: &[EditOperation]) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        write_varint(&mut buffer, k as u64);
        let mut prev: &[u8] = &[];
        for name in &self.names[..k] {
            let shared = shared_prefix(prev, name);
            write_varint(&mut buffer, shared as u64);
            write_cstr(&mut buffer, &name[shared..]);
            prev = name;
        }
        let mut out = Vec::new();
        self.backend.write_stream(&mut out, &buffer)?;
        self.names.drain(..k);
        Ok(out)
    }
}

pub(crate) struct ReadNameDecompressor {
    backend: ByteBackend,
    names: Vec<Vec<u8>>,
    next: usize,
}

impl ReadNameDecompressor {
    pub(crate) fn new(backend: ByteBackend) -> Self {
        Self { backend, names: Vec::new(), next: 0 }
    }

    pub(crate) fn get_record(&mut self) -> Result<Vec<u8>> {
        let name = self
            .names
            .get_mut(self.next)
            .map(std::mem::take)
            .ok_or_else(|| DzError::format("read name stream exhausted"))?;
        self.next += 1;
        Ok(name)
    }
}

impl BlockDecompressor for ReadNameDecompressor {
    fn import_records(&mut self, data: &[u8]) -> Result<()> {
        let buffer = self.backend.read_stream(&mut ByteReader::new(data))?;
        let mut reader = ByteReader::new(&buffer);
        let count = reader.read_len()?;
        self.names.clear();
        self.next = 0;
        let mut prev: Vec<u8> = Vec::new();
        for _ in 0..count {
            let shared = reader.read_len()?;
            if shared > prev.len() {
                return Err(DzError::format("read name prefix longer than previous name"));
            }
            let mut name = prev[..shared].to_vec();
            name.extend_from_slice(reader.read_cstr()?);
            prev.clone_from(&name);
            self.names.push(name);
        }
        Ok(())
    }

    fn has_record(&self) -> bool {
        self.next < self.names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_delta_roundtrip() {
        let names: Vec<&[u8]> = vec![
            b"SRR001.1".as_slice(),
            b"SRR001.2".as_slice(),
            b"SRR001.10".as_slice(),
            b"SRR001.10".as_slice(),
            b"other".as_slice(),
            b"".as_slice(),
        ];
        let backend = ByteBackend::Gzip { level: 6 };
        let mut compressor = ReadNameCompressor::new(backend);
        for name in &names {
            compressor.add_record(name).unwrap();
        }
        let data = compressor.output_records(4, &[]).unwrap();
        let rest = compressor.output_records(2, &[]).unwrap();

        let mut decompressor = ReadNameDecompressor::new(backend);
        decompressor.import_records(&data).unwrap();
        for name in &names[..4] {
            assert_eq!(decompressor.get_record().unwrap(), *name);
        }
        assert!(!decompressor.has_record());
        assert!(decompressor.get_record().is_err());

        decompressor.import_records(&rest).unwrap();
        assert_eq!(decompressor.get_record().unwrap(), b"other");
        assert_eq!(decompressor.get_record().unwrap(), b"");
    }

    #[test]
    fn test_nul_in_name_rejected() {
        let mut compressor = ReadNameCompressor::new(ByteBackend::Gzip { level: 1 });
        assert!(compressor.add_record(b"a\0b").is_err());
    }
}
