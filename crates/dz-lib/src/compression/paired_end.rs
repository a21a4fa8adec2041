//! Mate information: RNEXT, PNEXT and TLEN.

use anyhow::Result;
use rustc_hash::FxHashMap;

use super::backend::ByteBackend;
use super::bytes::{write_cstr, write_varint, write_zigzag, ByteReader};
use super::edit_operation::EditOperation;
use super::{BlockCompressor, BlockDecompressor};
use crate::DzError;

/// Mate fields of one record.
///
/// `pos` is 0-based when `chr` names a chromosome and the raw PNEXT when
/// `chr` is `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedEndInfo {
    pub chr: String,
    pub pos: i64,
    pub tlen: i32,
}

impl PairedEndInfo {
    pub fn from_sam(rnext: &str, pnext: u64, tlen: i32) -> Self {
        let pos = if rnext == "*" { pnext as i64 } else { pnext as i64 - 1 };
        Self {
            chr: rnext.to_string(),
            pos,
            tlen,
        }
    }

    /// PNEXT in the 1-based SAM convention.
    pub fn sam_position(&self) -> i64 {
        if self.chr == "*" {
            self.pos
        } else {
            self.pos + 1
        }
    }

    /// Mate on the record's own chromosome: position is delta coded.
    fn is_local(&self, chromosome: &str) -> bool {
        self.chr == "=" || self.chr == chromosome
    }
}

pub(crate) struct PairedEndCompressor {
    backend: ByteBackend,
    records: Vec<(PairedEndInfo, String, u64)>,
}

impl PairedEndCompressor {
    pub(crate) fn new(backend: ByteBackend) -> Self {
        Self { backend, records: Vec::new() }
    }

    /// Queue mate info of a record placed on `chromosome` at 0-based `start`.
    pub(crate) fn add_record(&mut self, info: PairedEndInfo, chromosome: &str, start: u64) {
        self.records.push((info, chromosome.to_string(), start));
    }
}

impl BlockCompressor for PairedEndCompressor {
    fn output_records(&mut self, k: usize, _edit_ops: &[EditOperation]) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        write_varint(&mut buffer, k as u64);
        let mut dictionary: FxHashMap<String, u64> = FxHashMap::default();
        for (info, chromosome, start) in self.records.drain(..k) {
            match dictionary.get(&info.chr) {
                Some(&id) => write_varint(&mut buffer, id + 1),
                None => {
                    write_varint(&mut buffer, 0);
                    write_cstr(&mut buffer, info.chr.as_bytes());
                    let id = dictionary.len() as u64;
                    dictionary.insert(info.chr.clone(), id);
                }
            }
            if info.is_local(&chromosome) {
                write_zigzag(&mut buffer, info.pos - start as i64);
            } else {
                write_zigzag(&mut buffer, info.pos);
            }
            write_zigzag(&mut buffer, i64::from(info.tlen));
        }
        let mut out = Vec::new();
        self.backend.write_stream(&mut out, &buffer)?;
        Ok(out)
    }
}

struct StoredMate {
    chr: usize,
    pos: i64,
    tlen: i32,
}

pub(crate) struct PairedEndDecompressor {
    backend: ByteBackend,
    dictionary: Vec<String>,
    records: Vec<StoredMate>,
    next: usize,
}

impl PairedEndDecompressor {
    pub(crate) fn new(backend: ByteBackend) -> Self {
        Self {
            backend,
            dictionary: Vec::new(),
            records: Vec::new(),
            next: 0,
        }
    }

    /// Mate info of the next record, placed on `chromosome` at 0-based `start`.
    pub(crate) fn get_record(&mut self, chromosome: &str, start: u64) -> Result<PairedEndInfo> {
        let stored = self
            .records
            .get(self.next)
            .ok_or_else(|| DzError::format("paired-end stream exhausted"))?;
        self.next += 1;
        let mut info = PairedEndInfo {
            chr: self.dictionary[stored.chr].clone(),
            pos: stored.pos,
            tlen: stored.tlen,
        };
        if info.is_local(chromosome) {
            info.pos += start as i64;
        }
        Ok(info)
    }
}

impl BlockDecompressor for PairedEndDecompressor {
    fn import_records(&mut self, data: &[u8]) -> Result<()> {
        let buffer = self.backend.read_stream(&mut ByteReader::new(data))?;
        let mut reader = ByteReader::new(&buffer);
        let count = reader.read_len()?;
        self.dictionary.clear();
        self.records.clear();
        self.next = 0;
        for _ in 0..count {
            let chr = match reader.read_len()? {
                0 => {
                    self.dictionary.push(reader.read_string()?);
                    self.dictionary.len() - 1
                }
                id if id <= self.dictionary.len() => id - 1,
                id => return Err(DzError::format(format!("unknown mate chromosome id {id}"))),
            };
            let pos = reader.read_zigzag()?;
            let tlen = i32::try_from(reader.read_zigzag()?)
                .map_err(|_| DzError::format("template length out of range"))?;
            self.records.push(StoredMate { chr, pos, tlen });
        }
        Ok(())
    }

    fn has_record(&self) -> bool {
        self.next < self.records.len()
    }
}
