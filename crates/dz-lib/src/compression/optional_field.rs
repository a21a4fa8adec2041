//! Optional SAM tags.
//!
//! Every distinct `(tag, type, encoding)` key of a block gets its own value
//! stream. A per-block index lists, for each record, the keys it carries as
//! zig-zag deltas against the previous key index; a key is introduced inline
//! the first time it is referenced. Key streams are compressed in parallel
//! once the whole block has been split.
//!
//! Encodings: characters as one byte, integers at the smallest exact width
//! (the width is part of the key), floats as `f32`, library tags (`PG`, `RG`,
//! `LB`, `PU`) as ids into a per-block table, everything else as NUL
//! terminated text. MD, XD and NM are not stored when they match what the
//! edit operation recomputes.

use anyhow::Result;
use rayon::prelude::*;
use rustc_hash::FxHashMap;

use super::backend::{ByteBackend, ByteCompressor};
use super::bytes::{write_cstr, write_sized, write_u64, write_varint, write_zigzag, ByteReader};
use super::edit_operation::{xd_from_md, EditOperation};
use super::range_coder::{compress_order2, decompress_order2};
use super::stats::SessionStats;
use super::{BlockCompressor, BlockDecompressor};
use crate::DzError;

const LIBRARY_TAGS: [[u8; 2]; 4] = [*b"PG", *b"RG", *b"LB", *b"PU"];
const QUALITY_TAGS: [[u8; 2]; 7] = [*b"BQ", *b"CQ", *b"E2", *b"OQ", *b"QT", *b"Q2", *b"U2"];

/// The tag index is always gzip'd, whatever backend packs the key streams.
const INDEX_BACKEND: ByteBackend = ByteBackend::Gzip { level: 6 };

const ENC_TEXT: u8 = b'Z';
const ENC_CHAR: u8 = b'A';
const ENC_FLOAT: u8 = b'f';
const ENC_LIBRARY: u8 = b'L';
const ENC_DERIVED: u8 = b'D';

/// Leading byte of a character stream: plain bytes or `(byte, varint run)` pairs.
const CHARS_PLAIN: u8 = 0;
const CHARS_RUNS: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TagKey {
    tag: [u8; 2],
    ty: u8,
    encoding: u8,
}

impl TagKey {
    fn to_bytes(self) -> [u8; 4] {
        [self.tag[0], self.tag[1], self.ty, self.encoding]
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key = Self {
            tag: [bytes[0], bytes[1]],
            ty: bytes[2],
            encoding: bytes[3],
        };
        match key.encoding {
            ENC_TEXT | ENC_CHAR | ENC_FLOAT | ENC_LIBRARY | ENC_DERIVED | b'1' | b'2' | b'4' | b'8' => {
                Ok(key)
            }
            other => Err(DzError::format(format!("unknown tag encoding {:?}", other as char))),
        }
    }

    fn uses_range_coder(&self) -> bool {
        self.encoding == ENC_TEXT && QUALITY_TAGS.contains(&self.tag)
    }
}

/// One `TAG:TYPE:VALUE` entry in text form.
#[derive(Debug, Clone)]
struct RawTag {
    tag: [u8; 2],
    ty: u8,
    value: Vec<u8>,
}

fn parse_tags(blob: &[u8]) -> Result<Vec<RawTag>> {
    if blob.is_empty() {
        return Ok(Vec::new());
    }
    blob.split(|&b| b == b'\t')
        .map(|field| {
            if field.len() < 5 || field[2] != b':' || field[4] != b':' {
                return Err(DzError::format(format!(
                    "malformed optional field {:?}",
                    String::from_utf8_lossy(field)
                )));
            }
            if field[5..].contains(&0) {
                return Err(DzError::format("optional field value contains a NUL byte"));
            }
            Ok(RawTag {
                tag: [field[0], field[1]],
                ty: field[3],
                value: field[5..].to_vec(),
            })
        })
        .collect()
}

/// Smallest width among 1/2/4/8 bytes holding `value` as a signed integer.
fn integer_width(value: i64) -> u8 {
    if i8::try_from(value).is_ok() {
        1
    } else if i16::try_from(value).is_ok() {
        2
    } else if i32::try_from(value).is_ok() {
        4
    } else {
        8
    }
}

fn is_integer_type(ty: u8) -> bool {
    matches!(ty, b'i' | b'c' | b'C' | b's' | b'S' | b'I')
}

/// Parse an integer only if printing it back gives the same text.
fn parse_exact_integer(text: &[u8]) -> Option<i64> {
    let value: i64 = std::str::from_utf8(text).ok()?.parse().ok()?;
    (value.to_string().as_bytes() == text).then_some(value)
}

/// Format like C's `%g`: six significant digits, trailing zeros removed.
pub(crate) fn format_g(value: f32) -> String {
    let v = f64::from(value);
    if v.is_nan() {
        return "nan".to_string();
    }
    if v.is_infinite() {
        return if v > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if v == 0.0 {
        return if v.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    let scientific = format!("{:.5e}", v);
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if !(-4..6).contains(&exponent) {
        let mantissa = trim_fraction(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{}e{}{:02}", mantissa, sign, exponent.abs());
    }
    let decimals = (5 - exponent).max(0) as usize;
    trim_fraction(&format!("{:.*}", decimals, v)).to_string()
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

/// Per-block table of library tag values.
#[derive(Default)]
struct LibraryTable {
    values: Vec<([u8; 2], Vec<Vec<u8>>)>,
    ids: FxHashMap<[u8; 2], FxHashMap<Vec<u8>, u64>>,
}

impl LibraryTable {
    fn intern(&mut self, tag: [u8; 2], value: &[u8]) -> u64 {
        if let Some(&id) = self.ids.get(&tag).and_then(|ids| ids.get(value)) {
            return id;
        }
        let slot = match self.values.iter().position(|(t, _)| *t == tag) {
            Some(slot) => slot,
            None => {
                self.values.push((tag, Vec::new()));
                self.values.len() - 1
            }
        };
        let list = &mut self.values[slot].1;
        let id = list.len() as u64;
        list.push(value.to_vec());
        self.ids.entry(tag).or_default().insert(value.to_vec(), id);
        id
    }

    fn write(&self, out: &mut Vec<u8>) {
        write_varint(out, self.values.len() as u64);
        for (tag, values) in &self.values {
            out.extend_from_slice(tag);
            write_varint(out, values.len() as u64);
            for value in values {
                write_cstr(out, value);
            }
        }
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let mut table = Self::default();
        for _ in 0..reader.read_len()? {
            let tag_bytes = reader.read_bytes(2)?;
            let tag = [tag_bytes[0], tag_bytes[1]];
            let count = reader.read_len()?;
            let mut values = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                values.push(reader.read_cstr()?.to_vec());
            }
            table.values.push((tag, values));
        }
        Ok(table)
    }

    fn lookup(&self, tag: [u8; 2], id: u64) -> Result<&[u8]> {
        self.values
            .iter()
            .find(|(t, _)| *t == tag)
            .and_then(|(_, values)| values.get(id as usize))
            .map(Vec::as_slice)
            .ok_or_else(|| DzError::format(format!("unknown library value id {id}")))
    }
}

pub(crate) struct OptionalFieldCompressor {
    backend: ByteBackend,
    records: Vec<Vec<RawTag>>,
    stats: SessionStats,
}

impl OptionalFieldCompressor {
    pub(crate) fn new(backend: ByteBackend) -> Self {
        Self {
            backend,
            records: Vec::new(),
            stats: SessionStats::default(),
        }
    }

    pub(crate) fn add_record(&mut self, blob: &[u8]) -> Result<()> {
        self.records.push(parse_tags(blob)?);
        Ok(())
    }

    /// MD/XD/NM recomputation counters accumulated so far.
    pub(crate) fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Choose the key for one tag and append its value bytes to `value`.
    fn encode_value(
        &mut self,
        tag: &RawTag,
        eo: &EditOperation,
        libraries: &mut LibraryTable,
        value: &mut Vec<u8>,
    ) -> TagKey {
        let key = |encoding| TagKey {
            tag: tag.tag,
            ty: tag.ty,
            encoding,
        };

        match (&tag.tag, tag.ty) {
            (b"MD", b'Z') => {
                self.stats.md_total += 1;
                if eo.md.as_deref().map(str::as_bytes) == Some(&tag.value[..]) {
                    return key(ENC_DERIVED);
                }
                self.stats.md_failed += 1;
            }
            (b"XD", b'Z') => {
                self.stats.xd_total += 1;
                if eo.md.as_deref().map(xd_from_md).as_deref().map(str::as_bytes) == Some(&tag.value[..]) {
                    return key(ENC_DERIVED);
                }
                self.stats.xd_failed += 1;
            }
            (b"NM", ty) if is_integer_type(ty) => {
                self.stats.nm_total += 1;
                if eo.nm.is_some() && parse_exact_integer(&tag.value) == eo.nm.map(i64::from) {
                    return key(ENC_DERIVED);
                }
                self.stats.nm_failed += 1;
            }
            _ => {}
        }

        if tag.ty == b'Z' && LIBRARY_TAGS.contains(&tag.tag) {
            write_varint(value, libraries.intern(tag.tag, &tag.value));
            return key(ENC_LIBRARY);
        }
        if tag.ty == b'A' && tag.value.len() == 1 {
            value.push(tag.value[0]);
            return key(ENC_CHAR);
        }
        if is_integer_type(tag.ty) {
            if let Some(n) = parse_exact_integer(&tag.value) {
                let width = integer_width(n);
                value.extend_from_slice(&n.to_le_bytes()[..width as usize]);
                return key(b'0' + width);
            }
        }
        if matches!(tag.ty, b'f' | b'd') {
            let parsed = std::str::from_utf8(&tag.value).ok().and_then(|s| s.parse::<f32>().ok());
            if let Some(f) = parsed {
                value.extend_from_slice(&f.to_le_bytes());
                return key(ENC_FLOAT);
            }
        }
        write_cstr(value, &tag.value);
        key(ENC_TEXT)
    }
}

/// Runs of equal bytes as `(byte, varint length)` pairs.
fn encode_runs(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let byte = data[i];
        let len = data[i..].iter().take_while(|&&b| b == byte).count();
        out.push(byte);
        write_varint(&mut out, len as u64);
        i += len;
    }
    out
}

fn decode_runs(data: &[u8], raw_size: u64) -> Result<Vec<u8>> {
    let mut reader = ByteReader::new(data);
    let mut out = Vec::new();
    while !reader.is_empty() {
        let byte = reader.read_u8()?;
        let len = reader.read_varint()?;
        if out.len() as u64 + len > raw_size {
            return Err(DzError::format("character run past end of stream"));
        }
        out.resize(out.len() + len as usize, byte);
    }
    Ok(out)
}

fn compress_key_stream(backend: ByteBackend, key: &TagKey, data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if key.uses_range_coder() {
        return Ok(compress_order2(data));
    }
    if key.encoding == ENC_CHAR {
        let runs = encode_runs(data);
        let mut body = Vec::with_capacity(1 + runs.len().min(data.len()));
        if runs.len() < data.len() {
            body.push(CHARS_RUNS);
            body.extend_from_slice(&runs);
        } else {
            body.push(CHARS_PLAIN);
            body.extend_from_slice(data);
        }
        return backend.compress(&body);
    }
    backend.compress(data)
}

fn decompress_key_stream(backend: ByteBackend, key: &TagKey, raw_size: u64, data: &[u8]) -> Result<Vec<u8>> {
    if raw_size == 0 {
        return Ok(Vec::new());
    }
    let out = if key.uses_range_coder() {
        decompress_order2(data)?
    } else if key.encoding == ENC_CHAR {
        let body = backend.decompress(data)?;
        match body.split_first() {
            Some((&CHARS_PLAIN, chars)) => chars.to_vec(),
            Some((&CHARS_RUNS, runs)) => decode_runs(runs, raw_size)?,
            _ => return Err(DzError::format("bad character stream header")),
        }
    } else {
        backend.decompress(data)?
    };
    if out.len() as u64 != raw_size {
        return Err(DzError::format(format!(
            "tag {} stream size mismatch",
            String::from_utf8_lossy(&key.tag)
        )));
    }
    Ok(out)
}

impl BlockCompressor for OptionalFieldCompressor {
    fn output_records(&mut self, k: usize, edit_ops: &[EditOperation]) -> Result<Vec<u8>> {
        let records: Vec<Vec<RawTag>> = self.records.drain(..k).collect();

        // Phase 1: assign keys and split values into per-key buffers
        let mut keys: Vec<TagKey> = Vec::new();
        let mut key_ids: FxHashMap<TagKey, usize> = FxHashMap::default();
        let mut buffers: Vec<Vec<u8>> = Vec::new();
        let mut libraries = LibraryTable::default();
        let mut tag_list = Vec::new();
        let mut value = Vec::new();

        write_varint(&mut tag_list, k as u64);
        for (tags, eo) in records.iter().zip(edit_ops) {
            write_varint(&mut tag_list, tags.len() as u64);
            let mut prev: i64 = -1;
            for tag in tags {
                value.clear();
                let key = self.encode_value(tag, eo, &mut libraries, &mut value);
                let (idx, is_new) = match key_ids.get(&key) {
                    Some(&idx) => (idx, false),
                    None => {
                        keys.push(key);
                        buffers.push(Vec::new());
                        key_ids.insert(key, keys.len() - 1);
                        (keys.len() - 1, true)
                    }
                };
                write_zigzag(&mut tag_list, idx as i64 - prev);
                if is_new {
                    tag_list.extend_from_slice(&key.to_bytes());
                }
                prev = idx as i64;
                buffers[idx].extend_from_slice(&value);
            }
        }

        let mut index = Vec::new();
        libraries.write(&mut index);
        index.extend_from_slice(&tag_list);

        // Phase 2: compress every key stream in parallel
        let backend = self.backend;
        let compressed = keys
            .par_iter()
            .zip(buffers.par_iter())
            .map(|(key, data)| compress_key_stream(backend, key, data))
            .collect::<Result<Vec<_>>>()?;

        let mut out = Vec::new();
        INDEX_BACKEND.write_stream(&mut out, &index)?;
        for (data, packed) in buffers.iter().zip(&compressed) {
            write_u64(&mut out, data.len() as u64);
            if !data.is_empty() {
                write_sized(&mut out, packed);
            }
        }
        Ok(out)
    }
}

enum Piece {
    Text(Vec<u8>),
    Derived(TagKey),
}

pub(crate) struct OptionalFieldDecompressor {
    backend: ByteBackend,
    records: Vec<Vec<Piece>>,
    next: usize,
}

impl OptionalFieldDecompressor {
    pub(crate) fn new(backend: ByteBackend) -> Self {
        Self {
            backend,
            records: Vec::new(),
            next: 0,
        }
    }

    /// Tag text of the next record, with derived tags filled in from `eo`.
    pub(crate) fn get_record(&mut self, eo: &EditOperation) -> Result<Vec<u8>> {
        let pieces = self
            .records
            .get_mut(self.next)
            .map(std::mem::take)
            .ok_or_else(|| DzError::format("optional field stream exhausted"))?;
        self.next += 1;

        let mut out = Vec::new();
        for (i, piece) in pieces.into_iter().enumerate() {
            if i > 0 {
                out.push(b'\t');
            }
            match piece {
                Piece::Text(text) => out.extend_from_slice(&text),
                Piece::Derived(key) => {
                    out.extend_from_slice(&[key.tag[0], key.tag[1], b':', key.ty, b':']);
                    let missing = || DzError::format("derived tag without an alignment");
                    match &key.tag {
                        b"MD" => out.extend_from_slice(eo.md.as_ref().ok_or_else(missing)?.as_bytes()),
                        b"XD" => out.extend_from_slice(xd_from_md(eo.md.as_ref().ok_or_else(missing)?).as_bytes()),
                        _ => {
                            let nm = eo.nm.ok_or_else(missing)?;
                            out.extend_from_slice(nm.to_string().as_bytes());
                        }
                    }
                }
            }
        }
        Ok(out)
    }
}

fn decode_value(key: &TagKey, stream: &mut ByteReader<'_>, libraries: &LibraryTable) -> Result<Vec<u8>> {
    let mut text = vec![key.tag[0], key.tag[1], b':', key.ty, b':'];
    match key.encoding {
        ENC_TEXT => text.extend_from_slice(stream.read_cstr()?),
        ENC_CHAR => text.push(stream.read_u8()?),
        ENC_LIBRARY => text.extend_from_slice(libraries.lookup(key.tag, stream.read_varint()?)?),
        ENC_FLOAT => {
            let f = f32::from_bits(stream.read_u32()?);
            text.extend_from_slice(format_g(f).as_bytes());
        }
        width @ (b'1' | b'2' | b'4' | b'8') => {
            let width = (width - b'0') as usize;
            let bytes = stream.read_bytes(width)?;
            let fill = if bytes[width - 1] & 0x80 != 0 { 0xFF } else { 0 };
            let mut le = [fill; 8];
            le[..width].copy_from_slice(bytes);
            text.extend_from_slice(i64::from_le_bytes(le).to_string().as_bytes());
        }
        other => return Err(DzError::format(format!("unknown tag encoding {:?}", other as char))),
    }
    Ok(text)
}

impl BlockDecompressor for OptionalFieldDecompressor {
    fn import_records(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(data);
        let index = INDEX_BACKEND.read_stream(&mut reader)?;
        let mut index_reader = ByteReader::new(&index);
        let libraries = LibraryTable::read(&mut index_reader)?;

        let count = index_reader.read_len()?;
        let mut keys: Vec<TagKey> = Vec::new();
        let mut record_keys: Vec<Vec<usize>> = Vec::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            let n_tags = index_reader.read_len()?;
            let mut ids = Vec::with_capacity(n_tags.min(64));
            let mut prev: i64 = -1;
            for _ in 0..n_tags {
                let idx = prev + index_reader.read_zigzag()?;
                let idx = usize::try_from(idx)
                    .ok()
                    .filter(|&i| i <= keys.len())
                    .ok_or_else(|| DzError::format(format!("invalid tag key index {idx}")))?;
                if idx == keys.len() {
                    keys.push(TagKey::from_bytes(index_reader.read_bytes(4)?)?);
                }
                ids.push(idx);
                prev = idx as i64;
            }
            record_keys.push(ids);
        }

        let mut packed = Vec::with_capacity(keys.len());
        for _ in 0..keys.len() {
            let raw_size = reader.read_u64()?;
            let data = if raw_size == 0 { &[][..] } else { reader.read_sized()? };
            packed.push((raw_size, data));
        }
        let backend = self.backend;
        let streams = keys
            .par_iter()
            .zip(packed.par_iter())
            .map(|(key, (raw_size, data))| decompress_key_stream(backend, key, *raw_size, data))
            .collect::<Result<Vec<_>>>()?;

        let mut cursors: Vec<ByteReader<'_>> = streams.iter().map(|s| ByteReader::new(s)).collect();
        self.records.clear();
        self.next = 0;
        for ids in record_keys {
            let mut pieces = Vec::with_capacity(ids.len());
            for idx in ids {
                let key = &keys[idx];
                if key.encoding == ENC_DERIVED {
                    pieces.push(Piece::Derived(*key));
                } else {
                    pieces.push(Piece::Text(decode_value(key, &mut cursors[idx], &libraries)?));
                }
            }
            self.records.push(pieces);
        }
        Ok(())
    }

    fn has_record(&self) -> bool {
        self.next < self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::edit_operation::parse_cigar;
    use crate::compression::genome_fix::{Genome, GenomeFixes};
    use crate::io::Reference;

    fn edit_op(seq: &[u8], cigar: &str) -> EditOperation {
        let reference = Reference::with_bases("chr1", b"ACGTACGTAC");
        let fixes = GenomeFixes::new();
        EditOperation::build(0, seq.to_vec(), parse_cigar(cigar).unwrap(), &Genome::new(&reference, &fixes))
    }

    fn roundtrip(blobs: &[&[u8]], edit_ops: &[EditOperation]) -> (Vec<Vec<u8>>, SessionStats, usize) {
        let backend = ByteBackend::Gzip { level: 6 };
        let mut compressor = OptionalFieldCompressor::new(backend);
        for blob in blobs {
            compressor.add_record(blob).unwrap();
        }
        let data = compressor.output_records(blobs.len(), edit_ops).unwrap();

        let mut decompressor = OptionalFieldDecompressor::new(backend);
        decompressor.import_records(&data).unwrap();
        let decoded = edit_ops.iter().map(|eo| decompressor.get_record(eo).unwrap()).collect();
        assert!(!decompressor.has_record());
        (decoded, compressor.stats().clone(), data.len())
    }

    #[test]
    fn test_mixed_tags_roundtrip() {
        let blobs: Vec<&[u8]> = vec![
            b"RG:Z:grp1\tAS:i:-12\tXT:A:U\tXS:i:70000\tZB:B:c,1,2".as_slice(),
            b"".as_slice(),
            b"RG:Z:grp2\tOQ:Z:IIIIHH\tXF:f:0.5\tXL:i:5000000000".as_slice(),
            b"RG:Z:grp1\tAS:i:0\tXT:A:R\tXS:i:-70000".as_slice(),
        ];
        let edit_ops: Vec<EditOperation> = (0..blobs.len()).map(|_| edit_op(b"ACGT", "4M")).collect();
        let (decoded, stats, _) = roundtrip(&blobs, &edit_ops);
        for (blob, out) in blobs.iter().zip(&decoded) {
            assert_eq!(out.as_slice(), *blob);
        }
        assert_eq!(stats.md_total, 0);
    }

    #[test]
    fn test_character_runs() {
        let blobs: Vec<&[u8]> = (0..40)
            .map(|i| if i < 30 { b"XT:A:U".as_slice() } else { b"XT:A:R".as_slice() })
            .collect();
        let edit_ops: Vec<EditOperation> = blobs.iter().map(|_| edit_op(b"ACGT", "4M")).collect();
        let (decoded, _, _) = roundtrip(&blobs, &edit_ops);
        assert_eq!(decoded, blobs.iter().map(|b| b.to_vec()).collect::<Vec<_>>());

        let key = TagKey { tag: *b"XT", ty: b'A', encoding: ENC_CHAR };
        let backend = ByteBackend::Gzip { level: 6 };
        for data in [b"UUUUUUUURRR".as_slice(), b"URUR".as_slice()] {
            let packed = compress_key_stream(backend, &key, data).unwrap();
            let body = backend.decompress(&packed).unwrap();
            assert_eq!(body[0], if data.len() > 4 { CHARS_RUNS } else { CHARS_PLAIN });
            assert_eq!(decompress_key_stream(backend, &key, data.len() as u64, &packed).unwrap(), data);
        }
        assert!(decode_runs(&encode_runs(b"AAAA"), 3).is_err());
    }

    #[test]
    fn test_library_interning() {
        let mut table = LibraryTable::default();
        assert_eq!(table.intern(*b"RG", b"grp1"), 0);
        assert_eq!(table.intern(*b"RG", b"grp2"), 1);
        assert_eq!(table.intern(*b"PG", b"grp1"), 0);
        assert_eq!(table.intern(*b"RG", b"grp1"), 0);
        let mut out = Vec::new();
        table.write(&mut out);
        let restored = LibraryTable::read(&mut ByteReader::new(&out)).unwrap();
        assert_eq!(restored.lookup(*b"RG", 1).unwrap(), b"grp2");
        assert_eq!(restored.lookup(*b"PG", 0).unwrap(), b"grp1");
        assert!(restored.lookup(*b"LB", 0).is_err());
    }

    #[test]
    fn test_derived_md_nm_xd() {
        let eo = edit_op(b"ACTT", "4M");
        assert_eq!(eo.md.as_deref(), Some("2G1"));
        let blob: &[u8] = b"NM:i:1\tMD:Z:2G1\tXD:Z:2G1";
        let (decoded, stats, derived_size) = roundtrip(&[blob], &[eo.clone()]);
        assert_eq!(decoded[0], blob);
        assert_eq!((stats.md_total, stats.md_failed), (1, 0));
        assert_eq!((stats.xd_total, stats.xd_failed), (1, 0));
        assert_eq!((stats.nm_total, stats.nm_failed), (1, 0));

        // Same shape but values that disagree with the alignment are stored verbatim
        let wrong: &[u8] = b"NM:i:3\tMD:Z:0A3\tXD:Z:A3";
        let (decoded, stats, stored_size) = roundtrip(&[wrong], &[eo]);
        assert_eq!(decoded[0], wrong);
        assert_eq!((stats.md_total, stats.md_failed), (1, 1));
        assert_eq!((stats.xd_total, stats.xd_failed), (1, 1));
        assert_eq!((stats.nm_total, stats.nm_failed), (1, 1));
        assert!(stored_size > derived_size);
    }

    #[test]
    fn test_non_canonical_integer_kept_as_text() {
        let eo = edit_op(b"ACGT", "4M");
        let blob: &[u8] = b"XN:i:+7\tNM:i:00";
        let (decoded, stats, _) = roundtrip(&[blob], &[eo]);
        assert_eq!(decoded[0], blob);
        assert_eq!(stats.nm_failed, 1);
    }

    #[test]
    fn test_malformed_tag_rejected() {
        let mut compressor = OptionalFieldCompressor::new(ByteBackend::Gzip { level: 6 });
        assert!(compressor.add_record(b"XYZ").is_err());
        assert!(compressor.add_record(b"AS:i:1\t").is_err());
    }

    #[test]
    fn test_integer_width() {
        assert_eq!(integer_width(-128), 1);
        assert_eq!(integer_width(128), 2);
        assert_eq!(integer_width(70_000), 4);
        assert_eq!(integer_width(5_000_000_000), 8);
    }

    #[test]
    fn test_format_g() {
        assert_eq!(format_g(0.5), "0.5");
        assert_eq!(format_g(3.0), "3");
        assert_eq!(format_g(-2.25), "-2.25");
        assert_eq!(format_g(12345.678), "12345.7");
        assert_eq!(format_g(1e-5), "1e-05");
        assert_eq!(format_g(123456789.0), "1.23457e+08");
        assert_eq!(format_g(0.0), "0");
    }
}
