//! Edit operations: how a read differs from the (corrected) reference.
//!
//! The sequence codec turns every alignment into an [`EditOperation`]; the
//! edit-operation codec stores only what cannot be rebuilt from the genome
//! (position, CIGAR ops, mismatching and inserted bases). MD and NM are
//! recomputed from the same structure on both sides.

use anyhow::Result;
use std::fmt::Write as _;

use super::backend::ByteBackend;
use super::bytes::{write_varint, write_zigzag, ByteReader};
use super::genome_fix::Genome;
use super::{BlockCompressor, BlockDecompressor};
use crate::DzError;

/// CIGAR operation letters; the stored opcode is the index into this table.
pub const CIGAR_OPS: &[u8; 9] = b"MIDNSHP=X";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CigarOp {
    pub op: u8,
    pub len: u32,
}

impl CigarOp {
    #[inline]
    pub fn consumes_query(&self) -> bool {
        matches!(self.op, b'M' | b'I' | b'S' | b'=' | b'X')
    }

    #[inline]
    pub fn consumes_reference(&self) -> bool {
        matches!(self.op, b'M' | b'D' | b'N' | b'=' | b'X')
    }

    #[inline]
    fn is_aligned(&self) -> bool {
        matches!(self.op, b'M' | b'=' | b'X')
    }
}

/// Parse CIGAR text; `*` yields `None`.
pub fn parse_cigar(text: &str) -> Result<Option<Vec<CigarOp>>> {
    if text == "*" {
        return Ok(None);
    }
    let mut ops = Vec::new();
    let mut len: u64 = 0;
    let mut has_digits = false;
    for &b in text.as_bytes() {
        if b.is_ascii_digit() {
            len = len * 10 + u64::from(b - b'0');
            if len > u64::from(u32::MAX) {
                return Err(DzError::format(format!("CIGAR length overflow in {text}")));
            }
            has_digits = true;
        } else if CIGAR_OPS.contains(&b) && has_digits {
            ops.push(CigarOp { op: b, len: len as u32 });
            len = 0;
            has_digits = false;
        } else {
            return Err(DzError::format(format!("invalid CIGAR {text:?}")));
        }
    }
    if has_digits || ops.is_empty() {
        return Err(DzError::format(format!("invalid CIGAR {text:?}")));
    }
    Ok(Some(ops))
}

pub fn format_cigar(ops: &[CigarOp]) -> String {
    let mut text = String::with_capacity(ops.len() * 4);
    for op in ops {
        let _ = write!(text, "{}{}", op.len, op.op as char);
    }
    text
}

pub fn reference_span(ops: &[CigarOp]) -> u64 {
    ops.iter()
        .filter(|op| op.consumes_reference())
        .map(|op| u64::from(op.len))
        .sum()
}

pub fn query_length(ops: &[CigarOp]) -> u64 {
    ops.iter()
        .filter(|op| op.consumes_query())
        .map(|op| u64::from(op.len))
        .sum()
}

/// Reject CIGAR/SEQ combinations the codecs cannot represent.
pub fn check_query_length(ops: Option<&[CigarOp]>, seq: &[u8]) -> Result<()> {
    if let Some(ops) = ops {
        if !seq.is_empty() && query_length(ops) != seq.len() as u64 {
            return Err(DzError::format(format!(
                "CIGAR {} covers {} bases but SEQ has {}",
                format_cigar(ops),
                query_length(ops),
                seq.len()
            )));
        }
    }
    Ok(())
}

/// Alignment of one read against the corrected genome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOperation {
    /// 0-based alignment start
    pub start: u64,
    /// False when the SAM POS is 0 (`start` is then 0 as well)
    pub positioned: bool,
    /// 0-based exclusive end (`start` when there is no CIGAR)
    pub end: u64,
    /// Query sequence, empty for `*`
    pub seq: Vec<u8>,
    /// CIGAR ops, `None` for `*`
    pub ops: Option<Vec<CigarOp>>,
    /// MD string against the original reference
    pub md: Option<String>,
    /// Edit distance against the original reference
    pub nm: Option<u32>,
    /// Per read base: differs from the corrected genome, or is inserted/clipped
    pub substituted: Vec<bool>,
}

impl EditOperation {
    /// Build the edit operation of one alignment and compute its MD/NM.
    pub fn build(start: u64, seq: Vec<u8>, ops: Option<Vec<CigarOp>>, genome: &Genome<'_>) -> Self {
        let mut substituted = vec![false; seq.len()];
        let end = match &ops {
            Some(ops) => {
                if !seq.is_empty() {
                    let (mut q, mut r) = (0usize, start);
                    for op in ops {
                        let len = op.len as usize;
                        if op.is_aligned() {
                            for i in 0..len {
                                if let Some(&base) = seq.get(q + i) {
                                    substituted[q + i] = base != genome.fixed_base(r + i as u64);
                                }
                            }
                        } else if op.consumes_query() {
                            let hi = (q + len).min(seq.len());
                            substituted[q.min(hi)..hi].fill(true);
                        }
                        if op.consumes_query() {
                            q += len;
                        }
                        if op.consumes_reference() {
                            r += u64::from(op.len);
                        }
                    }
                }
                start + reference_span(ops)
            }
            None => start,
        };

        let mut eo = Self {
            start,
            positioned: true,
            end,
            seq,
            ops,
            md: None,
            nm: None,
            substituted,
        };
        eo.calculate_tags(genome);
        eo
    }

    pub fn cigar(&self) -> String {
        match &self.ops {
            Some(ops) => format_cigar(ops),
            None => "*".to_string(),
        }
    }

    /// Compute MD and NM against the original reference.
    ///
    /// Match runs are written even when zero before a mismatch or deletion, a
    /// deletion is `^` followed by the deleted reference bases, and an `N` in
    /// the read never counts as a match.
    fn calculate_tags(&mut self, genome: &Genome<'_>) {
        let Some(ops) = &self.ops else {
            return;
        };
        if self.seq.is_empty() {
            return;
        }

        let mut md = String::new();
        let mut matches = 0u32;
        let mut nm = 0u32;
        let (mut q, mut r) = (0usize, self.start);
        for op in ops {
            match op.op {
                b'M' | b'=' | b'X' => {
                    for _ in 0..op.len {
                        let ref_base = genome.reference_base(r);
                        let read_base = self.seq.get(q).map_or(b'N', u8::to_ascii_uppercase);
                        if read_base == ref_base && read_base != b'N' {
                            matches += 1;
                        } else {
                            let _ = write!(md, "{matches}");
                            md.push(ref_base as char);
                            matches = 0;
                            nm += 1;
                        }
                        q += 1;
                        r += 1;
                    }
                }
                b'I' => {
                    q += op.len as usize;
                    nm += op.len;
                }
                b'S' => q += op.len as usize,
                b'D' => {
                    let _ = write!(md, "{matches}");
                    md.push('^');
                    for _ in 0..op.len {
                        md.push(genome.reference_base(r) as char);
                        r += 1;
                    }
                    matches = 0;
                    nm += op.len;
                }
                b'N' => r += u64::from(op.len),
                _ => {}
            }
        }
        let _ = write!(md, "{matches}");
        self.md = Some(md);
        self.nm = Some(nm);
    }
}

/// XD is MD without zero runs between letters, with `$` closing deletions.
pub fn xd_from_md(md: &str) -> String {
    let bytes = md.as_bytes();
    let mut xd = String::with_capacity(md.len());
    let mut in_deletion = false;
    for (j, &c) in bytes.iter().enumerate() {
        if c == b'^' {
            in_deletion = true;
        }
        if c.is_ascii_digit() && in_deletion {
            in_deletion = false;
            xd.push('$');
        }
        let prev_digit = j > 0 && bytes[j - 1].is_ascii_digit();
        let next_digit = bytes.get(j + 1).is_some_and(u8::is_ascii_digit);
        if c != b'0' || prev_digit || next_digit {
            xd.push(c as char);
        }
    }
    xd
}

// ============================================================================
// Edit-operation codec
// ============================================================================

#[derive(Clone, Copy)]
enum EoStream {
    Location,
    Kind,
    Opcodes,
    SeqLen,
    Mismatch,
    Bases,
}

const EO_STREAMS: usize = 6;

const KIND_HAS_CIGAR: u8 = 1;
const KIND_HAS_SEQ: u8 = 2;
const KIND_NO_POSITION: u8 = 4;

pub(crate) struct EditOperationCompressor {
    backend: ByteBackend,
    last_location: u64,
}

impl EditOperationCompressor {
    pub(crate) fn new(backend: ByteBackend) -> Self {
        Self { backend, last_location: 0 }
    }

    /// Positions restart at the beginning of every chromosome.
    pub(crate) fn reset_location(&mut self) {
        self.last_location = 0;
    }

    fn encode_record(&mut self, eo: &EditOperation, streams: &mut [Vec<u8>; EO_STREAMS]) -> Result<()> {
        let has_seq = !eo.seq.is_empty();
        let mut kind = 0;
        if eo.positioned {
            write_zigzag(
                &mut streams[EoStream::Location as usize],
                eo.start as i64 - self.last_location as i64,
            );
            self.last_location = eo.start;
        } else {
            kind |= KIND_NO_POSITION;
        }
        if eo.ops.is_some() {
            kind |= KIND_HAS_CIGAR;
        }
        if has_seq {
            kind |= KIND_HAS_SEQ;
        }
        streams[EoStream::Kind as usize].push(kind);

        let Some(ops) = &eo.ops else {
            if has_seq {
                write_varint(&mut streams[EoStream::SeqLen as usize], eo.seq.len() as u64);
                streams[EoStream::Bases as usize].extend_from_slice(&eo.seq);
            }
            return Ok(());
        };

        let opcodes = &mut streams[EoStream::Opcodes as usize];
        write_varint(opcodes, ops.len() as u64);
        for op in ops {
            let code = CIGAR_OPS
                .iter()
                .position(|&c| c == op.op)
                .ok_or_else(|| DzError::format(format!("invalid CIGAR op {}", op.op as char)))?;
            opcodes.push(code as u8);
            write_varint(opcodes, u64::from(op.len));
        }
        if !has_seq {
            return Ok(());
        }

        check_query_length(Some(ops), &eo.seq)?;
        let mut mismatches = Vec::new();
        let mut q = 0usize;
        for op in ops {
            let len = op.len as usize;
            if op.is_aligned() {
                for i in q..q + len {
                    if eo.substituted[i] {
                        mismatches.push(i);
                        streams[EoStream::Bases as usize].push(eo.seq[i]);
                    }
                }
            } else if op.consumes_query() {
                streams[EoStream::Bases as usize].extend_from_slice(&eo.seq[q..q + len]);
            }
            if op.consumes_query() {
                q += len;
            }
        }

        let mismatch_stream = &mut streams[EoStream::Mismatch as usize];
        write_varint(mismatch_stream, mismatches.len() as u64);
        let mut next = 0usize;
        for pos in mismatches {
            write_varint(mismatch_stream, (pos - next) as u64);
            next = pos + 1;
        }
        Ok(())
    }
}

impl BlockCompressor for EditOperationCompressor {
    fn output_records(&mut self, k: usize, edit_ops: &[EditOperation]) -> Result<Vec<u8>> {
        let mut streams: [Vec<u8>; EO_STREAMS] = Default::default();
        for eo in &edit_ops[..k] {
            self.encode_record(eo, &mut streams)?;
        }
        let mut out = Vec::new();
        write_varint(&mut out, k as u64);
        for stream in &streams {
            self.backend.write_stream(&mut out, stream)?;
        }
        Ok(out)
    }

    fn index_state(&self) -> Vec<u8> {
        self.last_location.to_le_bytes().to_vec()
    }
}

/// One decoded record that still needs the genome to become an
/// [`EditOperation`].
struct PendingEditOperation {
    start: u64,
    positioned: bool,
    ops: Option<Vec<CigarOp>>,
    /// Raw sequence length for records without a CIGAR
    seq_len: usize,
    has_seq: bool,
    mismatches: Vec<usize>,
    /// Range of this record's literal bases in the bases stream
    bases: std::ops::Range<usize>,
}

pub(crate) struct EditOperationDecompressor {
    backend: ByteBackend,
    last_location: u64,
    records: Vec<PendingEditOperation>,
    bases: Vec<u8>,
    next: usize,
}

impl EditOperationDecompressor {
    pub(crate) fn new(backend: ByteBackend) -> Self {
        Self {
            backend,
            last_location: 0,
            records: Vec::new(),
            bases: Vec::new(),
            next: 0,
        }
    }

    pub(crate) fn reset_location(&mut self) {
        self.last_location = 0;
    }

    /// Rebuild the next record against the corrected genome.
    pub(crate) fn get_record(&mut self, genome: &Genome<'_>) -> Result<EditOperation> {
        let record = self
            .records
            .get(self.next)
            .ok_or_else(|| DzError::format("edit operation stream exhausted"))?;
        self.next += 1;

        let literal = &self.bases[record.bases.clone()];
        let seq = match &record.ops {
            _ if !record.has_seq => Vec::new(),
            None => literal.to_vec(),
            Some(ops) => {
                let mut seq = Vec::with_capacity(record.seq_len);
                let mut literal = literal.iter().copied();
                let mut mismatches = record.mismatches.iter().copied().peekable();
                let mut r = record.start;
                let mut take_literal = || {
                    literal
                        .next()
                        .ok_or_else(|| DzError::format("edit operation bases exhausted"))
                };
                for op in ops {
                    if op.is_aligned() {
                        for _ in 0..op.len {
                            if mismatches.peek() == Some(&seq.len()) {
                                mismatches.next();
                                seq.push(take_literal()?);
                            } else {
                                seq.push(genome.fixed_base(r));
                            }
                            r += 1;
                        }
                    } else {
                        if op.consumes_query() {
                            for _ in 0..op.len {
                                seq.push(take_literal()?);
                            }
                        }
                        if op.consumes_reference() {
                            r += u64::from(op.len);
                        }
                    }
                }
                seq
            }
        };

        let mut eo = EditOperation::build(record.start, seq, record.ops.clone(), genome);
        eo.positioned = record.positioned;
        Ok(eo)
    }
}

impl BlockDecompressor for EditOperationDecompressor {
    fn import_records(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(data);
        let count = reader.read_len()?;
        let mut streams = Vec::with_capacity(EO_STREAMS);
        for _ in 0..EO_STREAMS {
            streams.push(self.backend.read_stream(&mut reader)?);
        }

        let mut location = ByteReader::new(&streams[EoStream::Location as usize]);
        let mut kinds = ByteReader::new(&streams[EoStream::Kind as usize]);
        let mut opcodes = ByteReader::new(&streams[EoStream::Opcodes as usize]);
        let mut seq_lens = ByteReader::new(&streams[EoStream::SeqLen as usize]);
        let mut mismatch_stream = ByteReader::new(&streams[EoStream::Mismatch as usize]);

        self.records.clear();
        self.next = 0;
        let mut base_offset = 0usize;
        for _ in 0..count {
            let kind = kinds.read_u8()?;
            let positioned = kind & KIND_NO_POSITION == 0;
            let start = if positioned {
                let start = u64::try_from(self.last_location as i64 + location.read_zigzag()?)
                    .map_err(|_| DzError::format("negative alignment location"))?;
                self.last_location = start;
                start
            } else {
                0
            };
            let has_seq = kind & KIND_HAS_SEQ != 0;

            let ops = if kind & KIND_HAS_CIGAR != 0 {
                let n_ops = opcodes.read_len()?;
                let mut ops = Vec::with_capacity(n_ops.min(1024));
                for _ in 0..n_ops {
                    let code = opcodes.read_u8()? as usize;
                    let op = *CIGAR_OPS
                        .get(code)
                        .ok_or_else(|| DzError::format(format!("invalid CIGAR opcode {code}")))?;
                    let len = u32::try_from(opcodes.read_varint()?)
                        .map_err(|_| DzError::format("CIGAR length out of range"))?;
                    ops.push(CigarOp { op, len });
                }
                Some(ops)
            } else {
                None
            };

            let mut mismatches = Vec::new();
            let (seq_len, literal_len) = match &ops {
                _ if !has_seq => (0, 0),
                None => {
                    let len = seq_lens.read_len()?;
                    (len, len)
                }
                Some(ops) => {
                    let n = mismatch_stream.read_len()?;
                    let mut next = 0usize;
                    for _ in 0..n {
                        let pos = next + mismatch_stream.read_len()?;
                        mismatches.push(pos);
                        next = pos + 1;
                    }
                    let inserted: u64 = ops
                        .iter()
                        .filter(|op| op.consumes_query() && !op.is_aligned())
                        .map(|op| u64::from(op.len))
                        .sum();
                    (query_length(ops) as usize, inserted as usize + n)
                }
            };

            self.records.push(PendingEditOperation {
                start,
                positioned,
                ops,
                seq_len,
                has_seq,
                mismatches,
                bases: base_offset..base_offset + literal_len,
            });
            base_offset += literal_len;
        }

        self.bases = streams.swap_remove(EoStream::Bases as usize);
        if self.bases.len() != base_offset {
            return Err(DzError::format(format!(
                "edit operation bases: expected {} bytes, found {}",
                base_offset,
                self.bases.len()
            )));
        }
        Ok(())
    }

    fn has_record(&self) -> bool {
        self.next < self.records.len()
    }

    fn restore_index_state(&mut self, state: &[u8]) -> Result<()> {
        self.last_location = match state.len() {
            0 => 0,
            _ => ByteReader::new(state).read_u64()?,
        };
        Ok(())
    }
}
