//! Sequence field: reference fixes plus construction of edit operations.
//!
//! The sequence codec owns the reference cursor and the genome-fix state. On
//! the compress side it buffers alignments, feeds their bases into the fix
//! statistics and, when a block is cut, finalises fixes and turns the block's
//! alignments into [`EditOperation`]s for the other codecs. Its own stream
//! only carries the fix span and the changed positions.

use anyhow::Result;
use std::collections::VecDeque;
use std::path::Path;

use super::backend::ByteBackend;
use super::bytes::{write_varint, ByteReader};
use super::edit_operation::{check_query_length, parse_cigar, reference_span, CigarOp, EditOperation};
use super::genome_fix::{FixSpan, Genome, GenomeFixes};
use super::BlockDecompressor;
use crate::io::Reference;
use crate::DzError;

struct PendingAlignment {
    start: u64,
    positioned: bool,
    end: u64,
    seq: Vec<u8>,
    ops: Option<Vec<CigarOp>>,
}

pub(crate) struct SequenceCompressor {
    reference: Reference,
    fixes: GenomeFixes,
    backend: ByteBackend,
    pending: VecDeque<PendingAlignment>,
    total_changes: usize,
}

impl SequenceCompressor {
    pub(crate) fn new(reference: Option<&Path>, backend: ByteBackend) -> Result<Self> {
        Ok(Self {
            reference: Reference::open(reference)?,
            fixes: GenomeFixes::new(),
            backend,
            pending: VecDeque::new(),
            total_changes: 0,
        })
    }

    pub(crate) fn chromosome(&self) -> &str {
        self.reference.chromosome()
    }

    /// Switch to a new chromosome. Buffered records must have been flushed.
    pub(crate) fn scan_chromosome(&mut self, name: &str) -> Result<()> {
        debug_assert!(self.pending.is_empty());
        self.reference.scan_chromosome(name)?;
        self.fixes.reset();
        Ok(())
    }

    /// Buffer one alignment at SAM `pos` (1-based, 0 = none) and count its
    /// aligned bases. Returns its 0-based exclusive end.
    pub(crate) fn add_record(&mut self, pos: u64, seq: &[u8], cigar: &str) -> Result<u64> {
        let start = pos.saturating_sub(1);
        let ops = parse_cigar(cigar)?;
        check_query_length(ops.as_deref(), seq)?;
        let end = start + ops.as_deref().map_or(0, reference_span);

        if let (Some(ops), false) = (&ops, self.chromosome() == "*") {
            let (mut q, mut r) = (0usize, start);
            for op in ops {
                let len = op.len as usize;
                if matches!(op.op, b'M' | b'=' | b'X') {
                    for (i, &base) in seq.iter().skip(q).take(len).enumerate() {
                        self.fixes.observe(r + i as u64, base);
                    }
                }
                if op.consumes_query() {
                    q += len;
                }
                if op.consumes_reference() {
                    r += u64::from(op.len);
                }
            }
        }

        self.pending.push_back(PendingAlignment {
            start,
            positioned: pos > 0,
            end,
            seq: seq.to_vec(),
            ops,
        });
        Ok(end)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of leading buffered records that end at or before `boundary`.
    pub(crate) fn ready_records(&self, boundary: u64) -> usize {
        self.pending.iter().take_while(|p| p.end <= boundary).count()
    }

    pub(crate) fn total_changes(&self) -> usize {
        self.total_changes
    }

    /// Finalise fixes up to `boundary` (none for unplaced records) and emit
    /// the first `k` buffered records as edit operations.
    pub(crate) fn output_records(
        &mut self,
        k: usize,
        boundary: Option<u64>,
    ) -> Result<(Vec<u8>, Vec<EditOperation>, FixSpan)> {
        let (span, changes) = match boundary {
            Some(upto) => self.fixes.apply_fixes(upto, &self.reference),
            None => {
                let at = self.fixes.fixed_upto();
                (FixSpan { start: at, end: at }, Vec::new())
            }
        };
        self.total_changes += changes.len();

        let mut buffer = Vec::with_capacity(16 + changes.len() * 3);
        write_varint(&mut buffer, span.start);
        write_varint(&mut buffer, span.end);
        write_varint(&mut buffer, changes.len() as u64);
        let mut prev = span.start;
        for (pos, base) in changes {
            write_varint(&mut buffer, pos - prev);
            buffer.push(base);
            prev = pos;
        }
        let mut out = Vec::new();
        self.backend.write_stream(&mut out, &buffer)?;

        let genome = Genome::new(&self.reference, &self.fixes);
        let edit_ops = self
            .pending
            .drain(..k)
            .map(|p| {
                let mut eo = EditOperation::build(p.start, p.seq, p.ops, &genome);
                eo.positioned = p.positioned;
                eo
            })
            .collect();
        Ok((out, edit_ops, span))
    }
}

pub(crate) struct SequenceDecompressor {
    reference: Reference,
    fixes: GenomeFixes,
    backend: ByteBackend,
    last_span: FixSpan,
}

impl SequenceDecompressor {
    pub(crate) fn new(reference: Option<&Path>, backend: ByteBackend) -> Result<Self> {
        Ok(Self {
            reference: Reference::open(reference)?,
            fixes: GenomeFixes::new(),
            backend,
            last_span: FixSpan::default(),
        })
    }

    pub(crate) fn scan_chromosome(&mut self, name: &str) -> Result<()> {
        self.reference.scan_chromosome(name)?;
        self.fixes.reset();
        self.last_span = FixSpan::default();
        Ok(())
    }

    pub(crate) fn genome(&self) -> Genome<'_> {
        Genome::new(&self.reference, &self.fixes)
    }

    /// Fix span of the most recently imported block.
    pub(crate) fn last_span(&self) -> FixSpan {
        self.last_span
    }
}

impl BlockDecompressor for SequenceDecompressor {
    fn import_records(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(data);
        let buffer = self.backend.read_stream(&mut reader)?;
        let mut reader = ByteReader::new(&buffer);
        let start = reader.read_varint()?;
        let end = reader.read_varint()?;
        let count = reader.read_len()?;
        let mut pos = start;
        for _ in 0..count {
            pos = pos
                .checked_add(reader.read_varint()?)
                .ok_or_else(|| DzError::format("fix position overflow"))?;
            let base = reader.read_u8()?;
            self.fixes.insert_change(pos, base);
        }
        self.last_span = FixSpan { start, end };
        Ok(())
    }

    fn has_record(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn reference_file(dir: &TempDir) -> std::path::PathBuf {
        let path = dir.path().join("ref.fa");
        fs::write(&path, ">chr1\nACGTACGTACGTACGTACGT\n").unwrap();
        path
    }

    #[test]
    fn test_ready_records_respects_boundary() {
        let backend = ByteBackend::Gzip { level: 6 };
        let mut compressor = SequenceCompressor::new(None, backend).unwrap();
        compressor.scan_chromosome("chr1").unwrap();
        assert_eq!(compressor.add_record(1, b"ACGT", "4M").unwrap(), 4);
        assert_eq!(compressor.add_record(3, b"ACGTAC", "6M").unwrap(), 8);
        assert_eq!(compressor.ready_records(5), 1);
        assert_eq!(compressor.ready_records(8), 2);
        assert!(compressor.add_record(4, b"ACG", "4M").is_err());
    }

    #[test]
    fn test_fixes_roundtrip_through_stream() {
        let dir = TempDir::new().unwrap();
        let path = reference_file(&dir);
        let backend = ByteBackend::Gzip { level: 6 };

        let mut compressor = SequenceCompressor::new(Some(&path), backend).unwrap();
        compressor.scan_chromosome("chr1").unwrap();
        // Three reads agree on T at position 2 where the reference has G
        for _ in 0..3 {
            compressor.add_record(1, b"ACTT", "4M").unwrap();
        }
        let (data, edit_ops, span) = compressor.output_records(3, Some(u64::MAX)).unwrap();
        assert_eq!(span, FixSpan { start: 0, end: u64::MAX });
        assert_eq!(compressor.total_changes(), 1);
        assert!(edit_ops.iter().all(|eo| eo.substituted.iter().all(|&s| !s)));
        assert_eq!(edit_ops[0].md.as_deref(), Some("2G1"));

        let mut decompressor = SequenceDecompressor::new(Some(&path), backend).unwrap();
        decompressor.scan_chromosome("chr1").unwrap();
        decompressor.import_records(&data).unwrap();
        assert_eq!(decompressor.last_span(), span);
        let genome = decompressor.genome();
        assert_eq!(genome.fixed_base(2), b'T');
        assert_eq!(genome.reference_base(2), b'G');
    }

    #[test]
    fn test_unplaced_records_do_not_fix() {
        let backend = ByteBackend::Gzip { level: 6 };
        let mut compressor = SequenceCompressor::new(None, backend).unwrap();
        compressor.scan_chromosome("*").unwrap();
        compressor.add_record(0, b"ACGT", "*").unwrap();
        compressor.add_record(7, b"CCCC", "4M").unwrap();
        let (_, edit_ops, span) = compressor.output_records(2, None).unwrap();
        assert!(span.is_empty());
        assert_eq!(edit_ops.len(), 2);
        assert!(!edit_ops[0].positioned);
        assert_eq!((edit_ops[1].start, edit_ops[1].end), (6, 10));
        assert_eq!(compressor.total_changes(), 0);
        assert_eq!(compressor.pending_count(), 0);
    }
}
