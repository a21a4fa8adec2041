//! Quality scores.
//!
//! Range coded in sequencing order (reversed for reverse-strand reads) with
//! an order-2 context over the two previous symbols plus whether the base was
//! substituted against the corrected genome. The length is normally taken
//! from the read's sequence; qualities with a different length carry it in a
//! side stream.

use anyhow::Result;

use super::backend::ByteBackend;
use super::bytes::{write_varint, ByteReader};
use super::edit_operation::EditOperation;
use super::range_coder::{build_alphabet, AdaptiveModel, ContextModels, RangeDecoder, RangeEncoder};
use super::{BlockCompressor, BlockDecompressor};
use crate::cli::QualityMode;
use crate::DzError;

/// SAM flag bit for reverse-strand alignments.
pub const FLAG_REVERSE: u16 = 0x10;

/// Previous-symbol contexts are clamped to this many buckets.
const Q_BUCKETS: usize = 64;
const QUALITY_CONTEXTS: usize = Q_BUCKETS * Q_BUCKETS * 2;

const PRESENCE_ABSENT: usize = 0;
const PRESENCE_SEQ_LENGTH: usize = 1;
const PRESENCE_EXPLICIT: usize = 2;
const PRESENCE_SYMBOLS: usize = 3;

/// Illumina 8-level binning table
const ILLUMINA_BINS: [u8; 94] = [
    33, 33, 33, 33, 33, 33, 33, 33, 33, 33, // 0-9
    39, 39, 39, 39, 39, 39, 39, 39, 39, 39, // 10-19
    48, 48, 48, 48, 48, 48, 48, 48, 48, 48, // 20-29
    55, 55, 55, 55, 55, 55, 55, 55, 55, 55, // 30-39
    60, 60, 60, 60, 60, 60, 60, 60, 60, 60, // 40-49
    66, 66, 66, 66, 66, 66, 66, 66, 66, 66, // 50-59
    70, 70, 70, 70, 70, 70, 70, 70, 70, 70, // 60-69
    73, 73, 73, 73, 73, 73, 73, 73, 73, 73, // 70-79
    73, 73, 73, 73, 73, 73, 73, 73, 73, 73, // 80-89
    73, 73, 73, 73, // 90-93
];

/// Apply the configured quality quantisation.
pub fn quantize_quality(quality: &[u8], mode: QualityMode) -> Vec<u8> {
    match mode {
        QualityMode::Lossless => quality.to_vec(),
        QualityMode::IlluminaBin => quality
            .iter()
            .map(|&qv| ILLUMINA_BINS[(qv as usize).saturating_sub(33).min(93)])
            .collect(),
    }
}

#[inline]
fn quality_context(prev1: usize, prev2: usize, substituted: bool) -> usize {
    (prev1.min(Q_BUCKETS - 1) * Q_BUCKETS + prev2.min(Q_BUCKETS - 1)) * 2 + usize::from(substituted)
}

/// Index of the `j`-th base in sequencing order.
#[inline]
fn sequencing_index(j: usize, len: usize, reverse: bool) -> usize {
    if reverse {
        len - 1 - j
    } else {
        j
    }
}

pub(crate) struct QualityScoreCompressor {
    backend: ByteBackend,
    mode: QualityMode,
    records: Vec<(Vec<u8>, bool)>,
}

impl QualityScoreCompressor {
    pub(crate) fn new(backend: ByteBackend, mode: QualityMode) -> Self {
        Self {
            backend,
            mode,
            records: Vec::new(),
        }
    }

    pub(crate) fn add_record(&mut self, quality: &[u8], flag: u16) {
        self.records
            .push((quantize_quality(quality, self.mode), flag & FLAG_REVERSE != 0));
    }
}

impl BlockCompressor for QualityScoreCompressor {
    fn output_records(&mut self, k: usize, edit_ops: &[EditOperation]) -> Result<Vec<u8>> {
        let records: Vec<(Vec<u8>, bool)> = self.records.drain(..k).collect();
        let (symbols, sym_map) = build_alphabet(records.iter().flat_map(|(q, _)| q.iter()));

        let mut presence = AdaptiveModel::new(PRESENCE_SYMBOLS);
        let mut models = ContextModels::new(QUALITY_CONTEXTS, symbols.len());
        let mut encoder = RangeEncoder::new();
        let mut lengths = Vec::new();

        for ((quality, reverse), eo) in records.iter().zip(edit_ops) {
            let len = quality.len();
            let kind = if len == 0 {
                PRESENCE_ABSENT
            } else if len == eo.seq.len() {
                PRESENCE_SEQ_LENGTH
            } else {
                write_varint(&mut lengths, len as u64);
                PRESENCE_EXPLICIT
            };
            encoder.encode_symbol(&mut presence, kind);

            let (mut prev1, mut prev2) = (0usize, 0usize);
            for j in 0..len {
                let idx = sequencing_index(j, len, *reverse);
                let substituted = eo.substituted.get(idx).copied().unwrap_or(false);
                let sym = sym_map[quality[idx] as usize] as usize;
                encoder.encode_symbol(models.get(quality_context(prev1, prev2, substituted)), sym);
                prev2 = prev1;
                prev1 = sym + 1;
            }
        }

        let mut out = Vec::new();
        write_varint(&mut out, k as u64);
        write_varint(&mut out, symbols.len() as u64);
        out.extend_from_slice(&symbols);
        self.backend.write_stream(&mut out, &lengths)?;
        out.extend_from_slice(&encoder.finish());
        Ok(out)
    }
}

pub(crate) struct QualityScoreDecompressor {
    backend: ByteBackend,
    count: usize,
    next: usize,
    symbols: Vec<u8>,
    lengths: Vec<u8>,
    lengths_pos: usize,
    decoder: RangeDecoder,
    presence: AdaptiveModel,
    models: ContextModels,
}

impl QualityScoreDecompressor {
    pub(crate) fn new(backend: ByteBackend) -> Self {
        Self {
            backend,
            count: 0,
            next: 0,
            symbols: Vec::new(),
            lengths: Vec::new(),
            lengths_pos: 0,
            decoder: RangeDecoder::new(Vec::new()),
            presence: AdaptiveModel::new(PRESENCE_SYMBOLS),
            models: ContextModels::new(0, 1),
        }
    }

    /// Decode the qualities of the next record, in SAM orientation.
    pub(crate) fn get_record(&mut self, eo: &EditOperation, flag: u16) -> Result<Vec<u8>> {
        if self.next >= self.count {
            return Err(DzError::format("quality stream exhausted"));
        }
        self.next += 1;

        let len = match self.decoder.decode_symbol(&mut self.presence) {
            PRESENCE_ABSENT => return Ok(Vec::new()),
            PRESENCE_SEQ_LENGTH => eo.seq.len(),
            _ => {
                let mut reader = ByteReader::new(&self.lengths[self.lengths_pos..]);
                let len = reader.read_len()?;
                self.lengths_pos += reader.position();
                len
            }
        };
        if self.symbols.is_empty() {
            return Err(DzError::format("quality values present but alphabet is empty"));
        }

        let reverse = flag & FLAG_REVERSE != 0;
        let mut quality = vec![0u8; len];
        let (mut prev1, mut prev2) = (0usize, 0usize);
        for j in 0..len {
            let idx = sequencing_index(j, len, reverse);
            let substituted = eo.substituted.get(idx).copied().unwrap_or(false);
            let model = self.models.get(quality_context(prev1, prev2, substituted));
            let sym = self.decoder.decode_symbol(model);
            quality[idx] = self.symbols[sym];
            prev2 = prev1;
            prev1 = sym + 1;
        }
        Ok(quality)
    }
}

impl BlockDecompressor for QualityScoreDecompressor {
    fn import_records(&mut self, data: &[u8]) -> Result<()> {
        let mut reader = ByteReader::new(data);
        self.count = reader.read_len()?;
        self.next = 0;
        let n_symbols = reader.read_len()?;
        if n_symbols > 256 {
            return Err(DzError::format(format!("invalid quality alphabet size {n_symbols}")));
        }
        self.symbols = reader.read_bytes(n_symbols)?.to_vec();
        self.lengths = self.backend.read_stream(&mut reader)?;
        self.lengths_pos = 0;
        self.decoder = RangeDecoder::new(reader.read_bytes(reader.remaining())?.to_vec());
        self.presence = AdaptiveModel::new(PRESENCE_SYMBOLS);
        self.models = ContextModels::new(QUALITY_CONTEXTS, n_symbols.max(1));
        Ok(())
    }

    fn has_record(&self) -> bool {
        self.next < self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::edit_operation::parse_cigar;
    use crate::compression::genome_fix::{Genome, GenomeFixes};
    use crate::io::Reference;

    fn edit_op(seq: &[u8]) -> EditOperation {
        let reference = Reference::with_bases("chr1", b"ACGTACGTACGT");
        let fixes = GenomeFixes::new();
        let cigar = format!("{}M", seq.len().max(1));
        let ops = if seq.is_empty() { None } else { parse_cigar(&cigar).unwrap() };
        EditOperation::build(0, seq.to_vec(), ops, &Genome::new(&reference, &fixes))
    }

    #[test]
    fn test_quality_roundtrip_with_strands() {
        let cases: Vec<(&[u8], &[u8], u16)> = vec![
            (b"ACGTACGT".as_slice(), b"IIIIHHH#".as_slice(), 0),
            (b"ACTTACGA".as_slice(), b"ABCDEFGH".as_slice(), FLAG_REVERSE),
            (b"ACGT".as_slice(), b"".as_slice(), 0),
            (b"ACGT".as_slice(), b"II".as_slice(), 0),
            (b"".as_slice(), b"FFFF".as_slice(), 0),
        ];
        let edit_ops: Vec<EditOperation> = cases.iter().map(|(s, _, _)| edit_op(s)).collect();

        let backend = ByteBackend::Gzip { level: 6 };
        let mut compressor = QualityScoreCompressor::new(backend, QualityMode::Lossless);
        for (_, q, flag) in &cases {
            compressor.add_record(q, *flag);
        }
        let data = compressor.output_records(cases.len(), &edit_ops).unwrap();

        let mut decompressor = QualityScoreDecompressor::new(backend);
        decompressor.import_records(&data).unwrap();
        for ((_, q, flag), eo) in cases.iter().zip(&edit_ops) {
            assert!(decompressor.has_record());
            assert_eq!(decompressor.get_record(eo, *flag).unwrap(), *q);
        }
        assert!(!decompressor.has_record());
    }

    #[test]
    fn test_illumina_binning() {
        assert_eq!(quantize_quality(b"!+5?I", QualityMode::IlluminaBin), b"!'07<");
        assert_eq!(quantize_quality(b"!+5?I", QualityMode::Lossless), b"!+5?I");
    }

    #[test]
    fn test_all_absent_block() {
        let edit_ops = vec![edit_op(b"ACGT"), edit_op(b"")];
        let backend = ByteBackend::Zstd { level: 3 };
        let mut compressor = QualityScoreCompressor::new(backend, QualityMode::Lossless);
        compressor.add_record(b"", 0);
        compressor.add_record(b"", 16);
        let data = compressor.output_records(2, &edit_ops).unwrap();

        let mut decompressor = QualityScoreDecompressor::new(backend);
        decompressor.import_records(&data).unwrap();
        assert!(decompressor.get_record(&edit_ops[0], 0).unwrap().is_empty());
        assert!(decompressor.get_record(&edit_ops[1], 16).unwrap().is_empty());
        assert!(decompressor.get_record(&edit_ops[1], 16).is_err());
    }
}
