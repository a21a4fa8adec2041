//! Decompression orchestrator: sequential and range-query block decoding.

use anyhow::{Context, Result};
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

use super::backend::{decompress_gzip, ByteBackend};
use super::edit_operation::EditOperationDecompressor;
use super::index::{decode_entries, BlockIndex, IndexEntry, Region};
use super::mapping::{MappingFlagDecompressor, MappingQualityDecompressor};
use super::optional_field::OptionalFieldDecompressor;
use super::paired_end::PairedEndDecompressor;
use super::quality::QualityScoreDecompressor;
use super::read_name::ReadNameDecompressor;
use super::sequence::SequenceDecompressor;
use super::stats::{flag_passes, Stats};
use super::*;
use crate::cli::DecompressConfig;
use crate::DzError;

/// Parsed archive header.
pub(crate) struct ArchiveHeader {
    pub version: u8,
    pub quality_mode: QualityMode,
    pub backend: StreamBackend,
    pub samples: Vec<String>,
    pub sam_headers: Vec<Vec<u8>>,
}

/// Seekable view of a DZ archive.
struct ArchiveReader {
    file: BufReader<File>,
    len: u64,
}

fn read_error(err: std::io::Error) -> anyhow::Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        DzError::format("truncated archive")
    } else {
        DzError::from(err).into()
    }
}

impl ArchiveReader {
    fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(DzError::from)
            .with_context(|| format!("Failed to open archive: {:?}", path))?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: BufReader::with_capacity(IO_BUFFER_SIZE, file),
            len,
        })
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.len {
            return Err(DzError::format(format!("offset {pos} past end of archive")));
        }
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn position(&mut self) -> Result<u64> {
        Ok(self.file.stream_position()?)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.file.read_exact(&mut buf).map_err(read_error)?;
        Ok(buf)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    fn read_vec(&mut self, len: u64) -> Result<Vec<u8>> {
        let remaining = self.len.saturating_sub(self.position()?);
        if len > remaining {
            return Err(DzError::format(format!(
                "section of {len} bytes exceeds the {remaining} bytes left in the archive"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.file.read_exact(&mut buf).map_err(read_error)?;
        Ok(buf)
    }

    fn read_cstr(&mut self) -> Result<String> {
        let mut buf = Vec::new();
        self.file.read_until(0, &mut buf).map_err(read_error)?;
        if buf.pop() != Some(0) {
            return Err(DzError::format("unterminated string in archive"));
        }
        String::from_utf8(buf).map_err(|_| DzError::format("archive string is not valid UTF-8"))
    }

    fn read_gzip_section(&mut self) -> Result<Vec<u8>> {
        let raw_size = self.read_u64()?;
        if raw_size == 0 {
            return Ok(Vec::new());
        }
        let packed_size = self.read_u64()?;
        let data = decompress_gzip(&self.read_vec(packed_size)?)?;
        if data.len() as u64 != raw_size {
            return Err(DzError::format("header section size mismatch"));
        }
        Ok(data)
    }

    fn read_header(&mut self) -> Result<ArchiveHeader> {
        self.seek(0)?;
        let word = u32::from_le_bytes(self.read_array()?);
        if word >> 8 != ARCHIVE_MAGIC {
            return Err(DzError::format("not a DZ archive (bad magic)"));
        }
        let version = word as u8;
        if version > ARCHIVE_VERSION {
            return Err(DzError::format(format!("unsupported archive version 0x{version:02x}")));
        }
        let quality_mode = code_to_quality_mode(self.read_u8()?)?;
        let sample_count = if version >= MIN_MULTI_SAMPLE_VERSION {
            usize::from(u16::from_le_bytes(self.read_array()?))
        } else {
            1
        };
        let backend = code_to_backend(self.read_u8()?)?;

        let names = self.read_gzip_section()?;
        let samples: Vec<String> = names
            .split(|&b| b == 0)
            .filter(|name| !name.is_empty())
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .collect();
        if samples.len() != sample_count {
            return Err(DzError::format(format!(
                "header lists {} sample names for {} samples",
                samples.len(),
                sample_count
            )));
        }
        let sam_headers = (0..sample_count)
            .map(|_| self.read_gzip_section())
            .collect::<Result<Vec<_>>>()?;

        Ok(ArchiveHeader {
            version,
            quality_mode,
            backend,
            samples,
            sam_headers,
        })
    }

    /// Follow the trailer to the stats section; leaves the cursor after it.
    fn read_stats_section(&mut self) -> Result<Stats> {
        if self.len < 8 {
            return Err(DzError::format("archive too small"));
        }
        self.seek(self.len - 8)?;
        let stats_offset = self.read_u64()?;
        if stats_offset >= self.len - 8 {
            return Err(DzError::format(format!("invalid trailer offset {stats_offset}")));
        }
        self.seek(stats_offset)?;
        if &self.read_array::<7>()? != STATS_MAGIC {
            return Err(DzError::format("stats section magic not found"));
        }
        let size = self.read_u64()?;
        Stats::deserialize(&self.read_vec(size)?)
    }

    fn read_index(&mut self) -> Result<Vec<IndexEntry>> {
        self.read_stats_section()?;
        if &self.read_array::<5>()? != INDEX_MAGIC {
            return Err(DzError::format("index section magic not found"));
        }
        let size = (self.len - 8).saturating_sub(self.position()?);
        decode_entries(&self.read_vec(size)?)
    }

    fn read_field_buffers(&mut self) -> Result<Vec<Vec<u8>>> {
        (0..Field::COUNT)
            .map(|_| {
                let len = self.read_u64()?;
                self.read_vec(len)
            })
            .collect()
    }

    /// Field buffers of the block starting at `offset`.
    fn read_block_at(&mut self, offset: u64) -> Result<Vec<Vec<u8>>> {
        self.seek(offset)?;
        match self.read_u8()? {
            MARKER_SAME_CHROMOSOME => {}
            MARKER_NEW_CHROMOSOME => {
                self.read_cstr()?;
            }
            other => return Err(DzError::format(format!("invalid block marker {other} at {offset}"))),
        }
        self.read_field_buffers()
    }
}

/// All field decoders of one sample.
struct FieldDecoders {
    sequence: SequenceDecompressor,
    edit_operation: EditOperationDecompressor,
    read_name: ReadNameDecompressor,
    mapping_flag: MappingFlagDecompressor,
    mapping_quality: MappingQualityDecompressor,
    quality_score: QualityScoreDecompressor,
    paired_end: PairedEndDecompressor,
    optional_field: OptionalFieldDecompressor,
    chromosome: Option<String>,
    /// Offsets of blocks whose fixes are already applied
    replayed: FxHashSet<u64>,
}

impl FieldDecoders {
    fn new(reference: Option<&Path>, backend: ByteBackend) -> Result<Self> {
        Ok(Self {
            sequence: SequenceDecompressor::new(reference, backend)?,
            edit_operation: EditOperationDecompressor::new(backend),
            read_name: ReadNameDecompressor::new(backend),
            mapping_flag: MappingFlagDecompressor::new(backend),
            mapping_quality: MappingQualityDecompressor::new(backend),
            quality_score: QualityScoreDecompressor::new(backend),
            paired_end: PairedEndDecompressor::new(backend),
            optional_field: OptionalFieldDecompressor::new(backend),
            chromosome: None,
            replayed: FxHashSet::default(),
        })
    }

    fn switch_chromosome(&mut self, name: &str) -> Result<()> {
        self.sequence.scan_chromosome(name)?;
        self.edit_operation.reset_location();
        self.chromosome = Some(name.to_string());
        self.replayed.clear();
        Ok(())
    }

    /// Every decoder except the sequence one, in [`Field`] order.
    fn parallel_fields(&mut self) -> Vec<&mut dyn BlockDecompressor> {
        vec![
            &mut self.edit_operation,
            &mut self.read_name,
            &mut self.mapping_flag,
            &mut self.mapping_quality,
            &mut self.quality_score,
            &mut self.paired_end,
            &mut self.optional_field,
        ]
    }

    fn restore_index_states(&mut self, states: &[Vec<u8>; Field::COUNT]) -> Result<()> {
        for (decoder, state) in self.parallel_fields().into_iter().zip(&states[1..]) {
            decoder.restore_index_state(state)?;
        }
        Ok(())
    }

    /// Apply the block's fixes, then decode the other fields concurrently.
    fn import_block(&mut self, buffers: &[Vec<u8>]) -> Result<()> {
        self.sequence.import_records(&buffers[Field::Sequence as usize])?;
        self.parallel_fields()
            .par_iter_mut()
            .zip(buffers[1..].par_iter())
            .try_for_each(|(decoder, buffer)| decoder.import_records(buffer))
    }

    /// The sequence stream repeats the block's fix span; it must agree with
    /// the index.
    fn check_fix_span(&self, entry: &IndexEntry) -> Result<()> {
        let span = self.sequence.last_span();
        if span != entry.fix {
            return Err(DzError::format(format!(
                "block at offset {} fixes {}..{} but its index entry says {}..{}",
                entry.offset, span.start, span.end, entry.fix.start, entry.fix.end
            )));
        }
        Ok(())
    }

    /// Rebuild and write the imported records.
    ///
    /// Returns true once a record starts past the end of `region`.
    fn write_records(
        &mut self,
        count: u64,
        filter: i32,
        region: Option<&Region>,
        out: &mut dyn Write,
    ) -> Result<bool> {
        let chromosome = self
            .chromosome
            .clone()
            .ok_or_else(|| DzError::format("block without a chromosome"))?;
        let mut line = Vec::with_capacity(1024);

        for _ in 0..count {
            let genome = self.sequence.genome();
            let qname = self.read_name.get_record()?;
            let flag = self.mapping_flag.get_record()?;
            let eo = self.edit_operation.get_record(&genome)?;
            let mapq = self.mapping_quality.get_record()?;
            let quality = self.quality_score.get_record(&eo, flag)?;
            let tags = self.optional_field.get_record(&eo)?;
            let mate = self.paired_end.get_record(&chromosome, eo.start)?;

            if let Some(region) = region {
                if eo.start > region.end {
                    return Ok(true);
                }
                if eo.start < region.start {
                    continue;
                }
            }
            if !flag_passes(flag, filter) {
                continue;
            }

            line.clear();
            line.extend_from_slice(&qname);
            let pos = if eo.positioned { eo.start + 1 } else { 0 };
            write!(
                line,
                "\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t",
                flag,
                chromosome,
                pos,
                mapq,
                eo.cigar(),
                mate.chr,
                mate.sam_position(),
                mate.tlen
            )?;
            line.extend_from_slice(if eo.seq.is_empty() { b"*".as_slice() } else { eo.seq.as_slice() });
            line.push(b'\t');
            line.extend_from_slice(if quality.is_empty() { b"*".as_slice() } else { quality.as_slice() });
            if !tags.is_empty() {
                line.push(b'\t');
                line.extend_from_slice(&tags);
            }
            line.push(b'\n');
            out.write_all(&line)?;
        }

        if self.parallel_fields().iter().any(|decoder| decoder.has_record()) {
            return Err(DzError::format("block holds more records than its index entry"));
        }
        Ok(false)
    }
}

/// Output streams: one per sample, or a single stdout stream.
struct SampleOutputs {
    writers: Vec<Box<dyn Write>>,
}

impl SampleOutputs {
    /// The SAM header is only written for full decompression.
    fn open(args: &DecompressConfig, header: &ArchiveHeader) -> Result<Self> {
        let with_header = !args.no_header && args.range.is_none();
        let mut writers: Vec<Box<dyn Write>> = Vec::new();
        if args.stdout || crate::cli::is_stdio_path(&args.output) {
            let mut out: Box<dyn Write> =
                Box::new(BufWriter::with_capacity(IO_BUFFER_SIZE, std::io::stdout().lock()));
            if with_header {
                if let Some(sam_header) = header.sam_headers.first() {
                    out.write_all(sam_header)?;
                }
            }
            writers.push(out);
            return Ok(Self { writers });
        }

        for (i, sam_header) in header.sam_headers.iter().enumerate() {
            let path = sample_output_path(&args.output, i, header.samples.len());
            let file = File::create(&path)
                .map_err(DzError::from)
                .with_context(|| format!("Failed to create output file: {:?}", path))?;
            let mut out: Box<dyn Write> = Box::new(BufWriter::with_capacity(IO_BUFFER_SIZE, file));
            if with_header {
                out.write_all(sam_header)?;
            }
            writers.push(out);
        }
        Ok(Self { writers })
    }

    fn writer(&mut self, sample: u16) -> Result<&mut dyn Write> {
        let i = if self.writers.len() == 1 { 0 } else { usize::from(sample) };
        match self.writers.get_mut(i) {
            Some(writer) => Ok(writer.as_mut()),
            None => Err(DzError::format(format!("no output for sample {sample}"))),
        }
    }

    fn flush(&mut self) -> Result<()> {
        for writer in &mut self.writers {
            writer.flush()?;
        }
        Ok(())
    }
}

/// `out.sam` for a single sample, `out.sam_1`, `out.sam_2`, ... otherwise.
fn sample_output_path(output: &Path, sample: usize, samples: usize) -> PathBuf {
    if samples <= 1 {
        return output.to_path_buf();
    }
    let mut name = output.as_os_str().to_os_string();
    name.push(format!("_{}", sample + 1));
    name.into()
}

/// Decode every block in file order.
fn decode_all(
    archive: &mut ArchiveReader,
    blocks_start: u64,
    index: &BlockIndex,
    decoders: &mut [FieldDecoders],
    outputs: &mut SampleOutputs,
    filter: i32,
) -> Result<()> {
    archive.seek(blocks_start)?;
    for block in 0.. {
        let name = match archive.read_u8()? {
            MARKER_SAME_CHROMOSOME => None,
            MARKER_NEW_CHROMOSOME => Some(archive.read_cstr()?),
            _ => break,
        };
        let entry = index
            .get(block)
            .ok_or_else(|| DzError::format(format!("block {block} missing from the index")))?;
        let decoder = decoders
            .get_mut(usize::from(entry.sample))
            .ok_or_else(|| DzError::format(format!("block {block} names unknown sample {}", entry.sample)))?;
        if let Some(name) = name {
            decoder.switch_chromosome(&name)?;
        }
        let buffers = archive.read_field_buffers()?;
        decoder.import_block(&buffers)?;
        decoder.check_fix_span(entry)?;
        decoder.write_records(entry.records, filter, None, outputs.writer(entry.sample)?)?;
        debug!("Decoded block {} ({} records)", block, entry.records);
    }
    Ok(())
}

/// Decode the blocks overlapping one region.
fn decode_region(
    archive: &mut ArchiveReader,
    index: &BlockIndex,
    decoders: &mut [FieldDecoders],
    outputs: &mut SampleOutputs,
    region: &Region,
    filter: i32,
) -> Result<()> {
    let decoder = decoders
        .get_mut(usize::from(region.sample))
        .ok_or_else(|| DzError::query(format!("unknown sample id {}", region.sample)))?;
    let first = match index.find(region.sample, &region.chromosome, region.start) {
        Ok(first) => first,
        Err(err) => match index.first(region.sample, &region.chromosome) {
            Some(first) if index.entries()[first].start <= region.end => first,
            _ => return Err(err),
        },
    };

    if decoder.chromosome.as_deref() != Some(region.chromosome.as_str()) {
        decoder.switch_chromosome(&region.chromosome)?;
    }
    for j in index.replay_candidates(first) {
        let entry = &index.entries()[j];
        if decoder.replayed.insert(entry.offset) {
            let buffers = archive.read_block_at(entry.offset)?;
            decoder.sequence.import_records(&buffers[Field::Sequence as usize])?;
            decoder.check_fix_span(entry)?;
            debug!("Replayed fixes of block {}", j);
        }
    }

    for i in index.following(first) {
        let entry = &index.entries()[i];
        if entry.start > region.end {
            break;
        }
        let buffers = archive.read_block_at(entry.offset)?;
        decoder.restore_index_states(&entry.fields)?;
        decoder.import_block(&buffers)?;
        decoder.check_fix_span(entry)?;
        decoder.replayed.insert(entry.offset);
        if decoder.write_records(entry.records, filter, Some(region), outputs.writer(region.sample)?)? {
            break;
        }
    }
    Ok(())
}

/// Read the stats section of an archive without decoding any block.
pub fn read_stats(path: &Path) -> Result<Stats> {
    let mut archive = ArchiveReader::open(path)?;
    archive.read_header()?;
    archive
        .read_stats_section()
        .with_context(|| format!("Failed to read stats from {:?}", path))
}

pub(super) fn decompress(args: &DecompressConfig) -> Result<()> {
    let start_time = Instant::now();
    init_thread_pool(args.threads);

    let mut archive = ArchiveReader::open(&args.input)?;
    let header = archive.read_header()?;
    let blocks_start = archive.position()?;
    let index = BlockIndex::new(archive.read_index()?);
    info!(
        "Archive version 0x{:02x}: {} sample(s), {} blocks, {:?} quality",
        header.version,
        header.samples.len(),
        index.entries().len(),
        header.quality_mode
    );

    let backend = ByteBackend::from_config(header.backend, 6);
    let mut decoders = (0..header.samples.len())
        .map(|_| FieldDecoders::new(args.reference.as_deref(), backend))
        .collect::<Result<Vec<_>>>()?;
    let mut outputs = SampleOutputs::open(args, &header)?;

    match &args.range {
        None => decode_all(&mut archive, blocks_start, &index, &mut decoders, &mut outputs, args.filter_flag)?,
        Some(ranges) => {
            for region in parse_ranges(ranges)? {
                decode_region(&mut archive, &index, &mut decoders, &mut outputs, &region, args.filter_flag)
                    .with_context(|| format!("Failed to decode region {}", region.chromosome))?;
            }
        }
    }
    outputs.flush()?;

    info!("Decompression completed in {:.2}s", start_time.elapsed().as_secs_f64());
    Ok(())
}
