//! Compression orchestrator: block segmentation and archive writing.

use anyhow::{Context, Result};
use rayon::prelude::*;
use rustc_hash::FxHashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;
use tracing::{debug, info};

use super::backend::{compress_gzip, ByteBackend};
use super::bytes::{write_cstr, write_u64};
use super::edit_operation::EditOperationCompressor;
use super::index::{encode_entries, IndexEntry};
use super::mapping::{MappingFlagCompressor, MappingQualityCompressor};
use super::optional_field::OptionalFieldCompressor;
use super::paired_end::{PairedEndCompressor, PairedEndInfo};
use super::quality::QualityScoreCompressor;
use super::read_name::ReadNameCompressor;
use super::sequence::SequenceCompressor;
use super::stats::{SessionStats, Stats};
use super::*;
use crate::cli::CompressConfig;
use crate::io::{FileReader, SamReader, SamRecord};
use crate::DzError;

/// Writer that tracks how many bytes went through it.
struct CountingWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner, written: 0 }
    }

    fn position(&self) -> u64 {
        self.written
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// All field encoders of one sample.
struct FieldEncoders {
    sequence: SequenceCompressor,
    edit_operation: EditOperationCompressor,
    read_name: ReadNameCompressor,
    mapping_flag: MappingFlagCompressor,
    mapping_quality: MappingQualityCompressor,
    quality_score: QualityScoreCompressor,
    paired_end: PairedEndCompressor,
    optional_field: OptionalFieldCompressor,
}

impl FieldEncoders {
    fn new(args: &CompressConfig, backend: ByteBackend) -> Result<Self> {
        Ok(Self {
            sequence: SequenceCompressor::new(args.reference.as_deref(), backend)?,
            edit_operation: EditOperationCompressor::new(backend),
            read_name: ReadNameCompressor::new(backend),
            mapping_flag: MappingFlagCompressor::new(backend),
            mapping_quality: MappingQualityCompressor::new(backend),
            quality_score: QualityScoreCompressor::new(backend, args.quality_mode),
            paired_end: PairedEndCompressor::new(backend),
            optional_field: OptionalFieldCompressor::new(backend),
        })
    }

    fn switch_chromosome(&mut self, name: &str) -> Result<()> {
        self.sequence.scan_chromosome(name)?;
        self.edit_operation.reset_location();
        Ok(())
    }

    fn add_record(&mut self, record: &SamRecord) -> Result<()> {
        let start = record.start();
        self.sequence.add_record(record.pos, &record.seq, &record.cigar)?;
        self.read_name.add_record(&record.qname)?;
        self.mapping_flag.add_record(record.flag);
        self.mapping_quality.add_record(record.mapq);
        self.quality_score.add_record(&record.qual, record.flag);
        self.paired_end.add_record(
            PairedEndInfo::from_sam(&record.rnext, record.pnext, record.tlen),
            &record.rname,
            start,
        );
        self.optional_field.add_record(&record.optional)?;
        Ok(())
    }

    /// Every encoder except the sequence one, in [`Field`] order.
    fn parallel_fields(&mut self) -> Vec<&mut dyn BlockCompressor> {
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

    fn index_states(&mut self) -> [Vec<u8>; Field::COUNT] {
        let mut states: [Vec<u8>; Field::COUNT] = Default::default();
        for (state, encoder) in states[1..].iter_mut().zip(self.parallel_fields()) {
            *state = encoder.index_state();
        }
        states
    }
}

/// Output archive plus everything accumulated across blocks.
struct ArchiveWriter {
    out: CountingWriter<Box<dyn Write>>,
    debug_streams: Option<Vec<BufWriter<File>>>,
    entries: Vec<IndexEntry>,
    stats: Stats,
    tag_stats: SessionStats,
    field_sizes: [u64; Field::COUNT],
    /// Sample and chromosome of the last block written
    current: Option<(u16, String)>,
}

impl ArchiveWriter {
    fn create(args: &CompressConfig) -> Result<Self> {
        let inner: Box<dyn Write> = if crate::cli::is_stdio_path(&args.output) {
            Box::new(BufWriter::with_capacity(IO_BUFFER_SIZE, std::io::stdout().lock()))
        } else {
            let file = File::create(&args.output)
                .map_err(DzError::from)
                .with_context(|| format!("Failed to create output file: {:?}", args.output))?;
            Box::new(BufWriter::with_capacity(IO_BUFFER_SIZE, file))
        };

        let debug_streams = if args.debug_streams {
            let files = Field::ALL
                .iter()
                .map(|&field| {
                    let path = debug_stream_path(&args.output, field);
                    File::create(&path)
                        .map(BufWriter::new)
                        .with_context(|| format!("Failed to create debug stream {:?}", path))
                })
                .collect::<Result<Vec<_>>>()?;
            Some(files)
        } else {
            None
        };

        Ok(Self {
            out: CountingWriter::new(inner),
            debug_streams,
            entries: Vec::new(),
            stats: Stats::new(),
            tag_stats: SessionStats::default(),
            field_sizes: [0; Field::COUNT],
            current: None,
        })
    }

    fn write_header(&mut self, args: &CompressConfig, samples: &[SamReader<FileReader>]) -> Result<()> {
        let out = &mut self.out;
        out.write_all(&((ARCHIVE_MAGIC << 8) | u32::from(ARCHIVE_VERSION)).to_le_bytes())?;
        out.write_all(&[quality_mode_to_code(args.quality_mode)])?;
        out.write_all(&(samples.len() as u16).to_le_bytes())?;
        out.write_all(&[backend_to_code(args.backend)])?;

        let mut names = Vec::new();
        for path in &args.input {
            write_cstr(&mut names, path.to_string_lossy().as_bytes());
        }
        write_gzip_section(out, &names)?;
        for sample in samples {
            write_gzip_section(out, sample.header())?;
        }
        Ok(())
    }

    /// Encode the first `k` buffered records as one block.
    fn write_block(
        &mut self,
        encoders: &mut FieldEncoders,
        sample: u16,
        chromosome: &str,
        k: usize,
        boundary: Option<u64>,
    ) -> Result<()> {
        let fields = encoders.index_states();
        let (sequence, edit_ops, fix) = encoders.sequence.output_records(k, boundary)?;

        let mut buffers = Vec::with_capacity(Field::COUNT);
        buffers.push(sequence);
        let encoded = encoders
            .parallel_fields()
            .par_iter_mut()
            .map(|encoder| encoder.output_records(k, &edit_ops))
            .collect::<Result<Vec<_>>>()?;
        buffers.extend(encoded);

        let offset = self.out.position();
        if self.current.as_ref().is_some_and(|(s, c)| *s == sample && c == chromosome) {
            self.out.write_all(&[MARKER_SAME_CHROMOSOME])?;
        } else {
            let mut marker = vec![MARKER_NEW_CHROMOSOME];
            write_cstr(&mut marker, chromosome.as_bytes());
            self.out.write_all(&marker)?;
            self.current = Some((sample, chromosome.to_string()));
        }
        for (i, buffer) in buffers.iter().enumerate() {
            self.out.write_all(&(buffer.len() as u64).to_le_bytes())?;
            self.out.write_all(buffer)?;
            self.field_sizes[i] += buffer.len() as u64;
        }
        if let Some(files) = &mut self.debug_streams {
            for (file, buffer) in files.iter_mut().zip(&buffers) {
                file.write_all(buffer)?;
            }
        }

        let start = edit_ops.first().map_or(0, |eo| eo.start);
        let end = edit_ops.iter().map(|eo| eo.end).max().unwrap_or(start);
        debug!(
            "Block {}: sample {} {}:{}-{}, {} records, {} bytes",
            self.entries.len(),
            sample,
            chromosome,
            start + 1,
            end,
            k,
            self.out.position() - offset
        );
        self.entries.push(IndexEntry {
            fields,
            sample,
            offset,
            records: k as u64,
            chromosome: chromosome.to_string(),
            start,
            end,
            fix,
        });
        Ok(())
    }

    /// Append stats, index and trailer.
    fn finish(mut self) -> Result<u64> {
        let stats_offset = self.out.position();
        let stats = self.stats.serialize();
        self.out.write_all(STATS_MAGIC)?;
        self.out.write_all(&(stats.len() as u64).to_le_bytes())?;
        self.out.write_all(&stats)?;

        let index = encode_entries(&self.entries)?;
        self.out.write_all(INDEX_MAGIC)?;
        self.out.write_all(&index)?;
        self.out.write_all(&stats_offset.to_le_bytes())?;
        self.out.flush()?;
        if let Some(files) = &mut self.debug_streams {
            for file in files {
                file.flush()?;
            }
        }
        info!("Index: {} blocks, {}", self.entries.len(), humanize_bytes(index.len() as u64));
        Ok(self.out.position())
    }
}

/// `[u64 raw size]` and, when non-empty, `[u64 compressed size][gzip bytes]`.
fn write_gzip_section(out: &mut impl Write, data: &[u8]) -> Result<()> {
    let mut section = Vec::new();
    write_u64(&mut section, data.len() as u64);
    if !data.is_empty() {
        let packed = compress_gzip(data, 6)?;
        write_u64(&mut section, packed.len() as u64);
        section.extend_from_slice(&packed);
    }
    out.write_all(&section)?;
    Ok(())
}

/// Split one sample into blocks.
///
/// Blocks never span chromosomes. Within a chromosome a block holds the
/// buffered records that end before the next record starts, so the fixes
/// they depend on are final once the block is written.
fn compress_sample(
    archive: &mut ArchiveWriter,
    args: &CompressConfig,
    backend: ByteBackend,
    sample: u16,
    reader: &mut SamReader<FileReader>,
) -> Result<()> {
    let block_size = args.block_size.max(1);
    let mut encoders = FieldEncoders::new(args, backend)?;
    let mut seen: FxHashSet<String> = FxHashSet::default();

    while let Some(head) = reader.head() {
        let chromosome = head.rname.clone();
        if !seen.insert(chromosome.clone()) {
            return Err(DzError::format(format!(
                "input is not sorted: chromosome {} appears in more than one run",
                chromosome
            )));
        }
        encoders.switch_chromosome(&chromosome)?;
        let unplaced = chromosome == "*";
        let mut last_start = 0u64;

        loop {
            let mut read = 0;
            while read < block_size && reader.head().is_some_and(|r| r.rname == chromosome) {
                let Some(record) = reader.next()? else { break };
                if !unplaced && record.start() < last_start {
                    return Err(DzError::format(format!(
                        "input is not sorted: {} at {}:{} follows position {}",
                        String::from_utf8_lossy(&record.qname),
                        chromosome,
                        record.pos,
                        last_start + 1
                    )));
                }
                last_start = record.start();
                encoders.add_record(&record)?;
                archive.stats.add_record(record.flag, &record.rname);
                read += 1;
            }

            let next_start = reader.head().filter(|r| r.rname == chromosome).map(SamRecord::start);
            let (k, boundary) = if unplaced {
                (encoders.sequence.pending_count(), None)
            } else {
                let boundary = next_start.unwrap_or(u64::MAX);
                (encoders.sequence.ready_records(boundary), Some(boundary))
            };
            if k > 0 {
                archive.write_block(&mut encoders, sample, &chromosome, k, boundary)?;
            }
            if next_start.is_none() {
                break;
            }
        }
    }

    archive.tag_stats.merge(encoders.optional_field.stats());
    info!(
        "Sample {}: {} reference fixes",
        sample,
        encoders.sequence.total_changes()
    );
    Ok(())
}

pub(super) fn compress(args: &CompressConfig) -> Result<()> {
    let start_time = Instant::now();
    if args.input.is_empty() {
        anyhow::bail!("No input files given");
    }
    if args.input.len() > usize::from(u16::MAX) {
        anyhow::bail!("Too many input files: {}", args.input.len());
    }
    init_thread_pool(args.threads);

    let backend = ByteBackend::from_config(args.backend, args.compression_level);
    info!(
        "Compressing {} sample(s) with {:?} (block size {})",
        args.input.len(),
        backend,
        args.block_size
    );

    let mut readers = args
        .input
        .iter()
        .map(SamReader::from_path)
        .collect::<Result<Vec<_>>>()?;
    let original_size: u64 = args
        .input
        .iter()
        .filter(|p| !crate::cli::is_stdio_path(p))
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum();

    let mut archive = ArchiveWriter::create(args)?;
    archive.write_header(args, &readers)?;
    let header_size = archive.out.position();

    for (sample, reader) in readers.iter_mut().enumerate() {
        compress_sample(&mut archive, args, backend, sample as u16, reader)
            .with_context(|| format!("Failed to compress {:?}", args.input[sample]))?;
    }

    let reads = archive.stats.reads();
    let field_sizes = archive.field_sizes;
    let tag_stats = archive.tag_stats.clone();
    let total = archive.finish()?;

    info!("Compression completed in {:.2}s", start_time.elapsed().as_secs_f64());
    info!("Reads: {}", reads);
    if original_size > 0 {
        info!("Original size: {}", humanize_bytes(original_size));
        info!("Compression ratio: {:.2}x", original_size as f64 / total.max(1) as f64);
    }
    info!("Compressed size: {}", humanize_bytes(total));
    info!("Stream breakdown:");
    for (field, size) in Field::ALL.iter().zip(field_sizes) {
        info!(
            "  {:<15} {} ({:.1}%)",
            field.name(),
            humanize_bytes(size),
            100.0 * size as f64 / total.max(1) as f64
        );
    }
    info!("  {:<15} {}", "Header", humanize_bytes(header_size));
    tag_stats.log();
    Ok(())
}
