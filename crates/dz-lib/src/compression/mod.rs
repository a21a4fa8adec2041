mod backend;
mod bytes;
pub mod edit_operation;
pub mod genome_fix;
pub mod index;
mod mapping;
mod optional_field;
pub mod paired_end;
pub mod quality;
mod range_coder;
mod read_name;
mod sequence;
pub mod stats;
mod compress_impl;
mod decompress_impl;

use crate::cli::{CompressConfig, DecompressConfig, QualityMode, StatsConfig, StreamBackend};
use anyhow::Result;
use std::io::Write;
use std::path::Path;

use edit_operation::EditOperation;

pub use decompress_impl::read_stats;
pub use index::{parse_ranges, Region};
pub use stats::{flag_passes, SessionStats, Stats};

/// DZ archive magic, stored in the upper bytes of the leading `u32`
const ARCHIVE_MAGIC: u32 = 0x445A;
/// Archive format version (low byte of the leading `u32`)
const ARCHIVE_VERSION: u8 = 0x11;
/// First version that stores a sample count
const MIN_MULTI_SAMPLE_VERSION: u8 = 0x11;

/// Block marker: same chromosome as the previous block
const MARKER_SAME_CHROMOSOME: u8 = 0;
/// Block marker: NUL-terminated chromosome name follows
const MARKER_NEW_CHROMOSOME: u8 = 1;

const STATS_MAGIC: &[u8; 7] = b"DZSTATS";
const INDEX_MAGIC: &[u8; 5] = b"DZIDX";

/// I/O buffer size for archive files
const IO_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Field streams of a block, in on-disk order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Field {
    Sequence,
    EditOperation,
    ReadName,
    MappingFlag,
    MappingQuality,
    QualityScore,
    PairedEnd,
    OptionalField,
}

impl Field {
    pub(crate) const COUNT: usize = 8;

    pub(crate) const ALL: [Field; Field::COUNT] = [
        Field::Sequence,
        Field::EditOperation,
        Field::ReadName,
        Field::MappingFlag,
        Field::MappingQuality,
        Field::QualityScore,
        Field::PairedEnd,
        Field::OptionalField,
    ];

    pub(crate) fn name(self) -> &'static str {
        match self {
            Field::Sequence => "Sequence",
            Field::EditOperation => "EditOperation",
            Field::ReadName => "ReadName",
            Field::MappingFlag => "MappingFlag",
            Field::MappingQuality => "MappingQuality",
            Field::QualityScore => "QualityScore",
            Field::PairedEnd => "PairedEnd",
            Field::OptionalField => "OptionalField",
        }
    }
}

/// Compress side of a field codec.
///
/// Records are queued with the codec's own typed `add_record`; a block is cut
/// by encoding the first `k` queued records.
pub(crate) trait BlockCompressor: Send {
    /// Encode and drop the first `k` queued records. `edit_ops` holds the
    /// edit operations of those same records.
    fn output_records(&mut self, k: usize, edit_ops: &[EditOperation]) -> Result<Vec<u8>>;

    /// State carried across blocks, snapshotted into the index before each block.
    fn index_state(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// Decompress side of a field codec.
pub(crate) trait BlockDecompressor: Send {
    /// Decode one block, replacing any records left from the previous one.
    fn import_records(&mut self, data: &[u8]) -> Result<()>;

    fn has_record(&self) -> bool;

    /// Reinstate a snapshot taken by [`BlockCompressor::index_state`].
    fn restore_index_state(&mut self, _state: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Convert StreamBackend to a byte code for storage
fn backend_to_code(backend: StreamBackend) -> u8 {
    match backend {
        StreamBackend::Gzip => 0,
        StreamBackend::Zstd => 1,
    }
}

/// Convert byte code back to StreamBackend
fn code_to_backend(code: u8) -> Result<StreamBackend> {
    match code {
        0 => Ok(StreamBackend::Gzip),
        1 => Ok(StreamBackend::Zstd),
        _ => anyhow::bail!("Invalid stream backend code: {}", code),
    }
}

/// Convert QualityMode to a byte code for storage
fn quality_mode_to_code(mode: QualityMode) -> u8 {
    match mode {
        QualityMode::Lossless => 0,
        QualityMode::IlluminaBin => 1,
    }
}

/// Convert byte code back to QualityMode
fn code_to_quality_mode(code: u8) -> Result<QualityMode> {
    match code {
        0 => Ok(QualityMode::Lossless),
        1 => Ok(QualityMode::IlluminaBin),
        _ => anyhow::bail!("Invalid quality mode code: {}", code),
    }
}

/// Format bytes as human-readable string (e.g., "1.23 GiB").
fn humanize_bytes(bytes: u64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = KIB * 1024.0;
    const GIB: f64 = MIB * 1024.0;
    let b = bytes as f64;
    if b >= GIB { format!("{:.2} GiB", b / GIB) }
    else if b >= MIB { format!("{:.1} MiB", b / MIB) }
    else if b >= KIB { format!("{:.0} KiB", b / KIB) }
    else { format!("{} B", bytes) }
}

/// Configure the global rayon pool. A pool that already exists is kept.
fn init_thread_pool(threads: usize) {
    let threads = crate::cli::resolve_threads(threads);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}

/// Compress one or more SAM files into a DZ archive.
pub fn compress(args: &CompressConfig) -> Result<()> {
    compress_impl::compress(args)
}

/// Decompress a DZ archive (or the regions named in `args.range`) back to SAM.
pub fn decompress(args: &DecompressConfig) -> Result<()> {
    decompress_impl::decompress(args)
}

/// Print the read counts stored in an archive without decoding any block.
pub fn print_stats(args: &StatsConfig) -> Result<()> {
    let stats = read_stats(&args.input)?;
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    stats.write_report(args.filter_flag, &mut out)?;
    out.flush()?;
    Ok(())
}

/// Archive path suffixed with a field name, used for debug stream dumps.
fn debug_stream_path(output: &Path, field: Field) -> std::path::PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".");
    name.push(field.name());
    name.into()
}
