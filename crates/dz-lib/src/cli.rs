use std::path::{Path, PathBuf};

/// Default number of records buffered per block.
pub const DEFAULT_BLOCK_SIZE: usize = 100_000;

/// Byte-level backend used for every stream that is not range coded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamBackend {
    Gzip,
    Zstd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QualityMode {
    /// Lossless quality preservation
    Lossless,
    /// Illumina 8-level binning
    IlluminaBin,
}

#[derive(Clone)]
pub struct CompressConfig {
    /// Input SAM file(s), one sample per file
    pub input: Vec<PathBuf>,
    /// Output DZ archive file
    pub output: PathBuf,
    /// Reference FASTA (absent = all-N genome)
    pub reference: Option<PathBuf>,
    /// Maximum number of records buffered per block
    pub block_size: usize,
    /// Number of threads (0 = auto-detect)
    pub threads: usize,
    pub backend: StreamBackend,
    /// Backend compression level (gzip 0-9, zstd 1-22)
    pub compression_level: i32,
    pub quality_mode: QualityMode,
    /// Write every field buffer to `<output>.<FieldName>` as well
    pub debug_streams: bool,
}

impl Default for CompressConfig {
    fn default() -> Self {
        Self {
            input: Vec::new(),
            output: PathBuf::new(),
            reference: None,
            block_size: DEFAULT_BLOCK_SIZE,
            threads: 0,
            backend: StreamBackend::Gzip,
            compression_level: 6,
            quality_mode: QualityMode::Lossless,
            debug_streams: false,
        }
    }
}

#[derive(Clone)]
pub struct DecompressConfig {
    /// Input DZ archive
    pub input: PathBuf,
    /// Output SAM file; multi-sample archives append `_1`, `_2`, ...
    pub output: PathBuf,
    /// Reference FASTA used during compression
    pub reference: Option<PathBuf>,
    /// Number of threads (0 = auto-detect)
    pub threads: usize,
    /// Region query, `[sample,]chr[:start[-end]]` separated by `;`
    pub range: Option<String>,
    /// Flag filter: >0 keeps records with all bits set, <0 drops them, 0 = off
    pub filter_flag: i32,
    /// Write records to stdout instead of files
    pub stdout: bool,
    /// Do not emit the SAM header (range queries never emit it)
    pub no_header: bool,
}

impl Default for DecompressConfig {
    fn default() -> Self {
        Self {
            input: PathBuf::new(),
            output: PathBuf::new(),
            reference: None,
            threads: 0,
            range: None,
            filter_flag: 0,
            stdout: false,
            no_header: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct StatsConfig {
    /// Input DZ archive
    pub input: PathBuf,
    /// Additional flag filter to count (0 = none)
    pub filter_flag: i32,
}

/// Return true if the path refers to stdin/stdout (`-`).
pub fn is_stdio_path(path: &Path) -> bool {
    path.as_os_str() == "-"
}

/// Resolve a thread count where 0 means "all available cores".
pub fn resolve_threads(threads: usize) -> usize {
    if threads == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        threads
    }
}
