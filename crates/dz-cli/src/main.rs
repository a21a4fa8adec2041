use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;

use dz_lib::cli::{
    CompressConfig, DecompressConfig, QualityMode as LibQualityMode, StatsConfig, StreamBackend,
    DEFAULT_BLOCK_SIZE,
};

#[derive(Parser)]
#[command(name = "dz")]
#[command(author = "DZ Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Reference-guided SAM compression with random access", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress SAM files
    Compress(CompressArgs),
    /// Decompress DZ archives
    Decompress(DecompressArgs),
    /// Print read counts stored in a DZ archive
    Stats(StatsArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
enum CliQualityMode {
    /// Lossless quality preservation
    Lossless,
    /// Illumina 8-level binning
    IlluminaBin,
}

#[derive(Parser)]
struct CompressArgs {
    /// Input SAM file (repeat for multi-sample archives)
    #[arg(short, long, value_name = "FILE", required = true)]
    input: Vec<PathBuf>,

    /// Output DZ archive file
    #[arg(short, long, value_name = "FILE", required = true)]
    output: PathBuf,

    /// Reference FASTA
    #[arg(short, long, value_name = "FILE")]
    reference: Option<PathBuf>,

    /// Maximum records per block
    #[arg(short = 'B', long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Number of threads (0 = auto-detect)
    #[arg(short = 't', long, default_value = "0")]
    threads: usize,

    /// Use zstd instead of gzip for field streams
    #[arg(long)]
    zstd: bool,

    /// Backend compression level (gzip 0-9, zstd 1-22)
    #[arg(short = 'l', long, default_value = "6")]
    level: i32,

    /// Quality compression mode
    #[arg(short, long, value_enum, default_value = "lossless")]
    quality_mode: CliQualityMode,

    /// Also dump every field stream to <output>.<FieldName>
    #[arg(long)]
    debug_streams: bool,
}

#[derive(Parser)]
struct DecompressArgs {
    /// Input DZ archive
    #[arg(short, long, value_name = "FILE", required = true)]
    input: PathBuf,

    /// Output SAM file (multi-sample archives write <output>_1, <output>_2, ...)
    #[arg(short, long, value_name = "FILE", default_value = "-")]
    output: PathBuf,

    /// Reference FASTA used for compression
    #[arg(short, long, value_name = "FILE")]
    reference: Option<PathBuf>,

    /// Number of threads (0 = auto-detect)
    #[arg(short = 't', long, default_value = "0")]
    threads: usize,

    /// Regions to extract: [sample,]chr[:start[-end]], separated by ';'
    #[arg(long, value_name = "SPEC")]
    range: Option<String>,

    /// Flag filter: >0 keeps reads with all bits set, <0 drops them
    #[arg(short = 'f', long = "filter", default_value = "0", allow_negative_numbers = true)]
    filter: i32,

    /// Write records to stdout
    #[arg(short = 'c', long)]
    stdout: bool,

    /// Do not write the SAM header
    #[arg(long)]
    no_header: bool,
}

#[derive(Parser)]
struct StatsArgs {
    /// Input DZ archive
    #[arg(short, long, value_name = "FILE", required = true)]
    input: PathBuf,

    /// Also count reads passing this flag filter
    #[arg(short = 'f', long = "filter", default_value = "0", allow_negative_numbers = true)]
    filter: i32,
}

impl CompressArgs {
    fn into_config(self) -> CompressConfig {
        let quality_mode = match self.quality_mode {
            CliQualityMode::Lossless => LibQualityMode::Lossless,
            CliQualityMode::IlluminaBin => LibQualityMode::IlluminaBin,
        };
        CompressConfig {
            input: self.input,
            output: self.output,
            reference: self.reference,
            block_size: self.block_size,
            threads: self.threads,
            backend: if self.zstd { StreamBackend::Zstd } else { StreamBackend::Gzip },
            compression_level: self.level,
            quality_mode,
            debug_streams: self.debug_streams,
        }
    }
}

impl DecompressArgs {
    fn into_config(self) -> DecompressConfig {
        DecompressConfig {
            input: self.input,
            output: self.output,
            reference: self.reference,
            threads: self.threads,
            range: self.range,
            filter_flag: self.filter,
            stdout: self.stdout,
            no_header: self.no_header,
        }
    }
}

impl StatsArgs {
    fn into_config(self) -> StatsConfig {
        StatsConfig {
            input: self.input,
            filter_flag: self.filter,
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if std::env::var("DZ_NO_BANNER").is_err() {
        eprintln!("DZ v{} - Reference-guided SAM compression", env!("CARGO_PKG_VERSION"));
        eprintln!();
    }

    match cli.command {
        Commands::Compress(args) => {
            info!("Starting compression...");
            let config = args.into_config();
            dz_lib::compression::compress(&config)?;
            info!("Compression complete!");
        }
        Commands::Decompress(args) => {
            info!("Starting decompression...");
            let config = args.into_config();
            dz_lib::compression::decompress(&config)?;
            info!("Decompression complete!");
        }
        Commands::Stats(args) => {
            dz_lib::compression::print_stats(&args.into_config())?;
        }
    }

    Ok(())
}
