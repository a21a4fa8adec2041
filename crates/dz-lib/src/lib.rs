//! Reference-guided columnar compression for SAM alignment files.
//!
//! Records are split into per-field streams (reference fixes, edit
//! operations, read names, flags, mapping qualities, quality scores,
//! paired-end information and optional tags) which are compressed block by
//! block. A block index stored at the end of the archive allows decoding a
//! genomic region without touching the rest of the file.

pub mod cli;
pub mod compression;
pub mod error;
pub mod io;

pub use error::DzError;
