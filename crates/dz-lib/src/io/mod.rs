pub mod reference;
pub mod sam;

pub use reference::Reference;
pub use sam::{SamReader, SamRecord};

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

const READ_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Plain file, gzipped file or stdin, chosen by sniffing the gzip magic.
pub enum FileReader {
    Plain(BufReader<std::fs::File>),
    Gzipped(BufReader<MultiGzDecoder<BufReader<std::fs::File>>>),
    Stdin(BufReader<std::io::Stdin>),
    StdinGzipped(BufReader<MultiGzDecoder<BufReader<std::io::Stdin>>>),
}

impl FileReader {
    /// Open `path` (auto-detects gzip), or stdin if path is `-`.
    pub fn open(path: &Path) -> Result<Self> {
        if crate::cli::is_stdio_path(path) {
            let mut buffered = BufReader::with_capacity(READ_BUFFER_SIZE, std::io::stdin());
            return Ok(if is_gzipped(&mut buffered)? {
                FileReader::StdinGzipped(BufReader::new(MultiGzDecoder::new(buffered)))
            } else {
                FileReader::Stdin(buffered)
            });
        }

        let file = std::fs::File::open(path)
            .map_err(crate::DzError::from)
            .with_context(|| format!("Failed to open file: {:?}", path))?;
        let mut buffered = BufReader::with_capacity(READ_BUFFER_SIZE, file);
        Ok(if is_gzipped(&mut buffered)? {
            FileReader::Gzipped(BufReader::new(MultiGzDecoder::new(buffered)))
        } else {
            FileReader::Plain(buffered)
        })
    }
}

fn is_gzipped<R: Read>(reader: &mut BufReader<R>) -> Result<bool> {
    let peek = reader.fill_buf()?;
    Ok(peek.len() >= 2 && peek[0] == 0x1f && peek[1] == 0x8b)
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            FileReader::Plain(r) => r.read(buf),
            FileReader::Gzipped(r) => r.read(buf),
            FileReader::Stdin(r) => r.read(buf),
            FileReader::StdinGzipped(r) => r.read(buf),
        }
    }
}

impl BufRead for FileReader {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        match self {
            FileReader::Plain(r) => r.fill_buf(),
            FileReader::Gzipped(r) => r.fill_buf(),
            FileReader::Stdin(r) => r.fill_buf(),
            FileReader::StdinGzipped(r) => r.fill_buf(),
        }
    }

    fn consume(&mut self, amt: usize) {
        match self {
            FileReader::Plain(r) => r.consume(amt),
            FileReader::Gzipped(r) => r.consume(amt),
            FileReader::Stdin(r) => r.consume(amt),
            FileReader::StdinGzipped(r) => r.consume(amt),
        }
    }
}

/// Trim trailing \n and \r\n from the buffer in-place.
#[inline]
pub(crate) fn trim_newline(buf: &mut Vec<u8>) {
    while buf.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
        buf.pop();
    }
}
