use anyhow::{Context, Result};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{trim_newline, FileReader};

/// Base returned for positions outside the loaded chromosome.
pub const UNKNOWN_BASE: u8 = b'N';

/// Sequential cursor over a reference FASTA.
///
/// Only the current chromosome is held in memory. Chromosomes are expected in
/// the same order as the alignments; a chromosome that is not found ahead of
/// the cursor triggers one rewind and rescan from the top of the file. Without
/// a FASTA every base reads as `N`.
pub struct Reference {
    path: Option<PathBuf>,
    reader: Option<FileReader>,
    pending_header: Option<String>,
    name: String,
    bases: Vec<u8>,
}

impl Reference {
    pub fn open(path: Option<&Path>) -> Result<Self> {
        let reader = match path {
            Some(p) => Some(
                FileReader::open(p).with_context(|| format!("Failed to open reference {:?}", p))?,
            ),
            None => None,
        };
        Ok(Self {
            path: path.map(Path::to_path_buf),
            reader,
            pending_header: None,
            name: String::new(),
            bases: Vec::new(),
        })
    }

    /// Current chromosome name (empty before the first scan).
    pub fn chromosome(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    /// Upper-case reference base at 0-based `pos`, `N` when out of range.
    #[inline]
    pub fn base(&self, pos: u64) -> u8 {
        usize::try_from(pos)
            .ok()
            .and_then(|p| self.bases.get(p))
            .copied()
            .unwrap_or(UNKNOWN_BASE)
    }

    /// Load chromosome `name`, rewinding once if it is not ahead of the cursor.
    pub fn scan_chromosome(&mut self, name: &str) -> Result<()> {
        if self.name == name {
            return Ok(());
        }
        self.name = name.to_string();
        self.bases.clear();
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        if name == "*" {
            return Ok(());
        }

        if self.scan_forward(name)? {
            debug!("Loaded reference {} ({} bp)", name, self.bases.len());
            return Ok(());
        }

        self.reader = Some(FileReader::open(&path)?);
        self.pending_header = None;
        self.bases.clear();
        if self.scan_forward(name)? {
            debug!("Loaded reference {} ({} bp) after rewind", name, self.bases.len());
        } else {
            warn!("Chromosome {} not found in reference {:?}, using N bases", name, path);
        }
        Ok(())
    }

    fn scan_forward(&mut self, name: &str) -> Result<bool> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(false);
        };
        let mut loading = self.pending_header.take().as_deref() == Some(name);
        let mut line = Vec::with_capacity(128);
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                return Ok(loading);
            }
            trim_newline(&mut line);
            if line.first() == Some(&b'>') {
                let header = fasta_name(&line[1..]);
                if loading {
                    self.pending_header = Some(header);
                    return Ok(true);
                }
                loading = header == name;
                continue;
            }
            if loading {
                self.bases.extend(line.iter().map(u8::to_ascii_uppercase));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn with_bases(name: &str, bases: &[u8]) -> Self {
        Self {
            path: None,
            reader: None,
            pending_header: None,
            name: name.to_string(),
            bases: bases.to_ascii_uppercase(),
        }
    }
}

/// Chromosome name is the first whitespace-delimited token of the header.
fn fasta_name(header: &[u8]) -> String {
    let token = header
        .split(|b| b.is_ascii_whitespace())
        .next()
        .unwrap_or_default();
    String::from_utf8_lossy(token).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_fasta(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("ref.fa");
        fs::write(&path, ">chr1 first\nacgt\nACGT\n>chr2\nTTTT\n>chr3\nGG\n").unwrap();
        path
    }

    #[test]
    fn test_sequential_scan() {
        let dir = TempDir::new().unwrap();
        let path = write_fasta(&dir);
        let mut reference = Reference::open(Some(&path)).unwrap();

        reference.scan_chromosome("chr1").unwrap();
        assert_eq!(reference.len(), 8);
        assert_eq!(reference.base(0), b'A');
        assert_eq!(reference.base(7), b'T');
        assert_eq!(reference.base(8), UNKNOWN_BASE);

        reference.scan_chromosome("chr3").unwrap();
        assert_eq!(reference.chromosome(), "chr3");
        assert_eq!(reference.len(), 2);
    }

    #[test]
    fn test_rewind_for_earlier_chromosome() {
        let dir = TempDir::new().unwrap();
        let path = write_fasta(&dir);
        let mut reference = Reference::open(Some(&path)).unwrap();

        reference.scan_chromosome("chr3").unwrap();
        reference.scan_chromosome("chr2").unwrap();
        assert_eq!(reference.len(), 4);
        assert_eq!(reference.base(3), b'T');
    }

    #[test]
    fn test_missing_chromosome_is_unknown() {
        let dir = TempDir::new().unwrap();
        let path = write_fasta(&dir);
        let mut reference = Reference::open(Some(&path)).unwrap();

        reference.scan_chromosome("chrX").unwrap();
        assert!(reference.is_empty());
        assert_eq!(reference.base(0), UNKNOWN_BASE);

        reference.scan_chromosome("chr2").unwrap();
        assert_eq!(reference.len(), 4);
    }

    #[test]
    fn test_no_reference() {
        let mut reference = Reference::open(None).unwrap();
        reference.scan_chromosome("chr1").unwrap();
        assert_eq!(reference.base(10), UNKNOWN_BASE);
    }
}
