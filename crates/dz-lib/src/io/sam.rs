use anyhow::{Context, Result};
use std::io::BufRead;
use std::path::Path;

use super::{trim_newline, FileReader};
use crate::DzError;

/// Number of mandatory SAM columns.
const MANDATORY_COLUMNS: usize = 11;

/// One SAM alignment line.
///
/// `pos` and `pnext` keep the 1-based SAM convention (0 = unset). `seq` and
/// `qual` are empty when the column holds `*`; `optional` is the raw text
/// after the 11th column (tab separated tags, possibly empty).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamRecord {
    pub qname: Vec<u8>,
    pub flag: u16,
    pub rname: String,
    pub pos: u64,
    pub mapq: u8,
    pub cigar: String,
    pub rnext: String,
    pub pnext: u64,
    pub tlen: i32,
    pub seq: Vec<u8>,
    pub qual: Vec<u8>,
    pub optional: Vec<u8>,
}

impl SamRecord {
    /// Parse one tab-delimited SAM line (without the trailing newline).
    pub fn parse(line: &[u8]) -> Result<Self> {
        let mut columns = line.splitn(MANDATORY_COLUMNS + 1, |&b| b == b'\t');
        let mut next = |name: &str| {
            columns
                .next()
                .ok_or_else(|| DzError::format(format!("missing SAM column {name}")))
        };

        let qname = next("QNAME")?.to_vec();
        let flag = parse_number(next("FLAG")?, "FLAG")?;
        let rname = text(next("RNAME")?, "RNAME")?;
        let pos = parse_number(next("POS")?, "POS")?;
        let mapq = parse_number(next("MAPQ")?, "MAPQ")?;
        let cigar = text(next("CIGAR")?, "CIGAR")?;
        let rnext = text(next("RNEXT")?, "RNEXT")?;
        let pnext = parse_number(next("PNEXT")?, "PNEXT")?;
        let tlen = parse_number(next("TLEN")?, "TLEN")?;
        let seq = star_to_empty(next("SEQ")?);
        let qual = star_to_empty(next("QUAL")?);
        let optional = columns.next().map(<[u8]>::to_vec).unwrap_or_default();

        Ok(Self {
            qname,
            flag,
            rname,
            pos,
            mapq,
            cigar,
            rnext,
            pnext,
            tlen,
            seq,
            qual,
            optional,
        })
    }

    /// 0-based alignment start (0 for records without a position).
    pub fn start(&self) -> u64 {
        self.pos.saturating_sub(1)
    }

    /// True for records outside any chromosome (`RNAME == "*"`).
    pub fn is_unplaced(&self) -> bool {
        self.rname == "*"
    }
}

fn star_to_empty(column: &[u8]) -> Vec<u8> {
    if column == b"*" {
        Vec::new()
    } else {
        column.to_vec()
    }
}

fn text(column: &[u8], name: &str) -> Result<String> {
    String::from_utf8(column.to_vec())
        .map_err(|_| DzError::format(format!("{name} is not valid UTF-8")))
}

fn parse_number<T: std::str::FromStr>(column: &[u8], name: &str) -> Result<T> {
    std::str::from_utf8(column)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            DzError::format(format!(
                "invalid {name} value {:?}",
                String::from_utf8_lossy(column)
            ))
        })
}

/// SAM reader with one record of lookahead.
///
/// The compressor needs to peek at the next record to decide block
/// boundaries, so the reader always keeps the upcoming record parsed.
pub struct SamReader<R: BufRead> {
    reader: R,
    buffer: Vec<u8>,
    header: Vec<u8>,
    head: Option<SamRecord>,
    line_number: u64,
}

impl SamReader<FileReader> {
    /// Open a SAM file (auto-detects gzip), or read from stdin if path is `-`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let reader = FileReader::open(path)?;
        Self::new(reader).with_context(|| format!("Failed to read SAM input {:?}", path))
    }
}

impl<R: BufRead> SamReader<R> {
    /// Consume the `@` header lines and parse the first record.
    pub fn new(reader: R) -> Result<Self> {
        let mut sam = Self {
            reader,
            buffer: Vec::with_capacity(1024),
            header: Vec::new(),
            head: None,
            line_number: 0,
        };
        loop {
            if !sam.read_line()? {
                return Ok(sam);
            }
            if sam.buffer.first() == Some(&b'@') {
                sam.header.extend_from_slice(&sam.buffer);
                sam.header.push(b'\n');
                continue;
            }
            sam.head = Some(sam.parse_buffer()?);
            return Ok(sam);
        }
    }

    /// Raw SAM header text (every `@` line, newline terminated).
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    pub fn has_next(&self) -> bool {
        self.head.is_some()
    }

    /// The record the next call to [`SamReader::next`] will return.
    pub fn head(&self) -> Option<&SamRecord> {
        self.head.as_ref()
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<SamRecord>> {
        let Some(current) = self.head.take() else {
            return Ok(None);
        };
        if self.read_line()? {
            self.head = Some(self.parse_buffer()?);
        }
        Ok(Some(current))
    }

    /// Read the next non-empty line into the buffer. Returns false at EOF.
    fn read_line(&mut self) -> Result<bool> {
        loop {
            self.buffer.clear();
            if self.reader.read_until(b'\n', &mut self.buffer)? == 0 {
                return Ok(false);
            }
            self.line_number += 1;
            trim_newline(&mut self.buffer);
            if !self.buffer.is_empty() {
                return Ok(true);
            }
        }
    }

    fn parse_buffer(&self) -> Result<SamRecord> {
        SamRecord::parse(&self.buffer)
            .with_context(|| format!("malformed SAM record at line {}", self.line_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SAM: &str = "@HD\tVN:1.6\tSO:coordinate\n\
@SQ\tSN:chr1\tLN:1000\n\
r1\t0\tchr1\t5\t60\t4M\t*\t0\t0\tACGT\tIIII\tNM:i:0\n\
r2\t16\tchr1\t9\t30\t2S2M\t=\t20\t15\tTTGA\t*\n\
\n\
r3\t4\t*\t0\t0\t*\t*\t0\t0\t*\t*\n";

    #[test]
    fn test_header_and_records() {
        let mut reader = SamReader::new(Cursor::new(SAM)).unwrap();
        assert_eq!(reader.header(), b"@HD\tVN:1.6\tSO:coordinate\n@SQ\tSN:chr1\tLN:1000\n");
        assert_eq!(reader.head().unwrap().qname, b"r1");

        let r1 = reader.next().unwrap().unwrap();
        assert_eq!(r1.start(), 4);
        assert_eq!(r1.optional, b"NM:i:0");

        let r2 = reader.next().unwrap().unwrap();
        assert_eq!(r2.flag, 16);
        assert_eq!(r2.rnext, "=");
        assert_eq!(r2.tlen, 15);
        assert!(r2.qual.is_empty());
        assert!(r2.optional.is_empty());

        let r3 = reader.next().unwrap().unwrap();
        assert!(r3.is_unplaced());
        assert!(r3.seq.is_empty());
        assert!(!reader.has_next());
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn test_optional_keeps_tabs() {
        let line = b"q\t0\tc\t1\t0\t1M\t*\t0\t0\tA\tI\tAS:i:1\tXS:i:0";
        let record = SamRecord::parse(line).unwrap();
        assert_eq!(record.optional, b"AS:i:1\tXS:i:0");
    }

    #[test]
    fn test_malformed_line() {
        let err = SamReader::new(Cursor::new("r1\t0\tchr1\tx\t60\n")).err().unwrap();
        assert!(err.downcast_ref::<DzError>().is_some());
        assert!(format!("{err:#}").contains("line 1"));
    }

    #[test]
    fn test_negative_tlen() {
        let record = SamRecord::parse(b"q\t0\tc\t1\t0\t1M\t=\t1\t-150\tA\tI").unwrap();
        assert_eq!(record.tlen, -150);
    }
}
