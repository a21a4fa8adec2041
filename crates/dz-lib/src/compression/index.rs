//! Block index: one entry per block, enabling range queries.
//!
//! Entries are stored back to back in a single gzip stream. For random
//! access they are grouped per `(sample, chromosome)` and ordered by
//! `(start, offset)` so the block holding a position is a predecessor query.

use anyhow::Result;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

use super::backend::{compress_gzip, decompress_gzip};
use super::bytes::{write_cstr, write_sized, write_u16, write_u64, ByteReader};
use super::genome_fix::FixSpan;
use super::Field;
use crate::DzError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IndexEntry {
    /// Per-field decoder state to restore before decoding this block.
    pub fields: [Vec<u8>; Field::COUNT],
    pub sample: u16,
    pub offset: u64,
    pub records: u64,
    pub chromosome: String,
    pub start: u64,
    pub end: u64,
    pub fix: FixSpan,
}

impl IndexEntry {
    fn write(&self, out: &mut Vec<u8>) {
        for state in &self.fields {
            write_sized(out, state);
        }
        write_u16(out, self.sample);
        write_u64(out, self.offset);
        write_u64(out, self.records);
        write_cstr(out, self.chromosome.as_bytes());
        write_u64(out, self.start);
        write_u64(out, self.end);
        write_u64(out, self.fix.start);
        write_u64(out, self.fix.end);
    }

    fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let mut fields: [Vec<u8>; Field::COUNT] = Default::default();
        for state in fields.iter_mut() {
            *state = reader.read_sized()?.to_vec();
        }
        Ok(Self {
            fields,
            sample: reader.read_u16()?,
            offset: reader.read_u64()?,
            records: reader.read_u64()?,
            chromosome: reader.read_string()?,
            start: reader.read_u64()?,
            end: reader.read_u64()?,
            fix: FixSpan {
                start: reader.read_u64()?,
                end: reader.read_u64()?,
            },
        })
    }
}

/// Serialise entries into one gzip stream.
pub(crate) fn encode_entries(entries: &[IndexEntry]) -> Result<Vec<u8>> {
    let mut raw = Vec::new();
    for entry in entries {
        entry.write(&mut raw);
    }
    compress_gzip(&raw, 6)
}

/// Parse a gzip stream of entries; the end of the stream ends the list.
pub(crate) fn decode_entries(data: &[u8]) -> Result<Vec<IndexEntry>> {
    let raw = decompress_gzip(data)?;
    let mut reader = ByteReader::new(&raw);
    let mut entries = Vec::new();
    while !reader.is_empty() {
        entries.push(IndexEntry::read(&mut reader)?);
    }
    Ok(entries)
}

/// In-memory index keyed for predecessor lookups.
pub(crate) struct BlockIndex {
    entries: Vec<IndexEntry>,
    regions: FxHashMap<(u16, String), BTreeMap<(u64, u64), usize>>,
}

impl BlockIndex {
    pub(crate) fn new(entries: Vec<IndexEntry>) -> Self {
        let mut regions: FxHashMap<(u16, String), BTreeMap<(u64, u64), usize>> = FxHashMap::default();
        for (i, entry) in entries.iter().enumerate() {
            regions
                .entry((entry.sample, entry.chromosome.clone()))
                .or_default()
                .insert((entry.start, entry.offset), i);
        }
        Self { entries, regions }
    }

    pub(crate) fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub(crate) fn get(&self, i: usize) -> Option<&IndexEntry> {
        self.entries.get(i)
    }

    /// Earliest block of `(sample, chromosome)` that can hold a record
    /// starting at `pos`.
    ///
    /// That is the first of the blocks sharing the greatest start `<= pos`,
    /// or the block before them when it ends exactly at `pos` (zero-span
    /// records at a block boundary).
    pub(crate) fn find(&self, sample: u16, chromosome: &str, pos: u64) -> Result<usize> {
        let blocks = self
            .regions
            .get(&(sample, chromosome.to_string()))
            .ok_or_else(|| DzError::query(format!("invalid chromosome {chromosome} for sample {sample}")))?;
        let not_found = || DzError::query(format!("region not found: {chromosome}:{}", pos + 1));
        let start = blocks
            .range(..=(pos, u64::MAX))
            .next_back()
            .map(|(&(start, _), _)| start)
            .ok_or_else(not_found)?;
        if start == pos {
            if let Some((_, &prev)) = blocks.range(..(start, 0)).next_back() {
                if self.entries[prev].end >= pos {
                    return Ok(prev);
                }
            }
        }
        blocks
            .range((start, 0)..)
            .next()
            .map(|(_, &i)| i)
            .ok_or_else(not_found)
    }

    /// First block of `(sample, chromosome)`.
    pub(crate) fn first(&self, sample: u16, chromosome: &str) -> Option<usize> {
        self.regions
            .get(&(sample, chromosome.to_string()))
            .and_then(|blocks| blocks.values().next().copied())
    }

    /// Earlier blocks of the same sample and chromosome whose fixes cover
    /// positions used by block `i`, in file order.
    pub(crate) fn replay_candidates(&self, i: usize) -> Vec<usize> {
        let Some(target) = self.entries.get(i) else {
            return Vec::new();
        };
        let Some(blocks) = self.regions.get(&(target.sample, target.chromosome.clone())) else {
            return Vec::new();
        };
        let mut out: Vec<usize> = blocks
            .values()
            .copied()
            .filter(|&j| {
                let entry = &self.entries[j];
                entry.offset < target.offset && entry.fix.intersects(target.start, target.end.max(target.start + 1))
            })
            .collect();
        out.sort_by_key(|&j| self.entries[j].offset);
        out
    }

    /// Blocks of `(sample, chromosome)` in file order, starting at block `i`.
    pub(crate) fn following(&self, i: usize) -> impl Iterator<Item = usize> + '_ {
        let (sample, chromosome) = self
            .entries
            .get(i)
            .map(|e| (e.sample, e.chromosome.clone()))
            .unwrap_or_default();
        (i..self.entries.len()).take_while(move |&j| {
            let e = &self.entries[j];
            e.sample == sample && e.chromosome == chromosome
        })
    }
}

/// One range query, 0-based with an inclusive end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub sample: u16,
    pub chromosome: String,
    pub start: u64,
    pub end: u64,
}

fn parse_position(text: &str) -> Result<u64> {
    text.trim()
        .replace(',', "")
        .parse::<u64>()
        .map_err(|_| DzError::query(format!("invalid position {text:?}")))
}

fn is_interval(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit() || b == b'-' || b == b',')
}

/// Parse `;`-separated `[sample,]chromosome[:start[-end]]` ranges.
///
/// Positions are 1-based inclusive on input and converted to 0-based;
/// reversed bounds are swapped and a missing end is unbounded.
pub fn parse_ranges(text: &str) -> Result<Vec<Region>> {
    let mut regions = Vec::new();
    for part in text.split(';').map(str::trim).filter(|p| !p.is_empty()) {
        let (sample, rest) = match part.split_once(',') {
            Some((id, rest)) if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) => {
                let sample = id
                    .parse::<u16>()
                    .map_err(|_| DzError::query(format!("invalid sample id {id:?}")))?;
                (sample, rest)
            }
            _ => (0, part),
        };

        let (chromosome, interval) = match rest.rsplit_once(':') {
            Some((chr, interval)) if is_interval(interval) => (chr, Some(interval)),
            _ => (rest, None),
        };
        if chromosome.is_empty() {
            return Err(DzError::query(format!("missing chromosome in range {part:?}")));
        }

        let (mut start, mut end) = match interval {
            None => (1, u64::MAX),
            Some(interval) => match interval.split_once('-') {
                Some((s, e)) if e.trim().is_empty() => (parse_position(s)?, u64::MAX),
                Some((s, e)) => (parse_position(s)?, parse_position(e)?),
                None => (parse_position(interval)?, u64::MAX),
            },
        };
        if start > end {
            std::mem::swap(&mut start, &mut end);
        }
        regions.push(Region {
            sample,
            chromosome: chromosome.to_string(),
            start: start.saturating_sub(1),
            end: if end == u64::MAX { u64::MAX } else { end.saturating_sub(1) },
        });
    }
    if regions.is_empty() {
        return Err(DzError::query(format!("empty range {text:?}")));
    }
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(sample: u16, chromosome: &str, start: u64, end: u64, offset: u64, fix: (u64, u64)) -> IndexEntry {
        IndexEntry {
            fields: Default::default(),
            sample,
            offset,
            records: 10,
            chromosome: chromosome.to_string(),
            start,
            end,
            fix: FixSpan { start: fix.0, end: fix.1 },
        }
    }

    #[test]
    fn test_predecessor_lookup() {
        let index = BlockIndex::new(vec![
            entry(0, "chr1", 100, 480, 10, (0, 500)),
            entry(0, "chr1", 500, 880, 200, (500, 900)),
            entry(0, "chr1", 900, 1300, 400, (900, u64::MAX)),
        ]);
        assert_eq!(index.find(0, "chr1", 650).unwrap(), 1);
        assert_eq!(index.find(0, "chr1", 900).unwrap(), 2);
        assert_eq!(index.find(0, "chr1", 5000).unwrap(), 2);

        let err = index.find(0, "chr1", 50).unwrap_err();
        assert!(matches!(err.downcast_ref::<DzError>(), Some(DzError::Query(_))));
        assert!(err.to_string().contains("region not found"));
        assert!(index.find(0, "chr9", 50).is_err());
        assert!(index.find(1, "chr1", 650).is_err());
        assert_eq!(index.first(0, "chr1"), Some(0));
        assert_eq!(index.first(0, "chr2"), None);
    }

    #[test]
    fn test_replay_candidates() {
        let index = BlockIndex::new(vec![
            entry(0, "chr1", 100, 700, 10, (0, 500)),
            entry(0, "chr1", 450, 880, 200, (500, 900)),
            entry(0, "chr1", 600, 1300, 400, (900, u64::MAX)),
            entry(0, "chr2", 0, 100, 600, (0, u64::MAX)),
        ]);
        assert_eq!(index.replay_candidates(2), vec![1]);
        assert_eq!(index.replay_candidates(1), vec![0]);
        assert!(index.replay_candidates(0).is_empty());
        assert!(index.replay_candidates(3).is_empty());
        assert_eq!(index.following(1).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_replay_skips_empty_fix_spans() {
        let index = BlockIndex::new(vec![
            entry(0, "chr1", 0, 40, 10, (0, 50)),
            entry(0, "chr1", 50, 50, 100, (50, 50)),
            entry(0, "chr1", 50, 120, 200, (50, u64::MAX)),
        ]);
        assert_eq!(index.replay_candidates(2), Vec::<usize>::new());
        assert!(index.replay_candidates(1).is_empty());
    }

    #[test]
    fn test_find_with_shared_starts() {
        let index = BlockIndex::new(vec![
            entry(0, "chr1", 100, 300, 10, (0, 300)),
            entry(0, "chr1", 300, 300, 100, (300, 300)),
            entry(0, "chr1", 300, 400, 200, (300, 500)),
            entry(0, "chr1", 500, 700, 300, (500, u64::MAX)),
        ]);
        // first of the tied blocks, or the one before it when it ends at pos
        assert_eq!(index.find(0, "chr1", 300).unwrap(), 0);
        assert_eq!(index.find(0, "chr1", 350).unwrap(), 1);
        assert_eq!(index.find(0, "chr1", 500).unwrap(), 3);
        assert_eq!(index.find(0, "chr1", 250).unwrap(), 0);
    }

    #[test]
    fn test_entries_roundtrip() {
        let mut first = entry(1, "chrX", 5, 50, 123, (0, 60));
        first.fields[Field::EditOperation as usize] = 42u64.to_le_bytes().to_vec();
        let entries = vec![first, entry(1, "*", 0, 0, 456, (0, 0))];
        let decoded = decode_entries(&encode_entries(&entries).unwrap()).unwrap();
        assert_eq!(decoded, entries);
        assert!(decode_entries(&encode_entries(&[]).unwrap()).unwrap().is_empty());
    }

    #[test]
    fn test_parse_ranges() {
        let regions = parse_ranges("chr1:100-200;2,chr2:50").unwrap();
        assert_eq!(
            regions,
            vec![
                Region { sample: 0, chromosome: "chr1".into(), start: 99, end: 199 },
                Region { sample: 2, chromosome: "chr2".into(), start: 49, end: u64::MAX },
            ]
        );

        let regions = parse_ranges("chr3:500-100;HLA-A*01:01:1-10;chrM").unwrap();
        assert_eq!((regions[0].start, regions[0].end), (99, 499));
        assert_eq!(regions[1].chromosome, "HLA-A*01:01");
        assert_eq!((regions[1].start, regions[1].end), (0, 9));
        assert_eq!((regions[2].start, regions[2].end), (0, u64::MAX));

        assert!(parse_ranges("").is_err());
        assert!(parse_ranges("chr1:1-x2").is_ok_and(|r| r[0].chromosome == "chr1:1-x2"));
    }
}
