//! Archive statistics and per-session reconstruction counters.

use anyhow::Result;
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::io::Write;
use tracing::{info, warn};

use super::bytes::{write_u16, write_u64, ByteReader};
use crate::DzError;

/// Flag filter: positive keeps records with all bits of `filter` set,
/// negative drops them, zero keeps everything.
pub fn flag_passes(flag: u16, filter: i32) -> bool {
    let flag = i64::from(flag);
    let filter = i64::from(filter);
    match filter {
        0 => true,
        f if f > 0 => flag & f == f,
        f => flag & -f != -f,
    }
}

/// Read counts stored in the archive's stats section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    reads: u64,
    flags: BTreeMap<u16, u64>,
    chromosome_count: u64,
    seen: FxHashSet<String>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_record(&mut self, flag: u16, chromosome: &str) {
        self.reads += 1;
        *self.flags.entry(flag).or_insert(0) += 1;
        if !self.seen.contains(chromosome) {
            self.seen.insert(chromosome.to_string());
            self.chromosome_count += 1;
        }
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn chromosome_count(&self) -> u64 {
        self.chromosome_count
    }

    /// Number of reads passing the flag filter (see [`flag_passes`]).
    pub fn count_matching(&self, filter: i32) -> u64 {
        self.flags
            .iter()
            .filter(|(&flag, _)| flag_passes(flag, filter))
            .map(|(_, &count)| count)
            .sum()
    }

    pub fn mapped(&self) -> u64 {
        self.count_matching(-0x4)
    }

    pub fn unmapped(&self) -> u64 {
        self.count_matching(0x4)
    }

    /// Human-readable summary. Without a filter every stored flag value is
    /// listed with its count.
    pub fn write_report(&self, filter: i32, out: &mut dyn Write) -> Result<()> {
        writeln!(out, "Reads:\t{}", self.reads)?;
        writeln!(out, "Mapped:\t{}", self.mapped())?;
        writeln!(out, "Unmapped:\t{}", self.unmapped())?;
        writeln!(out, "Chromosomes:\t{}", self.chromosome_count)?;
        match filter {
            0 => {
                for (&flag, &count) in self.flags.iter().filter(|(_, &count)| count > 0) {
                    writeln!(out, "Flag {flag} (0x{flag:04x}):\t{count}")?;
                }
            }
            f if f > 0 => writeln!(out, "With flag {f} (0x{f:x}):\t{}", self.count_matching(f))?,
            f => writeln!(
                out,
                "Without flag {0} (0x{0:x}):\t{1}",
                f.unsigned_abs(),
                self.count_matching(f)
            )?,
        }
        Ok(())
    }

    pub(crate) fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(24 + self.flags.len() * 10);
        write_u64(&mut out, self.reads);
        write_u64(&mut out, self.chromosome_count);
        write_u64(&mut out, self.flags.len() as u64);
        for (&flag, &count) in &self.flags {
            write_u16(&mut out, flag);
            write_u64(&mut out, count);
        }
        out
    }

    pub(crate) fn deserialize(data: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(data);
        let reads = reader.read_u64()?;
        let chromosome_count = reader.read_u64()?;
        let n_flags = reader.read_u64()?;
        let mut flags = BTreeMap::new();
        for _ in 0..n_flags {
            let flag = reader.read_u16()?;
            flags.insert(flag, reader.read_u64()?);
        }
        if flags.values().sum::<u64>() != reads {
            return Err(DzError::format("stats flag histogram does not match read count"));
        }
        Ok(Self {
            reads,
            flags,
            chromosome_count,
            seen: FxHashSet::default(),
        })
    }
}

/// MD/XD/NM recomputation counters for one compression run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub md_total: u64,
    pub md_failed: u64,
    pub xd_total: u64,
    pub xd_failed: u64,
    pub nm_total: u64,
    pub nm_failed: u64,
}

impl SessionStats {
    pub fn merge(&mut self, other: &SessionStats) {
        self.md_total += other.md_total;
        self.md_failed += other.md_failed;
        self.xd_total += other.xd_total;
        self.xd_failed += other.xd_failed;
        self.nm_total += other.nm_total;
        self.nm_failed += other.nm_failed;
    }

    pub fn failures(&self) -> u64 {
        self.md_failed + self.xd_failed + self.nm_failed
    }

    pub fn log(&self) {
        info!(
            "Tag recomputation: MD {}/{}, XD {}/{}, NM {}/{}",
            self.md_total - self.md_failed,
            self.md_total,
            self.xd_total - self.xd_failed,
            self.xd_total,
            self.nm_total - self.nm_failed,
            self.nm_total
        );
        if self.failures() > 0 {
            warn!("{} tag values differ from the alignment and were stored verbatim", self.failures());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_stats() -> Stats {
        let mut stats = Stats::new();
        for (flag, chr) in [(0, "chr1"), (16, "chr1"), (99, "chr2"), (147, "chr2"), (4, "*"), (0x404, "*")] {
            stats.add_record(flag, chr);
        }
        stats
    }

    #[test]
    fn test_flag_filter() {
        assert!(flag_passes(99, 0));
        assert!(flag_passes(99, 3));
        assert!(!flag_passes(99, 4));
        assert!(!flag_passes(99, -3));
        assert!(flag_passes(99, -4));
    }

    #[test]
    fn test_counts() {
        let stats = sample_stats();
        assert_eq!(stats.reads(), 6);
        assert_eq!(stats.chromosome_count(), 3);
        assert_eq!(stats.mapped(), 4);
        assert_eq!(stats.unmapped(), 2);
        assert_eq!(stats.count_matching(0x10), 2);
        assert_eq!(stats.count_matching(0), 6);
    }

    #[test]
    fn test_report() {
        let stats = sample_stats();
        let mut out = Vec::new();
        stats.write_report(0, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Reads:\t6\nMapped:\t4\nUnmapped:\t2\nChromosomes:\t3\n"));
        let flags: Vec<&str> = text.lines().filter(|l| l.starts_with("Flag ")).collect();
        assert_eq!(
            flags,
            vec![
                "Flag 0 (0x0000):\t1",
                "Flag 4 (0x0004):\t1",
                "Flag 16 (0x0010):\t1",
                "Flag 99 (0x0063):\t1",
                "Flag 147 (0x0093):\t1",
                "Flag 1028 (0x0404):\t1",
            ]
        );

        let mut out = Vec::new();
        stats.write_report(-0x400, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("Without flag 1024 (0x400):\t5\n"));
        assert!(!text.contains("Flag "));

        let mut out = Vec::new();
        stats.write_report(16, &mut out).unwrap();
        assert!(String::from_utf8(out).unwrap().ends_with("With flag 16 (0x10):\t2\n"));
    }

    #[test]
    fn test_serialization() {
        let stats = sample_stats();
        let restored = Stats::deserialize(&stats.serialize()).unwrap();
        assert_eq!(restored.reads(), 6);
        assert_eq!(restored.chromosome_count(), 3);
        assert_eq!(restored.count_matching(-0x400), 5);
        assert!(Stats::deserialize(&stats.serialize()[..10]).is_err());
    }

    #[test]
    fn test_session_merge() {
        let mut total = SessionStats::default();
        let block = SessionStats {
            md_total: 3,
            md_failed: 1,
            nm_total: 2,
            ..SessionStats::default()
        };
        total.merge(&block);
        total.merge(&block);
        assert_eq!(total.md_total, 6);
        assert_eq!(total.failures(), 2);
    }
}
