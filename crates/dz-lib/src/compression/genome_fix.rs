//! Consensus corrections ("fixes") to the reference genome.
//!
//! Read bases observed at each reference position are counted in lazily
//! created pages. Once no future record can touch a position, it is
//! finalised: a base backed by a strict majority of observations replaces the
//! reference base there. Finalised changes are shipped in the sequence stream
//! so that the decoder reproduces the same corrected genome.

use std::collections::BTreeMap;

use crate::io::Reference;

/// Positions covered by one page of observation counts.
pub const FIX_PAGE_SIZE: u64 = 1 << 16;

const BASES: [u8; 4] = *b"ACGT";

#[inline]
fn base_index(base: u8) -> Option<usize> {
    match base {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None,
    }
}

/// Half-open genomic range `[start, end)` finalised by one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FixSpan {
    pub start: u64,
    pub end: u64,
}

impl FixSpan {
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// True when the span overlaps the half-open range `[start, end)`.
    pub fn intersects(&self, start: u64, end: u64) -> bool {
        !self.is_empty() && self.start < end && start < self.end
    }
}

struct FixPage {
    counts: Vec<[u32; 4]>,
}

impl FixPage {
    fn new() -> Self {
        Self {
            counts: vec![[0; 4]; FIX_PAGE_SIZE as usize],
        }
    }
}

/// Per-chromosome fix state.
pub struct GenomeFixes {
    pages: Vec<Option<FixPage>>,
    changes: BTreeMap<u64, u8>,
    fixed_upto: u64,
}

impl Default for GenomeFixes {
    fn default() -> Self {
        Self::new()
    }
}

impl GenomeFixes {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            changes: BTreeMap::new(),
            fixed_upto: 0,
        }
    }

    /// Drop all state; called when the chromosome changes.
    pub fn reset(&mut self) {
        self.pages.clear();
        self.changes.clear();
        self.fixed_upto = 0;
    }

    /// Everything below this position has been finalised.
    pub fn fixed_upto(&self) -> u64 {
        self.fixed_upto
    }

    /// Count one observed read base. Non-ACGT bases and positions that are
    /// already finalised are ignored.
    pub fn observe(&mut self, pos: u64, base: u8) {
        let Some(idx) = base_index(base) else {
            return;
        };
        if pos < self.fixed_upto {
            return;
        }
        let page = (pos / FIX_PAGE_SIZE) as usize;
        if page >= self.pages.len() {
            self.pages.resize_with(page + 1, || None);
        }
        let counts = self.pages[page].get_or_insert_with(FixPage::new);
        counts.counts[(pos % FIX_PAGE_SIZE) as usize][idx] += 1;
    }

    /// Finalise every position in `[fixed_upto, upto)`.
    ///
    /// Returns the finalised span and the positions whose base changed.
    /// Calling again with the same or a smaller `upto` is a no-op.
    pub fn apply_fixes(&mut self, upto: u64, reference: &Reference) -> (FixSpan, Vec<(u64, u8)>) {
        let start = self.fixed_upto;
        if upto <= start {
            return (FixSpan { start, end: start }, Vec::new());
        }

        let mut changed = Vec::new();
        let first_page = (start / FIX_PAGE_SIZE) as usize;
        for page_idx in first_page..self.pages.len() {
            let page_start = page_idx as u64 * FIX_PAGE_SIZE;
            if page_start >= upto {
                break;
            }
            let page_end = page_start + FIX_PAGE_SIZE;
            if let Some(page) = &self.pages[page_idx] {
                let lo = start.max(page_start);
                let hi = upto.min(page_end);
                for pos in lo..hi {
                    let counts = &page.counts[(pos - page_start) as usize];
                    let Some(base) = majority_base(counts) else {
                        continue;
                    };
                    if base != reference.base(pos) {
                        self.changes.insert(pos, base);
                        changed.push((pos, base));
                    }
                }
            }
            if page_end <= upto {
                self.pages[page_idx] = None;
            }
        }

        self.fixed_upto = upto;
        (FixSpan { start, end: upto }, changed)
    }

    /// Record a change decoded from a sequence stream.
    pub fn insert_change(&mut self, pos: u64, base: u8) {
        self.changes.insert(pos, base);
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    /// Corrected base at `pos`.
    #[inline]
    pub fn fixed_base(&self, pos: u64, reference: &Reference) -> u8 {
        match self.changes.get(&pos) {
            Some(&base) => base,
            None => reference.base(pos),
        }
    }
}

/// Base holding a strict majority of the observations at one position.
fn majority_base(counts: &[u32; 4]) -> Option<u8> {
    let total: u32 = counts.iter().sum();
    if total == 0 {
        return None;
    }
    let (best, &count) = counts.iter().enumerate().max_by_key(|&(_, c)| *c)?;
    (2 * count > total).then_some(BASES[best])
}

/// Read-only view of the original and corrected genome of one chromosome.
#[derive(Clone, Copy)]
pub struct Genome<'a> {
    reference: &'a Reference,
    fixes: &'a GenomeFixes,
}

impl<'a> Genome<'a> {
    pub fn new(reference: &'a Reference, fixes: &'a GenomeFixes) -> Self {
        Self { reference, fixes }
    }

    #[inline]
    pub fn fixed_base(&self, pos: u64) -> u8 {
        self.fixes.fixed_base(pos, self.reference)
    }

    #[inline]
    pub fn reference_base(&self, pos: u64) -> u8 {
        self.reference.base(pos)
    }
}
