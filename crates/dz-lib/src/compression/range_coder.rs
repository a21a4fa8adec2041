//! Adaptive range coding.
//!
//! LZMA-style range coder with integer cumulative frequency models. Models are
//! allocated lazily per context so sparse context spaces stay cheap. Used by
//! the quality-score codec and, through [`compress_order2`], by quality-like
//! optional tags.

use anyhow::Result;

use super::bytes::{write_varint, ByteReader};
use crate::DzError;

/// `range` is renormalised a byte at a time once it falls below this.
const RANGE_TOP: u32 = 1 << 24;
/// Model counts are halved once their total reaches this.
const RESCALE_THRESHOLD: u32 = 1 << 20;

/// Previous-symbol contexts are clamped to this many buckets.
const ORDER2_BUCKETS: usize = 64;

/// Encoder half.
///
/// `low` keeps one bit above 32 to catch carries. The last settled byte is
/// held back, followed by a run of `0xFF` bytes, until it is known whether a
/// carry ripples into them.
pub(crate) struct RangeEncoder {
    low: u64,
    range: u32,
    held: u8,
    ff_run: usize,
    out: Vec<u8>,
}

impl RangeEncoder {
    pub(crate) fn new() -> Self {
        Self {
            low: 0,
            range: u32::MAX,
            held: 0,
            ff_run: 0,
            out: Vec::new(),
        }
    }

    /// Move the top byte of `low` out of the coding window.
    #[inline(always)]
    fn emit_top_byte(&mut self) {
        if self.low < 0xFF00_0000 || self.low >= 1 << 32 {
            let carry = (self.low >> 32) as u8;
            self.out.push(self.held.wrapping_add(carry));
            let filler = 0xFFu8.wrapping_add(carry);
            self.out.extend(std::iter::repeat(filler).take(self.ff_run));
            self.ff_run = 0;
            self.held = (self.low >> 24) as u8;
        } else {
            self.ff_run += 1;
        }
        self.low = (self.low & 0x00FF_FFFF) << 8;
    }

    /// Encode `sym` with `model`, then adapt the model.
    #[inline]
    pub(crate) fn encode_symbol(&mut self, model: &mut AdaptiveModel, sym: usize) {
        let (cum, freq) = model.interval(sym);
        let step = self.range / model.total;
        self.low += u64::from(cum) * u64::from(step);
        self.range = if cum + freq < model.total {
            step * freq
        } else {
            self.range - step * cum
        };
        while self.range < RANGE_TOP {
            self.range <<= 8;
            self.emit_top_byte();
        }
        model.update(sym);
    }

    pub(crate) fn finish(mut self) -> Vec<u8> {
        for _ in 0..5 {
            self.emit_top_byte();
        }
        self.out
    }
}

/// Decoder owning its input so that it can live inside a field decompressor
/// and be drained one record at a time.
pub(crate) struct RangeDecoder {
    range: u32,
    code: u32,
    input: Vec<u8>,
    pos: usize,
}

impl RangeDecoder {
    pub(crate) fn new(input: Vec<u8>) -> Self {
        let mut dec = Self {
            range: 0xFFFF_FFFF,
            code: 0,
            pos: usize::from(!input.is_empty()),
            input,
        };
        // the first byte is the encoder's initial held byte and carries nothing
        for _ in 0..4 {
            dec.code = (dec.code << 8) | dec.next_byte() as u32;
        }
        dec
    }

    #[inline(always)]
    fn next_byte(&mut self) -> u8 {
        if self.pos < self.input.len() {
            let b = self.input[self.pos];
            self.pos += 1;
            b
        } else {
            0
        }
    }

    #[inline(always)]
    fn normalize(&mut self) {
        while self.range < RANGE_TOP {
            self.code = (self.code << 8) | self.next_byte() as u32;
            self.range <<= 8;
        }
    }

    /// Decode one symbol with `model`, then adapt the model.
    #[inline]
    pub(crate) fn decode_symbol(&mut self, model: &mut AdaptiveModel) -> usize {
        let step = self.range / model.total;
        let target = (self.code / step).min(model.total - 1);

        // alphabets are small, a linear scan beats a binary search
        let mut sym = 0;
        while sym + 1 < model.n_symbols && model.cumulative[sym + 1] <= target {
            sym += 1;
        }

        let (cum, freq) = model.interval(sym);
        self.code = self.code.wrapping_sub(cum.wrapping_mul(step));
        self.range = if cum + freq < model.total {
            step * freq
        } else {
            self.range - step * cum
        };
        self.normalize();
        model.update(sym);
        sym
    }
}

/// Adaptive frequency model over `n_symbols` symbols, every count starting
/// at one.
pub(crate) struct AdaptiveModel {
    /// `n_symbols + 1` running totals starting at 0
    cumulative: Vec<u32>,
    n_symbols: usize,
    total: u32,
}

impl AdaptiveModel {
    pub(crate) fn new(n_symbols: usize) -> Self {
        debug_assert!(n_symbols > 0);
        Self {
            cumulative: (0..=n_symbols as u32).collect(),
            n_symbols,
            total: n_symbols as u32,
        }
    }

    /// `(cumulative count below sym, count of sym)`
    #[inline(always)]
    fn interval(&self, sym: usize) -> (u32, u32) {
        let cum = self.cumulative[sym];
        (cum, self.cumulative[sym + 1] - cum)
    }

    #[inline(always)]
    fn update(&mut self, sym: usize) {
        for c in &mut self.cumulative[sym + 1..] {
            *c += 1;
        }
        self.total += 1;
        if self.total >= RESCALE_THRESHOLD {
            self.rescale();
        }
    }

    /// Halve every count, keeping each at least one.
    fn rescale(&mut self) {
        let mut below = 0u32;
        for i in 0..self.n_symbols {
            let count = self.cumulative[i + 1] - self.cumulative[i];
            self.cumulative[i] = below;
            below += (count / 2).max(1);
        }
        self.cumulative[self.n_symbols] = below;
        self.total = below;
    }
}

/// Lazily allocated adaptive models indexed by context id.
///
/// Slot lookup is a flat `Vec<u32>` with `u32::MAX` marking contexts that
/// have not been seen yet.
pub(crate) struct ContextModels {
    slots: Vec<u32>,
    models: Vec<AdaptiveModel>,
    n_symbols: usize,
}

impl ContextModels {
    pub(crate) fn new(n_contexts: usize, n_symbols: usize) -> Self {
        Self {
            slots: vec![u32::MAX; n_contexts],
            models: Vec::new(),
            n_symbols,
        }
    }

    #[inline]
    pub(crate) fn get(&mut self, ctx: usize) -> &mut AdaptiveModel {
        let slot = if self.slots[ctx] == u32::MAX {
            let id = self.models.len() as u32;
            self.slots[ctx] = id;
            self.models.push(AdaptiveModel::new(self.n_symbols));
            id as usize
        } else {
            self.slots[ctx] as usize
        };
        &mut self.models[slot]
    }
}

/// Collect the sorted distinct byte values of `data` and a byte -> index map.
pub(crate) fn build_alphabet<'a>(data: impl IntoIterator<Item = &'a u8>) -> (Vec<u8>, [u8; 256]) {
    let mut seen = [false; 256];
    for &b in data {
        seen[b as usize] = true;
    }
    let symbols: Vec<u8> = (0u8..=255).filter(|&b| seen[b as usize]).collect();
    let mut sym_map = [0u8; 256];
    for (i, &s) in symbols.iter().enumerate() {
        sym_map[s as usize] = i as u8;
    }
    (symbols, sym_map)
}

#[inline]
fn order2_context(prev1: usize, prev2: usize) -> usize {
    prev1.min(ORDER2_BUCKETS - 1) * ORDER2_BUCKETS + prev2.min(ORDER2_BUCKETS - 1)
}

/// Compress arbitrary bytes with an order-2 context model.
///
/// Format: `[varint len][varint n_symbols][symbols][range coded data]`
pub(crate) fn compress_order2(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    write_varint(&mut out, data.len() as u64);
    if data.is_empty() {
        return out;
    }
    let (symbols, sym_map) = build_alphabet(data);
    write_varint(&mut out, symbols.len() as u64);
    out.extend_from_slice(&symbols);

    let mut models = ContextModels::new(ORDER2_BUCKETS * ORDER2_BUCKETS, symbols.len());
    let mut encoder = RangeEncoder::new();
    let (mut prev1, mut prev2) = (0usize, 0usize);
    for &b in data {
        let sym = sym_map[b as usize] as usize;
        encoder.encode_symbol(models.get(order2_context(prev1, prev2)), sym);
        prev2 = prev1;
        prev1 = sym + 1;
    }
    out.extend_from_slice(&encoder.finish());
    out
}

/// Inverse of [`compress_order2`].
pub(crate) fn decompress_order2(data: &[u8]) -> Result<Vec<u8>> {
    let mut reader = ByteReader::new(data);
    let len = reader.read_len()?;
    if len == 0 {
        return Ok(Vec::new());
    }
    let n_symbols = reader.read_len()?;
    if n_symbols == 0 || n_symbols > 256 {
        return Err(DzError::format(format!("invalid alphabet size {n_symbols}")));
    }
    let symbols = reader.read_bytes(n_symbols)?;
    let coded = reader.read_bytes(reader.remaining())?;

    let mut models = ContextModels::new(ORDER2_BUCKETS * ORDER2_BUCKETS, n_symbols);
    let mut decoder = RangeDecoder::new(coded.to_vec());
    let mut out = Vec::with_capacity(len);
    let (mut prev1, mut prev2) = (0usize, 0usize);
    for _ in 0..len {
        let sym = decoder.decode_symbol(models.get(order2_context(prev1, prev2)));
        out.push(symbols[sym]);
        prev2 = prev1;
        prev1 = sym + 1;
    }
    Ok(out)
}
