//! Filter kernel families over fixed-width integer lanes.
//!
//! Two implementations share one contract: the vector family packs 64 rows
//! into one mask word per iteration, building each word from unrolled
//! eight-lane chunks the compiler can turn into wide compares; the scalar
//! family is a plain per-row loop. Counts and bitmaps are bit-identical
//! between the two.
//!
//! The specialization axes (lane type, operator, fused bound, output mode)
//! are all resolved here, before the inner loops, so the loops themselves
//! carry no per-row dispatch.

use crate::bitmap::Bitmap;
use crate::query::CmpOp;

/// What a kernel produces for one column of one row group.
pub enum FilterMode<'a> {
    /// Only the number of matching rows.
    CountOnly,
    /// Write a fresh bitmap, return its popcount.
    Set(&'a mut Bitmap),
    /// Keep only existing bits whose row also matches, return the popcount
    /// of the result.
    And(&'a mut Bitmap),
}

/// Secondary bound of a fused range filter. Only upper bounds fuse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FusedOp {
    Lt,
    Le,
}

impl FusedOp {
    pub fn as_cmp(self) -> CmpOp {
        match self {
            FusedOp::Lt => CmpOp::Lt,
            FusedOp::Le => CmpOp::Le,
        }
    }
}

/// Whole-group short-circuit: no row can match.
pub fn filter_none(mode: FilterMode<'_>) -> usize {
    match mode {
        FilterMode::CountOnly => 0,
        FilterMode::Set(bitmap) => {
            bitmap.fill(false);
            0
        }
        FilterMode::And(bitmap) => {
            bitmap.fill(false);
            0
        }
    }
}

/// Whole-group short-circuit: every row matches.
pub fn filter_all(size: usize, mode: FilterMode<'_>) -> usize {
    match mode {
        FilterMode::CountOnly => size,
        FilterMode::Set(bitmap) => {
            bitmap.fill(true);
            size
        }
        FilterMode::And(bitmap) => bitmap.count_ones(),
    }
}

/// Evaluates `value (op) bound [AND value (fused_op) fused_bound]` over a
/// lane buffer. Every bound reaching this point is exactly representable in
/// `T`; range reduction upstream guarantees it.
pub fn filter_lanes<T>(
    values: &[T],
    bound: T,
    op: CmpOp,
    fused: Option<(T, FusedOp)>,
    mode: FilterMode<'_>,
    use_simd: bool,
) -> usize
where
    T: Copy + PartialOrd,
{
    match fused {
        None => match op {
            CmpOp::Eq => run(values, |v| v == bound, mode, use_simd),
            CmpOp::Ne => run(values, |v| v != bound, mode, use_simd),
            CmpOp::Lt => run(values, |v| v < bound, mode, use_simd),
            CmpOp::Le => run(values, |v| v <= bound, mode, use_simd),
            CmpOp::Gt => run(values, |v| v > bound, mode, use_simd),
            CmpOp::Ge => run(values, |v| v >= bound, mode, use_simd),
        },
        Some((f, FusedOp::Lt)) => match op {
            CmpOp::Eq => run(values, |v| v == bound && v < f, mode, use_simd),
            CmpOp::Ne => run(values, |v| v != bound && v < f, mode, use_simd),
            CmpOp::Lt => run(values, |v| v < bound && v < f, mode, use_simd),
            CmpOp::Le => run(values, |v| v <= bound && v < f, mode, use_simd),
            CmpOp::Gt => run(values, |v| v > bound && v < f, mode, use_simd),
            CmpOp::Ge => run(values, |v| v >= bound && v < f, mode, use_simd),
        },
        Some((f, FusedOp::Le)) => match op {
            CmpOp::Eq => run(values, |v| v == bound && v <= f, mode, use_simd),
            CmpOp::Ne => run(values, |v| v != bound && v <= f, mode, use_simd),
            CmpOp::Lt => run(values, |v| v < bound && v <= f, mode, use_simd),
            CmpOp::Le => run(values, |v| v <= bound && v <= f, mode, use_simd),
            CmpOp::Gt => run(values, |v| v > bound && v <= f, mode, use_simd),
            CmpOp::Ge => run(values, |v| v >= bound && v <= f, mode, use_simd),
        },
    }
}

#[inline]
fn run<T, P>(values: &[T], pred: P, mode: FilterMode<'_>, use_simd: bool) -> usize
where
    T: Copy,
    P: Fn(T) -> bool,
{
    match (mode, use_simd) {
        (FilterMode::CountOnly, true) => vector_count(values, &pred),
        (FilterMode::Set(bitmap), true) => vector_set(values, &pred, bitmap),
        (FilterMode::And(bitmap), true) => vector_and(values, &pred, bitmap),
        (FilterMode::CountOnly, false) => scalar_count(values, &pred),
        (FilterMode::Set(bitmap), false) => scalar_set(values, &pred, bitmap),
        (FilterMode::And(bitmap), false) => scalar_and(values, &pred, bitmap),
    }
}

/// Packs eight lane results into eight bits. The explicit unroll is what
/// lets the compiler vectorize the compare.
#[inline(always)]
fn pack_chunk8<T, P>(values: &[T], pred: &P) -> u8
where
    T: Copy,
    P: Fn(T) -> bool,
{
    let b0 = pred(values[0]) as u8;
    let b1 = pred(values[1]) as u8;
    let b2 = pred(values[2]) as u8;
    let b3 = pred(values[3]) as u8;
    let b4 = pred(values[4]) as u8;
    let b5 = pred(values[5]) as u8;
    let b6 = pred(values[6]) as u8;
    let b7 = pred(values[7]) as u8;

    b0 | (b1 << 1) | (b2 << 2) | (b3 << 3) | (b4 << 4) | (b5 << 5) | (b6 << 6) | (b7 << 7)
}

/// Builds the mask word for rows `[base, base + count)`, `count <= 64`.
#[inline]
fn mask_word<T, P>(values: &[T], base: usize, count: usize, pred: &P) -> u64
where
    T: Copy,
    P: Fn(T) -> bool,
{
    let full_chunks = count / 8;
    let mut word = 0u64;
    for chunk in 0..full_chunks {
        let start = base + chunk * 8;
        let bits = pack_chunk8(&values[start..start + 8], pred);
        word |= u64::from(bits) << (chunk * 8);
    }
    for bit in (full_chunks * 8)..count {
        word |= u64::from(pred(values[base + bit])) << bit;
    }
    word
}

fn vector_count<T, P>(values: &[T], pred: &P) -> usize
where
    T: Copy,
    P: Fn(T) -> bool,
{
    let num_rows = values.len();
    let mut matches = 0;
    for word_idx in 0..num_rows.div_ceil(64) {
        let base = word_idx * 64;
        let count = (num_rows - base).min(64);
        matches += mask_word(values, base, count, pred).count_ones() as usize;
    }
    matches
}

fn vector_set<T, P>(values: &[T], pred: &P, bitmap: &mut Bitmap) -> usize
where
    T: Copy,
    P: Fn(T) -> bool,
{
    debug_assert_eq!(bitmap.len(), values.len());
    let num_rows = values.len();
    let words = bitmap.words_mut();
    let mut matches = 0;
    for (word_idx, word) in words.iter_mut().enumerate() {
        let base = word_idx * 64;
        let count = (num_rows - base).min(64);
        let mask = mask_word(values, base, count, pred);
        *word = mask;
        matches += mask.count_ones() as usize;
    }
    matches
}

fn vector_and<T, P>(values: &[T], pred: &P, bitmap: &mut Bitmap) -> usize
where
    T: Copy,
    P: Fn(T) -> bool,
{
    debug_assert_eq!(bitmap.len(), values.len());
    let num_rows = values.len();
    let words = bitmap.words_mut();
    let mut matches = 0;
    for (word_idx, word) in words.iter_mut().enumerate() {
        let base = word_idx * 64;
        let count = (num_rows - base).min(64);
        let merged = *word & mask_word(values, base, count, pred);
        *word = merged;
        matches += merged.count_ones() as usize;
    }
    matches
}

fn scalar_count<T, P>(values: &[T], pred: &P) -> usize
where
    T: Copy,
    P: Fn(T) -> bool,
{
    let mut matches = 0;
    for &v in values {
        if pred(v) {
            matches += 1;
        }
    }
    matches
}

fn scalar_set<T, P>(values: &[T], pred: &P, bitmap: &mut Bitmap) -> usize
where
    T: Copy,
    P: Fn(T) -> bool,
{
    debug_assert_eq!(bitmap.len(), values.len());
    let words = bitmap.words_mut();
    let mut matches = 0;
    for (i, &v) in values.iter().enumerate() {
        if pred(v) {
            words[i >> 6] |= 1u64 << (i & 63);
            matches += 1;
        } else {
            words[i >> 6] &= !(1u64 << (i & 63));
        }
    }
    matches
}

fn scalar_and<T, P>(values: &[T], pred: &P, bitmap: &mut Bitmap) -> usize
where
    T: Copy,
    P: Fn(T) -> bool,
{
    debug_assert_eq!(bitmap.len(), values.len());
    let words = bitmap.words_mut();
    let mut matches = 0;
    for (i, &v) in values.iter().enumerate() {
        if pred(v) {
            if words[i >> 6] & (1u64 << (i & 63)) != 0 {
                matches += 1;
            }
        } else {
            words[i >> 6] &= !(1u64 << (i & 63));
        }
    }
    matches
}
