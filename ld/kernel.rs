// ========================================================================================
//
//                 The dot-product kernel: five sufficient statistics per pair
//
// ========================================================================================
//
// For two encoded markers the kernel accumulates, over their words and masks:
//
//   xy: a biased product term. It starts at the cohort size and loses, per sample,
//       1 - x*y for jointly observed samples and 1 for everyone else.
//   x,  y:   sums of (value + 1) where the *other* marker is observed.
//   xx, yy:  counts of zero-valued calls where the *other* marker is observed.
//
// The seeds in `KernelSums::seeded` cancel the offsets, so after the last batch `xy`,
// `x` and `y` hold the exact centred sums while `xx` and `yy` hold the negated sums of
// squares. `KernelSums::derive` turns them into r.
//
// Population counts are first taken on 2-bit fields, folded to 4-bit fields every
// `WINDOW_VECTORS` vectors and to 8-bit fields once per window. At most
// `WINDOWS_PER_BATCH` windows go into the byte counters before they are summed
// horizontally, which keeps every byte at or below 240.

use crate::encode::{AAAA_MASK, EncodedView, FIVE_MASK, SAMPLES_PER_WORD, popcount2};
use std::simd::num::SimdUint;
use std::simd::Simd;

const M2: u64 = 0x3333_3333_3333_3333;
const M4: u64 = 0x0f0f_0f0f_0f0f_0f0f;
const M8: u64 = 0x00ff_00ff_00ff_00ff;

/// Vectors folded into one 4-bit window.
const WINDOW_VECTORS: usize = 3;
/// Windows accumulated in byte counters before the horizontal sum (10 * 24 = 240).
const WINDOWS_PER_BATCH: usize = 10;

#[cfg(target_feature = "avx512f")]
const KERNEL_SIMD_LANES: usize = 8;

#[cfg(all(
    not(target_feature = "avx512f"),
    any(
        target_feature = "avx",
        target_arch = "aarch64",
        target_arch = "wasm32"
    )
))]
const KERNEL_SIMD_LANES: usize = 4;

#[cfg(all(
    not(target_feature = "avx512f"),
    not(any(
        target_feature = "avx",
        target_arch = "aarch64",
        target_arch = "wasm32"
    ))
))]
const KERNEL_SIMD_LANES: usize = 2;

/// Words consumed by one full batch on this target.
pub const BATCH_WORDS: usize = WINDOW_VECTORS * WINDOWS_PER_BATCH * KERNEL_SIMD_LANES;

/// Samples covered by one full batch on this target.
pub const MULTIPLEX_WIDTH: usize = BATCH_WORDS * SAMPLES_PER_WORD;

/// The five raw accumulators for one marker pair.
///
/// `x`/`xx` belong to the marker passed as `var`, `y`/`yy` to the one passed as
/// `fixed`. Values are only meaningful once every batch of the pair has been added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelSums {
    pub xy: i64,
    pub x: i64,
    pub y: i64,
    pub xx: i64,
    pub yy: i64,
}

/// Covariance numerator and variance product, both scaled by the joint sample size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairCorrelation {
    pub cov: f64,
    pub var_product: f64,
}

impl PairCorrelation {
    #[inline]
    pub fn r(&self) -> f64 {
        self.cov / self.var_product.sqrt()
    }

    #[inline]
    pub fn r_squared(&self) -> f64 {
        self.cov * self.cov / self.var_product
    }
}

impl KernelSums {
    /// Seeds the accumulators for a pair before any batch is processed.
    ///
    /// `cohort` counts every observation slot (doubled rows included), `fixed_missing`
    /// and `var_missing` are the missing counts of the two markers.
    pub fn seeded(cohort: u32, fixed_missing: u32, var_missing: u32) -> Self {
        let fixed_observed = cohort as i64 - fixed_missing as i64;
        let var_offset = var_missing as i64 - cohort as i64;
        Self {
            xy: cohort as i64,
            x: -fixed_observed,
            y: var_offset,
            xx: -fixed_observed,
            yy: var_offset,
        }
    }

    /// Turns completed accumulators into covariance form. `joint_observed` is the
    /// number of samples observed on both markers.
    #[inline]
    pub fn derive(&self, joint_observed: u32) -> PairCorrelation {
        let n = joint_observed as f64;
        let (xy, x, y) = (self.xy as f64, self.x as f64, self.y as f64);
        let (xx, yy) = (self.xx as f64, self.yy as f64);
        PairCorrelation {
            cov: xy * n - x * y,
            var_product: (xx * n + x * x) * (yy * n + y * y),
        }
    }
}

#[inline(always)]
fn fold2<const LANES: usize>(v: Simd<u64, LANES>) -> Simd<u64, LANES> {
    let m2 = Simd::splat(M2);
    (v & m2) + ((v >> Simd::splat(2)) & m2)
}

#[inline(always)]
fn fold4<const LANES: usize>(v: Simd<u64, LANES>) -> Simd<u64, LANES> {
    let m4 = Simd::splat(M4);
    (v & m4) + ((v >> Simd::splat(4)) & m4)
}

/// Sums every byte of every lane.
#[inline(always)]
fn horizontal_byte_sum<const LANES: usize>(v: Simd<u64, LANES>) -> i64 {
    let m8 = Simd::splat(M8);
    let halves = (v & m8) + ((v >> Simd::splat(8)) & m8);
    let lanes = (halves * Simd::splat(0x0001_0001_0001_0001)) >> Simd::splat(48);
    lanes.reduce_sum() as i64
}

/// Processes at most `WINDOWS_PER_BATCH` full windows of the four slices, leaving any
/// words that do not fill a window to the scalar path.
#[inline(always)]
fn accumulate_batch_impl<const LANES: usize>(
    var: &[u64],
    fixed: &[u64],
    var_mask: &[u64],
    fixed_mask: &[u64],
    sums: &mut KernelSums,
) {
    let window = WINDOW_VECTORS * LANES;
    let full_windows = var.len() / window;
    debug_assert!(full_windows <= WINDOWS_PER_BATCH);

    let five = Simd::<u64, LANES>::splat(FIVE_MASK);
    let aaaa = Simd::<u64, LANES>::splat(AAAA_MASK);
    let zero = Simd::<u64, LANES>::splat(0);
    let (mut acc_xy, mut acc_x, mut acc_y, mut acc_xx, mut acc_yy) = (zero, zero, zero, zero, zero);

    for w in 0..full_windows {
        let (mut s_xy, mut s_x, mut s_y, mut s_xx, mut s_yy) = (zero, zero, zero, zero, zero);
        for k in 0..WINDOW_VECTORS {
            let off = w * window + k * LANES;
            let a = Simd::<u64, LANES>::from_slice(&var[off..off + LANES]);
            let b = Simd::<u64, LANES>::from_slice(&fixed[off..off + LANES]);
            let ma = Simd::<u64, LANES>::from_slice(&var_mask[off..off + LANES]);
            let mb = Simd::<u64, LANES>::from_slice(&fixed_mask[off..off + LANES]);

            let either_het = (a | b) & five;
            let prod = ((a ^ b) & (aaaa - either_het)) | either_het;
            let sx = mb & a;
            let sy = ma & b;
            s_xx += sx & five;
            s_yy += sy & five;
            s_xy += fold2(prod);
            s_x += fold2(sx);
            s_y += fold2(sy);
        }
        acc_xy += fold4(s_xy);
        acc_x += fold4(s_x);
        acc_y += fold4(s_y);
        acc_xx += fold4(fold2(s_xx));
        acc_yy += fold4(fold2(s_yy));
    }

    sums.xy -= horizontal_byte_sum(acc_xy);
    sums.x += horizontal_byte_sum(acc_x);
    sums.y += horizontal_byte_sum(acc_y);
    sums.xx += horizontal_byte_sum(acc_xx);
    sums.yy += horizontal_byte_sum(acc_yy);

    let tail = full_windows * window;
    dot_product_scalar(
        &var[tail..],
        &fixed[tail..],
        &var_mask[tail..],
        &fixed_mask[tail..],
        sums,
    );
}

/// Adds the contribution of every word to `sums`, one word at a time.
pub fn dot_product_scalar(
    var: &[u64],
    fixed: &[u64],
    var_mask: &[u64],
    fixed_mask: &[u64],
    sums: &mut KernelSums,
) {
    for (((&a, &b), &ma), &mb) in var.iter().zip(fixed).zip(var_mask).zip(fixed_mask) {
        let either_het = (a | b) & FIVE_MASK;
        let prod = ((a ^ b) & (AAAA_MASK - either_het)) | either_het;
        let sx = mb & a;
        let sy = ma & b;
        sums.xy -= popcount2(prod) as i64;
        sums.x += popcount2(sx) as i64;
        sums.y += popcount2(sy) as i64;
        sums.xx += (sx & FIVE_MASK).count_ones() as i64;
        sums.yy += (sy & FIVE_MASK).count_ones() as i64;
    }
}

/// Adds the contribution of every word to `sums`, `batch_words` words at a time.
///
/// `batch_words` must not exceed `BATCH_WORDS`.
pub fn dot_product_batched(
    var: &[u64],
    fixed: &[u64],
    var_mask: &[u64],
    fixed_mask: &[u64],
    batch_words: usize,
    sums: &mut KernelSums,
) {
    debug_assert!(batch_words > 0 && batch_words <= BATCH_WORDS);
    let words = var.len();
    let mut start = 0;
    while start < words {
        let end = (start + batch_words).min(words);
        accumulate_batch_impl::<KERNEL_SIMD_LANES>(
            &var[start..end],
            &fixed[start..end],
            &var_mask[start..end],
            &fixed_mask[start..end],
            sums,
        );
        start = end;
    }
}

/// Adds the contribution of every word to `sums` using full multiplex batches.
#[inline]
pub fn dot_product(
    var: &[u64],
    fixed: &[u64],
    var_mask: &[u64],
    fixed_mask: &[u64],
    sums: &mut KernelSums,
) {
    dot_product_batched(var, fixed, var_mask, fixed_mask, BATCH_WORDS, sums);
}

/// Number of samples observed on both markers.
pub fn joint_observed(fixed: &EncodedView<'_>, var: &EncodedView<'_>, cohort: u32) -> u32 {
    if let (Some((_, fixed_aux_mask)), Some((_, var_aux_mask))) = (fixed.aux, var.aux) {
        let shared = |a: &[u64], b: &[u64]| -> u32 {
            a.iter().zip(b).map(|(x, y)| (x & y).count_ones()).sum()
        };
        return (shared(fixed_aux_mask, var_aux_mask) + shared(fixed.mask, var.mask)) / 2;
    }
    let shared_missing = if fixed.missing_count > 0 && var.missing_count > 0 {
        fixed
            .missing
            .iter()
            .zip(var.missing)
            .map(|(a, b)| (a & b).count_ones())
            .sum::<u32>()
    } else {
        0
    };
    // Adding the overlap first keeps the count non-negative under heavy missingness.
    cohort + shared_missing - fixed.missing_count - var.missing_count
}

/// Runs the kernel over a full pair, auxiliary rows included, and derives the result.
///
/// `cohort` is the weighted sample count of the pair's chromosome.
pub fn pair_correlation(
    fixed: &EncodedView<'_>,
    var: &EncodedView<'_>,
    cohort: u32,
) -> PairCorrelation {
    let mut sums = KernelSums::seeded(cohort, fixed.missing_count, var.missing_count);
    dot_product(var.geno, fixed.geno, var.mask, fixed.mask, &mut sums);
    if let (Some((fixed_aux, fixed_aux_mask)), Some((var_aux, var_aux_mask))) = (fixed.aux, var.aux)
    {
        dot_product(var_aux, fixed_aux, var_aux_mask, fixed_aux_mask, &mut sums);
    }
    sums.derive(joint_observed(fixed, var, cohort))
}
