// ========================================================================================
//
//              Two-locus contingency tables and the fast epistasis statistic
//
// ========================================================================================
//
// For the epistasis scan every marker is stored as three bit planes per phenotype
// stratum, one per genotype class (dosage 0, 1 and 2); missing calls belong to no plane.
// The 3×3 table of a marker pair is then nine popcounts over plane intersections.
//
// From each stratum's table we derive the allelic log odds ratio, spreading
// heterozygous cells evenly over the four allele combinations, and its variance. The
// case/control statistic is the squared difference of the two log odds ratios over the
// sum of their variances.

use crate::encode::{FIVE_MASK, SAMPLES_PER_WORD, pack_field_bits};
use crate::error::LdError;
use statrs::distribution::{ContinuousCDF, Normal};

const BITS_PER_WORD: usize = 64;

/// Layout of one split marker: three case planes followed by three control planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitGeometry {
    pub cases: usize,
    pub controls: usize,
    case_words: usize,
    control_words: usize,
}

impl SplitGeometry {
    pub fn new(cases: usize, controls: usize) -> Self {
        Self {
            cases,
            controls,
            case_words: cases.div_ceil(BITS_PER_WORD),
            control_words: controls.div_ceil(BITS_PER_WORD),
        }
    }

    #[inline]
    pub fn words_per_marker(&self) -> usize {
        3 * (self.case_words + self.control_words)
    }

    #[inline]
    pub fn bytes_per_marker(&self) -> usize {
        self.words_per_marker() * 8
    }

    /// Splits a marker buffer into its case and control halves.
    pub fn halves_mut<'a>(&self, marker: &'a mut [u64]) -> (&'a mut [u64], &'a mut [u64]) {
        marker.split_at_mut(3 * self.case_words)
    }

    pub fn view<'a>(&self, marker: &'a [u64]) -> SplitMarker<'a> {
        let (cases, controls) = marker.split_at(3 * self.case_words);
        SplitMarker {
            cases: StratumPlanes {
                words: self.case_words,
                planes: cases,
            },
            controls: StratumPlanes {
                words: self.control_words,
                planes: &controls[..3 * self.control_words],
            },
        }
    }
}

/// The genotype-class planes of one marker within one stratum.
#[derive(Clone, Copy)]
pub struct StratumPlanes<'a> {
    words: usize,
    planes: &'a [u64],
}

impl<'a> StratumPlanes<'a> {
    #[inline]
    pub fn plane(&self, class: usize) -> &'a [u64] {
        let planes: &'a [u64] = self.planes;
        &planes[class * self.words..(class + 1) * self.words]
    }

    /// True when at most one genotype class is observed.
    pub fn is_monomorphic(&self) -> bool {
        (0..3)
            .filter(|&class| self.plane(class).iter().any(|&w| w != 0))
            .count()
            <= 1
    }
}

pub struct SplitMarker<'a> {
    pub cases: StratumPlanes<'a>,
    pub controls: StratumPlanes<'a>,
}

/// Sorts the packed dosage codes of `n` samples into three class planes of
/// `n.div_ceil(64)` words each.
pub fn split_dosages(raw: &[u64], n: usize, out: &mut [u64]) {
    let words = n.div_ceil(BITS_PER_WORD);
    debug_assert!(out.len() >= 3 * words);
    out[..3 * words].fill(0);
    for (word_idx, &word) in raw.iter().take(n.div_ceil(SAMPLES_PER_WORD)).enumerate() {
        let fields = (n - word_idx * SAMPLES_PER_WORD).min(SAMPLES_PER_WORD);
        let valid = if fields == SAMPLES_PER_WORD {
            FIVE_MASK
        } else {
            FIVE_MASK & ((1u64 << (2 * fields)) - 1)
        };
        let lo = word & FIVE_MASK;
        let hi = (word >> 1) & FIVE_MASK;
        let classes = [!(lo | hi) & valid, lo & !hi, hi & !lo];
        let shift = 32 * (word_idx % 2);
        for (class, bits) in classes.into_iter().enumerate() {
            out[class * words + word_idx / 2] |= pack_field_bits(bits) << shift;
        }
    }
}

/// Joint genotype-class counts of two markers within one stratum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContingencyTable {
    /// `counts[3 * i + j]`: samples in class `i` at the first marker and `j` at the second.
    pub counts: [u32; 9],
}

/// A log odds ratio and its variance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogOdds {
    pub log_or: f64,
    pub variance: f64,
}

impl ContingencyTable {
    pub fn build(first: &StratumPlanes<'_>, second: &StratumPlanes<'_>) -> Self {
        let mut counts = [0u32; 9];
        for i in 0..3 {
            let a = first.plane(i);
            for j in 0..3 {
                let b = second.plane(j);
                counts[3 * i + j] = a
                    .iter()
                    .zip(b)
                    .map(|(x, y)| (x & y).count_ones())
                    .sum();
            }
        }
        Self { counts }
    }

    /// Samples called at both markers.
    pub fn total(&self) -> u32 {
        self.counts.iter().sum()
    }

    pub fn has_empty_cell(&self) -> bool {
        self.counts.contains(&0)
    }

    /// The allelic log odds ratio.
    ///
    /// By default the variance follows the delta method over all nine cells, and a
    /// table with an empty cell has 0.5 added to every cell first. With `no_ueki` the
    /// variance is the plain sum of reciprocal corner counts and nothing is adjusted.
    pub fn log_odds(&self, no_ueki: bool) -> LogOdds {
        let offset = if !no_ueki && self.has_empty_cell() {
            0.5
        } else {
            0.0
        };
        let n = self.counts.map(|c| c as f64 + offset);
        let c11 = 4.0 * n[0] + 2.0 * (n[1] + n[3]) + n[4];
        let c12 = 4.0 * n[2] + 2.0 * (n[1] + n[5]) + n[4];
        let c21 = 4.0 * n[6] + 2.0 * (n[3] + n[7]) + n[4];
        let c22 = 4.0 * n[8] + 2.0 * (n[5] + n[7]) + n[4];
        let (r11, r12, r21, r22) = (1.0 / c11, 1.0 / c12, 1.0 / c21, 1.0 / c22);
        let log_or = (c11 * c22 * r12 * r21).ln();

        if no_ueki {
            return LogOdds {
                log_or,
                variance: r11 + r12 + r21 + r22,
            };
        }

        // Partial derivatives of the log odds ratio with respect to each cell.
        let d01 = r11 - r12;
        let d10 = r11 - r21;
        let d11 = r11 - r12 - r21 + r22;
        let d12 = r22 - r12;
        let d21 = r22 - r21;
        let corners = r11 * r11 * n[0] + r12 * r12 * n[2] + r21 * r21 * n[6] + r22 * r22 * n[8];
        let edges = d01 * d01 * n[1] + d10 * d10 * n[3] + d12 * d12 * n[5] + d21 * d21 * n[7];
        LogOdds {
            log_or,
            variance: 4.0 * (4.0 * corners + edges) + d11 * d11 * n[4],
        }
    }
}

/// The case/control interaction statistic of one marker pair. Non-finite values mark a
/// failed test.
pub fn epistasis_statistic(
    cases: &ContingencyTable,
    controls: &ContingencyTable,
    no_ueki: bool,
) -> f64 {
    let case = cases.log_odds(no_ueki);
    let control = controls.log_odds(no_ueki);
    let diff = case.log_or - control.log_or;
    diff * diff / (case.variance + control.variance)
}

/// Squared z thresholds for the two significance levels, plus p-values.
#[derive(Debug, Clone)]
pub struct SignificanceThresholds {
    /// Pairs at or above this go to the pair report.
    pub report_zsq: f64,
    /// Pairs at or above this count toward a marker's significant-pair tally.
    pub count_zsq: f64,
    normal: Normal,
}

impl SignificanceThresholds {
    pub fn from_levels(epi1: f64, epi2: f64) -> Result<Self, LdError> {
        let normal = Normal::new(0.0, 1.0)
            .map_err(|e| LdError::InvalidConfiguration(format!("standard normal: {e}")))?;
        let zsq = |alpha: f64| {
            if alpha >= 1.0 {
                0.0
            } else {
                normal.inverse_cdf(alpha / 2.0).powi(2)
            }
        };
        Ok(Self {
            report_zsq: zsq(epi1),
            count_zsq: zsq(epi2),
            normal,
        })
    }

    /// Two-sided p-value of a squared z statistic.
    pub fn p_value(&self, zsq: f64) -> f64 {
        2.0 * self.normal.cdf(-zsq.sqrt())
    }
}
