// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use std::fmt;

/// The index of a marker in the original, unfiltered `.bim` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MarkerIndex(pub u32);

impl MarkerIndex {
    #[inline]
    pub fn get(self) -> usize {
        self.0 as usize
    }
}

/// The index of a sample in the original `.fam` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SampleIndex(pub u32);

pub const CHROMOSOME_X: u8 = 23;
pub const CHROMOSOME_Y: u8 = 24;
/// Pseudo-autosomal region of X; diploid in every sample.
pub const CHROMOSOME_XY: u8 = 25;
pub const CHROMOSOME_MT: u8 = 26;
/// The largest code of a known chromosome. Markers above it are loaded but take no part
/// in pruning or epistasis.
pub const MAX_CHROMOSOME_CODE: u8 = CHROMOSOME_MT;

/// How a chromosome's dosages have to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChromosomeKind {
    /// Code 0 or a code beyond `MAX_CHROMOSOME_CODE`: never windowed or scanned for
    /// epistasis.
    Unplaced,
    Autosome,
    X,
    Y,
    Mitochondrial,
}

impl ChromosomeKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Unplaced,
            code if code > MAX_CHROMOSOME_CODE => Self::Unplaced,
            CHROMOSOME_X => Self::X,
            CHROMOSOME_Y => Self::Y,
            CHROMOSOME_MT => Self::Mitochondrial,
            _ => Self::Autosome,
        }
    }

    /// True when at least some samples carry a single copy of this chromosome.
    #[inline]
    pub fn is_haploid(self) -> bool {
        matches!(self, Self::X | Self::Y | Self::Mitochondrial)
    }
}

pub fn chromosome_label(code: u8) -> String {
    match code {
        CHROMOSOME_X => "X".to_string(),
        CHROMOSOME_Y => "Y".to_string(),
        CHROMOSOME_XY => "XY".to_string(),
        CHROMOSOME_MT => "MT".to_string(),
        n => format!("{n}"),
    }
}

pub fn parse_chromosome_label(chr_str: &str) -> Result<u8, String> {
    let mut trimmed = chr_str.trim();

    if trimmed.len() >= 3 && trimmed[..3].eq_ignore_ascii_case("chr") {
        trimmed = &trimmed[3..];
    }

    if trimmed.eq_ignore_ascii_case("X") {
        return Ok(CHROMOSOME_X);
    }
    if trimmed.eq_ignore_ascii_case("Y") {
        return Ok(CHROMOSOME_Y);
    }
    if trimmed.eq_ignore_ascii_case("XY") {
        return Ok(CHROMOSOME_XY);
    }
    if trimmed.eq_ignore_ascii_case("MT") || trimmed.eq_ignore_ascii_case("M") {
        return Ok(CHROMOSOME_MT);
    }

    trimmed.parse::<u8>().map_err(|_| {
        format!(
            "Invalid chromosome format '{}'. Expected a number up to 255, 'X', 'Y', 'XY', 'MT', or 'chr' prefix.",
            chr_str.trim()
        )
    })
}

/// A maximal run of consecutive markers sharing one chromosome code, expressed as a
/// half-open range of unfiltered marker indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChromosomeSpan {
    pub code: u8,
    pub start: usize,
    pub end: usize,
}

impl ChromosomeSpan {
    #[inline]
    pub fn kind(&self) -> ChromosomeKind {
        ChromosomeKind::from_code(self.code)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

impl fmt::Display for ChromosomeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "chr{} [{}..{})",
            chromosome_label(self.code),
            self.start,
            self.end
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sex {
    Male,
    Female,
    Unknown,
}

/// The case/control status parsed from the sixth `.fam` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseControl {
    Control,
    Case,
    Missing,
}

/// An ordered selection of samples. Genotype buffers produced for a subset hold
/// exactly `len()` packed entries, in subset order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleSubset {
    indices: Vec<SampleIndex>,
}

impl SampleSubset {
    pub fn new(indices: Vec<SampleIndex>) -> Self {
        Self { indices }
    }

    pub fn all(n_samples: usize) -> Self {
        Self {
            indices: (0..n_samples as u32).map(SampleIndex).collect(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    #[inline]
    pub fn indices(&self) -> &[SampleIndex] {
        &self.indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_chromosome_label_supports_common_variants() {
        assert_eq!(parse_chromosome_label("1").unwrap(), 1);
        assert_eq!(parse_chromosome_label("chr2").unwrap(), 2);
        assert_eq!(parse_chromosome_label("chrX").unwrap(), CHROMOSOME_X);
        assert_eq!(parse_chromosome_label("MT").unwrap(), CHROMOSOME_MT);
        assert_eq!(parse_chromosome_label("XY").unwrap(), CHROMOSOME_XY);
        assert_eq!(parse_chromosome_label("0").unwrap(), 0);
        assert_eq!(parse_chromosome_label("99").unwrap(), 99);
        assert!(parse_chromosome_label("300").is_err());
        assert!(parse_chromosome_label("scaffold_7").is_err());
    }

    #[test]
    fn chromosome_kinds_classify_haploid_codes() {
        assert_eq!(ChromosomeKind::from_code(0), ChromosomeKind::Unplaced);
        assert!(!ChromosomeKind::from_code(7).is_haploid());
        assert!(ChromosomeKind::from_code(CHROMOSOME_X).is_haploid());
        assert!(ChromosomeKind::from_code(CHROMOSOME_Y).is_haploid());
        assert_eq!(ChromosomeKind::from_code(CHROMOSOME_XY), ChromosomeKind::Autosome);
        assert_eq!(ChromosomeKind::from_code(30), ChromosomeKind::Unplaced);
        assert_eq!(chromosome_label(CHROMOSOME_XY), "XY");
        assert_eq!(chromosome_label(CHROMOSOME_Y), "Y");
        assert_eq!(chromosome_label(12), "12");
    }

    #[test]
    fn chromosome_span_reports_length() {
        let span = ChromosomeSpan {
            code: 3,
            start: 10,
            end: 25,
        };
        assert_eq!(span.len(), 15);
        assert!(!span.is_empty());
        assert_eq!(span.to_string(), "chr3 [10..25)");
    }
}
