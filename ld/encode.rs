// ========================================================================================
//
//                     The genotype encoder: raw calls to centred words
//
// ========================================================================================
//
// Loaders hand us one marker at a time as packed 2-bit dosage codes, 32 samples per
// little-endian `u64` word: 0 = reference homozygote, 1 = heterozygote, 2 = alternate
// homozygote, 3 = missing. The encoder rewrites that buffer, without branching on
// individual samples, into the three parallel sequences the kernels consume:
//
//   * geno:    00 = -1, 01 = 0 (heterozygote or missing), 10 = +1
//   * mask:    11 = observed, 00 = missing
//   * missing: one bit per sample, set when the call is missing
//
// Fields past the end of the cohort are zero in all three sequences so they never leak
// into a population count.

use crate::arena::Region;
use crate::error::LdError;
use crate::types::{ChromosomeKind, Sex};
use rayon::prelude::*;

pub const FIVE_MASK: u64 = 0x5555_5555_5555_5555;
pub const AAAA_MASK: u64 = 0xaaaa_aaaa_aaaa_aaaa;

/// Number of samples packed into one genotype word.
pub const SAMPLES_PER_WORD: usize = 32;
/// Number of samples tracked by one missingness word.
pub const SAMPLES_PER_BITMAP_WORD: usize = 64;

/// Word counts for one encoded marker over a fixed cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CohortGeometry {
    pub n_samples: usize,
    pub geno_words: usize,
    pub missing_words: usize,
}

impl CohortGeometry {
    pub fn new(n_samples: usize) -> Self {
        Self {
            n_samples,
            geno_words: n_samples.div_ceil(SAMPLES_PER_WORD),
            missing_words: n_samples.div_ceil(SAMPLES_PER_BITMAP_WORD),
        }
    }

    /// Mask selecting the low bit of every field that belongs to a real sample in the
    /// final genotype word.
    #[inline]
    fn last_word_fields(&self) -> u64 {
        match self.n_samples % SAMPLES_PER_WORD {
            0 => FIVE_MASK,
            rem => FIVE_MASK & ((1u64 << (2 * rem)) - 1),
        }
    }

    #[inline]
    fn valid_fields(&self, word: usize) -> u64 {
        if word + 1 == self.geno_words {
            self.last_word_fields()
        } else {
            FIVE_MASK
        }
    }
}

/// Dosage adjustment applied to X-chromosome markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XDosagePolicy {
    /// X is encoded exactly like an autosome.
    AsAutosome,
    /// Male reference homozygotes are recoded to the heterozygote-equivalent code.
    MaleHetEquivalent,
    /// Non-male rows are duplicated into an auxiliary buffer so they count twice.
    DoubleNonMale,
}

/// Result of encoding one marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeOutcome {
    pub missing_count: u32,
    /// False for monomorphic (zero-variance) markers.
    pub has_variance: bool,
}

/// Swaps the roles of the two alleles in a buffer of dosage codes for `n_samples`
/// samples: 0 and 2 trade places, heterozygous and missing calls stay put. Padding
/// fields past the cohort stay zero.
#[inline]
pub fn swap_alleles(words: &mut [u64], n_samples: usize) {
    let geometry = CohortGeometry::new(n_samples);
    for (word_idx, word) in words.iter_mut().take(geometry.geno_words).enumerate() {
        *word ^= (!*word & geometry.valid_fields(word_idx)) << 1;
    }
}

/// Sum of the 2-bit fields of `word`.
#[inline(always)]
pub fn popcount2(word: u64) -> u32 {
    (word & FIVE_MASK).count_ones() + 2 * (word & AAAA_MASK).count_ones()
}

/// Gathers the low bit of every 2-bit field into the low 32 bits of the result.
#[inline]
pub(crate) fn pack_field_bits(word: u64) -> u64 {
    let mut x = word & FIVE_MASK;
    x = (x | (x >> 1)) & 0x3333_3333_3333_3333;
    x = (x | (x >> 2)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x >> 4)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x >> 8)) & 0x0000_ffff_0000_ffff;
    (x | (x >> 16)) & 0x0000_0000_ffff_ffff
}

/// Mutable destination for one encoded marker.
pub struct EncodedSlotMut<'s> {
    pub geno: &'s mut [u64],
    pub mask: &'s mut [u64],
    pub missing: &'s mut [u64],
    pub missing_count: &'s mut u32,
    /// Non-male duplicate rows, present only under `XDosagePolicy::DoubleNonMale`.
    pub aux: Option<(&'s mut [u64], &'s mut [u64])>,
}

/// Read-only view of one encoded marker.
#[derive(Clone, Copy)]
pub struct EncodedView<'a> {
    pub geno: &'a [u64],
    pub mask: &'a [u64],
    pub missing: &'a [u64],
    pub missing_count: u32,
    pub aux: Option<(&'a [u64], &'a [u64])>,
}

pub struct GenotypeEncoder {
    geometry: CohortGeometry,
    /// Low field bit set for every male sample.
    male_fields: Vec<u64>,
    /// Low field bit set for every sample that is not known to be male.
    nonmale_fields: Vec<u64>,
    x_policy: XDosagePolicy,
    nonmale_count: usize,
}

impl GenotypeEncoder {
    /// `sexes` lists the sex of every sample of the cohort in subset order.
    pub fn new(sexes: &[Sex], x_policy: XDosagePolicy) -> Self {
        let geometry = CohortGeometry::new(sexes.len());
        let mut male_fields = vec![0u64; geometry.geno_words];
        let mut nonmale_fields = vec![0u64; geometry.geno_words];
        for (idx, sex) in sexes.iter().enumerate() {
            let bit = 1u64 << (2 * (idx % SAMPLES_PER_WORD));
            let word = idx / SAMPLES_PER_WORD;
            if *sex == Sex::Male {
                male_fields[word] |= bit;
            } else {
                nonmale_fields[word] |= bit;
            }
        }
        let nonmale_count = sexes.iter().filter(|s| **s != Sex::Male).count();
        Self {
            geometry,
            male_fields,
            nonmale_fields,
            x_policy,
            nonmale_count,
        }
    }

    #[inline]
    pub fn geometry(&self) -> CohortGeometry {
        self.geometry
    }

    #[inline]
    pub fn nonmale_count(&self) -> usize {
        self.nonmale_count
    }

    /// True when markers of `kind` carry the auxiliary non-male rows.
    #[inline]
    pub fn uses_aux(&self, kind: ChromosomeKind) -> bool {
        kind == ChromosomeKind::X && self.x_policy == XDosagePolicy::DoubleNonMale
    }

    /// Effective number of observations per marker of `kind`, counting duplicated rows.
    #[inline]
    pub fn weighted_cohort(&self, kind: ChromosomeKind) -> u32 {
        if self.uses_aux(kind) {
            2 * self.geometry.n_samples as u32
        } else {
            self.geometry.n_samples as u32
        }
    }

    /// Sets heterozygous calls to missing wherever the carrier is haploid for `kind`.
    /// On Y, calls from non-male samples are discarded altogether.
    fn fix_haploid_calls(&self, raw: &mut [u64], kind: ChromosomeKind) {
        for (word_idx, word) in raw.iter_mut().enumerate() {
            let het = *word & !(*word >> 1) & FIVE_MASK;
            let haploid_fields = match kind {
                ChromosomeKind::X => self.male_fields[word_idx],
                ChromosomeKind::Y => {
                    *word |= self.nonmale_fields[word_idx] * 3;
                    self.male_fields[word_idx]
                }
                _ => self.geometry.valid_fields(word_idx),
            };
            *word |= (het & haploid_fields) * 3;
        }
    }

    /// Encodes one marker.
    ///
    /// `raw` holds the oriented dosage codes and is used as scratch space.
    pub fn encode(
        &self,
        raw: &mut [u64],
        kind: ChromosomeKind,
        slot: EncodedSlotMut<'_>,
    ) -> EncodeOutcome {
        let words = self.geometry.geno_words;
        debug_assert!(raw.len() >= words);
        let raw = &mut raw[..words];
        if kind.is_haploid() && !(kind == ChromosomeKind::X && self.x_policy == XDosagePolicy::AsAutosome) {
            self.fix_haploid_calls(raw, kind);
        }

        let n = self.geometry.n_samples as i64;
        let mut missing_count = 0u32;
        let mut sum = -n;
        let mut ssq = 0i64;
        slot.missing.fill(0);

        for word_idx in 0..words {
            let valid = self.geometry.valid_fields(word_idx);
            let dosage = raw[word_idx];
            let miss = dosage & (dosage >> 1) & valid;
            let mut geno = (dosage ^ (miss << 1)) & (valid * 3);
            if kind == ChromosomeKind::X && self.x_policy == XDosagePolicy::MaleHetEquivalent {
                geno += !(geno | (geno >> 1)) & self.male_fields[word_idx];
            }
            slot.geno[word_idx] = geno;
            slot.mask[word_idx] = (!miss & valid) * 3;
            slot.missing[word_idx / 2] |= pack_field_bits(miss) << (32 * (word_idx % 2));
            missing_count += miss.count_ones();
            sum += popcount2(geno) as i64;
            ssq += ((geno ^ FIVE_MASK) & valid).count_ones() as i64;
        }

        let mut observations = n;
        if let Some((aux_geno, aux_mask)) = slot.aux {
            if self.uses_aux(kind) {
                sum -= n;
                let mut aux_observed = 0u32;
                for word_idx in 0..words {
                    let valid = self.geometry.valid_fields(word_idx);
                    let male = self.male_fields[word_idx];
                    let keep = !(male * 3);
                    let geno = (slot.geno[word_idx] & keep) | male;
                    aux_geno[word_idx] = geno;
                    aux_mask[word_idx] = keep & slot.mask[word_idx];
                    aux_observed += aux_mask[word_idx].count_ones() / 2;
                    sum += popcount2(geno) as i64;
                    ssq += ((geno ^ FIVE_MASK) & valid).count_ones() as i64;
                }
                missing_count += self.geometry.n_samples as u32 - aux_observed;
                observations = 2 * n;
            } else {
                aux_geno.fill(0);
                aux_mask.fill(0);
            }
        }

        *slot.missing_count = missing_count;
        EncodeOutcome {
            missing_count,
            has_variance: ssq * (observations - missing_count as i64) - sum * sum != 0,
        }
    }
}

// ========================================================================================
//                          Contiguous storage for many markers
// ========================================================================================

/// Fixed-capacity, slot-addressed storage for encoded markers, carved out of a `Region`.
pub struct EncodedBlock<'r> {
    geometry: CohortGeometry,
    geno: &'r mut [u64],
    mask: &'r mut [u64],
    missing: &'r mut [u64],
    missing_counts: &'r mut [u32],
    aux: Option<(&'r mut [u64], &'r mut [u64])>,
}

impl<'r> EncodedBlock<'r> {
    /// Bytes consumed by one slot, used when sizing blocks against a memory budget.
    pub fn bytes_per_slot(geometry: CohortGeometry, with_aux: bool) -> usize {
        let planes = if with_aux { 4 } else { 2 };
        (planes * geometry.geno_words + geometry.missing_words) * 8 + 4
    }

    pub fn allocate(
        region: &'r Region,
        geometry: CohortGeometry,
        capacity: usize,
        with_aux: bool,
    ) -> Result<Self, LdError> {
        let words = geometry.geno_words * capacity;
        let geno = region.alloc_zeroed::<u64>("encoded genotypes", words)?;
        let mask = region.alloc_zeroed::<u64>("genotype masks", words)?;
        let missing = region.alloc_zeroed::<u64>(
            "missingness bitmaps",
            geometry.missing_words * capacity,
        )?;
        let missing_counts = region.alloc_zeroed::<u32>("missing counts", capacity)?;
        let aux = if with_aux {
            Some((
                region.alloc_zeroed::<u64>("non-male genotypes", words)?,
                region.alloc_zeroed::<u64>("non-male masks", words)?,
            ))
        } else {
            None
        };
        Ok(Self {
            geometry,
            geno,
            mask,
            missing,
            missing_counts,
            aux,
        })
    }

    #[inline]
    pub fn geometry(&self) -> CohortGeometry {
        self.geometry
    }

    pub fn view(&self, slot: usize) -> EncodedView<'_> {
        let w = self.geometry.geno_words;
        let m = self.geometry.missing_words;
        EncodedView {
            geno: &self.geno[slot * w..(slot + 1) * w],
            mask: &self.mask[slot * w..(slot + 1) * w],
            missing: &self.missing[slot * m..(slot + 1) * m],
            missing_count: self.missing_counts[slot],
            aux: self
                .aux
                .as_ref()
                .map(|(g, k)| (&g[slot * w..(slot + 1) * w], &k[slot * w..(slot + 1) * w])),
        }
    }

    pub fn slot_mut(&mut self, slot: usize) -> EncodedSlotMut<'_> {
        let w = self.geometry.geno_words;
        let m = self.geometry.missing_words;
        EncodedSlotMut {
            geno: &mut self.geno[slot * w..(slot + 1) * w],
            mask: &mut self.mask[slot * w..(slot + 1) * w],
            missing: &mut self.missing[slot * m..(slot + 1) * m],
            missing_count: &mut self.missing_counts[slot],
            aux: self.aux.as_mut().map(|(g, k)| {
                (
                    &mut g[slot * w..(slot + 1) * w],
                    &mut k[slot * w..(slot + 1) * w],
                )
            }),
        }
    }

    /// Copies slot `from` over slot `to`.
    pub fn move_slot(&mut self, from: usize, to: usize) {
        if from == to {
            return;
        }
        let w = self.geometry.geno_words;
        let m = self.geometry.missing_words;
        self.geno.copy_within(from * w..(from + 1) * w, to * w);
        self.mask.copy_within(from * w..(from + 1) * w, to * w);
        self.missing.copy_within(from * m..(from + 1) * m, to * m);
        self.missing_counts[to] = self.missing_counts[from];
        if let Some((g, k)) = self.aux.as_mut() {
            g.copy_within(from * w..(from + 1) * w, to * w);
            k.copy_within(from * w..(from + 1) * w, to * w);
        }
    }

    /// Fills the first `count` slots in parallel. `fill` receives the slot index and
    /// its destination; the auxiliary planes are never handed out here.
    pub fn par_fill<F>(&mut self, count: usize, fill: F) -> Result<(), LdError>
    where
        F: Fn(usize, EncodedSlotMut<'_>) -> Result<(), LdError> + Sync,
    {
        let w = self.geometry.geno_words;
        let m = self.geometry.missing_words;
        self.geno[..count * w]
            .par_chunks_mut(w)
            .zip(self.mask[..count * w].par_chunks_mut(w))
            .zip(self.missing[..count * m].par_chunks_mut(m))
            .zip(self.missing_counts[..count].par_iter_mut())
            .enumerate()
            .try_for_each(|(slot, (((geno, mask), missing), missing_count))| {
                fill(
                    slot,
                    EncodedSlotMut {
                        geno,
                        mask,
                        missing,
                        missing_count,
                        aux: None,
                    },
                )
            })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Packs dosage codes (3 = missing) into words the way a loader would.
    pub(crate) fn pack_dosages(dosages: &[u8]) -> Vec<u64> {
        let mut words = vec![0u64; dosages.len().div_ceil(SAMPLES_PER_WORD)];
        for (idx, &d) in dosages.iter().enumerate() {
            words[idx / SAMPLES_PER_WORD] |= (d as u64 & 3) << (2 * (idx % SAMPLES_PER_WORD));
        }
        words
    }

    pub(crate) fn encode_into(
        encoder: &GenotypeEncoder,
        block: &mut EncodedBlock<'_>,
        slot: usize,
        dosages: &[u8],
        kind: ChromosomeKind,
    ) -> EncodeOutcome {
        let mut raw = pack_dosages(dosages);
        encoder.encode(&mut raw, kind, block.slot_mut(slot))
    }

    fn field(words: &[u64], idx: usize) -> u64 {
        (words[idx / SAMPLES_PER_WORD] >> (2 * (idx % SAMPLES_PER_WORD))) & 3
    }

    #[test]
    fn recode_produces_centred_fields_and_masks() {
        let sexes = vec![Sex::Female; 5];
        let encoder = GenotypeEncoder::new(&sexes, XDosagePolicy::AsAutosome);
        let region = Region::with_budget(1 << 16);
        let mut block = EncodedBlock::allocate(&region, encoder.geometry(), 1, false).unwrap();
        let outcome = encode_into(&encoder, &mut block, 0, &[0, 1, 2, 3, 2], ChromosomeKind::Autosome);

        assert_eq!(outcome.missing_count, 1);
        assert!(outcome.has_variance);
        let view = block.view(0);
        let fields: Vec<u64> = (0..5).map(|i| field(view.geno, i)).collect();
        assert_eq!(fields, vec![0b00, 0b01, 0b10, 0b01, 0b10]);
        let masks: Vec<u64> = (0..5).map(|i| field(view.mask, i)).collect();
        assert_eq!(masks, vec![3, 3, 3, 0, 3]);
        assert_eq!(view.missing[0], 0b1000);
        // Padding past the cohort stays clear.
        assert_eq!(view.mask[0] >> 10, 0);
        assert_eq!(view.geno[0] >> 10, 0);
    }

    #[test]
    fn monomorphic_markers_are_flagged() {
        let sexes = vec![Sex::Unknown; 40];
        let encoder = GenotypeEncoder::new(&sexes, XDosagePolicy::AsAutosome);
        let region = Region::with_budget(1 << 16);
        let mut block = EncodedBlock::allocate(&region, encoder.geometry(), 2, false).unwrap();

        let mut dosages = vec![1u8; 40];
        dosages[7] = 3;
        let flat = encode_into(&encoder, &mut block, 0, &dosages, ChromosomeKind::Autosome);
        assert!(!flat.has_variance);
        assert_eq!(flat.missing_count, 1);

        dosages[39] = 2;
        let varied = encode_into(&encoder, &mut block, 1, &dosages, ChromosomeKind::Autosome);
        assert!(varied.has_variance);
    }

    #[test]
    fn swap_alleles_exchanges_homozygotes_only() {
        let mut words = pack_dosages(&[0, 1, 2, 3]);
        swap_alleles(&mut words, 4);
        assert_eq!(words, pack_dosages(&[2, 1, 0, 3]));
    }

    #[test]
    fn swap_alleles_leaves_padding_clear_across_words() {
        let dosages: Vec<u8> = (0..37).map(|i| (i % 4) as u8).collect();
        let mut words = pack_dosages(&dosages);
        swap_alleles(&mut words, dosages.len());
        let swapped: Vec<u8> = dosages
            .iter()
            .map(|&d| if d == 1 || d == 3 { d } else { 2 - d })
            .collect();
        assert_eq!(words, pack_dosages(&swapped));
        assert_eq!(words[1] >> (2 * 5), 0);
    }

    #[test]
    fn male_reference_homozygotes_become_het_equivalent_on_x() {
        let sexes = vec![Sex::Male, Sex::Female, Sex::Male, Sex::Female];
        let encoder = GenotypeEncoder::new(&sexes, XDosagePolicy::MaleHetEquivalent);
        let region = Region::with_budget(1 << 16);
        let mut block = EncodedBlock::allocate(&region, encoder.geometry(), 1, false).unwrap();
        encode_into(&encoder, &mut block, 0, &[0, 0, 2, 2], ChromosomeKind::X);
        let view = block.view(0);
        let fields: Vec<u64> = (0..4).map(|i| field(view.geno, i)).collect();
        assert_eq!(fields, vec![0b01, 0b00, 0b10, 0b10]);
    }

    #[test]
    fn male_heterozygotes_on_x_are_treated_as_missing() {
        let sexes = vec![Sex::Male, Sex::Female];
        let encoder = GenotypeEncoder::new(&sexes, XDosagePolicy::MaleHetEquivalent);
        let region = Region::with_budget(1 << 16);
        let mut block = EncodedBlock::allocate(&region, encoder.geometry(), 1, false).unwrap();
        let outcome = encode_into(&encoder, &mut block, 0, &[1, 1], ChromosomeKind::X);
        assert_eq!(outcome.missing_count, 1);
        assert_eq!(block.view(0).missing[0], 0b01);
    }

    #[test]
    fn non_male_calls_on_y_are_discarded() {
        let sexes = vec![Sex::Male, Sex::Female, Sex::Male];
        let encoder = GenotypeEncoder::new(&sexes, XDosagePolicy::AsAutosome);
        let region = Region::with_budget(1 << 16);
        let mut block = EncodedBlock::allocate(&region, encoder.geometry(), 1, false).unwrap();
        let outcome = encode_into(&encoder, &mut block, 0, &[0, 2, 2], ChromosomeKind::Y);
        assert_eq!(outcome.missing_count, 1);
        assert_eq!(block.view(0).missing[0], 0b010);
    }

    #[test]
    fn double_non_male_duplicates_rows_and_adjusts_missingness() {
        let sexes = vec![Sex::Male, Sex::Female, Sex::Female, Sex::Male];
        let encoder = GenotypeEncoder::new(&sexes, XDosagePolicy::DoubleNonMale);
        assert!(encoder.uses_aux(ChromosomeKind::X));
        assert!(!encoder.uses_aux(ChromosomeKind::Autosome));
        assert_eq!(encoder.weighted_cohort(ChromosomeKind::X), 8);

        let region = Region::with_budget(1 << 16);
        let mut block = EncodedBlock::allocate(&region, encoder.geometry(), 1, true).unwrap();
        let outcome = encode_into(&encoder, &mut block, 0, &[2, 0, 3, 0], ChromosomeKind::X);
        // One missing female in the main rows; both males plus that female in the copy.
        assert_eq!(outcome.missing_count, 1 + 3);
        assert!(outcome.has_variance);

        let view = block.view(0);
        let (aux_geno, aux_mask) = view.aux.unwrap();
        let aux_fields: Vec<u64> = (0..4).map(|i| field(aux_geno, i)).collect();
        assert_eq!(aux_fields, vec![0b01, 0b00, 0b01, 0b01]);
        let aux_masks: Vec<u64> = (0..4).map(|i| field(aux_mask, i)).collect();
        assert_eq!(aux_masks, vec![0, 3, 0, 0]);
    }

    #[test]
    fn move_slot_copies_every_plane() {
        let sexes = vec![Sex::Female; 3];
        let encoder = GenotypeEncoder::new(&sexes, XDosagePolicy::AsAutosome);
        let region = Region::with_budget(1 << 16);
        let mut block = EncodedBlock::allocate(&region, encoder.geometry(), 3, false).unwrap();
        encode_into(&encoder, &mut block, 2, &[3, 1, 2], ChromosomeKind::Autosome);
        block.move_slot(2, 0);
        let moved = block.view(0);
        let source = block.view(2);
        assert_eq!(moved.geno, source.geno);
        assert_eq!(moved.mask, source.mask);
        assert_eq!(moved.missing, source.missing);
        assert_eq!(moved.missing_count, 1);
    }
}
