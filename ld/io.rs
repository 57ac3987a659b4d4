// ========================================================================================
//
//                       PLINK filesets: genotypes and marker metadata
//
// ========================================================================================
//
// The analyses only ever talk to the two traits below. `PlinkDataset` is the concrete
// collaborator: it memory-maps a variant-major `.bed`, parses `.bim` and `.fam`, and
// computes founder allele frequencies once at open time.

use crate::encode::{CohortGeometry, FIVE_MASK, SAMPLES_PER_WORD, swap_alleles};
use crate::error::{LdError, PlinkFormatError};
use crate::types::{
    CaseControl, ChromosomeKind, ChromosomeSpan, MAX_CHROMOSOME_CODE, MarkerIndex, SampleIndex,
    SampleSubset, Sex, parse_chromosome_label,
};
use ahash::AHashSet;
use log::{debug, warn};
use memmap2::Mmap;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

const PLINK_HEADER_LEN: usize = 3;

/// Supplies packed dosage codes for one marker at a time.
pub trait GenotypeLoader: Sync {
    /// Fills `out` with 2-bit dosage codes (0, 1, 2, 3 = missing) for the samples of
    /// `subset`, in subset order, 32 per word. Fields past the subset are zero.
    fn load_marker(
        &self,
        marker: MarkerIndex,
        subset: &SampleSubset,
        reverse: bool,
        out: &mut [u64],
    ) -> Result<(), LdError>;
}

/// Per-marker annotations the analyses need.
pub trait MarkerMetadata: Sync {
    fn n_markers(&self) -> usize;
    fn marker_id(&self, marker: MarkerIndex) -> &str;
    fn chromosome(&self, marker: MarkerIndex) -> u8;
    fn position(&self, marker: MarkerIndex) -> u32;
    /// Contiguous marker ranges, one per chromosome, in file order.
    fn chromosome_spans(&self) -> &[ChromosomeSpan];
    fn minor_allele_frequency(&self, marker: MarkerIndex) -> f64;

    /// Whether allele roles must be swapped when loading `marker`.
    fn is_reversed(&self, _marker: MarkerIndex) -> bool {
        false
    }

    #[inline]
    fn chromosome_kind(&self, marker: MarkerIndex) -> ChromosomeKind {
        ChromosomeKind::from_code(self.chromosome(marker))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleRecord {
    pub family_id: String,
    pub individual_id: String,
    pub paternal_id: String,
    pub maternal_id: String,
    pub sex: Sex,
    pub phenotype: CaseControl,
}

impl SampleRecord {
    /// A founder has neither parent recorded in the pedigree.
    #[inline]
    pub fn is_founder(&self) -> bool {
        self.paternal_id == "0" && self.maternal_id == "0"
    }
}

/// The founder subset of `samples` together with each founder's sex.
pub fn founder_cohort(samples: &[SampleRecord]) -> (SampleSubset, Vec<Sex>) {
    let (indices, sexes): (Vec<SampleIndex>, Vec<Sex>) = samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_founder())
        .map(|(idx, s)| (SampleIndex(idx as u32), s.sex))
        .unzip();
    (SampleSubset::new(indices), sexes)
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarkerRecord {
    pub chromosome: u8,
    pub id: String,
    pub position: u32,
    pub allele1: String,
    pub allele2: String,
}

/// A memory-mapped, variant-major `.bed` file.
#[derive(Debug)]
pub struct PlinkBed {
    mmap: Mmap,
    n_samples: usize,
    bytes_per_variant: usize,
}

impl PlinkBed {
    pub fn open(path: &Path, n_samples: usize, n_variants: usize) -> Result<Self, LdError> {
        let file = File::open(path).map_err(|e| LdError::open(path, e))?;
        // SAFETY: the mapping is read-only and the file is not modified while we run.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| LdError::open(path, e))?;
        if mmap.len() < PLINK_HEADER_LEN {
            return Err(PlinkFormatError::InvalidHeader(format!(
                "{} is shorter than the 3-byte header",
                path.display()
            ))
            .into());
        }
        validate_bed_header(&mmap[..PLINK_HEADER_LEN])?;

        let bytes_per_variant = n_samples.div_ceil(4);
        let expected = (bytes_per_variant as u64)
            .checked_mul(n_variants as u64)
            .ok_or(PlinkFormatError::TruncatedBed {
                expected: u64::MAX,
                actual: mmap.len() as u64,
            })?;
        let actual = (mmap.len() - PLINK_HEADER_LEN) as u64;
        if actual != expected {
            return Err(PlinkFormatError::TruncatedBed { expected, actual }.into());
        }
        Ok(Self {
            mmap,
            n_samples,
            bytes_per_variant,
        })
    }

    #[inline]
    fn variant_bytes(&self, marker: MarkerIndex) -> &[u8] {
        let start = PLINK_HEADER_LEN + marker.get() * self.bytes_per_variant;
        &self.mmap[start..start + self.bytes_per_variant]
    }
}

/// PLINK codes 00/10/11/01 become dosages 0/1/2/3 in every field of `word`.
#[inline]
fn plink_to_dosage(word: u64) -> u64 {
    let missing = word & !(word >> 1) & FIVE_MASK;
    (word - ((word >> 1) & FIVE_MASK)) | (missing * 3)
}

impl GenotypeLoader for PlinkBed {
    fn load_marker(
        &self,
        marker: MarkerIndex,
        subset: &SampleSubset,
        reverse: bool,
        out: &mut [u64],
    ) -> Result<(), LdError> {
        let geometry = CohortGeometry::new(subset.len());
        if out.len() < geometry.geno_words {
            return Err(LdError::InvalidInput(format!(
                "genotype buffer holds {} words but {} samples need {}",
                out.len(),
                subset.len(),
                geometry.geno_words
            )));
        }
        let bytes = self.variant_bytes(marker);
        let out = &mut out[..geometry.geno_words];
        out.fill(0);

        let contiguous = subset.len() == self.n_samples
            && subset
                .indices()
                .iter()
                .enumerate()
                .all(|(i, s)| s.0 as usize == i);
        if contiguous {
            for (word, chunk) in out.iter_mut().zip(bytes.chunks(8)) {
                let mut buf = [0u8; 8];
                buf[..chunk.len()].copy_from_slice(chunk);
                *word = u64::from_le_bytes(buf);
            }
            // Padding bits in the last byte are not guaranteed to be zero on disk.
            let rem = subset.len() % SAMPLES_PER_WORD;
            if rem != 0 {
                if let Some(last) = out.last_mut() {
                    *last &= (1u64 << (2 * rem)) - 1;
                }
            }
        } else {
            for (pos, sample) in subset.indices().iter().enumerate() {
                let idx = sample.0 as usize;
                if idx >= self.n_samples {
                    return Err(LdError::InvalidInput(format!(
                        "sample index {idx} is out of range for {} samples",
                        self.n_samples
                    )));
                }
                let code = (bytes[idx / 4] >> (2 * (idx % 4))) & 3;
                out[pos / SAMPLES_PER_WORD] |= (code as u64) << (2 * (pos % SAMPLES_PER_WORD));
            }
        }

        for word in out.iter_mut() {
            *word = plink_to_dosage(*word);
        }
        if reverse {
            swap_alleles(out, subset.len());
        }
        Ok(())
    }
}

/// A `.bed`/`.bim`/`.fam` triple opened for analysis.
#[derive(Debug)]
pub struct PlinkDataset {
    bed: PlinkBed,
    bed_path: PathBuf,
    samples: Vec<SampleRecord>,
    markers: Vec<MarkerRecord>,
    spans: Vec<ChromosomeSpan>,
    maf: Vec<f64>,
    /// Set where the second `.bim` allele is the founders' major allele.
    reversed: Vec<bool>,
}

impl PlinkDataset {
    /// Opens `path`, which may name the `.bed` file or the bare fileset prefix.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LdError> {
        let bed_path = normalize_path(path.as_ref(), "bed");
        let bim_path = bed_path.with_extension("bim");
        let fam_path = bed_path.with_extension("fam");

        let samples = read_fam_records(&fam_path)?;
        if samples.is_empty() {
            return Err(PlinkFormatError::MalformedRecord {
                path: fam_path.display().to_string(),
                line: 0,
                message: "no samples found in .fam".to_string(),
            }
            .into());
        }
        let markers = read_bim_records(&bim_path)?;
        if markers.is_empty() {
            return Err(PlinkFormatError::MalformedRecord {
                path: bim_path.display().to_string(),
                line: 0,
                message: "no variants found in .bim".to_string(),
            }
            .into());
        }
        let spans = chromosome_spans(&markers)?;
        let bed = PlinkBed::open(&bed_path, samples.len(), markers.len())?;
        debug!(
            "opened {}: {} samples, {} variants, {} chromosomes",
            bed_path.display(),
            samples.len(),
            markers.len(),
            spans.len()
        );

        let (maf, reversed): (Vec<f64>, Vec<bool>) =
            founder_allele_frequencies(&bed, &samples, &markers)?
                .into_iter()
                .map(|freq| (freq.min(1.0 - freq), freq > 0.5))
                .unzip();
        Ok(Self {
            bed,
            bed_path,
            samples,
            markers,
            spans,
            maf,
            reversed,
        })
    }

    /// Counts the second `.bim` allele of every marker as loaded, instead of reorienting
    /// markers so that dosages count the minor allele.
    pub fn keep_allele_order(&mut self) {
        self.reversed.fill(false);
    }

    pub fn samples(&self) -> &[SampleRecord] {
        &self.samples
    }

    pub fn markers(&self) -> &[MarkerRecord] {
        &self.markers
    }

    pub fn bed_path(&self) -> &Path {
        &self.bed_path
    }

    pub fn genotypes(&self) -> &PlinkBed {
        &self.bed
    }
}

impl MarkerMetadata for PlinkDataset {
    fn n_markers(&self) -> usize {
        self.markers.len()
    }

    fn marker_id(&self, marker: MarkerIndex) -> &str {
        &self.markers[marker.get()].id
    }

    fn chromosome(&self, marker: MarkerIndex) -> u8 {
        self.markers[marker.get()].chromosome
    }

    fn position(&self, marker: MarkerIndex) -> u32 {
        self.markers[marker.get()].position
    }

    fn chromosome_spans(&self) -> &[ChromosomeSpan] {
        &self.spans
    }

    fn minor_allele_frequency(&self, marker: MarkerIndex) -> f64 {
        self.maf[marker.get()]
    }

    fn is_reversed(&self, marker: MarkerIndex) -> bool {
        self.reversed[marker.get()]
    }
}

/// Frequency of the second `.bim` allele of every marker over the founders. Males
/// contribute a single allele on X and Y, and their heterozygous calls there are ignored.
fn founder_allele_frequencies(
    bed: &PlinkBed,
    samples: &[SampleRecord],
    markers: &[MarkerRecord],
) -> Result<Vec<f64>, LdError> {
    let (founders, sexes) = founder_cohort(samples);
    let geometry = CohortGeometry::new(founders.len());
    (0..markers.len())
        .into_par_iter()
        .map_init(
            || vec![0u64; geometry.geno_words.max(1)],
            |buf, idx| {
                bed.load_marker(MarkerIndex(idx as u32), &founders, false, buf)?;
                let haploid_males = matches!(
                    ChromosomeKind::from_code(markers[idx].chromosome),
                    ChromosomeKind::X | ChromosomeKind::Y
                );
                let (mut alt, mut total) = (0u64, 0u64);
                for (pos, sex) in sexes.iter().enumerate() {
                    let dosage = (buf[pos / SAMPLES_PER_WORD] >> (2 * (pos % SAMPLES_PER_WORD))) & 3;
                    match (dosage, haploid_males && *sex == Sex::Male) {
                        (3, _) | (1, true) => {}
                        (d, true) => {
                            alt += d / 2;
                            total += 1;
                        }
                        (d, false) => {
                            alt += d;
                            total += 2;
                        }
                    }
                }
                Ok(if total == 0 {
                    0.0
                } else {
                    alt as f64 / total as f64
                })
            },
        )
        .collect()
}

fn normalize_path(path: &Path, extension: &str) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == extension) {
        path.to_owned()
    } else {
        let mut name = path.as_os_str().to_owned();
        name.push(".");
        name.push(extension);
        PathBuf::from(name)
    }
}

fn validate_bed_header(header: &[u8]) -> Result<(), PlinkFormatError> {
    match header {
        [0x6c, 0x1b, 0x01] => Ok(()),
        [0x6c, 0x1b, mode] => Err(PlinkFormatError::InvalidHeader(format!(
            "unsupported mode byte {mode:#04x} (only variant-major mode is supported)"
        ))),
        _ => Err(PlinkFormatError::InvalidHeader(
            "missing PLINK magic bytes 0x6c 0x1b".to_string(),
        )),
    }
}

fn open_lines(path: &Path) -> Result<std::io::Lines<BufReader<File>>, LdError> {
    let file = File::open(path).map_err(|e| LdError::open(path, e))?;
    Ok(BufReader::new(file).lines())
}

fn read_fam_records(path: &Path) -> Result<Vec<SampleRecord>, LdError> {
    let mut records = Vec::new();
    for (line_idx, line) in open_lines(path)?.enumerate() {
        let line = line.map_err(|e| LdError::read(path, e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(fid), Some(iid), Some(pid), Some(mid), Some(sex), Some(phenotype)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(PlinkFormatError::MalformedRecord {
                path: path.display().to_string(),
                line: line_idx + 1,
                message: "expected 6 whitespace-delimited fields".to_string(),
            }
            .into());
        };

        records.push(SampleRecord {
            family_id: fid.to_string(),
            individual_id: iid.to_string(),
            paternal_id: pid.to_string(),
            maternal_id: mid.to_string(),
            sex: match sex {
                "1" => Sex::Male,
                "2" => Sex::Female,
                _ => Sex::Unknown,
            },
            phenotype: match phenotype {
                "1" => CaseControl::Control,
                "2" => CaseControl::Case,
                _ => CaseControl::Missing,
            },
        });
    }
    Ok(records)
}

fn read_bim_records(path: &Path) -> Result<Vec<MarkerRecord>, LdError> {
    let mut records = Vec::new();
    let mut seen = AHashSet::new();
    let mut duplicates = 0usize;
    let mut beyond_known = 0usize;
    for (line_idx, line) in open_lines(path)?.enumerate() {
        let line = line.map_err(|e| LdError::read(path, e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let malformed = |message: String| PlinkFormatError::MalformedRecord {
            path: path.display().to_string(),
            line: line_idx + 1,
            message,
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        let &[chr, id, _cm, pos, a1, a2] = fields.as_slice() else {
            return Err(malformed("expected 6 whitespace-delimited fields".to_string()).into());
        };
        let chromosome = parse_chromosome_label(chr).map_err(malformed)?;
        let position = lexical_core::parse::<u32>(pos.as_bytes())
            .map_err(|e| malformed(format!("invalid position '{pos}': {e}")))?;
        if chromosome > MAX_CHROMOSOME_CODE {
            beyond_known += 1;
        }
        if !seen.insert(id.to_string()) {
            duplicates += 1;
        }
        records.push(MarkerRecord {
            chromosome,
            id: id.to_string(),
            position,
            allele1: a1.to_string(),
            allele2: a2.to_string(),
        });
    }
    if beyond_known > 0 {
        warn!(
            "{} places {beyond_known} variants on chromosome codes above {MAX_CHROMOSOME_CODE}; they are excluded from pruning and epistasis",
            path.display()
        );
    }
    if duplicates > 0 {
        warn!(
            "{} contains {duplicates} duplicate variant ids; reports will be ambiguous",
            path.display()
        );
    }
    Ok(records)
}

/// Splits markers into per-chromosome runs. Every chromosome must form one run.
fn chromosome_spans(markers: &[MarkerRecord]) -> Result<Vec<ChromosomeSpan>, LdError> {
    let mut spans: Vec<ChromosomeSpan> = Vec::new();
    for (idx, marker) in markers.iter().enumerate() {
        match spans.last_mut() {
            Some(span) if span.code == marker.chromosome => span.end = idx + 1,
            _ => {
                if spans.iter().any(|s| s.code == marker.chromosome) {
                    return Err(LdError::InvalidInput(format!(
                        "variants on chromosome code {} are not contiguous (first break at '{}')",
                        marker.chromosome, marker.id
                    )));
                }
                spans.push(ChromosomeSpan {
                    code: marker.chromosome,
                    start: idx,
                    end: idx + 1,
                });
            }
        }
    }
    Ok(spans)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    /// Writes a PLINK fileset. `genotypes[m][s]` is a dosage (0, 1, 2) or 3 for missing.
    pub(crate) fn write_fileset(
        prefix: &Path,
        fam: &[(&str, Sex, CaseControl)],
        bim: &[(u8, &str, u32)],
        genotypes: &[Vec<u8>],
    ) {
        let fam_text: String = fam
            .iter()
            .map(|(iid, sex, pheno)| {
                let sex = match sex {
                    Sex::Male => 1,
                    Sex::Female => 2,
                    Sex::Unknown => 0,
                };
                let pheno = match pheno {
                    CaseControl::Control => "1",
                    CaseControl::Case => "2",
                    CaseControl::Missing => "-9",
                };
                format!("F {iid} 0 0 {sex} {pheno}\n")
            })
            .collect();
        fs::write(prefix.with_extension("fam"), fam_text).unwrap();

        let bim_text: String = bim
            .iter()
            .map(|(chr, id, pos)| format!("{chr}\t{id}\t0\t{pos}\tA\tG\n"))
            .collect();
        fs::write(prefix.with_extension("bim"), bim_text).unwrap();

        let mut bed = vec![0x6c, 0x1b, 0x01];
        for row in genotypes {
            let mut bytes = vec![0u8; row.len().div_ceil(4)];
            for (s, &d) in row.iter().enumerate() {
                let code = match d {
                    0 => 0b00,
                    1 => 0b10,
                    2 => 0b11,
                    _ => 0b01,
                };
                bytes[s / 4] |= code << (2 * (s % 4));
            }
            bed.extend(bytes);
        }
        fs::write(prefix.with_extension("bed"), bed).unwrap();
    }

    /// An in-memory fileset for exercising the analyses without touching disk.
    pub(crate) struct MemoryDataset {
        pub(crate) dosages: Vec<Vec<u8>>,
        pub(crate) ids: Vec<String>,
        pub(crate) chromosomes: Vec<u8>,
        pub(crate) positions: Vec<u32>,
        pub(crate) spans: Vec<ChromosomeSpan>,
        pub(crate) maf: Vec<f64>,
    }

    impl MemoryDataset {
        /// `markers` lists (chromosome, position, dosages) in file order.
        pub(crate) fn new(markers: Vec<(u8, u32, Vec<u8>)>) -> Self {
            let records: Vec<MarkerRecord> = markers
                .iter()
                .enumerate()
                .map(|(idx, (chr, pos, _))| MarkerRecord {
                    chromosome: *chr,
                    id: format!("m{idx}"),
                    position: *pos,
                    allele1: "A".into(),
                    allele2: "G".into(),
                })
                .collect();
            let spans = chromosome_spans(&records).unwrap();
            let maf = markers
                .iter()
                .map(|(_, _, d)| {
                    let called: Vec<u8> = d.iter().copied().filter(|&x| x != 3).collect();
                    let freq = called.iter().map(|&x| x as f64).sum::<f64>()
                        / (2.0 * called.len().max(1) as f64);
                    freq.min(1.0 - freq)
                })
                .collect();
            Self {
                ids: records.iter().map(|r| r.id.clone()).collect(),
                chromosomes: records.iter().map(|r| r.chromosome).collect(),
                positions: records.iter().map(|r| r.position).collect(),
                dosages: markers.into_iter().map(|(_, _, d)| d).collect(),
                spans,
                maf,
            }
        }
    }

    impl GenotypeLoader for MemoryDataset {
        fn load_marker(
            &self,
            marker: MarkerIndex,
            subset: &SampleSubset,
            reverse: bool,
            out: &mut [u64],
        ) -> Result<(), LdError> {
            let row = &self.dosages[marker.get()];
            out.fill(0);
            for (pos, sample) in subset.indices().iter().enumerate() {
                let mut d = row[sample.0 as usize] as u64;
                if reverse && d != 1 && d != 3 {
                    d = 2 - d;
                }
                out[pos / SAMPLES_PER_WORD] |= d << (2 * (pos % SAMPLES_PER_WORD));
            }
            Ok(())
        }
    }

    impl MarkerMetadata for MemoryDataset {
        fn n_markers(&self) -> usize {
            self.dosages.len()
        }
        fn marker_id(&self, marker: MarkerIndex) -> &str {
            &self.ids[marker.get()]
        }
        fn chromosome(&self, marker: MarkerIndex) -> u8 {
            self.chromosomes[marker.get()]
        }
        fn position(&self, marker: MarkerIndex) -> u32 {
            self.positions[marker.get()]
        }
        fn chromosome_spans(&self) -> &[ChromosomeSpan] {
            &self.spans
        }
        fn minor_allele_frequency(&self, marker: MarkerIndex) -> f64 {
            self.maf[marker.get()]
        }
    }

    /// `n` unrelated founders with alternating sexes and the given phenotypes.
    pub(crate) fn founders(n: usize, phenotype: impl Fn(usize) -> CaseControl) -> Vec<SampleRecord> {
        (0..n)
            .map(|i| SampleRecord {
                family_id: format!("f{i}"),
                individual_id: format!("i{i}"),
                paternal_id: "0".into(),
                maternal_id: "0".into(),
                sex: if i % 2 == 0 { Sex::Male } else { Sex::Female },
                phenotype: phenotype(i),
            })
            .collect()
    }

    #[test]
    fn memory_dataset_matches_bed_loading() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("mirror");
        let fam: Vec<(&str, Sex, CaseControl)> = ["a", "b", "c", "d", "e", "f"]
            .iter()
            .map(|id| (*id, Sex::Female, CaseControl::Missing))
            .collect();
        let rows = vec![vec![0, 1, 2, 3, 1, 0], vec![2, 2, 1, 0, 3, 3]];
        write_fileset(&prefix, &fam, &[(3, "m0", 10), (3, "m1", 20)], &rows);
        let dataset = PlinkDataset::open(&prefix).unwrap();
        let memory = MemoryDataset::new(vec![(3, 10, rows[0].clone()), (3, 20, rows[1].clone())]);

        let subset = SampleSubset::new(vec![SampleIndex(5), SampleIndex(0), SampleIndex(3)]);
        for marker in [MarkerIndex(0), MarkerIndex(1)] {
            for reverse in [false, true] {
                let mut from_bed = vec![0u64; 1];
                let mut from_memory = vec![0u64; 1];
                dataset
                    .genotypes()
                    .load_marker(marker, &subset, reverse, &mut from_bed)
                    .unwrap();
                memory
                    .load_marker(marker, &subset, reverse, &mut from_memory)
                    .unwrap();
                assert_eq!(from_bed, from_memory);
            }
            assert!(
                (dataset.minor_allele_frequency(marker) - memory.minor_allele_frequency(marker))
                    .abs()
                    < 1e-12
            );
        }
        assert_eq!(memory.chromosome_spans(), dataset.chromosome_spans());
    }

    #[test]
    fn loads_dosages_for_full_and_partial_subsets() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("toy");
        let fam = [
            ("a", Sex::Male, CaseControl::Case),
            ("b", Sex::Female, CaseControl::Control),
            ("c", Sex::Unknown, CaseControl::Missing),
            ("d", Sex::Female, CaseControl::Case),
            ("e", Sex::Male, CaseControl::Control),
        ];
        let bim = [(1, "rs1", 100), (1, "rs2", 200)];
        let genotypes = vec![vec![0, 1, 2, 3, 2], vec![2, 2, 0, 1, 3]];
        write_fileset(&prefix, &fam, &bim, &genotypes);

        let dataset = PlinkDataset::open(&prefix).unwrap();
        assert_eq!(dataset.n_markers(), 2);
        assert_eq!(dataset.samples()[0].sex, Sex::Male);
        assert_eq!(dataset.samples()[3].phenotype, CaseControl::Case);

        let mut buf = vec![0u64; 1];
        let all = SampleSubset::all(5);
        dataset
            .genotypes()
            .load_marker(MarkerIndex(0), &all, false, &mut buf)
            .unwrap();
        assert_eq!(buf[0], 0b10_11_10_01_00);

        let subset = SampleSubset::new(vec![SampleIndex(4), SampleIndex(1)]);
        dataset
            .genotypes()
            .load_marker(MarkerIndex(1), &subset, true, &mut buf)
            .unwrap();
        // Sample 4 is missing, sample 1 flips from 2 to 0.
        assert_eq!(buf[0], 0b00_11);
    }

    #[test]
    fn founder_minor_allele_frequencies() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("freq");
        let fam = [
            ("a", Sex::Female, CaseControl::Missing),
            ("b", Sex::Female, CaseControl::Missing),
            ("c", Sex::Male, CaseControl::Missing),
        ];
        let bim = [(1, "auto", 1), (23, "xlinked", 1)];
        let genotypes = vec![vec![2, 2, 2], vec![0, 1, 2]];
        write_fileset(&prefix, &fam, &bim, &genotypes);

        let dataset = PlinkDataset::open(&prefix).unwrap();
        assert!((dataset.minor_allele_frequency(MarkerIndex(0)) - 0.0).abs() < 1e-12);
        // Females carry 1 of 4 alleles, the male 1 of 1.
        assert!((dataset.minor_allele_frequency(MarkerIndex(1)) - 0.4).abs() < 1e-12);
        assert_eq!(dataset.chromosome_kind(MarkerIndex(1)), ChromosomeKind::X);
        // Every founder carries two copies of the second allele, so it is the major one.
        assert!(dataset.is_reversed(MarkerIndex(0)));
        assert!(!dataset.is_reversed(MarkerIndex(1)));
    }

    #[test]
    fn major_second_alleles_are_reoriented_unless_order_is_kept() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("orient");
        let fam: Vec<(&str, Sex, CaseControl)> = ["a", "b", "c", "d"]
            .iter()
            .map(|id| (*id, Sex::Female, CaseControl::Missing))
            .collect();
        write_fileset(&prefix, &fam, &[(2, "rs1", 5)], &[vec![2, 2, 1, 3]]);
        let mut dataset = PlinkDataset::open(&prefix).unwrap();
        let all = SampleSubset::all(4);
        let mut buf = vec![0u64; 1];

        let marker = MarkerIndex(0);
        dataset
            .genotypes()
            .load_marker(marker, &all, dataset.is_reversed(marker), &mut buf)
            .unwrap();
        assert_eq!(buf[0], 0b11_01_00_00);

        dataset.keep_allele_order();
        dataset
            .genotypes()
            .load_marker(marker, &all, dataset.is_reversed(marker), &mut buf)
            .unwrap();
        assert_eq!(buf[0], 0b11_01_10_10);
    }

    #[test]
    fn pseudo_autosomal_and_unknown_codes_load_without_failing() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("codes");
        let fam: Vec<(&str, Sex, CaseControl)> = ["a", "b", "c"]
            .iter()
            .map(|id| (*id, Sex::Male, CaseControl::Missing))
            .collect();
        write_fileset(
            &prefix,
            &fam,
            &[(1, "rs1", 1), (25, "rs2", 1), (30, "rs3", 1)],
            &[vec![0, 1, 2], vec![1, 1, 0], vec![2, 0, 0]],
        );
        fs::write(
            prefix.with_extension("bim"),
            "1\trs1\t0\t1\tA\tG\nXY\trs2\t0\t1\tA\tG\n30\trs3\t0\t1\tA\tG\n",
        )
        .unwrap();

        let dataset = PlinkDataset::open(&prefix).unwrap();
        assert_eq!(dataset.n_markers(), 3);
        assert_eq!(dataset.chromosome(MarkerIndex(1)), crate::types::CHROMOSOME_XY);
        assert_eq!(dataset.chromosome_kind(MarkerIndex(1)), ChromosomeKind::Autosome);
        assert_eq!(dataset.chromosome(MarkerIndex(2)), 30);
        assert_eq!(dataset.chromosome_kind(MarkerIndex(2)), ChromosomeKind::Unplaced);
        assert_eq!(dataset.chromosome_spans().len(), 3);
    }

    #[test]
    fn rejects_bad_magic_and_truncated_payloads() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("bad");
        write_fileset(
            &prefix,
            &[("a", Sex::Female, CaseControl::Missing)],
            &[(1, "rs1", 1)],
            &[vec![0]],
        );
        fs::write(prefix.with_extension("bed"), [0x6c, 0x1b, 0x00, 0x00]).unwrap();
        let err = PlinkDataset::open(&prefix).unwrap_err();
        assert!(err.to_string().contains("unsupported mode byte"));

        fs::write(prefix.with_extension("bed"), [0x6c, 0x1b, 0x01]).unwrap();
        let err = PlinkDataset::open(&prefix).unwrap_err();
        assert!(err.to_string().contains("expected 1 bytes, found 0"));
    }

    #[test]
    fn interleaved_chromosomes_are_rejected() {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("order");
        write_fileset(
            &prefix,
            &[("a", Sex::Female, CaseControl::Missing)],
            &[(1, "rs1", 1), (2, "rs2", 1), (1, "rs3", 2)],
            &[vec![0], vec![1], vec![2]],
        );
        let err = PlinkDataset::open(&prefix).unwrap_err();
        assert!(matches!(err, LdError::InvalidInput(_)));
    }

    #[test]
    fn founder_cohort_skips_non_founders() {
        let child = SampleRecord {
            family_id: "F".into(),
            individual_id: "kid".into(),
            paternal_id: "dad".into(),
            maternal_id: "0".into(),
            sex: Sex::Female,
            phenotype: CaseControl::Missing,
        };
        let mut dad = child.clone();
        dad.paternal_id = "0".into();
        dad.sex = Sex::Male;
        let (subset, sexes) = founder_cohort(&[child, dad]);
        assert_eq!(subset.indices(), &[SampleIndex(1)]);
        assert_eq!(sexes, vec![Sex::Male]);
    }
}
