// ========================================================================================
//
//                     Case/control epistasis over every autosomal pair
//
// ========================================================================================
//
// Every eligible marker pair (i, j) with i < j is tested once. Rows are held in blocks
// and the markers after the block's first row are streamed past it as columns; the
// block engine hands each worker a contiguous range of rows, balanced by how many
// pairs of the current column block those rows own.
//
// A pair contributes to the tallies of both of its markers. Row tallies are private to
// the worker that owns the row; column tallies are accumulated per worker and merged
// once the column block is joined.

use crate::arena::Region;
use crate::block::{BlockSizing, PairwiseBlockEngine};
use crate::config::{EpistasisConfig, EpistasisMode};
use crate::contingency::{
    ContingencyTable, SignificanceThresholds, SplitGeometry, epistasis_statistic, split_dosages,
};
use crate::encode::SAMPLES_PER_WORD;
use crate::error::LdError;
use crate::io::{GenotypeLoader, MarkerMetadata, SampleRecord};
use crate::progress::{Phase, ProgressObserver};
use crate::report::{PairReportWriter, SummaryRow, id_column_width, write_epistasis_summary};
use crate::types::{CaseControl, ChromosomeKind, MarkerIndex, SampleIndex, SampleSubset};
use log::{debug, info};
use rayon::prelude::*;
use std::path::{Path, PathBuf};

/// Phenotyped cohorts must stay below this many samples.
const MAX_PHENOTYPED_SAMPLES: usize = 1 << 29;
const COLUMN_MULTIPLE: usize = 16;

/// What a completed scan produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpistasisOutcome {
    pub report: PathBuf,
    pub summary: PathBuf,
    /// Markers left out before scanning.
    pub skipped: usize,
    pub valid_tests: u64,
}

/// Running totals for one marker.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct MarkerTally {
    significant: u32,
    failed: u32,
    best: f64,
    /// Position in the scanned marker list of the best partner so far.
    partner: u32,
}

impl MarkerTally {
    fn record(&mut self, zsq: f64, partner: usize, count_zsq: f64) {
        if zsq >= count_zsq {
            self.significant += 1;
        }
        if zsq > self.best {
            self.best = zsq;
            self.partner = partner as u32;
        }
    }

    /// A fresh fragment that continues from `self`'s best result.
    fn fragment(&self) -> Self {
        Self {
            significant: 0,
            failed: 0,
            ..*self
        }
    }
}

#[derive(Default)]
struct ScanWorker {
    rows: Vec<MarkerTally>,
    cols: Vec<MarkerTally>,
    failed_pairs: u64,
}

impl ScanWorker {
    fn reseed(&mut self, row_tallies: &[MarkerTally], col_tallies: &[MarkerTally]) {
        self.rows.clear();
        self.rows.extend(row_tallies.iter().map(MarkerTally::fragment));
        self.cols.clear();
        self.cols.extend(col_tallies.iter().map(MarkerTally::fragment));
        self.failed_pairs = 0;
    }
}

/// The two phenotype strata, each in sample order.
struct Strata {
    cases: SampleSubset,
    controls: SampleSubset,
    geometry: SplitGeometry,
}

impl Strata {
    fn from_samples(samples: &[SampleRecord]) -> Result<Self, LdError> {
        let pick = |status: CaseControl| {
            SampleSubset::new(
                samples
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.phenotype == status)
                    .map(|(idx, _)| SampleIndex(idx as u32))
                    .collect(),
            )
        };
        let cases = pick(CaseControl::Case);
        let controls = pick(CaseControl::Control);
        if cases.len() + controls.len() >= MAX_PHENOTYPED_SAMPLES {
            return Err(LdError::InvalidConfiguration(
                "fast epistasis supports fewer than 2^29 phenotyped samples".to_string(),
            ));
        }
        if cases.len() < 2 || controls.len() < 2 {
            return Err(LdError::InvalidConfiguration(format!(
                "fast epistasis needs at least 2 cases and 2 controls, found {} and {}",
                cases.len(),
                controls.len()
            )));
        }
        let geometry = SplitGeometry::new(cases.len(), controls.len());
        Ok(Self {
            cases,
            controls,
            geometry,
        })
    }

    /// Scratch buffer large enough to hold either stratum's packed dosages.
    fn scratch(&self) -> Vec<u64> {
        vec![0u64; self.geometry.cases.max(self.geometry.controls).div_ceil(SAMPLES_PER_WORD)]
    }

    /// Loads `marker` for both strata and sorts it into class planes. `raw` comes from
    /// `scratch` and is reused across calls.
    fn load<L, M>(
        &self,
        loader: &L,
        metadata: &M,
        marker: MarkerIndex,
        raw: &mut [u64],
        dest: &mut [u64],
    ) -> Result<(), LdError>
    where
        L: GenotypeLoader + ?Sized,
        M: MarkerMetadata + ?Sized,
    {
        let reverse = metadata.is_reversed(marker);
        let (case_half, control_half) = self.geometry.halves_mut(dest);
        for (subset, n, half) in [
            (&self.cases, self.geometry.cases, case_half),
            (&self.controls, self.geometry.controls, control_half),
        ] {
            let raw = &mut raw[..n.div_ceil(SAMPLES_PER_WORD)];
            loader.load_marker(marker, subset, reverse, raw)?;
            split_dosages(raw, n, half);
        }
        Ok(())
    }

    fn fill<L, M>(
        &self,
        loader: &L,
        metadata: &M,
        markers: &[MarkerIndex],
        block: &mut [u64],
    ) -> Result<(), LdError>
    where
        L: GenotypeLoader + ?Sized,
        M: MarkerMetadata + ?Sized,
    {
        let words = self.geometry.words_per_marker();
        block[..markers.len() * words]
            .par_chunks_mut(words)
            .zip(markers.par_iter())
            .try_for_each_init(
                || self.scratch(),
                |raw, (dest, &marker)| self.load(loader, metadata, marker, raw, dest),
            )
    }
}

/// Autosomal markers that vary in both strata, in file order.
fn eligible_markers<L, M>(
    loader: &L,
    metadata: &M,
    strata: &Strata,
) -> Result<Vec<MarkerIndex>, LdError>
where
    L: GenotypeLoader + ?Sized,
    M: MarkerMetadata + ?Sized,
{
    let words = strata.geometry.words_per_marker();
    let verdicts = (0..metadata.n_markers())
        .into_par_iter()
        .map_init(
            || (strata.scratch(), vec![0u64; words]),
            |(raw, planes), m| {
                let marker = MarkerIndex(m as u32);
                if metadata.chromosome_kind(marker) != ChromosomeKind::Autosome {
                    return Ok(None);
                }
                strata.load(loader, metadata, marker, raw, planes)?;
                let split = strata.geometry.view(&planes[..]);
                let varies = !split.cases.is_monomorphic() && !split.controls.is_monomorphic();
                Ok(varies.then_some(marker))
            },
        )
        .collect::<Result<Vec<_>, LdError>>()?;
    Ok(verdicts.into_iter().flatten().collect())
}

/// Runs the fast case/control epistasis scan and writes the pair report and summary.
#[allow(clippy::too_many_arguments)]
pub fn run_epistasis<L, M>(
    loader: &L,
    metadata: &M,
    samples: &[SampleRecord],
    config: &EpistasisConfig,
    out_prefix: &Path,
    threads: usize,
    memory_budget: usize,
    progress: &mut dyn ProgressObserver,
) -> Result<EpistasisOutcome, LdError>
where
    L: GenotypeLoader + ?Sized,
    M: MarkerMetadata + ?Sized,
{
    config.validate()?;
    if config.mode == EpistasisMode::Regression {
        return Err(LdError::NotYetImplemented("logistic regression epistasis"));
    }
    if config.case_only {
        return Err(LdError::NotYetImplemented("case-only fast epistasis"));
    }
    let strata = Strata::from_samples(samples)?;
    let thresholds = SignificanceThresholds::from_levels(config.epi1, config.epi2)?;

    let markers = eligible_markers(loader, metadata, &strata)?;
    let skipped = metadata.n_markers() - markers.len();
    if skipped > 0 {
        info!(
            "Skipping {skipped} variant{} that are not autosomal or are monomorphic in \
             cases or controls.",
            if skipped == 1 { "" } else { "s" }
        );
    }
    let n = markers.len();
    if n < 2 {
        return Err(LdError::InvalidInput(
            "too few variants remain for an epistasis scan".to_string(),
        ));
    }

    let engine = PairwiseBlockEngine::new(threads);
    let region = Region::with_budget(memory_budget);
    let words = strata.geometry.words_per_marker();
    let marker_bytes = strata.geometry.bytes_per_marker();
    let sizing = BlockSizing::plan(
        region.remaining(),
        marker_bytes + n * 8,
        marker_bytes,
        engine.threads(),
        n - 1,
        n - 1,
        COLUMN_MULTIPLE,
    )?;
    let row_block = region.alloc_zeroed::<u64>("epistasis row markers", sizing.rows * words)?;
    let col_block = region.alloc_zeroed::<u64>("epistasis column markers", sizing.cols * words)?;
    let results = region.alloc_zeroed::<f64>("epistasis statistics", sizing.rows * n)?;
    debug!(
        "epistasis over {n} variants in blocks of {} rows x {} columns",
        sizing.rows, sizing.cols
    );

    let ids: Vec<&str> = markers.iter().map(|&m| metadata.marker_id(m)).collect();
    let chromosomes: Vec<u8> = markers.iter().map(|&m| metadata.chromosome(m)).collect();
    let id_width = id_column_width(ids.iter().copied());
    let mut report = PairReportWriter::create(out_prefix, id_width, !config.no_p_value)?;

    let mut tallies = vec![MarkerTally::default(); n];
    let mut workers: Vec<ScanWorker> = (0..engine.threads()).map(|_| ScanWorker::default()).collect();
    let mut failed_pairs = 0u64;
    let geometry = strata.geometry;
    let report_failures = thresholds.report_zsq == 0.0;
    let no_ueki = config.no_ueki;

    progress.on_phase_start(Phase::Epistasis, n);
    let mut row_start = 0;
    while row_start < n - 1 {
        let row_count = sizing.rows.min(n - 1 - row_start);
        let row_end = row_start + row_count;
        strata.fill(loader, metadata, &markers[row_start..row_end], row_block)?;
        let block_results = &mut results[..row_count * n];
        block_results.fill(0.0);

        let mut col_start = row_start + 1;
        while col_start < n {
            let col_count = sizing.cols.min(n - col_start);
            let col_end = col_start + col_count;
            strata.fill(loader, metadata, &markers[col_start..col_end], col_block)?;

            let workloads: Vec<usize> = (row_start..row_end)
                .map(|i| col_end.saturating_sub(col_start.max(i + 1)))
                .collect();
            let bounds = engine.row_bounds(&workloads);
            let parts = bounds.len() - 1;
            for worker in &mut workers[..parts] {
                worker.reseed(&tallies[row_start..row_end], &tallies[col_start..col_end]);
            }

            let (rows, cols) = (&*row_block, &*col_block);
            engine.run(&bounds, block_results, n, &mut workers[..parts], |mut ctx, worker| {
                for r in ctx.rows.clone() {
                    let i = row_start + r;
                    let first = geometry.view(&rows[r * words..(r + 1) * words]);
                    let out = ctx.row_mut(r);
                    for j in col_start.max(i + 1)..col_end {
                        let c = j - col_start;
                        let second = geometry.view(&cols[c * words..(c + 1) * words]);
                        let zsq = epistasis_statistic(
                            &ContingencyTable::build(&first.cases, &second.cases),
                            &ContingencyTable::build(&first.controls, &second.controls),
                            no_ueki,
                        );
                        if zsq.is_finite() {
                            if zsq >= thresholds.report_zsq {
                                out[j] = zsq;
                            }
                            worker.rows[r].record(zsq, j, thresholds.count_zsq);
                            worker.cols[c].record(zsq, i, thresholds.count_zsq);
                        } else {
                            if report_failures {
                                out[j] = f64::NAN;
                            }
                            worker.rows[r].failed += 1;
                            worker.cols[c].failed += 1;
                            worker.failed_pairs += 1;
                        }
                    }
                }
            })?;

            for (worker, range) in workers.iter().zip(bounds.windows(2)) {
                for r in range[0]..range[1] {
                    let fragment = worker.rows[r];
                    let tally = &mut tallies[row_start + r];
                    tally.significant += fragment.significant;
                    tally.failed += fragment.failed;
                    tally.best = fragment.best;
                    tally.partner = fragment.partner;
                }
                failed_pairs += worker.failed_pairs;
            }
            for worker in &workers[..parts] {
                for (c, fragment) in worker.cols.iter().enumerate() {
                    let tally = &mut tallies[col_start + c];
                    tally.significant += fragment.significant;
                    tally.failed += fragment.failed;
                    if fragment.best > tally.best {
                        tally.best = fragment.best;
                        tally.partner = fragment.partner;
                    }
                }
            }
            col_start = col_end;
        }

        for (r, row) in block_results.chunks_exact(n).enumerate() {
            let i = row_start + r;
            for (j, &zsq) in row.iter().enumerate().skip(i + 1) {
                if zsq != 0.0 {
                    report.write_pair(
                        (chromosomes[i], ids[i]),
                        (chromosomes[j], ids[j]),
                        zsq,
                        thresholds.p_value(zsq),
                    )?;
                }
            }
        }
        row_start = row_end;
        progress.on_phase_advance(Phase::Epistasis, row_start);
    }
    progress.on_phase_advance(Phase::Epistasis, n);
    progress.on_phase_finish(Phase::Epistasis);
    let report = report.finish()?;

    let summary = write_epistasis_summary(
        out_prefix,
        id_width,
        tallies.iter().enumerate().map(|(m, tally)| SummaryRow {
            chromosome: chromosomes[m],
            id: ids[m],
            significant: tally.significant,
            valid: (n - 1) as u32 - tally.failed,
            best: (tally.best > 0.0).then(|| {
                let partner = tally.partner as usize;
                (tally.best, chromosomes[partner], ids[partner])
            }),
        }),
    )?;

    let valid_tests = (n as u64 * (n as u64 - 1)) / 2 - failed_pairs;
    info!(
        "{valid_tests} valid tests performed, summary written to {}.",
        summary.display()
    );
    Ok(EpistasisOutcome {
        report,
        summary,
        skipped,
        valid_tests,
    })
}
