// ========================================================================================
//
//                    The window scheduler: sliding-window LD pruning
//
// ========================================================================================
//
// Every chromosome is walked by an explicit state machine:
//
//   ChromStart -> Scanning -> Sliding -> Scanning -> ... -> ChromDone
//
// The window holds the encoded vectors of its live markers in slot order, so slot
// order is always file order. Each slot remembers the first marker it has not yet been
// compared with (`resume`). A slide only has to compare surviving markers against the
// newly loaded ones, and repeated passes after a removal never revisit cleared pairs.
//
// Window buffers live in a region that is closed when the chromosome is done.

use crate::arena::Region;
use crate::config::{PruneConfig, PruneMode, WindowExtent};
use crate::encode::{EncodedBlock, GenotypeEncoder, XDosagePolicy};
use crate::error::LdError;
use crate::io::{GenotypeLoader, MarkerMetadata, SampleRecord, founder_cohort};
use crate::kernel::pair_correlation;
use crate::progress::{Phase, ProgressObserver};
use crate::types::{ChromosomeKind, ChromosomeSpan, MarkerIndex, SampleSubset};
use crate::vif::MatrixPruner;
use log::{debug, info, warn};
use ndarray::ArrayViewMut2;

/// In variance-inflation mode, pairs with r above this are treated as duplicates
/// before any matrix is inverted.
const DUPLICATE_R_THRESHOLD: f64 = 0.999999;

/// Markers that entered pruning and the verdict on each.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneOutcome {
    /// Every marker that entered a window, in file order.
    pub considered: Vec<MarkerIndex>,
    /// Indexed by marker; true for removed markers.
    pub pruned: Vec<bool>,
}

impl PruneOutcome {
    pub fn retained(&self) -> impl Iterator<Item = MarkerIndex> + '_ {
        self.considered
            .iter()
            .copied()
            .filter(|m| !self.pruned[m.get()])
    }

    pub fn removed(&self) -> impl Iterator<Item = MarkerIndex> + '_ {
        self.considered
            .iter()
            .copied()
            .filter(|m| self.pruned[m.get()])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowPhase {
    ChromStart,
    Scanning,
    Sliding,
    ChromDone,
}

/// Everything a chromosome window needs that does not change between chromosomes.
struct PruneContext<'a, L: ?Sized, M: ?Sized> {
    loader: &'a L,
    metadata: &'a M,
    founders: &'a SampleSubset,
    encoder: &'a GenotypeEncoder,
    config: &'a PruneConfig,
    capacity: usize,
}

struct ChromosomeWindow<'r, 'a, L: ?Sized, M: ?Sized> {
    ctx: &'a PruneContext<'a, L, M>,
    span: ChromosomeSpan,
    kind: ChromosomeKind,
    cohort: u32,
    block: EncodedBlock<'r>,
    /// Slot-addressed correlations, upper triangle only. Variance-inflation mode only.
    corr: Option<ArrayViewMut2<'r, f64>>,
    live: Vec<usize>,
    resume: Vec<usize>,
    raw: Vec<u64>,
    start: usize,
    end: usize,
    excluded: usize,
}

impl<'r, 'a, L, M> ChromosomeWindow<'r, 'a, L, M>
where
    L: GenotypeLoader + ?Sized,
    M: MarkerMetadata + ?Sized,
{
    fn new(
        region: &'r Region,
        ctx: &'a PruneContext<'a, L, M>,
        span: ChromosomeSpan,
    ) -> Result<Self, LdError> {
        let kind = span.kind();
        let geometry = ctx.encoder.geometry();
        let block = EncodedBlock::allocate(
            region,
            geometry,
            ctx.capacity,
            ctx.encoder.uses_aux(kind),
        )?;
        let corr = match ctx.config.mode {
            PruneMode::Pairwise => None,
            PruneMode::VarianceInflation => {
                let cells =
                    region.alloc_zeroed::<f64>("window correlations", ctx.capacity * ctx.capacity)?;
                let view = ArrayViewMut2::from_shape((ctx.capacity, ctx.capacity), cells)
                    .map_err(|e| LdError::InvalidInput(e.to_string()))?;
                Some(view)
            }
        };
        Ok(Self {
            ctx,
            span,
            kind,
            cohort: ctx.encoder.weighted_cohort(kind),
            block,
            corr,
            live: Vec::with_capacity(ctx.capacity),
            resume: Vec::with_capacity(ctx.capacity),
            raw: vec![0u64; geometry.geno_words],
            start: span.start,
            end: span.start,
            excluded: 0,
        })
    }

    /// Number of markers within the window radius of the marker at `from`, counted from
    /// `first` onwards.
    fn markers_in_reach(&self, from: usize, first: usize, kb: u32) -> usize {
        let limit = self.ctx.metadata.position(MarkerIndex(from as u32)) as u64 + 1000 * kb as u64;
        (first..self.span.end)
            .take_while(|&m| self.ctx.metadata.position(MarkerIndex(m as u32)) as u64 <= limit)
            .count()
    }

    /// Loads the marker at `self.end` into the next free slot.
    fn push_next(&mut self, pruned: &mut [bool]) -> Result<(), LdError> {
        let marker = self.end;
        let slot = self.live.len();
        let index = MarkerIndex(marker as u32);
        self.ctx.loader.load_marker(
            index,
            self.ctx.founders,
            self.ctx.metadata.is_reversed(index),
            &mut self.raw,
        )?;
        let outcome = self
            .ctx
            .encoder
            .encode(&mut self.raw, self.kind, self.block.slot_mut(slot));
        if !outcome.has_variance {
            pruned[marker] = true;
            self.excluded += 1;
        }
        self.live.push(marker);
        self.resume.push(marker + 1);
        self.end += 1;
        Ok(())
    }

    fn fill_initial_window(&mut self, pruned: &mut [bool]) -> Result<(), LdError> {
        let count = match self.ctx.config.window {
            WindowExtent::Markers(n) => n,
            WindowExtent::Kilobases(kb) => self.markers_in_reach(self.start, self.start, kb),
        };
        let count = count.min(self.span.end - self.start).min(self.ctx.capacity);
        for _ in 0..count {
            self.push_next(pruned)?;
        }
        Ok(())
    }

    fn threshold(&self) -> f64 {
        match self.ctx.config.mode {
            PruneMode::Pairwise => self.ctx.config.r2_threshold,
            PruneMode::VarianceInflation => DUPLICATE_R_THRESHOLD,
        }
    }

    /// Compares every unpruned pair that has not been compared yet, removing one marker
    /// of each pair over the threshold, until a full pass removes nothing.
    fn scan(&mut self, pruned: &mut [bool]) {
        let n = self.live.len();
        let threshold = self.threshold();
        loop {
            let mut removed_any = false;
            for i in 0..n.saturating_sub(1) {
                if pruned[self.live[i]] {
                    continue;
                }
                let fixed = self.block.view(i);
                let mut j = i + 1;
                while j < n && self.live[j] < self.resume[i] {
                    j += 1;
                }
                let mut exhausted = true;
                while j < n {
                    if pruned[self.live[j]] {
                        j += 1;
                        continue;
                    }
                    let corr = pair_correlation(&fixed, &self.block.view(j), self.cohort);
                    let stat = match self.corr.as_mut() {
                        None => corr.r_squared(),
                        Some(matrix) => {
                            let r = corr.r();
                            matrix[[i, j]] = r;
                            r
                        }
                    };
                    if stat > threshold {
                        removed_any = true;
                        exhausted = false;
                        self.excluded += 1;
                        let maf_i = self
                            .ctx
                            .metadata
                            .minor_allele_frequency(MarkerIndex(self.live[i] as u32));
                        let maf_j = self
                            .ctx
                            .metadata
                            .minor_allele_frequency(MarkerIndex(self.live[j] as u32));
                        if maf_i < maf_j {
                            pruned[self.live[i]] = true;
                        } else {
                            pruned[self.live[j]] = true;
                            j += 1;
                            while j < n && pruned[self.live[j]] {
                                j += 1;
                            }
                            self.resume[i] = if j < n { self.live[j] } else { self.end };
                        }
                        break;
                    }
                    j += 1;
                }
                if exhausted {
                    self.resume[i] = self.end;
                }
            }
            if !removed_any {
                break;
            }
        }

        if let Some(matrix) = self.corr.as_ref() {
            let rows: Vec<usize> = (0..n).filter(|&s| !pruned[self.live[s]]).collect();
            let pruner = MatrixPruner::new(self.ctx.config.vif_threshold);
            for slot in pruner.prune_window(matrix.view(), rows) {
                pruned[self.live[slot]] = true;
                self.excluded += 1;
            }
        }
    }

    /// Advances the window. Returns false once the window start has left the
    /// chromosome.
    fn slide(&mut self, pruned: &mut [bool]) -> Result<bool, LdError> {
        self.start = (self.start + self.ctx.config.step).min(self.span.end);
        if self.start == self.span.end {
            return Ok(false);
        }

        // Compact surviving markers to the front, carrying their correlations along.
        let mut kept = 0;
        let mut origin = Vec::with_capacity(self.live.len());
        for slot in 0..self.live.len() {
            let marker = self.live[slot];
            if marker < self.start || pruned[marker] {
                continue;
            }
            self.block.move_slot(slot, kept);
            self.live[kept] = marker;
            self.resume[kept] = self.resume[slot];
            if let Some(matrix) = self.corr.as_mut() {
                for (row, &old_row) in origin.iter().enumerate() {
                    matrix[[row, kept]] = matrix[[old_row, slot]];
                }
            }
            origin.push(slot);
            kept += 1;
        }
        self.live.truncate(kept);
        self.resume.truncate(kept);

        let incoming = match self.ctx.config.window {
            WindowExtent::Markers(_) => self.ctx.config.step,
            WindowExtent::Kilobases(kb) => self.markers_in_reach(self.start, self.end, kb),
        };
        let room = self.ctx.capacity - self.live.len();
        for _ in 0..incoming.min(room) {
            if self.end == self.span.end {
                break;
            }
            self.push_next(pruned)?;
        }
        Ok(true)
    }

    /// Runs the chromosome to completion and returns how many markers it lost.
    fn run(mut self, pruned: &mut [bool]) -> Result<usize, LdError> {
        let mut phase = WindowPhase::ChromStart;
        loop {
            phase = match phase {
                WindowPhase::ChromStart => {
                    self.fill_initial_window(pruned)?;
                    WindowPhase::Scanning
                }
                WindowPhase::Scanning => {
                    if self.live.len() > 1 {
                        self.scan(pruned);
                    }
                    WindowPhase::Sliding
                }
                WindowPhase::Sliding => {
                    if self.slide(pruned)? {
                        WindowPhase::Scanning
                    } else {
                        WindowPhase::ChromDone
                    }
                }
                WindowPhase::ChromDone => break,
            };
        }
        Ok(self.excluded)
    }
}

/// The largest number of markers a kilobase window can hold anywhere in `spans`.
fn kilobase_window_capacity<M: MarkerMetadata + ?Sized>(
    metadata: &M,
    spans: &[ChromosomeSpan],
    kb: u32,
) -> usize {
    let radius = 1000 * kb as u64;
    let mut widest = 1;
    for span in spans {
        let mut reach = span.start;
        for first in span.start..span.end {
            let limit = metadata.position(MarkerIndex(first as u32)) as u64 + radius;
            reach = reach.max(first);
            while reach < span.end && metadata.position(MarkerIndex(reach as u32)) as u64 <= limit {
                reach += 1;
            }
            widest = widest.max(reach - first);
        }
    }
    widest
}

/// Sliding-window LD pruning over every placed chromosome.
///
/// Returns `Ok(None)` when the cohort has no founders.
pub fn prune_markers<L, M>(
    loader: &L,
    metadata: &M,
    samples: &[SampleRecord],
    config: &PruneConfig,
    memory_budget: usize,
    progress: &mut dyn ProgressObserver,
) -> Result<Option<PruneOutcome>, LdError>
where
    L: GenotypeLoader + ?Sized,
    M: MarkerMetadata + ?Sized,
{
    config.validate()?;
    let (founders, sexes) = founder_cohort(samples);
    if founders.is_empty() {
        warn!("Skipping LD pruning since there are no founders.");
        return Ok(None);
    }
    let policy = config.x_model.policy();
    let encoder = GenotypeEncoder::new(&sexes, policy);
    if policy == XDosagePolicy::DoubleNonMale
        && founders.len() + encoder.nonmale_count() > i32::MAX as usize
    {
        return Err(LdError::InvalidConfiguration(
            "too many founders for weighted X-chromosome pruning".to_string(),
        ));
    }

    let spans: Vec<ChromosomeSpan> = metadata
        .chromosome_spans()
        .iter()
        .copied()
        .filter(|s| s.kind() != ChromosomeKind::Unplaced && !s.is_empty())
        .collect();
    if spans.is_empty() {
        return Err(LdError::InvalidInput(
            "no valid variants for LD pruning".to_string(),
        ));
    }
    let capacity = match config.window {
        WindowExtent::Markers(n) => n,
        WindowExtent::Kilobases(kb) => kilobase_window_capacity(metadata, &spans, kb),
    };
    debug!("pruning window holds up to {capacity} variants");

    let ctx = PruneContext {
        loader,
        metadata,
        founders: &founders,
        encoder: &encoder,
        config,
        capacity,
    };
    let mut pruned = vec![false; metadata.n_markers()];
    let considered: Vec<MarkerIndex> = spans
        .iter()
        .flat_map(|s| (s.start..s.end).map(|m| MarkerIndex(m as u32)))
        .collect();

    let mut region = Region::with_budget(memory_budget);
    progress.on_phase_start(Phase::Pruning, considered.len());
    let mut done = 0;
    let mut total_excluded = 0;
    for span in &spans {
        let excluded = ChromosomeWindow::new(&region, &ctx, *span)?.run(&mut pruned)?;
        region.close();
        info!(
            "Pruned {excluded} variant{} from chromosome {}, leaving {}.",
            if excluded == 1 { "" } else { "s" },
            crate::types::chromosome_label(span.code),
            span.len() - excluded
        );
        total_excluded += excluded;
        done += span.len();
        progress.on_phase_advance(Phase::Pruning, done);
    }
    progress.on_phase_finish(Phase::Pruning);
    info!(
        "Pruning complete. {total_excluded} of {} variants removed.",
        considered.len()
    );
    Ok(Some(PruneOutcome { considered, pruned }))
}
