// ========================================================================================
//
//                          The full LD matrix over every marker
//
// ========================================================================================
//
// Rows of the matrix are processed in blocks. Each row block is encoded once and then
// every column block of the dataset is streamed past it through the block engine; when
// the last column block is done the finished rows are written out in order.

use crate::arena::Region;
use crate::block::{BlockSizing, PairwiseBlockEngine};
use crate::config::{Delimiter, LdMatrixConfig, LdStatistic, MatrixEncoding, MatrixShape};
use crate::encode::{EncodedBlock, GenotypeEncoder, XDosagePolicy};
use crate::error::LdError;
use crate::io::{GenotypeLoader, MarkerMetadata, SampleRecord, founder_cohort};
use crate::kernel::pair_correlation;
use crate::progress::{Phase, ProgressObserver};
use crate::report::{format_g, output_path};
use crate::types::{MarkerIndex, SampleSubset};
use flate2::Compression;
use flate2::write::GzEncoder;
use itertools::Itertools;
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

/// Unsharded matrices over more variants than this need an explicit override.
pub const LARGE_MATRIX_MARKERS: usize = 400_000;

const CELL_DIGITS: usize = 6;
const COLUMN_MULTIPLE: usize = 8;

/// Rows `[k*M/N, (k+1)*M/N)` for 1-based shard `k` of `N`, or all rows.
pub fn shard_rows(config: &LdMatrixConfig, n_markers: usize) -> Range<usize> {
    match config.shard {
        Some(shard) => {
            let k = (shard.index - 1) as u64;
            let n = shard.total as u64;
            let m = n_markers as u64;
            (k * m / n) as usize..((k + 1) * m / n) as usize
        }
        None => 0..n_markers,
    }
}

/// Where a matrix with this configuration is written.
pub fn matrix_path(prefix: &Path, config: &LdMatrixConfig) -> PathBuf {
    let mut suffix = ".ld".to_string();
    if let Some(shard) = config.shard {
        suffix.push_str(&format!(".{}", shard.index));
    }
    match config.encoding {
        MatrixEncoding::Text => {}
        MatrixEncoding::Gzip => suffix.push_str(".gz"),
        MatrixEncoding::Binary => suffix.push_str(".bin"),
    }
    output_path(prefix, &suffix)
}

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Gzip(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Gzip(w) => w.flush(),
        }
    }
}

struct MatrixWriter {
    path: PathBuf,
    sink: Sink,
    encoding: MatrixEncoding,
    delimiter: Delimiter,
}

impl MatrixWriter {
    fn create(path: PathBuf, config: &LdMatrixConfig) -> Result<Self, LdError> {
        let file = File::create(&path).map_err(|e| LdError::open(&path, e))?;
        let out = BufWriter::new(file);
        let sink = match config.encoding {
            MatrixEncoding::Gzip => Sink::Gzip(GzEncoder::new(out, Compression::default())),
            MatrixEncoding::Text | MatrixEncoding::Binary => Sink::Plain(out),
        };
        Ok(Self {
            path,
            sink,
            encoding: config.encoding,
            delimiter: config.delimiter,
        })
    }

    fn write_row(&mut self, row: &[f64]) -> Result<(), LdError> {
        let result = match (self.encoding, self.delimiter) {
            (MatrixEncoding::Binary, _) => row
                .iter()
                .try_for_each(|v| self.sink.write_all(&v.to_ne_bytes())),
            (_, Delimiter::Tab) => {
                let line = row.iter().map(|&v| format_g(v, CELL_DIGITS)).join("\t");
                writeln!(self.sink, "{line}")
            }
            (_, Delimiter::Space) => {
                let mut line = String::with_capacity(row.len() * 9);
                for &v in row {
                    line.push_str(&format_g(v, CELL_DIGITS));
                    line.push(' ');
                }
                writeln!(self.sink, "{line}")
            }
        };
        result.map_err(|e| LdError::write(&self.path, e))
    }

    fn finish(self) -> Result<PathBuf, LdError> {
        let path = self.path;
        let flushed = match self.sink {
            Sink::Plain(mut w) => w.flush(),
            Sink::Gzip(w) => w.finish().and_then(|mut inner| inner.flush()),
        };
        flushed.map_err(|e| LdError::write(&path, e))?;
        Ok(path)
    }
}

fn check_supported(config: &LdMatrixConfig, n_markers: usize) -> Result<(), LdError> {
    if n_markers > LARGE_MATRIX_MARKERS && !config.yes_really && config.shard.is_none() {
        return Err(LdError::InvalidConfiguration(format!(
            "an unsharded square matrix over {n_markers} variants would be enormous; \
             split it into shards or set yes_really"
        )));
    }
    if config.single_precision {
        return Err(LdError::NotYetImplemented("single-precision LD matrix output"));
    }
    match config.shape {
        MatrixShape::Square => Ok(()),
        MatrixShape::Square0 => Err(LdError::NotYetImplemented("square0 LD matrix output")),
        MatrixShape::Triangle => Err(LdError::NotYetImplemented("triangular LD matrix output")),
        MatrixShape::Table => Err(LdError::NotYetImplemented("tabular LD output")),
    }
}

/// Encodes markers `first..first + count` into the leading slots of `block`.
fn fill_block<L, M>(
    block: &mut EncodedBlock<'_>,
    first: usize,
    count: usize,
    loader: &L,
    metadata: &M,
    cohort: &SampleSubset,
    encoder: &GenotypeEncoder,
) -> Result<(), LdError>
where
    L: GenotypeLoader + ?Sized,
    M: MarkerMetadata + ?Sized,
{
    let words = encoder.geometry().geno_words;
    block.par_fill(count, |slot, dest| {
        let marker = MarkerIndex((first + slot) as u32);
        let mut raw = vec![0u64; words];
        loader.load_marker(marker, cohort, metadata.is_reversed(marker), &mut raw)?;
        encoder.encode(&mut raw, metadata.chromosome_kind(marker), dest);
        Ok(())
    })
}

/// Writes the r or r² matrix between every pair of markers, computed over founders.
///
/// Returns the output path, or `None` when there are no founders to compute over.
#[allow(clippy::too_many_arguments)]
pub fn write_ld_matrix<L, M>(
    loader: &L,
    metadata: &M,
    samples: &[SampleRecord],
    config: &LdMatrixConfig,
    out_prefix: &Path,
    threads: usize,
    memory_budget: usize,
    progress: &mut dyn ProgressObserver,
) -> Result<Option<PathBuf>, LdError>
where
    L: GenotypeLoader + ?Sized,
    M: MarkerMetadata + ?Sized,
{
    config.validate()?;
    let (founders, sexes) = founder_cohort(samples);
    if founders.is_empty() {
        warn!("Skipping LD matrix calculation since there are no founders.");
        return Ok(None);
    }
    let n_markers = metadata.n_markers();
    check_supported(config, n_markers)?;

    let policy = if config.x_model.ignore_x {
        XDosagePolicy::AsAutosome
    } else {
        XDosagePolicy::MaleHetEquivalent
    };
    let encoder = GenotypeEncoder::new(&sexes, policy);
    let geometry = encoder.geometry();
    let cohort_size = geometry.n_samples as u32;

    let job = shard_rows(config, n_markers);
    let engine = PairwiseBlockEngine::new(threads);
    let region = Region::with_budget(memory_budget);
    let slot_bytes = EncodedBlock::bytes_per_slot(geometry, false);
    let sizing = BlockSizing::plan(
        region.remaining(),
        slot_bytes + n_markers * 8,
        slot_bytes,
        engine.threads(),
        job.len(),
        n_markers,
        COLUMN_MULTIPLE,
    )?;
    let mut rows = EncodedBlock::allocate(&region, geometry, sizing.rows, false)?;
    let mut cols = EncodedBlock::allocate(&region, geometry, sizing.cols, false)?;
    let results = region.alloc_zeroed::<f64>("LD matrix rows", sizing.rows * n_markers)?;
    debug!(
        "LD matrix rows {}..{} in blocks of {} rows x {} columns",
        job.start, job.end, sizing.rows, sizing.cols
    );

    let path = matrix_path(out_prefix, config);
    let mut writer = MatrixWriter::create(path, config)?;
    let mut workers = vec![(); engine.threads()];
    let statistic = config.statistic;

    progress.on_phase_start(Phase::LdMatrix, job.len());
    let mut row_start = job.start;
    while row_start < job.end {
        let row_count = sizing.rows.min(job.end - row_start);
        fill_block(&mut rows, row_start, row_count, loader, metadata, &founders, &encoder)?;
        let block_results = &mut results[..row_count * n_markers];
        let bounds = engine.row_bounds(&vec![n_markers; row_count]);

        let mut col_start = 0;
        while col_start < n_markers {
            let col_count = sizing.cols.min(n_markers - col_start);
            fill_block(&mut cols, col_start, col_count, loader, metadata, &founders, &encoder)?;
            let (row_block, col_block) = (&rows, &cols);
            engine.run(&bounds, block_results, n_markers, &mut workers, |mut ctx, _| {
                for row in ctx.rows.clone() {
                    let fixed = row_block.view(row);
                    let out = &mut ctx.row_mut(row)[col_start..col_start + col_count];
                    for (col, cell) in out.iter_mut().enumerate() {
                        let pair = pair_correlation(&fixed, &col_block.view(col), cohort_size);
                        *cell = match statistic {
                            LdStatistic::R => pair.r(),
                            LdStatistic::RSquared => pair.r_squared(),
                        };
                    }
                }
            })?;
            col_start += col_count;
        }

        for row in block_results.chunks_exact(n_markers) {
            writer.write_row(row)?;
        }
        row_start += row_count;
        progress.on_phase_advance(Phase::LdMatrix, row_start - job.start);
    }
    progress.on_phase_finish(Phase::LdMatrix);

    let path = writer.finish()?;
    info!("LD matrix written to {}.", path.display());
    Ok(Some(path))
}
