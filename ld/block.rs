// ========================================================================================
//
//                  The pairwise block engine: row block × column block scans
//
// ========================================================================================
//
// Both all-pairs reports work the same way. A block of "row" markers is held while
// every column block is streamed past it; for each column block a fixed set of workers
// is spawned, each owning a contiguous range of rows and the matching rows of the
// result buffer, and all of them are joined before the next column block is loaded.
// Workers never share anything mutable. Whatever they need to combine afterwards lives
// in their own per-thread state, which the caller merges once they are joined.

use crate::error::LdError;
use log::trace;
use std::ops::Range;
use std::thread;

/// How many rows and columns to hold at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSizing {
    pub rows: usize,
    pub cols: usize,
}

impl BlockSizing {
    /// Claims up to half of `budget` for row buffers and the rest for column buffers.
    ///
    /// `row_bytes` is everything one row costs, result space included; `col_bytes` is
    /// the cost of one column. Rows are rounded down to a multiple of `threads` and
    /// columns to a multiple of `col_multiple`.
    pub fn plan(
        budget: usize,
        row_bytes: usize,
        col_bytes: usize,
        threads: usize,
        job_rows: usize,
        total_cols: usize,
        col_multiple: usize,
    ) -> Result<Self, LdError> {
        let threads = threads.max(1);
        let per_thread = budget / (row_bytes.max(1) * 2) / threads;
        if per_thread == 0 {
            return Err(LdError::OutOfMemory {
                what: "row block",
                requested: row_bytes * threads * 2,
                available: budget,
            });
        }
        let rows = (per_thread * threads).min(job_rows.max(1));

        let left = budget - rows * row_bytes;
        let cap = total_cols.div_ceil(col_multiple) * col_multiple;
        let cols = (left / col_bytes.max(1)).min(cap) / col_multiple * col_multiple;
        if cols == 0 {
            return Err(LdError::OutOfMemory {
                what: "column block",
                requested: col_bytes * col_multiple,
                available: left,
            });
        }
        trace!("block sizing: {rows} rows x {cols} columns within {budget} bytes");
        Ok(Self { rows, cols })
    }
}

/// Splits rows into `threads` contiguous ranges of roughly equal total work.
///
/// `workloads[r]` is the number of pairs row `r` contributes. The result holds the
/// range boundaries, starting with 0 and ending with `workloads.len()`; every range but
/// possibly the trailing ones is non-empty.
pub fn balanced_row_bounds(workloads: &[usize], threads: usize) -> Vec<usize> {
    let rows = workloads.len();
    let threads = threads.clamp(1, rows.max(1));
    let total: u64 = workloads.iter().map(|&w| w as u64).sum();
    let mut bounds = Vec::with_capacity(threads + 1);
    bounds.push(0);
    let mut row = 0;
    let mut assigned = 0u64;
    for t in 1..threads {
        let target = total * t as u64 / threads as u64;
        let range_start = row;
        while row < rows && (row == range_start || assigned < target) {
            assigned += workloads[row] as u64;
            row += 1;
        }
        bounds.push(row);
    }
    bounds.push(rows);
    bounds
}

/// Everything one worker is allowed to touch for the duration of a block.
pub struct WorkerContext<'a> {
    pub thread_index: usize,
    /// Block-local rows owned by this worker.
    pub rows: Range<usize>,
    /// Result rows `rows`, `stride` values each.
    pub results: &'a mut [f64],
    pub stride: usize,
}

impl WorkerContext<'_> {
    /// The result row for block-local row `row`.
    #[inline]
    pub fn row_mut(&mut self, row: usize) -> &mut [f64] {
        let local = row - self.rows.start;
        &mut self.results[local * self.stride..(local + 1) * self.stride]
    }
}

/// Runs one row block against one column block on a fresh set of scoped threads.
pub struct PairwiseBlockEngine {
    threads: usize,
}

impl PairwiseBlockEngine {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    #[inline]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Row ranges for a block whose rows carry the given pair counts.
    pub fn row_bounds(&self, workloads: &[usize]) -> Vec<usize> {
        balanced_row_bounds(workloads, self.threads)
    }

    /// Calls `body` once per range in `bounds`, each on its own thread with its own
    /// slice of `results` and its own entry of `workers`. The first range runs on the
    /// calling thread. Returns once every worker has finished.
    pub fn run<W, F>(
        &self,
        bounds: &[usize],
        results: &mut [f64],
        stride: usize,
        workers: &mut [W],
        body: F,
    ) -> Result<(), LdError>
    where
        W: Send,
        F: Fn(WorkerContext<'_>, &mut W) + Sync,
    {
        let parts = bounds.len().saturating_sub(1);
        debug_assert!(workers.len() >= parts);
        debug_assert!(results.len() >= bounds.last().copied().unwrap_or(0) * stride);

        let mut contexts = Vec::with_capacity(parts);
        let mut rest = results;
        for (thread_index, range) in bounds.windows(2).enumerate() {
            let (mine, tail) = rest.split_at_mut((range[1] - range[0]) * stride);
            rest = tail;
            contexts.push(WorkerContext {
                thread_index,
                rows: range[0]..range[1],
                results: mine,
                stride,
            });
        }

        let body = &body;
        thread::scope(|s| {
            let mut pairs = contexts.into_iter().zip(workers.iter_mut());
            let Some((first_ctx, first_worker)) = pairs.next() else {
                return Ok(());
            };
            let mut handles = Vec::with_capacity(parts.saturating_sub(1));
            for (ctx, worker) in pairs {
                let handle = thread::Builder::new()
                    .name(format!("ldepi-block-{}", ctx.thread_index))
                    .spawn_scoped(s, move || body(ctx, worker))
                    .map_err(LdError::ThreadCreateFailure)?;
                handles.push(handle);
            }
            body(first_ctx, first_worker);
            for handle in handles {
                if let Err(payload) = handle.join() {
                    std::panic::resume_unwind(payload);
                }
            }
            Ok(())
        })
    }
}
