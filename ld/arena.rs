// ========================================================================================
//
//                         The bump region: budgeted scratch memory
//
// ========================================================================================
//
// Every command works inside one `Region`. Buffers are carved out of a `bumpalo::Bump`
// as typed slices and are never released one at a time; the whole region is dropped
// wholesale by `close`, which needs exclusive access and therefore cannot run while any
// slice is still borrowed.
//
// The region also enforces a byte budget. Requests that would exceed it fail with
// `LdError::OutOfMemory` before any memory is touched, and the block-sizing code in
// `block.rs` asks `remaining()` how much room is left before choosing batch sizes.

use crate::error::LdError;
use bumpalo::Bump;
use log::debug;
use std::cell::Cell;
use std::mem::size_of;

/// Environment override for the default budget, in bytes.
pub const MEMORY_BUDGET_ENV: &str = "LDEPI_MEMORY_BUDGET_BYTES";

/// Used when neither the environment nor the system can tell us anything useful.
const FALLBACK_BUDGET_BYTES: usize = 1 << 30;

pub struct Region {
    bump: Bump,
    budget: usize,
    used: Cell<usize>,
}

impl Region {
    pub fn with_budget(budget: usize) -> Self {
        Self {
            bump: Bump::new(),
            budget,
            used: Cell::new(0),
        }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.budget.saturating_sub(self.used.get())
    }

    /// Returns `len` zero-initialised values of `T`, charged against the budget.
    pub fn alloc_zeroed<T: Copy + Default>(
        &self,
        what: &'static str,
        len: usize,
    ) -> Result<&mut [T], LdError> {
        let requested = len.checked_mul(size_of::<T>()).ok_or(LdError::OutOfMemory {
            what,
            requested: usize::MAX,
            available: self.remaining(),
        })?;
        if requested > self.remaining() {
            return Err(LdError::OutOfMemory {
                what,
                requested,
                available: self.remaining(),
            });
        }
        self.used.set(self.used.get() + requested);
        Ok(self.bump.alloc_slice_fill_copy(len, T::default()))
    }

    /// Releases everything handed out so far. The budget is restored in full.
    pub fn close(&mut self) {
        debug!(
            "closing region: {} of {} budgeted bytes were in use",
            self.used.get(),
            self.budget
        );
        self.bump.reset();
        self.used.set(0);
    }
}

/// Resolves the working-memory budget for a command.
///
/// An explicit request wins, then `LDEPI_MEMORY_BUDGET_BYTES`, then half of the memory
/// the operating system reports as available.
pub fn resolve_memory_budget(requested: Option<usize>) -> usize {
    if let Some(bytes) = requested {
        return bytes;
    }
    if let Ok(raw) = std::env::var(MEMORY_BUDGET_ENV) {
        if let Ok(bytes) = raw.trim().parse::<usize>() {
            return bytes;
        }
        log::warn!("ignoring unparseable {MEMORY_BUDGET_ENV}={raw:?}");
    }
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let available = system.available_memory() as usize;
    if available == 0 {
        FALLBACK_BUDGET_BYTES
    } else {
        available / 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_charged_against_the_budget() {
        let region = Region::with_budget(1024);
        let words = region.alloc_zeroed::<u64>("words", 64).unwrap();
        assert!(words.iter().all(|&w| w == 0));
        assert_eq!(region.remaining(), 1024 - 64 * 8);

        let err = region.alloc_zeroed::<u64>("too many", 65).unwrap_err();
        match err {
            LdError::OutOfMemory {
                what, requested, ..
            } => {
                assert_eq!(what, "too many");
                assert_eq!(requested, 65 * 8);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn close_restores_the_full_budget() {
        let mut region = Region::with_budget(256);
        {
            let _ = region.alloc_zeroed::<u32>("scratch", 32).unwrap();
        }
        assert_eq!(region.remaining(), 128);
        region.close();
        assert_eq!(region.remaining(), 256);
    }

    #[test]
    fn explicit_budget_wins() {
        assert_eq!(resolve_memory_budget(Some(4096)), 4096);
    }
}
