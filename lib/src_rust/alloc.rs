//! Allocation accounting.
//!
//! Every heap-allocated subtree registers itself in a process-wide counter
//! so that leaks and double frees show up as a drifting baseline. Parses
//! can additionally be bounded by an [`AllocationBudget`].

use std::{
    collections::TryReserveError,
    sync::atomic::{AtomicUsize, Ordering},
};

use thiserror::Error;

static LIVE_SUBTREES: AtomicUsize = AtomicUsize::new(0);

/// The number of heap-allocated subtrees currently alive in this process.
pub fn live_subtree_count() -> usize {
    LIVE_SUBTREES.load(Ordering::SeqCst)
}

/// A registration in the live-subtree counter. Embedding one in a struct
/// makes every construction, clone and drop of that struct counted.
#[derive(Debug)]
pub(crate) struct LiveAllocation(());

impl LiveAllocation {
    pub(crate) fn register() -> Self {
        LIVE_SUBTREES.fetch_add(1, Ordering::Relaxed);
        Self(())
    }
}

impl Clone for LiveAllocation {
    fn clone(&self) -> Self {
        Self::register()
    }
}

impl Drop for LiveAllocation {
    fn drop(&mut self) {
        LIVE_SUBTREES.fetch_sub(1, Ordering::Release);
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("allocation budget of {limit} nodes exhausted")]
    BudgetExhausted { limit: usize },
    #[error("out of memory while growing the parse stack")]
    OutOfMemory,
}

impl From<TryReserveError> for AllocationError {
    fn from(_: TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

/// An upper bound on the number of stack nodes a single parse may create.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocationBudget {
    limit: Option<usize>,
    used: usize,
}

impl AllocationBudget {
    #[must_use]
    pub const fn new(limit: Option<usize>) -> Self {
        Self { limit, used: 0 }
    }

    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    pub fn reset(&mut self) {
        self.used = 0;
    }

    pub fn charge(&mut self, count: usize) -> Result<(), AllocationError> {
        let used = self.used.saturating_add(count);
        if let Some(limit) = self.limit {
            if used > limit {
                return Err(AllocationError::BudgetExhausted { limit });
            }
        }
        self.used = used;
        Ok(())
    }
}
