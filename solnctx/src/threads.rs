//! Two-level worker hierarchy.
//!
//! Work is spread over `region` outer threads; each outer thread owns a pool
//! of `block` inner threads for nested loops. The outer count is chosen once
//! in `prepare()` and stays fixed until `end()`, so outer parallel sections
//! always see the same number of workers.

use rayon::ThreadPool;
use rayon::prelude::*;
use serde::Serialize;

use crate::error::Result;
use crate::settings::RunOptions;

/// Iterations of the throw-away warm-up loop per region thread.
const WARMUP_ITERS_PER_THREAD: usize = 100;

/// Thread counts of the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThreadCounts {
    /// All compute threads, `region * block`.
    pub total: usize,
    /// Outer threads.
    pub region: usize,
    /// Inner threads per outer thread.
    pub block: usize,
}

impl ThreadCounts {
    /// Derives the hierarchy shape from the run options.
    ///
    /// `max_threads == 0` means the hardware parallelism.
    pub fn from_options(run: &RunOptions) -> Self {
        let max = if run.max_threads == 0 {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        } else {
            run.max_threads
        };
        let avail = (max / run.thread_divisor.max(1)).max(1);
        let block = run.block_threads.clamp(1, avail);
        let region = (avail / block).max(1);
        Self {
            total: region * block,
            region,
            block,
        }
    }
}

/// Outer pool plus one inner pool per outer thread.
pub struct ThreadHierarchy {
    counts: ThreadCounts,
    outer: ThreadPool,
    inner: Vec<ThreadPool>,
}

impl std::fmt::Debug for ThreadHierarchy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHierarchy")
            .field("counts", &self.counts)
            .finish_non_exhaustive()
    }
}

impl ThreadHierarchy {
    /// Builds the pools.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SolnError::ThreadPool`] if a pool cannot be built.
    pub fn build(counts: ThreadCounts) -> Result<Self> {
        let outer = rayon::ThreadPoolBuilder::new()
            .num_threads(counts.region)
            .thread_name(|i| format!("solnctx-region-{i}"))
            .build()?;
        let inner = (0..counts.region)
            .map(|r| {
                rayon::ThreadPoolBuilder::new()
                    .num_threads(counts.block)
                    .thread_name(move |i| format!("solnctx-block-{r}.{i}"))
                    .build()
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            counts,
            outer,
            inner,
        })
    }

    /// Thread counts.
    pub fn counts(&self) -> ThreadCounts {
        self.counts
    }

    /// Runs a no-op workload over every pool so thread start-up cost is paid
    /// before any timer runs.
    pub fn warm_up(&self) {
        let iters = i64::try_from(self.counts.region * WARMUP_ITERS_PER_THREAD).unwrap_or(i64::MAX);
        self.parallel_for(0, iters, 1, |_, _, _| {});
        self.outer.install(|| {
            self.inner.par_iter().for_each(|pool| {
                pool.broadcast(|_| ());
            });
        });
    }

    /// Splits `[begin, end)` into chunks of `step` and runs them on the outer
    /// threads.
    ///
    /// `f` receives `(start, stop, region_thread)`; `region_thread` selects
    /// the inner pool via [`ThreadHierarchy::block_pool`].
    pub fn parallel_for<F>(&self, begin: i64, end: i64, step: i64, f: F)
    where
        F: Fn(i64, i64, usize) + Sync + Send,
    {
        let step = step.max(1);
        let span = (end - begin).max(0);
        let chunks = (span + step - 1) / step;
        self.outer.install(|| {
            (0..chunks).into_par_iter().for_each(|k| {
                let start = begin + k * step;
                let stop = (start + step).min(end);
                let thread = rayon::current_thread_index().unwrap_or(0);
                f(start, stop, thread);
            });
        });
    }

    /// Inner pool of region thread `region`.
    pub fn block_pool(&self, region: usize) -> Option<&ThreadPool> {
        self.inner.get(region)
    }
}
