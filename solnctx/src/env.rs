//! Cross-rank environment: rank identity, barrier, and sum-reduction.
//!
//! The context only needs three collective operations from whatever
//! transport connects the ranks. [`SingleRank`] is the trivial environment
//! for one process; [`LocalCluster`] runs several ranks as threads of one
//! process, which is enough to exercise the collective ordering in tests and
//! in the CLI.
//!
//! Collectives have no timeout. A rank that never arrives stalls every other
//! rank.

use std::sync::{Arc, Barrier};

use parking_lot::Mutex;

/// Collective operations shared by all ranks of a run.
pub trait Environment: Send {
    /// Number of ranks in the run.
    fn num_ranks(&self) -> usize;

    /// Index of this rank, in `0..num_ranks()`.
    fn rank_index(&self) -> usize;

    /// Blocks until every rank has called this.
    fn global_barrier(&self);

    /// Returns the sum of `value` over all ranks. Collective.
    fn sum_over_ranks(&self, value: u64) -> u64;
}

/// Environment of a run with exactly one rank.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleRank;

impl Environment for SingleRank {
    fn num_ranks(&self) -> usize {
        1
    }

    fn rank_index(&self) -> usize {
        0
    }

    fn global_barrier(&self) {}

    fn sum_over_ranks(&self, value: u64) -> u64 {
        value
    }
}

#[derive(Debug)]
struct ClusterShared {
    barrier: Barrier,
    slots: Mutex<Vec<u64>>,
}

/// In-process cluster whose ranks are threads.
///
/// # Examples
///
/// ```rust
/// use solnctx::env::{Environment, LocalCluster};
/// use std::thread;
///
/// let totals: Vec<u64> = LocalCluster::ranks(3)
///     .into_iter()
///     .map(|rank| thread::spawn(move || rank.sum_over_ranks(rank.rank_index() as u64 + 1)))
///     .collect::<Vec<_>>()
///     .into_iter()
///     .map(|h| h.join().unwrap())
///     .collect();
/// assert_eq!(totals, [6, 6, 6]);
/// ```
#[derive(Debug, Clone)]
pub struct LocalCluster {
    index: usize,
    size: usize,
    shared: Arc<ClusterShared>,
}

impl LocalCluster {
    /// Creates one environment per rank. Each must be moved to its own thread.
    pub fn ranks(size: usize) -> Vec<Self> {
        let size = size.max(1);
        let shared = Arc::new(ClusterShared {
            barrier: Barrier::new(size),
            slots: Mutex::new(vec![0; size]),
        });
        (0..size)
            .map(|index| Self {
                index,
                size,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Environment for LocalCluster {
    fn num_ranks(&self) -> usize {
        self.size
    }

    fn rank_index(&self) -> usize {
        self.index
    }

    fn global_barrier(&self) {
        self.shared.barrier.wait();
    }

    fn sum_over_ranks(&self, value: u64) -> u64 {
        self.shared.slots.lock()[self.index] = value;
        self.shared.barrier.wait();
        let total = self.shared.slots.lock().iter().sum();
        // Nobody may overwrite a slot until every rank has read the total.
        self.shared.barrier.wait();
        total
    }
}
