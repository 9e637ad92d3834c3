//! The solution execution context.
//!
//! [`SolutionContext`] owns everything one rank needs to run a stencil
//! solution: the settings and their phase, the grids, the work packs, the
//! thread hierarchy, the buffers, and the timers. Everything that depends on
//! the machine or the cluster is reached through collaborator traits, so the
//! same lifecycle runs on a single rank, on a [`LocalCluster`] of threads, or
//! on a real transport.
//!
//! # Lifecycle
//!
//! ```text
//! configure (set, add_grid, apply_command_line_options)
//!     │
//!     ▼
//! prepare() ──► run steps, timing them ──► report() ──► ... ──► end()
//!     ▲                                                          │
//!     └──────────────── any domain-affecting set() ◄─────────────┘
//! ```
//!
//! # Examples
//!
//! ```rust
//! use solnctx::{Dims, Grid, Query, SizeSetting, SolutionContext};
//!
//! # fn main() -> solnctx::Result<()> {
//! let mut ctx = SolutionContext::new("heat", Dims::new("t", ["x", "y"]));
//! ctx.set(SizeSetting::RankDomainSize, "x", 32)?;
//! ctx.set(SizeSetting::RankDomainSize, "y", 16)?;
//! ctx.run_options_mut().max_threads = 2;
//! let temp = ctx.add_grid(Grid::new("temp", ["t", "x", "y"]), true)?;
//!
//! ctx.prepare()?;
//! assert!(temp.is_storage_allocated());
//! assert_eq!(ctx.get(Query::LastRankDomainIndex, "x")?, 31);
//!
//! ctx.end()?;
//! assert!(!temp.is_storage_allocated());
//! # Ok(())
//! # }
//! ```
//!
//! [`LocalCluster`]: crate::env::LocalCluster

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::alloc::{AllocCategory, Allocator, Buffer, MmapAllocator};
use crate::comm::{HaloTransport, NullTransport};
use crate::dims::Dims;
use crate::env::{Environment, SingleRank};
use crate::error::Result;
use crate::grid::{Grid, GridPtr, GridRegistry, GridSizer, PaddedDomainSizer};
use crate::options::{self, OptionAction};
use crate::pack::WorkPack;
use crate::partition::{Partitioner, RankLayout, UniformPartitioner};
use crate::settings::{Phase, Query, RankBoxes, RunOptions, SettingStore, Settings, SizeSetting};
use crate::stats::{PackSample, RawTimes, ReportInputs, StatsReport};
use crate::threads::{ThreadCounts, ThreadHierarchy};
use crate::timer::Timer;

/// Timers the run loop drives.
///
/// They overlap: `run` contains everything, `halo` contains `wait`, and
/// `test` is sampled inside interior compute on one region thread.
#[derive(Debug, Clone, Default)]
pub struct RunTimers {
    /// Whole steps.
    pub run: Timer,
    /// Rank-exterior compute.
    pub exterior: Timer,
    /// Rank-interior compute.
    pub interior: Timer,
    /// Halo exchange.
    pub halo: Timer,
    /// Waiting for halo messages.
    pub wait: Timer,
    /// Polling for halo messages.
    pub test: Timer,
}

impl RunTimers {
    /// Clears every timer.
    pub fn clear(&mut self) {
        for timer in [
            &mut self.run,
            &mut self.exterior,
            &mut self.interior,
            &mut self.halo,
            &mut self.wait,
            &mut self.test,
        ] {
            timer.clear();
        }
    }

    /// Current readings in seconds.
    pub fn raw(&self) -> RawTimes {
        RawTimes {
            run: self.run.elapsed_secs(),
            halo: self.halo.elapsed_secs(),
            wait: self.wait.elapsed_secs(),
            exterior: self.exterior.elapsed_secs(),
            interior: self.interior.elapsed_secs(),
            test: self.test.elapsed_secs(),
        }
    }
}

/// Memory and domain totals recorded by the last `prepare()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceTotals {
    /// Bytes allocated on this rank.
    pub rank_bytes: u64,
    /// Bytes allocated over all ranks.
    pub total_bytes: u64,
    /// Domain points owned by this rank.
    pub rank_domain_points: u64,
    /// Domain points over all ranks.
    pub total_domain_points: u64,
}

fn as_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// Execution context of one rank of a stencil solution.
pub struct SolutionContext {
    name: String,
    store: SettingStore,
    grids: GridRegistry,
    packs: Vec<WorkPack>,

    env: Box<dyn Environment>,
    allocator: Box<dyn Allocator>,
    partitioner: Box<dyn Partitioner>,
    sizer: Box<dyn GridSizer>,
    transport: Box<dyn HaloTransport>,

    scratch: Vec<Buffer>,
    comm: Vec<Buffer>,
    threads: Option<ThreadHierarchy>,

    timers: RunTimers,
    alloc_timer: Timer,
    steps_done: u64,
    totals: ResourceTotals,
}

impl fmt::Debug for SolutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolutionContext")
            .field("name", &self.name)
            .field("phase", &self.store.phase())
            .field("grids", &self.grids.len())
            .field("packs", &self.packs.len())
            .field("threads", &self.threads)
            .field("steps_done", &self.steps_done)
            .field("totals", &self.totals)
            .finish_non_exhaustive()
    }
}

impl SolutionContext {
    /// Creates an unprepared context with default settings for `dims`.
    ///
    /// The collaborators default to a single rank, memory-mapped buffers, a
    /// uniform partition, padded-domain grid sizing, and no halo transport.
    pub fn new(name: &str, dims: Dims) -> Self {
        Self::from_settings(name, Settings::new(dims))
    }

    /// Creates an unprepared context from existing settings, e.g. ones
    /// loaded with [`Settings::from_json`].
    pub fn from_settings(name: &str, settings: Settings) -> Self {
        Self {
            name: name.to_string(),
            store: SettingStore::new(settings),
            grids: GridRegistry::new(),
            packs: Vec::new(),
            env: Box::new(SingleRank),
            allocator: Box::new(MmapAllocator::new()),
            partitioner: Box::new(UniformPartitioner::new()),
            sizer: Box::new(PaddedDomainSizer),
            transport: Box::new(NullTransport),
            scratch: Vec::new(),
            comm: Vec::new(),
            threads: None,
            timers: RunTimers::default(),
            alloc_timer: Timer::new(),
            steps_done: 0,
            totals: ResourceTotals::default(),
        }
    }

    /// Replaces the cluster environment.
    #[must_use]
    pub fn with_environment(mut self, env: impl Environment + 'static) -> Self {
        self.env = Box::new(env);
        self
    }

    /// Replaces the allocator.
    #[must_use]
    pub fn with_allocator(mut self, allocator: impl Allocator + 'static) -> Self {
        self.allocator = Box::new(allocator);
        self
    }

    /// Replaces the partitioner.
    #[must_use]
    pub fn with_partitioner(mut self, partitioner: impl Partitioner + 'static) -> Self {
        self.partitioner = Box::new(partitioner);
        self
    }

    /// Replaces the grid sizer.
    #[must_use]
    pub fn with_sizer(mut self, sizer: impl GridSizer + 'static) -> Self {
        self.sizer = Box::new(sizer);
        self
    }

    /// Replaces the halo transport.
    #[must_use]
    pub fn with_transport(mut self, transport: impl HaloTransport + 'static) -> Self {
        self.transport = Box::new(transport);
        self
    }

    /// Context name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.store.phase()
    }

    /// The global settings.
    pub fn settings(&self) -> &Settings {
        self.store.settings()
    }

    /// Run options; changes take effect at the next `prepare()`.
    pub fn run_options_mut(&mut self) -> &mut RunOptions {
        self.store.run_options_mut()
    }

    /// Bounding boxes of this rank. Check [`BoundingBox::valid`] before use.
    ///
    /// [`BoundingBox::valid`]: crate::bbox::BoundingBox::valid
    pub fn boxes(&self) -> &RankBoxes {
        self.store.boxes()
    }

    /// The cluster environment.
    pub fn env(&self) -> &dyn Environment {
        self.env.as_ref()
    }

    /// Reads a per-dimension value.
    ///
    /// # Errors
    ///
    /// See [`SettingStore::get`].
    pub fn get(&self, query: Query, dim: &str) -> Result<i64> {
        self.store.get(query, dim)
    }

    /// Writes a per-dimension setting and re-sizes the grids.
    ///
    /// # Errors
    ///
    /// See [`SettingStore::set`].
    pub fn set(&mut self, setting: SizeSetting, dim: &str, value: i64) -> Result<()> {
        let Self {
            store, grids, sizer, ..
        } = self;
        store.set(setting, dim, value, |settings| {
            sizer.update_grid_info(settings, grids.grids());
        })
    }

    /// Applies every recognized option in `args` and returns the rest.
    ///
    /// See [`crate::options`] for the option names. If any value is
    /// malformed, nothing is applied.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SolnError::InvalidOption`] for a missing or malformed
    /// value.
    pub fn apply_command_line_options(&mut self, args: &str) -> Result<String> {
        let parsed = options::parse(args, &self.store.settings().dims)?;
        for action in &parsed.actions {
            match action {
                OptionAction::Size {
                    setting,
                    dims,
                    value,
                } => {
                    for dim in dims {
                        self.set(*setting, dim, *value)?;
                    }
                }
                OptionAction::Count(opt, value) => opt.apply(self.store.run_options_mut(), *value),
                OptionAction::OverlapComms(on) => self.store.run_options_mut().overlap_comms = *on,
            }
        }
        Ok(parsed.leftover_string())
    }

    /// Registers a grid and sizes it from the current settings.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SolnError::DuplicateName`] if the name is taken.
    pub fn add_grid(&mut self, grid: Grid, is_output: bool) -> Result<GridPtr> {
        self.add_grid_ptr(Arc::new(grid), is_output)
    }

    /// Registers an already shared grid handle.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SolnError::DuplicateName`] if the name is taken.
    pub fn add_grid_ptr(&mut self, grid: GridPtr, is_output: bool) -> Result<GridPtr> {
        self.grids.add(Arc::clone(&grid), is_output)?;
        self.sizer
            .update_grid_info(self.store.settings(), std::slice::from_ref(&grid));
        debug!(context = %self.name, grid = grid.name(), is_output, "grid added");
        Ok(grid)
    }

    /// Looks up a grid by name.
    pub fn grid(&self, name: &str) -> Option<&GridPtr> {
        self.grids.get(name)
    }

    /// The grid registry.
    pub fn grids(&self) -> &GridRegistry {
        &self.grids
    }

    /// Appends a work pack. Packs are reported in the order they were added.
    pub fn add_pack(&mut self, pack: WorkPack) {
        self.packs.push(pack);
    }

    /// Work packs in registration order.
    pub fn packs(&self) -> &[WorkPack] {
        &self.packs
    }

    /// Mutable access to the pack at `index`.
    pub fn pack_mut(&mut self, index: usize) -> Option<&mut WorkPack> {
        self.packs.get_mut(index)
    }

    /// Prepares the solution for running.
    ///
    /// All ranks must call this together. Any previous preparation is
    /// discarded, including per-pack setting overrides. Steps, in order:
    ///
    /// 1. wait for every rank, drop to UNPREPARED, clear the timers
    /// 2. adjust the settings, re-size the grids, copy settings into packs
    /// 3. build and warm up the thread hierarchy
    /// 4. lay out this rank and allocate its buffers
    /// 5. sum the totals over ranks and enter PREPARED
    ///
    /// # Errors
    ///
    /// Returns [`crate::SolnError::ThreadPool`] or
    /// [`crate::SolnError::Allocation`]; the context stays UNPREPARED.
    pub fn prepare(&mut self) -> Result<()> {
        self.env.global_barrier();
        self.store.invalidate();
        self.clear_timers();

        if self.store.adjust() {
            debug!(context = %self.name, "settings adjusted");
        }
        self.sizer
            .update_grid_info(self.store.settings(), self.grids.grids());
        for pack in &mut self.packs {
            pack.reset_local_settings(self.store.settings());
        }

        let counts = ThreadCounts::from_options(&self.store.settings().run);
        info!(
            context = %self.name,
            total = counts.total,
            region = counts.region,
            block = counts.block,
            "configuring threads"
        );
        // Drop the old pools before spawning new ones.
        self.threads = None;
        let threads = ThreadHierarchy::build(counts)?;
        threads.warm_up();
        self.threads = Some(threads);

        let layout = self
            .partitioner
            .setup_rank(self.store.settings(), self.env.as_ref(), counts.region);

        self.alloc_timer.clear();
        self.alloc_timer.start();
        let allocated = self.allocate(&layout);
        self.alloc_timer.stop();
        let rank_bytes = allocated?;

        let rank_domain_points = layout.boxes.rank_bb.num_points();
        self.totals = ResourceTotals {
            rank_bytes,
            total_bytes: self.env.sum_over_ranks(rank_bytes),
            rank_domain_points,
            total_domain_points: self.env.sum_over_ranks(rank_domain_points),
        };
        info!(
            context = %self.name,
            rank_bytes = self.totals.rank_bytes,
            total_bytes = self.totals.total_bytes,
            rank_domain_points = self.totals.rank_domain_points,
            total_domain_points = self.totals.total_domain_points,
            alloc_secs = self.alloc_timer.elapsed_secs(),
            "solution prepared"
        );
        for pack in &self.packs {
            let cost = pack.cost();
            debug!(
                pack = pack.name(),
                reads_per_step = cost.reads,
                writes_per_step = cost.writes,
                fpops_per_step = cost.fpops,
                "pack work"
            );
        }

        self.store.mark_prepared(layout.boxes);
        Ok(())
    }

    // Frees transient buffers, then allocates grids, scratch, and comm
    // buffers in that order. Returns the bytes held afterwards.
    fn allocate(&mut self, layout: &RankLayout) -> Result<u64> {
        let alloc = self.allocator.as_mut();

        for buffer in self.scratch.drain(..) {
            alloc.free(AllocCategory::Scratch, buffer);
        }
        for buffer in self.comm.drain(..) {
            alloc.free(AllocCategory::Comm, buffer);
        }

        let mut bytes = 0;
        for grid in self.grids.grids() {
            let stale = !grid.is_shared()
                && grid
                    .storage_len()
                    .is_some_and(|len| len != grid.num_elements());
            if stale {
                grid.release_storage(alloc);
            }
            grid.alloc_storage(alloc)?;
            debug!(grid = grid.name(), bytes = grid.num_storage_bytes(), shared = grid.is_shared(), "grid storage");
            bytes += grid.num_storage_bytes();
        }
        for &len in &layout.scratch_sizes {
            let buffer = alloc.alloc(AllocCategory::Scratch, len)?;
            bytes += buffer.num_bytes();
            self.scratch.push(buffer);
        }
        for &len in &layout.comm_sizes {
            let buffer = alloc.alloc(AllocCategory::Comm, len)?;
            bytes += buffer.num_bytes();
            self.comm.push(buffer);
        }
        Ok(as_u64(bytes))
    }

    /// Totals recorded by the last `prepare()`.
    pub fn totals(&self) -> ResourceTotals {
        self.totals
    }

    /// Wall time the last `prepare()` spent allocating.
    pub fn alloc_time(&self) -> &Timer {
        &self.alloc_timer
    }

    /// Thread hierarchy, present between `prepare()` and `end()`.
    pub fn threads(&self) -> Option<&ThreadHierarchy> {
        self.threads.as_ref()
    }

    /// Thread counts in use, or the counts the next `prepare()` would use.
    pub fn thread_counts(&self) -> ThreadCounts {
        self.threads.as_ref().map_or_else(
            || ThreadCounts::from_options(&self.store.settings().run),
            ThreadHierarchy::counts,
        )
    }

    /// Timers of the run loop.
    pub fn timers(&self) -> &RunTimers {
        &self.timers
    }

    /// Mutable timers for the run loop to drive.
    pub fn timers_mut(&mut self) -> &mut RunTimers {
        &mut self.timers
    }

    /// Counts `n` completed solution steps.
    pub fn record_steps(&mut self, n: u64) {
        self.steps_done += n;
    }

    /// Steps completed since the last report.
    pub fn steps_done(&self) -> u64 {
        self.steps_done
    }

    /// Communication buffers handed to the halo transport.
    pub fn comm_buffers(&self) -> &[Buffer] {
        &self.comm
    }

    /// Scratch buffers, one per region thread with the default partitioner.
    pub fn scratch_buffers_mut(&mut self) -> &mut [Buffer] {
        &mut self.scratch
    }

    /// Reconciles the timers into a report, then clears them.
    ///
    /// Points are cluster-wide totals; times are this rank's.
    pub fn report(&mut self) -> StatsReport {
        let inputs = ReportInputs {
            raw: self.timers.raw(),
            region_threads: self.thread_counts().region,
            steps_done: self.steps_done,
            domain_points: self.totals.total_domain_points,
            packs: self
                .packs
                .iter()
                .map(|p| PackSample {
                    name: p.name().to_string(),
                    steps: p.steps_done(),
                    cost: p.cost(),
                    elapsed: p.timer.elapsed_secs(),
                })
                .collect(),
        };
        let report = StatsReport::build(&inputs);
        if report.nsteps > 0 {
            info!(context = %self.name, "solution stats:\n{report}");
        }
        self.clear_timers();
        report
    }

    /// Clears the run timers, the step counter, and every pack's stats.
    pub fn clear_timers(&mut self) {
        self.timers.clear();
        self.steps_done = 0;
        for pack in &mut self.packs {
            pack.clear_stats();
        }
    }

    /// Finishes the run and releases what `prepare()` acquired.
    ///
    /// All ranks must call this together. In-flight halos are completed
    /// first. Safe to call without a prior `prepare()`.
    ///
    /// # Errors
    ///
    /// Propagates a halo transport failure; nothing is released then.
    pub fn end(&mut self) -> Result<()> {
        self.transport
            .exchange_halos(&mut self.comm, self.env.as_ref())?;
        self.env.global_barrier();

        let alloc = self.allocator.as_mut();
        for buffer in self.comm.drain(..) {
            alloc.free(AllocCategory::Comm, buffer);
        }
        for buffer in self.scratch.drain(..) {
            alloc.free(AllocCategory::Scratch, buffer);
        }
        let released = self
            .grids
            .grids()
            .iter()
            .filter(|grid| grid.release_storage(alloc))
            .count();

        self.threads = None;
        self.store.invalidate();
        info!(context = %self.name, released_grids = released, "solution ended");
        Ok(())
    }

    /// Makes every grid that also exists in `source` alias its storage.
    ///
    /// Grids without a namesake in `source` are untouched. Returns the number
    /// of grids now sharing storage.
    ///
    /// # Errors
    ///
    /// Returns [`crate::SolnError::NoStorage`] if a matching grid in `source`
    /// has no storage; grids handled before it stay shared.
    pub fn share_storage(&mut self, source: &SolutionContext) -> Result<usize> {
        let mut shared = 0;
        for grid in self.grids.grids() {
            let Some(src) = source.grid(grid.name()) else {
                continue;
            };
            grid.share_storage(src, self.allocator.as_mut())?;
            debug!(context = %self.name, source = %source.name, grid = grid.name(), "sharing storage");
            shared += 1;
        }
        Ok(shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SolnError;
    use std::time::Duration;

    /// Serves a fixed number of allocations, then fails.
    struct LimitedAllocator {
        remaining: usize,
        inner: MmapAllocator,
    }

    impl LimitedAllocator {
        fn new(remaining: usize) -> Self {
            Self {
                remaining,
                inner: MmapAllocator::new(),
            }
        }
    }

    impl Allocator for LimitedAllocator {
        fn alloc(&mut self, category: AllocCategory, len: usize) -> Result<Buffer> {
            if self.remaining == 0 {
                return Err(SolnError::Allocation {
                    category: category.as_str(),
                    bytes: len.saturating_mul(8),
                    source: std::io::Error::from(std::io::ErrorKind::OutOfMemory),
                });
            }
            self.remaining -= 1;
            self.inner.alloc(category, len)
        }

        fn free(&mut self, category: AllocCategory, buffer: Buffer) {
            self.inner.free(category, buffer);
        }
    }

    fn small_ctx(name: &str) -> SolutionContext {
        let mut ctx = SolutionContext::new(name, Dims::new("t", ["x", "y"]));
        ctx.run_options_mut().max_threads = 2;
        ctx.set(SizeSetting::RankDomainSize, "x", 8).unwrap();
        ctx.set(SizeSetting::RankDomainSize, "y", 4).unwrap();
        ctx
    }

    #[test]
    fn test_grid_is_sized_on_add_and_on_set() {
        let mut ctx = small_ctx("c");
        let u = ctx.add_grid(Grid::new("u", ["t", "x", "y"]), false).unwrap();
        assert_eq!(u.num_elements(), 2 * 8 * 4);

        ctx.set(SizeSetting::MinPadSize, "x", 1).unwrap();
        assert_eq!(u.num_elements(), 2 * 10 * 4);
    }

    #[test]
    fn test_prepare_sets_boxes_and_totals() {
        let mut ctx = small_ctx("c");
        ctx.add_grid(Grid::new("u", ["x", "y"]), true).unwrap();
        ctx.prepare().unwrap();

        assert_eq!(ctx.phase(), Phase::Prepared);
        assert!(ctx.boxes().rank_bb.valid);
        assert_eq!(ctx.get(Query::OverallDomainSize, "x").unwrap(), 8);
        assert_eq!(ctx.get(Query::FirstRankDomainIndex, "y").unwrap(), 0);
        assert_eq!(ctx.get(Query::LastRankDomainIndex, "y").unwrap(), 3);
        // Region and block sizes were filled in from the rank size.
        assert_eq!(ctx.get(Query::BlockSize, "x").unwrap(), 8);

        let totals = ctx.totals();
        assert_eq!(totals.rank_domain_points, 32);
        assert_eq!(totals.total_domain_points, 32);
        assert_eq!(totals.rank_bytes, 32 * 8);
        assert!(ctx.threads().is_some());
    }

    #[test]
    fn test_reprepare_reallocates_resized_grid() {
        let mut ctx = small_ctx("c");
        let u = ctx.add_grid(Grid::new("u", ["x"]), false).unwrap();
        ctx.prepare().unwrap();
        assert_eq!(u.storage_len(), Some(8));

        ctx.set(SizeSetting::RankDomainSize, "x", 16).unwrap();
        assert_eq!(ctx.phase(), Phase::Unprepared);
        ctx.prepare().unwrap();
        assert_eq!(u.storage_len(), Some(16));
    }

    #[test]
    fn test_failed_reprepare_leaves_context_unprepared() {
        let mut ctx = small_ctx("c").with_allocator(LimitedAllocator::new(1));
        let u = ctx.add_grid(Grid::new("u", ["x", "y"]), true).unwrap();
        ctx.prepare().unwrap();
        assert_eq!(ctx.get(Query::OverallDomainSize, "x").unwrap(), 8);

        // Padding does not reset the phase, but it does resize the grid.
        ctx.set(SizeSetting::MinPadSize, "x", 1).unwrap();
        assert_eq!(ctx.phase(), Phase::Prepared);

        let err = ctx.prepare().unwrap_err();
        assert!(matches!(err, SolnError::Allocation { category: "grid", .. }));
        assert_eq!(ctx.phase(), Phase::Unprepared);
        assert!(!ctx.boxes().rank_bb.valid);
        assert!(!ctx.boxes().ext_bb.valid);
        assert!(!u.is_storage_allocated());
        assert!(matches!(
            ctx.get(Query::OverallDomainSize, "x"),
            Err(SolnError::NotPrepared { .. })
        ));
    }

    #[test]
    fn test_oversized_domain_fails_at_prepare() {
        let mut ctx = SolutionContext::new("c", Dims::new("t", ["x", "y", "z"]));
        ctx.run_options_mut().max_threads = 1;
        let u = ctx.add_grid(Grid::new("u", ["t", "x", "y", "z"]), true).unwrap();

        ctx.set(SizeSetting::RankDomainSize, "x", i64::MAX / 4).unwrap();
        ctx.apply_command_line_options("-dy 3000000000 -dz 3000000000").unwrap();
        assert_eq!(u.num_elements(), usize::MAX);

        let err = ctx.prepare().unwrap_err();
        assert!(matches!(err, SolnError::Allocation { category: "grid", .. }));
        assert_eq!(ctx.phase(), Phase::Unprepared);
        assert!(!u.is_storage_allocated());
    }

    #[test]
    fn test_reprepare_resets_pack_overrides() {
        let mut ctx = small_ctx("c");
        ctx.add_pack(WorkPack::new("p", crate::pack::StepCost::default()));
        ctx.prepare().unwrap();

        ctx.pack_mut(0)
            .and_then(WorkPack::local_settings_mut)
            .unwrap()
            .set_value(SizeSetting::BlockSize, "x", 2);
        ctx.prepare().unwrap();
        let local = ctx.packs()[0].local_settings().unwrap();
        assert_eq!(local, ctx.settings());
    }

    #[test]
    fn test_report_clears_counters() {
        let mut ctx = small_ctx("c");
        ctx.prepare().unwrap();
        ctx.timers_mut().run.add(Duration::from_secs(2));
        ctx.record_steps(4);

        let first = ctx.report();
        assert_eq!(first.nsteps, 4);
        assert!((first.times.run - 2.0).abs() < 1e-9);

        let second = ctx.report();
        assert_eq!(second.nsteps, 0);
        assert_eq!(second.times.run, 0.0);
        assert_eq!(ctx.steps_done(), 0);
    }

    #[test]
    fn test_options_apply_and_return_leftovers() {
        let mut ctx = small_ctx("c");
        let rest = ctx
            .apply_command_line_options("-d 20 --bx 5 app-flag --block_threads 2 -no-overlap_comms 7")
            .unwrap();
        assert_eq!(rest, "app-flag 7");
        assert_eq!(ctx.get(Query::RankDomainSize, "y").unwrap(), 20);
        assert_eq!(ctx.get(Query::BlockSize, "x").unwrap(), 5);
        assert_eq!(ctx.settings().run.block_threads, 2);
        assert!(!ctx.settings().run.overlap_comms);
    }

    #[test]
    fn test_options_error_applies_nothing() {
        let mut ctx = small_ctx("c");
        let err = ctx.apply_command_line_options("--dx 12 --dy").unwrap_err();
        assert!(matches!(err, SolnError::InvalidOption { ref name, .. } if name == "dy"));
        assert_eq!(ctx.get(Query::RankDomainSize, "x").unwrap(), 8);
    }

    #[test]
    fn test_thread_counts_follow_hierarchy() {
        let mut ctx = small_ctx("c");
        ctx.run_options_mut().block_threads = 2;
        let before = ctx.thread_counts();
        assert_eq!((before.region, before.block), (1, 2));
        ctx.prepare().unwrap();
        assert_eq!(ctx.thread_counts(), before);
        ctx.end().unwrap();
        assert!(ctx.threads().is_none());
    }
}
