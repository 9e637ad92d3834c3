//! # solnctx
//!
//! Execution context for distributed stencil solutions.
//!
//! solnctx owns the run-time side of a stencil solver on one rank: typed
//! per-dimension settings, the grids and their storage, a two-level worker
//! thread hierarchy, and the timers whose readings become a performance
//! report. The numerical kernels, the compiler that produces them, and the
//! message transport are outside the crate and plug in through traits.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Settings are checked against the kind of dimension they address
//! - Domain-affecting changes drop a prepared solution back to unprepared
//! - Resources are allocated in a fixed order on every `prepare()`
//! - Grid storage can be aliased between contexts
//! - Overlapping timer samples are reconciled into a consistent breakdown
//!
//! ## Quick Start
//!
//! ```rust
//! use solnctx::{Dims, Grid, SizeSetting, SolutionContext, StepCost, WorkPack};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut ctx = SolutionContext::new("wave", Dims::new("t", ["x", "y", "z"]));
//! let rest = ctx.apply_command_line_options("-d 16 --bx 8 -max_threads 2 --my-flag")?;
//! assert_eq!(rest, "--my-flag");
//!
//! ctx.add_grid(Grid::new("pressure", ["t", "x", "y", "z"]), true)?;
//! ctx.add_pack(WorkPack::new("update", StepCost { reads: 7, writes: 1, fpops: 13 }));
//! ctx.prepare()?;
//!
//! // The run loop times its steps.
//! ctx.timers_mut().run.start();
//! ctx.record_steps(1);
//! if let Some(pack) = ctx.pack_mut(0) {
//!     pack.add_steps(1);
//! }
//! ctx.timers_mut().run.stop();
//!
//! let report = ctx.report();
//! assert_eq!(report.nsteps, 1);
//! println!("{report}");
//!
//! ctx.end()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Core Types
//!
//! - [`SolutionContext`]: Lifecycle owner: configure, prepare, report, end
//! - [`Settings`]: Serializable per-dimension configuration and run options
//! - [`Grid`]: Named array whose storage the context manages
//! - [`WorkPack`]: Separately timed unit of work
//! - [`StatsReport`]: Reconciled timing and throughput snapshot
//!
//! ## Modules
//!
//! - [`context`]: The execution context
//! - [`settings`]: Settings, accessor tables, and the phase gate
//! - [`options`]: Free-text option parsing
//! - [`grid`]: Grids, storage sharing, registry, and sizing
//! - [`alloc`]: Buffers and allocators
//! - [`threads`]: Two-level thread hierarchy
//! - [`stats`]: Timer reconciliation and reports
//! - [`env`]: Rank environment: barrier and reductions
//! - [`partition`]: Per-rank layout
//! - [`comm`]: Halo transport
//! - [`dims`], [`bbox`], [`pack`], [`timer`]: Supporting types
//! - [`error`]: Error types

pub mod alloc;
pub mod bbox;
pub mod comm;
pub mod context;
pub mod dims;
pub mod env;
pub mod error;
pub mod grid;
pub mod options;
pub mod pack;
pub mod partition;
pub mod settings;
pub mod stats;
pub mod threads;
pub mod timer;

// Re-export primary API types at crate root for convenience.
pub use context::{ResourceTotals, RunTimers, SolutionContext};
pub use dims::{DimKind, Dims};
pub use error::{Result, SolnError};
pub use grid::{Grid, GridPtr};
pub use pack::{StepCost, WorkPack};
pub use settings::{Phase, Query, RunOptions, Settings, SizeSetting};
pub use stats::{StatsReport, TimeBreakdown};
pub use threads::ThreadCounts;
pub use timer::Timer;
