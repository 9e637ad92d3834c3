//! Telemetry reconciliation.
//!
//! The run loop samples its timers independently and some of them overlap:
//! halo time contains wait time, interior compute contains the time spent
//! polling for messages, and everything is contained in the run time.
//! Independent sampling means the raw numbers can be mutually inconsistent,
//! e.g. halo time slightly above run time. [`reconcile`] turns them into a
//! breakdown where
//!
//! - every field is non-negative,
//! - `wait <= halo_exchange <= run`,
//! - `compute + halo + other == run`.
//!
//! Compute time is then attributed to work packs in registration order by
//! [`allot`]. A pack registered late can end up with less than it measured
//! when earlier packs already used up the compute time; whatever is left
//! after the last pack is reported as other compute.

use std::fmt;

use serde::Serialize;

use crate::pack::StepCost;

/// Raw timer readings for one reporting interval, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RawTimes {
    /// Whole run, containing everything else.
    pub run: f64,
    /// Halo exchange, containing `wait`.
    pub halo: f64,
    /// Waiting for halo messages.
    pub wait: f64,
    /// Computing the rank exterior.
    pub exterior: f64,
    /// Computing the rank interior.
    pub interior: f64,
    /// Polling for messages, measured on one region thread only.
    pub test: f64,
}

/// Reconciled time breakdown, in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimeBreakdown {
    /// Run time.
    pub run: f64,
    /// Halo-exchange time, at most `run`.
    pub halo_exchange: f64,
    /// Wait time, at most `halo_exchange`.
    pub wait: f64,
    /// Exterior compute time.
    pub exterior: f64,
    /// Amortized message-polling time.
    pub test: f64,
    /// Interior compute time with polling removed.
    pub interior: f64,
    /// `exterior + interior`.
    pub compute: f64,
    /// `halo_exchange + test`.
    pub halo: f64,
    /// Run time not covered by compute or halo time.
    pub other: f64,
}

/// Reconciles raw timer readings.
///
/// Polling time is sampled on one region thread but overlaps the interior
/// compute of all of them, so it is divided by `region_threads` before it is
/// removed from interior time. A `region_threads` of zero is treated as one.
/// Negative readings are treated as zero.
///
/// # Examples
///
/// ```rust
/// use solnctx::stats::{RawTimes, reconcile};
///
/// let raw = RawTimes { run: 100.0, halo: 20.0, wait: 5.0, exterior: 30.0, interior: 45.0, test: 10.0 };
/// let t = reconcile(&raw, 5);
/// assert_eq!((t.compute, t.halo, t.other), (73.0, 22.0, 5.0));
/// ```
pub fn reconcile(raw: &RawTimes, region_threads: usize) -> TimeBreakdown {
    let run = raw.run.max(0.0);
    let halo_exchange = raw.halo.max(0.0).min(run);
    let wait = raw.wait.max(0.0).min(halo_exchange);
    let exterior = raw.exterior.max(0.0).min(run - halo_exchange);

    #[allow(clippy::cast_precision_loss)] // thread counts are tiny
    let divisor = region_threads.max(1) as f64;
    let room = run - halo_exchange - exterior;
    let test = (raw.test.max(0.0) / divisor).min(room);
    let interior = (raw.interior.max(0.0) - test).clamp(0.0, room - test);

    let compute = exterior + interior;
    let halo = halo_exchange + test;
    let other = (run - compute - halo).max(0.0);

    TimeBreakdown {
        run,
        halo_exchange,
        wait,
        exterior,
        test,
        interior,
        compute,
        halo,
        other,
    }
}

/// Splits `compute` seconds over packs in the given order.
///
/// Each pack gets what it measured, capped by what is still unallotted.
/// Returns the per-pack allotments and the unallotted remainder.
pub fn allot(compute: f64, pack_times: impl IntoIterator<Item = f64>) -> (Vec<f64>, f64) {
    let compute = compute.max(0.0);
    let mut allotted = 0.0;
    let shares = pack_times
        .into_iter()
        .map(|p| {
            let share = p.max(0.0).min(compute - allotted).max(0.0);
            allotted += share;
            share
        })
        .collect();
    (shares, (compute - allotted).max(0.0))
}

/// `count / secs`, or zero when no time elapsed.
pub fn rate(count: f64, secs: f64) -> f64 {
    if secs > 0.0 { count / secs } else { 0.0 }
}

#[allow(clippy::cast_precision_loss)] // rates only need approximate counts
fn as_f64(n: u64) -> f64 {
    n as f64
}

/// One pack's raw counters for a reporting interval.
#[derive(Debug, Clone)]
pub struct PackSample {
    /// Pack name.
    pub name: String,
    /// Steps done.
    pub steps: u64,
    /// Declared per-step cost.
    pub cost: StepCost,
    /// Measured seconds.
    pub elapsed: f64,
}

/// Everything needed to build a [`StatsReport`].
#[derive(Debug, Clone, Default)]
pub struct ReportInputs {
    /// Raw timer readings.
    pub raw: RawTimes,
    /// Region thread count.
    pub region_threads: usize,
    /// Steps done by the whole solution.
    pub steps_done: u64,
    /// Domain points summed over all ranks.
    pub domain_points: u64,
    /// Per-pack samples in registration order.
    pub packs: Vec<PackSample>,
}

/// Reconciled statistics of one pack.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PackStats {
    /// Pack name.
    pub name: String,
    /// Steps done.
    pub nsteps: u64,
    /// Declared reads per step.
    pub reads_per_step: u64,
    /// Declared writes per step.
    pub writes_per_step: u64,
    /// Declared floating-point ops per step.
    pub fpops_per_step: u64,
    /// Reads done.
    pub nreads: u64,
    /// Writes done.
    pub nwrites: u64,
    /// Floating-point ops done.
    pub nfpops: u64,
    /// Compute seconds attributed to this pack.
    pub run_time: f64,
    /// Reads per second.
    pub reads_ps: f64,
    /// Writes per second.
    pub writes_ps: f64,
    /// Floating-point ops per second.
    pub flops: f64,
    /// Points updated per second.
    pub pts_ps: f64,
}

/// Statistics for the interval since the previous report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsReport {
    /// Domain points over all ranks; a size, not summed over steps.
    pub domain_points: u64,
    /// Steps done.
    pub nsteps: u64,
    /// Reconciled times.
    pub times: TimeBreakdown,
    /// Reads done by all packs.
    pub nreads: u64,
    /// Writes done by all packs.
    pub nwrites: u64,
    /// Floating-point ops done by all packs.
    pub nfpops: u64,
    /// Reads per second of run time.
    pub reads_ps: f64,
    /// Writes per second of run time.
    pub writes_ps: f64,
    /// Floating-point ops per second of run time.
    pub flops: f64,
    /// Points updated per second of run time.
    pub pts_ps: f64,
    /// Per-pack statistics in registration order.
    pub packs: Vec<PackStats>,
    /// Compute seconds not attributed to any pack.
    pub other_compute_time: f64,
}

impl StatsReport {
    /// Reconciles the inputs into a report.
    pub fn build(inputs: &ReportInputs) -> Self {
        let times = reconcile(&inputs.raw, inputs.region_threads);
        let (shares, other_compute_time) =
            allot(times.compute, inputs.packs.iter().map(|p| p.elapsed));

        let mut report = Self {
            domain_points: inputs.domain_points,
            nsteps: inputs.steps_done,
            times,
            other_compute_time,
            ..Self::default()
        };

        for (sample, run_time) in inputs.packs.iter().zip(shares) {
            let ns = sample.steps;
            let mut ps = PackStats {
                name: sample.name.clone(),
                nsteps: ns,
                reads_per_step: sample.cost.reads,
                writes_per_step: sample.cost.writes,
                fpops_per_step: sample.cost.fpops,
                nreads: sample.cost.reads.saturating_mul(ns),
                nwrites: sample.cost.writes.saturating_mul(ns),
                nfpops: sample.cost.fpops.saturating_mul(ns),
                run_time,
                ..PackStats::default()
            };
            ps.reads_ps = rate(as_f64(ps.nreads), run_time);
            ps.writes_ps = rate(as_f64(ps.nwrites), run_time);
            ps.flops = rate(as_f64(ps.nfpops), run_time);
            ps.pts_ps = rate(as_f64(inputs.domain_points.saturating_mul(ns)), run_time);

            report.nreads = report.nreads.saturating_add(ps.nreads);
            report.nwrites = report.nwrites.saturating_add(ps.nwrites);
            report.nfpops = report.nfpops.saturating_add(ps.nfpops);
            report.packs.push(ps);
        }

        let run = report.times.run;
        report.reads_ps = rate(as_f64(report.nreads), run);
        report.writes_ps = rate(as_f64(report.nwrites), run);
        report.flops = rate(as_f64(report.nfpops), run);
        report.pts_ps = rate(as_f64(inputs.domain_points.saturating_mul(inputs.steps_done)), run);
        report
    }

    /// Sum of steps over packs.
    pub fn pack_steps(&self) -> u64 {
        self.packs.iter().map(|p| p.nsteps).fold(0, u64::saturating_add)
    }

    /// Pack breakdowns are only informative when packs did not all run in
    /// lockstep with the whole solution.
    fn show_packs(&self) -> bool {
        self.pack_steps() != self.nsteps
    }
}

/// Formats a number with an SI suffix, e.g. `1.235M`.
pub fn num_str(value: f64) -> String {
    const UNITS: [(f64, &str); 4] = [(1e12, "T"), (1e9, "G"), (1e6, "M"), (1e3, "K")];
    for (scale, suffix) in UNITS {
        if value.abs() >= scale {
            return format!("{:.3}{suffix}", value / scale);
        }
    }
    format!("{value:.3}")
}

fn pct_str(n: f64, d: f64) -> String {
    if d > 0.0 {
        format!(" ({:.2}%)", 100.0 * n / d)
    } else {
        String::new()
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nsteps == 0 {
            return writeln!(f, "No steps done.");
        }
        let steps = as_f64(self.nsteps);
        let t = &self.times;

        writeln!(f, "Work stats:")?;
        writeln!(f, " num-steps-done:              {}", self.nsteps)?;
        writeln!(f, " num-reads-per-step:          {}", num_str(as_f64(self.nreads) / steps))?;
        writeln!(f, " num-writes-per-step:         {}", num_str(as_f64(self.nwrites) / steps))?;
        writeln!(f, " num-est-FP-ops-per-step:     {}", num_str(as_f64(self.nfpops) / steps))?;
        writeln!(f, " num-points-per-step:         {}", num_str(as_f64(self.domain_points)))?;
        if self.show_packs() {
            writeln!(f, " Work breakdown by pack:")?;
            for p in &self.packs {
                writeln!(f, "  '{}' num-steps-done:          {}", p.name, p.nsteps)?;
                writeln!(f, "  '{}' num-reads-per-step:      {}", p.name, num_str(as_f64(p.reads_per_step)))?;
                writeln!(f, "  '{}' num-writes-per-step:     {}", p.name, num_str(as_f64(p.writes_per_step)))?;
                writeln!(f, "  '{}' num-est-FP-ops-per-step: {}", p.name, num_str(as_f64(p.fpops_per_step)))?;
            }
        }

        writeln!(f, "Time stats:")?;
        writeln!(f, " elapsed-time (sec):          {}", num_str(t.run))?;
        writeln!(f, " Time breakdown by activity type:")?;
        writeln!(f, "  compute time (sec):         {}{}", num_str(t.compute), pct_str(t.compute, t.run))?;
        writeln!(f, "  halo exchange time (sec):   {}{}", num_str(t.halo), pct_str(t.halo, t.run))?;
        writeln!(f, "  other time (sec):           {}{}", num_str(t.other), pct_str(t.other, t.run))?;
        if self.show_packs() {
            writeln!(f, " Compute-time breakdown by pack:")?;
            for p in &self.packs {
                writeln!(f, "  '{}' time (sec): {}{}", p.name, num_str(p.run_time), pct_str(p.run_time, t.compute))?;
            }
            writeln!(
                f,
                "  other (sec):                {}{}",
                num_str(self.other_compute_time),
                pct_str(self.other_compute_time, t.compute)
            )?;
        }
        if t.halo > 0.0 {
            writeln!(f, " Compute-time breakdown by halo area:")?;
            writeln!(f, "  rank-exterior compute (sec): {}{}", num_str(t.exterior), pct_str(t.exterior, t.compute))?;
            writeln!(f, "  rank-interior compute (sec): {}{}", num_str(t.interior), pct_str(t.interior, t.compute))?;
            let packing = (t.halo - t.wait - t.test).max(0.0);
            writeln!(f, " Halo-time breakdown:")?;
            writeln!(f, "  waits (sec):                {}{}", num_str(t.wait), pct_str(t.wait, t.halo))?;
            writeln!(f, "  tests (sec):                {}{}", num_str(t.test), pct_str(t.test, t.halo))?;
            writeln!(f, "  packing, unpacking, etc.:   {}{}", num_str(packing), pct_str(packing, t.halo))?;
        }

        writeln!(f, "Rate stats:")?;
        writeln!(f, " throughput (num-reads/sec):  {}", num_str(self.reads_ps))?;
        writeln!(f, " throughput (num-writes/sec): {}", num_str(self.writes_ps))?;
        writeln!(f, " throughput (est-FLOPS):      {}", num_str(self.flops))?;
        writeln!(f, " throughput (num-points/sec): {}", num_str(self.pts_ps))?;
        if self.show_packs() {
            writeln!(f, " Rate breakdown by pack:")?;
            for p in &self.packs {
                writeln!(f, "  '{}' throughput (num-reads/sec):  {}", p.name, num_str(p.reads_ps))?;
                writeln!(f, "  '{}' throughput (num-writes/sec): {}", p.name, num_str(p.writes_ps))?;
                writeln!(f, "  '{}' throughput (est-FLOPS):      {}", p.name, num_str(p.flops))?;
                writeln!(f, "  '{}' throughput (num-points/sec): {}", p.name, num_str(p.pts_ps))?;
            }
        }
        Ok(())
    }
}
