//! Integration tests for telemetry reconciliation and reporting.
//!
//! These tests feed known timer readings through a prepared context and
//! verify the reconciled breakdown, the in-order pack allotment, the
//! containment invariants over a sweep of inconsistent inputs, and the
//! read-and-clear behavior of `report()`.

use std::time::Duration;

use solnctx::stats::{RawTimes, allot, reconcile};
use solnctx::{Dims, SolutionContext, StepCost, WorkPack};

const EPS: f64 = 1e-9;

fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s)
}

/// Helper: a prepared context with `threads` region threads and the given packs.
fn prepared(threads: usize, packs: &[&str]) -> SolutionContext {
    let mut ctx = SolutionContext::new("stats", Dims::new("t", ["x", "y"]));
    ctx.apply_command_line_options(&format!("-d 10 -max_threads {threads} -block_threads 1"))
        .unwrap();
    for name in packs {
        ctx.add_pack(WorkPack::new(name, StepCost { reads: 3, writes: 1, fpops: 8 }));
    }
    ctx.prepare().unwrap();
    ctx
}

#[test]
fn test_worked_example_through_context() {
    let mut ctx = prepared(5, &["main"]);
    assert_eq!(ctx.thread_counts().region, 5);

    let timers = ctx.timers_mut();
    timers.run.add(secs(100.0));
    timers.halo.add(secs(20.0));
    timers.wait.add(secs(5.0));
    timers.exterior.add(secs(30.0));
    timers.interior.add(secs(45.0));
    timers.test.add(secs(10.0));
    ctx.record_steps(10);
    let pack = ctx.pack_mut(0).unwrap();
    pack.timer.add(secs(50.0));
    pack.add_steps(10);

    let report = ctx.report();
    let t = report.times;
    assert!((t.test - 2.0).abs() < EPS);
    assert!((t.halo_exchange - 20.0).abs() < EPS);
    assert!((t.wait - 5.0).abs() < EPS);
    assert!((t.exterior - 30.0).abs() < EPS);
    assert!((t.interior - 43.0).abs() < EPS);
    assert!((t.compute - 73.0).abs() < EPS);
    assert!((t.halo - 22.0).abs() < EPS);
    assert!((t.other - 5.0).abs() < EPS);

    assert_eq!(report.packs.len(), 1);
    assert!((report.packs[0].run_time - 50.0).abs() < EPS);
    assert!((report.other_compute_time - 23.0).abs() < EPS);

    assert_eq!(report.domain_points, 100);
    assert_eq!(report.nreads, 30);
    assert!((report.pts_ps - 10.0).abs() < EPS);
    assert!((report.packs[0].flops - 80.0 / 50.0).abs() < EPS);
}

#[test]
fn test_later_packs_get_what_is_left() {
    let mut ctx = prepared(1, &["first", "second", "third"]);
    let timers = ctx.timers_mut();
    timers.run.add(secs(10.0));
    timers.interior.add(secs(8.0));
    for (i, p) in [5.0, 4.0, 1.0].into_iter().enumerate() {
        let pack = ctx.pack_mut(i).unwrap();
        pack.timer.add(secs(p));
        pack.add_steps(1);
    }
    ctx.record_steps(2);

    let report = ctx.report();
    let allotted: Vec<f64> = report.packs.iter().map(|p| p.run_time).collect();
    assert!((allotted[0] - 5.0).abs() < EPS);
    assert!((allotted[1] - 3.0).abs() < EPS);
    assert!(allotted[2].abs() < EPS);
    assert!(report.other_compute_time.abs() < EPS);
    // The third pack did work but got no time, so its rates are zero.
    assert_eq!(report.packs[2].flops, 0.0);

    let text = report.to_string();
    assert!(text.contains("Compute-time breakdown by pack:"));
    assert!(text.contains("'second'"));
}

#[test]
fn test_reconciliation_invariants_hold_for_inconsistent_inputs() {
    let values = [0.0, 0.5, 3.0, 7.0, 12.0];
    for &run in &values {
        for &halo in &values {
            for &wait in &values {
                for &exterior in &values {
                    for &interior in &values {
                        for &test in &values {
                            for threads in [0, 1, 3] {
                                let raw = RawTimes { run, halo, wait, exterior, interior, test };
                                let t = reconcile(&raw, threads);
                                let sum = t.compute + t.halo + t.other;
                                assert!((sum - t.run).abs() < EPS, "{raw:?} -> {t:?}");
                                assert!(t.compute >= 0.0 && t.halo >= 0.0 && t.other >= 0.0);
                                assert!(t.wait <= t.halo_exchange && t.halo_exchange <= t.run);

                                let (shares, rest) = allot(t.compute, [interior, exterior]);
                                let allotted: f64 = shares.iter().sum();
                                assert!(allotted <= t.compute + EPS);
                                assert!((allotted + rest - t.compute).abs() < EPS);
                            }
                        }
                    }
                }
            }
        }
    }
}

#[test]
fn test_second_report_is_all_zero() {
    let mut ctx = prepared(2, &["p"]);
    ctx.timers_mut().run.add(secs(4.0));
    ctx.timers_mut().halo.add(secs(1.0));
    ctx.record_steps(3);
    if let Some(pack) = ctx.pack_mut(0) {
        pack.timer.add(secs(2.0));
        pack.add_steps(3);
    }
    let first = ctx.report();
    assert_eq!(first.nsteps, 3);

    let second = ctx.report();
    assert_eq!(second.nsteps, 0);
    assert_eq!((second.nreads, second.nwrites, second.nfpops), (0, 0, 0));
    assert_eq!(second.times.run, 0.0);
    assert_eq!(second.times.halo, 0.0);
    assert_eq!(second.times.other, 0.0);
    assert_eq!((second.flops, second.pts_ps), (0.0, 0.0));
    assert_eq!(second.packs[0].nsteps, 0);
    assert_eq!(second.packs[0].run_time, 0.0);
    assert_eq!(second.to_string(), "No steps done.\n");
}

#[test]
fn test_report_serializes_to_json() {
    let mut ctx = prepared(1, &["p"]);
    ctx.timers_mut().run.add(secs(1.0));
    ctx.record_steps(1);
    let json = serde_json::to_value(ctx.report()).unwrap();
    assert_eq!(json["nsteps"], 1);
    assert_eq!(json["times"]["run"], 1.0);
}
