//! Integration tests for multi-rank runs on an in-process cluster.
//!
//! Every rank is a thread with its own context; the collectives in
//! `prepare()`, `report()`, and `end()` must line up across ranks and the
//! cluster-wide totals must be the sum of the per-rank values.

use std::thread;
use std::time::Duration;

use solnctx::env::{Environment, LocalCluster};
use solnctx::{Dims, Grid, Query, ResourceTotals, SolutionContext};

const RANKS: usize = 3;
const RANK_SIZE: i64 = 6;

#[derive(Debug)]
struct RankOutcome {
    index: usize,
    totals: ResourceTotals,
    first_x: i64,
    last_x: i64,
    overall_x: i64,
    comm_buffers: usize,
    steps_reported: u64,
}

fn run_rank(env: LocalCluster) -> RankOutcome {
    let index = env.rank_index();
    let mut ctx = SolutionContext::new("cluster", Dims::new("t", ["x", "y"])).with_environment(env);
    let rest = ctx
        .apply_command_line_options(&format!(
            "-d {RANK_SIZE} -nrx {RANKS} -rix {index} -mp 1 -max_threads 1 rank-{index}"
        ))
        .unwrap();
    assert_eq!(rest, format!("rank-{index}"));
    let u = ctx.add_grid(Grid::new("u", ["x", "y"]), true).unwrap();

    ctx.prepare().unwrap();
    u.write(|data| data.fill(1.0)).unwrap();

    ctx.timers_mut().run.add(Duration::from_millis(10));
    ctx.record_steps(1);
    let report = ctx.report();

    let outcome = RankOutcome {
        index,
        totals: ctx.totals(),
        first_x: ctx.get(Query::FirstRankDomainIndex, "x").unwrap(),
        last_x: ctx.get(Query::LastRankDomainIndex, "x").unwrap(),
        overall_x: ctx.get(Query::OverallDomainSize, "x").unwrap(),
        comm_buffers: ctx.comm_buffers().len(),
        steps_reported: report.nsteps,
    };
    ctx.end().unwrap();
    assert!(!u.is_storage_allocated());
    outcome
}

#[test]
fn test_cluster_lifecycle_and_totals() {
    let handles: Vec<_> = LocalCluster::ranks(RANKS)
        .into_iter()
        .map(|env| thread::spawn(move || run_rank(env)))
        .collect();
    let mut outcomes: Vec<RankOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    outcomes.sort_by_key(|o| o.index);

    let rank_bytes_sum: u64 = outcomes.iter().map(|o| o.totals.rank_bytes).sum();
    for o in &outcomes {
        let i = i64::try_from(o.index).unwrap();
        assert_eq!(o.first_x, i * RANK_SIZE);
        assert_eq!(o.last_x, i * RANK_SIZE + RANK_SIZE - 1);
        assert_eq!(o.overall_x, 3 * RANK_SIZE);

        assert_eq!(o.totals.rank_domain_points, 36);
        assert_eq!(o.totals.total_domain_points, 36 * 3);
        assert_eq!(o.totals.total_bytes, rank_bytes_sum);
        assert_eq!(o.steps_reported, 1);
    }

    // Edge ranks have one neighbor along x, the middle rank two.
    let comm: Vec<usize> = outcomes.iter().map(|o| o.comm_buffers).collect();
    assert_eq!(comm, [2, 4, 2]);

    // Padded 8x8 grid plus comm faces of 6 elements each.
    assert_eq!(outcomes[0].totals.rank_bytes, (64 + 2 * 6) * 8);
    assert_eq!(outcomes[1].totals.rank_bytes, (64 + 4 * 6) * 8);
}
