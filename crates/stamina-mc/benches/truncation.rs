//! Criterion benchmarks for truncated exploration and bound computation.
//!
//! Run with: cargo bench -p stamina-mc

use criterion::{criterion_group, criterion_main, Criterion};
use stamina_expr::{Expr, PathFormula, ProbQuery, Property, Until};
use stamina_mc::{StaminaChecker, StaminaConfig, State, TableOracle, TruncationEngine, VarDecl};

/// Two-dimensional walk on an `n` x `n` grid, drifting towards larger `x`.
fn grid(n: i64) -> TableOracle {
    let mut edges = Vec::new();
    for x in 0..n {
        for y in 0..n {
            let here = State::new(vec![x, y]);
            if x + 1 < n {
                edges.push((here.clone(), State::new(vec![x + 1, y]), 3.0));
            }
            if y + 1 < n {
                edges.push((here.clone(), State::new(vec![x, y + 1]), 1.0));
            }
            if x > 0 {
                edges.push((here.clone(), State::new(vec![x - 1, y]), 1.0));
            }
        }
    }
    TableOracle::new(
        vec![VarDecl::int("x", 0, n - 1), VarDecl::int("y", 0, n - 1)],
        State::new(vec![0, 0]),
        edges,
    )
}

fn bench_explore(c: &mut Criterion, name: &str, n: i64, config: StaminaConfig) {
    let oracle = grid(n);
    c.bench_function(name, |b| {
        b.iter(|| {
            let mut engine = TruncationEngine::new(oracle.clone(), config.clone()).unwrap();
            engine.explore(config.misprediction_factor).unwrap();
        })
    });
}

fn bench_check(c: &mut Criterion, name: &str, n: i64, config: StaminaConfig) {
    let oracle = grid(n);
    let corner = Expr::var(0, "x").equals(n - 1);
    let property = Property::named(
        "corner",
        ProbQuery::numeric(PathFormula::Until(Until::new(Expr::Bool(true), corner))),
    );
    c.bench_function(name, |b| {
        b.iter(|| {
            let checker = StaminaChecker::new(oracle.clone(), config.clone());
            checker.check(&property).unwrap();
        })
    });
}

fn benchmarks(c: &mut Criterion) {
    let sequential = StaminaConfig {
        prop_refine: false,
        ..Default::default()
    };

    let parallel = StaminaConfig {
        prop_refine: false,
        parallel: true,
        ..Default::default()
    };

    let refined = StaminaConfig::default();

    bench_explore(c, "explore_grid_30", 30, sequential.clone());
    bench_explore(c, "explore_grid_30_parallel", 30, parallel);
    bench_explore(c, "explore_grid_60", 60, sequential.clone());

    // Full refinement loop, with and without the property guard
    bench_check(c, "check_grid_20", 20, sequential);
    bench_check(c, "check_grid_20_prop_refine", 20, refined);
}

criterion_group!(benches, benchmarks);
criterion_main!(benches);
