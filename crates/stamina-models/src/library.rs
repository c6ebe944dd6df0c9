//! Benchmark CTMCs and their usual properties.

use crate::guarded::{assign, Command, GuardedModel, ModelBuilder, ModelResult};
use stamina_expr::{Expr, PathFormula, ProbQuery, Property, TimeInterval, Until};

/// Upper bound for counters that are unbounded in the model.
pub const UNBOUNDED: i64 = i64::MAX;

fn var(index: usize, name: &str) -> Expr {
    Expr::var(index, name)
}

fn reach(name: &str, lhs: Expr, target: Expr, interval: TimeInterval) -> Property {
    Property::named(
        name,
        ProbQuery::numeric(PathFormula::Until(Until::bounded(lhs, target, interval))),
    )
}

/// M/M/1 queue: arrivals at `lambda`, service at `mu`, unbounded length `n`.
pub fn birth_death(lambda: f64, mu: f64) -> ModelResult<GuardedModel> {
    let mut b = ModelBuilder::new("birth_death");
    let n = b.int_var("n", 0, UNBOUNDED, 0);
    b.command(
        Command::new("arrive", Expr::Bool(true)).branch(lambda, vec![assign(&n, n.clone() + 1)]),
    );
    b.command(Command::new("serve", n.clone().gt(0)).branch(mu, vec![assign(&n, n.clone() - 1)]));
    b.build()
}

/// `P=? [ true U<=t n>=k ]`: the queue reaches length `k` within `t`.
pub fn queue_reaches(k: i64, interval: TimeInterval) -> Property {
    reach("queue_reaches", Expr::Bool(true), var(0, "n").ge(k), interval)
}

/// Two queues of capacity `cap` in series.
///
/// Jobs arrive at the first queue at `lambda`, move to the second at `mu1`
/// when it has room and leave at `mu2`.
pub fn tandem_queue(cap: i64, lambda: f64, mu1: f64, mu2: f64) -> ModelResult<GuardedModel> {
    let mut b = ModelBuilder::new("tandem");
    let sc = b.int_var("sc", 0, cap, 0);
    let sm = b.int_var("sm", 0, cap, 0);
    b.command(
        Command::new("arrive", sc.clone().lt(cap)).branch(lambda, vec![assign(&sc, sc.clone() + 1)]),
    );
    b.command(
        Command::new("route", sc.clone().gt(0).and(sm.clone().lt(cap))).branch(
            mu1,
            vec![assign(&sc, sc.clone() - 1), assign(&sm, sm.clone() + 1)],
        ),
    );
    b.command(
        Command::new("serve", sm.clone().gt(0)).branch(mu2, vec![assign(&sm, sm.clone() - 1)]),
    );
    b.build()
}

/// `P=? [ true U<=t sm=cap ]`: the second queue fills up.
pub fn tandem_full(cap: i64, interval: TimeInterval) -> Property {
    reach("tandem_full", Expr::Bool(true), var(1, "sm").equals(cap), interval)
}

/// `s` moves from 0 to `n` at a constant rate; `n` is absorbing.
pub fn linear_chain(n: i64, rate: f64) -> ModelResult<GuardedModel> {
    let mut b = ModelBuilder::new("linear_chain");
    let s = b.int_var("s", 0, n, 0);
    b.command(
        Command::new("step", s.clone().lt(n)).branch(rate, vec![assign(&s, s.clone() + 1)]),
    );
    b.build()
}

/// `P=? [ true U s=n ]`.
pub fn chain_end(n: i64) -> Property {
    reach("chain_end", Expr::Bool(true), var(0, "s").equals(n), TimeInterval::UNBOUNDED)
}

/// Random walk on the naturals started at `start`, absorbed at 0.
pub fn gamblers_walk(p_up: f64, p_down: f64, start: i64) -> ModelResult<GuardedModel> {
    let mut b = ModelBuilder::new("gamblers_walk");
    let k = b.int_var("k", 0, UNBOUNDED, start);
    b.command(
        Command::new("bet", k.clone().gt(0))
            .branch(p_up, vec![assign(&k, k.clone() + 1)])
            .branch(p_down, vec![assign(&k, k.clone() - 1)]),
    );
    b.build()
}

/// `P=? [ true U<=t k=0 ]`: ruin within the interval.
pub fn ruin(interval: TimeInterval) -> Property {
    reach("ruin", Expr::Bool(true), var(0, "k").equals(0), interval)
}

/// `P=? [ k>0 U k>=target ]`: the walk reaches `target` before ruin.
pub fn reach_wealth(target: i64) -> Property {
    reach(
        "reach_wealth",
        var(0, "k").gt(0),
        var(0, "k").ge(target),
        TimeInterval::UNBOUNDED,
    )
}

/// Probability that the walk reaches `target` before 0, from `start`.
pub fn reach_wealth_exact(p_up: f64, p_down: f64, start: i64, target: i64) -> f64 {
    if target <= start {
        return 1.0;
    }
    if start <= 0 {
        return 0.0;
    }
    if p_up == p_down {
        return start as f64 / target as f64;
    }
    let ratio = p_down / p_up;
    (1.0 - ratio.powi(start as i32)) / (1.0 - ratio.powi(target as i32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stamina_mc::{CheckValue, ModelOracle, StaminaChecker, StaminaConfig, TruncationEngine};

    fn bounds(model: GuardedModel, property: &Property, config: StaminaConfig) -> (f64, f64) {
        let checker = StaminaChecker::new(model, config);
        let result = checker.check(property).unwrap();
        match (result.p_min, result.p_max) {
            (CheckValue::Numeric(lo), CheckValue::Numeric(hi)) => (lo, hi),
            other => panic!("expected numeric bounds, got {:?}", other),
        }
    }

    #[test]
    fn test_linear_chain_reaches_end() {
        let model = linear_chain(5, 1.0).unwrap();
        let (lo, hi) = bounds(model, &chain_end(5), StaminaConfig::default());
        assert!((lo - 1.0).abs() < 1e-6);
        assert!((hi - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_guard_makes_infinite_queue_finite() {
        // The guard stops exploration at n = 3, so the model is closed.
        let model = birth_death(1.0, 2.0).unwrap();
        let property = queue_reaches(3, TimeInterval::UNBOUNDED);
        let (lo, hi) = bounds(model, &property, StaminaConfig::default());
        assert!((lo - 1.0).abs() < 1e-6, "lower bound {}", lo);
        assert!(hi >= lo);
    }

    #[test]
    fn test_gamblers_walk_brackets_exact_value() {
        let model = gamblers_walk(2.0, 1.0, 2).unwrap();
        let exact = reach_wealth_exact(2.0, 1.0, 2, 6);
        let (lo, hi) = bounds(model, &reach_wealth(6), StaminaConfig::default());
        assert!(lo <= exact + 1e-6 && exact - 1e-6 <= hi, "[{}, {}] vs {}", lo, hi, exact);
        assert!(hi - lo <= 1e-3);
    }

    #[test]
    fn test_time_bounded_ruin_bounds_are_ordered() {
        let model = gamblers_walk(2.0, 1.0, 1).unwrap();
        let (lo, hi) = bounds(model, &ruin(TimeInterval::up_to(1.0)), StaminaConfig::default());
        assert!(lo > 0.0);
        assert!(lo <= hi && hi <= 1.0);
    }

    #[test]
    fn test_tandem_queue_state_space() {
        let cap = 3;
        let config = StaminaConfig {
            prop_refine: false,
            prob_error_window: 1e-12,
            max_truncation_passes: 500,
            ..Default::default()
        };
        let model = tandem_queue(cap, 4.0, 2.0, 2.0).unwrap();
        let mut engine = TruncationEngine::new(model, config).unwrap();
        engine.explore(2.0).unwrap();
        assert_eq!(engine.global_state_set().len(), 16);
        assert!(!engine.global_state_set().has_terminal());
    }

    #[test]
    fn test_exact_formula() {
        assert_eq!(reach_wealth_exact(1.0, 1.0, 2, 4), 0.5);
        assert_eq!(reach_wealth_exact(2.0, 1.0, 5, 5), 1.0);
        let p = reach_wealth_exact(2.0, 1.0, 1, 2);
        assert!((p - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_birth_death_oracle() {
        let mut model = birth_death(1.0, 2.0).unwrap();
        let init = model.initial_state().unwrap();
        model.explore_state(&init).unwrap();
        assert_eq!(model.num_transitions(0), 1);
        assert_eq!(model.compute_transition_target(0, 0).unwrap().vars(), &[1]);
    }
}
