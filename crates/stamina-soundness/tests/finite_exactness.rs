//! Property: fully explorable acyclic models are solved exactly.
//!
//! On a finite DAG, refinement converges before the iteration cap, the
//! bounds meet within the probability window, and both equal the exact
//! reachability probability.

use proptest::prelude::*;
use stamina_expr::TimeInterval;
use stamina_mc::StaminaConfig;
use stamina_soundness::{arb_dag, check_bounds, exact_probability, numeric_bounds, reach_avoiding};

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    #[test]
    fn dag_bounds_meet_at_exact_value(
        (n, oracle) in arb_dag(10),
        target in 1i64..10,
        prop_refine in any::<bool>(),
    ) {
        let target = target % n as i64;
        let property = reach_avoiding(target, -1, TimeInterval::UNBOUNDED);
        let exact = exact_probability(&oracle, &property).unwrap();
        let config = StaminaConfig {
            prob_error_window: 1e-6,
            max_truncation_passes: 1_000,
            prop_refine,
            ..Default::default()
        };
        let result = check_bounds(&oracle, &property, config).unwrap();
        let (lo, hi) = numeric_bounds(&result).unwrap();
        prop_assert!(result.converged, "[{}, {}] after {} iterations", lo, hi, result.iterations);
        prop_assert!((lo - exact).abs() <= 1e-6, "lower {} vs exact {}", lo, exact);
        prop_assert!((hi - exact).abs() <= 1e-6, "upper {} vs exact {}", hi, exact);
    }
}
