//! Property: every refinement result brackets the exact probability.
//!
//! On models small enough to enumerate, `Pmin <= P <= Pmax` must hold for
//! any truncation settings, including ones that stop long before the
//! bounds meet, and with or without the property guard.

use proptest::prelude::*;
use stamina_expr::TimeInterval;
use stamina_soundness::{
    arb_chain, arb_config, check_bounds, exact_probability, numeric_bounds, reach_avoiding,
};

const TOLERANCE: f64 = 1e-6;

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    #[test]
    fn unbounded_until_is_bracketed(
        (n, oracle) in arb_chain(10),
        config in arb_config(),
        target in 0i64..10,
        avoid in 0i64..10,
    ) {
        let target = target % n as i64;
        let avoid = avoid % n as i64;
        let property = reach_avoiding(target, avoid, TimeInterval::UNBOUNDED);
        let exact = exact_probability(&oracle, &property).unwrap();
        let result = check_bounds(&oracle, &property, config).unwrap();
        let (lo, hi) = numeric_bounds(&result).unwrap();
        prop_assert!(lo <= hi + TOLERANCE, "[{}, {}]", lo, hi);
        prop_assert!(
            lo <= exact + TOLERANCE && exact <= hi + TOLERANCE,
            "[{}, {}] does not contain {}",
            lo,
            hi,
            exact
        );
    }

    #[test]
    fn time_bounded_until_is_bracketed(
        (n, oracle) in arb_chain(8),
        config in arb_config(),
        target in 0i64..8,
        t in 0.1f64..3.0,
    ) {
        let target = target % n as i64;
        let property = reach_avoiding(target, -1, TimeInterval::up_to(t));
        let exact = exact_probability(&oracle, &property).unwrap();
        let result = check_bounds(&oracle, &property, config).unwrap();
        let (lo, hi) = numeric_bounds(&result).unwrap();
        prop_assert!(
            lo <= exact + TOLERANCE && exact <= hi + TOLERANCE,
            "[{}, {}] does not contain {}",
            lo,
            hi,
            exact
        );
    }
}
