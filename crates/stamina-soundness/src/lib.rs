use ahash::AHashMap;
use proptest::prelude::*;
use stamina_expr::{Expr, PathFormula, ProbQuery, Property, TimeInterval, Until};
use stamina_mc::{
    BoundsResult, ModelOracle, StaminaChecker, StaminaConfig, State, StateEnv, TableOracle,
    VarDecl,
};

/// A finite CTMC enumerated without truncation.
pub struct ExactChain {
    decls: Vec<VarDecl>,
    states: Vec<State>,
    rows: Vec<Vec<(usize, f64)>>,
    initial: usize,
}

impl ExactChain {
    /// Enumerate every reachable state, failing past `max_states`.
    pub fn enumerate<O: ModelOracle>(oracle: &mut O, max_states: usize) -> Result<Self, String> {
        let decls = oracle.var_decls().to_vec();
        let init = oracle.initial_state().map_err(|e| e.to_string())?;
        let mut index: AHashMap<State, usize> = AHashMap::new();
        let mut states = vec![init.clone()];
        let mut rows = Vec::new();
        index.insert(init, 0);

        let mut next = 0;
        while next < states.len() {
            let state = states[next].clone();
            oracle.explore_state(&state).map_err(|e| e.to_string())?;
            let mut row = Vec::new();
            for choice in 0..oracle.num_choices() {
                for k in 0..oracle.num_transitions(choice) {
                    let rate = oracle.transition_rate(choice, k).map_err(|e| e.to_string())?;
                    let target = oracle
                        .compute_transition_target(choice, k)
                        .map_err(|e| e.to_string())?;
                    let id = match index.get(&target) {
                        Some(&id) => id,
                        None => {
                            if states.len() >= max_states {
                                return Err(format!("more than {} states", max_states));
                            }
                            index.insert(target.clone(), states.len());
                            states.push(target);
                            states.len() - 1
                        }
                    };
                    if rate > 0.0 {
                        row.push((id, rate));
                    }
                }
            }
            rows.push(row);
            next += 1;
        }

        Ok(Self {
            decls,
            states,
            rows,
            initial: 0,
        })
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    fn satisfying(&self, expr: &Expr) -> Result<Vec<bool>, String> {
        self.states
            .iter()
            .map(|s| {
                expr.eval_bool(&StateEnv::new(s, &self.decls))
                    .map_err(|e| e.to_string())
            })
            .collect()
    }

    /// `P(φ₁ U φ₂)` from the initial state, by value iteration from below.
    pub fn until_probability(&self, until: &Until) -> Result<f64, String> {
        let phi1 = self.satisfying(&until.lhs)?;
        let phi2 = self.satisfying(&until.rhs)?;
        if let Some(t) = until.interval.upper {
            return self.bounded_until_probability(&phi1, &phi2, t);
        }

        let n = self.num_states();
        let mut x: Vec<f64> = phi2.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect();
        for _ in 0..1_000_000 {
            let mut delta: f64 = 0.0;
            for s in 0..n {
                if phi2[s] || !phi1[s] || self.rows[s].is_empty() {
                    continue;
                }
                let exit: f64 = self.rows[s].iter().map(|&(_, r)| r).sum();
                let v: f64 = self.rows[s].iter().map(|&(t, r)| r / exit * x[t]).sum();
                delta = delta.max((v - x[s]).abs());
                x[s] = v;
            }
            if delta < 1e-15 {
                return Ok(x[self.initial]);
            }
        }
        Err("value iteration did not converge".to_string())
    }

    fn bounded_until_probability(
        &self,
        phi1: &[bool],
        phi2: &[bool],
        t: f64,
    ) -> Result<f64, String> {
        let n = self.num_states();
        let stopped: Vec<bool> = (0..n).map(|s| phi2[s] || !phi1[s]).collect();
        let q = (0..n)
            .filter(|&s| !stopped[s])
            .map(|s| self.rows[s].iter().map(|&(_, r)| r).sum::<f64>())
            .fold(0.0, f64::max);
        let mut pi = vec![0.0; n];
        pi[self.initial] = 1.0;
        if q == 0.0 || t == 0.0 {
            return Ok((0..n).filter(|&s| phi2[s]).map(|s| pi[s]).sum());
        }
        let qt = q * t;
        if qt > 600.0 {
            return Err(format!("q·t = {} is too large for direct Poisson weights", qt));
        }

        let mut weight = (-qt).exp();
        let mut cumulative = weight;
        let mut result = vec![0.0; n];
        let mut k = 0u32;
        loop {
            for s in 0..n {
                result[s] += weight * pi[s];
            }
            if 1.0 - cumulative < 1e-15 || k > 100_000 {
                break;
            }
            let mut step = vec![0.0; n];
            for s in 0..n {
                if stopped[s] {
                    step[s] += pi[s];
                    continue;
                }
                let mut out = 0.0;
                for &(target, rate) in &self.rows[s] {
                    step[target] += pi[s] * rate / q;
                    out += rate / q;
                }
                step[s] += pi[s] * (1.0 - out);
            }
            pi = step;
            k += 1;
            weight *= qt / k as f64;
            cumulative += weight;
        }
        Ok((0..n).filter(|&s| phi2[s]).map(|s| result[s]).sum())
    }
}

/// Variable `s` of an indexed table model.
pub fn s() -> Expr {
    Expr::var(0, "s")
}

/// `P=? [ s != avoid U s = target ]` over an indexed table model.
pub fn reach_avoiding(target: i64, avoid: i64, interval: TimeInterval) -> Property {
    Property::named(
        "reach",
        ProbQuery::numeric(PathFormula::Until(Until::bounded(
            s().not_equals(avoid),
            s().equals(target),
            interval,
        ))),
    )
}

pub fn exact_probability(oracle: &TableOracle, property: &Property) -> Result<f64, String> {
    let chain = ExactChain::enumerate(&mut oracle.clone(), 10_000)?;
    chain.until_probability(&property.query.path.to_until())
}

pub fn check_bounds(
    oracle: &TableOracle,
    property: &Property,
    config: StaminaConfig,
) -> Result<BoundsResult, String> {
    StaminaChecker::new(oracle.clone(), config)
        .check(property)
        .map_err(|e| e.to_string())
}

pub fn numeric_bounds(result: &BoundsResult) -> Option<(f64, f64)> {
    Some((result.p_min.as_f64()?, result.p_max.as_f64()?))
}

/// Random CTMC over `s ∈ [0, n)` with rates in `[0.5, 4)`, started at 0.
pub fn arb_chain(max_states: usize) -> impl Strategy<Value = (usize, TableOracle)> {
    (2..=max_states).prop_flat_map(|n| {
        let edge = (0..n, 0..n, 0.5f64..4.0);
        prop::collection::vec(edge, 1..n * 3)
            .prop_map(move |edges| (n, TableOracle::indexed(n, 0, &edges)))
    })
}

/// Random acyclic CTMC: every edge goes from a lower to a higher index.
pub fn arb_dag(max_states: usize) -> impl Strategy<Value = (usize, TableOracle)> {
    (3..=max_states).prop_flat_map(|n| {
        let edge = (0..n - 1, 1..n, 0.5f64..4.0);
        prop::collection::vec(edge, n..n * 3).prop_map(move |edges| {
            let forward: Vec<_> = edges.into_iter().filter(|&(a, b, _)| a < b).collect();
            (n, TableOracle::indexed(n, 0, &forward))
        })
    })
}

/// Truncation settings small enough that random models stay truncated.
pub fn arb_config() -> impl Strategy<Value = StaminaConfig> {
    (0.05f64..1.0, 1.1f64..4.0, 1usize..4, 1usize..6, any::<bool>()).prop_map(
        |(kappa, r, approx, passes, prop_refine)| StaminaConfig {
            kappa,
            kappa_reduction_factor: r,
            max_approx_count: approx,
            max_truncation_passes: passes,
            prop_refine,
            ..Default::default()
        },
    )
}
