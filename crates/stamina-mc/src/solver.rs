//! Numeric analysis of truncated models.

use crate::explorer::{McError, McResult};
use crate::model::TruncatedModel;
use stamina_expr::{BoundVariant, ProbQuery, TimeInterval, Until};
use std::fmt;
use tracing::{debug, trace};

/// Iterative method for unbounded reachability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverMethod {
    Power,
    #[default]
    Jacobi,
    GaussSeidel,
}

impl fmt::Display for SolverMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SolverMethod::Power => "power",
            SolverMethod::Jacobi => "jacobi",
            SolverMethod::GaussSeidel => "gauss-seidel",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverConfig {
    pub method: SolverMethod,
    /// Maximum iterations before reporting non-convergence.
    pub max_iters: usize,
    /// Largest accepted gap between the lower and upper iterates, and the
    /// largest mass left unabsorbed by a limit computation.
    pub epsilon: f64,
    /// Maximum number of uniformised steps in a transient computation.
    pub max_uniformisation_steps: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            method: SolverMethod::default(),
            max_iters: 10_000,
            epsilon: 1e-10,
            max_uniformisation_steps: 1_000_000,
        }
    }
}

/// Result of checking a probability query: a number for `P=?`, a verdict
/// for `P ⋈ p`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CheckValue {
    Bool(bool),
    Numeric(f64),
}

impl CheckValue {
    pub fn as_f64(self) -> Option<f64> {
        match self {
            CheckValue::Numeric(p) => Some(p),
            CheckValue::Bool(_) => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        match self {
            CheckValue::Bool(b) => Some(b),
            CheckValue::Numeric(_) => None,
        }
    }
}

impl fmt::Display for CheckValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckValue::Bool(b) => write!(f, "{}", b),
            CheckValue::Numeric(p) => write!(f, "{}", p),
        }
    }
}

/// Only intervals of the form `[0, t]` (or unbounded) are supported.
pub fn validate_interval(interval: &TimeInterval) -> McResult<()> {
    if interval.lower < 0.0 || !interval.lower.is_finite() {
        return Err(McError::UnsupportedInterval(format!(
            "invalid lower bound {}",
            interval.lower
        )));
    }
    if let Some(upper) = interval.upper {
        if upper < 0.0 || !upper.is_finite() {
            return Err(McError::UnsupportedInterval(format!(
                "invalid upper bound {}",
                upper
            )));
        }
        if upper < interval.lower {
            return Err(McError::UnsupportedInterval(
                "upper bound must exceed lower bound".into(),
            ));
        }
    }
    if interval.lower > 0.0 {
        return Err(McError::UnsupportedInterval(format!(
            "only [0,t] bounds are supported, got lower bound {}",
            interval.lower
        )));
    }
    Ok(())
}

pub trait NumericSolver {
    /// Value of `query` at the model's initial state.
    fn check_query(&self, model: &TruncatedModel, query: &ProbQuery) -> McResult<CheckValue>;

    /// Like [`check_query`](Self::check_query), but when the computation is
    /// approximate, `Min` must not overestimate and `Max` must not
    /// underestimate the exact value.
    fn check_query_bound(
        &self,
        model: &TruncatedModel,
        query: &ProbQuery,
        _variant: BoundVariant,
    ) -> McResult<CheckValue> {
        self.check_query(model, query)
    }

    /// Distribution over states, starting from the initial state, of the
    /// chain in which every `absorbing` state keeps its mass: at time
    /// `horizon`, or in the limit when `horizon` is `None`.
    fn absorbing_distribution(
        &self,
        model: &TruncatedModel,
        absorbing: &[bool],
        horizon: Option<f64>,
    ) -> McResult<Vec<f64>>;
}

/// Explicit-state solver: iterative methods for unbounded until and
/// uniformisation for transient analysis.
#[derive(Debug, Clone, Default)]
pub struct ExplicitSolver {
    config: SolverConfig,
}

impl ExplicitSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Lower and upper bounds on the probability of `φ₁ U φ₂` from every
    /// state, at most `epsilon` apart.
    ///
    /// States that reach `φ₂` with probability zero or one are found on the
    /// graph first; interval iteration from below and from above settles the
    /// rest.
    pub fn until_bounds(
        &self,
        model: &TruncatedModel,
        until: &Until,
    ) -> McResult<(Vec<f64>, Vec<f64>)> {
        let n = model.num_states();
        let phi1 = model.satisfying(&until.lhs)?;
        let phi2 = model.satisfying(&until.rhs)?;
        let preds = model.predecessors();

        let reach = backward_closure(&preds, &phi2, |s| phi1[s]);
        let no: Vec<bool> = reach.iter().map(|&r| !r).collect();
        let can_fail = backward_closure(&preds, &no, |s| phi1[s] && !phi2[s]);
        let yes: Vec<bool> = (0..n).map(|i| phi2[i] || !can_fail[i]).collect();
        let maybe: Vec<usize> = (0..n).filter(|&i| reach[i] && !yes[i]).collect();

        let mut lower: Vec<f64> = yes.iter().map(|&b| if b { 1.0 } else { 0.0 }).collect();
        let mut upper = lower.clone();
        for &s in &maybe {
            upper[s] = 1.0;
        }
        trace!(states = n, maybe = maybe.len(), "until pre-computation");
        if maybe.is_empty() {
            return Ok((lower, upper));
        }

        let mut scratch = lower.clone();
        for iteration in 1..=self.config.max_iters {
            self.sweep(model, &maybe, &mut lower, &mut scratch);
            self.sweep(model, &maybe, &mut upper, &mut scratch);
            let gap = maybe
                .iter()
                .map(|&s| upper[s] - lower[s])
                .fold(0.0, f64::max);
            if gap < self.config.epsilon {
                debug!(iterations = iteration, method = %self.config.method, "until converged");
                return Ok((lower, upper));
            }
        }
        Err(McError::SolverDidNotConverge {
            iterations: self.config.max_iters,
        })
    }

    /// Probability of `φ₁ U φ₂` from every state, from below.
    pub fn until_probabilities(&self, model: &TruncatedModel, until: &Until) -> McResult<Vec<f64>> {
        self.until_bounds(model, until).map(|(lower, _)| lower)
    }

    /// One iteration over the undecided states, in place.
    fn sweep(&self, model: &TruncatedModel, maybe: &[usize], x: &mut [f64], prev: &mut [f64]) {
        let method = self.config.method;
        if method != SolverMethod::GaussSeidel {
            prev.copy_from_slice(x);
        }
        for &s in maybe {
            let exit = model.exit_rate(s);
            let (mut acc, mut self_p) = (0.0, 0.0);
            for t in model.transitions(s) {
                let p = t.rate / exit;
                if t.target == s && method != SolverMethod::Power {
                    self_p += p;
                    continue;
                }
                let value = match method {
                    SolverMethod::GaussSeidel => x[t.target],
                    SolverMethod::Power | SolverMethod::Jacobi => prev[t.target],
                };
                acc += p * value;
            }
            x[s] = if self_p < 1.0 { acc / (1.0 - self_p) } else { acc };
        }
    }

    /// Bounds on `φ₁ U[0,t] φ₂` from the initial state. The upper bound adds
    /// the Poisson tail cut off by the transient sum.
    pub fn bounded_until_bounds(
        &self,
        model: &TruncatedModel,
        until: &Until,
        t: f64,
    ) -> McResult<(f64, f64)> {
        let phi1 = model.satisfying(&until.lhs)?;
        let phi2 = model.satisfying(&until.rhs)?;
        let absorbing: Vec<bool> = phi1.iter().zip(&phi2).map(|(&a, &b)| !a || b).collect();
        let pi = self.absorbing_distribution(model, &absorbing, Some(t))?;
        let total: f64 = pi.iter().sum();
        let p: f64 = pi
            .iter()
            .zip(&phi2)
            .filter(|(_, sat)| **sat)
            .map(|(p, _)| p)
            .sum();
        let lo = p.min(1.0);
        let hi = (p + (1.0 - total).max(0.0)).min(1.0);
        Ok((lo, hi))
    }

    /// Bounds on the value of `query`'s path formula at the initial state.
    fn query_bounds(&self, model: &TruncatedModel, query: &ProbQuery) -> McResult<(f64, f64)> {
        let until = query.path.to_until();
        validate_interval(&until.interval)?;
        match until.interval.upper {
            None => {
                let (lower, upper) = self.until_bounds(model, &until)?;
                Ok((lower[model.initial()], upper[model.initial()]))
            }
            Some(t) => self.bounded_until_bounds(model, &until, t),
        }
    }
}

/// Every state that reaches a `target` state through states satisfying
/// `through`, targets included.
fn backward_closure(
    preds: &[Vec<usize>],
    target: &[bool],
    through: impl Fn(usize) -> bool,
) -> Vec<bool> {
    let mut seen = target.to_vec();
    let mut stack: Vec<usize> = (0..target.len()).filter(|&i| target[i]).collect();
    while let Some(t) = stack.pop() {
        for &s in &preds[t] {
            if !seen[s] && through(s) {
                seen[s] = true;
                stack.push(s);
            }
        }
    }
    seen
}

fn verdict(query: &ProbQuery, p: f64) -> CheckValue {
    match query.bound {
        None => CheckValue::Numeric(p),
        Some((cmp, threshold)) => CheckValue::Bool(cmp.holds(p, threshold)),
    }
}

/// One uniformised step `out = pi · P`.
fn uniform_step(
    model: &TruncatedModel,
    absorbing: &[bool],
    q: f64,
    pi: &[f64],
    out: &mut [f64],
) {
    out.fill(0.0);
    for (i, &m) in pi.iter().enumerate() {
        if m == 0.0 {
            continue;
        }
        let exit = model.exit_rate(i);
        if absorbing[i] || exit == 0.0 {
            out[i] += m;
            continue;
        }
        out[i] += m * (1.0 - exit / q);
        for t in model.transitions(i) {
            out[t.target] += m * t.rate / q;
        }
    }
}

impl NumericSolver for ExplicitSolver {
    fn check_query(&self, model: &TruncatedModel, query: &ProbQuery) -> McResult<CheckValue> {
        let (lo, _) = self.query_bounds(model, query)?;
        Ok(verdict(query, lo))
    }

    fn check_query_bound(
        &self,
        model: &TruncatedModel,
        query: &ProbQuery,
        variant: BoundVariant,
    ) -> McResult<CheckValue> {
        let (lo, hi) = self.query_bounds(model, query)?;
        Ok(verdict(
            query,
            match variant {
                BoundVariant::Min => lo,
                BoundVariant::Max => hi,
            },
        ))
    }

    fn absorbing_distribution(
        &self,
        model: &TruncatedModel,
        absorbing: &[bool],
        horizon: Option<f64>,
    ) -> McResult<Vec<f64>> {
        let n = model.num_states();
        if absorbing.len() != n {
            return Err(McError::InternalConsistency(format!(
                "absorbing mask has {} entries for {} states",
                absorbing.len(),
                n
            )));
        }
        if let Some(t) = horizon {
            if !(t >= 0.0 && t.is_finite()) {
                return Err(McError::UnsupportedInterval(format!(
                    "invalid time horizon {}",
                    t
                )));
            }
        }
        let mut pi = vec![0.0; n];
        pi[model.initial()] = 1.0;

        let max_exit = (0..n)
            .filter(|&i| !absorbing[i])
            .map(|i| model.exit_rate(i))
            .fold(0.0, f64::max);
        if max_exit == 0.0 {
            return Ok(pi);
        }
        let q = max_exit * 1.02;
        let mut next = vec![0.0; n];

        match horizon {
            Some(t) => {
                let qt = q * t;
                if qt == 0.0 {
                    return Ok(pi);
                }
                // Poisson(qt) weights, computed in log space to avoid underflow.
                let right = (qt + 8.0 * qt.sqrt() + 20.0).ceil();
                if !(right <= self.config.max_uniformisation_steps as f64) {
                    return Err(McError::SolverDidNotConverge {
                        iterations: self.config.max_uniformisation_steps,
                    });
                }
                let right = right as usize;
                let ln_qt = qt.ln();
                let mut ln_fact = 0.0;
                let mut cumulative = 0.0;
                let mut result = vec![0.0; n];
                for k in 0..=right {
                    if k > 0 {
                        ln_fact += (k as f64).ln();
                        uniform_step(model, absorbing, q, &pi, &mut next);
                        std::mem::swap(&mut pi, &mut next);
                    }
                    let w = (-qt + k as f64 * ln_qt - ln_fact).exp();
                    for (r, &p) in result.iter_mut().zip(&pi) {
                        *r += w * p;
                    }
                    cumulative += w;
                    if k as f64 > qt && 1.0 - cumulative < self.config.epsilon {
                        trace!(steps = k, "transient sum truncated");
                        break;
                    }
                }
                Ok(result)
            }
            None => {
                let transient: Vec<usize> = (0..n)
                    .filter(|&i| !absorbing[i] && model.exit_rate(i) > 0.0)
                    .collect();
                for iteration in 0..=self.config.max_iters {
                    let unsettled: f64 = transient.iter().map(|&i| pi[i]).sum();
                    if unsettled < self.config.epsilon {
                        debug!(iterations = iteration, unsettled, "absorbing distribution converged");
                        return Ok(pi);
                    }
                    uniform_step(model, absorbing, q, &pi, &mut next);
                    std::mem::swap(&mut pi, &mut next);
                }
                Err(McError::SolverDidNotConverge {
                    iterations: self.config.max_iters,
                })
            }
        }
    }
}
