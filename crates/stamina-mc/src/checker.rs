//! Iterative refinement of probability bounds.
//!
//! Each iteration explores further (kappa keeps shrinking inside the
//! engine), builds the truncated model and computes a lower and an upper
//! bound. The sentinel's mass is what separates them: the lower bound
//! assumes no path through the sentinel satisfies the formula, the upper
//! bound assumes every such path does.

use crate::explorer::{McError, McResult, StaminaConfig, TruncationEngine};
use crate::model::TruncatedModel;
use crate::oracle::ModelOracle;
use crate::solver::{validate_interval, CheckValue, ExplicitSolver, NumericSolver};
use stamina_expr::{BoundVariant, Property, Until};
use std::fmt;
use tracing::{debug, error, info, warn};

/// Outcome of checking one property.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundsResult {
    pub p_min: CheckValue,
    pub p_max: CheckValue,
    /// Refinement iterations performed.
    pub iterations: usize,
    /// Whether the bounds met the window before the iteration cap.
    pub converged: bool,
    /// Kappa after the last exploration.
    pub kappa: f64,
    /// States in the last truncated model, sentinel included.
    pub states: usize,
    pub misprediction_factor: f64,
}

impl BoundsResult {
    /// The reported result is the lower bound.
    pub fn value(&self) -> CheckValue {
        self.p_min
    }
}

impl fmt::Display for BoundsResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.p_min, self.p_max)
    }
}

fn bounds_converged(p_min: CheckValue, p_max: CheckValue, window: f64) -> bool {
    match (p_min, p_max) {
        (CheckValue::Bool(a), CheckValue::Bool(b)) => a == b,
        (CheckValue::Numeric(lo), CheckValue::Numeric(hi)) => hi - lo <= window,
        _ => false,
    }
}

/// Computes `Pmin`/`Pmax` for CSL properties on a possibly infinite CTMC.
pub struct StaminaChecker<O, S = ExplicitSolver> {
    oracle: O,
    solver: S,
    config: StaminaConfig,
}

impl<O: ModelOracle + Clone + Send> StaminaChecker<O, ExplicitSolver> {
    pub fn new(oracle: O, config: StaminaConfig) -> Self {
        Self::with_solver(oracle, ExplicitSolver::default(), config)
    }
}

impl<O: ModelOracle + Clone + Send, S: NumericSolver> StaminaChecker<O, S> {
    pub fn with_solver(oracle: O, solver: S, config: StaminaConfig) -> Self {
        Self {
            oracle,
            solver,
            config,
        }
    }

    pub fn config(&self) -> &StaminaConfig {
        &self.config
    }

    /// Check a single property against a fresh truncation.
    pub fn check(&self, property: &Property) -> McResult<BoundsResult> {
        let path = &property.query.path;
        validate_interval(&path.interval())?;

        let mut engine = TruncationEngine::new(self.oracle.clone(), self.config.clone())?;
        let until = path.to_until();
        let guard = (self.config.prop_refine && until.interval.is_unbounded())
            .then(|| until.clone());
        let combined = self.config.prop_refine && path.as_until().is_some();
        let min_property = property.bound_variant(BoundVariant::Min);
        let max_property = property.bound_variant(BoundVariant::Max);
        let window = self.config.prob_error_window;
        let mut misprediction = self.config.misprediction_factor;

        info!(property = %property, combined, "checking property");

        let mut last = None;
        for iteration in 1..=self.config.max_approx_count {
            engine.set_property_expression(guard.clone());
            let stats = engine.explore(misprediction)?;
            let model = engine.build_model()?;

            let combined_result = if combined {
                self.combined_bounds(&model, &until, property)?
            } else {
                None
            };
            let (p_min, p_max) = match combined_result {
                Some(bounds) => bounds,
                None => (
                    self.solver
                        .check_query_bound(&model, &min_property.query, BoundVariant::Min)?,
                    self.solver
                        .check_query_bound(&model, &max_property.query, BoundVariant::Max)?,
                ),
            };
            info!(
                iteration,
                kappa = stats.kappa,
                states = model.num_states(),
                %p_min,
                %p_max,
                "approximation step"
            );

            let converged = bounds_converged(p_min, p_max, window);
            let result = BoundsResult {
                p_min,
                p_max,
                iterations: iteration,
                converged,
                kappa: engine.kappa(),
                states: model.num_states(),
                misprediction_factor: misprediction,
            };
            if converged {
                return Ok(result);
            }
            if let (CheckValue::Numeric(lo), CheckValue::Numeric(hi)) = (p_min, p_max) {
                let percent_off = (4.0 * (hi - lo) / window).min(100.0);
                misprediction *= percent_off;
                debug!(percent_off, misprediction, "misprediction factor updated");
            }
            engine.clear_perimeter_states();
            last = Some(result);
        }

        warn!(
            property = %property,
            iterations = self.config.max_approx_count,
            "bounds did not reach the probability window"
        );
        last.ok_or_else(|| {
            McError::InvalidConfig("max approximation count must be positive".into())
        })
    }

    /// Check every property independently. A failing property does not stop
    /// the batch.
    pub fn check_all(&self, properties: &[Property]) -> Vec<McResult<BoundsResult>> {
        properties
            .iter()
            .map(|property| {
                let result = self.check(property);
                if let Err(e) = &result {
                    error!(property = %property, error = %e, "property check failed");
                }
                result
            })
            .collect()
    }

    /// One absorbing-distribution solve for both bounds: `Pmin` is the mass
    /// settled on `φ₂` states, `Pmax` is one minus the mass that has settled
    /// where `φ₂` can no longer be reached.
    ///
    /// Returns `None` when the limit does not settle within the solver's
    /// iteration budget, so the caller solves the two bounds separately.
    fn combined_bounds(
        &self,
        model: &TruncatedModel,
        until: &Until,
        property: &Property,
    ) -> McResult<Option<(CheckValue, CheckValue)>> {
        // The Min rewrite keeps relational atoms from being evaluated on the
        // sentinel; its mask entry is fixed below.
        let phi1 = model.satisfying(&until.lhs.bound_variant(BoundVariant::Min))?;
        let phi2 = model.satisfying(&until.rhs.bound_variant(BoundVariant::Min))?;
        let absorbing: Vec<bool> = (0..model.num_states())
            .map(|i| model.is_sentinel(i) || !phi1[i] || phi2[i])
            .collect();
        let horizon = until.interval.upper;
        let pi = match self.solver.absorbing_distribution(model, &absorbing, horizon) {
            Ok(pi) => pi,
            Err(McError::SolverDidNotConverge { iterations }) if horizon.is_none() => {
                debug!(iterations, "absorption did not settle, solving bounds separately");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut p_min = 0.0;
        let mut failed = 0.0;
        for (i, &mass) in pi.iter().enumerate() {
            if model.is_sentinel(i) {
                continue;
            }
            if phi2[i] {
                p_min += mass;
            } else if horizon.is_some() || absorbing[i] || model.exit_rate(i) == 0.0 {
                failed += mass;
            }
        }
        let p_min = p_min.min(1.0);
        let p_max = (1.0 - failed).min(1.0).max(p_min);

        Ok(Some(match property.query.bound {
            None => (CheckValue::Numeric(p_min), CheckValue::Numeric(p_max)),
            Some((cmp, threshold)) => (
                CheckValue::Bool(cmp.holds(p_min, threshold)),
                CheckValue::Bool(cmp.holds(p_max, threshold)),
            ),
        }))
    }
}
