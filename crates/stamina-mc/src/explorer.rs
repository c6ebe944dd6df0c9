//! Kappa-truncated reachability exploration.

use crate::guard::{GuardDecision, PerimeterState, PropertyGuard};
use crate::model::TruncatedModel;
use crate::oracle::{ModelOracle, ModelType, OracleError, VarDecl};
use crate::parallel;
use crate::state::State;
use crate::store::{StateId, StateRegistry};
use ahash::AHashSet;
use smallvec::SmallVec;
use stamina_expr::{ExprError, Until};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Errors during exploration, model construction or solving.
#[derive(Debug, Error)]
pub enum McError {
    #[error("oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("evaluation error: {0}")]
    Expr(#[from] ExprError),

    #[error("model type {0} is not supported, only CTMCs can be truncated")]
    UnsupportedModelType(ModelType),

    #[error("internal consistency violated: {0}")]
    InternalConsistency(String),

    #[error("probability mass {mass} out of range at state {state}")]
    MassOutOfRange { state: State, mass: f64 },

    #[error("invalid transition rate {rate} at state {state}")]
    InvalidRate { state: State, rate: f64 },

    #[error("unsupported time interval: {0}")]
    UnsupportedInterval(String),

    #[error("numeric solver did not converge within {iterations} iterations")]
    SolverDidNotConverge { iterations: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type McResult<T> = Result<T, McError>;

/// Lock-free progress counters shared between the engine and the CLI.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    pub states: AtomicUsize,
    pub passes: AtomicUsize,
    pub queue_len: AtomicUsize,
    /// States expanded (always increasing across passes).
    pub expanded: AtomicUsize,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Truncation and refinement parameters.
#[derive(Debug, Clone)]
pub struct StaminaConfig {
    /// Initial reachability threshold.
    pub kappa: f64,
    /// Kappa is divided by this after every pass (> 1).
    pub kappa_reduction_factor: f64,
    /// Initial estimate of how far the perimeter underestimates the bound gap.
    pub misprediction_factor: f64,
    /// Target width of `[Pmin, Pmax]`.
    pub prob_error_window: f64,
    /// Maximum number of refinement iterations per property.
    pub max_approx_count: usize,
    /// Maximum number of passes per exploration call.
    pub max_truncation_passes: usize,
    /// Stop expansion at states where an until formula is already decided.
    pub prop_refine: bool,
    /// Whether to use parallel exploration.
    pub parallel: bool,
    /// Number of threads for parallel exploration (0 = use all available).
    pub num_threads: usize,
    pub progress: Option<Arc<ProgressCounters>>,
}

impl Default for StaminaConfig {
    fn default() -> Self {
        Self {
            kappa: 1.0,
            kappa_reduction_factor: 1.25,
            misprediction_factor: 2.0,
            prob_error_window: 1e-3,
            max_approx_count: 10,
            max_truncation_passes: 100,
            prop_refine: true,
            parallel: false,
            num_threads: 0,
            progress: None,
        }
    }
}

impl StaminaConfig {
    pub fn validate(&self) -> McResult<()> {
        let bad = |msg: String| Err(McError::InvalidConfig(msg));
        if !(self.kappa > 0.0 && self.kappa.is_finite()) {
            return bad(format!("kappa must be positive, got {}", self.kappa));
        }
        if !(self.kappa_reduction_factor > 1.0 && self.kappa_reduction_factor.is_finite()) {
            return bad(format!(
                "kappa reduction factor must exceed 1, got {}",
                self.kappa_reduction_factor
            ));
        }
        if !(self.misprediction_factor > 0.0 && self.misprediction_factor.is_finite()) {
            return bad(format!(
                "misprediction factor must be positive, got {}",
                self.misprediction_factor
            ));
        }
        if !(self.prob_error_window > 0.0 && self.prob_error_window.is_finite()) {
            return bad(format!(
                "probability window must be positive, got {}",
                self.prob_error_window
            ));
        }
        if self.max_approx_count == 0 {
            return bad("max approximation count must be positive".into());
        }
        if self.max_truncation_passes == 0 {
            return bad("max truncation passes must be positive".into());
        }
        Ok(())
    }
}

/// Summary of one [`TruncationEngine::explore`] call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExploreStats {
    pub passes: usize,
    pub states: usize,
    pub terminal: usize,
    /// Perimeter estimate of the last pass.
    pub perimeter_reachability: f64,
    /// Perimeter estimate after every pass of this call, in order.
    pub pass_perimeters: Vec<f64>,
    /// Kappa after the last reduction.
    pub kappa: f64,
    /// Whether the pass cap stopped the loop.
    pub capped: bool,
}

/// Everything a single state visit needs, shared by the sequential and
/// parallel passes.
pub(crate) struct PassContext<'a> {
    pub registry: &'a StateRegistry,
    pub decls: &'a [VarDecl],
    pub guard: Option<&'a PropertyGuard>,
    pub perimeter: &'a Mutex<Vec<PerimeterState>>,
    pub kappa: f64,
    pub progress: Option<&'a ProgressCounters>,
}

impl PassContext<'_> {
    /// Process one dequeued state, pushing every successor that received mass.
    pub(crate) fn visit<O: ModelOracle>(
        &self,
        oracle: &mut O,
        id: StateId,
        successors: &mut SmallVec<[StateId; 8]>,
    ) -> McResult<()> {
        let ps = self.registry.get(id).ok_or_else(|| {
            McError::InternalConsistency(format!("state {} missing from registry", id))
        })?;

        if let Some(guard) = self.guard {
            if guard.apply(&ps, self.decls, self.perimeter)? != GuardDecision::Expand {
                return Ok(());
            }
        } else if ps.is_absorbing() {
            return Ok(());
        }

        let mass = ps.reachability_prob();
        if ps.is_terminal() && mass < self.kappa {
            return Ok(());
        }

        oracle.explore_state(ps.state())?;
        let mut edges: SmallVec<[(f64, State); 8]> = SmallVec::new();
        let mut exit_rate = 0.0;
        let mut enabled = 0usize;
        for choice in 0..oracle.num_choices() {
            let nt = oracle.num_transitions(choice);
            enabled += nt;
            for offset in 0..nt {
                let rate = oracle.transition_rate(choice, offset)?;
                if !rate.is_finite() || rate < 0.0 {
                    return Err(McError::InvalidRate {
                        state: ps.state().clone(),
                        rate,
                    });
                }
                exit_rate += rate;
                edges.push((rate, oracle.compute_transition_target(choice, offset)?));
            }
        }

        // Mass is split over the edges leaving the state; self-loops take none.
        let moving_rate: f64 = edges
            .iter()
            .filter(|(_, target)| target != ps.state())
            .map(|(rate, _)| rate)
            .sum();
        let mut fired = 0usize;
        if moving_rate > 0.0 {
            let arrival = ps.shortest_time() + 1.0 / exit_rate;
            for (rate, target) in edges {
                fired += 1;
                if rate == 0.0 || target == *ps.state() {
                    continue;
                }
                let leaving = rate / moving_rate * mass;
                if !leaving.is_finite() || leaving < 0.0 {
                    return Err(McError::MassOutOfRange {
                        state: ps.state().clone(),
                        mass: leaving,
                    });
                }
                let (tid, is_new) = self.registry.find_or_insert(target, 0.0);
                let next = self.registry.get(tid).ok_or_else(|| {
                    McError::InternalConsistency(format!("state {} missing from registry", tid))
                })?;
                if is_new {
                    trace!(state = %next.state(), "discovered state");
                    if let Some(p) = self.progress {
                        p.states.fetch_add(1, Ordering::Relaxed);
                    }
                }
                ps.add_reachability_prob(-leaving);
                next.add_reachability_prob(leaving);
                next.relax_shortest_time(arrival);
                successors.push(tid);
            }
        } else {
            fired = enabled;
        }

        if fired > enabled {
            return Err(McError::InternalConsistency(format!(
                "propagated {} transitions from {} but only {} are enabled",
                fired,
                ps.state(),
                enabled
            )));
        }
        ps.mark_expanded();
        if let Some(p) = self.progress {
            p.expanded.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn sequential_pass<O: ModelOracle>(&self, oracle: &mut O, seeds: Vec<StateId>) -> McResult<()> {
        let mut visited: AHashSet<StateId> = seeds.iter().copied().collect();
        let mut queue: VecDeque<StateId> = seeds.into();
        let mut successors = SmallVec::new();
        while let Some(id) = queue.pop_front() {
            successors.clear();
            self.visit(oracle, id, &mut successors)?;
            for &next in &successors {
                if visited.insert(next) {
                    queue.push_back(next);
                }
            }
            if let Some(p) = self.progress {
                p.queue_len.store(queue.len(), Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

/// Explores a CTMC from its initial state, keeping only states whose
/// reachability mass reaches kappa, and shrinking kappa until the mass parked
/// on unexpanded states is small enough.
///
/// The registry, kappa and guard persist across [`explore`](Self::explore)
/// calls, so each call refines the previous truncation.
pub struct TruncationEngine<O> {
    oracle: O,
    config: StaminaConfig,
    registry: StateRegistry,
    kappa: f64,
    guard: Option<PropertyGuard>,
    perimeter: Mutex<Vec<PerimeterState>>,
    initial: Option<StateId>,
    /// Perimeter reachability at the end of the last uncapped call.
    last_perimeter: f64,
}

impl<O: ModelOracle> TruncationEngine<O> {
    pub fn new(oracle: O, config: StaminaConfig) -> McResult<Self> {
        config.validate()?;
        let model_type = oracle.model_type();
        if model_type != ModelType::Ctmc {
            return Err(McError::UnsupportedModelType(model_type));
        }
        let registry = StateRegistry::new(oracle.var_decls());
        Ok(Self {
            kappa: config.kappa,
            oracle,
            config,
            registry,
            guard: None,
            perimeter: Mutex::new(Vec::new()),
            initial: None,
            last_perimeter: f64::INFINITY,
        })
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn config(&self) -> &StaminaConfig {
        &self.config
    }

    pub fn global_state_set(&self) -> &StateRegistry {
        &self.registry
    }

    pub fn absorbing_state(&self) -> &State {
        self.registry.absorbing_state()
    }

    /// Whether the truncated model built now would need the absorbing sentinel.
    pub fn final_model_has_absorbing(&self) -> bool {
        self.registry.has_terminal()
    }

    pub fn initial_state_id(&self) -> Option<StateId> {
        self.initial
    }

    pub fn perimeter_states(&self) -> Vec<PerimeterState> {
        self.perimeter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear_perimeter_states(&self) {
        self.perimeter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn kappa(&self) -> f64 {
        self.kappa
    }

    pub fn set_reachability_threshold(&mut self, kappa: f64) -> McResult<()> {
        if !(kappa > 0.0 && kappa.is_finite()) {
            return Err(McError::InvalidConfig(format!(
                "kappa must be positive, got {}",
                kappa
            )));
        }
        self.kappa = kappa;
        Ok(())
    }

    /// Install (or remove) the property guard for subsequent passes.
    pub fn set_property_expression(&mut self, until: Option<Until>) {
        self.guard = until.map(PropertyGuard::new);
    }

    /// Build the finite CTMC over the current registry.
    pub fn build_model(&mut self) -> McResult<TruncatedModel> {
        let initial = self.ensure_initial()?;
        TruncatedModel::build(&mut self.oracle, &self.registry, initial)
    }

    fn ensure_initial(&mut self) -> McResult<StateId> {
        if let Some(id) = self.initial {
            return Ok(id);
        }
        let init = self.oracle.initial_state()?;
        let (id, is_new) = self.registry.find_or_insert(init, 1.0);
        if let Some(ps) = self.registry.get(id) {
            ps.relax_shortest_time(0.0);
        }
        if is_new {
            if let Some(p) = &self.config.progress {
                p.states.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.initial = Some(id);
        Ok(id)
    }
}

impl<O: ModelOracle + Clone + Send> TruncationEngine<O> {
    /// Run truncation passes until `kappa × |terminal| < w / misprediction_factor`
    /// and the perimeter is no larger than at the end of the previous call.
    pub fn explore(&mut self, misprediction_factor: f64) -> McResult<ExploreStats> {
        if !(misprediction_factor > 0.0 && misprediction_factor.is_finite()) {
            return Err(McError::InvalidConfig(format!(
                "misprediction factor must be positive, got {}",
                misprediction_factor
            )));
        }
        self.ensure_initial()?;
        let threshold = self.config.prob_error_window / misprediction_factor;
        let pool = if self.config.parallel {
            Some(parallel::worker_pool(self.config.num_threads)?)
        } else {
            None
        };

        info!(
            kappa = self.kappa,
            states = self.registry.len(),
            threshold,
            parallel = self.config.parallel,
            "starting truncation"
        );

        let decls = self.oracle.var_decls().to_vec();
        let mut passes = 0;
        let mut capped = false;
        let mut pass_perimeters = Vec::new();
        let (terminal, perimeter) = loop {
            let seeds = self.registry.seeds();
            let ctx = PassContext {
                registry: &self.registry,
                decls: &decls,
                guard: self.guard.as_ref(),
                perimeter: &self.perimeter,
                kappa: self.kappa,
                progress: self.config.progress.as_deref(),
            };
            match &pool {
                Some(pool) => parallel::run_pass(pool, &ctx, &self.oracle, seeds)?,
                None => ctx.sequential_pass(&mut self.oracle, seeds)?,
            }
            passes += 1;

            let terminal = self.registry.terminal_count();
            let perimeter = self.kappa * terminal as f64;
            pass_perimeters.push(perimeter);
            debug!(
                pass = passes,
                kappa = self.kappa,
                states = self.registry.len(),
                terminal,
                perimeter,
                "truncation pass complete"
            );
            self.kappa /= self.config.kappa_reduction_factor;
            if let Some(p) = &self.config.progress {
                p.passes.fetch_add(1, Ordering::Relaxed);
            }

            // A later call never ends on a larger perimeter than an earlier one.
            if perimeter < threshold && perimeter <= self.last_perimeter {
                break (terminal, perimeter);
            }
            if passes >= self.config.max_truncation_passes {
                warn!(
                    passes,
                    perimeter, threshold, "pass limit reached before perimeter fell below threshold"
                );
                capped = true;
                break (terminal, perimeter);
            }
        };
        if !capped {
            self.last_perimeter = perimeter;
        }

        let stats = ExploreStats {
            passes,
            states: self.registry.len(),
            terminal,
            perimeter_reachability: perimeter,
            pass_perimeters,
            kappa: self.kappa,
            capped,
        };
        info!(
            states = stats.states,
            terminal = stats.terminal,
            passes = stats.passes,
            kappa = stats.kappa,
            "truncation complete"
        );
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::TableOracle;
    use stamina_expr::Expr;

    /// s=0 -> s=1 -> s=2, rate 1 each.
    fn chain() -> TableOracle {
        TableOracle::indexed(3, 0, &[(0, 1, 1.0), (1, 2, 1.0)])
    }

    fn mass_of(engine: &TruncationEngine<TableOracle>, s: i64) -> f64 {
        let reg = engine.global_state_set();
        reg.lookup(&State::new(vec![s]))
            .and_then(|id| reg.get(id))
            .map(|ps| ps.reachability_prob())
            .unwrap_or(0.0)
    }

    #[test]
    fn test_chain_mass_reaches_sink() {
        let config = StaminaConfig {
            kappa: 0.5,
            kappa_reduction_factor: 10.0,
            prop_refine: false,
            ..Default::default()
        };
        let mut engine = TruncationEngine::new(chain(), config).unwrap();
        let stats = engine.explore(2.0).unwrap();

        assert_eq!(stats.states, 3);
        assert_eq!(stats.terminal, 0);
        assert!(!engine.final_model_has_absorbing());
        assert!(mass_of(&engine, 0).abs() < 1e-12);
        assert!(mass_of(&engine, 1).abs() < 1e-12);
        assert!((mass_of(&engine, 2) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_guard_stops_at_decided_state() {
        let s = Expr::var(0, "s");
        let mut engine = TruncationEngine::new(chain(), StaminaConfig::default()).unwrap();
        engine.set_property_expression(Some(Until::new(Expr::Bool(true), s.equals(1))));
        engine.explore(2.0).unwrap();

        let reg = engine.global_state_set();
        let b = reg.get(reg.lookup(&State::new(vec![1])).unwrap()).unwrap();
        assert!(b.is_absorbing());
        assert!(!b.is_terminal());
        assert!(reg.lookup(&State::new(vec![2])).is_none());
        assert_eq!(engine.perimeter_states().len(), 1);
        assert!((mass_of(&engine, 1) - 1.0).abs() < 1e-12);

        engine.clear_perimeter_states();
        assert!(engine.perimeter_states().is_empty());
    }

    #[test]
    fn test_first_expansion_moves_all_mass_forward() {
        let config = StaminaConfig {
            kappa: 0.5,
            kappa_reduction_factor: 10.0,
            prop_refine: false,
            ..Default::default()
        };
        let mut engine = TruncationEngine::new(chain(), config).unwrap();
        let a = engine.ensure_initial().unwrap();
        let decls = engine.oracle.var_decls().to_vec();
        let ctx = PassContext {
            registry: &engine.registry,
            decls: &decls,
            guard: None,
            perimeter: &engine.perimeter,
            kappa: engine.kappa,
            progress: None,
        };
        let mut successors = SmallVec::new();
        ctx.visit(&mut engine.oracle, a, &mut successors).unwrap();

        let reg = &engine.registry;
        let b = reg.lookup(&State::new(vec![1])).unwrap();
        assert_eq!(successors.as_slice(), &[b]);
        assert!(!reg.get(a).unwrap().is_terminal());
        assert!(reg.get(b).unwrap().is_terminal());
        assert!(mass_of(&engine, 0).abs() < 1e-12);
        assert!((mass_of(&engine, 1) - 1.0).abs() < 1e-12);
        assert_eq!(engine.kappa * reg.terminal_count() as f64, 0.5);

        engine.explore(2.0).unwrap();
        assert!(mass_of(&engine, 1).abs() < 1e-12);
        assert!((mass_of(&engine, 2) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_guard_absorbs_state_where_formula_fails() {
        // `s=0 U s=2` is already false at s=1.
        let s = Expr::var(0, "s");
        let mut engine = TruncationEngine::new(chain(), StaminaConfig::default()).unwrap();
        engine.set_property_expression(Some(Until::new(s.clone().equals(0), s.equals(2))));
        engine.explore(2.0).unwrap();

        let reg = engine.global_state_set();
        let b = reg.get(reg.lookup(&State::new(vec![1])).unwrap()).unwrap();
        assert!(b.is_absorbing());
        assert!(reg.lookup(&State::new(vec![2])).is_none());
        assert_eq!(reg.len(), 2);
        assert_eq!(engine.perimeter_states().len(), 1);
    }

    #[test]
    fn test_self_loop_keeps_mass() {
        let oracle = TableOracle::indexed(2, 0, &[(0, 0, 0.5), (0, 1, 1.5)]);
        let mut engine = TruncationEngine::new(oracle, StaminaConfig::default()).unwrap();
        engine.explore(2.0).unwrap();
        assert!(mass_of(&engine, 0).abs() < 1e-12);
        assert!((mass_of(&engine, 1) - 1.0).abs() < 1e-12);

        let lone = TableOracle::indexed(1, 0, &[(0, 0, 0.5)]);
        let config = StaminaConfig {
            kappa: 0.05,
            max_truncation_passes: 1,
            ..Default::default()
        };
        let mut engine = TruncationEngine::new(lone, config).unwrap();
        let stats = engine.explore(2.0).unwrap();
        assert_eq!(stats.terminal, 0);
        assert_eq!(mass_of(&engine, 0), 1.0);
    }

    #[test]
    fn test_pass_perimeters_can_rise_within_a_call() {
        // Fan-out tree: 0 -> 1..=4, each child c -> 4c+1..=4c+4.
        let mut edges = Vec::new();
        for c in 1..=4 {
            edges.push((0, c, 1.0));
            for g in 1..=4 {
                edges.push((c, 4 * c + g, 1.0));
            }
        }
        let oracle = TableOracle::indexed(21, 0, &edges);
        let mut engine = TruncationEngine::new(oracle, StaminaConfig::default()).unwrap();
        let stats = engine.explore(2.0).unwrap();

        assert!(!stats.capped);
        assert_eq!(stats.states, 21);
        assert_eq!(stats.pass_perimeters.len(), stats.passes);
        assert_eq!(stats.pass_perimeters[0], 4.0);
        assert!(stats.pass_perimeters.windows(2).any(|w| w[1] > w[0]));
        assert_eq!(stats.perimeter_reachability, 0.0);
        assert_eq!(stats.pass_perimeters.last(), Some(&0.0));
    }

    #[test]
    fn test_mass_is_conserved_on_branching_model() {
        let oracle = TableOracle::indexed(
            6,
            0,
            &[
                (0, 1, 3.0),
                (0, 2, 1.0),
                (1, 3, 2.0),
                (1, 0, 1.0),
                (2, 4, 0.5),
                (3, 5, 4.0),
                (4, 2, 1.0),
            ],
        );
        let config = StaminaConfig {
            max_truncation_passes: 5,
            ..Default::default()
        };
        let mut engine = TruncationEngine::new(oracle, config).unwrap();
        engine.explore(2.0).unwrap();
        let total = engine.global_state_set().total_mass();
        assert!((total - 1.0).abs() < 1e-9, "total mass {}", total);
    }

    #[test]
    fn test_kappa_persists_across_calls() {
        let config = StaminaConfig {
            max_truncation_passes: 1,
            ..Default::default()
        };
        let oracle = TableOracle::indexed(3, 0, &[(0, 1, 1.0), (0, 2, 1.0)]);
        let mut engine = TruncationEngine::new(oracle, config).unwrap();
        let first = engine.explore(2.0).unwrap();
        assert!(first.capped);
        assert!((engine.kappa() - 0.8).abs() < 1e-12);
        engine.explore(2.0).unwrap();
        assert!((engine.kappa() - 0.64).abs() < 1e-12);

        engine.set_reachability_threshold(1e-6).unwrap();
        assert_eq!(engine.kappa(), 1e-6);
        assert!(engine.set_reachability_threshold(0.0).is_err());
    }

    #[test]
    fn test_invalid_rate_is_an_error() {
        let oracle = TableOracle::indexed(2, 0, &[(0, 1, f64::NAN)]);
        let mut engine = TruncationEngine::new(oracle, StaminaConfig::default()).unwrap();
        assert!(matches!(
            engine.explore(2.0),
            Err(McError::InvalidRate { .. })
        ));
    }

    #[test]
    fn test_config_validation() {
        let config = StaminaConfig {
            kappa_reduction_factor: 1.0,
            ..Default::default()
        };
        assert!(matches!(
            TruncationEngine::new(chain(), config),
            Err(McError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_deadlock_keeps_mass() {
        let oracle = TableOracle::indexed(1, 0, &[]);
        let mut engine = TruncationEngine::new(oracle, StaminaConfig::default()).unwrap();
        let stats = engine.explore(2.0).unwrap();
        assert_eq!(stats.states, 1);
        assert_eq!(stats.terminal, 0);
        assert_eq!(mass_of(&engine, 0), 1.0);
    }
}
