//! Finite CTMC over the explored states, closed off by the absorbing sentinel.

use crate::explorer::{McError, McResult};
use crate::oracle::{ModelOracle, VarDecl};
use crate::state::{State, StateEnv};
use crate::store::{StateId, StateRegistry};
use smallvec::SmallVec;
use stamina_expr::Expr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub target: usize,
    pub rate: f64,
}

/// The truncated model handed to the numeric solver.
///
/// When any registry state is still unexpanded, index 0 is the absorbing
/// sentinel and every transition leaving the explored region points to it.
/// States stopped by the property guard have no outgoing transitions.
#[derive(Debug, Clone)]
pub struct TruncatedModel {
    decls: Vec<VarDecl>,
    states: Vec<State>,
    transitions: Vec<SmallVec<[Transition; 4]>>,
    exit_rates: Vec<f64>,
    initial: usize,
    has_absorbing: bool,
}

impl TruncatedModel {
    pub fn build<O: ModelOracle>(
        oracle: &mut O,
        registry: &StateRegistry,
        initial: StateId,
    ) -> McResult<Self> {
        let snapshot = registry.snapshot();
        let has_absorbing = snapshot.iter().any(|ps| ps.is_terminal());
        let offset = usize::from(has_absorbing);
        let num_states = snapshot.len() + offset;

        let mut states = Vec::with_capacity(num_states);
        let mut transitions = Vec::with_capacity(num_states);
        if has_absorbing {
            states.push(registry.absorbing_state().clone());
            transitions.push(SmallVec::new());
        }

        for ps in &snapshot {
            states.push(ps.state().clone());
            let mut row: SmallVec<[Transition; 4]> = SmallVec::new();
            if ps.is_absorbing() {
                transitions.push(row);
                continue;
            }
            oracle.explore_state(ps.state())?;
            for choice in 0..oracle.num_choices() {
                for k in 0..oracle.num_transitions(choice) {
                    let rate = oracle.transition_rate(choice, k)?;
                    if !rate.is_finite() || rate < 0.0 {
                        return Err(McError::InvalidRate {
                            state: ps.state().clone(),
                            rate,
                        });
                    }
                    if rate == 0.0 {
                        continue;
                    }
                    let target = oracle.compute_transition_target(choice, k)?;
                    let index = match registry.lookup(&target) {
                        Some(id) if id.index() + offset < num_states => id.index() + offset,
                        _ if has_absorbing => 0,
                        _ => {
                            return Err(McError::InternalConsistency(format!(
                                "successor {} of {} is not in the explored model",
                                target,
                                ps.state()
                            )))
                        }
                    };
                    match row.iter_mut().find(|t| t.target == index) {
                        Some(t) => t.rate += rate,
                        None => row.push(Transition {
                            target: index,
                            rate,
                        }),
                    }
                }
            }
            transitions.push(row);
        }

        let exit_rates = transitions
            .iter()
            .map(|row| row.iter().map(|t| t.rate).sum())
            .collect();
        debug!(
            states = num_states,
            has_absorbing,
            transitions = transitions.iter().map(|r| r.len()).sum::<usize>(),
            "built truncated model"
        );

        Ok(Self {
            decls: oracle.var_decls().to_vec(),
            states,
            transitions,
            exit_rates,
            initial: initial.index() + offset,
            has_absorbing,
        })
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn initial(&self) -> usize {
        self.initial
    }

    pub fn state(&self, i: usize) -> &State {
        &self.states[i]
    }

    pub fn transitions(&self, i: usize) -> &[Transition] {
        &self.transitions[i]
    }

    pub fn exit_rate(&self, i: usize) -> f64 {
        self.exit_rates[i]
    }

    pub fn has_absorbing(&self) -> bool {
        self.has_absorbing
    }

    #[inline]
    pub fn is_sentinel(&self, i: usize) -> bool {
        self.has_absorbing && i == 0
    }

    pub fn sentinel(&self) -> Option<usize> {
        self.has_absorbing.then_some(0)
    }

    pub fn var_decls(&self) -> &[VarDecl] {
        &self.decls
    }

    /// Evaluate a state formula on every state. The sentinel is evaluated
    /// with `"absorbing"` true.
    pub fn satisfying(&self, expr: &Expr) -> McResult<Vec<bool>> {
        self.states
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let env = if self.is_sentinel(i) {
                    StateEnv::sentinel(s, &self.decls)
                } else {
                    StateEnv::new(s, &self.decls)
                };
                Ok(expr.eval_bool(&env)?)
            })
            .collect()
    }

    pub fn predecessors(&self) -> Vec<Vec<usize>> {
        let mut preds = vec![Vec::new(); self.num_states()];
        for (s, row) in self.transitions.iter().enumerate() {
            for t in row {
                preds[t.target].push(s);
            }
        }
        preds
    }
}
