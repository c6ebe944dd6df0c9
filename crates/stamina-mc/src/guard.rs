//! Property-guided truncation for until formulas.
//!
//! For `φ₁ U φ₂`, once a path reaches a state where `φ₁ ∧ ¬φ₂` fails the
//! formula's truth is decided, so the state's successors cannot change the
//! result. The guard makes such states absorbing instead of expanding them.

use crate::explorer::McResult;
use crate::oracle::VarDecl;
use crate::state::{State, StateEnv};
use crate::store::ProbState;
use stamina_expr::Until;
use std::sync::{Mutex, PoisonError};
use tracing::trace;

/// A state the guard stopped at, with the mass it held at that moment.
#[derive(Debug, Clone, PartialEq)]
pub struct PerimeterState {
    pub state: State,
    pub mass: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    Expand,
    /// Made absorbing by this visit.
    Absorbed,
    /// Already absorbing from an earlier visit.
    AlreadyAbsorbed,
}

#[derive(Debug, Clone)]
pub struct PropertyGuard {
    until: Until,
}

impl PropertyGuard {
    pub fn new(until: Until) -> Self {
        Self { until }
    }

    pub fn until(&self) -> &Until {
        &self.until
    }

    /// True when the formula is already decided at `state`: `¬(φ₁ ∧ ¬φ₂)`.
    pub fn stops_at(&self, state: &State, decls: &[VarDecl]) -> McResult<bool> {
        let env = StateEnv::new(state, decls);
        if self.until.rhs.eval_bool(&env)? {
            return Ok(true);
        }
        Ok(!self.until.lhs.eval_bool(&env)?)
    }

    pub fn apply(
        &self,
        ps: &ProbState,
        decls: &[VarDecl],
        perimeter: &Mutex<Vec<PerimeterState>>,
    ) -> McResult<GuardDecision> {
        if ps.is_absorbing() {
            return Ok(GuardDecision::AlreadyAbsorbed);
        }
        if !self.stops_at(ps.state(), decls)? {
            return Ok(GuardDecision::Expand);
        }
        if !ps.mark_absorbing() {
            return Ok(GuardDecision::AlreadyAbsorbed);
        }
        ps.mark_expanded();
        let mass = ps.reachability_prob();
        trace!(state = %ps.state(), mass, "property guard: absorbing");
        perimeter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PerimeterState {
                state: ps.state().clone(),
                mass,
            });
        Ok(GuardDecision::Absorbed)
    }
}
