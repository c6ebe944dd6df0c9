//! Model oracle: the state-transition interface the explorer pulls from.

use crate::state::State;
use ahash::AHashMap;
use stamina_expr::ExprError;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    Ctmc,
    Dtmc,
    Mdp,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelType::Ctmc => "CTMC",
            ModelType::Dtmc => "DTMC",
            ModelType::Mdp => "MDP",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VarKind {
    Bool,
    Int { low: i64, high: i64 },
}

/// A declared model variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarDecl {
    pub name: Arc<str>,
    pub kind: VarKind,
}

impl VarDecl {
    pub fn int(name: impl Into<Arc<str>>, low: i64, high: i64) -> Self {
        Self {
            name: name.into(),
            kind: VarKind::Int { low, high },
        }
    }

    pub fn boolean(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            kind: VarKind::Bool,
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        match self.kind {
            VarKind::Bool => value == 0 || value == 1,
            VarKind::Int { low, high } => (low..=high).contains(&value),
        }
    }
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("evaluation error: {0}")]
    Eval(#[from] ExprError),

    #[error("update of '{var}' to {value} leaves its range [{low}, {high}]")]
    OutOfRange {
        var: Arc<str>,
        value: i64,
        low: i64,
        high: i64,
    },

    #[error("unknown state {0}")]
    UnknownState(State),

    #[error("no state explored")]
    NotExplored,

    #[error("transition ({choice}, {offset}) out of range")]
    NoSuchTransition { choice: usize, offset: usize },

    #[error("{0}")]
    Model(String),
}

/// Source of states and transitions for the explorer.
///
/// Mirrors a stateful model generator: [`explore_state`](Self::explore_state)
/// selects the current state, and the other queries describe its outgoing
/// transitions, grouped into choices. A CTMC has a single choice per state.
pub trait ModelOracle {
    fn model_type(&self) -> ModelType;

    fn var_decls(&self) -> &[VarDecl];

    fn initial_state(&self) -> Result<State, OracleError>;

    fn explore_state(&mut self, state: &State) -> Result<(), OracleError>;

    fn num_choices(&self) -> usize;

    fn num_transitions(&self, choice: usize) -> usize;

    fn transition_rate(&self, choice: usize, offset: usize) -> Result<f64, OracleError>;

    fn compute_transition_target(&self, choice: usize, offset: usize)
        -> Result<State, OracleError>;
}

/// An explicitly enumerated CTMC. States without an entry are deadlocks.
#[derive(Debug, Clone)]
pub struct TableOracle {
    decls: Vec<VarDecl>,
    initial: State,
    table: Arc<AHashMap<State, Vec<(f64, State)>>>,
    current: Option<State>,
}

impl TableOracle {
    pub fn new(
        decls: Vec<VarDecl>,
        initial: State,
        transitions: impl IntoIterator<Item = (State, State, f64)>,
    ) -> Self {
        let mut table: AHashMap<State, Vec<(f64, State)>> = AHashMap::new();
        for (from, to, rate) in transitions {
            table.entry(from).or_default().push((rate, to));
        }
        Self {
            decls,
            initial,
            table: Arc::new(table),
            current: None,
        }
    }

    /// A chain over a single integer variable `s`, with edges given by index.
    pub fn indexed(n: usize, initial: usize, edges: &[(usize, usize, f64)]) -> Self {
        let st = |i: usize| State::new(vec![i as i64]);
        Self::new(
            vec![VarDecl::int("s", 0, n.saturating_sub(1) as i64)],
            st(initial),
            edges.iter().map(|&(a, b, r)| (st(a), st(b), r)),
        )
    }

    fn current_row(&self) -> &[(f64, State)] {
        self.current
            .as_ref()
            .and_then(|s| self.table.get(s))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn entry(&self, choice: usize, offset: usize) -> Result<&(f64, State), OracleError> {
        if self.current.is_none() {
            return Err(OracleError::NotExplored);
        }
        if choice != 0 {
            return Err(OracleError::NoSuchTransition { choice, offset });
        }
        self.current_row()
            .get(offset)
            .ok_or(OracleError::NoSuchTransition { choice, offset })
    }
}

impl ModelOracle for TableOracle {
    fn model_type(&self) -> ModelType {
        ModelType::Ctmc
    }

    fn var_decls(&self) -> &[VarDecl] {
        &self.decls
    }

    fn initial_state(&self) -> Result<State, OracleError> {
        Ok(self.initial.clone())
    }

    fn explore_state(&mut self, state: &State) -> Result<(), OracleError> {
        self.current = Some(state.clone());
        Ok(())
    }

    fn num_choices(&self) -> usize {
        1
    }

    fn num_transitions(&self, choice: usize) -> usize {
        if choice == 0 {
            self.current_row().len()
        } else {
            0
        }
    }

    fn transition_rate(&self, choice: usize, offset: usize) -> Result<f64, OracleError> {
        self.entry(choice, offset).map(|(rate, _)| *rate)
    }

    fn compute_transition_target(
        &self,
        choice: usize,
        offset: usize,
    ) -> Result<State, OracleError> {
        self.entry(choice, offset).map(|(_, target)| target.clone())
    }
}
