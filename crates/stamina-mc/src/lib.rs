//! Truncated probabilistic reachability for continuous-time Markov chains.
//!
//! The [`TruncationEngine`] explores a CTMC through a [`ModelOracle`],
//! keeping only states whose estimated reachability mass reaches a shrinking
//! threshold (kappa). Everything left unexplored is folded into one absorbing
//! sentinel state, and the [`StaminaChecker`] turns the resulting finite model
//! into lower and upper bounds on a CSL path property.

pub mod checker;
pub mod explorer;
pub mod guard;
pub mod model;
pub mod oracle;
mod parallel;
pub mod solver;
pub mod state;
pub mod store;

pub use checker::{BoundsResult, StaminaChecker};
pub use explorer::{
    ExploreStats, McError, McResult, ProgressCounters, StaminaConfig, TruncationEngine,
};
pub use guard::{GuardDecision, PerimeterState, PropertyGuard};
pub use model::{Transition, TruncatedModel};
pub use oracle::{ModelOracle, ModelType, OracleError, TableOracle, VarDecl, VarKind};
pub use solver::{CheckValue, ExplicitSolver, NumericSolver, SolverConfig, SolverMethod};
pub use state::{Fingerprint, State, StateEnv};
pub use store::{ProbState, StateId, StateRegistry};
