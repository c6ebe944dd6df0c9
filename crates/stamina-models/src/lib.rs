//! Reference CTMC models for STAMINA.
//!
//! [`GuardedModel`] describes a chain as guarded commands over bounded
//! variables and implements [`stamina_mc::ModelOracle`]. The [`library`]
//! module builds the benchmark models used by the CLI and the tests.

pub mod guarded;
pub mod library;

pub use guarded::{
    assign, Assignment, Branch, Command, GuardedModel, ModelBuilder, ModelError, ModelResult,
};
