//! Expressions and CSL probability properties for STAMINA.
//!
//! Models and properties are built programmatically; there is no text parser.
//! Expressions evaluate against an [`Env`] that supplies variable values and
//! reports whether the valuation belongs to the absorbing sentinel state.

pub mod expr;
pub mod property;
pub mod value;

pub use expr::{BinOp, Env, Expr, ExprError, ExprResult, UnaryOp};
pub use property::{
    BoundVariant, Comparison, PathFormula, ProbQuery, Property, TimeInterval, Until,
};
pub use value::Value;
