//! Expression tree and evaluator.

use crate::property::BoundVariant;
use crate::value::Value;
use std::fmt;
use std::ops;
use std::sync::Arc;
use thiserror::Error;

/// Expression evaluation error.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExprError {
    #[error("type mismatch in '{op}': expected {expected}, got {actual}")]
    TypeMismatch {
        op: &'static str,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("undefined variable '{name}' at index {index}")]
    UndefinedVariable { index: usize, name: Arc<str> },

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow in '{0}'")]
    Overflow(&'static str),

    #[error("arithmetic produced a non-finite value in '{0}'")]
    NonFinite(&'static str),
}

pub type ExprResult<T> = Result<T, ExprError>;

/// Valuation an expression is evaluated against.
pub trait Env {
    /// Value of the variable at `index`, or `None` if out of range.
    fn var(&self, index: usize) -> Option<Value>;

    /// Whether this valuation is the absorbing sentinel state.
    fn is_absorbing(&self) -> bool {
        false
    }
}

impl Env for [Value] {
    fn var(&self, index: usize) -> Option<Value> {
        self.get(index).copied()
    }
}

impl Env for Vec<Value> {
    fn var(&self, index: usize) -> Option<Value> {
        self.get(index).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    // Logical
    And,
    Or,
    Implies,
    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    /// Relational operators are the atomic state comparisons that the
    /// bound variants rewrite.
    pub fn is_relational(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::And => "&",
            BinOp::Or => "|",
            BinOp::Implies => "=>",
            BinOp::Eq => "=",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
        }
    }

    fn precedence(self) -> u8 {
        match self {
            BinOp::Implies => 1,
            BinOp::Or => 2,
            BinOp::And => 3,
            BinOp::Eq | BinOp::Ne => 4,
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => 5,
            BinOp::Add | BinOp::Sub => 6,
            BinOp::Mul | BinOp::Div => 7,
        }
    }
}

/// An expression over model variables.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Bool(bool),
    Int(i64),
    Real(f64),
    /// Model variable, by index into the model's variable declarations.
    Var { index: usize, name: Arc<str> },
    /// True exactly on the absorbing sentinel state.
    Absorbing,
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Ite {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
}

impl Expr {
    pub fn var(index: usize, name: impl Into<Arc<str>>) -> Self {
        Expr::Var {
            index,
            name: name.into(),
        }
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn and(self, rhs: Expr) -> Self {
        Expr::binary(BinOp::And, self, rhs)
    }

    pub fn or(self, rhs: Expr) -> Self {
        Expr::binary(BinOp::Or, self, rhs)
    }

    pub fn implies(self, rhs: Expr) -> Self {
        Expr::binary(BinOp::Implies, self, rhs)
    }

    pub fn equals(self, rhs: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::Eq, self, rhs.into())
    }

    pub fn not_equals(self, rhs: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::Ne, self, rhs.into())
    }

    pub fn lt(self, rhs: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::Lt, self, rhs.into())
    }

    pub fn le(self, rhs: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::Le, self, rhs.into())
    }

    pub fn gt(self, rhs: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::Gt, self, rhs.into())
    }

    pub fn ge(self, rhs: impl Into<Expr>) -> Self {
        Expr::binary(BinOp::Ge, self, rhs.into())
    }

    pub fn ite(cond: Expr, then_branch: impl Into<Expr>, else_branch: impl Into<Expr>) -> Self {
        Expr::Ite {
            cond: Box::new(cond),
            then_branch: Box::new(then_branch.into()),
            else_branch: Box::new(else_branch.into()),
        }
    }

    /// Evaluate against a valuation.
    pub fn eval(&self, env: &dyn Env) -> ExprResult<Value> {
        match self {
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Real(r) => Ok(Value::Real(*r)),
            Expr::Var { index, name } => {
                env.var(*index).ok_or_else(|| ExprError::UndefinedVariable {
                    index: *index,
                    name: name.clone(),
                })
            }
            Expr::Absorbing => Ok(Value::Bool(env.is_absorbing())),
            Expr::Unary { op, operand } => {
                let v = operand.eval(env)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!expect_bool("!", v)?)),
                    UnaryOp::Neg => match v {
                        Value::Int(n) => n
                            .checked_neg()
                            .map(Value::Int)
                            .ok_or(ExprError::Overflow("-")),
                        Value::Real(r) => Ok(Value::Real(-r)),
                        Value::Bool(_) => Err(mismatch("-", "number", v)),
                    },
                }
            }
            Expr::Binary { op, left, right } => eval_binary(*op, left, right, env),
            Expr::Ite {
                cond,
                then_branch,
                else_branch,
            } => {
                if expect_bool("?", cond.eval(env)?)? {
                    then_branch.eval(env)
                } else {
                    else_branch.eval(env)
                }
            }
        }
    }

    pub fn eval_bool(&self, env: &dyn Env) -> ExprResult<bool> {
        expect_bool("condition", self.eval(env)?)
    }

    pub fn eval_f64(&self, env: &dyn Env) -> ExprResult<f64> {
        let v = self.eval(env)?;
        v.as_f64().ok_or_else(|| mismatch("rate", "number", v))
    }

    /// Rewrite every atomic comparison for one side of the probability
    /// bounds: `Min` makes the sentinel fail each comparison, `Max` makes it
    /// satisfy each comparison.
    pub fn bound_variant(&self, variant: BoundVariant) -> Expr {
        match self {
            Expr::Binary { op, .. } if op.is_relational() => match variant {
                BoundVariant::Min => (!Expr::Absorbing).and(self.clone()),
                BoundVariant::Max => Expr::Absorbing.or(self.clone()),
            },
            Expr::Binary { op, left, right } => Expr::binary(
                *op,
                left.bound_variant(variant),
                right.bound_variant(variant),
            ),
            Expr::Unary { op, operand } => Expr::Unary {
                op: *op,
                operand: Box::new(operand.bound_variant(variant)),
            },
            Expr::Ite {
                cond,
                then_branch,
                else_branch,
            } => Expr::Ite {
                cond: Box::new(cond.bound_variant(variant)),
                then_branch: Box::new(then_branch.bound_variant(variant)),
                else_branch: Box::new(else_branch.bound_variant(variant)),
            },
            _ => self.clone(),
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Binary { op, .. } => op.precedence(),
            Expr::Ite { .. } => 0,
            _ => u8::MAX,
        }
    }
}

fn mismatch(op: &'static str, expected: &'static str, actual: Value) -> ExprError {
    ExprError::TypeMismatch {
        op,
        expected,
        actual: actual.type_name(),
    }
}

fn expect_bool(op: &'static str, v: Value) -> ExprResult<bool> {
    v.as_bool().ok_or_else(|| mismatch(op, "bool", v))
}

fn finite(op: &'static str, r: f64) -> ExprResult<Value> {
    if r.is_finite() {
        Ok(Value::Real(r))
    } else {
        Err(ExprError::NonFinite(op))
    }
}

fn eval_binary(op: BinOp, left: &Expr, right: &Expr, env: &dyn Env) -> ExprResult<Value> {
    let sym = op.symbol();
    match op {
        BinOp::And => {
            if !expect_bool(sym, left.eval(env)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(expect_bool(sym, right.eval(env)?)?))
        }
        BinOp::Or => {
            if expect_bool(sym, left.eval(env)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(expect_bool(sym, right.eval(env)?)?))
        }
        BinOp::Implies => {
            if !expect_bool(sym, left.eval(env)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(expect_bool(sym, right.eval(env)?)?))
        }
        BinOp::Eq | BinOp::Ne => {
            let (l, r) = (left.eval(env)?, right.eval(env)?);
            let equal = match (l, r) {
                (Value::Bool(a), Value::Bool(b)) => a == b,
                (Value::Int(a), Value::Int(b)) => a == b,
                _ => match (l.as_f64(), r.as_f64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => return Err(mismatch(sym, l.type_name(), r)),
                },
            };
            Ok(Value::Bool(if op == BinOp::Eq { equal } else { !equal }))
        }
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let (l, r) = (left.eval(env)?, right.eval(env)?);
            let ord = match (l, r) {
                (Value::Int(a), Value::Int(b)) => a.partial_cmp(&b),
                _ => {
                    let a = l.as_f64().ok_or_else(|| mismatch(sym, "number", l))?;
                    let b = r.as_f64().ok_or_else(|| mismatch(sym, "number", r))?;
                    a.partial_cmp(&b)
                }
            };
            let Some(ord) = ord else {
                return Ok(Value::Bool(false));
            };
            Ok(Value::Bool(match op {
                BinOp::Lt => ord.is_lt(),
                BinOp::Le => ord.is_le(),
                BinOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }
        BinOp::Add | BinOp::Sub | BinOp::Mul => {
            let (l, r) = (left.eval(env)?, right.eval(env)?);
            if let (Value::Int(a), Value::Int(b)) = (l, r) {
                let out = match op {
                    BinOp::Add => a.checked_add(b),
                    BinOp::Sub => a.checked_sub(b),
                    _ => a.checked_mul(b),
                };
                return out.map(Value::Int).ok_or(ExprError::Overflow(sym));
            }
            let a = l.as_f64().ok_or_else(|| mismatch(sym, "number", l))?;
            let b = r.as_f64().ok_or_else(|| mismatch(sym, "number", r))?;
            finite(
                sym,
                match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    _ => a * b,
                },
            )
        }
        BinOp::Div => {
            let (l, r) = (left.eval(env)?, right.eval(env)?);
            let a = l.as_f64().ok_or_else(|| mismatch(sym, "number", l))?;
            let b = r.as_f64().ok_or_else(|| mismatch(sym, "number", r))?;
            if b == 0.0 {
                return Err(ExprError::DivisionByZero);
            }
            finite(sym, a / b)
        }
    }
}

impl From<bool> for Expr {
    fn from(b: bool) -> Self {
        Expr::Bool(b)
    }
}

impl From<i64> for Expr {
    fn from(n: i64) -> Self {
        Expr::Int(n)
    }
}

impl From<i32> for Expr {
    fn from(n: i32) -> Self {
        Expr::Int(n as i64)
    }
}

impl From<f64> for Expr {
    fn from(r: f64) -> Self {
        Expr::Real(r)
    }
}

impl ops::Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Not,
            operand: Box::new(self),
        }
    }
}

impl ops::Neg for Expr {
    type Output = Expr;

    fn neg(self) -> Expr {
        Expr::Unary {
            op: UnaryOp::Neg,
            operand: Box::new(self),
        }
    }
}

macro_rules! arith_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl<R: Into<Expr>> ops::$trait<R> for Expr {
            type Output = Expr;

            fn $method(self, rhs: R) -> Expr {
                Expr::binary($op, self, rhs.into())
            }
        }
    };
}

arith_op!(Add, add, BinOp::Add);
arith_op!(Sub, sub, BinOp::Sub);
arith_op!(Mul, mul, BinOp::Mul);
arith_op!(Div, div, BinOp::Div);

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Bool(b) => write!(f, "{}", b),
            Expr::Int(n) => write!(f, "{}", n),
            Expr::Real(r) => write!(f, "{:?}", r),
            Expr::Var { name, .. } => write!(f, "{}", name),
            Expr::Absorbing => write!(f, "\"absorbing\""),
            Expr::Unary { op, operand } => {
                let sym = match op {
                    UnaryOp::Not => "!",
                    UnaryOp::Neg => "-",
                };
                if operand.precedence() == u8::MAX {
                    write!(f, "{}{}", sym, operand)
                } else {
                    write!(f, "{}({})", sym, operand)
                }
            }
            Expr::Binary { op, left, right } => {
                let prec = op.precedence();
                if left.precedence() < prec {
                    write!(f, "({})", left)?;
                } else {
                    write!(f, "{}", left)?;
                }
                write!(f, " {} ", op.symbol())?;
                // Right operand parenthesised on ties: all operators are printed left-associative.
                if right.precedence() <= prec {
                    write!(f, "({})", right)
                } else {
                    write!(f, "{}", right)
                }
            }
            Expr::Ite {
                cond,
                then_branch,
                else_branch,
            } => write!(f, "({} ? {} : {})", cond, then_branch, else_branch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sentinel;

    impl Env for Sentinel {
        fn var(&self, index: usize) -> Option<Value> {
            match index {
                0 => Some(Value::Int(-1)),
                _ => Some(Value::Bool(false)),
            }
        }

        fn is_absorbing(&self) -> bool {
            true
        }
    }

    fn x() -> Expr {
        Expr::var(0, "x")
    }

    fn flag() -> Expr {
        Expr::var(1, "flag")
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        let env = vec![Value::Int(4), Value::Bool(true)];
        assert_eq!((x() + 3).eval(&env).unwrap(), Value::Int(7));
        assert_eq!((x() * 0.5).eval(&env).unwrap(), Value::Real(2.0));
        assert_eq!((x() / 8).eval(&env).unwrap(), Value::Real(0.5));
        assert!(x().ge(4).eval_bool(&env).unwrap());
        assert!(x().lt(4.5).eval_bool(&env).unwrap());
        assert!(flag().equals(true).eval_bool(&env).unwrap());
    }

    #[test]
    fn test_short_circuit_skips_errors() {
        let env = vec![Value::Int(0), Value::Bool(false)];
        let bad = (x() / 0).gt(1);
        assert!(!flag().and(bad.clone()).eval_bool(&env).unwrap());
        assert!((!flag()).or(bad.clone()).eval_bool(&env).unwrap());
        assert_eq!(bad.eval(&env), Err(ExprError::DivisionByZero));
    }

    #[test]
    fn test_type_errors() {
        let env = vec![Value::Int(1), Value::Bool(true)];
        assert!(matches!(
            (flag() + 1).eval(&env),
            Err(ExprError::TypeMismatch { .. })
        ));
        assert!(matches!(
            Expr::var(7, "ghost").eval(&env),
            Err(ExprError::UndefinedVariable { index: 7, .. })
        ));
        assert_eq!(
            (Expr::Int(i64::MAX) + 1).eval(&env),
            Err(ExprError::Overflow("+"))
        );
    }

    #[test]
    fn test_bound_variants_on_sentinel() {
        let target = x().ge(5).and(flag().equals(true));
        let min = target.bound_variant(BoundVariant::Min);
        let max = target.bound_variant(BoundVariant::Max);

        // The sentinel fails every comparison under Min and satisfies every
        // comparison under Max, regardless of its variable values.
        assert!(!min.eval_bool(&Sentinel).unwrap());
        assert!(max.eval_bool(&Sentinel).unwrap());

        // Ordinary states are unaffected.
        let env = vec![Value::Int(6), Value::Bool(true)];
        assert!(min.eval_bool(&env).unwrap());
        assert!(max.eval_bool(&env).unwrap());
        let env = vec![Value::Int(2), Value::Bool(true)];
        assert!(!min.eval_bool(&env).unwrap());
        assert!(!max.eval_bool(&env).unwrap());
    }

    #[test]
    fn test_display() {
        let e = x().ge(5).and(flag().or(x().lt(2)));
        assert_eq!(e.to_string(), "x >= 5 & (flag | x < 2)");
        assert_eq!((x() - (x() - 1)).to_string(), "x - (x - 1)");
        assert_eq!((!flag()).to_string(), "!flag");
        assert_eq!(
            x().equals(1).bound_variant(BoundVariant::Min).to_string(),
            "!\"absorbing\" & x = 1"
        );
    }
}
