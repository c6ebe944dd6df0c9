//! State representation and fingerprinting.

use crate::oracle::{VarDecl, VarKind};
use stamina_expr::{Env, Value};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A fingerprint is a 64-bit hash identifying a state.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({:016x})", self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Hash a single variable at a given position (splitmix64-style mixing).
#[inline]
fn hash_var(idx: usize, val: i64) -> u64 {
    let h = ((idx as u64) ^ 0x2d358dccaa6c78a5).wrapping_mul(0x9e3779b97f4a7c15);
    let h = (h ^ (val as u64)).wrapping_mul(0x517cc1b727220a95);
    h ^ (h >> 32)
}

/// fp = XOR of hash_var(i, var[i]) for all i.
fn compute_fingerprint(vars: &[i64]) -> Fingerprint {
    let mut h: u64 = 0;
    for (i, &var) in vars.iter().enumerate() {
        h ^= hash_var(i, var);
    }
    Fingerprint(h)
}

/// A valuation of the model variables. Booleans are stored as 0/1.
///
/// Cloning is an atomic increment; the fingerprint is cached at construction.
#[derive(Debug, Clone)]
pub struct State {
    vars: Arc<[i64]>,
    fp: Fingerprint,
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.fp == other.fp && self.vars == other.vars
    }
}

impl Eq for State {}

impl Hash for State {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.fp.0);
    }
}

impl State {
    pub fn new(vars: Vec<i64>) -> Self {
        let fp = compute_fingerprint(&vars);
        Self {
            vars: vars.into(),
            fp,
        }
    }

    /// The absorbing sentinel valuation: every integer variable one below its
    /// lower bound, every boolean false.
    pub fn absorbing(decls: &[VarDecl]) -> Self {
        Self::new(
            decls
                .iter()
                .map(|d| match d.kind {
                    VarKind::Bool => 0,
                    VarKind::Int { low, .. } => low.saturating_sub(1),
                })
                .collect(),
        )
    }

    #[inline]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fp
    }

    #[inline]
    pub fn vars(&self) -> &[i64] {
        &self.vars
    }

    #[inline]
    pub fn get(&self, idx: usize) -> Option<i64> {
        self.vars.get(idx).copied()
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    /// Identity comparison: true only for clones of the same allocation.
    #[inline]
    pub fn ptr_eq(&self, other: &State) -> bool {
        Arc::ptr_eq(&self.vars, &other.vars)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.vars.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, "]")
    }
}

/// Typed view of a state for expression evaluation.
pub struct StateEnv<'a> {
    pub state: &'a State,
    pub decls: &'a [VarDecl],
    pub absorbing: bool,
}

impl<'a> StateEnv<'a> {
    pub fn new(state: &'a State, decls: &'a [VarDecl]) -> Self {
        Self {
            state,
            decls,
            absorbing: false,
        }
    }

    pub fn sentinel(state: &'a State, decls: &'a [VarDecl]) -> Self {
        Self {
            state,
            decls,
            absorbing: true,
        }
    }
}

impl Env for StateEnv<'_> {
    fn var(&self, index: usize) -> Option<Value> {
        let raw = self.state.get(index)?;
        match self.decls.get(index).map(|d| d.kind) {
            Some(VarKind::Bool) => Some(Value::Bool(raw != 0)),
            _ => Some(Value::Int(raw)),
        }
    }

    fn is_absorbing(&self) -> bool {
        self.absorbing
    }
}
