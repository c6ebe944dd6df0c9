//! CSL probability properties over CTMC paths.

use crate::expr::Expr;
use std::fmt;

/// Which side of the probability bounds a rewritten property computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoundVariant {
    /// Lower bound: the absorbing sentinel never satisfies a state formula.
    Min,
    /// Upper bound: the absorbing sentinel satisfies every state formula.
    Max,
}

impl BoundVariant {
    pub fn suffix(self) -> &'static str {
        match self {
            BoundVariant::Min => "_min",
            BoundVariant::Max => "_max",
        }
    }
}

/// Time bound of a path operator. `upper = None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeInterval {
    pub lower: f64,
    pub upper: Option<f64>,
}

impl TimeInterval {
    pub const UNBOUNDED: TimeInterval = TimeInterval {
        lower: 0.0,
        upper: None,
    };

    /// `[0, t]`.
    pub fn up_to(t: f64) -> Self {
        TimeInterval {
            lower: 0.0,
            upper: Some(t),
        }
    }

    pub fn between(lower: f64, upper: f64) -> Self {
        TimeInterval {
            lower,
            upper: Some(upper),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.lower == 0.0 && self.upper.is_none()
    }
}

impl Default for TimeInterval {
    fn default() -> Self {
        TimeInterval::UNBOUNDED
    }
}

impl fmt::Display for TimeInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.lower, self.upper) {
            (l, None) if l == 0.0 => Ok(()),
            (l, None) => write!(f, ">={}", l),
            (l, Some(u)) if l == 0.0 => write!(f, "<={}", u),
            (l, Some(u)) => write!(f, "[{},{}]", l, u),
        }
    }
}

/// `lhs U[interval] rhs`.
#[derive(Debug, Clone, PartialEq)]
pub struct Until {
    pub lhs: Expr,
    pub rhs: Expr,
    pub interval: TimeInterval,
}

impl Until {
    pub fn new(lhs: Expr, rhs: Expr) -> Self {
        Until {
            lhs,
            rhs,
            interval: TimeInterval::UNBOUNDED,
        }
    }

    pub fn bounded(lhs: Expr, rhs: Expr, interval: TimeInterval) -> Self {
        Until { lhs, rhs, interval }
    }

    pub fn bound_variant(&self, variant: BoundVariant) -> Until {
        Until {
            lhs: self.lhs.bound_variant(variant),
            rhs: self.rhs.bound_variant(variant),
            interval: self.interval,
        }
    }
}

impl fmt::Display for Until {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} U{} {}", self.lhs, self.interval, self.rhs)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PathFormula {
    Until(Until),
    /// `F[interval] target`, i.e. `true U[interval] target`.
    Eventually { target: Expr, interval: TimeInterval },
}

impl PathFormula {
    pub fn interval(&self) -> TimeInterval {
        match self {
            PathFormula::Until(u) => u.interval,
            PathFormula::Eventually { interval, .. } => *interval,
        }
    }

    /// Desugar to a plain until formula.
    pub fn to_until(&self) -> Until {
        match self {
            PathFormula::Until(u) => u.clone(),
            PathFormula::Eventually { target, interval } => Until {
                lhs: Expr::Bool(true),
                rhs: target.clone(),
                interval: *interval,
            },
        }
    }

    /// The formula as written, when it is an explicit until.
    pub fn as_until(&self) -> Option<&Until> {
        match self {
            PathFormula::Until(u) => Some(u),
            PathFormula::Eventually { .. } => None,
        }
    }

    pub fn bound_variant(&self, variant: BoundVariant) -> PathFormula {
        match self {
            PathFormula::Until(u) => PathFormula::Until(u.bound_variant(variant)),
            PathFormula::Eventually { target, interval } => PathFormula::Eventually {
                target: target.bound_variant(variant),
                interval: *interval,
            },
        }
    }
}

impl fmt::Display for PathFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathFormula::Until(u) => write!(f, "{}", u),
            PathFormula::Eventually { target, interval } => write!(f, "F{} {}", interval, target),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    pub fn holds(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Lt => value < threshold,
            Comparison::Le => value <= threshold,
            Comparison::Gt => value > threshold,
            Comparison::Ge => value >= threshold,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
        }
    }
}

/// `P=? [path]` when `bound` is `None`, otherwise `P ⋈ p [path]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbQuery {
    pub bound: Option<(Comparison, f64)>,
    pub path: PathFormula,
}

impl ProbQuery {
    pub fn numeric(path: PathFormula) -> Self {
        ProbQuery { bound: None, path }
    }

    pub fn threshold(cmp: Comparison, p: f64, path: PathFormula) -> Self {
        ProbQuery {
            bound: Some((cmp, p)),
            path,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.bound.is_none()
    }

    pub fn bound_variant(&self, variant: BoundVariant) -> ProbQuery {
        ProbQuery {
            bound: self.bound,
            path: self.path.bound_variant(variant),
        }
    }
}

impl fmt::Display for ProbQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bound {
            None => write!(f, "P=? [ {} ]", self.path),
            Some((cmp, p)) => write!(f, "P{}{} [ {} ]", cmp.symbol(), p, self.path),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: Option<String>,
    pub query: ProbQuery,
}

impl Property {
    pub fn new(query: ProbQuery) -> Self {
        Property { name: None, query }
    }

    pub fn named(name: impl Into<String>, query: ProbQuery) -> Self {
        Property {
            name: Some(name.into()),
            query,
        }
    }

    /// Rewritten copy for one side of the bounds, renamed `<name>_min` or
    /// `<name>_max`.
    pub fn bound_variant(&self, variant: BoundVariant) -> Property {
        let base = self.name.as_deref().unwrap_or("prop");
        Property {
            name: Some(format!("{}{}", base, variant.suffix())),
            query: self.query.bound_variant(variant),
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            write!(f, "\"{}\": ", name)?;
        }
        write!(f, "{}", self.query)
    }
}
