//! Guarded-command CTMC descriptions.
//!
//! A model is a list of commands `[action] guard -> rate : updates + ...`.
//! In a state, every command whose guard holds contributes one transition
//! per branch; all updates of a branch read the source state.

use stamina_expr::{Expr, ExprError};
use stamina_mc::{ModelOracle, ModelType, OracleError, State, StateEnv, VarDecl, VarKind};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Model construction error.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("update target '{0}' is not a variable")]
    InvalidUpdateTarget(String),

    #[error("undefined variable '{name}' at index {index}")]
    UndefinedVariable { index: usize, name: String },

    #[error("variable '{var}' assigned multiple times in action '{action}'")]
    DuplicateAssignment { var: String, action: String },

    #[error("initial value {value} of '{var}' is outside its range")]
    InitialOutOfRange { var: String, value: i64 },

    #[error("empty range [{low}, {high}] for '{var}'")]
    EmptyRange { var: String, low: i64, high: i64 },

    #[error("model has no commands")]
    NoCommands,
}

pub type ModelResult<T> = Result<T, ModelError>;

/// `var' = value` as written by the model author.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub target: Expr,
    pub value: Expr,
}

pub fn assign(target: &Expr, value: impl Into<Expr>) -> Assignment {
    Assignment {
        target: target.clone(),
        value: value.into(),
    }
}

/// One rate-labelled alternative of a command.
#[derive(Debug, Clone)]
pub struct Branch {
    pub rate: Expr,
    pub updates: Vec<Assignment>,
}

#[derive(Debug, Clone)]
pub struct Command {
    pub action: Arc<str>,
    pub guard: Expr,
    pub branches: Vec<Branch>,
}

impl Command {
    pub fn new(action: impl Into<Arc<str>>, guard: Expr) -> Self {
        Self {
            action: action.into(),
            guard,
            branches: Vec::new(),
        }
    }

    pub fn branch(mut self, rate: impl Into<Expr>, updates: Vec<Assignment>) -> Self {
        self.branches.push(Branch {
            rate: rate.into(),
            updates,
        });
        self
    }
}

/// Command with update targets resolved to variable indices.
#[derive(Debug)]
struct CompiledCommand {
    action: Arc<str>,
    guard: Expr,
    branches: Vec<CompiledBranch>,
}

#[derive(Debug)]
struct CompiledBranch {
    rate: Expr,
    updates: Vec<(usize, Expr)>,
}

/// Incremental construction of a [`GuardedModel`].
#[derive(Debug)]
pub struct ModelBuilder {
    name: String,
    decls: Vec<VarDecl>,
    initial: Vec<i64>,
    commands: Vec<Command>,
}

impl ModelBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            decls: Vec::new(),
            initial: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Declare an integer variable and return an expression referring to it.
    pub fn int_var(&mut self, name: &str, low: i64, high: i64, init: i64) -> Expr {
        self.declare(VarDecl::int(name, low, high), init)
    }

    pub fn bool_var(&mut self, name: &str, init: bool) -> Expr {
        self.declare(VarDecl::boolean(name), i64::from(init))
    }

    fn declare(&mut self, decl: VarDecl, init: i64) -> Expr {
        let var = Expr::var(self.decls.len(), decl.name.clone());
        self.decls.push(decl);
        self.initial.push(init);
        var
    }

    pub fn command(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn build(self) -> ModelResult<GuardedModel> {
        for (decl, &value) in self.decls.iter().zip(&self.initial) {
            if let VarKind::Int { low, high } = decl.kind {
                if low > high {
                    return Err(ModelError::EmptyRange {
                        var: decl.name.to_string(),
                        low,
                        high,
                    });
                }
            }
            if !decl.contains(value) {
                return Err(ModelError::InitialOutOfRange {
                    var: decl.name.to_string(),
                    value,
                });
            }
        }
        if self.commands.is_empty() {
            return Err(ModelError::NoCommands);
        }

        let commands = self
            .commands
            .into_iter()
            .map(|cmd| compile_command(cmd, &self.decls))
            .collect::<ModelResult<Vec<_>>>()?;

        debug!(
            model = %self.name,
            vars = self.decls.len(),
            commands = commands.len(),
            "built guarded model"
        );

        Ok(GuardedModel {
            name: self.name.into(),
            decls: self.decls.into(),
            initial: State::new(self.initial),
            commands: commands.into(),
            current: None,
            enabled: Vec::new(),
        })
    }
}

fn compile_command(cmd: Command, decls: &[VarDecl]) -> ModelResult<CompiledCommand> {
    let mut branches = Vec::with_capacity(cmd.branches.len());
    for branch in cmd.branches {
        let mut updates: Vec<(usize, Expr)> = Vec::with_capacity(branch.updates.len());
        for Assignment { target, value } in branch.updates {
            let (index, name) = match &target {
                Expr::Var { index, name } => (*index, name.clone()),
                other => return Err(ModelError::InvalidUpdateTarget(other.to_string())),
            };
            if index >= decls.len() {
                return Err(ModelError::UndefinedVariable {
                    index,
                    name: name.to_string(),
                });
            }
            if updates.iter().any(|(i, _)| *i == index) {
                return Err(ModelError::DuplicateAssignment {
                    var: name.to_string(),
                    action: cmd.action.to_string(),
                });
            }
            updates.push((index, value));
        }
        branches.push(CompiledBranch {
            rate: branch.rate,
            updates,
        });
    }
    Ok(CompiledCommand {
        action: cmd.action,
        guard: cmd.guard,
        branches,
    })
}

/// A CTMC given by guarded commands.
///
/// Clones share the command list; the explored state and its enabled
/// transitions are per clone, so each worker can own one.
#[derive(Debug, Clone)]
pub struct GuardedModel {
    name: Arc<str>,
    decls: Arc<[VarDecl]>,
    initial: State,
    commands: Arc<[CompiledCommand]>,
    current: Option<State>,
    enabled: Vec<(f64, State)>,
}

impl GuardedModel {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_commands(&self) -> usize {
        self.commands.len()
    }

    /// Resolve a variable by name, for building properties.
    pub fn var(&self, name: &str) -> Option<Expr> {
        self.decls
            .iter()
            .position(|d| &*d.name == name)
            .map(|index| Expr::var(index, self.decls[index].name.clone()))
    }

    fn successor(
        &self,
        state: &State,
        env: &StateEnv<'_>,
        updates: &[(usize, Expr)],
    ) -> Result<State, OracleError> {
        let mut vars = state.vars().to_vec();
        for (index, expr) in updates {
            let value = expr.eval(env)?;
            let raw = value.to_state_int().ok_or(ExprError::TypeMismatch {
                op: "update",
                expected: "int or bool",
                actual: value.type_name(),
            })?;
            let decl = &self.decls[*index];
            if !decl.contains(raw) {
                let (low, high) = match decl.kind {
                    VarKind::Int { low, high } => (low, high),
                    VarKind::Bool => (0, 1),
                };
                return Err(OracleError::OutOfRange {
                    var: decl.name.clone(),
                    value: raw,
                    low,
                    high,
                });
            }
            vars[*index] = raw;
        }
        Ok(State::new(vars))
    }
}

impl ModelOracle for GuardedModel {
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
        self.current = None;
        if state.num_vars() != self.decls.len() {
            return Err(OracleError::UnknownState(state.clone()));
        }
        let mut enabled = std::mem::take(&mut self.enabled);
        enabled.clear();
        let env = StateEnv::new(state, &self.decls);
        for cmd in self.commands.iter() {
            if !cmd.guard.eval_bool(&env)? {
                continue;
            }
            for branch in &cmd.branches {
                let rate = branch.rate.eval_f64(&env)?;
                enabled.push((rate, self.successor(state, &env, &branch.updates)?));
            }
        }
        self.enabled = enabled;
        self.current = Some(state.clone());
        Ok(())
    }

    fn num_choices(&self) -> usize {
        1
    }

    fn num_transitions(&self, choice: usize) -> usize {
        if choice == 0 && self.current.is_some() {
            self.enabled.len()
        } else {
            0
        }
    }

    fn transition_rate(&self, choice: usize, offset: usize) -> Result<f64, OracleError> {
        self.transition(choice, offset).map(|(rate, _)| *rate)
    }

    fn compute_transition_target(
        &self,
        choice: usize,
        offset: usize,
    ) -> Result<State, OracleError> {
        self.transition(choice, offset).map(|(_, target)| target.clone())
    }
}

impl GuardedModel {
    fn transition(&self, choice: usize, offset: usize) -> Result<&(f64, State), OracleError> {
        if self.current.is_none() {
            return Err(OracleError::NotExplored);
        }
        if choice != 0 {
            return Err(OracleError::NoSuchTransition { choice, offset });
        }
        self.enabled
            .get(offset)
            .ok_or(OracleError::NoSuchTransition { choice, offset })
    }
}

impl fmt::Display for GuardedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ctmc")?;
        writeln!(f)?;
        writeln!(f, "module {}", self.name)?;
        for (decl, init) in self.decls.iter().zip(self.initial.vars()) {
            match decl.kind {
                VarKind::Bool => writeln!(f, "  {} : bool init {};", decl.name, *init != 0)?,
                VarKind::Int { low, high } if high == i64::MAX => {
                    writeln!(f, "  {} : [{}..inf] init {};", decl.name, low, init)?
                }
                VarKind::Int { low, high } => {
                    writeln!(f, "  {} : [{}..{}] init {};", decl.name, low, high, init)?
                }
            }
        }
        writeln!(f)?;
        for cmd in self.commands.iter() {
            write!(f, "  [{}] {} -> ", cmd.action, cmd.guard)?;
            for (i, branch) in cmd.branches.iter().enumerate() {
                if i > 0 {
                    write!(f, " + ")?;
                }
                write!(f, "{} : ", branch.rate)?;
                if branch.updates.is_empty() {
                    write!(f, "true")?;
                }
                for (j, (index, value)) in branch.updates.iter().enumerate() {
                    if j > 0 {
                        write!(f, " & ")?;
                    }
                    write!(f, "({}'={})", self.decls[*index].name, value)?;
                }
            }
            writeln!(f, ";")?;
        }
        write!(f, "endmodule")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bounded counter with a reset: `n` in [0, 3].
    fn counter() -> GuardedModel {
        let mut b = ModelBuilder::new("counter");
        let n = b.int_var("n", 0, 3, 0);
        let up = b.bool_var("up", true);
        b.command(Command::new("inc", n.clone().lt(3)).branch(2.0, vec![assign(&n, n.clone() + 1)]));
        b.command(
                Command::new("reset", n.clone().gt(0))
                    .branch(0.5, vec![assign(&n, 0), assign(&up, false)])
                    .branch(n.clone() * 0.25, vec![]),
            );
        b.build().unwrap()
    }

    fn transitions(model: &mut GuardedModel, vars: Vec<i64>) -> Vec<(f64, Vec<i64>)> {
        model.explore_state(&State::new(vars)).unwrap();
        (0..model.num_transitions(0))
            .map(|k| {
                let rate = model.transition_rate(0, k).unwrap();
                let target = model.compute_transition_target(0, k).unwrap();
                (rate, target.vars().to_vec())
            })
            .collect()
    }

    #[test]
    fn test_enabled_commands() {
        let mut model = counter();
        assert_eq!(model.initial_state().unwrap().vars(), &[0, 1]);
        assert_eq!(transitions(&mut model, vec![0, 1]), vec![(2.0, vec![1, 1])]);
        assert_eq!(
            transitions(&mut model, vec![2, 1]),
            vec![(2.0, vec![3, 1]), (0.5, vec![0, 0]), (0.5, vec![2, 1])]
        );
        assert_eq!(
            transitions(&mut model, vec![3, 0]),
            vec![(0.5, vec![0, 0]), (0.75, vec![3, 0])]
        );
    }

    #[test]
    fn test_query_before_explore() {
        let model = counter();
        assert_eq!(model.num_transitions(0), 0);
        assert!(matches!(
            model.transition_rate(0, 0),
            Err(OracleError::NotExplored)
        ));
    }

    #[test]
    fn test_out_of_range_update() {
        let mut b = ModelBuilder::new("overflow");
        let n = b.int_var("n", 0, 1, 1);
        let inc = Command::new("inc", Expr::Bool(true)).branch(1.0, vec![assign(&n, n.clone() + 1)]);
        b.command(inc);
        let mut model = b.build().unwrap();
        let err = model.explore_state(&State::new(vec![1])).unwrap_err();
        assert!(matches!(err, OracleError::OutOfRange { value: 2, .. }));
    }

    #[test]
    fn test_failed_explore_forgets_previous_state() {
        let mut b = ModelBuilder::new("overflow");
        let n = b.int_var("n", 0, 1, 0);
        let inc = Command::new("inc", Expr::Bool(true)).branch(1.0, vec![assign(&n, n.clone() + 1)]);
        b.command(inc);
        let mut model = b.build().unwrap();
        model.explore_state(&State::new(vec![0])).unwrap();
        assert_eq!(model.num_transitions(0), 1);

        assert!(model.explore_state(&State::new(vec![1])).is_err());
        assert_eq!(model.num_transitions(0), 0);
        assert!(matches!(
            model.transition_rate(0, 0),
            Err(OracleError::NotExplored)
        ));
    }

    #[test]
    fn test_non_integer_update() {
        let mut b = ModelBuilder::new("real");
        let n = b.int_var("n", 0, 5, 0);
        let half = Command::new("half", Expr::Bool(true)).branch(1.0, vec![assign(&n, n.clone() / 2)]);
        b.command(half);
        let mut model = b.build().unwrap();
        let err = model.explore_state(&State::new(vec![4])).unwrap_err();
        assert!(matches!(err, OracleError::Eval(ExprError::TypeMismatch { .. })));
    }

    #[test]
    fn test_build_validation() {
        let mut b = ModelBuilder::new("dup");
        let n = b.int_var("n", 0, 5, 0);
        b.command(
            Command::new("twice", Expr::Bool(true))
                .branch(1.0, vec![assign(&n, 1), assign(&n, 2)]),
        );
        assert!(matches!(
            b.build(),
            Err(ModelError::DuplicateAssignment { .. })
        ));

        let mut b = ModelBuilder::new("target");
        let n = b.int_var("n", 0, 5, 0);
        let bad = Command::new("bad", Expr::Bool(true)).branch(1.0, vec![assign(&(n + 1), 1)]);
        b.command(bad);
        assert!(matches!(b.build(), Err(ModelError::InvalidUpdateTarget(_))));

        let mut b = ModelBuilder::new("init");
        b.int_var("n", 0, 5, 9);
        b.command(Command::new("idle", Expr::Bool(true)));
        assert!(matches!(b.build(), Err(ModelError::InitialOutOfRange { .. })));

        let b = ModelBuilder::new("empty");
        assert!(matches!(b.build(), Err(ModelError::NoCommands)));
    }

    #[test]
    fn test_var_lookup() {
        let model = counter();
        assert_eq!(model.var("up"), Some(Expr::var(1, "up")));
        assert_eq!(model.var("missing"), None);
    }

    #[test]
    fn test_display() {
        let text = counter().to_string();
        assert!(text.starts_with("ctmc\n\nmodule counter\n"));
        assert!(text.contains("  n : [0..3] init 0;"));
        assert!(text.contains("  up : bool init true;"));
        assert!(text.contains("[inc] n < 3 -> 2.0 : (n'=n + 1);"));
        assert!(text.ends_with("endmodule"));
    }
}
