//! Command-line interface for the STAMINA truncated CTMC model checker.

use clap::{Args, Parser, Subcommand, ValueEnum};
use miette::Diagnostic;
use stamina_expr::{Property, TimeInterval};
use stamina_mc::{
    BoundsResult, ExplicitSolver, ProgressCounters, SolverConfig, SolverMethod, StaminaChecker,
    StaminaConfig,
};
use stamina_models::{library, GuardedModel, ModelError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CLI error with diagnostic codes for pretty printing.
#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    #[error("model error: {message}")]
    #[diagnostic(code(stamina::model_error))]
    ModelError { message: String },

    #[error("check error: {message}")]
    #[diagnostic(code(stamina::check_error))]
    CheckError { message: String },

    #[error("invalid argument: {message}")]
    #[diagnostic(code(stamina::invalid_argument))]
    InvalidArgument {
        message: String,
        #[help]
        help: String,
    },
}

impl From<ModelError> for CliError {
    fn from(e: ModelError) -> Self {
        CliError::ModelError {
            message: e.to_string(),
        }
    }
}

type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "stamina", version)]
#[command(about = "Truncated probabilistic model checking of infinite-state CTMCs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Method {
    Power,
    Jacobi,
    GaussSeidel,
}

impl From<Method> for SolverMethod {
    fn from(m: Method) -> Self {
        match m {
            Method::Power => SolverMethod::Power,
            Method::Jacobi => SolverMethod::Jacobi,
            Method::GaussSeidel => SolverMethod::GaussSeidel,
        }
    }
}

/// Truncation and solver parameters shared by every model.
#[derive(Args)]
struct CheckArgs {
    /// Initial reachability threshold
    #[arg(long, default_value = "1.0")]
    kappa: f64,

    /// Factor kappa is divided by after every truncation pass
    #[arg(long = "r-kappa", default_value = "1.25")]
    r_kappa: f64,

    /// Initial misprediction factor
    #[arg(long = "approx-factor", default_value = "2.0")]
    approx_factor: f64,

    /// Target width of the probability window
    #[arg(long = "prob-win", default_value = "1e-3")]
    prob_win: f64,

    /// Maximum number of refinement iterations
    #[arg(long, default_value = "10")]
    max_approx_count: usize,

    /// Maximum number of truncation passes per iteration
    #[arg(long, default_value = "100")]
    max_passes: usize,

    /// Maximum number of solver iterations
    #[arg(long, default_value = "10000")]
    max_iters: usize,

    /// Iterative method for unbounded until
    #[arg(long, value_enum, default_value = "jacobi")]
    method: Method,

    /// Disable property-guided truncation
    #[arg(long)]
    no_prop_refine: bool,

    /// Explore with a pool of worker threads
    #[arg(long)]
    parallel: bool,

    /// Number of worker threads (0 = use all available)
    #[arg(long, default_value = "0")]
    threads: usize,

    /// Time bound t for `U<=t` (default: unbounded)
    #[arg(long, value_name = "T")]
    time: Option<f64>,

    /// Print the model before checking
    #[arg(long)]
    show_model: bool,

    /// Show verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// M/M/1 queue: probability that the queue reaches a given length
    BirthDeath {
        /// Arrival rate
        #[arg(long, default_value = "1.0")]
        lambda: f64,

        /// Service rate
        #[arg(long, default_value = "2.0")]
        mu: f64,

        /// Target queue length
        #[arg(long, default_value = "10")]
        k: i64,

        #[command(flatten)]
        check: CheckArgs,
    },

    /// Two queues in series: probability that the second queue fills up
    Tandem {
        /// Capacity of each queue
        #[arg(long, default_value = "5")]
        cap: i64,

        /// Arrival rate
        #[arg(long, default_value = "4.0")]
        lambda: f64,

        /// Routing rate between the queues
        #[arg(long, default_value = "2.0")]
        mu1: f64,

        /// Service rate of the second queue
        #[arg(long, default_value = "2.0")]
        mu2: f64,

        #[command(flatten)]
        check: CheckArgs,
    },

    /// Linear chain: probability of reaching the last state
    Chain {
        /// Length of the chain
        #[arg(long, default_value = "10")]
        n: i64,

        /// Rate of every step
        #[arg(long, default_value = "1.0")]
        rate: f64,

        #[command(flatten)]
        check: CheckArgs,
    },

    /// Gambler's random walk: ruin, or reaching a target before ruin
    Gambler {
        /// Rate of winning a bet
        #[arg(long, default_value = "2.0")]
        p_up: f64,

        /// Rate of losing a bet
        #[arg(long, default_value = "1.0")]
        p_down: f64,

        /// Starting wealth
        #[arg(long, default_value = "1")]
        start: i64,

        /// Check reaching this wealth before ruin instead of ruin
        #[arg(long)]
        target: Option<i64>,

        #[command(flatten)]
        check: CheckArgs,
    },
}

impl Commands {
    fn check_args(&self) -> &CheckArgs {
        match self {
            Commands::BirthDeath { check, .. }
            | Commands::Tandem { check, .. }
            | Commands::Chain { check, .. }
            | Commands::Gambler { check, .. } => check,
        }
    }
}

fn main() {
    // Install miette's fancy error handler
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(2)
                .build(),
        )
    }))
    .ok();

    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.command.check_args().verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let result = build(&cli.command).and_then(|(model, property)| {
        cmd_check(model, &property, cli.command.check_args())
    });

    match result {
        Ok(()) => {}
        Err(e) => {
            eprintln!("{:?}", miette::Report::new(e));
            std::process::exit(1);
        }
    }
}

fn interval(time: Option<f64>) -> CliResult<TimeInterval> {
    match time {
        None => Ok(TimeInterval::UNBOUNDED),
        Some(t) if t.is_finite() && t >= 0.0 => Ok(TimeInterval::up_to(t)),
        Some(t) => Err(CliError::InvalidArgument {
            message: format!("time bound {} is not a non-negative number", t),
            help: "pass --time with a value such as 10 or 0.5".into(),
        }),
    }
}

fn build(command: &Commands) -> CliResult<(GuardedModel, Property)> {
    let bound = interval(command.check_args().time)?;
    Ok(match *command {
        Commands::BirthDeath { lambda, mu, k, .. } => (
            library::birth_death(lambda, mu)?,
            library::queue_reaches(k, bound),
        ),
        Commands::Tandem {
            cap,
            lambda,
            mu1,
            mu2,
            ..
        } => (
            library::tandem_queue(cap, lambda, mu1, mu2)?,
            library::tandem_full(cap, bound),
        ),
        Commands::Chain { n, rate, ref check } => {
            if check.time.is_some() {
                return Err(CliError::InvalidArgument {
                    message: "the chain property is unbounded".into(),
                    help: "drop --time for this model".into(),
                });
            }
            (library::linear_chain(n, rate)?, library::chain_end(n))
        }
        Commands::Gambler {
            p_up,
            p_down,
            start,
            target,
            ref check,
        } => {
            let model = library::gamblers_walk(p_up, p_down, start)?;
            match target {
                Some(_) if check.time.is_some() => {
                    return Err(CliError::InvalidArgument {
                        message: "--target and --time cannot be combined".into(),
                        help: "the target property is unbounded; use --time for ruin".into(),
                    })
                }
                Some(target) => (model, library::reach_wealth(target)),
                None => (model, library::ruin(bound)),
            }
        }
    })
}

fn cmd_check(model: GuardedModel, property: &Property, args: &CheckArgs) -> CliResult<()> {
    if args.show_model {
        println!("{}", model);
        println!();
    }

    let progress = Arc::new(ProgressCounters::new());
    let config = StaminaConfig {
        kappa: args.kappa,
        kappa_reduction_factor: args.r_kappa,
        misprediction_factor: args.approx_factor,
        prob_error_window: args.prob_win,
        max_approx_count: args.max_approx_count,
        max_truncation_passes: args.max_passes,
        prop_refine: !args.no_prop_refine,
        parallel: args.parallel,
        num_threads: args.threads,
        progress: Some(progress.clone()),
    };
    config.validate().map_err(|e| CliError::InvalidArgument {
        message: e.to_string(),
        help: "see `stamina help` for the accepted ranges".into(),
    })?;
    let solver = ExplicitSolver::new(SolverConfig {
        method: args.method.into(),
        max_iters: args.max_iters,
        ..Default::default()
    });

    info!(model = model.name(), property = %property, "model checking...");
    let start = Instant::now();

    let checker = StaminaChecker::with_solver(model, solver, config);
    let result = checker.check(property).map_err(|e| CliError::CheckError {
        message: e.to_string(),
    })?;

    let elapsed = start.elapsed();
    print_result(property, &result, &progress, elapsed.as_secs_f64());
    Ok(())
}

/// Non-convergence is reported next to the best lower bound reached.
fn result_line(result: &BoundsResult) -> String {
    if result.converged {
        format!("Result: {}", result.value())
    } else {
        format!("Result: {} (probability window not reached)", result.value())
    }
}

fn print_result(
    property: &Property,
    result: &BoundsResult,
    progress: &ProgressCounters,
    secs: f64,
) {
    println!();
    println!("{}", result_line(result));
    println!("  Property: {}", property);
    println!("  Probability minimum: {}", result.p_min);
    println!("  Probability maximum: {}", result.p_max);
    println!("  Iterations: {}", result.iterations);
    println!("  Truncation passes: {}", progress.passes.load(Ordering::Relaxed));
    println!("  States: {}", result.states);
    println!("  Final kappa: {:e}", result.kappa);
    println!("  Misprediction factor: {}", result.misprediction_factor);
    println!("  Time: {:.2}s", secs);
}

#[cfg(test)]
mod tests {
    use super::*;
    use stamina_mc::CheckValue;

    fn bounds(converged: bool) -> BoundsResult {
        BoundsResult {
            p_min: CheckValue::Numeric(0.25),
            p_max: CheckValue::Numeric(0.5),
            iterations: 10,
            converged,
            kappa: 1e-3,
            states: 7,
            misprediction_factor: 2.0,
        }
    }

    #[test]
    fn test_result_line_reports_lower_bound() {
        assert_eq!(result_line(&bounds(true)), "Result: 0.25");
        assert_eq!(
            result_line(&bounds(false)),
            "Result: 0.25 (probability window not reached)"
        );
    }

    #[test]
    fn test_unconverged_check_is_not_an_error() {
        let cli = Cli::try_parse_from([
            "stamina",
            "gambler",
            "--time",
            "1",
            "--prob-win",
            "1e-12",
            "--max-approx-count",
            "1",
            "--max-passes",
            "2",
        ])
        .unwrap();
        let (model, property) = build(&cli.command).unwrap();
        assert!(cmd_check(model, &property, cli.command.check_args()).is_ok());
    }

    #[test]
    fn test_infinite_time_bound_is_rejected() {
        assert!(interval(Some(f64::INFINITY)).is_err());
        assert!(interval(Some(-1.0)).is_err());
        assert!(interval(Some(2.5)).is_ok());
    }
}
