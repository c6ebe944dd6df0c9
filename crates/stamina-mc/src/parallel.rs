//! Parallel truncation pass.
//!
//! Workers share the registry and a single FIFO frontier. Termination is
//! detected with an active-worker counter: a worker counts itself active
//! while it holds a state, so an empty frontier with no active workers means
//! no more states can be enqueued.

use crate::explorer::{McError, McResult, PassContext};
use crate::oracle::ModelOracle;
use crate::store::StateId;
use dashmap::DashSet;
use rayon::ThreadPool;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

pub(crate) fn worker_pool(num_threads: usize) -> McResult<ThreadPool> {
    let mut builder =
        rayon::ThreadPoolBuilder::new().thread_name(|i| format!("stamina-worker-{}", i));
    if num_threads > 0 {
        builder = builder.num_threads(num_threads);
    }
    builder
        .build()
        .map_err(|e| McError::InvalidConfig(format!("cannot build worker pool: {}", e)))
}

struct Frontier {
    queue: Mutex<VecDeque<StateId>>,
    visited: DashSet<StateId, ahash::RandomState>,
    active: AtomicUsize,
    stop: AtomicBool,
    error: Mutex<Option<McError>>,
}

impl Frontier {
    fn new(seeds: Vec<StateId>) -> Self {
        let visited = DashSet::with_hasher(ahash::RandomState::new());
        for &id in &seeds {
            visited.insert(id);
        }
        Self {
            queue: Mutex::new(seeds.into()),
            visited,
            active: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    fn pop(&self) -> Option<StateId> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn is_empty(&self) -> bool {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn push_unvisited(&self, successors: &[StateId]) -> usize {
        let fresh: SmallVec<[StateId; 8]> = successors
            .iter()
            .copied()
            .filter(|&id| self.visited.insert(id))
            .collect();
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.extend(fresh);
        queue.len()
    }

    fn fail(&self, err: McError) {
        let mut slot = self.error.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn worker<O: ModelOracle>(ctx: &PassContext<'_>, oracle: &mut O, frontier: &Frontier) {
    let mut successors = SmallVec::new();
    loop {
        if frontier.stop.load(Ordering::SeqCst) {
            return;
        }
        frontier.active.fetch_add(1, Ordering::SeqCst);
        match frontier.pop() {
            Some(id) => {
                successors.clear();
                if let Err(e) = ctx.visit(oracle, id, &mut successors) {
                    frontier.fail(e);
                    frontier.active.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
                let len = frontier.push_unvisited(&successors);
                if let Some(p) = ctx.progress {
                    p.queue_len.store(len, Ordering::Relaxed);
                }
                frontier.active.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                frontier.active.fetch_sub(1, Ordering::SeqCst);
                if frontier.active.load(Ordering::SeqCst) == 0 && frontier.is_empty() {
                    return;
                }
                std::thread::yield_now();
            }
        }
    }
}

/// Run one pass over `seeds` on `pool`, one oracle clone per worker.
pub(crate) fn run_pass<O: ModelOracle + Clone + Send>(
    pool: &ThreadPool,
    ctx: &PassContext<'_>,
    oracle: &O,
    seeds: Vec<StateId>,
) -> McResult<()> {
    let workers = pool.current_num_threads().max(1);
    let frontier = Frontier::new(seeds);
    debug!(workers, "parallel pass");
    let locals: Vec<O> = (0..workers).map(|_| oracle.clone()).collect();
    pool.scope(|s| {
        for mut local in locals {
            let frontier = &frontier;
            s.spawn(move |_| worker(ctx, &mut local, frontier));
        }
    });
    match frontier.error.into_inner().unwrap_or_else(PoisonError::into_inner) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use crate::explorer::{StaminaConfig, TruncationEngine};
    use crate::oracle::TableOracle;
    use crate::state::State;

    /// Two-dimensional grid walk, finite and with many interleavings.
    fn grid(n: i64) -> TableOracle {
        let mut edges = Vec::new();
        for x in 0..n {
            for y in 0..n {
                let here = State::new(vec![x, y]);
                if x + 1 < n {
                    edges.push((here.clone(), State::new(vec![x + 1, y]), 2.0));
                }
                if y + 1 < n {
                    edges.push((here.clone(), State::new(vec![x, y + 1]), 1.0));
                }
            }
        }
        TableOracle::new(
            vec![
                crate::oracle::VarDecl::int("x", 0, n - 1),
                crate::oracle::VarDecl::int("y", 0, n - 1),
            ],
            State::new(vec![0, 0]),
            edges,
        )
    }

    fn explored(parallel: bool) -> (usize, Vec<State>, f64) {
        let config = StaminaConfig {
            parallel,
            num_threads: 4,
            prop_refine: false,
            prob_error_window: 1e-12,
            max_truncation_passes: 200,
            ..Default::default()
        };
        let mut engine = TruncationEngine::new(grid(6), config).unwrap();
        let stats = engine.explore(2.0).unwrap();
        let reg = engine.global_state_set();
        let mut states: Vec<State> = reg
            .snapshot()
            .iter()
            .map(|ps| ps.state().clone())
            .collect();
        states.sort_by(|a, b| a.vars().cmp(b.vars()));
        (stats.terminal, states, reg.total_mass())
    }

    #[test]
    fn test_parallel_matches_sequential_on_finite_model() {
        let (seq_terminal, seq_states, seq_mass) = explored(false);
        let (par_terminal, par_states, par_mass) = explored(true);
        assert_eq!(seq_states.len(), 36);
        assert_eq!(par_states, seq_states);
        assert_eq!(seq_terminal, 0);
        assert_eq!(par_terminal, 0);
        assert!((seq_mass - 1.0).abs() < 1e-9);
        assert!((par_mass - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_parallel_conserves_mass() {
        let config = StaminaConfig {
            parallel: true,
            num_threads: 3,
            max_truncation_passes: 3,
            ..Default::default()
        };
        let mut engine = TruncationEngine::new(grid(8), config).unwrap();
        engine.explore(2.0).unwrap();
        let total = engine.global_state_set().total_mass();
        assert!((total - 1.0).abs() < 1e-9);
    }
}
