//! Global state registry: every state discovered so far, with its
//! approximate reachability mass.

use crate::oracle::VarDecl;
use crate::state::State;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Stable index of a state in the registry (insertion order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(u32);

impl StateId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// f64 stored as bits so it can be updated lock-free.
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(v: f64) -> Self {
        Self(AtomicU64::new(v.to_bits()))
    }

    #[inline]
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    #[inline]
    fn store(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Release);
    }

    /// Apply `f` atomically, returning the new value.
    fn update(&self, f: impl Fn(f64) -> f64) -> f64 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = f(f64::from_bits(current));
            match self.0.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

/// A discovered state plus its exploration metadata.
///
/// Mass lives in `[0, 1]`: every update clamps. `is_terminal` starts true and
/// flips to false once the state is expanded (or stopped by the property
/// guard); it never flips back.
pub struct ProbState {
    state: State,
    mass: AtomicF64,
    terminal: AtomicBool,
    absorbing: AtomicBool,
    shortest_time: AtomicF64,
}

impl ProbState {
    pub fn new(state: State, mass: f64) -> Self {
        Self {
            state,
            mass: AtomicF64::new(mass.clamp(0.0, 1.0)),
            terminal: AtomicBool::new(true),
            absorbing: AtomicBool::new(false),
            shortest_time: AtomicF64::new(f64::INFINITY),
        }
    }

    #[inline]
    pub fn state(&self) -> &State {
        &self.state
    }

    #[inline]
    pub fn reachability_prob(&self) -> f64 {
        self.mass.load()
    }

    pub fn set_reachability_prob(&self, p: f64) {
        self.mass.store(p.clamp(0.0, 1.0));
    }

    /// Add `delta` (possibly negative) and clamp to `[0, 1]`.
    pub fn add_reachability_prob(&self, delta: f64) -> f64 {
        self.mass.update(|m| (m + delta).clamp(0.0, 1.0))
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    pub fn mark_expanded(&self) {
        self.terminal.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_absorbing(&self) -> bool {
        self.absorbing.load(Ordering::Acquire)
    }

    /// Returns true if this call made the state absorbing.
    pub fn mark_absorbing(&self) -> bool {
        !self.absorbing.swap(true, Ordering::AcqRel)
    }

    pub fn shortest_time(&self) -> f64 {
        self.shortest_time.load()
    }

    pub fn relax_shortest_time(&self, t: f64) {
        self.shortest_time.update(|cur| cur.min(t));
    }
}

impl PartialEq for ProbState {
    fn eq(&self, other: &Self) -> bool {
        self.state == other.state
    }
}

impl Eq for ProbState {}

impl std::hash::Hash for ProbState {
    fn hash<H: std::hash::Hasher>(&self, h: &mut H) {
        self.state.hash(h);
    }
}

impl fmt::Debug for ProbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbState")
            .field("state", &self.state)
            .field("mass", &self.reachability_prob())
            .field("terminal", &self.is_terminal())
            .field("absorbing", &self.is_absorbing())
            .finish()
    }
}

impl fmt::Display for ProbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.state)
    }
}

/// Thread-safe registry of discovered states.
///
/// States live in an append-only arena addressed by [`StateId`]; a sharded
/// index maps each `State` to its id. Insertion holds the index shard while
/// appending to the arena, so a state is registered exactly once.
pub struct StateRegistry {
    arena: RwLock<Vec<Arc<ProbState>>>,
    index: DashMap<State, StateId, ahash::RandomState>,
    absorbing: State,
}

impl StateRegistry {
    pub fn new(decls: &[VarDecl]) -> Self {
        Self {
            arena: RwLock::new(Vec::new()),
            index: DashMap::with_hasher(ahash::RandomState::new()),
            absorbing: State::absorbing(decls),
        }
    }

    /// Look up `state`, registering it with `mass` if unseen.
    /// Returns the id and whether the state was new.
    pub fn find_or_insert(&self, state: State, mass: f64) -> (StateId, bool) {
        use dashmap::mapref::entry::Entry;
        if let Some(id) = self.index.get(&state) {
            return (*id, false);
        }
        match self.index.entry(state) {
            Entry::Occupied(occupied) => (*occupied.get(), false),
            Entry::Vacant(entry) => {
                let mut arena = self.arena.write().unwrap_or_else(PoisonError::into_inner);
                let id = StateId(arena.len() as u32);
                arena.push(Arc::new(ProbState::new(entry.key().clone(), mass)));
                entry.insert(id);
                (id, true)
            }
        }
    }

    #[inline]
    pub fn lookup(&self, state: &State) -> Option<StateId> {
        self.index.get(state).map(|r| *r)
    }

    pub fn get(&self, id: StateId) -> Option<Arc<ProbState>> {
        self.arena
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id.index())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.arena.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all states in id order.
    pub fn snapshot(&self) -> Vec<Arc<ProbState>> {
        self.arena
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Ids of the states a new pass starts from: positive mass or still terminal.
    pub fn seeds(&self) -> Vec<StateId> {
        let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
        arena
            .iter()
            .enumerate()
            .filter(|(_, ps)| ps.is_terminal() || ps.reachability_prob() > 0.0)
            .map(|(i, _)| StateId(i as u32))
            .collect()
    }

    pub fn terminal_count(&self) -> usize {
        let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
        arena.iter().filter(|ps| ps.is_terminal()).count()
    }

    pub fn total_mass(&self) -> f64 {
        let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
        arena.iter().map(|ps| ps.reachability_prob()).sum()
    }

    /// Whether any state is still unexpanded, so the truncated model needs
    /// the absorbing sentinel.
    pub fn has_terminal(&self) -> bool {
        let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
        arena.iter().any(|ps| ps.is_terminal())
    }

    pub fn absorbing_state(&self) -> &State {
        &self.absorbing
    }

    #[inline]
    pub fn is_absorbing_sentinel(&self, state: &State) -> bool {
        self.absorbing.ptr_eq(state)
    }
}

impl fmt::Debug for StateRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateRegistry")
            .field("states", &self.len())
            .field("absorbing", &self.absorbing)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> StateRegistry {
        StateRegistry::new(&[VarDecl::int("x", 0, 100)])
    }

    #[test]
    fn test_find_or_insert_is_idempotent() {
        let reg = registry();
        let (a, new_a) = reg.find_or_insert(State::new(vec![1]), 1.0);
        let (b, new_b) = reg.find_or_insert(State::new(vec![1]), 0.5);
        assert!(new_a);
        assert!(!new_b);
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
        // The second insert does not overwrite the mass.
        assert_eq!(reg.get(a).unwrap().reachability_prob(), 1.0);
    }

    #[test]
    fn test_mass_is_clamped() {
        let ps = ProbState::new(State::new(vec![0]), 0.75);
        assert_eq!(ps.add_reachability_prob(0.5), 1.0);
        assert_eq!(ps.add_reachability_prob(-3.0), 0.0);
        ps.set_reachability_prob(f64::MAX);
        assert_eq!(ps.reachability_prob(), 1.0);
    }

    #[test]
    fn test_flags_flip_once() {
        let ps = ProbState::new(State::new(vec![0]), 0.0);
        assert!(ps.is_terminal());
        ps.mark_expanded();
        assert!(!ps.is_terminal());
        assert!(ps.mark_absorbing());
        assert!(!ps.mark_absorbing());
        assert!(ps.is_absorbing());
    }

    #[test]
    fn test_sentinel_identity() {
        let reg = registry();
        let by_value = State::new(vec![-1]);
        assert_eq!(reg.absorbing_state(), &by_value);
        assert!(!reg.is_absorbing_sentinel(&by_value));
        assert!(reg.is_absorbing_sentinel(&reg.absorbing_state().clone()));
    }

    #[test]
    fn test_seeds_and_counts() {
        let reg = registry();
        let (a, _) = reg.find_or_insert(State::new(vec![0]), 0.6);
        let (b, _) = reg.find_or_insert(State::new(vec![1]), 0.0);
        let (c, _) = reg.find_or_insert(State::new(vec![2]), 0.4);
        reg.get(b).unwrap().mark_expanded();
        reg.get(c).unwrap().mark_expanded();
        assert_eq!(reg.seeds(), vec![a, c]);
        assert_eq!(reg.terminal_count(), 1);
        assert!((reg.total_mass() - 1.0).abs() < 1e-12);
        assert!(reg.has_terminal());
    }

    #[test]
    fn test_concurrent_inserts_register_once() {
        let reg = registry();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for i in 0..50 {
                        reg.find_or_insert(State::new(vec![i]), 0.0);
                    }
                });
            }
        });
        assert_eq!(reg.len(), 50);
        for ps in reg.snapshot() {
            let id = reg.lookup(ps.state()).unwrap();
            assert_eq!(reg.get(id).unwrap().state(), ps.state());
        }
    }
}
