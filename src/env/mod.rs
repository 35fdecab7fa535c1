use ndarray::ArrayD;
use rand::rngs::StdRng;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

///
/// Flood-It grid environment.
///
pub mod flood;
///
/// Multi-port container stowage environment.
///
pub mod stowage;

/// The tuple of arrays an oracle consumes. Opaque to the search core; this
/// is exactly what crosses the inference wire.
#[derive(Clone, Debug, PartialEq)]
pub struct Observation(pub Vec<ArrayD<f32>>);

///
/// Capabilities the search core requires from an environment.
///
/// An environment is an explicit resource: `clone` acquires an independent
/// copy, `close` releases it. All copies of one episode share a handle
/// counter so teardown code can check that every acquired copy was
/// released.
///
pub trait Environment: Clone + Debug + Send {
    /// Digest of the observable state, sufficient for transposition:
    /// two environments with equal keys are interchangeable for policy
    /// and value caching.
    type Key: Eq + Hash + Clone;

    /// Size of the action space.
    fn action_count(&self) -> usize;

    /// Legality of every action in the current state. Empty support iff
    /// the state is terminal.
    fn mask(&self) -> Vec<bool>;

    /// Apply an action in place.
    fn step(&mut self, action: usize);

    /// Whether the episode has ended.
    fn is_terminal(&self) -> bool;

    /// State as oracle input.
    fn observation(&self) -> Observation;

    /// Final reward of the episode reaching this state, e.g. the negated
    /// number of moves spent solving it.
    fn final_value(&self) -> f32;

    /// Lower bound on any achievable episode value, reported for episodes
    /// that had to be abandoned.
    fn worst_case_value(&self) -> f32;

    /// Per-step cost already incurred along the episode. Subtracted from
    /// oracle values so that backed-up estimates target remaining cost
    /// only.
    fn cost_incurred(&self) -> f32;

    /// Accumulated shaped reward, compared against the best known episode
    /// score when pruning. Only meaningful for environments that enable
    /// pruning.
    fn total_reward(&self) -> f32 {
        0.0
    }

    /// Domain-specific dominance bound, e.g. a floor on reshuffles per
    /// port. A violating state is never worth expanding.
    fn violates_bound(&self) -> bool {
        false
    }

    /// Transposition key for the current state.
    fn state_key(&self) -> Self::Key;

    /// Release the state's resources. Idempotent.
    fn close(&mut self);

    /// Number of copies of this episode's lineage still open.
    fn live_handles(&self) -> usize;
}

///
/// Environment builders: actors create one fresh episode per loop.
///
pub trait EnvBuilder: Clone + Send + Sync {
    /// The built environment.
    type Env: Environment;

    /// Create a new episode instance.
    fn build(&self, rng: &mut StdRng) -> Self::Env;
}

/// Shared open-copy counter for one episode lineage.
#[derive(Debug)]
pub(crate) struct HandleCounter(Arc<AtomicUsize>);

impl HandleCounter {
    pub(crate) fn new() -> Self {
        HandleCounter(Arc::new(AtomicUsize::new(1)))
    }

    pub(crate) fn acquire(&self) -> Self {
        self.0.fetch_add(1, Ordering::Relaxed);
        HandleCounter(Arc::clone(&self.0))
    }

    pub(crate) fn release(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn live(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_counter_tracks_acquire_release() {
        let a = HandleCounter::new();
        assert_eq!(a.live(), 1);
        let b = a.acquire();
        let c = b.acquire();
        assert_eq!(a.live(), 3);
        b.release();
        c.release();
        assert_eq!(a.live(), 1);
        a.release();
        assert_eq!(a.live(), 0);
    }
}
