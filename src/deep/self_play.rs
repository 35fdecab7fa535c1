use crate::deep::replay::{ReplayBuffer, TrainingSample};
use crate::deep::server::InferenceConnection;
use crate::env::{EnvBuilder, Environment, Observation};
use crate::error::SearchError;
use crate::search::node::{Node, NodeRef};
use crate::search::puct::PuctSearch;
use crate::search::transposition::TranspositionTable;
use crate::search::PolicyValueFn;
use crate::settings;

use float_ord::FloatOrd;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::Array1;
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::f32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// What one finished episode produced.
#[derive(Debug)]
pub struct EpisodeOutcome {
    /// Training tuples, one per decision. Empty for truncated episodes.
    pub samples: Vec<TrainingSample>,
    /// Final episode value; pessimistic when truncated.
    pub value: f32,
    /// Decisions taken.
    pub steps: usize,
    /// Whether pruning eliminated every action at some root.
    pub truncated: bool,
}

///
/// Plays episodes: search, sample an action from the improved policy,
/// step the real environment, carry the chosen subtree into the next
/// decision.
///
/// In deterministic mode (evaluation) the argmax action is taken and no
/// root noise is added.
///
pub struct EpisodePlayer<F> {
    settings: settings::Mcts,
    evaluator: F,
    deterministic: bool,
    rng: StdRng,
}

impl<F> EpisodePlayer<F> {
    /// Player over the given evaluation seam.
    pub fn new(settings: settings::Mcts, evaluator: F, deterministic: bool, seed: u64) -> Self {
        EpisodePlayer {
            settings,
            evaluator,
            deterministic,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    ///
    /// Play `env` to completion and assemble its training tuples. The
    /// value target of step `i` is `final_value + i`: the number of moves
    /// still to go from that state, negated.
    ///
    /// A truncated episode is a regular outcome with no tuples and the
    /// environment's worst-case value. Every environment copy acquired
    /// along the way is released before returning, on every path.
    ///
    pub fn run_episode<E>(&mut self, mut env: E) -> Result<EpisodeOutcome, SearchError>
    where
        E: Environment,
        F: PolicyValueFn<E>,
    {
        let mut engine = PuctSearch::new(self.settings);
        let mut table = TranspositionTable::new();
        let mut root = Node::root(env.clone());
        let mut recorded: Vec<(Observation, Array1<f32>)> = Vec::new();

        let result = self.play_out(&mut env, &mut engine, &mut table, &mut root, &mut recorded);
        Node::close_subtree(&root);

        let steps = recorded.len();
        let outcome = match result {
            Ok(()) => {
                let value = env.final_value();
                let samples = recorded
                    .into_iter()
                    .enumerate()
                    .map(|(i, (observation, policy))| TrainingSample {
                        observation,
                        policy,
                        value: value + i as f32,
                    })
                    .collect();
                EpisodeOutcome {
                    samples,
                    value,
                    steps,
                    truncated: false,
                }
            }
            Err(SearchError::TruncatedEpisode) => EpisodeOutcome {
                samples: Vec::new(),
                value: env.worst_case_value(),
                steps,
                truncated: true,
            },
            Err(err) => {
                env.close();
                return Err(err);
            }
        };

        env.close();
        #[cfg(debug_assertions)]
        {
            let open = env.live_handles();
            if open != 0 {
                log::warn!("episode finished with {} environment handles still open", open);
            }
        }
        Ok(outcome)
    }

    /// The decision loop. Keeps `root` pointing at the subtree owned for
    /// the next decision so the caller can always tear it down.
    fn play_out<E>(
        &mut self,
        env: &mut E,
        engine: &mut PuctSearch,
        table: &mut TranspositionTable<E>,
        root: &mut NodeRef<E>,
        recorded: &mut Vec<(Observation, Array1<f32>)>,
    ) -> Result<(), SearchError>
    where
        E: Environment,
        F: PolicyValueFn<E>,
    {
        while !env.is_terminal() {
            let policy = engine.run(
                root,
                &mut self.evaluator,
                table,
                &mut self.rng,
                !self.deterministic,
            )?;
            recorded.push((env.observation(), policy.clone()));

            let action = if self.deterministic {
                argmax(&policy)
            } else {
                sample_action(&policy, &mut self.rng)?
            };
            env.step(action);

            let chosen = root.borrow_mut().children.remove(&action);
            match chosen {
                Some(next_root) => {
                    // Former root and every sibling subtree are done.
                    Node::close_subtree(root);
                    Node::detach(&next_root);
                    *root = next_root;
                }
                None => {
                    Node::close_subtree(root);
                    *root = Node::root(env.clone());
                }
            }
        }
        Ok(())
    }
}

/// Highest-probability action, lowest index on ties.
fn argmax(policy: &Array1<f32>) -> usize {
    let mut best = 0;
    let mut best_p = f32::NEG_INFINITY;
    for (action, &p) in policy.iter().enumerate() {
        if FloatOrd(p) > FloatOrd(best_p) {
            best_p = p;
            best = action;
        }
    }
    best
}

/// Draw an action from the policy.
fn sample_action(policy: &Array1<f32>, rng: &mut StdRng) -> Result<usize, SearchError> {
    let weights = WeightedIndex::new(policy.iter().cloned()).map_err(|err| {
        SearchError::InvariantViolation(format!("degenerate action distribution: {}", err))
    })?;
    Ok(weights.sample(rng))
}

///
/// Self-play actor pool: independent workers, each with its own seed,
/// environment stream and search state, sharing only the replay buffer
/// and the inference wire.
///
pub struct SelfPlayPool {
    stop: Arc<AtomicBool>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl SelfPlayPool {
    /// Start `actor.n_workers` workers generating episodes.
    pub fn spawn<B>(
        builder: B,
        connection: InferenceConnection,
        buffer: Arc<ReplayBuffer>,
        mcts: settings::Mcts,
        actor: settings::Actor,
    ) -> Self
    where
        B: EnvBuilder + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("[{spinner}] {pos} episodes generated ({elapsed_precise})"),
        );
        bar.enable_steady_tick(200);
        let bar = Arc::new(bar);

        let workers = (0..actor.n_workers)
            .map(|worker| {
                let builder = builder.clone();
                let connection = connection.clone();
                let buffer = Arc::clone(&buffer);
                let stop = Arc::clone(&stop);
                let bar = Arc::clone(&bar);
                let seed = actor.base_seed.wrapping_add(worker as u64);
                thread::Builder::new()
                    .name(format!("actor-{}", worker))
                    .spawn(move || actor_loop(worker, builder, connection, buffer, mcts, seed, stop, bar))
                    .expect("failed to spawn actor worker")
            })
            .collect();

        SelfPlayPool { stop, workers }
    }

    /// Flag observed by the workers between episodes.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Ask every worker to stop after its current episode, then wait.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn actor_loop<B: EnvBuilder>(
    worker: usize,
    builder: B,
    connection: InferenceConnection,
    buffer: Arc<ReplayBuffer>,
    mcts: settings::Mcts,
    seed: u64,
    stop: Arc<AtomicBool>,
    bar: Arc<ProgressBar>,
) {
    let mut env_rng = StdRng::seed_from_u64(seed);
    let mut player = EpisodePlayer::new(mcts, connection, false, seed.wrapping_add(1));

    while !stop.load(Ordering::Relaxed) {
        let env = builder.build(&mut env_rng);
        match player.run_episode(env) {
            Ok(outcome) => {
                log::info!(
                    "actor {}: value {:.1} over {} steps{}",
                    worker,
                    outcome.value,
                    outcome.steps,
                    if outcome.truncated { " (truncated)" } else { "" }
                );
                buffer.extend(outcome.samples);
                bar.inc(1);
            }
            Err(SearchError::OracleUnavailable) => {
                log::warn!("actor {}: inference connection closed, exiting", worker);
                break;
            }
            Err(err) => {
                log::error!("actor {}: aborting: {}", worker, err);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;
    use rand::SeedableRng;

    #[test]
    fn argmax_breaks_ties_toward_the_lowest_action() {
        assert_eq!(argmax(&arr1(&[0.2, 0.5, 0.3])), 1);
        assert_eq!(argmax(&arr1(&[0.4, 0.4, 0.2])), 0);
        assert_eq!(argmax(&arr1(&[0.0, 0.0])), 0);
    }

    #[test]
    fn sampling_respects_the_support() {
        let mut rng = StdRng::seed_from_u64(3);
        let policy = arr1(&[0.0, 1.0, 0.0]);
        for _ in 0..32 {
            assert_eq!(sample_action(&policy, &mut rng).unwrap(), 1);
        }
    }

    #[test]
    fn sampling_a_zero_policy_is_an_invariant_violation() {
        let mut rng = StdRng::seed_from_u64(3);
        let policy = arr1(&[0.0, 0.0]);
        assert!(sample_action(&policy, &mut rng).is_err());
    }
}
