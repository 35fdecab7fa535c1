use crate::env::Environment;
use crate::error::SearchError;
use crate::search::min_max::MinMaxStats;
use crate::search::node::{Node, NodeRef};
use crate::search::transposition::TranspositionTable;
use crate::search::PolicyValueFn;
use crate::settings::{Mcts, PolicyLayout};

use ndarray::Array1;
use rand::rngs::StdRng;
use std::f32;
use std::rc::{Rc, Weak};

/// Temperatures at or below this select the argmax outright instead of
/// raising visit counts to an enormous power.
const TEMPERATURE_ARGMAX_CUTOFF: f32 = 1e-3;

///
/// Tree search engine: repeated selection, expansion, evaluation and
/// backup over a reusable tree, yielding a visit-count policy.
///
/// One engine serves one episode; the value bounds and the best known
/// episode score carry across the episode's searches, the transposition
/// table is owned by the caller.
///
pub struct PuctSearch {
    settings: Mcts,
    min_max: MinMaxStats,
    best_score: f32,
}

impl PuctSearch {
    /// Engine with fresh statistics.
    pub fn new(settings: Mcts) -> Self {
        PuctSearch {
            settings,
            min_max: MinMaxStats::new(),
            best_score: f32::NEG_INFINITY,
        }
    }

    /// Observed value bounds.
    pub fn min_max(&self) -> &MinMaxStats {
        &self.min_max
    }

    ///
    /// Run one search from `root` and return the improved policy
    /// `pi(a) ~ N(a)^(1/temperature)` over the full action vector.
    ///
    /// A fresh root is evaluated and expanded outside the simulation
    /// budget; a reused root keeps its statistics. With `add_noise`,
    /// Dirichlet noise perturbs the root priors exactly once per call.
    ///
    /// Fails with [`SearchError::TruncatedEpisode`] when pruning has
    /// eliminated every action at the root.
    ///
    pub fn run<E, F>(
        &mut self,
        root: &NodeRef<E>,
        evaluator: &mut F,
        table: &mut TranspositionTable<E>,
        rng: &mut StdRng,
        add_noise: bool,
    ) -> Result<Array1<f32>, SearchError>
    where
        E: Environment,
        F: PolicyValueFn<E>,
    {
        self.best_score = f32::NEG_INFINITY;

        if root.borrow().is_leaf() {
            let value = self.evaluate(root, evaluator, table)?;
            self.backup(root, value);
        }
        if add_noise {
            let Mcts {
                dirichlet_alpha,
                dirichlet_weight,
                ..
            } = self.settings;
            root.borrow_mut()
                .add_noise(dirichlet_alpha, dirichlet_weight, rng);
        }

        let mut completed = 0;
        while completed < self.settings.search_iterations {
            let leaf = match self.find_leaf(root)? {
                Some(leaf) => leaf,
                // A branch was pruned away; the simulation is not counted
                // and the next descent re-enters from the root.
                None => continue,
            };
            let value = self.evaluate(&leaf, evaluator, table)?;
            self.backup(&leaf, value);
            completed += 1;
        }

        #[cfg(debug_assertions)]
        {
            let r = root.borrow();
            let child_sum: u32 = r.children.values().map(|c| c.borrow().visit_count).sum();
            debug_assert!(child_sum <= r.visit_count);
        }

        Ok(self.tree_policy(root))
    }

    /// Descend from the root until an unexpanded node is reached. Returns
    /// `None` when the descent pruned a branch instead.
    fn find_leaf<E: Environment>(
        &mut self,
        root: &NodeRef<E>,
    ) -> Result<Option<NodeRef<E>>, SearchError> {
        let mut node = Rc::clone(root);
        loop {
            if self.settings.enable_pruning && Self::should_prune(&node, self.best_score) {
                if node.borrow().parent.is_none() {
                    return Err(SearchError::TruncatedEpisode);
                }
                Node::prune(&node);
                if root.borrow().no_valid_children {
                    return Err(SearchError::TruncatedEpisode);
                }
                return Ok(None);
            }
            let next = {
                let n = node.borrow();
                if n.is_leaf() {
                    None
                } else {
                    match n.select_child(&self.min_max, self.settings.c_puct) {
                        Some((_, child)) => Some(child),
                        None => {
                            return Err(SearchError::InvariantViolation(
                                "expanded node has no selectable children".into(),
                            ))
                        }
                    }
                }
            };
            match next {
                Some(child) => node = child,
                None => return Ok(Some(node)),
            }
        }
    }

    /// A node is dominated when every legal continuation is pruned, or
    /// when it is an unexpanded non-terminal state that already scores
    /// worse than the best finished line of this search or violates the
    /// domain bound.
    fn should_prune<E: Environment>(node: &NodeRef<E>, best_score: f32) -> bool {
        let n = node.borrow();
        if n.no_valid_children {
            return true;
        }
        if n.is_leaf() && !n.env.is_terminal() {
            n.env.total_reward() < best_score || n.env.violates_bound()
        } else {
            false
        }
    }

    /// Terminal states yield their exact episode value; anything else is
    /// scored by the oracle (through the transposition table), corrected
    /// down by the cost already spent, and expanded.
    fn evaluate<E, F>(
        &mut self,
        node: &NodeRef<E>,
        evaluator: &mut F,
        table: &mut TranspositionTable<E>,
    ) -> Result<f32, SearchError>
    where
        E: Environment,
        F: PolicyValueFn<E>,
    {
        if node.borrow().env.is_terminal() {
            let value = node.borrow().env.final_value();
            if value > self.best_score {
                self.best_score = value;
            }
            return Ok(value);
        }

        let (policy, raw_value) = {
            let n = node.borrow();
            let key = n.env.state_key();
            table.get_or_insert_with(key, || evaluator.evaluate(&n.env))?
        };
        let n_actions = node.borrow().env.action_count();
        let policy = reduce_policy(policy, n_actions, self.settings.policy_layout)?;
        let value = raw_value - node.borrow().env.cost_incurred();
        self.expand(node, &policy, value)?;
        Ok(value)
    }

    /// Create one child per legal action, each owning a stepped copy of
    /// the node's environment. Priors are gated from the policy without
    /// renormalization; fresh children start valued at their parent's
    /// estimate.
    fn expand<E: Environment>(
        &self,
        node: &NodeRef<E>,
        policy: &Array1<f32>,
        value: f32,
    ) -> Result<(), SearchError> {
        let mask = node.borrow().env.mask();
        if mask.len() != policy.len() {
            return Err(SearchError::InvariantViolation(format!(
                "policy length {} does not match action count {}",
                policy.len(),
                mask.len()
            )));
        }
        for (action, &legal) in mask.iter().enumerate() {
            if !legal {
                continue;
            }
            let mut child_env = node.borrow().env.clone();
            child_env.step(action);
            Node::add_child(node, action, child_env, policy[action], value);
        }
        Ok(())
    }

    /// Propagate `value` unchanged from the evaluated leaf to the root,
    /// inclusive, then widen the value bounds.
    fn backup<E: Environment>(&mut self, leaf: &NodeRef<E>, value: f32) {
        let mut current = Some(Rc::clone(leaf));
        while let Some(node) = current {
            node.borrow_mut().increment_value(value);
            current = node.borrow().parent.as_ref().and_then(Weak::upgrade);
        }
        self.min_max.update(value);
    }

    /// Visit-count policy over the full action vector; zero outside the
    /// expanded support.
    fn tree_policy<E: Environment>(&self, root: &NodeRef<E>) -> Array1<f32> {
        let r = root.borrow();
        let mut probs = Array1::zeros(r.env.action_count());
        if r.children.is_empty() {
            return probs;
        }

        let tau = self.settings.temperature;
        if tau <= TEMPERATURE_ARGMAX_CUTOFF {
            let mut best: Option<(usize, u32)> = None;
            for (&action, child) in &r.children {
                let visits = child.borrow().visit_count;
                if best.map_or(true, |(_, n)| visits > n) {
                    best = Some((action, visits));
                }
            }
            if let Some((action, _)) = best {
                probs[action] = 1.0;
            }
            return probs;
        }

        for (&action, child) in &r.children {
            probs[action] = (child.borrow().visit_count as f32).powf(1.0 / tau);
        }
        let z = probs.sum();
        if z > 0.0 {
            probs.mapv_inplace(|p| p / z);
        }
        probs
    }
}

/// Map the oracle's policy head onto the live action layout. The folded
/// layout sums the two halves of an oversized head position-wise; nothing
/// is renormalized afterwards.
fn reduce_policy(
    policy: Array1<f32>,
    n_actions: usize,
    layout: PolicyLayout,
) -> Result<Array1<f32>, SearchError> {
    match layout {
        PolicyLayout::Identity => {
            if policy.len() != n_actions {
                return Err(SearchError::InvariantViolation(format!(
                    "oracle emitted {} policy entries for {} actions",
                    policy.len(),
                    n_actions
                )));
            }
            Ok(policy)
        }
        PolicyLayout::Folded => {
            let half = policy.len() / 2;
            if policy.len() % 2 != 0 || half < n_actions {
                return Err(SearchError::InvariantViolation(format!(
                    "cannot fold a {}-entry head onto {} actions",
                    policy.len(),
                    n_actions
                )));
            }
            let mut folded = Array1::zeros(n_actions);
            for action in 0..n_actions {
                folded[action] = policy[action] + policy[half + action];
            }
            Ok(folded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn identity_layout_requires_an_exact_fit() {
        let ok = reduce_policy(arr1(&[0.5, 0.5]), 2, PolicyLayout::Identity);
        assert_eq!(ok.unwrap(), arr1(&[0.5, 0.5]));

        let bad = reduce_policy(arr1(&[0.5, 0.5, 0.0]), 2, PolicyLayout::Identity);
        assert!(bad.is_err());
    }

    #[test]
    fn folded_layout_sums_the_paired_halves() {
        // Head of 8 entries folded onto 3 live actions.
        let head = arr1(&[0.1, 0.2, 0.3, 0.05, 0.15, 0.1, 0.05, 0.05]);
        let folded = reduce_policy(head, 3, PolicyLayout::Folded).unwrap();
        assert!((folded[0] - 0.25).abs() < 1e-6);
        assert!((folded[1] - 0.3).abs() < 1e-6);
        assert!((folded[2] - 0.35).abs() < 1e-6);
    }

    #[test]
    fn folded_layout_rejects_undersized_heads() {
        assert!(reduce_policy(arr1(&[0.5, 0.5]), 2, PolicyLayout::Folded).is_err());
        assert!(reduce_policy(arr1(&[0.2, 0.2, 0.2]), 1, PolicyLayout::Folded).is_err());
    }
}
