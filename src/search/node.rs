use crate::env::Environment;
use crate::search::min_max::MinMaxStats;

use float_ord::FloatOrd;
use rand::rngs::StdRng;
use rand_distr::{Dirichlet, Distribution};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::f32;
use std::rc::{Rc, Weak};

/// Shared handle on a tree node. One search is single-threaded, so nodes
/// are reference-counted with interior mutability; ownership runs strictly
/// parent to child, the back-reference is weak.
pub type NodeRef<E> = Rc<RefCell<Node<E>>>;
/// Non-owning handle on a parent node.
pub type NodeWeak<E> = Weak<RefCell<Node<E>>>;

///
/// One state of the search tree.
///
/// A node exclusively owns its environment snapshot: the snapshot is
/// acquired by copy at construction and released when the subtree is
/// closed. Children are keyed by action index; keys are always a subset of
/// the legal mask observed at `env`.
///
pub struct Node<E: Environment> {
    /// Owned environment snapshot.
    pub env: E,
    /// Prior probability assigned by the parent's policy; `None` at the
    /// root.
    pub prior: Option<f32>,
    /// Number of simulations backed up through this node.
    pub visit_count: u32,
    /// Sum of backed-up values.
    pub total_value: f32,
    /// Mean backed-up value; before the first visit this holds the
    /// parent's state value so fresh children are not automatically
    /// preferred over visited ones.
    pub mean_value: f32,
    /// Distance from the search root.
    pub depth: u32,
    /// Expanded children, keyed by action. Empty iff unexpanded.
    pub children: BTreeMap<usize, NodeRef<E>>,
    /// Back-reference, `None` at the root.
    pub parent: Option<NodeWeak<E>>,
    /// A pruned node is never re-selected.
    pub pruned: bool,
    /// Every legal child of this node has been pruned.
    pub no_valid_children: bool,
}

impl<E: Environment> Node<E> {
    /// Root constructor.
    pub fn root(env: E) -> NodeRef<E> {
        Rc::new(RefCell::new(Node {
            env,
            prior: None,
            visit_count: 0,
            total_value: 0.0,
            mean_value: 0.0,
            depth: 0,
            children: BTreeMap::new(),
            parent: None,
            pruned: false,
            no_valid_children: false,
        }))
    }

    /// Insert a child reached by `action`, owning `child_env`.
    pub fn add_child(
        parent: &NodeRef<E>,
        action: usize,
        child_env: E,
        prior: f32,
        value_estimate: f32,
    ) -> NodeRef<E> {
        let depth = parent.borrow().depth + 1;
        let child = Rc::new(RefCell::new(Node {
            env: child_env,
            prior: Some(prior),
            visit_count: 0,
            total_value: 0.0,
            mean_value: value_estimate,
            depth,
            children: BTreeMap::new(),
            parent: Some(Rc::downgrade(parent)),
            pruned: false,
            no_valid_children: false,
        }));
        parent.borrow_mut().children.insert(action, Rc::clone(&child));
        child
    }

    /// Whether the node has been expanded.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Pick the unpruned child maximizing the selection score
    /// `norm(Q) + c_puct * P * sqrt(N_parent) / (1 + N_child)`.
    /// Ties resolve to the lowest action index.
    pub fn select_child(&self, min_max: &MinMaxStats, c_puct: f32) -> Option<(usize, NodeRef<E>)> {
        let sqrt_n = (self.visit_count as f32).sqrt();
        let mut best: Option<(usize, NodeRef<E>)> = None;
        let mut best_score = f32::NEG_INFINITY;
        for (&action, child_ref) in &self.children {
            let child = child_ref.borrow();
            if child.pruned {
                continue;
            }
            let prior = child.prior.unwrap_or(0.0);
            let exploration = c_puct * prior * sqrt_n / (1.0 + child.visit_count as f32);
            let score = min_max.normalize(child.mean_value) + exploration;
            if FloatOrd(score) > FloatOrd(best_score) {
                best_score = score;
                best = Some((action, Rc::clone(child_ref)));
            }
        }
        best
    }

    /// Mix Dirichlet noise into the children's priors:
    /// `P <- (1 - weight) * P + weight * eta`, `eta ~ Dir(alpha)` over the
    /// legal actions. Applied at the root only, and never renormalized.
    pub fn add_noise(&mut self, alpha: f32, weight: f32, rng: &mut StdRng) {
        if weight <= 0.0 || self.children.len() < 2 {
            return;
        }
        let dirichlet = Dirichlet::new(vec![f64::from(alpha); self.children.len()]).unwrap();
        let noise = dirichlet.sample(rng);
        for (child_ref, eta) in self.children.values().zip(noise) {
            let mut child = child_ref.borrow_mut();
            if let Some(prior) = child.prior.as_mut() {
                *prior = (1.0 - weight) * *prior + weight * eta as f32;
            }
        }
    }

    /// Record one backed-up value.
    pub fn increment_value(&mut self, value: f32) {
        self.visit_count += 1;
        self.total_value += value;
        self.mean_value = self.total_value / self.visit_count as f32;
    }

    /// Mark `node` pruned and walk upward: an ancestor whose legal
    /// children are now all pruned is out of options itself.
    pub fn prune(node: &NodeRef<E>) {
        node.borrow_mut().pruned = true;
        let mut current = node.borrow().parent.as_ref().and_then(Weak::upgrade);
        while let Some(parent) = current {
            let all_pruned = {
                let p = parent.borrow();
                !p.children.is_empty() && p.children.values().all(|c| c.borrow().pruned)
            };
            if !all_pruned {
                break;
            }
            current = {
                let mut p = parent.borrow_mut();
                p.no_valid_children = true;
                p.pruned = true;
                p.parent.as_ref().and_then(Weak::upgrade)
            };
        }
    }

    /// Cut `node` loose from its parent so it can serve as the next
    /// search root.
    pub fn detach(node: &NodeRef<E>) {
        let mut n = node.borrow_mut();
        n.parent = None;
        n.prior = None;
    }

    /// Release every environment owned by the subtree, children before
    /// ancestors. Iterative: reused trees grow deep over an episode.
    pub fn close_subtree(node: &NodeRef<E>) {
        let mut order = vec![Rc::clone(node)];
        let mut i = 0;
        while i < order.len() {
            let children: Vec<NodeRef<E>> = order[i].borrow().children.values().cloned().collect();
            order.extend(children);
            i += 1;
        }
        for n in order.iter().rev() {
            n.borrow_mut().env.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::flood::FloodEnv;
    use crate::env::Environment;
    use rand::SeedableRng;

    fn grid() -> FloodEnv {
        FloodEnv::from_cells(2, 2, 3, vec![0, 1, 1, 2])
    }

    fn expand_two(root: &NodeRef<FloodEnv>) {
        for (action, prior) in &[(1usize, 0.5f32), (2, 0.5)] {
            let mut env = root.borrow().env.clone();
            env.step(*action);
            Node::add_child(root, *action, env, *prior, 0.0);
        }
    }

    #[test]
    fn selection_breaks_ties_toward_the_lowest_action() {
        let root = Node::root(grid());
        expand_two(&root);
        root.borrow_mut().visit_count = 1;

        let (action, _) = root.borrow().select_child(&MinMaxStats::new(), 1.0).unwrap();
        assert_eq!(action, 1);
        Node::close_subtree(&root);
    }

    #[test]
    fn selection_prefers_the_less_visited_child_on_equal_priors() {
        let root = Node::root(grid());
        expand_two(&root);
        {
            let root_ref = root.borrow();
            let first = root_ref.children.get(&1).unwrap();
            first.borrow_mut().increment_value(-1.0);
        }
        root.borrow_mut().visit_count = 2;

        let mut min_max = MinMaxStats::new();
        min_max.update(-1.0);
        min_max.update(0.0);
        let (action, _) = root.borrow().select_child(&min_max, 1.0).unwrap();
        assert_eq!(action, 2);
        Node::close_subtree(&root);
    }

    #[test]
    fn noise_with_zero_weight_leaves_priors_untouched() {
        let root = Node::root(grid());
        expand_two(&root);
        let mut rng = StdRng::seed_from_u64(1);
        root.borrow_mut().add_noise(0.3, 0.0, &mut rng);
        let root_ref = root.borrow();
        for child in root_ref.children.values() {
            assert_eq!(child.borrow().prior, Some(0.5));
        }
        drop(root_ref);
        Node::close_subtree(&root);
    }

    #[test]
    fn noise_keeps_priors_in_the_unit_interval() {
        let root = Node::root(grid());
        expand_two(&root);
        let mut rng = StdRng::seed_from_u64(42);
        root.borrow_mut().add_noise(0.3, 0.25, &mut rng);
        let root_ref = root.borrow();
        let priors: Vec<f32> = root_ref
            .children
            .values()
            .map(|c| c.borrow().prior.unwrap())
            .collect();
        for &p in &priors {
            assert!(p > 0.0 && p < 1.0);
        }
        // The convex mixture of two unit-sum vectors still sums to one.
        assert!((priors.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        drop(root_ref);
        Node::close_subtree(&root);
    }

    #[test]
    fn pruning_is_monotone_and_walks_up() {
        let root = Node::root(grid());
        expand_two(&root);
        let (first, second) = {
            let r = root.borrow();
            (
                Rc::clone(r.children.get(&1).unwrap()),
                Rc::clone(r.children.get(&2).unwrap()),
            )
        };

        Node::prune(&first);
        assert!(first.borrow().pruned);
        assert!(!root.borrow().no_valid_children);

        Node::prune(&second);
        assert!(root.borrow().no_valid_children);
        assert!(root.borrow().pruned);

        // Selection skips pruned children entirely.
        assert!(root.borrow().select_child(&MinMaxStats::new(), 1.0).is_none());
        Node::close_subtree(&root);
    }

    #[test]
    fn closing_a_subtree_releases_every_snapshot() {
        let env = grid();
        let root = Node::root(env.clone());
        expand_two(&root);
        {
            let child = Rc::clone(root.borrow().children.get(&1).unwrap());
            let mut grand_env = child.borrow().env.clone();
            grand_env.step(2);
            Node::add_child(&child, 2, grand_env, 1.0, 0.0);
        }
        assert_eq!(env.live_handles(), 5);
        Node::close_subtree(&root);
        assert_eq!(env.live_handles(), 1);
        let mut env = env;
        env.close();
        assert_eq!(env.live_handles(), 0);
    }

    #[test]
    fn increment_tracks_the_running_mean() {
        let root = Node::root(grid());
        {
            let mut r = root.borrow_mut();
            r.increment_value(-4.0);
            r.increment_value(-2.0);
            assert_eq!(r.visit_count, 2);
            assert_eq!(r.mean_value, -3.0);
        }
        Node::close_subtree(&root);
    }
}
