//! Settings: configuration file definitions and utilities.

use serde_derive::Deserialize;

#[derive(Deserialize, Clone, Debug)]
#[serde(tag = "kind")]
/// Possible environments and their associated dimensions.
pub enum Env {
    /// Flood-It grid.
    Flood {
        /// Board width.
        width: usize,
        /// Board height.
        height: usize,
        /// Number of colors (also the action count).
        colors: usize,
    },
    /// Multi-port container stowage.
    Stowage {
        /// Bay rows.
        rows: usize,
        /// Bay columns (the action count is twice this).
        columns: usize,
        /// Ports on the route.
        ports: usize,
    },
}

impl Env {
    /// Environment display name.
    pub fn name(&self) -> String {
        match self {
            Env::Flood { width, height, .. } => format!("flood-{}x{}", width, height),
            Env::Stowage { rows, columns, ports } => {
                format!("stowage-r{}c{}n{}", rows, columns, ports)
            }
        }
    }
}

/// Mapping from the oracle's policy head onto the live action layout.
#[derive(Deserialize, Copy, Clone, Debug, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyLayout {
    /// The oracle emits exactly one entry per action.
    Identity,
    /// The oracle emits an oversized head of paired halves; the two halves
    /// are summed position-wise down to the live action count.
    Folded,
}

impl Default for PolicyLayout {
    fn default() -> Self {
        PolicyLayout::Identity
    }
}

const DEFAULT_SEARCH_ITERATIONS: usize = 200;

#[derive(Deserialize, Copy, Clone, Debug)]
/// Tree search settings.
pub struct Mcts {
    /// Simulations per decision.
    #[serde(default = "default_search_iterations")]
    pub search_iterations: usize,
    /// Exploration constant of the selection formula.
    #[serde(default = "default_c_puct")]
    pub c_puct: f32,
    /// Visit-count sharpening; values near zero select the argmax.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Fraction of root priors replaced by Dirichlet noise.
    #[serde(default = "default_dirichlet_weight")]
    pub dirichlet_weight: f32,
    /// Dirichlet concentration.
    #[serde(default = "default_dirichlet_alpha")]
    pub dirichlet_alpha: f32,
    /// Prune dominated branches during selection.
    #[serde(default)]
    pub enable_pruning: bool,
    /// Oracle policy head layout.
    #[serde(default)]
    pub policy_layout: PolicyLayout,
}

impl Default for Mcts {
    fn default() -> Self {
        Self {
            search_iterations: default_search_iterations(),
            c_puct: default_c_puct(),
            temperature: default_temperature(),
            dirichlet_weight: default_dirichlet_weight(),
            dirichlet_alpha: default_dirichlet_alpha(),
            enable_pruning: false,
            policy_layout: PolicyLayout::default(),
        }
    }
}

fn default_search_iterations() -> usize {
    DEFAULT_SEARCH_ITERATIONS
}

fn default_c_puct() -> f32 {
    1.25
}

fn default_temperature() -> f32 {
    1.0
}

fn default_dirichlet_weight() -> f32 {
    0.25
}

fn default_dirichlet_alpha() -> f32 {
    0.3
}

#[derive(Deserialize, Copy, Clone, Debug)]
/// Actor pool settings.
pub struct Actor {
    /// Number of self-play workers.
    #[serde(default = "default_n_workers")]
    pub n_workers: usize,
    /// Seed base; worker `i` runs on `base_seed + i`.
    #[serde(default)]
    pub base_seed: u64,
}

impl Default for Actor {
    fn default() -> Self {
        Self {
            n_workers: default_n_workers(),
            base_seed: 0,
        }
    }
}

fn default_n_workers() -> usize {
    4
}

#[derive(Deserialize, Copy, Clone, Debug)]
/// Inference server settings.
pub struct Inference {
    /// Maximum forward-pass batch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long the server waits past the first queued request before
    /// running a partial batch.
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
}

impl Default for Inference {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    32
}

fn default_batch_timeout_ms() -> u64 {
    2
}

#[derive(Deserialize, Copy, Clone, Debug)]
/// Replay buffer settings.
pub struct Buffer {
    /// Bounded capacity; oldest tuples are evicted first.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

fn default_capacity() -> usize {
    50_000
}

/// Global configuration.
#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    /// Environment settings.
    pub env: Env,
    /// Tree search settings.
    #[serde(default)]
    pub mcts: Mcts,
    /// Actor pool settings.
    #[serde(default)]
    pub actor: Actor,
    /// Inference server settings.
    #[serde(default)]
    pub inference: Inference,
    /// Replay buffer settings.
    #[serde(default)]
    pub buffer: Buffer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let config: Config = serde_json::from_str(
            r#"{"env": {"kind": "Flood", "width": 6, "height": 6, "colors": 4}}"#,
        )
        .unwrap();

        assert_eq!(config.mcts.search_iterations, 200);
        assert_eq!(config.mcts.temperature, 1.0);
        assert!(!config.mcts.enable_pruning);
        assert_eq!(config.mcts.policy_layout, PolicyLayout::Identity);
        assert_eq!(config.inference.batch_size, 32);
        assert_eq!(config.buffer.capacity, 50_000);
        assert_eq!(config.env.name(), "flood-6x6");
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config: Config = serde_json::from_str(
            r#"{
                "env": {"kind": "Stowage", "rows": 6, "columns": 4, "ports": 6},
                "mcts": {"search_iterations": 50, "enable_pruning": true,
                         "policy_layout": "folded"},
                "actor": {"n_workers": 2, "base_seed": 7}
            }"#,
        )
        .unwrap();

        assert_eq!(config.mcts.search_iterations, 50);
        assert!(config.mcts.enable_pruning);
        assert_eq!(config.mcts.policy_layout, PolicyLayout::Folded);
        assert_eq!(config.actor.n_workers, 2);
        assert_eq!(config.actor.base_seed, 7);
        assert_eq!(config.env.name(), "stowage-r6c4n6");
    }
}
