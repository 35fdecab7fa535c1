use crate::env::{Environment, Observation};
use crate::error::SearchError;
use crate::search::PolicyValueFn;

use ndarray::Array1;

///
/// Batched policy/value estimator owned by the inference server.
///
/// `predict` scores a whole batch in one forward pass and returns one
/// policy vector and one scalar value per observation, in request order.
/// Policies are non-negative and sum to one over the action space.
///
pub trait Oracle: Send + Sync {
    /// Score a batch of observations.
    fn predict(&self, batch: &[Observation]) -> (Vec<Array1<f32>>, Vec<f32>);
}

///
/// Uninformed oracle: uniform policy, zero value. Stands in for a trained
/// network in tests and smoke runs.
///
#[derive(Clone, Debug)]
pub struct UniformOracle {
    /// Size of the action space.
    pub actions: usize,
}

impl Oracle for UniformOracle {
    fn predict(&self, batch: &[Observation]) -> (Vec<Array1<f32>>, Vec<f32>) {
        let policy = Array1::from_elem(self.actions, 1.0 / self.actions as f32);
        (vec![policy; batch.len()], vec![0.0; batch.len()])
    }
}

///
/// In-process evaluation seam: runs the oracle on single-observation
/// batches without an inference server. Useful for evaluation runs and
/// tests; self-play actors go through a connection instead so their
/// requests batch up on the server.
///
pub struct SingleEvaluator<O: Oracle> {
    oracle: O,
}

impl<O: Oracle> SingleEvaluator<O> {
    /// Wrap an oracle.
    pub fn new(oracle: O) -> Self {
        SingleEvaluator { oracle }
    }
}

impl<E: Environment, O: Oracle> PolicyValueFn<E> for SingleEvaluator<O> {
    fn evaluate(&mut self, env: &E) -> Result<(Array1<f32>, f32), SearchError> {
        let (mut policies, mut values) = self.oracle.predict(&[env.observation()]);
        match (policies.pop(), values.pop()) {
            (Some(policy), Some(value)) => Ok((policy, value)),
            _ => Err(SearchError::InvariantViolation(
                "oracle returned an empty batch".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::flood::FloodEnv;

    #[test]
    fn uniform_policy_sums_to_one() {
        let oracle = UniformOracle { actions: 4 };
        let obs = {
            let mut env = FloodEnv::from_cells(2, 2, 4, vec![0, 1, 2, 3]);
            let obs = env.observation();
            env.close();
            obs
        };
        let (policies, values) = oracle.predict(&[obs.clone(), obs]);
        assert_eq!(policies.len(), 2);
        assert_eq!(values, vec![0.0, 0.0]);
        for policy in policies {
            assert!((policy.sum() - 1.0).abs() < 1e-6);
        }
    }
}
