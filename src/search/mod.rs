use crate::env::Environment;
use crate::error::SearchError;

use ndarray::Array1;

///
/// Running value bounds used to rescale Q-values.
///
pub mod min_max;
///
/// Search tree nodes.
///
pub mod node;
///
/// The tree search engine.
///
pub mod puct;
///
/// Per-episode oracle cache.
///
pub mod transposition;

///
/// The state evaluation seam the engine consults: a policy over the full
/// action vector together with a scalar value estimate.
///
/// Implemented by inference connections and, for tests and local runs, by
/// plain closures.
///
pub trait PolicyValueFn<E: Environment> {
    /// Score one state.
    fn evaluate(&mut self, env: &E) -> Result<(Array1<f32>, f32), SearchError>;
}

impl<E, F> PolicyValueFn<E> for F
where
    E: Environment,
    F: FnMut(&E) -> Result<(Array1<f32>, f32), SearchError>,
{
    fn evaluate(&mut self, env: &E) -> Result<(Array1<f32>, f32), SearchError> {
        self(env)
    }
}
