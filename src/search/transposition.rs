use crate::env::Environment;
use crate::error::SearchError;

use ndarray::Array1;
use std::collections::HashMap;

/// Cached oracle output for one state: raw policy and raw value, before
/// any cost correction.
pub type CachedEval = (Array1<f32>, f32);

///
/// Per-episode cache of oracle evaluations, keyed by state digest.
///
/// Symmetric action orders reach identical states many times inside one
/// search; caching cuts oracle round-trips by a large constant factor.
/// The table lives for one episode so a weight update never serves stale
/// evaluations to the next one.
///
pub struct TranspositionTable<E: Environment> {
    entries: HashMap<E::Key, CachedEval>,
    hits: usize,
    misses: usize,
}

impl<E: Environment> TranspositionTable<E> {
    /// Empty table.
    pub fn new() -> Self {
        TranspositionTable {
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    /// Look up `key`, invoking `compute` on a miss. The computation runs
    /// at most once per key; its errors are never swallowed.
    pub fn get_or_insert_with<F>(&mut self, key: E::Key, compute: F) -> Result<CachedEval, SearchError>
    where
        F: FnOnce() -> Result<CachedEval, SearchError>,
    {
        if let Some(cached) = self.entries.get(&key) {
            self.hits += 1;
            return Ok(cached.clone());
        }
        let fresh = compute()?;
        self.misses += 1;
        self.entries.insert(key, fresh.clone());
        Ok(fresh)
    }

    /// Number of cached states.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookups served from the cache.
    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Lookups that had to compute.
    pub fn misses(&self) -> usize {
        self.misses
    }
}

impl<E: Environment> Default for TranspositionTable<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::flood::FloodEnv;
    use ndarray::arr1;

    #[test]
    fn compute_runs_once_per_key() {
        let mut table: TranspositionTable<FloodEnv> = TranspositionTable::new();
        let mut calls = 0;

        for _ in 0..3 {
            let (policy, value) = table
                .get_or_insert_with(vec![0, 1], || {
                    calls += 1;
                    Ok((arr1(&[0.5, 0.5]), 1.5))
                })
                .unwrap();
            assert_eq!(policy, arr1(&[0.5, 0.5]));
            assert_eq!(value, 1.5);
        }

        assert_eq!(calls, 1);
        assert_eq!(table.misses(), 1);
        assert_eq!(table.hits(), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn errors_propagate_and_cache_nothing() {
        let mut table: TranspositionTable<FloodEnv> = TranspositionTable::new();
        let result = table.get_or_insert_with(vec![7], || Err(SearchError::OracleUnavailable));
        assert!(result.is_err());
        assert!(table.is_empty());

        // The next lookup for the same key computes again.
        let ok = table.get_or_insert_with(vec![7], || Ok((arr1(&[1.0]), 0.0)));
        assert!(ok.is_ok());
        assert_eq!(table.misses(), 1);
    }
}
