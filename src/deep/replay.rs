use crate::env::Observation;

use ndarray::Array1;
use rand::rngs::StdRng;
use rand::seq::index;
use std::collections::VecDeque;
use std::sync::Mutex;

/// One training tuple: the observation the decision was made from, the
/// visit-count policy the search produced, and the bootstrapped value
/// target.
#[derive(Clone, Debug)]
pub struct TrainingSample {
    /// Oracle input at decision time.
    pub observation: Observation,
    /// Improved policy.
    pub policy: Array1<f32>,
    /// Value target.
    pub value: f32,
}

///
/// Bounded ring of training tuples shared by every actor. Oldest tuples
/// are evicted first; sampling draws without replacement.
///
pub struct ReplayBuffer {
    entries: Mutex<VecDeque<TrainingSample>>,
    capacity: usize,
}

impl ReplayBuffer {
    /// Buffer holding at most `capacity` tuples.
    pub fn new(capacity: usize) -> Self {
        ReplayBuffer {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append an episode's tuples, evicting the oldest past capacity.
    pub fn extend(&self, samples: Vec<TrainingSample>) {
        let mut entries = self.entries.lock().unwrap();
        for sample in samples {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(sample);
        }
    }

    /// Draw `batch_size` tuples uniformly without replacement, or `None`
    /// while the buffer holds fewer than that.
    pub fn sample(&self, batch_size: usize, rng: &mut StdRng) -> Option<Vec<TrainingSample>> {
        let entries = self.entries.lock().unwrap();
        if entries.len() < batch_size {
            return None;
        }
        let picks = index::sample(rng, entries.len(), batch_size);
        Some(picks.iter().map(|i| entries[i].clone()).collect())
    }

    /// Number of stored tuples.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the buffer holds nothing yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;
    use rand::SeedableRng;

    fn sample_with_value(value: f32) -> TrainingSample {
        TrainingSample {
            observation: Observation(vec![]),
            policy: arr1(&[1.0]),
            value,
        }
    }

    #[test]
    fn eviction_is_oldest_first() {
        let buffer = ReplayBuffer::new(3);
        buffer.extend((0..5).map(|i| sample_with_value(i as f32)).collect());
        assert_eq!(buffer.len(), 3);

        let mut rng = StdRng::seed_from_u64(0);
        let batch = buffer.sample(3, &mut rng).unwrap();
        let mut values: Vec<f32> = batch.iter().map(|s| s.value).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn sampling_needs_enough_entries_and_never_repeats() {
        let buffer = ReplayBuffer::new(8);
        let mut rng = StdRng::seed_from_u64(7);
        assert!(buffer.sample(1, &mut rng).is_none());

        buffer.extend((0..8).map(|i| sample_with_value(i as f32)).collect());
        let batch = buffer.sample(8, &mut rng).unwrap();
        let mut values: Vec<f32> = batch.iter().map(|s| s.value).collect();
        values.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(values, (0..8).map(|i| i as f32).collect::<Vec<_>>());
    }
}
