use crate::deep::oracle::Oracle;
use crate::env::{Environment, Observation};
use crate::error::SearchError;
use crate::search::PolicyValueFn;
use crate::settings;

use crossbeam_channel::{bounded, Receiver, Sender};
use ndarray::Array1;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::{Duration, Instant};

/// One queued evaluation: the observation plus the reply channel of the
/// connection that sent it.
pub type InferenceRequest = (Observation, Sender<(Array1<f32>, f32)>);

///
/// Shared slot holding the server's oracle weights.
///
/// The trainer publishes a new snapshot by raising the writer flag and
/// swapping under the write lock; the server finishes its in-flight batch
/// against the old weights, waits out the flag, and picks up the new ones
/// on the next batch.
///
pub struct WeightSlot<O> {
    inner: Arc<(AtomicBool, RwLock<O>)>,
}

impl<O> Clone for WeightSlot<O> {
    fn clone(&self) -> Self {
        WeightSlot {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O: Oracle> WeightSlot<O> {
    fn new(oracle: O) -> Self {
        WeightSlot {
            inner: Arc::new((AtomicBool::new(false), RwLock::new(oracle))),
        }
    }

    /// Swap in a new weight snapshot.
    pub fn publish(&self, oracle: O, step_index: u64) {
        let (writer_flag, weights) = &*self.inner;
        writer_flag.store(true, Ordering::Relaxed);
        {
            let mut slot = weights.write().unwrap();
            *slot = oracle;
        }
        writer_flag.store(false, Ordering::Relaxed);
        log::info!("oracle weights updated to step {}", step_index);
    }
}

///
/// Single process-wide evaluation service.
///
/// Actors block on their connection while the server accumulates requests
/// up to the batch size or the deadline past the first arrival, runs one
/// batched forward pass, and fans the results back out first-come
/// first-served. When the last connection drops, the server drains what
/// was already queued and exits.
///
pub struct InferenceServer<O: Oracle> {
    slot: WeightSlot<O>,
    receiver: Receiver<InferenceRequest>,
    batch_size: usize,
    batch_timeout: Duration,
}

impl<O: Oracle + 'static> InferenceServer<O> {
    /// Build a server around `oracle` and hand out its first connection.
    pub fn new(oracle: O, config: settings::Inference) -> (Self, InferenceConnection) {
        let (sender, receiver) = bounded(2 * config.batch_size);
        let server = InferenceServer {
            slot: WeightSlot::new(oracle),
            receiver,
            batch_size: config.batch_size,
            batch_timeout: Duration::from_millis(config.batch_timeout_ms),
        };
        (server, InferenceConnection { sender })
    }

    /// Trainer-facing handle for weight updates.
    pub fn weights(&self) -> WeightSlot<O> {
        self.slot.clone()
    }

    /// Run the batching loop on a dedicated thread.
    pub fn spawn(self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("inference-server".into())
            .spawn(move || self.run())
            .expect("failed to spawn the inference server thread")
    }

    /// The batching loop. Returns once every connection is gone and the
    /// queue has been drained.
    pub fn run(self) {
        log::info!("inference server: starting, batch size {}", self.batch_size);
        let (writer_flag, weights) = &*self.slot.inner;
        let mut pending: Vec<InferenceRequest> = Vec::with_capacity(self.batch_size);

        loop {
            match self.receiver.recv() {
                Ok(first) => pending.push(first),
                Err(_) => break,
            }
            let deadline = Instant::now() + self.batch_timeout;
            while pending.len() < self.batch_size {
                match self.receiver.recv_deadline(deadline) {
                    Ok(request) => pending.push(request),
                    Err(_) => break,
                }
            }

            while writer_flag.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(1));
            }

            let observations: Vec<Observation> =
                pending.iter().map(|(obs, _)| obs.clone()).collect();
            let (policies, values) = {
                let oracle = weights.read().unwrap();
                oracle.predict(&observations)
            };
            if policies.len() != pending.len() || values.len() != pending.len() {
                log::error!(
                    "inference server: oracle answered {} policies / {} values for a batch of {}",
                    policies.len(),
                    values.len(),
                    pending.len()
                );
                break;
            }

            for (((_, reply), policy), value) in pending.drain(..).zip(policies).zip(values) {
                // A client that already gave up is not an error.
                let _ = reply.send((policy, value));
            }
        }

        log::info!("inference server: request channel closed, draining complete");
    }
}

///
/// Actor-side endpoint of the inference wire. Cloneable; each clone keeps
/// at most one request outstanding because `request` blocks on the reply.
///
#[derive(Clone)]
pub struct InferenceConnection {
    sender: Sender<InferenceRequest>,
}

impl InferenceConnection {
    /// Submit one observation and block for its policy and value.
    pub fn request(&self, observation: Observation) -> Result<(Array1<f32>, f32), SearchError> {
        let (reply_sender, reply_receiver) = bounded(1);
        self.sender
            .send((observation, reply_sender))
            .map_err(|_| SearchError::OracleUnavailable)?;
        reply_receiver
            .recv()
            .map_err(|_| SearchError::OracleUnavailable)
    }
}

impl<E: Environment> PolicyValueFn<E> for InferenceConnection {
    fn evaluate(&mut self, env: &E) -> Result<(Array1<f32>, f32), SearchError> {
        self.request(env.observation())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deep::oracle::UniformOracle;
    use crate::env::flood::FloodEnv;

    /// Oracle answering a fixed value, for observing weight swaps.
    struct ConstantOracle {
        actions: usize,
        value: f32,
    }

    impl Oracle for ConstantOracle {
        fn predict(&self, batch: &[Observation]) -> (Vec<Array1<f32>>, Vec<f32>) {
            let policy = Array1::from_elem(self.actions, 1.0 / self.actions as f32);
            (vec![policy; batch.len()], vec![self.value; batch.len()])
        }
    }

    fn observation() -> Observation {
        let mut env = FloodEnv::from_cells(2, 2, 3, vec![0, 1, 2, 0]);
        let obs = env.observation();
        env.close();
        obs
    }

    #[test]
    fn requests_round_trip_through_the_server() {
        let (server, connection) = InferenceServer::new(
            UniformOracle { actions: 3 },
            settings::Inference {
                batch_size: 4,
                batch_timeout_ms: 1,
            },
        );
        let handle = server.spawn();

        for _ in 0..3 {
            let (policy, value) = connection.request(observation()).unwrap();
            assert_eq!(policy.len(), 3);
            assert!((policy.sum() - 1.0).abs() < 1e-6);
            assert_eq!(value, 0.0);
        }

        drop(connection);
        handle.join().unwrap();
    }

    #[test]
    fn concurrent_connections_all_get_answers() {
        let (server, connection) = InferenceServer::new(
            UniformOracle { actions: 3 },
            settings::Inference {
                batch_size: 4,
                batch_timeout_ms: 5,
            },
        );
        let handle = server.spawn();

        let clients: Vec<_> = (0..8)
            .map(|_| {
                let connection = connection.clone();
                thread::spawn(move || connection.request(observation()).unwrap().1)
            })
            .collect();
        for client in clients {
            assert_eq!(client.join().unwrap(), 0.0);
        }

        drop(connection);
        handle.join().unwrap();
    }

    #[test]
    fn published_weights_serve_the_next_request() {
        let (server, connection) = InferenceServer::new(
            ConstantOracle {
                actions: 3,
                value: 1.0,
            },
            settings::Inference {
                batch_size: 2,
                batch_timeout_ms: 1,
            },
        );
        let weights = server.weights();
        let handle = server.spawn();

        assert_eq!(connection.request(observation()).unwrap().1, 1.0);
        weights.publish(
            ConstantOracle {
                actions: 3,
                value: 2.0,
            },
            1,
        );
        assert_eq!(connection.request(observation()).unwrap().1, 2.0);

        drop(connection);
        handle.join().unwrap();
    }

    #[test]
    fn a_dead_server_reports_the_oracle_unavailable() {
        let (server, connection) = InferenceServer::new(
            UniformOracle { actions: 3 },
            settings::Inference {
                batch_size: 2,
                batch_timeout_ms: 1,
            },
        );
        drop(server);
        match connection.request(observation()) {
            Err(SearchError::OracleUnavailable) => {}
            other => panic!("expected OracleUnavailable, got {:?}", other.map(|_| ())),
        }
    }
}
