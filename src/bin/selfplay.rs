//! Self-play smoke driver: a pool of actors playing Flood-It through the
//! batching inference server, with an uninformed oracle standing in for a
//! trained network. Swap in a real `Oracle` implementation to generate
//! useful data.

use stowzero::deep::oracle::UniformOracle;
use stowzero::deep::replay::ReplayBuffer;
use stowzero::deep::self_play::SelfPlayPool;
use stowzero::deep::server::InferenceServer;
use stowzero::env::flood::FloodBuilder;
use stowzero::settings;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

const EPISODE_TARGET: usize = 2_000;

fn main() {
    flexi_logger::Logger::with_env_or_str("info").start().unwrap();
    log::info!("self-play: starting");

    let env = settings::Env::Flood {
        width: 6,
        height: 6,
        colors: 4,
    };
    let mcts = settings::Mcts::default();
    let actor = settings::Actor::default();
    let inference = settings::Inference::default();
    let buffer_settings = settings::Buffer::default();
    log::info!("self-play: environment {}", env.name());

    let (width, height, colors) = match env {
        settings::Env::Flood {
            width,
            height,
            colors,
        } => (width, height, colors),
        _ => unreachable!(),
    };

    let oracle = UniformOracle { actions: colors };
    let (server, connection) = InferenceServer::new(oracle, inference);
    let server_handle = server.spawn();

    let buffer = Arc::new(ReplayBuffer::new(buffer_settings.capacity));
    let pool = SelfPlayPool::spawn(
        FloodBuilder {
            width,
            height,
            colors,
        },
        connection.clone(),
        Arc::clone(&buffer),
        mcts,
        actor,
    );

    while buffer.len() < EPISODE_TARGET {
        thread::sleep(Duration::from_millis(500));
    }

    log::info!("self-play: {} tuples buffered, stopping", buffer.len());
    pool.shutdown();
    drop(connection);
    server_handle.join().unwrap();
    log::info!("self-play: done");
}
