//!
//! The neural side of the pipeline: the oracle seam, the batching
//! inference server actors talk to, the shared replay buffer, and the
//! self-play drivers that feed it.
//!

///
/// Oracle contract and in-process evaluation helpers.
///
pub mod oracle;
///
/// Shared replay buffer of training tuples.
///
pub mod replay;
///
/// Episode player and the self-play actor pool.
///
pub mod self_play;
///
/// Batching inference server and its connections.
///
pub mod server;
