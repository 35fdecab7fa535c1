//! Error taxonomy shared by the search engine and the self-play pipeline.

use thiserror::Error;

/// Errors surfaced by a tree search or an episode.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Every action at the search root has been pruned away. Recovered by
    /// the episode player, which closes the tree and reports a pessimistic
    /// episode value.
    #[error("no unpruned action remains at the search root")]
    TruncatedEpisode,

    /// The inference server is gone or the connection was dropped while a
    /// request was in flight.
    #[error("inference connection closed")]
    OracleUnavailable,

    /// Internal bookkeeping went wrong (wrong policy length, degenerate
    /// action distribution, ...). Aborts the actor.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}
