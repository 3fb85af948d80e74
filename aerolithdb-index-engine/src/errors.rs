//! # Engine Error Taxonomy
//!
//! One enum, partitioned along the recoverable/fatal line of the error
//! handling design: recoverable variants are logged and swallowed at the call
//! site that produced them; fatal variants propagate and end the process.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// A single profile-stream fetch or sample query failed. The drain loop
    /// logs and continues.
    #[error("transient I/O error during {context}: {source}")]
    Transient {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// A field referenced by a query was not present in the sampled data.
    /// Never blocks recommendation: a minimum-cardinality statistic is
    /// synthesized instead.
    #[error("field '{field}' not present in sampled statistics")]
    StatisticMiss { field: String },

    /// `createIndex` failed with "value too large to index". Not propagated;
    /// triggers a hash-mode demotion on the sampler side instead.
    #[error("index '{index}' rejected as too large to index (field '{field}')")]
    IndexTooLarge { index: String, field: String },

    /// `dropIndex` failed. Logged; reconciliation continues with the
    /// remaining actions.
    #[error("failed to drop index '{name}': {source}")]
    DropIndexFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// An unrecognized `$`-prefixed predicate operator was encountered.
    /// Treated as a no-op for that operator.
    #[error("unrecognized predicate operator '{op}'")]
    UnrecognizedOperator { op: String },

    /// The database connection was lost. Fatal.
    #[error("database connection lost: {0}")]
    ConnectionLost(#[source] anyhow::Error),

    /// Authentication with the database failed. Fatal.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(#[source] anyhow::Error),

    /// Writing engine state failed. Fatal.
    #[error("failed to persist engine state: {0}")]
    StatePersistenceFailed(#[source] anyhow::Error),

    /// The profiling stream cursor ended (profiling disabled mid-run).
    /// Fatal; a supervisor is expected to restart the engine.
    #[error("profiling stream ended unexpectedly")]
    ProfilingStreamEnded,
}

impl EngineError {
    /// Whether this error must short-circuit the current synchronization
    /// cycle and terminate the process, per the propagation policy in
    /// SPEC_FULL.md §7.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::ConnectionLost(_)
                | EngineError::AuthenticationFailed(_)
                | EngineError::StatePersistenceFailed(_)
                | EngineError::ProfilingStreamEnded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification_matches_specification() {
        assert!(EngineError::ConnectionLost(anyhow::anyhow!("boom")).is_fatal());
        assert!(EngineError::ProfilingStreamEnded.is_fatal());
        assert!(!EngineError::StatisticMiss { field: "x".into() }.is_fatal());
        assert!(!EngineError::UnrecognizedOperator { op: "$foo".into() }.is_fatal());
        assert!(!EngineError::IndexTooLarge {
            index: "auto_x".into(),
            field: "blob".into()
        }
        .is_fatal());
    }
}
