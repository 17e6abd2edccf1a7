use thiserror::Error;

/// Errors surfaced by durable queue store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Could not obtain a connection from the pool.
    #[error("queue store connection failed")]
    Connection {
        #[source]
        source: anyhow::Error,
    },

    /// A query against the store failed.
    #[error("queue store query failed: {operation}")]
    Query {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// A finalizing update matched no live claimed entry, meaning the
    /// entry was already completed, expired, or removed underneath us.
    #[error("queue entry {0} is no longer claimed")]
    LostClaim(i64),

    /// Schema migrations could not be applied.
    #[error("queue store migration failed")]
    Migration {
        #[source]
        source: anyhow::Error,
    },
}

impl StoreError {
    pub(crate) fn connection(source: impl Into<anyhow::Error>) -> Self {
        Self::Connection {
            source: source.into(),
        }
    }

    pub(crate) fn query(operation: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Query {
            operation: operation.into(),
            source: source.into(),
        }
    }
}
