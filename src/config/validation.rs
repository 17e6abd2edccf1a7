//! Semantic checks applied after deserialization.
//!
//! The serde layer only guarantees types; these checks guarantee the
//! values cooperate. The main cross-field rule is that the claim lease
//! must outlast the heartbeat interval that renews it, otherwise every
//! running job would lose its claim between renewals.

use crate::config::error::ConfigError;
use crate::config::settings::{DatabaseConfig, QueueConfig, Settings};

/// Accepted URL schemes for the Postgres-backed store.
const POSTGRES_SCHEMES: [&str; 2] = ["postgres://", "postgresql://"];

fn is_postgres_url(url: &str) -> bool {
    POSTGRES_SCHEMES.iter().any(|scheme| url.starts_with(scheme))
}

fn require_nonzero(value: u64, field: &str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::validation(field, "must be greater than zero"));
    }
    Ok(())
}

impl DatabaseConfig {
    /// Check that the pool settings describe a reachable Postgres setup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::validation(
                "database.url",
                "a Postgres connection string is required",
            ));
        }

        if !is_postgres_url(&self.url) {
            return Err(ConfigError::validation(
                "database.url",
                "expected postgres://[user:password@]host[:port]/database",
            ));
        }

        require_nonzero(u64::from(self.max_connections), "database.max_connections")?;

        if self.min_connections > self.max_connections {
            return Err(ConfigError::validation(
                "database.min_connections",
                "cannot exceed database.max_connections",
            ));
        }

        require_nonzero(self.connection_timeout, "database.connection_timeout")
    }
}

impl QueueConfig {
    /// Check the dispatch and claim timing parameters.
    ///
    /// Beyond the nonzero checks, the lease must be strictly longer than
    /// the heartbeat interval, and the default dispatch limits must pass
    /// their own validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero(self.heartbeat_interval_ms, "queue.heartbeat_interval_ms")?;
        require_nonzero(self.lock_lease_secs, "queue.lock_lease_secs")?;
        require_nonzero(self.retry_backoff_secs, "queue.retry_backoff_secs")?;

        if self.lock_lease_secs.saturating_mul(1000) <= self.heartbeat_interval_ms {
            return Err(ConfigError::validation(
                "queue.lock_lease_secs",
                "the claim lease must outlast the heartbeat interval that renews it",
            ));
        }

        self.default_limits.validate()
    }
}

impl Settings {
    /// Run every section's checks, stopping at the first failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.database.validate()?;
        self.queue.validate()
    }
}
