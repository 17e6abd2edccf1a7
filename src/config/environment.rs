//! Deployment environment selection.
//!
//! The active environment decides which `{environment}.toml` layer the
//! [`ConfigLoader`](crate::config::ConfigLoader) merges on top of
//! `default.toml`.

use std::str::FromStr;

use crate::config::error::ConfigError;

/// The deployment environment the process runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    /// Local development, the fallback when nothing is configured.
    #[default]
    Development,
    /// Automated test runs.
    Test,
    /// Pre-production staging.
    Staging,
    /// Production.
    Production,
}

impl Environment {
    /// Process environment variable consulted by [`Environment::from_env`].
    pub const ENV_VAR: &'static str = "QUERN_APP_ENV";

    /// Resolve the environment from `QUERN_APP_ENV`.
    ///
    /// Unset or unparseable values fall back to [`Environment::Development`]
    /// rather than failing, so a bare `cargo run` works out of the box.
    pub fn from_env() -> Self {
        match std::env::var(Self::ENV_VAR) {
            Ok(raw) => raw.parse().unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// Canonical lowercase name, used as the config file stem.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Test => "test",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "development" | "dev" => Ok(Self::Development),
            "test" => Ok(Self::Test),
            "staging" | "stage" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            _ => Err(ConfigError::EnvVarError(format!(
                "unrecognized environment {value:?}, expected one of: \
                 development, test, staging, production"
            ))),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
