//! Layered configuration for the queue runtime.
//!
//! Settings come from TOML files merged in a fixed order, with
//! `QUERN_*` environment variables applied on top:
//!
//! 1. `default.toml`: required baseline
//! 2. `{environment}.toml`: per-environment overrides (the environment
//!    comes from `QUERN_APP_ENV`, defaulting to `development`)
//! 3. `local.toml`: optional machine-local overrides, kept out of
//!    version control
//! 4. `QUERN_*` environment variables, highest priority
//!
//! [`ConfigLoader`] resolves where those files live; [`Settings`] is the
//! deserialized result, and its `validate` method enforces the semantic
//! rules in [`validation`].

pub mod environment;
pub mod error;
pub mod loader;
pub mod settings;
pub mod validation;

pub use environment::Environment;
pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use settings::{DatabaseConfig, QueueConfig, Settings};
