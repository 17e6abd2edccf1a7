//! Locates and merges the TOML configuration layers.
//!
//! [`ConfigLoader`] decides which files to read (a configuration
//! directory holding layered files, or one explicit file), merges them
//! through the `config` crate, applies `QUERN_*` environment variable
//! overrides on top, and hands back a validated [`Settings`].

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};

use crate::config::environment::Environment as AppEnvironment;
use crate::config::error::ConfigError;
use crate::config::settings::Settings;

/// Resolves and merges configuration sources.
///
/// Layers, lowest priority first:
/// 1. `default.toml` in the config directory (required)
/// 2. `{environment}.toml` (optional)
/// 3. `local.toml` (optional, for machine-local overrides)
/// 4. `QUERN_*` environment variables
///
/// Setting [`ConfigLoader::FILE_VAR`] replaces layers 1-3 with a single
/// explicit file; the environment variables still apply on top.
#[derive(Debug)]
pub struct ConfigLoader {
    config_dir: PathBuf,
    config_file: Option<PathBuf>,
    environment: AppEnvironment,
}

impl ConfigLoader {
    /// Overrides the directory scanned for layered TOML files.
    pub const DIR_VAR: &'static str = "QUERN_CONFIG_DIR";

    /// Points at one exact TOML file, disabling layered loading.
    pub const FILE_VAR: &'static str = "QUERN_CONFIG_FILE";

    /// Directory scanned when [`ConfigLoader::DIR_VAR`] is unset.
    const DEFAULT_DIR: &'static str = "config";

    /// Prefix for environment variable overrides, e.g.
    /// `QUERN_QUEUE__LOCK_LEASE_SECS` becomes `queue.lock_lease_secs`.
    const ENV_PREFIX: &'static str = "QUERN";

    /// Read the override variables and decide where configuration lives.
    ///
    /// # Errors
    ///
    /// [`ConfigLoader::DIR_VAR`] and [`ConfigLoader::FILE_VAR`] are
    /// mutually exclusive; setting both is rejected here rather than
    /// silently preferring one.
    pub fn new() -> Result<Self, ConfigError> {
        let dir_override = std::env::var(Self::DIR_VAR).ok();
        let file_override = std::env::var(Self::FILE_VAR).ok();

        if dir_override.is_some() && file_override.is_some() {
            return Err(ConfigError::mutual_exclusivity(format!(
                "{dir} and {file} cannot both be set; use {dir} for a layered \
                 config directory or {file} for a single file",
                dir = Self::DIR_VAR,
                file = Self::FILE_VAR,
            )));
        }

        Ok(Self {
            config_dir: dir_override
                .map_or_else(|| PathBuf::from(Self::DEFAULT_DIR), PathBuf::from),
            config_file: file_override.map(PathBuf::from),
            environment: AppEnvironment::from_env(),
        })
    }

    /// The environment whose `.toml` layer will be merged.
    pub fn environment(&self) -> AppEnvironment {
        self.environment
    }

    /// Directory the layered files are read from.
    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Merge every source and return validated settings.
    ///
    /// # Errors
    ///
    /// Fails when a required file is missing, when the merged tree does
    /// not deserialize into [`Settings`], or when the deserialized
    /// values break a semantic rule (see [`Settings::validate`]).
    pub fn load(&self) -> Result<Settings, ConfigError> {
        let merged = self.merge_sources()?;
        let settings: Settings = merged.try_deserialize().map_err(|e| {
            ConfigError::ParseError(format!("could not deserialize settings: {e}"))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    fn merge_sources(&self) -> Result<Config, ConfigError> {
        let mut builder = Config::builder();
        for (path, required) in self.file_layers()? {
            builder = builder.add_source(File::from(path).required(required));
        }
        builder = builder.add_source(
            Environment::with_prefix(Self::ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .ignore_empty(true)
                .try_parsing(true),
        );
        builder.build().map_err(ConfigError::from)
    }

    /// The TOML files to merge, lowest priority first.
    ///
    /// Required files are checked for existence here so a missing
    /// `default.toml` surfaces as [`ConfigError::FileNotFound`] instead
    /// of an opaque builder error.
    fn file_layers(&self) -> Result<Vec<(PathBuf, bool)>, ConfigError> {
        if let Some(file) = &self.config_file {
            if !file.exists() {
                return Err(ConfigError::file_not_found(file.display().to_string()));
            }
            return Ok(vec![(file.clone(), true)]);
        }

        let base = self.config_dir.join("default.toml");
        if !base.exists() {
            return Err(ConfigError::file_not_found(base.display().to_string()));
        }

        Ok(vec![
            (base, true),
            (
                self.config_dir
                    .join(format!("{}.toml", self.environment)),
                false,
            ),
            (self.config_dir.join("local.toml"), false),
        ])
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new().unwrap_or_else(|_| Self {
            config_dir: PathBuf::from(Self::DEFAULT_DIR),
            config_file: None,
            environment: AppEnvironment::default(),
        })
    }
}
