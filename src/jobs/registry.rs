//! Job definition registry.
//!
//! Workers only run what was explicitly registered: each definition pairs
//! a job name with a typed task factory and, optionally, explicit dispatch
//! limits for that job's queue. The registry is assembled by the embedding
//! application and handed to `listen`, which starts one dispatch loop per
//! definition; definitions without explicit limits run under the
//! configured `queue.default_limits`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::config::ConfigError;
use crate::jobs::error::{JobError, JobResult};
use crate::jobs::types::JobTask;

fn default_max_lock_per_second() -> u32 {
    10
}

fn default_max_perform_per_second() -> u32 {
    2
}

fn default_max_concurrent_perform_count() -> usize {
    1
}

/// Throughput and concurrency caps for one job's dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchLimits {
    /// Maximum queue polls per second.
    #[serde(default = "default_max_lock_per_second")]
    pub max_lock_per_second: u32,

    /// Claimed entries held beyond the ones actively performing. Zero
    /// means an entry is only claimed once a worker slot is free.
    #[serde(default)]
    pub max_buffer_jobs_count: usize,

    /// Maximum handler starts per second.
    #[serde(default = "default_max_perform_per_second")]
    pub max_perform_per_second: u32,

    /// Maximum handlers running at once.
    #[serde(default = "default_max_concurrent_perform_count")]
    pub max_concurrent_perform_count: usize,
}

impl Default for DispatchLimits {
    fn default() -> Self {
        Self {
            max_lock_per_second: default_max_lock_per_second(),
            max_buffer_jobs_count: 0,
            max_perform_per_second: default_max_perform_per_second(),
            max_concurrent_perform_count: default_max_concurrent_perform_count(),
        }
    }
}

impl DispatchLimits {
    /// Reject limits the dispatcher cannot run with.
    ///
    /// The buffer may be zero (claim only when a worker is free), but the
    /// two rates and the concurrency bound must not be.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_lock_per_second == 0 {
            return Err(ConfigError::validation(
                "max_lock_per_second",
                "the claim rate must be greater than zero",
            ));
        }

        if self.max_perform_per_second == 0 {
            return Err(ConfigError::validation(
                "max_perform_per_second",
                "the perform rate must be greater than zero",
            ));
        }

        if self.max_concurrent_perform_count == 0 {
            return Err(ConfigError::validation(
                "max_concurrent_perform_count",
                "at least one concurrent worker is required",
            ));
        }

        Ok(())
    }

    /// Gap between queue polls that keeps the lock rate under its cap.
    pub(crate) fn lock_interval(&self) -> Duration {
        Duration::from_secs(1) / self.max_lock_per_second.max(1)
    }

    /// Gap between handler starts that keeps the perform rate under its cap.
    pub(crate) fn perform_interval(&self) -> Duration {
        Duration::from_secs(1) / self.max_perform_per_second.max(1)
    }
}

type TaskFactory = Box<dyn Fn(JsonValue) -> JobResult<Box<dyn JobTask>> + Send + Sync>;

/// A registered job type: name, typed task factory, and optional
/// explicit dispatch limits.
pub struct JobDefinition {
    name: &'static str,
    factory: TaskFactory,
    limits: Option<DispatchLimits>,
}

impl JobDefinition {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The limits given at registration, if any.
    pub fn explicit_limits(&self) -> Option<DispatchLimits> {
        self.limits
    }

    /// The limits this definition's dispatch loop runs under: the
    /// explicit ones when given, otherwise `default`.
    pub fn limits_or(&self, default: DispatchLimits) -> DispatchLimits {
        self.limits.unwrap_or(default)
    }

    /// Deserializes a queue argument into this definition's task type.
    ///
    /// A `null` argument is treated as an empty object so argument-less
    /// task structs still decode.
    pub(crate) fn create_task(&self, argument: JsonValue) -> JobResult<Box<dyn JobTask>> {
        let argument = if argument.is_null() {
            JsonValue::Object(Default::default())
        } else {
            argument
        };
        (self.factory)(argument)
    }
}

impl std::fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.name)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// Registry of all job definitions a worker is willing to run.
#[derive(Debug, Default)]
pub struct JobRegistry {
    definitions: HashMap<&'static str, Arc<JobDefinition>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task type with no limits of its own; the configured
    /// `queue.default_limits` apply when `listen` starts.
    pub fn register<T>(&mut self) -> JobResult<&mut Self>
    where
        T: JobTask + DeserializeOwned + 'static,
    {
        self.insert::<T>(None)
    }

    /// Register a task type with explicit dispatch limits.
    pub fn register_with_limits<T>(&mut self, limits: DispatchLimits) -> JobResult<&mut Self>
    where
        T: JobTask + DeserializeOwned + 'static,
    {
        self.insert::<T>(Some(limits))
    }

    fn insert<T>(&mut self, limits: Option<DispatchLimits>) -> JobResult<&mut Self>
    where
        T: JobTask + DeserializeOwned + 'static,
    {
        let name = T::job_name();
        if self.definitions.contains_key(name) {
            return Err(JobError::DuplicateDefinition(name.to_string()));
        }

        let factory: TaskFactory = Box::new(|argument| {
            let task: T = serde_json::from_value(argument)
                .map_err(|e| JobError::Payload(format!("argument does not decode: {e}")))?;
            Ok(Box::new(task))
        });

        self.definitions.insert(
            name,
            Arc::new(JobDefinition {
                name,
                factory,
                limits,
            }),
        );
        tracing::debug!(job_name = name, "Registered job definition");
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<Arc<JobDefinition>> {
        self.definitions.get(name).cloned()
    }

    /// Builds a task of the named type from an argument payload.
    pub fn create_task(&self, name: &str, argument: JsonValue) -> JobResult<Box<dyn JobTask>> {
        let definition = self
            .definitions
            .get(name)
            .ok_or_else(|| JobError::UnknownJob(name.to_string()))?;
        definition.create_task(argument)
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    /// Consumes the registry into its definitions, one per dispatch loop.
    pub(crate) fn into_definitions(self) -> Vec<Arc<JobDefinition>> {
        self.definitions.into_values().collect()
    }
}
