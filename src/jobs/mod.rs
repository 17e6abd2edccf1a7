pub mod error;
pub mod types;
pub mod payload;
pub mod registry;
pub(crate) mod dispatcher;
pub(crate) mod heartbeat;

#[cfg(test)]
mod tests;

pub use error::{JobError, JobResult};
pub use types::{HandleLookup, JobContext, JobHandle, JobId, JobStatus, JobTask};
pub use registry::{DispatchLimits, JobDefinition, JobRegistry};
