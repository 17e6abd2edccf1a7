//! Queue payload encoding.
//!
//! Every queue entry carries a two-element JSON array: the job id as a
//! decimal string, followed by the job's argument value. The id travels
//! as a string so payloads stay readable in the database and survive
//! tooling that mangles large integers.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};

use crate::jobs::error::{JobError, JobResult};
use crate::jobs::types::JobId;

/// Builds the queue payload for a job invocation.
pub fn encode(job_id: JobId, argument: &JsonValue) -> JsonValue {
    json!([job_id.to_string(), argument])
}

/// Splits a queue payload back into the job id and its argument.
///
/// Accepts a one-element payload (no argument) for compatibility with
/// producers that omit the argument slot; the argument then decodes as
/// JSON `null`.
pub fn decode(args: &JsonValue) -> JobResult<(JobId, JsonValue)> {
    let elements = args
        .as_array()
        .ok_or_else(|| JobError::Payload(format!("expected a JSON array, got: {args}")))?;
    if elements.is_empty() || elements.len() > 2 {
        return Err(JobError::Payload(format!(
            "expected [job_id, argument], got {} elements",
            elements.len()
        )));
    }

    let raw_id = elements[0]
        .as_str()
        .ok_or_else(|| JobError::Payload(format!("job id must be a string, got: {}", elements[0])))?;
    let job_id: JobId = raw_id
        .parse()
        .map_err(|_| JobError::Payload(format!("job id is not an unsigned integer: '{raw_id}'")))?;

    let argument = elements.get(1).cloned().unwrap_or(JsonValue::Null);
    Ok((job_id, argument))
}

#[derive(Deserialize)]
struct ScheduleProbe {
    #[serde(default)]
    schedule_time: Option<DateTime<Utc>>,
}

/// Extracts a requested run time from an argument payload, if present.
///
/// Arguments that are not objects, or objects without a `schedule_time`
/// field, simply run immediately.
pub fn scheduled_run_at(argument: &JsonValue) -> Option<DateTime<Utc>> {
    serde_json::from_value::<ScheduleProbe>(argument.clone())
        .ok()
        .and_then(|probe| probe.schedule_time)
}
