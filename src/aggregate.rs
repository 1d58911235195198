//! Decoding of mapper responses and folding them into job totals.
//!
//! Two response shapes are understood:
//!
//! * the positional array `["<s3 get ops>", "<lines>", "<seconds>"]`
//! * the tagged object
//!   `{"version": 1, "status": "ok", "s3ReadOperations": 3, "linesProcessed": 1000, "elapsedSeconds": 2.5}`
//!   or `{"version": 1, "status": "error", "message": "..."}`
//!
//! Anything else is a decode error, and any error fails the whole job.

use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, info};

use crate::error::{JobError, JobResult};

/// Version of the tagged response format.
pub const RESPONSE_VERSION: u32 = 1;

/// Counters reported by one successful mapper.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InvocationStats {
    pub s3_read_operations: u64,
    pub lines_processed: u64,
    pub elapsed_seconds: f64,
}

/// Outcome of one mapper invocation.
pub type InvocationResult = Result<InvocationStats, JobError>;

/// Tagged response a worker sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponse {
    pub version: u32,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_read_operations: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines_processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WorkerResponse {
    pub fn ok(stats: InvocationStats) -> Self {
        Self {
            version: RESPONSE_VERSION,
            status: "ok".to_string(),
            s3_read_operations: Some(stats.s3_read_operations),
            lines_processed: Some(stats.lines_processed),
            elapsed_seconds: Some(stats.elapsed_seconds),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            version: RESPONSE_VERSION,
            status: "error".to_string(),
            s3_read_operations: None,
            lines_processed: None,
            elapsed_seconds: None,
            message: Some(message.into()),
        }
    }

    pub fn to_json(&self) -> Bytes {
        // a struct of strings and numbers always serializes
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }
}

fn parse_seconds(mapper_id: usize, seconds: f64) -> JobResult<f64> {
    if seconds.is_finite() && seconds >= 0.0 {
        Ok(seconds)
    } else {
        Err(JobError::decode(mapper_id, format!("invalid elapsed seconds {}", seconds)))
    }
}

fn decode_positional(mapper_id: usize, items: Vec<Value>) -> InvocationResult {
    if items.len() != 3 {
        return Err(JobError::decode(
            mapper_id,
            format!("expected 3 elements, got {}", items.len()),
        ));
    }
    let mut fields = Vec::with_capacity(3);
    for item in items {
        match item {
            Value::String(s) => fields.push(s),
            other => {
                return Err(JobError::decode(
                    mapper_id,
                    format!("expected a string element, got {}", other),
                ))
            }
        }
    }
    let int = |s: &str, what: &str| {
        s.trim()
            .parse::<u64>()
            .map_err(|e| JobError::decode(mapper_id, format!("{} {:?}: {}", what, s, e)))
    };
    let s3_read_operations = int(&fields[0], "s3 get ops")?;
    let lines_processed = int(&fields[1], "line count")?;
    let seconds = fields[2]
        .trim()
        .parse::<f64>()
        .map_err(|e| JobError::decode(mapper_id, format!("seconds {:?}: {}", fields[2], e)))?;
    Ok(InvocationStats {
        s3_read_operations,
        lines_processed,
        elapsed_seconds: parse_seconds(mapper_id, seconds)?,
    })
}

fn decode_tagged(mapper_id: usize, value: Value) -> InvocationResult {
    let response: WorkerResponse =
        serde_json::from_value(value).map_err(|e| JobError::decode(mapper_id, e))?;
    if response.version != RESPONSE_VERSION {
        return Err(JobError::decode(
            mapper_id,
            format!("unsupported response version {}", response.version),
        ));
    }
    match response.status.as_str() {
        "ok" => match (
            response.s3_read_operations,
            response.lines_processed,
            response.elapsed_seconds,
        ) {
            (Some(s3_read_operations), Some(lines_processed), Some(seconds)) => {
                Ok(InvocationStats {
                    s3_read_operations,
                    lines_processed,
                    elapsed_seconds: parse_seconds(mapper_id, seconds)?,
                })
            }
            _ => Err(JobError::decode(mapper_id, "ok response is missing counters")),
        },
        "error" => Err(JobError::invocation(
            mapper_id,
            response
                .message
                .unwrap_or_else(|| "worker reported an error".to_string()),
        )),
        other => Err(JobError::decode(mapper_id, format!("unknown status {:?}", other))),
    }
}

/// Decodes the raw response bytes of mapper `mapper_id`.
pub fn decode_response(mapper_id: usize, payload: &[u8]) -> InvocationResult {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| JobError::decode(mapper_id, e))?;
    match value {
        Value::Array(items) => decode_positional(mapper_id, items),
        Value::Object(_) => decode_tagged(mapper_id, value),
        other => Err(JobError::decode(
            mapper_id,
            format!("expected a JSON array or object, got {}", other),
        )),
    }
}

/// Sums over every successful invocation of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JobTotals {
    pub s3_read_operations: u64,
    pub lines_processed: u64,
    pub elapsed_seconds: f64,
    pub invocations: usize,
}

impl JobTotals {
    /// Totals with `stats` added, or `None` when a counter would overflow.
    pub fn checked_add(&self, stats: &InvocationStats) -> Option<JobTotals> {
        let elapsed_seconds = self.elapsed_seconds + stats.elapsed_seconds;
        if !elapsed_seconds.is_finite() {
            return None;
        }
        Some(JobTotals {
            s3_read_operations: self.s3_read_operations.checked_add(stats.s3_read_operations)?,
            lines_processed: self.lines_processed.checked_add(stats.lines_processed)?,
            elapsed_seconds,
            invocations: self.invocations.checked_add(1)?,
        })
    }
}

impl fmt::Display for JobTotals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Total seconds {:.6}\nTotal lines {}\nTotal S3 operations {}",
            self.elapsed_seconds, self.lines_processed, self.s3_read_operations
        )
    }
}

/// Folds results one by one. The first failure ends aggregation and the
/// totals gathered so far are dropped with the aggregator.
#[derive(Debug, Default)]
pub struct Aggregator {
    totals: JobTotals,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, mapper_id: usize, result: InvocationResult) -> JobResult<()> {
        let stats = result?;
        debug!("mapper {} reported {:?}", mapper_id, stats);
        self.totals = self.totals.checked_add(&stats).ok_or_else(|| {
            JobError::decode(
                mapper_id,
                format!("counters {:?} overflow the job totals", stats),
            )
        })?;
        Ok(())
    }

    pub fn finish(self) -> JobTotals {
        self.totals
    }
}

/// Aggregates an already collected set of results.
pub fn aggregate<I>(results: I) -> JobResult<JobTotals>
where
    I: IntoIterator<Item = (usize, InvocationResult)>,
{
    let mut aggregator = Aggregator::new();
    for (mapper_id, result) in results {
        aggregator.accept(mapper_id, result)?;
    }
    Ok(aggregator.finish())
}

/// Receives exactly `expected` results from the fan-in channel, in arrival
/// order, stopping at the first failure.
pub async fn collect(
    rx: &mut Receiver<(usize, InvocationResult)>,
    expected: usize,
) -> JobResult<JobTotals> {
    let mut aggregator = Aggregator::new();
    let mut pending: BTreeSet<usize> = (0..expected).collect();
    while !pending.is_empty() {
        match rx.recv().await {
            Some((mapper_id, result)) => {
                pending.remove(&mapper_id);
                aggregator.accept(mapper_id, result)?;
            }
            None => {
                // every sender is gone without reporting: the task died
                let missing = pending.iter().next().copied().unwrap_or_default();
                return Err(JobError::invocation(
                    missing,
                    format!("no result received ({} mappers missing)", pending.len()),
                ));
            }
        }
    }
    let totals = aggregator.finish();
    info!(
        "Aggregated {} results: {} lines, {} S3 ops, {:.3}s",
        totals.invocations, totals.lines_processed, totals.s3_read_operations, totals.elapsed_seconds
    );
    Ok(totals)
}
