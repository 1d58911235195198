//! Job descriptor and job data records.
//!
//! Both are written once, before the first mapper is invoked. The
//! descriptor's `mapCount` is how the reduce coordinator learns how many
//! mapper outputs to wait for.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{JobError, JobResult};
use crate::s3::ObjectStore;

/// Name of the descriptor inside each worker archive.
pub const DESCRIPTOR_FILE: &str = "jobconfig.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub job_id: String,
    pub job_bucket: String,
    pub reducer_function_name: String,
    pub reducer_handler: String,
    pub map_count: usize,
}

impl JobDescriptor {
    pub fn new(
        job_id: impl Into<String>,
        job_bucket: impl Into<String>,
        reducer_function_name: impl Into<String>,
        reducer_handler: impl Into<String>,
        map_count: usize,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            job_bucket: job_bucket.into(),
            reducer_function_name: reducer_function_name.into(),
            reducer_handler: reducer_handler.into(),
            map_count,
        }
    }

    /// `<jobId>/jobconfig.json` in the job bucket.
    pub fn key(&self) -> String {
        format!("{}/{}", self.job_id, DESCRIPTOR_FILE)
    }

    pub fn to_json(&self) -> JobResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(JobError::storage)
    }
}

/// Observability summary stored at `<jobId>/jobdata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobData {
    pub map_count: usize,
    pub total_objects: usize,
    /// Fractional seconds since the unix epoch
    pub start_time: f64,
}

pub fn job_data_key(job_id: &str) -> String {
    format!("{}/jobdata", job_id)
}

/// Persists the descriptor to the job bucket and returns the serialized
/// bytes, which are then bundled into every worker archive.
pub async fn write_descriptor(
    store: &dyn ObjectStore,
    descriptor: &JobDescriptor,
) -> JobResult<Bytes> {
    let body = descriptor.to_json()?;
    store
        .put_object(&descriptor.job_bucket, &descriptor.key(), body.clone())
        .await?;
    info!(
        "Wrote job descriptor s3://{}/{} (mapCount {})",
        descriptor.job_bucket,
        descriptor.key(),
        descriptor.map_count
    );
    Ok(body)
}

pub async fn write_job_data(
    store: &dyn ObjectStore,
    job_bucket: &str,
    job_id: &str,
    data: &JobData,
) -> JobResult<()> {
    let body = serde_json::to_vec(data).map_err(JobError::storage)?;
    store
        .put_object(job_bucket, &job_data_key(job_id), Bytes::from(body))
        .await
}
