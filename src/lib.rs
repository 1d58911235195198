//! Driver of a serverless MapReduce map phase.
//!
//! The driver lists the input dataset on S3, splits it into batches sized
//! to fit a worker's memory, deploys the mapper, reducer and reduce
//! coordinator functions, then invokes one mapper per batch and sums up
//! what the mappers report. The reduce phase runs on its own, triggered by
//! the mapper outputs landing in the job bucket.

pub mod aggregate;
pub mod cmd;
pub mod config;
pub mod deploy;
pub mod descriptor;
pub mod error;
pub mod invoke;
pub mod job;
pub mod lambda;
pub mod logging;
pub mod package;
pub mod partition;
pub mod s3;
pub mod utils;

pub use aggregate::{InvocationResult, InvocationStats, JobTotals};
pub use config::DriverConfig;
pub use descriptor::{JobData, JobDescriptor};
pub use error::{JobError, JobResult, PlatformError};
pub use job::{run_job, JobPhase, JobReport};

/////////////////////////////////////////////////////////////////////////////
// Dataset types
/////////////////////////////////////////////////////////////////////////////

/// An object of the input dataset, as listed at job start.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct StoredObject {
    /// The object key.
    pub key: String,
    /// The object size in bytes.
    pub size: u64,
}

impl StoredObject {
    /// Construct a new object from the given key and size.
    pub fn new(key: impl Into<String>, size: u64) -> Self {
        Self {
            key: key.into(),
            size,
        }
    }
}

/// Keys handled by one mapper invocation, in listing order. Never empty.
pub type Batch = Vec<String>;
