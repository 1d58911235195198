//! Error types for the map phase driver.
//!
//! Every step of a job is fatal on error. The only condition that is ever
//! recovered from is "already exists", which the deployment layer collapses
//! to success before it reaches this type.

use std::fmt;
use thiserror::Error;

/// Result type for job operations
pub type JobResult<T> = Result<T, JobError>;

/// Error taxonomy of the driver
#[derive(Error, Debug)]
pub enum JobError {
    /// Configuration file missing, unreadable or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Listing returned no objects, so no batch size can be computed
    #[error("Dataset under {0} is empty")]
    EmptyDataset(String),

    /// Object store list/put failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// A worker artifact could not be built
    #[error("Packaging error for {function}: {message}")]
    Packaging { function: String, message: String },

    /// Function create/update failed for a reason other than a conflict
    #[error("Deployment error for {function}: {message}")]
    Deployment { function: String, message: String },

    /// Trigger permission could not be granted
    #[error("Permission error for {function}: {message}")]
    Permission { function: String, message: String },

    /// The synchronous invoke failed or the worker reported a failure
    #[error("Invocation error for mapper {mapper_id}: {message}")]
    Invocation { mapper_id: usize, message: String },

    /// The worker answered with a response of the wrong shape
    #[error("Decode error for mapper {mapper_id}: {message}")]
    Decode { mapper_id: usize, message: String },
}

impl JobError {
    pub fn config<E: fmt::Display>(err: E) -> Self {
        Self::Config(err.to_string())
    }

    pub fn storage<E: fmt::Display>(err: E) -> Self {
        Self::Storage(err.to_string())
    }

    pub fn packaging<E: fmt::Display>(function: &str, err: E) -> Self {
        Self::Packaging {
            function: function.to_string(),
            message: err.to_string(),
        }
    }

    pub fn deployment<E: fmt::Display>(function: &str, err: E) -> Self {
        Self::Deployment {
            function: function.to_string(),
            message: err.to_string(),
        }
    }

    pub fn permission<E: fmt::Display>(function: &str, err: E) -> Self {
        Self::Permission {
            function: function.to_string(),
            message: err.to_string(),
        }
    }

    pub fn invocation<E: fmt::Display>(mapper_id: usize, err: E) -> Self {
        Self::Invocation {
            mapper_id,
            message: err.to_string(),
        }
    }

    pub fn decode<E: fmt::Display>(mapper_id: usize, err: E) -> Self {
        Self::Decode {
            mapper_id,
            message: err.to_string(),
        }
    }

    /// Process exit code for this error kind. Never zero.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::EmptyDataset(_) => 3,
            Self::Storage(_) => 4,
            Self::Packaging { .. } => 5,
            Self::Deployment { .. } => 6,
            Self::Permission { .. } => 7,
            Self::Invocation { .. } => 8,
            Self::Decode { .. } => 9,
        }
    }
}

/// Error returned by the compute platform collaborator.
///
/// `Conflict` is the "resource already exists" answer; the deployment layer
/// decides whether that is recoverable.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlatformError {
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Other(String),
}

impl PlatformError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_and_nonzero() {
        let errors = vec![
            JobError::config("x"),
            JobError::EmptyDataset("b/p".into()),
            JobError::storage("x"),
            JobError::packaging("f", "x"),
            JobError::deployment("f", "x"),
            JobError::permission("f", "x"),
            JobError::invocation(0, "x"),
            JobError::decode(0, "x"),
        ];
        let mut codes: Vec<u8> = errors.iter().map(JobError::exit_code).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn messages_carry_context() {
        let err = JobError::decode(3, "expected 3 elements, got 2");
        assert_eq!(
            err.to_string(),
            "Decode error for mapper 3: expected 3 elements, got 2"
        );
        assert!(PlatformError::Conflict("exists".into()).is_conflict());
        assert!(!PlatformError::Other("boom".into()).is_conflict());
    }
}
