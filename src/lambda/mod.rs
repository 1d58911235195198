//! Compute platform collaborator: function deployment, permissions and
//! synchronous invocation.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::PlatformError;

pub mod aws;
pub mod memory;

/// Principal used when the object store triggers a function.
pub const OBJECT_STORE_PRINCIPAL: &str = "s3.amazonaws.com";

/// Everything the platform needs to create or reconfigure a function,
/// apart from its code.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    pub handler: String,
    pub runtime: String,
    pub memory_mb: u32,
    pub timeout_secs: u32,
    pub role: String,
}

/// A resource policy statement letting `principal` invoke a function on
/// events from `source_arn`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TriggerGrant {
    pub principal: String,
    pub source_arn: String,
    pub statement_id: String,
}

/// Raw answer of a synchronous invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeResponse {
    pub payload: Bytes,
    /// Set when the function itself failed (unhandled error, timeout)
    pub function_error: Option<String>,
}

impl InvokeResponse {
    pub fn ok(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            function_error: None,
        }
    }

    pub fn function_error(kind: &str, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            function_error: Some(kind.to_string()),
        }
    }
}

#[async_trait]
pub trait ComputePlatform: Send + Sync {
    /// Creates the function and returns its ARN. Fails with
    /// [`PlatformError::Conflict`] when a function of that name exists.
    async fn create_function(&self, spec: &FunctionSpec, code: Bytes) -> Result<String, PlatformError>;

    /// Replaces the code of an existing function and returns its ARN.
    async fn update_function_code(&self, function: &str, code: Bytes) -> Result<String, PlatformError>;

    /// Applies handler, runtime, memory, timeout and role of `spec` to the
    /// existing function named `spec.name`.
    async fn update_function_configuration(&self, spec: &FunctionSpec) -> Result<(), PlatformError>;

    /// Adds a resource policy statement. Fails with
    /// [`PlatformError::Conflict`] when the statement id is taken.
    async fn add_permission(&self, function: &str, grant: &TriggerGrant) -> Result<(), PlatformError>;

    /// Waits for a newly created function to leave the `Pending` state.
    /// Invocations and updates are rejected until then.
    async fn wait_until_active(&self, function: &str) -> Result<(), PlatformError>;

    /// Waits for the last code or configuration update to finish. A second
    /// update is rejected while one is in progress.
    async fn wait_until_updated(&self, function: &str) -> Result<(), PlatformError>;

    /// Invokes synchronously and waits for the function to finish.
    async fn invoke(&self, function: &str, payload: Bytes) -> Result<InvokeResponse, PlatformError>;

    async fn delete_function(&self, function: &str) -> Result<(), PlatformError>;
}
