//! AWS Lambda backed by `aws-sdk-lambda`.

use async_trait::async_trait;
use std::time::Duration;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_lambda::client::Waiters;
use aws_sdk_lambda::error::DisplayErrorContext;
use aws_sdk_lambda::primitives::Blob;
use aws_sdk_lambda::types::{FunctionCode, InvocationType, Runtime};
use aws_sdk_lambda::Client;
use bytes::Bytes;
use tracing::{debug, trace};

use super::{ComputePlatform, FunctionSpec, InvokeResponse, TriggerGrant};
use crate::error::PlatformError;

/// Longest wait for a function to settle after a create or an update.
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Clone, Debug)]
pub struct LambdaPlatform {
    client: Client,
    settle_timeout: Duration,
}

impl LambdaPlatform {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
        }
    }

    pub fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    pub async fn connect(region: &str) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self::new(Client::new(&sdk_config))
    }
}

fn other<E: std::error::Error>(err: E) -> PlatformError {
    PlatformError::Other(DisplayErrorContext(&err).to_string())
}

#[async_trait]
impl ComputePlatform for LambdaPlatform {
    async fn create_function(&self, spec: &FunctionSpec, code: Bytes) -> Result<String, PlatformError> {
        let code = FunctionCode::builder().zip_file(Blob::new(code.to_vec())).build();
        let out = self
            .client
            .create_function()
            .function_name(&spec.name)
            .handler(&spec.handler)
            .runtime(Runtime::from(spec.runtime.as_str()))
            .role(&spec.role)
            .memory_size(spec.memory_mb as i32)
            .timeout(spec.timeout_secs as i32)
            .code(code)
            .send()
            .await
            .map_err(|e| {
                let conflict = e
                    .as_service_error()
                    .map(|se| se.is_resource_conflict_exception())
                    .unwrap_or(false);
                if conflict {
                    PlatformError::Conflict(format!("function {} already exists", spec.name))
                } else {
                    other(e)
                }
            })?;
        debug!("Created function {}", spec.name);
        Ok(out.function_arn.unwrap_or_default())
    }

    async fn update_function_code(&self, function: &str, code: Bytes) -> Result<String, PlatformError> {
        let out = self
            .client
            .update_function_code()
            .function_name(function)
            .zip_file(Blob::new(code.to_vec()))
            .send()
            .await
            .map_err(other)?;
        debug!("Updated code of {}", function);
        Ok(out.function_arn.unwrap_or_default())
    }

    async fn update_function_configuration(&self, spec: &FunctionSpec) -> Result<(), PlatformError> {
        self.client
            .update_function_configuration()
            .function_name(&spec.name)
            .handler(&spec.handler)
            .runtime(Runtime::from(spec.runtime.as_str()))
            .role(&spec.role)
            .memory_size(spec.memory_mb as i32)
            .timeout(spec.timeout_secs as i32)
            .send()
            .await
            .map_err(other)?;
        debug!("Updated configuration of {}", spec.name);
        Ok(())
    }

    async fn add_permission(&self, function: &str, grant: &TriggerGrant) -> Result<(), PlatformError> {
        self.client
            .add_permission()
            .function_name(function)
            .statement_id(&grant.statement_id)
            .action("lambda:InvokeFunction")
            .principal(&grant.principal)
            .source_arn(&grant.source_arn)
            .send()
            .await
            .map_err(|e| {
                let conflict = e
                    .as_service_error()
                    .map(|se| se.is_resource_conflict_exception())
                    .unwrap_or(false);
                if conflict {
                    PlatformError::Conflict(format!(
                        "statement {} already exists on {}",
                        grant.statement_id, function
                    ))
                } else {
                    other(e)
                }
            })?;
        Ok(())
    }

    async fn wait_until_active(&self, function: &str) -> Result<(), PlatformError> {
        self.client
            .wait_until_function_active_v2()
            .function_name(function)
            .wait(self.settle_timeout)
            .await
            .map_err(other)?;
        debug!("Function {} is active", function);
        Ok(())
    }

    async fn wait_until_updated(&self, function: &str) -> Result<(), PlatformError> {
        self.client
            .wait_until_function_updated_v2()
            .function_name(function)
            .wait(self.settle_timeout)
            .await
            .map_err(other)?;
        debug!("Update of {} finished", function);
        Ok(())
    }

    async fn invoke(&self, function: &str, payload: Bytes) -> Result<InvokeResponse, PlatformError> {
        trace!("Invoking {} with {} byte payload", function, payload.len());
        let out = self
            .client
            .invoke()
            .function_name(function)
            .invocation_type(InvocationType::RequestResponse)
            .payload(Blob::new(payload.to_vec()))
            .send()
            .await
            .map_err(other)?;
        Ok(InvokeResponse {
            payload: out.payload.map(|b| Bytes::from(b.into_inner())).unwrap_or_default(),
            function_error: out.function_error,
        })
    }

    async fn delete_function(&self, function: &str) -> Result<(), PlatformError> {
        self.client
            .delete_function()
            .function_name(function)
            .send()
            .await
            .map_err(other)?;
        debug!("Deleted function {}", function);
        Ok(())
    }
}
