//! Fan-out of one synchronous mapper invocation per batch, fan-in of the
//! results through a bounded channel.
//!
//! At most `max_concurrency` invocations are in flight. When a result is a
//! failure every sibling task is aborted and the job fails.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::aggregate::{collect, decode_response, InvocationResult, JobTotals};
use crate::error::{JobError, JobResult};
use crate::lambda::ComputePlatform;
use crate::Batch;

/// Request body sent to each mapper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationPayload {
    /// Source bucket of the keys
    pub bucket: String,
    pub keys: Vec<String>,
    pub job_bucket: String,
    pub job_id: String,
    pub mapper_id: usize,
}

impl InvocationPayload {
    pub fn to_json(&self) -> JobResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| JobError::invocation(self.mapper_id, e))
    }
}

/// Where the mappers read from and report to.
#[derive(Debug, Clone)]
pub struct DispatchTarget {
    /// ARN (or name) of the deployed mapper
    pub function: String,
    pub source_bucket: String,
    pub job_bucket: String,
    pub job_id: String,
}

#[derive(Clone)]
pub struct InvocationCoordinator {
    platform: Arc<dyn ComputePlatform>,
    max_concurrency: usize,
}

/// One invocation: call, check for a function error, decode.
async fn invoke_one(
    platform: &dyn ComputePlatform,
    function: &str,
    mapper_id: usize,
    payload: Bytes,
) -> InvocationResult {
    let response = platform
        .invoke(function, payload)
        .await
        .map_err(|e| JobError::invocation(mapper_id, e))?;
    if let Some(kind) = response.function_error {
        return Err(JobError::invocation(
            mapper_id,
            format!("{}: {}", kind, String::from_utf8_lossy(&response.payload)),
        ));
    }
    let stats = decode_response(mapper_id, &response.payload)?;
    info!(
        "mapper {} done: {} S3 ops, {} lines, {}s",
        mapper_id, stats.s3_read_operations, stats.lines_processed, stats.elapsed_seconds
    );
    Ok(stats)
}

impl InvocationCoordinator {
    pub fn new(platform: Arc<dyn ComputePlatform>, max_concurrency: usize) -> Self {
        Self {
            platform,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Invokes the mapper once per batch, `mapper_id` being the batch index,
    /// and returns the totals once every batch has reported.
    pub async fn dispatch(&self, batches: Vec<Batch>, target: &DispatchTarget) -> JobResult<JobTotals> {
        let expected = batches.len();
        info!(
            "Dispatching {} mappers to {} (max {} in flight)",
            expected, target.function, self.max_concurrency
        );
        if expected == 0 {
            return Ok(JobTotals::default());
        }

        let payloads = batches
            .into_iter()
            .enumerate()
            .map(|(mapper_id, keys)| {
                InvocationPayload {
                    bucket: target.source_bucket.clone(),
                    keys,
                    job_bucket: target.job_bucket.clone(),
                    job_id: target.job_id.clone(),
                    mapper_id,
                }
                .to_json()
            })
            .collect::<JobResult<Vec<Bytes>>>()?;

        let (tx, mut rx) = mpsc::channel::<(usize, InvocationResult)>(expected);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(expected);

        for (mapper_id, payload) in payloads.into_iter().enumerate() {
            let tx = tx.clone();
            let semaphore = semaphore.clone();
            let platform = self.platform.clone();
            let function = target.function.clone();
            let span = info_span!("mapper", mapper_id);

            handles.push(tokio::spawn(
                async move {
                    let result = match semaphore.acquire_owned().await {
                        Ok(_permit) => {
                            debug!("invoking");
                            invoke_one(platform.as_ref(), &function, mapper_id, payload).await
                        }
                        Err(e) => Err(JobError::invocation(mapper_id, e)),
                    };
                    // the receiver is gone only when the job already failed
                    let _ = tx.send((mapper_id, result)).await;
                }
                .instrument(span),
            ));
        }
        drop(tx);

        let outcome = collect(&mut rx, expected).await;
        if let Err(e) = &outcome {
            warn!("Aborting in-flight mappers after failure: {}", e);
            for handle in &handles {
                handle.abort();
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlatformError;
    use crate::lambda::memory::InMemoryPlatform;
    use crate::lambda::{FunctionSpec, InvokeResponse};
    use std::time::Duration;

    async fn deployed(platform: InMemoryPlatform) -> (InMemoryPlatform, DispatchTarget) {
        let spec = FunctionSpec {
            name: "BL-mapper-j1".to_string(),
            handler: "mapper.handler".to_string(),
            runtime: "python3.12".to_string(),
            memory_mb: 1536,
            timeout_secs: 300,
            role: "role".to_string(),
        };
        let arn = platform.create_function(&spec, Bytes::new()).await.unwrap();
        platform.wait_until_active(&arn).await.unwrap();
        let target = DispatchTarget {
            function: arn,
            source_bucket: "data".to_string(),
            job_bucket: "jobs".to_string(),
            job_id: "j1".to_string(),
        };
        (platform, target)
    }

    fn batches(n: usize) -> Vec<Batch> {
        (0..n).map(|i| vec![format!("key-{}", i)]).collect()
    }

    fn mapper_id(payload: &[u8]) -> usize {
        serde_json::from_slice::<InvocationPayload>(payload)
            .map(|p| p.mapper_id)
            .unwrap_or(usize::MAX)
    }

    #[test]
    fn payload_wire_format() {
        let payload = InvocationPayload {
            bucket: "data".to_string(),
            keys: vec!["a".to_string(), "b".to_string()],
            job_bucket: "jobs".to_string(),
            job_id: "j1".to_string(),
            mapper_id: 3,
        };
        let value: serde_json::Value = serde_json::from_slice(&payload.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "bucket": "data",
                "keys": ["a", "b"],
                "jobBucket": "jobs",
                "jobId": "j1",
                "mapperId": 3
            })
        );
    }

    #[tokio::test]
    async fn one_invocation_per_batch() {
        let (platform, target) = deployed(
            InMemoryPlatform::new().with_handler(|_| Ok(InvokeResponse::ok(r#"["2","10","0.5"]"#))),
        )
        .await;
        let coordinator = InvocationCoordinator::new(Arc::new(platform.clone()), 8);

        let totals = coordinator.dispatch(batches(5), &target).await.unwrap();
        assert_eq!(platform.invocations(), 5);
        assert_eq!(totals.s3_read_operations, 10);
        assert_eq!(totals.lines_processed, 50);
        assert_eq!(totals.elapsed_seconds, 2.5);

        let mut ids: Vec<usize> = platform.payloads().iter().map(|p| mapper_id(p)).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn concurrency_limit_is_enforced() {
        let (platform, target) =
            deployed(InMemoryPlatform::new().with_latency(Duration::from_millis(20))).await;
        let coordinator = InvocationCoordinator::new(Arc::new(platform.clone()), 3);

        coordinator.dispatch(batches(12), &target).await.unwrap();
        assert_eq!(platform.invocations(), 12);
        assert!(platform.peak_in_flight() <= 3, "peak {}", platform.peak_in_flight());
        assert!(platform.peak_in_flight() >= 2);
    }

    #[tokio::test]
    async fn malformed_response_fails_the_job() {
        let (platform, target) = deployed(InMemoryPlatform::new().with_handler(|payload| {
            if mapper_id(payload) == 2 {
                Ok(InvokeResponse::ok(r#"["1","2"]"#))
            } else {
                Ok(InvokeResponse::ok(r#"["1","2","3"]"#))
            }
        }))
        .await;
        let coordinator = InvocationCoordinator::new(Arc::new(platform), 4);

        let err = coordinator.dispatch(batches(4), &target).await.unwrap_err();
        assert!(matches!(err, JobError::Decode { mapper_id: 2, .. }));
    }

    #[tokio::test]
    async fn transport_and_function_errors_fail_the_job() {
        let (platform, target) = deployed(InMemoryPlatform::new().with_handler(|payload| {
            match mapper_id(payload) {
                0 => Err(PlatformError::Other("throttled".to_string())),
                _ => Ok(InvokeResponse::ok(r#"["1","1","1"]"#)),
            }
        }))
        .await;
        let err = InvocationCoordinator::new(Arc::new(platform), 1)
            .dispatch(batches(2), &target)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Invocation { mapper_id: 0, .. }));

        let (platform, target) = deployed(InMemoryPlatform::new().with_handler(|_| {
            Ok(InvokeResponse::function_error(
                "Unhandled",
                r#"{"errorMessage":"Task timed out"}"#,
            ))
        }))
        .await;
        let err = InvocationCoordinator::new(Arc::new(platform), 1)
            .dispatch(batches(1), &target)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Task timed out"));
    }

    #[tokio::test]
    async fn siblings_are_aborted_on_first_failure() {
        let (platform, target) = deployed(
            InMemoryPlatform::new()
                .with_latency_fn(|payload| {
                    if mapper_id(payload) == 0 {
                        Duration::ZERO
                    } else {
                        Duration::from_secs(30)
                    }
                })
                .with_handler(|payload| {
                    if mapper_id(payload) == 0 {
                        Ok(InvokeResponse::ok("{}"))
                    } else {
                        Ok(InvokeResponse::ok(r#"["1","1","1"]"#))
                    }
                }),
        )
        .await;
        let coordinator = InvocationCoordinator::new(Arc::new(platform.clone()), 10);

        let started = std::time::Instant::now();
        let err = coordinator.dispatch(batches(6), &target).await.unwrap_err();
        assert!(matches!(err, JobError::Decode { mapper_id: 0, .. }));
        assert!(started.elapsed() < Duration::from_secs(10));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(platform.completed_invocations(), 1);
    }

    #[tokio::test]
    async fn no_batches_no_invocations() {
        let (platform, target) = deployed(InMemoryPlatform::new()).await;
        let totals = InvocationCoordinator::new(Arc::new(platform.clone()), 2)
            .dispatch(Vec::new(), &target)
            .await
            .unwrap();
        assert_eq!(totals, JobTotals::default());
        assert_eq!(platform.invocations(), 0);
    }
}
