//! Object store collaborator.
//!
//! The driver only needs a bounded listing of the input dataset and plain
//! puts into the job bucket, so that is all the trait exposes.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::JobResult;
use crate::StoredObject;

pub mod memory;
pub mod minio;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lists at most `max_keys` objects of `bucket` under `prefix`, in key order.
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: usize,
    ) -> JobResult<Vec<StoredObject>>;

    /// Stores `body` under `bucket`/`key`, replacing any existing object.
    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> JobResult<()>;
}
