//! S3 (or S3-compatible, e.g. MinIO) object store backed by `aws-sdk-s3`.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, trace};

use super::ObjectStore;
use crate::error::{JobError, JobResult};
use crate::StoredObject;

/// S3 limits a single listing page to this many keys.
const PAGE_SIZE: usize = 1000;

#[derive(Clone, Debug)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client for `region`. With an `endpoint` the client talks
    /// path-style to that S3-compatible server instead of AWS.
    pub async fn connect(region: &str, endpoint: Option<&str>) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_string()));
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if endpoint.is_some() {
            builder = builder.force_path_style(true);
        }
        Self::new(Client::from_conf(builder.build()))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: usize,
    ) -> JobResult<Vec<StoredObject>> {
        trace!("bucket:      {}", bucket);
        trace!("prefix:      {}", prefix);
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        while objects.len() < max_keys {
            let page = (max_keys - objects.len()).min(PAGE_SIZE);
            let resp = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .max_keys(page as i32)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    JobError::storage(format!(
                        "listing s3://{}/{} failed: {}",
                        bucket,
                        prefix,
                        DisplayErrorContext(&e)
                    ))
                })?;

            for object in resp.contents.unwrap_or_default() {
                let key = object.key.unwrap_or_default();
                let size = object.size.unwrap_or_default().max(0) as u64;
                objects.push(StoredObject::new(key, size));
            }

            match (resp.is_truncated, resp.next_continuation_token) {
                (Some(true), Some(token)) => continuation = Some(token),
                _ => break,
            }
        }
        objects.truncate(max_keys);
        debug!("Listed {} objects under s3://{}/{}", objects.len(), bucket, prefix);
        Ok(objects)
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> JobResult<()> {
        let len = body.len();
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                JobError::storage(format!(
                    "writing s3://{}/{} failed: {}",
                    bucket,
                    key,
                    DisplayErrorContext(&e)
                ))
            })?;
        debug!("Wrote {} bytes to s3://{}/{}", len, bucket, key);
        Ok(())
    }
}
