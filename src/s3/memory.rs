//! In-process object store for tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use super::ObjectStore;
use crate::error::{JobError, JobResult};
use crate::StoredObject;

/// A stored body and the size listings report for it. Seeded dataset
/// objects only declare a size and keep no body.
#[derive(Clone, Debug)]
struct Entry {
    body: Bytes,
    size: u64,
}

type Objects = BTreeMap<(String, String), Entry>;

/// Buckets are created implicitly on first put. Keys list in lexical order,
/// like S3.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    objects: Arc<Mutex<Objects>>,
    fail_puts: Arc<Mutex<bool>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds `count` objects named `<prefix><index>` that list as `size`
    /// bytes each.
    pub fn with_objects(bucket: &str, prefix: &str, count: usize, size: u64) -> Self {
        let store = Self::new();
        for i in 0..count {
            store.insert_sized(bucket, &format!("{}{:05}", prefix, i), size);
        }
        store
    }

    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        let body = body.into();
        let size = body.len() as u64;
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.insert((bucket.to_string(), key.to_string()), Entry { body, size });
    }

    /// Inserts an object with an empty body that lists as `size` bytes.
    pub fn insert_sized(&self, bucket: &str, key: &str, size: u64) {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.insert(
            (bucket.to_string(), key.to_string()),
            Entry {
                body: Bytes::new(),
                size,
            },
        );
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Bytes> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.body.clone())
    }

    /// Makes every following put fail.
    pub fn fail_puts(&self) {
        *self.fail_puts.lock().unwrap_or_else(|e| e.into_inner()) = true;
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: usize,
    ) -> JobResult<Vec<StoredObject>> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        Ok(objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .take(max_keys)
            .map(|((_, k), entry)| StoredObject::new(k.clone(), entry.size))
            .collect())
    }

    async fn put_object(&self, bucket: &str, key: &str, body: Bytes) -> JobResult<()> {
        if *self.fail_puts.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(JobError::storage(format!(
                "writing s3://{}/{} failed: access denied",
                bucket, key
            )));
        }
        self.insert(bucket, key, body);
        Ok(())
    }
}
