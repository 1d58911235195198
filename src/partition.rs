//! Splits a dataset listing into memory-bounded batches, one per mapper.

use tracing::info;

use crate::error::{JobError, JobResult};
use crate::{Batch, StoredObject};

/// Share of a worker's memory that may be filled with input data. The rest
/// is left to the runtime and container.
pub const USABLE_MEMORY_FRACTION: f64 = 0.6;

/// Number of objects a single worker can hold given its memory budget.
///
/// Uses the average object size of the whole listing and never returns less
/// than 1, so a dataset of oversized objects still makes progress one object
/// per worker.
pub fn compute_batch_size(objects: &[StoredObject], worker_memory_bytes: u64) -> JobResult<usize> {
    if objects.is_empty() {
        return Err(JobError::EmptyDataset("listing".to_string()));
    }
    let total_size: f64 = objects.iter().map(|o| o.size as f64).sum();
    let avg_size = total_size / objects.len() as f64;
    info!(
        "Dataset size (bytes) {}, nKeys: {}, avg size (bytes): {}",
        total_size,
        objects.len(),
        avg_size
    );

    let usable = USABLE_MEMORY_FRACTION * worker_memory_bytes as f64;
    if avg_size <= 0.0 {
        // zero-byte objects: everything fits in one worker
        return Ok(objects.len());
    }
    let per_batch = (usable / avg_size).floor() as usize;
    Ok(per_batch.max(1))
}

/// Walks `objects` in order and seals a batch every `objects_per_batch` keys.
/// A trailing partial batch is kept as is.
pub fn create_batches(objects: &[StoredObject], objects_per_batch: usize) -> Vec<Batch> {
    let per_batch = objects_per_batch.max(1);
    let mut batches = Vec::with_capacity(objects.len().div_ceil(per_batch));
    let mut batch: Batch = Vec::with_capacity(per_batch);
    for object in objects {
        batch.push(object.key.clone());
        if batch.len() == per_batch {
            batches.push(std::mem::replace(&mut batch, Vec::with_capacity(per_batch)));
        }
    }
    if !batch.is_empty() {
        batches.push(batch);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::memory_bytes;

    fn objects(sizes: &[u64]) -> Vec<StoredObject> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, size)| StoredObject::new(format!("o{}", i + 1), *size))
            .collect()
    }

    #[test]
    fn empty_listing_is_an_error() {
        let err = compute_batch_size(&[], 1024).unwrap_err();
        assert!(matches!(err, JobError::EmptyDataset(_)));
    }

    #[test]
    fn batch_size_uses_sixty_percent_of_memory() {
        let objs = objects(&[1_000_000; 10]);
        let size = compute_batch_size(&objs, memory_bytes(1536)).unwrap();
        assert_eq!(size, 921);
        let batches = create_batches(&objs, size);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 10);
    }

    #[test]
    fn batch_size_is_at_least_one() {
        let objs = objects(&[50_000_000, 70_000_000]);
        assert_eq!(compute_batch_size(&objs, 10_000_000).unwrap(), 1);
        assert_eq!(compute_batch_size(&objs, 1).unwrap(), 1);
    }

    #[test]
    fn zero_byte_objects_fit_in_one_batch() {
        let objs = objects(&[0, 0, 0]);
        assert_eq!(compute_batch_size(&objs, 1).unwrap(), 3);
    }

    #[test]
    fn trailing_batch_is_kept() {
        let objs = objects(&[1; 5]);
        let batches = create_batches(&objs, 2);
        assert_eq!(
            batches,
            vec![
                vec!["o1".to_string(), "o2".to_string()],
                vec!["o3".to_string(), "o4".to_string()],
                vec!["o5".to_string()],
            ]
        );
    }

    #[test]
    fn batches_partition_the_listing() {
        let objs = objects(&[7; 23]);
        for per_batch in 1..=25 {
            let batches = create_batches(&objs, per_batch);
            let (last, full) = batches.split_last().unwrap();
            assert!(full.iter().all(|b| b.len() == per_batch));
            assert!(!last.is_empty() && last.len() <= per_batch);

            let flat: Vec<String> = batches.into_iter().flatten().collect();
            let keys: Vec<String> = objs.iter().map(|o| o.key.clone()).collect();
            assert_eq!(flat, keys);
        }
    }
}
