//! Small helpers shared by the driver modules.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the unix epoch, with the fractional part kept.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// ARN of an S3 bucket, used as the source of a trigger permission.
#[inline]
pub fn bucket_arn(bucket: &str) -> String {
    format!("arn:aws:s3:::{}", bucket)
}

/// Name of a deployed function: `<prefix>-<kind>-<job id>`.
#[inline]
pub fn function_name(prefix: &str, kind: &str, job_id: &str) -> String {
    format!("{}-{}-{}", prefix, kind, job_id)
}

/// Worker memory budget in bytes from a size in MB (decimal, as the
/// platform bills it).
#[inline]
pub fn memory_bytes(memory_mb: u32) -> u64 {
    u64::from(memory_mb) * 1000 * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_helpers() {
        assert_eq!(bucket_arn("jobs"), "arn:aws:s3:::jobs");
        assert_eq!(function_name("BL", "mapper", "job42"), "BL-mapper-job42");
        assert_eq!(memory_bytes(1536), 1_536_000_000);
    }

    #[test]
    fn epoch_seconds_is_recent() {
        // 2020-01-01
        assert!(epoch_seconds() > 1_577_836_800.0);
    }
}
