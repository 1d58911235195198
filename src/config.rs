//! Driver configuration, read from `driverconfig.json`.
//!
//! ```json
//! {
//!   "bucket": "big-data-benchmark",
//!   "prefix": "pavlo/text/1node/uservisits/",
//!   "jobBucket": "my-job-bucket",
//!   "region": "us-east-1",
//!   "lambdaMemory": 1536,
//!   "concurrentLambdas": 100,
//!   "mapper": { "name": "mapper.py", "handler": "mapper.lambda_handler", "zip": "mapper.zip" },
//!   "reducer": { "name": "reducer.py", "handler": "reducer.lambda_handler", "zip": "reducer.zip" },
//!   "reducerCoordinator": { "name": "reducerCoordinator.py", "handler": "reducerCoordinator.lambda_handler", "zip": "reducerCoordinator.zip" }
//! }
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use crate::error::{JobError, JobResult};

/// Default file name looked up in the working directory.
pub const CONFIG_FILE: &str = "driverconfig.json";

/// Environment variable holding the execution role when the file has none.
pub const ROLE_ENV: &str = "serverless_mapreduce_role";

pub const DEFAULT_RUNTIME: &str = "python3.12";

/// One of the three functions deployed per job.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionConfig {
    /// Path of the worker source file
    pub name: String,
    /// Entry point, e.g. `mapper.lambda_handler`
    pub handler: String,
    /// Where the built archive is written
    pub zip: String,
    #[serde(default = "default_runtime")]
    pub runtime: String,
    /// Glob patterns of shared modules bundled next to the source
    #[serde(default)]
    pub shared_files: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    pub job_bucket: String,
    pub region: String,
    /// Worker memory in MB
    pub lambda_memory: u32,
    /// Upper bound on in-flight mapper invocations
    pub concurrent_lambdas: usize,
    pub mapper: FunctionConfig,
    pub reducer: FunctionConfig,
    pub reducer_coordinator: FunctionConfig,

    /// Worker timeout in seconds
    #[serde(default = "default_timeout")]
    pub lambda_timeout: u32,
    #[serde(default = "default_max_keys")]
    pub max_keys: usize,
    #[serde(default = "default_prefix")]
    pub lambda_prefix: String,
    #[serde(default)]
    pub role: Option<String>,
    /// S3-compatible endpoint (MinIO etc.)
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub cleanup_on_failure: bool,
}

fn default_runtime() -> String {
    DEFAULT_RUNTIME.to_string()
}

fn default_timeout() -> u32 {
    300
}

fn default_max_keys() -> usize {
    1000
}

fn default_prefix() -> String {
    "BL".to_string()
}

impl DriverConfig {
    /// Reads, parses and validates the file at `path`, filling `role` from
    /// the environment when the file does not set it.
    pub fn load(path: impl AsRef<Path>) -> JobResult<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());
        let raw = std::fs::read_to_string(path)
            .map_err(|e| JobError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::from_json(&raw)?;
        if config.role.is_none() {
            config.role = std::env::var(ROLE_ENV).ok().filter(|r| !r.is_empty());
        }
        config.validate()?;
        Ok(config)
    }

    /// Parses without touching the environment or validating.
    pub fn from_json(raw: &str) -> JobResult<Self> {
        serde_json::from_str(raw).map_err(JobError::config)
    }

    /// Default location: `./driverconfig.json`.
    pub fn default_path() -> PathBuf {
        PathBuf::from(CONFIG_FILE)
    }

    pub fn validate(&self) -> JobResult<()> {
        let require = |value: &str, field: &str| {
            if value.trim().is_empty() {
                Err(JobError::Config(format!("`{}` must not be empty", field)))
            } else {
                Ok(())
            }
        };
        require(&self.bucket, "bucket")?;
        require(&self.job_bucket, "jobBucket")?;
        require(&self.region, "region")?;
        require(&self.lambda_prefix, "lambdaPrefix")?;

        if !(128..=10240).contains(&self.lambda_memory) {
            return Err(JobError::Config(format!(
                "`lambdaMemory` must be within 128..=10240 MB, got {}",
                self.lambda_memory
            )));
        }
        if self.concurrent_lambdas == 0 {
            return Err(JobError::Config("`concurrentLambdas` must be at least 1".into()));
        }
        if !(1..=900).contains(&self.lambda_timeout) {
            return Err(JobError::Config(format!(
                "`lambdaTimeout` must be within 1..=900 s, got {}",
                self.lambda_timeout
            )));
        }
        if self.max_keys == 0 {
            return Err(JobError::Config("`maxKeys` must be at least 1".into()));
        }
        match &self.role {
            Some(role) if !role.trim().is_empty() => {}
            _ => {
                return Err(JobError::Config(format!(
                    "no execution role: set `role` or the {} environment variable",
                    ROLE_ENV
                )))
            }
        }

        for (field, function) in [
            ("mapper", &self.mapper),
            ("reducer", &self.reducer),
            ("reducerCoordinator", &self.reducer_coordinator),
        ] {
            require(&function.name, &format!("{}.name", field))?;
            require(&function.handler, &format!("{}.handler", field))?;
            require(&function.zip, &format!("{}.zip", field))?;
            require(&function.runtime, &format!("{}.runtime", field))?;
        }
        Ok(())
    }

    /// Execution role, valid once `validate` succeeded.
    pub fn role(&self) -> &str {
        self.role.as_deref().unwrap_or_default()
    }
}
