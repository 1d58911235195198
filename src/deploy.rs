//! Idempotent deployment of the job's functions.
//!
//! A job id can be started again after a failure. Creating a function that
//! already exists, or granting a statement that is already granted, must
//! therefore converge instead of failing.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{info, warn};

use crate::config::{DriverConfig, FunctionConfig};
use crate::error::{JobError, JobResult};
use crate::lambda::{ComputePlatform, FunctionSpec, TriggerGrant, OBJECT_STORE_PRINCIPAL};
use crate::package::package_to_file;
use crate::utils::{bucket_arn, function_name};

pub const MAPPER: &str = "mapper";
pub const REDUCER: &str = "reducer";
pub const REDUCER_COORDINATOR: &str = "reducerCoordinator";

/// A function to deploy: its configuration, its code and, once deployed,
/// the ARN the platform assigned to it.
#[derive(Debug, Clone)]
pub struct WorkerFunction {
    pub spec: FunctionSpec,
    pub code: Bytes,
    pub arn: Option<String>,
}

impl WorkerFunction {
    pub fn new(spec: FunctionSpec, code: Bytes) -> Self {
        Self {
            spec,
            code,
            arn: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// ARN if deployed, name otherwise. The platform accepts both.
    pub fn target(&self) -> &str {
        self.arn.as_deref().unwrap_or(&self.spec.name)
    }
}

/// The three functions of one job, all deployed.
#[derive(Debug, Clone)]
pub struct JobFunctions {
    pub mapper: WorkerFunction,
    pub reducer: WorkerFunction,
    pub reducer_coordinator: WorkerFunction,
}

impl JobFunctions {
    pub fn names(&self) -> [&str; 3] {
        [
            self.mapper.name(),
            self.reducer.name(),
            self.reducer_coordinator.name(),
        ]
    }
}

/// Deterministic statement id so a rerun re-grants the same statement.
pub fn trigger_statement_id(prefix: &str, job_id: &str) -> String {
    format!("{}-{}-jobbucket-trigger", prefix, job_id)
}

pub fn function_spec(
    config: &DriverConfig,
    kind: &str,
    function: &FunctionConfig,
    job_id: &str,
) -> FunctionSpec {
    FunctionSpec {
        name: function_name(&config.lambda_prefix, kind, job_id),
        handler: function.handler.clone(),
        runtime: function.runtime.clone(),
        memory_mb: config.lambda_memory,
        timeout_secs: config.lambda_timeout,
        role: config.role().to_string(),
    }
}

#[derive(Clone)]
pub struct DeploymentManager {
    platform: Arc<dyn ComputePlatform>,
}

impl DeploymentManager {
    pub fn new(platform: Arc<dyn ComputePlatform>) -> Self {
        Self { platform }
    }

    /// Creates the function, or updates configuration then code in place
    /// when it already exists. Returns once the function is settled and
    /// invocable, with its ARN set.
    pub async fn create_or_update(&self, mut function: WorkerFunction) -> JobResult<WorkerFunction> {
        let name = function.spec.name.clone();
        let arn = match self
            .platform
            .create_function(&function.spec, function.code.clone())
            .await
        {
            Ok(arn) => {
                info!("Created function {}", name);
                self.platform
                    .wait_until_active(&name)
                    .await
                    .map_err(|e| JobError::deployment(&name, e))?;
                arn
            }
            Err(e) if e.is_conflict() => {
                info!("Function {} exists, updating in place", name);
                // one update at a time, each must settle before the next
                self.platform
                    .update_function_configuration(&function.spec)
                    .await
                    .map_err(|e| JobError::deployment(&name, e))?;
                self.platform
                    .wait_until_updated(&name)
                    .await
                    .map_err(|e| JobError::deployment(&name, e))?;
                let arn = self
                    .platform
                    .update_function_code(&name, function.code.clone())
                    .await
                    .map_err(|e| JobError::deployment(&name, e))?;
                self.platform
                    .wait_until_updated(&name)
                    .await
                    .map_err(|e| JobError::deployment(&name, e))?;
                arn
            }
            Err(e) => return Err(JobError::deployment(&name, e)),
        };
        if arn.is_empty() {
            return Err(JobError::deployment(&name, "platform returned no ARN"));
        }
        function.arn = Some(arn);
        Ok(function)
    }

    /// Lets the object store invoke `function` on events from `source_arn`.
    /// An already granted statement counts as success.
    pub async fn authorize_trigger(
        &self,
        function: &WorkerFunction,
        source_arn: &str,
        statement_id: &str,
    ) -> JobResult<()> {
        let grant = TriggerGrant {
            principal: OBJECT_STORE_PRINCIPAL.to_string(),
            source_arn: source_arn.to_string(),
            statement_id: statement_id.to_string(),
        };
        match self.platform.add_permission(function.target(), &grant).await {
            Ok(()) => {
                info!("Granted {} on {} to {}", statement_id, function.name(), source_arn);
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                info!("Statement {} already exists on {}", statement_id, function.name());
                Ok(())
            }
            Err(e) => Err(JobError::permission(function.name(), e)),
        }
    }

    /// One packaging + deployment pipeline.
    async fn deploy_one(
        &self,
        config: &DriverConfig,
        kind: &str,
        function: &FunctionConfig,
        job_id: &str,
        descriptor: Bytes,
    ) -> JobResult<WorkerFunction> {
        let code = package_to_file(function.clone(), descriptor).await?;
        let spec = function_spec(config, kind, function, job_id);
        let deployed = self.create_or_update(WorkerFunction::new(spec, code)).await?;
        info!(
            "{} function ARN: {}",
            kind,
            deployed.arn.as_deref().unwrap_or_default()
        );
        Ok(deployed)
    }

    /// Packages and deploys mapper, reducer and reduce coordinator
    /// concurrently, then authorizes the job bucket to trigger the reduce
    /// coordinator.
    pub async fn deploy_all(
        &self,
        config: &DriverConfig,
        job_id: &str,
        descriptor: Bytes,
    ) -> JobResult<JobFunctions> {
        let (mapper, reducer, reducer_coordinator) = tokio::try_join!(
            self.deploy_one(config, MAPPER, &config.mapper, job_id, descriptor.clone()),
            self.deploy_one(config, REDUCER, &config.reducer, job_id, descriptor.clone()),
            self.deploy_one(
                config,
                REDUCER_COORDINATOR,
                &config.reducer_coordinator,
                job_id,
                descriptor
            ),
        )?;

        self.authorize_trigger(
            &reducer_coordinator,
            &bucket_arn(&config.job_bucket),
            &trigger_statement_id(&config.lambda_prefix, job_id),
        )
        .await?;

        Ok(JobFunctions {
            mapper,
            reducer,
            reducer_coordinator,
        })
    }

    /// Deletes the named functions. Failures are logged, not returned.
    pub async fn remove_all(&self, names: &[String]) {
        for name in names {
            match self.platform.delete_function(name).await {
                Ok(()) => info!("Deleted function {}", name),
                Err(e) => warn!("Could not delete function {}: {}", name, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE;
    use crate::lambda::memory::InMemoryPlatform;
    use std::path::Path;

    fn spec(name: &str) -> FunctionSpec {
        FunctionSpec {
            name: name.to_string(),
            handler: "mapper.handler".to_string(),
            runtime: "python3.12".to_string(),
            memory_mb: 1536,
            timeout_secs: 300,
            role: "role".to_string(),
        }
    }

    fn manager() -> (InMemoryPlatform, DeploymentManager) {
        let platform = InMemoryPlatform::new();
        let manager = DeploymentManager::new(Arc::new(platform.clone()));
        (platform, manager)
    }

    fn config_in(dir: &Path) -> DriverConfig {
        let mut config = DriverConfig::from_json(SAMPLE).unwrap();
        for (file, function) in [
            ("mapper.py", &mut config.mapper),
            ("reducer.py", &mut config.reducer),
            ("rc.py", &mut config.reducer_coordinator),
        ] {
            let source = dir.join(file);
            std::fs::write(&source, format!("# {}\n", file)).unwrap();
            function.name = source.to_string_lossy().into_owned();
            function.zip = dir.join(format!("{}.zip", file)).to_string_lossy().into_owned();
        }
        config
    }

    #[tokio::test]
    async fn create_or_update_is_idempotent() {
        let (platform, manager) = manager();
        let function = WorkerFunction::new(spec("BL-mapper-j"), Bytes::from_static(b"v1"));

        let first = manager.create_or_update(function.clone()).await.unwrap();
        let second = manager.create_or_update(function).await.unwrap();

        assert_eq!(first.arn, second.arn);
        assert_eq!(platform.creates(), 1);
        assert_eq!(platform.function_count(), 1);
        assert_eq!(platform.code_updates(), 1);
        assert_eq!(platform.config_updates(), 1);
    }

    #[tokio::test]
    async fn update_replaces_code_and_configuration() {
        let (platform, manager) = manager();
        manager
            .create_or_update(WorkerFunction::new(spec("f"), Bytes::from_static(b"v1")))
            .await
            .unwrap();
        let mut changed = spec("f");
        changed.timeout_secs = 60;
        manager
            .create_or_update(WorkerFunction::new(changed, Bytes::from_static(b"v2")))
            .await
            .unwrap();

        let deployed = platform.function("f").unwrap();
        assert_eq!(deployed.code, Bytes::from_static(b"v2"));
        assert_eq!(deployed.spec.timeout_secs, 60);
    }

    #[tokio::test]
    async fn deployed_function_is_settled_and_invocable() {
        use crate::lambda::memory::FunctionState;

        let (platform, manager) = manager();
        let created = manager
            .create_or_update(WorkerFunction::new(spec("f"), Bytes::from_static(b"v1")))
            .await
            .unwrap();
        assert_eq!(platform.function("f").unwrap().state, FunctionState::Active);
        assert!(platform.invoke(created.target(), Bytes::new()).await.is_ok());

        // a rerun updates configuration and code back to back
        manager
            .create_or_update(WorkerFunction::new(spec("f"), Bytes::from_static(b"v2")))
            .await
            .unwrap();
        assert_eq!(platform.function("f").unwrap().state, FunctionState::Active);
        assert_eq!(platform.config_updates(), 1);
        assert_eq!(platform.code_updates(), 1);
    }

    #[tokio::test]
    async fn non_conflict_failure_is_fatal() {
        let (platform, manager) = manager();
        platform.fail_create_of("f");
        let err = manager
            .create_or_update(WorkerFunction::new(spec("f"), Bytes::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Deployment { .. }));
    }

    #[tokio::test]
    async fn authorize_trigger_twice_succeeds() {
        let (platform, manager) = manager();
        let f = manager
            .create_or_update(WorkerFunction::new(spec("rc"), Bytes::new()))
            .await
            .unwrap();

        manager.authorize_trigger(&f, "arn:aws:s3:::jobs", "stmt-1").await.unwrap();
        manager.authorize_trigger(&f, "arn:aws:s3:::jobs", "stmt-1").await.unwrap();
        assert_eq!(platform.statements("rc").len(), 1);
    }

    #[tokio::test]
    async fn authorize_trigger_failure_is_fatal() {
        let (platform, manager) = manager();
        let f = manager
            .create_or_update(WorkerFunction::new(spec("rc"), Bytes::new()))
            .await
            .unwrap();
        platform.fail_permission_on("rc");
        let err = manager
            .authorize_trigger(&f, "arn:aws:s3:::jobs", "stmt-1")
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Permission { .. }));
    }

    #[tokio::test]
    async fn deploy_all_deploys_three_functions_and_the_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let (platform, manager) = manager();

        let functions = manager
            .deploy_all(&config, "job7", Bytes::from_static(b"{}"))
            .await
            .unwrap();

        assert_eq!(
            functions.names(),
            ["BL-mapper-job7", "BL-reducer-job7", "BL-reducerCoordinator-job7"]
        );
        assert_eq!(platform.function_count(), 3);
        assert_eq!(platform.function("BL-reducerCoordinator-job7").unwrap().spec.runtime, "python3.11");

        let statements = platform.statements("BL-reducerCoordinator-job7");
        assert_eq!(statements.len(), 1);
        assert_eq!(statements[0].source_arn, "arn:aws:s3:::job-bucket");
        assert_eq!(statements[0].principal, OBJECT_STORE_PRINCIPAL);
        assert_eq!(statements[0].statement_id, "BL-job7-jobbucket-trigger");

        // rerun converges
        manager
            .deploy_all(&config, "job7", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        assert_eq!(platform.creates(), 3);
        assert_eq!(platform.function_count(), 3);
    }

    #[tokio::test]
    async fn remove_all_deletes_and_tolerates_missing() {
        let (platform, manager) = manager();
        manager
            .create_or_update(WorkerFunction::new(spec("a"), Bytes::new()))
            .await
            .unwrap();
        manager.remove_all(&["a".to_string(), "b".to_string()]).await;
        assert_eq!(platform.deleted(), vec!["a".to_string()]);
        assert_eq!(platform.function_count(), 0);
    }
}
