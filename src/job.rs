//! Runs the map phase of one job from listing to totals.
//!
//! `Partitioned -> Deployed -> Dispatching -> Completed | Failed`, strictly
//! forward. Nothing is retried.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::aggregate::JobTotals;
use crate::config::DriverConfig;
use crate::deploy::{DeploymentManager, MAPPER, REDUCER, REDUCER_COORDINATOR};
use crate::descriptor::{write_descriptor, write_job_data, JobData, JobDescriptor};
use crate::error::{JobError, JobResult};
use crate::invoke::{DispatchTarget, InvocationCoordinator};
use crate::lambda::ComputePlatform;
use crate::partition::{compute_batch_size, create_batches};
use crate::s3::ObjectStore;
use crate::utils::{epoch_seconds, function_name, memory_bytes};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum JobPhase {
    Partitioned,
    Deployed,
    Dispatching,
    Completed,
    Failed,
}

impl JobPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(self, next: JobPhase) -> bool {
        use JobPhase::*;
        matches!(
            (self, next),
            (Partitioned, Deployed)
                | (Deployed, Dispatching)
                | (Dispatching, Completed)
                | (Partitioned | Deployed | Dispatching, Failed)
        )
    }
}

/// Phase tracker of a running job.
#[derive(Debug)]
struct JobRun<'a> {
    job_id: &'a str,
    phase: JobPhase,
}

impl<'a> JobRun<'a> {
    fn new(job_id: &'a str) -> Self {
        info!("job {} -> {:?}", job_id, JobPhase::Partitioned);
        Self {
            job_id,
            phase: JobPhase::Partitioned,
        }
    }

    fn advance(&mut self, next: JobPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal transition {:?} -> {:?}",
            self.phase,
            next
        );
        info!("job {} -> {:?}", self.job_id, next);
        self.phase = next;
    }

    fn fail(&mut self, stage: &str, e: &JobError) {
        error!("{} of job {} failed: {}", stage, self.job_id, e);
        self.advance(JobPhase::Failed);
    }
}

/// What a successful job leaves behind.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: String,
    pub phase: JobPhase,
    pub total_objects: usize,
    pub objects_per_batch: usize,
    pub map_count: usize,
    pub mapper_arn: String,
    pub totals: JobTotals,
}

fn job_function_names(config: &DriverConfig, job_id: &str) -> Vec<String> {
    [MAPPER, REDUCER, REDUCER_COORDINATOR]
        .iter()
        .map(|kind| function_name(&config.lambda_prefix, kind, job_id))
        .collect()
}

/// Removes the job's functions when the configuration asks for it.
async fn cleanup(config: &DriverConfig, deployer: &DeploymentManager, job_id: &str) {
    if config.cleanup_on_failure {
        warn!("Removing functions of failed job {}", job_id);
        deployer.remove_all(&job_function_names(config, job_id)).await;
    }
}

/// Partitions the dataset, writes the job records, deploys the three
/// functions and runs every mapper.
pub async fn run_job(
    job_id: &str,
    config: &DriverConfig,
    store: &dyn ObjectStore,
    platform: Arc<dyn ComputePlatform>,
) -> JobResult<JobReport> {
    info!("Starting job {}", job_id);
    if job_id.trim().is_empty() {
        return Err(JobError::Config("job id must not be empty".into()));
    }

    let objects = store
        .list_objects(&config.bucket, &config.prefix, config.max_keys)
        .await?;
    if objects.is_empty() {
        return Err(JobError::EmptyDataset(format!(
            "s3://{}/{}",
            config.bucket, config.prefix
        )));
    }
    let objects_per_batch = compute_batch_size(&objects, memory_bytes(config.lambda_memory))?;
    let batches = create_batches(&objects, objects_per_batch);
    let map_count = batches.len();
    info!(
        "{} objects, {} per batch, {} mappers",
        objects.len(),
        objects_per_batch,
        map_count
    );
    let mut run = JobRun::new(job_id);

    let descriptor = JobDescriptor::new(
        job_id,
        &config.job_bucket,
        function_name(&config.lambda_prefix, REDUCER, job_id),
        &config.reducer.handler,
        map_count,
    );
    let job_data = JobData {
        map_count,
        total_objects: objects.len(),
        start_time: epoch_seconds(),
    };
    let records = async {
        let descriptor_json = write_descriptor(store, &descriptor).await?;
        write_job_data(store, &config.job_bucket, job_id, &job_data).await?;
        Ok::<_, JobError>(descriptor_json)
    };
    let descriptor_json = match records.await {
        Ok(json) => json,
        Err(e) => {
            run.fail("Writing the job records", &e);
            return Err(e);
        }
    };

    let deployer = DeploymentManager::new(platform.clone());
    let functions = match deployer.deploy_all(config, job_id, descriptor_json).await {
        Ok(functions) => functions,
        Err(e) => {
            run.fail("Deployment", &e);
            cleanup(config, &deployer, job_id).await;
            return Err(e);
        }
    };
    run.advance(JobPhase::Deployed);

    let mapper_arn = functions.mapper.target().to_string();
    let target = DispatchTarget {
        function: mapper_arn.clone(),
        source_bucket: config.bucket.clone(),
        job_bucket: config.job_bucket.clone(),
        job_id: job_id.to_string(),
    };
    let coordinator = InvocationCoordinator::new(platform, config.concurrent_lambdas);
    run.advance(JobPhase::Dispatching);

    match coordinator.dispatch(batches, &target).await {
        Ok(totals) => {
            run.advance(JobPhase::Completed);
            Ok(JobReport {
                job_id: job_id.to_string(),
                phase: run.phase,
                total_objects: objects.len(),
                objects_per_batch,
                map_count,
                mapper_arn,
                totals,
            })
        }
        Err(e) => {
            run.fail("Dispatch", &e);
            cleanup(config, &deployer, job_id).await;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_go_forward() {
        use JobPhase::*;
        assert!(Partitioned.can_advance_to(Deployed));
        assert!(Deployed.can_advance_to(Dispatching));
        assert!(Dispatching.can_advance_to(Completed));
        assert!(Dispatching.can_advance_to(Failed));
        assert!(Partitioned.can_advance_to(Failed));

        assert!(!Deployed.can_advance_to(Partitioned));
        assert!(!Partitioned.can_advance_to(Dispatching));
        assert!(!Completed.can_advance_to(Failed));
        assert!(!Failed.can_advance_to(Dispatching));
        assert!(Completed.is_terminal() && Failed.is_terminal());
    }

    #[test]
    fn early_failure_marks_the_run_failed() {
        let mut run = JobRun::new("j1");
        run.fail("Writing the job records", &JobError::storage("access denied"));
        assert_eq!(run.phase, JobPhase::Failed);
    }

    #[test]
    fn function_names_follow_prefix() {
        let config = DriverConfig::from_json(crate::config::tests::SAMPLE).unwrap();
        assert_eq!(
            job_function_names(&config, "j9"),
            vec!["BL-mapper-j9", "BL-reducer-j9", "BL-reducerCoordinator-j9"]
        );
    }
}
