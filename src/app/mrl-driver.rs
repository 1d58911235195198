use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use mrlambda::cmd::driver::Args;
use mrlambda::lambda::aws::LambdaPlatform;
use mrlambda::logging::init_logging;
use mrlambda::s3::minio::S3Store;
use mrlambda::*;
use tracing::{error, info};

async fn run(args: &Args) -> JobResult<JobReport> {
    let config = DriverConfig::load(&args.config)?;
    info!(
        "bucket {}, job bucket {}, region {}, memory {} MB, concurrency {}",
        config.bucket, config.job_bucket, config.region, config.lambda_memory, config.concurrent_lambdas
    );

    let store = S3Store::connect(&config.region, config.endpoint.as_deref()).await;
    let platform = Arc::new(LambdaPlatform::connect(&config.region).await);
    run_job(&args.job_id, &config, &store, platform).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    match run(&args).await {
        Ok(report) => {
            info!(
                "Job {} {:?}: {} mappers over {} objects (mapper {})",
                report.job_id, report.phase, report.map_count, report.total_objects, report.mapper_arn
            );
            println!("{}", report.totals);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
