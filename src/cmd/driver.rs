use std::path::PathBuf;

use clap::Parser;

use crate::config::CONFIG_FILE;

#[derive(Parser, Debug)]
#[command(version, about = "Runs the map phase of a serverless MapReduce job", long_about = None)]
pub struct Args {
    /// Identifier of the job; functions and job records are named after it
    pub job_id: String,
    /// Driver configuration file
    #[clap(short, long, default_value = CONFIG_FILE)]
    pub config: PathBuf,
    /// More output (-v debug, -vv trace)
    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
