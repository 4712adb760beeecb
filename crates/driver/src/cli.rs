use chrono::NaiveTime;
use clap::{Parser, Subcommand, ValueEnum};

use lavastorm_engine::{OfficeHours, ProfileConfig, WorkloadConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SchedulerKind {
    /// Sun Grid Engine via qsub/qstat/qacct/qdel.
    #[value(name = "sge_cli")]
    SgeCli,
    /// OpenLava via bsub/bjobs/bhist/bkill.
    #[value(name = "openlava_cli")]
    OpenlavaCli,
    /// OpenLava via the openlava-web REST bridge (cluster API flavour).
    #[value(name = "openlava_cluster_api")]
    OpenlavaClusterApi,
    /// OpenLava via the openlava-web REST bridge.
    #[value(name = "openlava_web")]
    OpenlavaWeb,
    /// OpenLava via the native C API (not available in this build).
    #[value(name = "openlava_c_api")]
    OpenlavaCApi,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "lavastorm", version, about = "Submits synthetic load to a batch scheduler")]
pub struct Cli {
    /// The percent of submitted jobs that will fail of their own accord
    /// at a random interval.
    #[arg(long = "failure_rate", default_value_t = 1,
          value_parser = clap::value_parser!(u8).range(0..=100))]
    pub failure_rate: u8,

    /// A list of start and end times in the format HH:MM:SS-HH:MM:SS
    /// during which jobs are created.
    #[arg(long = "office_hours", default_value = "00:00:00-23:59:59")]
    pub office_hours: String,

    /// The minimum amount of time a completed job should run for, in
    /// seconds.
    #[arg(long = "min_runtime", default_value_t = 600)]
    pub min_runtime: u64,

    /// The maximum amount of time a completed job should run for, in
    /// seconds.
    #[arg(long = "max_runtime", default_value_t = 600)]
    pub max_runtime: u64,

    /// The minimum amount of time a job should be 'observed' before a new
    /// job can be submitted.
    #[arg(long = "min_observation_time", default_value_t = 120)]
    pub min_observation_time: u64,

    /// The maximum amount of time a job should be 'observed' before a new
    /// job can be submitted.
    #[arg(long = "max_observation_time", default_value_t = 120)]
    pub max_observation_time: u64,

    /// The minimum number of processors each job should use.
    #[arg(long = "min_num_processors", default_value_t = 1)]
    pub min_num_processors: u32,

    /// The maximum number of processors each job should use.
    #[arg(long = "max_num_processors", default_value_t = 1)]
    pub max_num_processors: u32,

    /// The minimum number of tasks per job; values above 1 submit array
    /// jobs.
    #[arg(long = "min_tasks_per_job", default_value_t = 1)]
    pub min_tasks_per_job: u32,

    /// The maximum number of tasks per job.
    #[arg(long = "max_tasks_per_job", default_value_t = 1)]
    pub max_tasks_per_job: u32,

    /// Queue to submit to; if specified multiple times, selects one at
    /// random for each job.
    #[arg(long = "queue")]
    pub queues: Vec<String>,

    /// Project to submit to; if specified multiple times, selects one at
    /// random for each job.
    #[arg(long = "project")]
    pub projects: Vec<String>,

    /// Seconds between reconciliation ticks.
    #[arg(long = "delay_time", default_value_t = 10)]
    pub delay_time: u64,

    /// Treat UNKWN/ZOMBI jobs as failed instead of still running.
    #[arg(long = "treat_unknown_as_failed", default_value_t = false)]
    pub treat_unknown_as_failed: bool,

    /// Scheduler backend to drive.
    #[arg(long = "scheduler", value_enum, default_value_t = SchedulerKind::OpenlavaCli)]
    pub scheduler: SchedulerKind,

    /// Submission command for the OpenLava CLI backend.
    #[arg(long = "bsub_command", default_value = "bsub")]
    pub bsub_command: String,

    /// State query command for the OpenLava CLI backend.
    #[arg(long = "bjobs_command", default_value = "bjobs")]
    pub bjobs_command: String,

    /// Accounting query command for the OpenLava CLI backend.
    #[arg(long = "bhist_command", default_value = "bhist")]
    pub bhist_command: String,

    /// Kill command for the OpenLava CLI backend.
    #[arg(long = "bkill_command", default_value = "bkill")]
    pub bkill_command: String,

    /// Submission command for the SGE CLI backend.
    #[arg(long = "qsub_command", default_value = "qsub")]
    pub qsub_command: String,

    /// State query command for the SGE CLI backend.
    #[arg(long = "qstat_command", default_value = "qstat")]
    pub qstat_command: String,

    /// Accounting query command for the SGE CLI backend.
    #[arg(long = "qacct_command", default_value = "qacct")]
    pub qacct_command: String,

    /// Kill command for the SGE CLI backend.
    #[arg(long = "qdel_command", default_value = "qdel")]
    pub qdel_command: String,

    /// Parallel environment for multi-processor jobs on SGE (qsub -pe).
    #[arg(long = "qsub_pe_type")]
    pub qsub_pe_type: Option<String>,

    /// Base URL of the openlava-web bridge.
    #[arg(long = "url")]
    pub url: Option<String>,

    /// Login user for the openlava-web bridge.
    #[arg(long = "username")]
    pub username: Option<String>,

    /// Login password for the openlava-web bridge.
    #[arg(long = "password")]
    pub password: Option<String>,

    #[command(subcommand)]
    pub profile: ProfileCommand,
}

#[derive(Debug, Clone, Subcommand)]
pub enum ProfileCommand {
    /// Maintains a steady number of active jobs.
    #[command(name = "baseload")]
    BaseLoad {
        /// The number of concurrent jobs that should be active at any
        /// given time.
        #[arg(long = "base_load", default_value_t = 5)]
        base_load: u64,
    },
    /// Submits a batch of jobs, waits for it to drain, repeats.
    #[command(name = "submitbatch")]
    SubmitBatch {
        /// Smallest batch size.
        #[arg(long = "min_num_jobs_per_batch", default_value_t = 1)]
        min_num_jobs_per_batch: u64,
        /// Largest batch size.
        #[arg(long = "max_num_jobs_per_batch", default_value_t = 10)]
        max_num_jobs_per_batch: u64,
        /// Number of batches before exiting; 0 keeps going forever.
        #[arg(long = "iterations", default_value_t = 0)]
        iterations: u64,
    },
}

impl Cli {
    /// Workload shape from the global flags. Range and grammar violations
    /// are configuration errors.
    pub fn workload(&self) -> Result<WorkloadConfig, String> {
        let workload = WorkloadConfig {
            failure_rate: self.failure_rate,
            min_runtime: self.min_runtime,
            max_runtime: self.max_runtime,
            min_observation_time: self.min_observation_time,
            max_observation_time: self.max_observation_time,
            min_num_processors: self.min_num_processors,
            max_num_processors: self.max_num_processors,
            min_tasks_per_job: self.min_tasks_per_job,
            max_tasks_per_job: self.max_tasks_per_job,
            office_hours: parse_office_hours(&self.office_hours)?,
            projects: self.projects.clone(),
            queues: self.queues.clone(),
        };
        workload.validate()?;
        Ok(workload)
    }

    /// Demand profile from the subcommand.
    pub fn profile_config(&self) -> Result<ProfileConfig, String> {
        match self.profile {
            ProfileCommand::BaseLoad { base_load } => Ok(ProfileConfig::Steady { base_load }),
            ProfileCommand::SubmitBatch {
                min_num_jobs_per_batch,
                max_num_jobs_per_batch,
                iterations,
            } => {
                if min_num_jobs_per_batch > max_num_jobs_per_batch {
                    return Err(format!(
                        "min_num_jobs_per_batch ({min_num_jobs_per_batch}) exceeds \
                         max_num_jobs_per_batch ({max_num_jobs_per_batch})"
                    ));
                }
                if min_num_jobs_per_batch == 0 {
                    return Err("min_num_jobs_per_batch must be at least 1".to_string());
                }
                Ok(ProfileConfig::Batch {
                    min_jobs_per_batch: min_num_jobs_per_batch,
                    max_jobs_per_batch: max_num_jobs_per_batch,
                    iterations,
                })
            }
        }
    }
}

fn parse_time(text: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(text, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(text, "%H:%M"))
        .map_err(|_| format!("invalid time {text:?}"))
}

/// `HH:MM:SS-HH:MM:SS[,HH:MM:SS-HH:MM:SS...]`; an empty string means
/// always active.
pub fn parse_office_hours(text: &str) -> Result<Vec<OfficeHours>, String> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let mut hours = Vec::new();
    for range in text.split(',') {
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| format!("invalid time range supplied: {range:?}"))?;
        let start = parse_time(start.trim())?;
        let end = parse_time(end.trim())?;
        if end < start {
            return Err(format!("invalid time range supplied: {range:?} ends before it starts"));
        }
        hours.push(OfficeHours::new(start, end));
    }
    Ok(hours)
}
