//! Public API types for the `lavastorm` workload driver.

use std::time::Duration;

use chrono::NaiveTime;
use lavastorm_sched::Scheduler;

/// One interval of local time-of-day during which the simulated user is
/// at their desk. Closed on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfficeHours {
    /// Start of the interval.
    pub start: NaiveTime,
    /// End of the interval.
    pub end: NaiveTime,
}

impl OfficeHours {
    /// Build an interval.
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    /// Whether `time` lies inside the interval.
    pub fn contains(&self, time: NaiveTime) -> bool {
        self.start <= time && time <= self.end
    }
}

/// Statistical shape of the generated workload, shared by every profile.
///
/// All ranges are inclusive integer bounds; a degenerate range (min equal
/// to max) pins the value.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Percentage of jobs that fail of their own accord (0 to 100).
    pub failure_rate: u8,
    /// Shortest runtime of a successful job, seconds.
    pub min_runtime: u64,
    /// Longest runtime of a successful job, seconds.
    pub max_runtime: u64,
    /// Shortest simulated result-observation delay, seconds.
    pub min_observation_time: u64,
    /// Longest simulated result-observation delay, seconds.
    pub max_observation_time: u64,
    /// Smallest slot request per job.
    pub min_num_processors: u32,
    /// Largest slot request per job.
    pub max_num_processors: u32,
    /// Smallest task count per job; values above 1 submit array jobs.
    pub min_tasks_per_job: u32,
    /// Largest task count per job.
    pub max_tasks_per_job: u32,
    /// Intervals during which new jobs may be created; empty means always.
    pub office_hours: Vec<OfficeHours>,
    /// Accounting projects to draw from; empty means backend default.
    pub projects: Vec<String>,
    /// Queues to draw from; empty means backend default.
    pub queues: Vec<String>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            failure_rate: 1,
            min_runtime: 600,
            max_runtime: 600,
            min_observation_time: 120,
            max_observation_time: 120,
            min_num_processors: 1,
            max_num_processors: 1,
            min_tasks_per_job: 1,
            max_tasks_per_job: 1,
            office_hours: Vec::new(),
            projects: Vec::new(),
            queues: Vec::new(),
        }
    }
}

impl WorkloadConfig {
    /// Check range ordering and bounds; the driver refuses to start on any
    /// violation.
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_rate > 100 {
            return Err(format!("failure_rate must be 0-100, got {}", self.failure_rate));
        }
        let ranges: [(&str, u64, u64); 4] = [
            ("runtime", self.min_runtime, self.max_runtime),
            (
                "observation_time",
                self.min_observation_time,
                self.max_observation_time,
            ),
            (
                "num_processors",
                self.min_num_processors.into(),
                self.max_num_processors.into(),
            ),
            (
                "tasks_per_job",
                self.min_tasks_per_job.into(),
                self.max_tasks_per_job.into(),
            ),
        ];
        for (name, min, max) in ranges {
            if min > max {
                return Err(format!("min_{name} ({min}) exceeds max_{name} ({max})"));
            }
        }
        if self.min_num_processors == 0 {
            return Err("min_num_processors must be at least 1".to_string());
        }
        if self.min_tasks_per_job == 0 {
            return Err("min_tasks_per_job must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Demand-shaping strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileConfig {
    /// Keep a fixed number of jobs active at all times.
    Steady {
        /// Target number of concurrently active jobs.
        base_load: u64,
    },
    /// Submit a burst of jobs, wait for the cluster to drain, repeat.
    Batch {
        /// Smallest burst size.
        min_jobs_per_batch: u64,
        /// Largest burst size.
        max_jobs_per_batch: u64,
        /// Number of bursts before stopping; 0 means unbounded.
        iterations: u64,
    },
}

/// Configuration for the driver loop.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Interval between reconciliation ticks.
    pub tick: Duration,
    /// Workload shape.
    pub workload: WorkloadConfig,
    /// Demand profile.
    pub profile: ProfileConfig,
}

impl DriverConfig {
    /// Default tick interval; treated as a ceiling, drift is not
    /// compensated.
    pub const DEFAULT_TICK: Duration = Duration::from_secs(10);
}

/// Final counter snapshot returned when the driver stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Jobs handed to the submit queue over the whole run.
    pub total_submitted_jobs: u64,
    /// Tasks those jobs expand to.
    pub total_task_count: u64,
    /// Tasks that finished with exit status 0.
    pub completed_task_count: u64,
    /// Tasks that finished unsuccessfully (including lost tasks).
    pub failed_task_count: u64,
    /// Tasks the backend reported as killed.
    pub killed_task_count: u64,
    /// Submissions the backend rejected.
    pub rejected_submission_count: u64,
    /// Jobs still active (queued, pending, running, or suspended) at the
    /// end of the run.
    pub total_active_jobs: u64,
    /// Jobs no longer active at the end of the run.
    pub total_finished_jobs: u64,
}

/// Handle to a running driver instance.
pub struct DriverHandle {
    pub(crate) inner: std::sync::Arc<crate::engine::DriverInner>,
    pub(crate) join: tokio::task::JoinHandle<anyhow::Result<RunSummary>>,
}

/// Cloneable remote for requesting a driver stop from another task (e.g.
/// a signal handler).
#[derive(Clone)]
pub struct DriverStopper {
    inner: std::sync::Arc<crate::engine::DriverInner>,
}

impl DriverStopper {
    /// Request a graceful stop.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }
}

impl DriverHandle {
    /// Request a graceful stop: finish the current tick, kill active
    /// jobs, return.
    pub fn request_stop(&self) {
        self.inner.request_stop();
    }

    /// Stop remote that can outlive this handle.
    pub fn stopper(&self) -> DriverStopper {
        DriverStopper { inner: self.inner.clone() }
    }

    /// Wait for the driver to stop, returning the final counters.
    pub async fn wait(self) -> anyhow::Result<RunSummary> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("driver task join error: {err}")),
        }
    }
}

/// Start a driver instance against `scheduler`.
pub fn start_driver(config: DriverConfig, scheduler: Scheduler) -> DriverHandle {
    crate::engine::start_driver(config, scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hms(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).expect("valid time")
    }

    #[test]
    fn office_hours_are_closed_intervals() {
        let hours = OfficeHours::new(hms(9, 0, 0), hms(17, 0, 0));
        assert!(hours.contains(hms(9, 0, 0)));
        assert!(hours.contains(hms(17, 0, 0)));
        assert!(hours.contains(hms(12, 30, 0)));
        assert!(!hours.contains(hms(8, 59, 59)));
        assert!(!hours.contains(hms(17, 0, 1)));
    }

    #[test]
    fn workload_validation_rejects_inverted_ranges() {
        let mut cfg = WorkloadConfig::default();
        assert!(cfg.validate().is_ok());

        cfg.min_runtime = 700;
        let err = cfg.validate().expect_err("inverted range");
        assert!(err.contains("runtime"), "{err}");

        cfg = WorkloadConfig { min_tasks_per_job: 0, max_tasks_per_job: 0, ..Default::default() };
        assert!(cfg.validate().is_err());
    }
}
