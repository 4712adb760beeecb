use std::collections::BTreeMap;

use chrono::{DateTime, NaiveTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use lavastorm_sched::{JobHandle, JobSpec, JobState, Scheduler};

use crate::api::{ProfileConfig, RunSummary, WorkloadConfig};
use crate::queue::{PendingSubmission, SubmitQueue};

/// What `create_jobs` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CreateJobs {
    Continue,
    /// The batch profile hit its iteration cap; the run is over.
    IterationLimitReached,
}

#[derive(Debug)]
enum Demand {
    Steady {
        base_load: u64,
    },
    Batch {
        min_jobs_per_batch: u64,
        max_jobs_per_batch: u64,
        iterations: u64,
        batches_submitted: u64,
    },
}

/// Counters and collections owned by the profile for the process
/// lifetime. The task counters are monotonic; the pending/running/
/// suspended counts are recomputed every reconciliation.
#[derive(Debug, Default)]
pub(crate) struct ProfileState {
    pub(crate) submit_queue: SubmitQueue,
    pub(crate) active_handles: Vec<JobHandle>,
    pub(crate) total_submitted_jobs: u64,
    pub(crate) total_task_count: u64,
    pub(crate) completed_task_count: u64,
    pub(crate) failed_task_count: u64,
    pub(crate) killed_task_count: u64,
    pub(crate) rejected_submission_count: u64,
    pub(crate) pending_task_count: u64,
    pub(crate) running_task_count: u64,
    pub(crate) suspended_task_count: u64,
}

impl ProfileState {
    /// Jobs that still occupy the driver: queued submissions plus
    /// distinct job ids among tracked handles.
    pub(crate) fn total_active_jobs(&self) -> u64 {
        let mut ids: Vec<u64> = self.active_handles.iter().map(|h| h.job_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len() as u64 + self.submit_queue.len() as u64
    }

    pub(crate) fn total_finished_jobs(&self) -> u64 {
        self.total_submitted_jobs - self.total_active_jobs()
    }

    pub(crate) fn summary(&self) -> RunSummary {
        RunSummary {
            total_submitted_jobs: self.total_submitted_jobs,
            total_task_count: self.total_task_count,
            completed_task_count: self.completed_task_count,
            failed_task_count: self.failed_task_count,
            killed_task_count: self.killed_task_count,
            rejected_submission_count: self.rejected_submission_count,
            total_active_jobs: self.total_active_jobs(),
            total_finished_jobs: self.total_finished_jobs(),
        }
    }
}

/// A demand-shaping profile bound to its state and sampler.
#[derive(Debug)]
pub(crate) struct Profile {
    workload: WorkloadConfig,
    demand: Demand,
    pub(crate) state: ProfileState,
    rng: StdRng,
}

impl Profile {
    pub(crate) fn new(workload: WorkloadConfig, profile: ProfileConfig) -> Self {
        Self::with_rng(workload, profile, StdRng::from_entropy())
    }

    pub(crate) fn with_rng(
        workload: WorkloadConfig,
        profile: ProfileConfig,
        rng: StdRng,
    ) -> Self {
        let demand = match profile {
            ProfileConfig::Steady { base_load } => Demand::Steady { base_load },
            ProfileConfig::Batch { min_jobs_per_batch, max_jobs_per_batch, iterations } => {
                Demand::Batch {
                    min_jobs_per_batch,
                    max_jobs_per_batch,
                    iterations,
                    batches_submitted: 0,
                }
            }
        };
        Self { workload, demand, state: ProfileState::default(), rng }
    }

    /// Whether the simulated user is at their desk at `now`.
    pub(crate) fn is_active(&self, now: NaiveTime) -> bool {
        self.workload.office_hours.is_empty()
            || self.workload.office_hours.iter().any(|hours| hours.contains(now))
    }

    fn runtime_seconds(&mut self) -> u64 {
        self.rng.gen_range(self.workload.min_runtime..=self.workload.max_runtime)
    }

    fn num_processors(&mut self) -> u32 {
        self.rng
            .gen_range(self.workload.min_num_processors..=self.workload.max_num_processors)
    }

    fn num_tasks(&mut self) -> u32 {
        self.rng.gen_range(self.workload.min_tasks_per_job..=self.workload.max_tasks_per_job)
    }

    fn observation_time(&mut self) -> u64 {
        self.rng
            .gen_range(self.workload.min_observation_time..=self.workload.max_observation_time)
    }

    fn choose(&mut self, list: &[String]) -> Option<String> {
        if list.is_empty() {
            return None;
        }
        Some(list[self.rng.gen_range(0..list.len())].clone())
    }

    /// Command string the scheduler will run on the compute host. Doomed
    /// jobs exit 1 somewhere inside their sampled runtime.
    pub(crate) fn create_job_command(&mut self) -> String {
        let mut run_time = self.runtime_seconds();
        let mut exit_status = 0;
        if self.workload.failure_rate >= self.rng.gen_range(1..=100u8) {
            run_time = self.rng.gen_range(0..=run_time);
            exit_status = 1;
        }
        format!("sleep {run_time}; exit {exit_status}")
    }

    /// When the next submission should be released: now plus the sampled
    /// observation delay.
    pub(crate) fn get_next_start_time(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + chrono::Duration::seconds(self.observation_time() as i64)
    }

    fn sample_spec(&mut self) -> JobSpec {
        JobSpec {
            command: self.create_job_command(),
            num_processors: self.num_processors(),
            num_tasks: self.num_tasks(),
            project: self.choose(&self.workload.projects.clone()),
            queue: self.choose(&self.workload.queues.clone()),
        }
    }

    fn enqueue(&mut self, release_at: DateTime<Utc>) {
        let spec = self.sample_spec();
        self.state.total_submitted_jobs += 1;
        self.state.total_task_count += spec.num_tasks as u64;
        debug!(%release_at, tasks = spec.num_tasks, "queueing submission");
        self.state.submit_queue.push(PendingSubmission { release_at, spec });
    }

    /// Top up the submit queue according to the demand profile.
    pub(crate) fn create_jobs(&mut self, now: DateTime<Utc>) -> CreateJobs {
        let active = self.state.total_active_jobs();
        match &mut self.demand {
            Demand::Steady { base_load } => {
                let base_load = *base_load;
                if active >= base_load {
                    return CreateJobs::Continue;
                }
                let release_at = self.get_next_start_time(now);
                for _ in active..base_load {
                    self.enqueue(release_at);
                }
            }
            Demand::Batch {
                min_jobs_per_batch,
                max_jobs_per_batch,
                iterations,
                batches_submitted,
            } => {
                if active > 0 {
                    return CreateJobs::Continue;
                }
                if *iterations > 0 && *batches_submitted >= *iterations {
                    return CreateJobs::IterationLimitReached;
                }
                let (min, max) = (*min_jobs_per_batch, *max_jobs_per_batch);
                let burst = self.rng.gen_range(min..=max);
                let release_at = self.get_next_start_time(now);
                for _ in 0..burst {
                    self.enqueue(release_at);
                }
                if let Demand::Batch { batches_submitted, .. } = &mut self.demand {
                    *batches_submitted += 1;
                }
            }
        }
        CreateJobs::Continue
    }

    /// Poll the backend for every tracked job and fold terminal tasks
    /// into the counters. Transient query failures leave the affected
    /// handles untouched until the next tick.
    pub(crate) async fn reconcile(&mut self, scheduler: &Scheduler) {
        let mut groups: BTreeMap<u64, Vec<JobHandle>> = BTreeMap::new();
        for handle in self.state.active_handles.drain(..) {
            groups.entry(handle.job_id).or_default().push(handle);
        }

        self.state.pending_task_count = 0;
        self.state.running_task_count = 0;
        self.state.suspended_task_count = 0;

        let mut retained = Vec::new();
        for (job_id, handles) in groups {
            let views = match scheduler.get_jobs(job_id).await {
                Ok(views) => views,
                Err(err) => {
                    warn!(job_id, error = %err, "state query failed, keeping previous state");
                    retained.extend(handles);
                    continue;
                }
            };
            for handle in handles {
                let view = views.iter().find(|v| v.array_index == handle.array_index);
                let state = match view {
                    Some(view) => view.state,
                    // Missing from a successful query: the adapter already
                    // exhausted live and accounting state for this id.
                    None => JobState::Lost,
                };
                match state {
                    JobState::Pending => {
                        self.state.pending_task_count += 1;
                        retained.push(handle);
                    }
                    JobState::Running => {
                        self.state.running_task_count += 1;
                        retained.push(handle);
                    }
                    JobState::Suspended => {
                        self.state.suspended_task_count += 1;
                        retained.push(handle);
                    }
                    JobState::Completed => self.state.completed_task_count += 1,
                    JobState::Failed | JobState::Lost => self.state.failed_task_count += 1,
                    JobState::Killed => self.state.killed_task_count += 1,
                }
            }
        }
        self.state.active_handles = retained;

        info!(
            waiting = self.state.submit_queue.len(),
            pending = self.state.pending_task_count,
            running = self.state.running_task_count,
            suspended = self.state.suspended_task_count,
            completed = self.state.completed_task_count,
            failed = self.state.failed_task_count,
            killed = self.state.killed_task_count,
            active_jobs = self.state.total_active_jobs(),
            finished_jobs = self.state.total_finished_jobs(),
            "cluster activity"
        );
    }

    /// Hand every due submission to the backend, exactly once each.
    /// Rejected submissions are dropped, never retried.
    pub(crate) async fn release_due(&mut self, scheduler: &Scheduler, now: DateTime<Utc>) {
        for submission in self.state.submit_queue.drain_due(now) {
            match scheduler.submit(&submission.spec).await {
                Ok(handles) => {
                    if let Some(first) = handles.first() {
                        debug!(job = first.job_id, tasks = handles.len(), "submitted");
                    }
                    self.state.active_handles.extend(handles);
                }
                Err(err) => {
                    warn!(error = %err, "submission rejected, dropping");
                    self.state.rejected_submission_count += 1;
                }
            }
        }
    }

    /// Best-effort kill of everything still live. Backend errors are
    /// swallowed; the job may have raced to completion.
    pub(crate) async fn kill_all(&self, scheduler: &Scheduler) {
        for handle in &self.state.active_handles {
            let view = match scheduler.get_job(handle.job_id, handle.array_index).await {
                Ok(view) => view,
                Err(err) => {
                    debug!(%handle, error = %err, "state lookup before kill failed");
                    continue;
                }
            };
            if view.is_running() || view.is_pending() {
                debug!(%handle, "task is live, killing");
                if let Err(err) = scheduler.kill(*handle).await {
                    debug!(%handle, error = %err, "kill failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lavastorm_sched::fake::FakeCluster;

    fn seeded(workload: WorkloadConfig, profile: ProfileConfig) -> Profile {
        Profile::with_rng(workload, profile, StdRng::seed_from_u64(7))
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn immediate_workload() -> WorkloadConfig {
        WorkloadConfig {
            min_observation_time: 0,
            max_observation_time: 0,
            ..Default::default()
        }
    }

    fn hms(h: u32, m: u32, s: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, s).expect("valid time")
    }

    #[test]
    fn command_reports_sampled_runtime_and_exit() {
        let workload = WorkloadConfig {
            failure_rate: 0,
            min_runtime: 30,
            max_runtime: 30,
            ..Default::default()
        };
        let mut profile = seeded(workload, ProfileConfig::Steady { base_load: 1 });
        assert_eq!(profile.create_job_command(), "sleep 30; exit 0");
    }

    #[test]
    fn doomed_commands_exit_early_with_status_one() {
        let workload = WorkloadConfig {
            failure_rate: 100,
            min_runtime: 30,
            max_runtime: 30,
            ..Default::default()
        };
        let mut profile = seeded(workload, ProfileConfig::Steady { base_load: 1 });
        for _ in 0..100 {
            let command = profile.create_job_command();
            assert!(command.ends_with("; exit 1"), "{command}");
            let secs: u64 = command
                .strip_prefix("sleep ")
                .and_then(|rest| rest.split(';').next())
                .and_then(|n| n.parse().ok())
                .expect("sleep prefix");
            assert!(secs <= 30);
        }
    }

    #[test]
    fn failure_rate_distribution_holds() {
        let workload = WorkloadConfig {
            failure_rate: 25,
            min_runtime: 10,
            max_runtime: 20,
            ..Default::default()
        };
        let mut profile = seeded(workload, ProfileConfig::Steady { base_load: 1 });
        let total = 10_000;
        let failures = (0..total)
            .filter(|_| profile.create_job_command().ends_with("; exit 1"))
            .count();
        let fraction = failures as f64 / total as f64;
        assert!((fraction - 0.25).abs() <= 0.02, "failure fraction {fraction}");
    }

    #[test]
    fn office_hours_gate_activity() {
        let workload = WorkloadConfig {
            office_hours: vec![crate::api::OfficeHours::new(hms(9, 0, 0), hms(17, 0, 0))],
            ..Default::default()
        };
        let profile = seeded(workload, ProfileConfig::Steady { base_load: 1 });
        assert!(profile.is_active(hms(12, 0, 0)));
        assert!(profile.is_active(hms(9, 0, 0)));
        assert!(!profile.is_active(hms(20, 0, 0)));

        let always = seeded(WorkloadConfig::default(), ProfileConfig::Steady { base_load: 1 });
        assert!(always.is_active(hms(3, 0, 0)));
    }

    #[test]
    fn steady_profile_tops_up_to_base_load() {
        let mut profile = seeded(immediate_workload(), ProfileConfig::Steady { base_load: 5 });
        assert_eq!(profile.create_jobs(now()), CreateJobs::Continue);
        assert_eq!(profile.state.submit_queue.len(), 5);
        assert_eq!(profile.state.total_submitted_jobs, 5);

        // Already at base load: nothing more is queued.
        assert_eq!(profile.create_jobs(now()), CreateJobs::Continue);
        assert_eq!(profile.state.submit_queue.len(), 5);
    }

    #[test]
    fn steady_profile_shares_one_release_time_per_invocation() {
        let workload = WorkloadConfig {
            min_observation_time: 60,
            max_observation_time: 600,
            ..Default::default()
        };
        let mut profile = seeded(workload, ProfileConfig::Steady { base_load: 4 });
        profile.create_jobs(now());
        let release_times: Vec<_> = profile
            .state
            .submit_queue
            .drain_due(now() + chrono::Duration::seconds(600))
            .into_iter()
            .map(|s| s.release_at)
            .collect();
        assert_eq!(release_times.len(), 4);
        assert!(release_times.windows(2).all(|w| w[0] == w[1]));
        assert!(release_times[0] >= now() + chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn batch_profile_waits_for_drain_and_honours_iterations() {
        let profile_cfg = ProfileConfig::Batch {
            min_jobs_per_batch: 2,
            max_jobs_per_batch: 2,
            iterations: 2,
        };
        let mut profile = seeded(immediate_workload(), profile_cfg);
        let cluster = FakeCluster::new();
        let scheduler = Scheduler::from(cluster.clone());

        assert_eq!(profile.create_jobs(now()), CreateJobs::Continue);
        assert_eq!(profile.state.submit_queue.len(), 2);

        // Burst still queued: nothing new.
        assert_eq!(profile.create_jobs(now()), CreateJobs::Continue);
        assert_eq!(profile.state.submit_queue.len(), 2);

        profile.release_due(&scheduler, now()).await;
        assert_eq!(profile.state.active_handles.len(), 2);

        // Burst still running: nothing new.
        cluster.set_live_tasks(JobState::Running);
        profile.reconcile(&scheduler).await;
        assert_eq!(profile.create_jobs(now()), CreateJobs::Continue);
        assert_eq!(profile.state.submit_queue.len(), 0);

        // Drained: second burst goes out.
        cluster.set_live_tasks(JobState::Completed);
        profile.reconcile(&scheduler).await;
        assert_eq!(profile.create_jobs(now()), CreateJobs::Continue);
        assert_eq!(profile.state.submit_queue.len(), 2);
        profile.release_due(&scheduler, now()).await;

        cluster.set_live_tasks(JobState::Completed);
        profile.reconcile(&scheduler).await;
        assert_eq!(profile.create_jobs(now()), CreateJobs::IterationLimitReached);
        assert_eq!(profile.state.total_submitted_jobs, 4);
    }

    #[tokio::test]
    async fn reconcile_folds_terminal_tasks_into_counters() {
        let mut profile = seeded(immediate_workload(), ProfileConfig::Steady { base_load: 3 });
        let cluster = FakeCluster::new();
        let scheduler = Scheduler::from(cluster.clone());

        profile.create_jobs(now());
        profile.release_due(&scheduler, now()).await;
        assert_eq!(profile.state.active_handles.len(), 3);

        profile.reconcile(&scheduler).await;
        assert_eq!(profile.state.pending_task_count, 3);

        cluster.set_task(JobHandle::new(1, 0), JobState::Completed);
        cluster.set_task(JobHandle::new(2, 0), JobState::Failed);
        cluster.set_task(JobHandle::new(3, 0), JobState::Killed);
        profile.reconcile(&scheduler).await;

        assert_eq!(profile.state.completed_task_count, 1);
        assert_eq!(profile.state.failed_task_count, 1);
        assert_eq!(profile.state.killed_task_count, 1);
        assert!(profile.state.active_handles.is_empty());
        assert_eq!(profile.state.total_finished_jobs(), 3);
    }

    #[tokio::test]
    async fn transient_failures_keep_handles_and_counters() {
        let mut profile = seeded(immediate_workload(), ProfileConfig::Steady { base_load: 2 });
        let cluster = FakeCluster::new();
        let scheduler = Scheduler::from(cluster.clone());

        profile.create_jobs(now());
        profile.release_due(&scheduler, now()).await;
        cluster.set_live_tasks(JobState::Running);
        profile.reconcile(&scheduler).await;
        assert_eq!(profile.state.running_task_count, 2);

        // Outage: each of the two job-id groups fails once per tick.
        cluster.fail_next_queries(6);
        for _ in 0..3 {
            profile.reconcile(&scheduler).await;
            assert_eq!(profile.state.active_handles.len(), 2);
            assert_eq!(profile.state.completed_task_count, 0);
            assert_eq!(profile.state.failed_task_count, 0);
        }

        // Recovery: states match the backend again.
        profile.reconcile(&scheduler).await;
        assert_eq!(profile.state.running_task_count, 2);
        assert_eq!(profile.state.active_handles.len(), 2);
    }

    #[tokio::test]
    async fn handles_missing_from_a_healthy_backend_count_as_failures() {
        let mut profile = seeded(immediate_workload(), ProfileConfig::Steady { base_load: 1 });
        let cluster = FakeCluster::new();
        let scheduler = Scheduler::from(cluster.clone());

        profile.create_jobs(now());
        profile.release_due(&scheduler, now()).await;
        cluster.forget_job(1);
        profile.reconcile(&scheduler).await;

        assert_eq!(profile.state.failed_task_count, 1);
        assert!(profile.state.active_handles.is_empty());
    }

    #[tokio::test]
    async fn rejected_submissions_are_dropped_not_retried() {
        let mut profile = seeded(immediate_workload(), ProfileConfig::Steady { base_load: 2 });
        let cluster = FakeCluster::new();
        let scheduler = Scheduler::from(cluster.clone());

        cluster.reject_submissions(true);
        profile.create_jobs(now());
        profile.release_due(&scheduler, now()).await;

        assert_eq!(profile.state.rejected_submission_count, 2);
        assert!(profile.state.submit_queue.is_empty());
        assert!(profile.state.active_handles.is_empty());
        // The next creation round replaces the dropped jobs.
        profile.create_jobs(now());
        assert_eq!(profile.state.submit_queue.len(), 2);
    }

    #[tokio::test]
    async fn kill_all_only_targets_live_tasks() {
        let mut profile = seeded(immediate_workload(), ProfileConfig::Steady { base_load: 3 });
        let cluster = FakeCluster::new();
        let scheduler = Scheduler::from(cluster.clone());

        profile.create_jobs(now());
        profile.release_due(&scheduler, now()).await;
        cluster.set_task(JobHandle::new(1, 0), JobState::Running);
        cluster.set_task(JobHandle::new(2, 0), JobState::Completed);

        profile.kill_all(&scheduler).await;
        // Job 1 (running) and job 3 (pending) are killed; job 2 raced to
        // completion and is left alone.
        assert_eq!(
            cluster.killed_handles(),
            vec![JobHandle::new(1, 0), JobHandle::new(3, 0)]
        );
    }

    #[tokio::test]
    async fn accounting_is_conserved_across_ticks() {
        let mut profile = seeded(immediate_workload(), ProfileConfig::Steady { base_load: 3 });
        let cluster = FakeCluster::new();
        let scheduler = Scheduler::from(cluster.clone());

        let mut prev = RunSummary::default();
        for round in 0..6 {
            profile.reconcile(&scheduler).await;
            profile.create_jobs(now());
            profile.release_due(&scheduler, now()).await;
            if round % 2 == 1 {
                cluster.set_live_tasks(JobState::Completed);
            }

            let summary = profile.state.summary();
            assert_eq!(
                summary.total_active_jobs + summary.total_finished_jobs,
                summary.total_submitted_jobs
            );
            assert!(summary.total_submitted_jobs >= prev.total_submitted_jobs);
            assert!(summary.completed_task_count >= prev.completed_task_count);
            assert!(summary.failed_task_count >= prev.failed_task_count);
            assert!(summary.killed_task_count >= prev.killed_task_count);
            prev = summary;
        }
    }
}
