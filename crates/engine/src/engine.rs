use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Local, NaiveTime, Utc};
use tracing::info;

use lavastorm_sched::Scheduler;

use crate::api::{DriverConfig, DriverHandle, RunSummary};
use crate::profile::{CreateJobs, Profile};

pub(crate) struct DriverInner {
    stop_requested: AtomicBool,
    notify: tokio::sync::Notify,
}

impl DriverInner {
    pub(crate) fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    fn should_stop(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    Continue,
    Finished,
}

/// One profile instance against one scheduler; the whole driver state.
pub(crate) struct DriverCore {
    scheduler: Scheduler,
    profile: Profile,
}

impl DriverCore {
    pub(crate) fn new(config: DriverConfig, scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            profile: Profile::new(config.workload, config.profile),
        }
    }

    /// One driver tick: reconcile, then create, then release. A job
    /// submitted this tick is first observable in the next one.
    pub(crate) async fn tick(&mut self, now: DateTime<Utc>, local_now: NaiveTime) -> TickOutcome {
        self.profile.reconcile(&self.scheduler).await;
        if self.profile.is_active(local_now)
            && self.profile.create_jobs(now) == CreateJobs::IterationLimitReached
        {
            info!("iteration limit reached, stopping");
            return TickOutcome::Finished;
        }
        self.profile.release_due(&self.scheduler, now).await;
        TickOutcome::Continue
    }

    pub(crate) async fn kill_all(&self) {
        self.profile.kill_all(&self.scheduler).await;
    }

    pub(crate) fn summary(&self) -> RunSummary {
        self.profile.state.summary()
    }

    #[cfg(test)]
    fn with_profile(scheduler: Scheduler, profile: Profile) -> Self {
        Self { scheduler, profile }
    }

    #[cfg(test)]
    fn profile(&self) -> &Profile {
        &self.profile
    }
}

pub(crate) fn start_driver(config: DriverConfig, scheduler: Scheduler) -> DriverHandle {
    let inner = Arc::new(DriverInner {
        stop_requested: AtomicBool::new(false),
        notify: tokio::sync::Notify::new(),
    });
    let join = tokio::spawn(run_driver(inner.clone(), config, scheduler));
    DriverHandle { inner, join }
}

async fn run_driver(
    inner: Arc<DriverInner>,
    mut config: DriverConfig,
    scheduler: Scheduler,
) -> anyhow::Result<RunSummary> {
    if config.tick.is_zero() {
        config.tick = DriverConfig::DEFAULT_TICK;
    }
    let tick = config.tick;

    let mut core = DriverCore::new(config, scheduler);
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        if inner.should_stop() {
            info!("stop requested, killing active jobs");
            core.kill_all().await;
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                let local_now = Local::now().time();
                if core.tick(now, local_now).await == TickOutcome::Finished {
                    break;
                }
            }
            _ = inner.notify.notified() => {}
        }
    }

    let summary = core.summary();
    info!(
        submitted = summary.total_submitted_jobs,
        completed = summary.completed_task_count,
        failed = summary.failed_task_count,
        killed = summary.killed_task_count,
        rejected = summary.rejected_submission_count,
        "driver stopped"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use lavastorm_sched::fake::FakeCluster;
    use lavastorm_sched::JobState;

    use crate::api::{OfficeHours, ProfileConfig, WorkloadConfig};

    fn immediate_workload() -> WorkloadConfig {
        WorkloadConfig {
            min_observation_time: 0,
            max_observation_time: 0,
            ..Default::default()
        }
    }

    fn core_with(cluster: &FakeCluster, workload: WorkloadConfig, profile: ProfileConfig) -> DriverCore {
        DriverCore::with_profile(
            Scheduler::from(cluster.clone()),
            Profile::with_rng(workload, profile, StdRng::seed_from_u64(11)),
        )
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn noon() -> NaiveTime {
        NaiveTime::from_hms_opt(12, 0, 0).expect("valid time")
    }

    #[tokio::test]
    async fn steady_state_reaches_and_holds_base_load() {
        let cluster = FakeCluster::new();
        let mut core = core_with(
            &cluster,
            immediate_workload(),
            ProfileConfig::Steady { base_load: 3 },
        );

        // Tick 1 submits; reconciliation runs before creation, so the new
        // tasks are not yet counted.
        assert_eq!(core.tick(now(), noon()).await, TickOutcome::Continue);
        assert_eq!(core.profile().state.pending_task_count, 0);
        assert_eq!(core.profile().state.active_handles.len(), 3);

        cluster.set_live_tasks(JobState::Running);
        assert_eq!(core.tick(now(), noon()).await, TickOutcome::Continue);
        assert_eq!(core.profile().state.running_task_count, 3);

        // Simulate a minute of completions; the profile keeps topping up.
        for _ in 0..6 {
            cluster.set_live_tasks(JobState::Completed);
            core.tick(now(), noon()).await;
        }
        let summary = core.summary();
        assert!(summary.completed_task_count >= 3);
        assert_eq!(summary.total_active_jobs, 3);
        assert_eq!(
            summary.total_active_jobs + summary.total_finished_jobs,
            summary.total_submitted_jobs
        );
    }

    #[tokio::test]
    async fn array_submissions_track_every_task() {
        let cluster = FakeCluster::new();
        let workload = WorkloadConfig {
            min_tasks_per_job: 4,
            max_tasks_per_job: 4,
            ..immediate_workload()
        };
        let mut core = core_with(&cluster, workload, ProfileConfig::Steady { base_load: 1 });

        core.tick(now(), noon()).await;
        let handles = &core.profile().state.active_handles;
        assert_eq!(handles.len(), 4);
        let idx: Vec<u32> = handles.iter().map(|h| h.array_index).collect();
        assert_eq!(idx, vec![1, 2, 3, 4]);
        assert!(handles.iter().all(|h| h.job_id == 1));

        core.tick(now(), noon()).await;
        assert_eq!(core.profile().state.pending_task_count, 4);
        // Four tasks, one job.
        assert_eq!(core.summary().total_active_jobs, 1);
        assert_eq!(core.summary().total_task_count, 4);
    }

    #[tokio::test]
    async fn office_hours_suppress_creation_entirely() {
        let cluster = FakeCluster::new();
        let workload = WorkloadConfig {
            office_hours: vec![OfficeHours::new(
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            )],
            ..immediate_workload()
        };
        let mut core = core_with(&cluster, workload, ProfileConfig::Steady { base_load: 3 });

        let evening = NaiveTime::from_hms_opt(20, 0, 0).unwrap();
        for _ in 0..10 {
            core.tick(now(), evening).await;
        }
        assert_eq!(core.summary().total_submitted_jobs, 0);
        assert_eq!(cluster.submission_count(), 0);
        assert!(core.profile().state.submit_queue.is_empty());

        // Back inside office hours, the profile wakes up.
        core.tick(now(), noon()).await;
        assert_eq!(core.summary().total_submitted_jobs, 3);
    }

    #[tokio::test]
    async fn query_outage_never_reclassifies_tasks() {
        let cluster = FakeCluster::new();
        let mut core = core_with(
            &cluster,
            immediate_workload(),
            ProfileConfig::Steady { base_load: 2 },
        );

        core.tick(now(), noon()).await;
        cluster.set_live_tasks(JobState::Running);
        core.tick(now(), noon()).await;
        assert_eq!(core.profile().state.running_task_count, 2);

        cluster.fail_next_queries(6);
        for _ in 0..3 {
            core.tick(now(), noon()).await;
            let state = &core.profile().state;
            assert_eq!(state.active_handles.len(), 2);
            assert_eq!(state.completed_task_count, 0);
            assert_eq!(state.failed_task_count, 0);
            assert_eq!(state.killed_task_count, 0);
        }

        core.tick(now(), noon()).await;
        assert_eq!(core.profile().state.running_task_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_driver_submits_its_iterations_and_stops() {
        let cluster = FakeCluster::new();
        let config = DriverConfig {
            tick: Duration::from_millis(10),
            workload: immediate_workload(),
            profile: ProfileConfig::Batch {
                min_jobs_per_batch: 2,
                max_jobs_per_batch: 2,
                iterations: 3,
            },
        };
        let handle = start_driver(config, Scheduler::from(cluster.clone()));

        // Complete whatever is live between ticks until the cap is hit.
        let completer = {
            let cluster = cluster.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    cluster.set_live_tasks(JobState::Completed);
                }
            })
        };

        let summary = handle.wait().await.expect("driver result");
        completer.abort();

        assert_eq!(summary.total_submitted_jobs, 6);
        assert_eq!(summary.completed_task_count, 6);
        assert_eq!(summary.total_active_jobs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_request_kills_live_tasks() {
        let cluster = FakeCluster::new();
        let config = DriverConfig {
            tick: Duration::from_millis(10),
            workload: immediate_workload(),
            profile: ProfileConfig::Steady { base_load: 3 },
        };
        let handle = start_driver(config, Scheduler::from(cluster.clone()));

        tokio::time::sleep(Duration::from_millis(25)).await;
        handle.request_stop();
        let summary = handle.wait().await.expect("driver result");

        // Everything was still pending, so everything gets killed.
        assert_eq!(summary.total_submitted_jobs, 3);
        assert_eq!(cluster.killed_handles().len(), 3);
    }
}
