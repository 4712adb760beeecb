//! Job lifecycle model shared by every backend.

/// Identity of one task as retained by the driver between polls.
///
/// Array jobs produce one handle per task, all sharing `job_id` with
/// `array_index` running `1..=num_tasks`. A plain job has a single handle
/// with `array_index` 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobHandle {
    /// Backend job identifier.
    pub job_id: u64,
    /// Task index inside an array job; 0 when the job is not an array.
    pub array_index: u32,
}

impl JobHandle {
    /// Build a handle from its parts.
    pub fn new(job_id: u64, array_index: u32) -> Self {
        Self { job_id, array_index }
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.array_index == 0 {
            write!(f, "{}", self.job_id)
        } else {
            write!(f, "{}[{}]", self.job_id, self.array_index)
        }
    }
}

/// Normalised lifecycle state of a task.
///
/// Backends encode state very differently (`PEND`/`RUN` tokens, `qw`/`r`
/// letter soup, accounting exit codes); adapters translate everything into
/// this one enum, so a view can never claim to be both completed and
/// failed, or both running and pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Accepted by the scheduler, waiting for a slot.
    Pending,
    /// Executing on a compute host.
    Running,
    /// Suspended by the scheduler or an operator.
    Suspended,
    /// Finished with exit status 0.
    Completed,
    /// Finished with a non-zero exit status.
    Failed,
    /// Terminated by an explicit kill.
    Killed,
    /// Vanished from both live and accounting state; treated as a killed
    /// failure.
    Lost,
}

impl JobState {
    /// True for states in which the task no longer occupies the cluster.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Killed | JobState::Lost
        )
    }
}

/// Immutable snapshot of one task, as last reported by its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobView {
    /// Backend job identifier.
    pub job_id: u64,
    /// Task index inside an array job; 0 when the job is not an array.
    pub array_index: u32,
    /// Normalised lifecycle state.
    pub state: JobState,
}

impl JobView {
    /// Build a view for one task.
    pub fn new(job_id: u64, array_index: u32, state: JobState) -> Self {
        Self { job_id, array_index, state }
    }

    /// View for a task the backend no longer knows anything about.
    pub fn lost(job_id: u64, array_index: u32) -> Self {
        Self::new(job_id, array_index, JobState::Lost)
    }

    /// Handle for this task.
    pub fn handle(&self) -> JobHandle {
        JobHandle::new(self.job_id, self.array_index)
    }

    /// Task is executing.
    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    /// Task is waiting for a slot.
    pub fn is_pending(&self) -> bool {
        self.state == JobState::Pending
    }

    /// Task is suspended.
    pub fn is_suspended(&self) -> bool {
        self.state == JobState::Suspended
    }

    /// Task finished successfully.
    pub fn is_completed(&self) -> bool {
        self.state == JobState::Completed
    }

    /// Task finished unsuccessfully (including lost tasks).
    pub fn is_failed(&self) -> bool {
        matches!(self.state, JobState::Failed | JobState::Lost)
    }

    /// Task was killed (including lost tasks).
    pub fn was_killed(&self) -> bool {
        matches!(self.state, JobState::Killed | JobState::Lost)
    }
}

/// Everything a backend needs to submit one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Shell command the scheduler runs on the compute host.
    pub command: String,
    /// Requested slot count.
    pub num_processors: u32,
    /// Task count; values above 1 submit an array job.
    pub num_tasks: u32,
    /// Accounting project, or the backend default when absent.
    pub project: Option<String>,
    /// Target queue, or the backend default when absent.
    pub queue: Option<String>,
}

impl JobSpec {
    /// Spec for a plain single-task job with default placement.
    pub fn command(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            num_processors: 1,
            num_tasks: 1,
            project: None,
            queue: None,
        }
    }

    /// Handles a submission of this spec produces once the backend hands
    /// back `job_id`: `1..=num_tasks` for arrays, a single index-0 handle
    /// otherwise.
    pub fn handles_for(&self, job_id: u64) -> Vec<JobHandle> {
        if self.num_tasks > 1 {
            (1..=self.num_tasks).map(|i| JobHandle::new(job_id, i)).collect()
        } else {
            vec![JobHandle::new(job_id, 0)]
        }
    }
}
