//! Scripted in-memory cluster for driver tests.
//!
//! Tests steer it between ticks: flip task states, inject submission
//! rejections, or force a run of transient query failures, then assert on
//! what the driver did about it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::SchedError;
use crate::job::{JobHandle, JobSpec, JobState, JobView};

#[derive(Debug, Default)]
struct FakeState {
    next_job_id: u64,
    tasks: BTreeMap<JobHandle, JobState>,
    submitted: Vec<(u64, JobSpec)>,
    killed: Vec<JobHandle>,
    reject_submissions: bool,
    query_failures_left: u32,
}

/// In-memory scheduler with test-controlled job states.
///
/// Cloning shares the underlying cluster, so a test can keep one clone to
/// script with while the driver owns the other.
#[derive(Debug, Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCluster {
    /// Empty cluster; the first submission gets job id 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a submission; every task starts out pending.
    pub async fn submit(&self, spec: &JobSpec) -> Result<Vec<JobHandle>, SchedError> {
        let mut state = self.state.lock().expect("fake cluster lock");
        if state.reject_submissions {
            return Err(SchedError::submit("fake cluster rejects submissions"));
        }
        state.next_job_id += 1;
        let job_id = state.next_job_id;
        let handles = spec.handles_for(job_id);
        for handle in &handles {
            state.tasks.insert(*handle, JobState::Pending);
        }
        state.submitted.push((job_id, spec.clone()));
        Ok(handles)
    }

    /// All task views under one job id; empty for ids the cluster has
    /// forgotten (or never knew).
    pub async fn get_jobs(&self, job_id: u64) -> Result<Vec<JobView>, SchedError> {
        let mut state = self.state.lock().expect("fake cluster lock");
        if state.query_failures_left > 0 {
            state.query_failures_left -= 1;
            return Err(SchedError::transient("fake cluster query outage"));
        }
        Ok(state
            .tasks
            .iter()
            .filter(|(handle, _)| handle.job_id == job_id)
            .map(|(handle, task_state)| JobView::new(handle.job_id, handle.array_index, *task_state))
            .collect())
    }

    /// View of one task.
    pub async fn get_job(&self, job_id: u64, array_index: u32) -> Result<JobView, SchedError> {
        let mut state = self.state.lock().expect("fake cluster lock");
        if state.query_failures_left > 0 {
            state.query_failures_left -= 1;
            return Err(SchedError::transient("fake cluster query outage"));
        }
        let handle = JobHandle::new(job_id, array_index);
        Ok(state
            .tasks
            .get(&handle)
            .map(|s| JobView::new(job_id, array_index, *s))
            .unwrap_or_else(|| JobView::lost(job_id, array_index)))
    }

    /// Record the kill and mark the task killed.
    pub async fn kill(&self, handle: JobHandle) -> Result<(), SchedError> {
        let mut state = self.state.lock().expect("fake cluster lock");
        state.killed.push(handle);
        state.tasks.insert(handle, JobState::Killed);
        Ok(())
    }

    /// Script: move every task currently in `from` to `to`.
    pub fn advance_all(&self, from: JobState, to: JobState) {
        let mut state = self.state.lock().expect("fake cluster lock");
        for task_state in state.tasks.values_mut() {
            if *task_state == from {
                *task_state = to;
            }
        }
    }

    /// Script: set every live (non-terminal) task to `to`.
    pub fn set_live_tasks(&self, to: JobState) {
        let mut state = self.state.lock().expect("fake cluster lock");
        for task_state in state.tasks.values_mut() {
            if !task_state.is_terminal() {
                *task_state = to;
            }
        }
    }

    /// Script: set one task's state.
    pub fn set_task(&self, handle: JobHandle, to: JobState) {
        let mut state = self.state.lock().expect("fake cluster lock");
        state.tasks.insert(handle, to);
    }

    /// Script: forget a job entirely, as if it aged out of accounting.
    pub fn forget_job(&self, job_id: u64) {
        let mut state = self.state.lock().expect("fake cluster lock");
        state.tasks.retain(|handle, _| handle.job_id != job_id);
    }

    /// Script: make the next `n` queries fail transiently.
    pub fn fail_next_queries(&self, n: u32) {
        self.state.lock().expect("fake cluster lock").query_failures_left = n;
    }

    /// Script: reject all submissions from now on.
    pub fn reject_submissions(&self, reject: bool) {
        self.state.lock().expect("fake cluster lock").reject_submissions = reject;
    }

    /// Number of submissions accepted so far.
    pub fn submission_count(&self) -> usize {
        self.state.lock().expect("fake cluster lock").submitted.len()
    }

    /// Specs of accepted submissions, in submission order.
    pub fn submitted_specs(&self) -> Vec<JobSpec> {
        let state = self.state.lock().expect("fake cluster lock");
        state.submitted.iter().map(|(_, spec)| spec.clone()).collect()
    }

    /// Handles that received a kill request, in order.
    pub fn killed_handles(&self) -> Vec<JobHandle> {
        self.state.lock().expect("fake cluster lock").killed.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submissions_allocate_ids_and_pend() {
        let cluster = FakeCluster::new();
        let mut spec = JobSpec::command("sleep 5; exit 0");
        spec.num_tasks = 3;
        let handles = cluster.submit(&spec).await.expect("accepted");
        assert_eq!(handles.len(), 3);
        assert!(handles.iter().all(|h| h.job_id == 1));

        let views = cluster.get_jobs(1).await.expect("query ok");
        assert_eq!(views.len(), 3);
        assert!(views.iter().all(|v| v.is_pending()));
    }

    #[tokio::test]
    async fn scripted_outage_fails_queries_then_recovers() {
        let cluster = FakeCluster::new();
        cluster.submit(&JobSpec::command("sleep 1; exit 0")).await.expect("accepted");
        cluster.fail_next_queries(2);
        assert!(cluster.get_jobs(1).await.is_err());
        assert!(cluster.get_jobs(1).await.is_err());
        assert!(cluster.get_jobs(1).await.is_ok());
    }

    #[tokio::test]
    async fn forgotten_jobs_read_as_lost() {
        let cluster = FakeCluster::new();
        cluster.submit(&JobSpec::command("sleep 1; exit 0")).await.expect("accepted");
        cluster.forget_job(1);
        assert_eq!(cluster.get_jobs(1).await.expect("query ok"), Vec::new());
        let view = cluster.get_job(1, 0).await.expect("query ok");
        assert!(view.was_killed() && view.is_failed());
    }
}
