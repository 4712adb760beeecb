use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::error::SchedError;
use crate::job::{JobHandle, JobSpec, JobView};
use crate::proc::run_tool;
use crate::states::{sge_accounting_state, sge_state};

static QSUB_SUBMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Your job(-array)? (\d+).* has been submitted").expect("qsub regex")
});

/// Configuration of the Sun Grid Engine command-line adapter.
#[derive(Debug, Clone)]
pub struct SgeCliConfig {
    /// Submission command, normally `qsub`.
    pub qsub_command: String,
    /// Live state query command, normally `qstat`.
    pub qstat_command: String,
    /// Accounting query command, normally `qacct`.
    pub qacct_command: String,
    /// Kill command, normally `qdel`.
    pub qdel_command: String,
    /// Parallel environment used for multi-slot jobs (`qsub -pe`).
    pub pe_type: Option<String>,
    /// How long a job may be missing from both live and accounting state
    /// before it is reported as lost.
    pub history_deadline: Duration,
    /// Pause between live/accounting retry rounds.
    pub retry_interval: Duration,
}

impl Default for SgeCliConfig {
    fn default() -> Self {
        Self {
            qsub_command: "qsub".to_string(),
            qstat_command: "qstat".to_string(),
            qacct_command: "qacct".to_string(),
            qdel_command: "qdel".to_string(),
            pe_type: None,
            history_deadline: Duration::from_secs(10),
            retry_interval: Duration::from_secs(2),
        }
    }
}

/// Adapter driving a Sun Grid Engine scheduler through its command-line
/// tools. Every call spawns a fresh process.
#[derive(Debug)]
pub struct SgeCli {
    cfg: SgeCliConfig,
}

impl SgeCli {
    /// Build the adapter.
    pub fn new(cfg: SgeCliConfig) -> Self {
        Self { cfg }
    }

    /// Submit one job via `qsub`. Array task handles come straight from
    /// the `-t 1-N` range; SGE reports the range back in the submission
    /// line, so no follow-up listing is needed.
    pub async fn submit(&self, spec: &JobSpec) -> Result<Vec<JobHandle>, SchedError> {
        let args = qsub_args(spec, self.cfg.pe_type.as_deref());
        let out = run_tool(&self.cfg.qsub_command, &args)
            .await
            .map_err(|err| SchedError::submit(format!("{}: {err}", self.cfg.qsub_command)))?;
        if !out.success() {
            return Err(SchedError::submit(out.describe()));
        }
        let job_id = parse_qsub_output(&out.stdout).ok_or_else(|| {
            SchedError::submit(format!("unparseable qsub output: {}", out.stdout.trim()))
        })?;
        Ok(spec.handles_for(job_id))
    }

    /// All task views under one job id; empty after the history deadline
    /// expires with the job missing from both live and accounting state.
    pub async fn get_jobs(&self, job_id: u64) -> Result<Vec<JobView>, SchedError> {
        let deadline = tokio::time::Instant::now() + self.cfg.history_deadline;
        loop {
            let live = self.query_live(job_id).await?;
            if !live.is_empty() {
                return Ok(live);
            }
            if let Some(views) = self.query_accounting(job_id, None).await? {
                return Ok(views);
            }
            if tokio::time::Instant::now() >= deadline {
                debug!(job_id, "missing from qstat and qacct past deadline");
                return Ok(Vec::new());
            }
            tokio::time::sleep(self.cfg.retry_interval).await;
        }
    }

    /// View of one task.
    pub async fn get_job(&self, job_id: u64, array_index: u32) -> Result<JobView, SchedError> {
        let deadline = tokio::time::Instant::now() + self.cfg.history_deadline;
        loop {
            let live = self.query_live(job_id).await?;
            if let Some(view) = live.into_iter().find(|v| v.array_index == array_index) {
                return Ok(view);
            }
            if let Some(views) = self.query_accounting(job_id, Some(array_index)).await? {
                if let Some(view) = views.into_iter().find(|v| v.array_index == array_index) {
                    return Ok(view);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(JobView::lost(job_id, array_index));
            }
            tokio::time::sleep(self.cfg.retry_interval).await;
        }
    }

    /// Kill one task via `qdel`.
    pub async fn kill(&self, handle: JobHandle) -> Result<(), SchedError> {
        let target = if handle.array_index == 0 {
            handle.job_id.to_string()
        } else {
            format!("{}.{}", handle.job_id, handle.array_index)
        };
        let out = run_tool(&self.cfg.qdel_command, &[target])
            .await
            .map_err(|err| SchedError::kill(format!("{}: {err}", self.cfg.qdel_command)))?;
        if !out.success() {
            return Err(SchedError::kill(out.describe()));
        }
        Ok(())
    }

    async fn query_live(&self, job_id: u64) -> Result<Vec<JobView>, SchedError> {
        let args = vec!["-g".to_string(), "d".to_string(), "-xml".to_string()];
        let out = run_tool(&self.cfg.qstat_command, &args)
            .await
            .map_err(|err| SchedError::transient(format!("{}: {err}", self.cfg.qstat_command)))?;
        if !out.success() {
            return Err(SchedError::transient(out.describe()));
        }
        let views = parse_qstat(&out.stdout)
            .map_err(|err| SchedError::transient(format!("qstat xml: {err}")))?;
        Ok(views.into_iter().filter(|v| v.job_id == job_id).collect())
    }

    async fn query_accounting(
        &self,
        job_id: u64,
        array_index: Option<u32>,
    ) -> Result<Option<Vec<JobView>>, SchedError> {
        let mut args = vec!["-j".to_string(), job_id.to_string()];
        if let Some(idx) = array_index {
            if idx > 0 {
                args.push("-t".to_string());
                args.push(idx.to_string());
            }
        }
        let out = run_tool(&self.cfg.qacct_command, &args)
            .await
            .map_err(|err| SchedError::transient(format!("{}: {err}", self.cfg.qacct_command)))?;
        if !out.success() {
            // qacct exits non-zero for ids it has no record of.
            if out.stderr.contains("not found") || out.stdout.contains("not found") {
                return Ok(None);
            }
            return Err(SchedError::transient(out.describe()));
        }
        let views = parse_qacct(&out.stdout, job_id);
        Ok(if views.is_empty() { None } else { Some(views) })
    }
}

fn qsub_args(spec: &JobSpec, pe_type: Option<&str>) -> Vec<String> {
    let mut args = vec!["-b".to_string(), "y".to_string()];
    if spec.num_processors > 1 {
        if let Some(pe) = pe_type {
            args.push("-pe".to_string());
            args.push(pe.to_string());
            args.push(spec.num_processors.to_string());
        }
    }
    if let Some(project) = &spec.project {
        args.push("-P".to_string());
        args.push(project.clone());
    }
    if let Some(queue) = &spec.queue {
        args.push("-q".to_string());
        args.push(queue.clone());
    }
    if spec.num_tasks > 1 {
        args.push("-t".to_string());
        args.push(format!("1-{}", spec.num_tasks));
    }
    args.push(spec.command.clone());
    args
}

fn parse_qsub_output(stdout: &str) -> Option<u64> {
    let captures = QSUB_SUBMIT_RE.captures(stdout)?;
    captures[2].parse().ok()
}

#[derive(Debug, Deserialize)]
struct QstatReport {
    #[serde(default)]
    queue_info: Option<QstatJobContainer>,
    #[serde(default)]
    job_info: Option<QstatJobContainer>,
}

#[derive(Debug, Default, Deserialize)]
struct QstatJobContainer {
    #[serde(rename = "job_list", default)]
    jobs: Vec<QstatJobList>,
}

#[derive(Debug, Deserialize)]
struct QstatJobList {
    #[serde(rename = "JB_job_number")]
    job_number: u64,
    state: String,
    #[serde(default)]
    tasks: Option<String>,
}

/// `qstat -g d -xml` output: one `<job_list>` element per task, with the
/// array index in `<tasks>` when the job is an array.
fn parse_qstat(xml: &str) -> Result<Vec<JobView>, quick_xml::DeError> {
    let report: QstatReport = quick_xml::de::from_str(xml)?;
    let mut views = Vec::new();
    for container in [report.queue_info, report.job_info].into_iter().flatten() {
        for job in container.jobs {
            let Some(state) = sge_state(&job.state) else { continue };
            let array_index = job.tasks.as_deref().map_or(0, parse_task_index);
            views.push(JobView::new(job.job_number, array_index, state));
        }
    }
    Ok(views)
}

/// First index of a `<tasks>` value: `3`, `1-4:1`, `2,4`.
fn parse_task_index(tasks: &str) -> u32 {
    tasks
        .split(['-', ':', ','])
        .next()
        .and_then(|first| first.trim().parse().ok())
        .unwrap_or(0)
}

/// `qacct -j` output: `=====`-separated blocks of `key value` lines.
fn parse_qacct(stdout: &str, job_id: u64) -> Vec<JobView> {
    let mut views = Vec::new();
    for block in stdout.split("==============================================================") {
        let mut fields: HashMap<&str, &str> = HashMap::new();
        for line in block.lines() {
            if let Some((key, value)) = line.trim().split_once(char::is_whitespace) {
                fields.insert(key, value.trim());
            }
        }
        let Some(number) = fields.get("jobnumber").and_then(|v| v.parse::<u64>().ok()) else {
            continue;
        };
        if number != job_id {
            continue;
        }
        let array_index = fields
            .get("taskid")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        let exit_status = fields
            .get("exit_status")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let failed = fields
            .get("failed")
            .and_then(|v| v.split_whitespace().next())
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        views.push(JobView::new(job_id, array_index, sge_accounting_state(exit_status, failed)));
    }
    views
}
