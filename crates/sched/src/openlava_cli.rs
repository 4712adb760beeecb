use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::error::SchedError;
use crate::job::{JobHandle, JobSpec, JobState, JobView};
use crate::proc::run_tool;
use crate::states::openlava_state;

static BSUB_SUBMIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Job <(\d+)> is submitted to").expect("bsub regex"));

static BHIST_JOB_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Job <(\d+)(?:\[(\d+)\])?>").expect("bhist regex"));

/// Configuration of the OpenLava command-line adapter.
#[derive(Debug, Clone)]
pub struct OpenLavaCliConfig {
    /// Submission command, normally `bsub`.
    pub bsub_command: String,
    /// Live state query command, normally `bjobs`.
    pub bjobs_command: String,
    /// Accounting query command, normally `bhist`.
    pub bhist_command: String,
    /// Kill command, normally `bkill`.
    pub bkill_command: String,
    /// Job name stem used for array submissions.
    pub job_name: String,
    /// How long a job may be missing from both live and accounting state
    /// before it is reported as lost.
    pub history_deadline: Duration,
    /// Pause between live/accounting retry rounds.
    pub retry_interval: Duration,
    /// Classify `UNKWN`/`ZOMBI` as failed instead of running.
    pub unknown_is_failed: bool,
}

impl Default for OpenLavaCliConfig {
    fn default() -> Self {
        Self {
            bsub_command: "bsub".to_string(),
            bjobs_command: "bjobs".to_string(),
            bhist_command: "bhist".to_string(),
            bkill_command: "bkill".to_string(),
            job_name: "lavastorm".to_string(),
            history_deadline: Duration::from_secs(10),
            retry_interval: Duration::from_secs(2),
            unknown_is_failed: false,
        }
    }
}

/// Adapter driving an OpenLava (or LSF-compatible) scheduler through its
/// command-line tools. Every call spawns a fresh process.
#[derive(Debug)]
pub struct OpenLavaCli {
    cfg: OpenLavaCliConfig,
}

enum LiveQuery {
    Found(Vec<JobView>),
    NotFound,
}

impl OpenLavaCli {
    /// Build the adapter.
    pub fn new(cfg: OpenLavaCliConfig) -> Self {
        Self { cfg }
    }

    /// Submit one job via `bsub`, enumerating array tasks afterwards.
    pub async fn submit(&self, spec: &JobSpec) -> Result<Vec<JobHandle>, SchedError> {
        let args = bsub_args(spec, &self.cfg.job_name);
        let out = run_tool(&self.cfg.bsub_command, &args)
            .await
            .map_err(|err| SchedError::submit(format!("{}: {err}", self.cfg.bsub_command)))?;
        if !out.success() {
            return Err(SchedError::submit(out.describe()));
        }
        let job_id = parse_bsub_output(&out.stdout).ok_or_else(|| {
            SchedError::submit(format!("unparseable bsub output: {}", out.stdout.trim()))
        })?;

        if spec.num_tasks > 1 {
            // The submission line only carries the array id; list the tasks.
            if let Some(handles) = self.enumerate_array(job_id, spec.num_tasks).await {
                return Ok(handles);
            }
            debug!(job_id, "array tasks not listable yet, synthesising handles");
        }
        Ok(spec.handles_for(job_id))
    }

    async fn enumerate_array(&self, job_id: u64, num_tasks: u32) -> Option<Vec<JobHandle>> {
        let args = vec!["-w".to_string(), "-a".to_string(), job_id.to_string()];
        let out = run_tool(&self.cfg.bjobs_command, &args).await.ok()?;
        if !out.success() {
            return None;
        }
        let mut handles: Vec<JobHandle> = parse_bjobs(&out.stdout, self.cfg.unknown_is_failed)
            .into_iter()
            .filter(|view| view.job_id == job_id && view.array_index > 0)
            .map(|view| view.handle())
            .collect();
        handles.sort();
        handles.dedup();
        (handles.len() == num_tasks as usize).then_some(handles)
    }

    /// All task views under one job id.
    ///
    /// Queries live state first, then accounting, retrying until the
    /// history deadline. An empty result means the deadline expired with
    /// the job missing from both; callers treat every task of the job as
    /// lost.
    pub async fn get_jobs(&self, job_id: u64) -> Result<Vec<JobView>, SchedError> {
        let deadline = tokio::time::Instant::now() + self.cfg.history_deadline;
        loop {
            if let LiveQuery::Found(views) = self.query_live(job_id).await? {
                return Ok(views);
            }
            if let Some(views) = self.query_history(job_id, None).await? {
                return Ok(views);
            }
            if tokio::time::Instant::now() >= deadline {
                debug!(job_id, "missing from live and accounting state past deadline");
                return Ok(Vec::new());
            }
            tokio::time::sleep(self.cfg.retry_interval).await;
        }
    }

    /// View of one task.
    pub async fn get_job(&self, job_id: u64, array_index: u32) -> Result<JobView, SchedError> {
        let deadline = tokio::time::Instant::now() + self.cfg.history_deadline;
        loop {
            if let LiveQuery::Found(views) = self.query_live(job_id).await? {
                if let Some(view) = views.into_iter().find(|v| v.array_index == array_index) {
                    return Ok(view);
                }
            }
            if let Some(views) = self.query_history(job_id, Some(array_index)).await? {
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

    /// Kill one task via `bkill`.
    pub async fn kill(&self, handle: JobHandle) -> Result<(), SchedError> {
        let args = vec![handle.to_string()];
        let out = run_tool(&self.cfg.bkill_command, &args)
            .await
            .map_err(|err| SchedError::kill(format!("{}: {err}", self.cfg.bkill_command)))?;
        if !out.success() {
            return Err(SchedError::kill(out.describe()));
        }
        Ok(())
    }

    async fn query_live(&self, job_id: u64) -> Result<LiveQuery, SchedError> {
        let args = vec!["-w".to_string(), "-a".to_string(), job_id.to_string()];
        let out = run_tool(&self.cfg.bjobs_command, &args)
            .await
            .map_err(|err| SchedError::transient(format!("{}: {err}", self.cfg.bjobs_command)))?;
        if out.success() {
            let views: Vec<JobView> = parse_bjobs(&out.stdout, self.cfg.unknown_is_failed)
                .into_iter()
                .filter(|view| view.job_id == job_id)
                .collect();
            if views.is_empty() {
                return Ok(LiveQuery::NotFound);
            }
            return Ok(LiveQuery::Found(views));
        }
        if output_says_not_found(&out.stdout) || output_says_not_found(&out.stderr) {
            return Ok(LiveQuery::NotFound);
        }
        Err(SchedError::transient(out.describe()))
    }

    async fn query_history(
        &self,
        job_id: u64,
        array_index: Option<u32>,
    ) -> Result<Option<Vec<JobView>>, SchedError> {
        let target = match array_index {
            Some(idx) if idx > 0 => format!("{job_id}[{idx}]"),
            _ => job_id.to_string(),
        };
        let args = vec!["-l".to_string(), target];
        let out = run_tool(&self.cfg.bhist_command, &args)
            .await
            .map_err(|err| SchedError::transient(format!("{}: {err}", self.cfg.bhist_command)))?;
        if !out.success() {
            if output_says_not_found(&out.stdout) || output_says_not_found(&out.stderr) {
                return Ok(None);
            }
            return Err(SchedError::transient(out.describe()));
        }
        Ok(parse_bhist(&out.stdout, job_id))
    }
}

fn bsub_args(spec: &JobSpec, job_name: &str) -> Vec<String> {
    let mut args = Vec::new();
    if spec.num_processors > 1 {
        args.push("-n".to_string());
        args.push(spec.num_processors.to_string());
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
        args.push("-J".to_string());
        args.push(format!("{job_name}[1-{}]", spec.num_tasks));
    }
    args.push(spec.command.clone());
    args
}

fn parse_bsub_output(stdout: &str) -> Option<u64> {
    let captures = BSUB_SUBMIT_RE.captures(stdout)?;
    captures[1].parse().ok()
}

/// `42` or `42[3]` from the first `bjobs` column.
fn parse_job_id_token(token: &str) -> Option<(u64, u32)> {
    match token.split_once('[') {
        None => Some((token.parse().ok()?, 0)),
        Some((id, rest)) => {
            let idx = rest.strip_suffix(']')?;
            Some((id.parse().ok()?, idx.parse().ok()?))
        }
    }
}

/// `bjobs -w -a` output: one task per line, job id first, state token
/// second. The header line and anything unparseable are skipped.
fn parse_bjobs(stdout: &str, unknown_is_failed: bool) -> Vec<JobView> {
    let mut views = Vec::new();
    for line in stdout.lines() {
        let mut fields = line.split_whitespace();
        let Some(id_token) = fields.next() else { continue };
        if id_token == "JOBID" {
            continue;
        }
        let Some((job_id, array_index)) = parse_job_id_token(id_token) else {
            continue;
        };
        let Some(state) = fields.next().and_then(|t| openlava_state(t, unknown_is_failed)) else {
            continue;
        };
        views.push(JobView::new(job_id, array_index, state));
    }
    views
}

fn output_says_not_found(text: &str) -> bool {
    text.contains("is not found") || text.contains("No matching job found")
}

/// `bhist -l` long-format output, split into per-task sections on the
/// `Job <id[idx]>` headers. Sections without a terminal marker are
/// ignored; `None` means the job was absent entirely.
fn parse_bhist(stdout: &str, job_id: u64) -> Option<Vec<JobView>> {
    let mut views = Vec::new();
    let mut current: Option<(u64, u32)> = None;
    let mut section = String::new();

    let flush = |current: &Option<(u64, u32)>, section: &str, views: &mut Vec<JobView>| {
        let Some((id, idx)) = *current else { return };
        if id != job_id {
            return;
        }
        let state = if section.contains("Done successfully") {
            JobState::Completed
        } else if section.contains("Exited by signal") {
            JobState::Killed
        } else if section.contains("Exited") {
            JobState::Failed
        } else {
            return;
        };
        views.push(JobView::new(id, idx, state));
    };

    for line in stdout.lines() {
        if let Some(captures) = BHIST_JOB_RE.captures(line) {
            flush(&current, &section, &mut views);
            section.clear();
            let id = captures[1].parse().ok();
            let idx = captures
                .get(2)
                .map_or(Some(0), |m| m.as_str().parse().ok());
            current = id.zip(idx);
        }
        section.push_str(line);
        section.push('\n');
    }
    flush(&current, &section, &mut views);

    if views.is_empty() { None } else { Some(views) }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BJOBS_ARRAY: &str = "\
JOBID   STAT    USER    QUEUE     FROM_HOST   EXEC_HOST   JOB_NAME          SUBMIT_TIME
42[1]   RUN     drivers normal    head01      node03      lavastorm[1-4]    Oct 10 10:10
42[2]   PEND    drivers normal    head01      -           lavastorm[1-4]    Oct 10 10:10
42[3]   DONE    drivers normal    head01      node04      lavastorm[1-4]    Oct 10 10:10
42[4]   EXIT    drivers normal    head01      node05      lavastorm[1-4]    Oct 10 10:10
";

    #[test]
    fn bsub_output_yields_job_id() {
        let out = "Job <1234> is submitted to default queue <normal>.\n";
        assert_eq!(parse_bsub_output(out), Some(1234));
        assert_eq!(parse_bsub_output("bsub: command not found"), None);
    }

    #[test]
    fn bjobs_table_parses_array_tasks() {
        let views = parse_bjobs(BJOBS_ARRAY, false);
        assert_eq!(views.len(), 4);
        assert_eq!(views[0], JobView::new(42, 1, JobState::Running));
        assert_eq!(views[1], JobView::new(42, 2, JobState::Pending));
        assert_eq!(views[2], JobView::new(42, 3, JobState::Completed));
        assert_eq!(views[3], JobView::new(42, 4, JobState::Failed));
    }

    #[test]
    fn bjobs_table_parses_plain_job_and_skips_garbage() {
        let text = "\
JOBID   STAT    USER
77      RUN     drivers
not-a-job-line
78      WAT     drivers
";
        let views = parse_bjobs(text, false);
        assert_eq!(views, vec![JobView::new(77, 0, JobState::Running)]);
    }

    #[test]
    fn unknown_state_switch_applies() {
        let text = "99 UNKWN drivers\n";
        assert_eq!(parse_bjobs(text, false)[0].state, JobState::Running);
        assert_eq!(parse_bjobs(text, true)[0].state, JobState::Failed);
    }

    #[test]
    fn job_id_tokens_parse() {
        assert_eq!(parse_job_id_token("42"), Some((42, 0)));
        assert_eq!(parse_job_id_token("42[7]"), Some((42, 7)));
        assert_eq!(parse_job_id_token("42["), None);
        assert_eq!(parse_job_id_token("forty"), None);
    }

    #[test]
    fn bsub_args_include_placement_and_array() {
        let spec = JobSpec {
            command: "sleep 30; exit 0".to_string(),
            num_processors: 4,
            num_tasks: 8,
            project: Some("chipdesign".to_string()),
            queue: Some("night".to_string()),
        };
        let args = bsub_args(&spec, "lavastorm");
        assert_eq!(
            args,
            vec![
                "-n", "4", "-P", "chipdesign", "-q", "night", "-J", "lavastorm[1-8]",
                "sleep 30; exit 0",
            ]
        );

        let plain = JobSpec::command("sleep 1; exit 0");
        assert_eq!(bsub_args(&plain, "lavastorm"), vec!["sleep 1; exit 0"]);
    }

    #[test]
    fn bhist_sections_classify_terminal_states() {
        let text = "\
Job <55>, Job Name <lavastorm>, User <drivers>
  Mon Oct 10 10:10:10: Submitted from host <head01>;
  Mon Oct 10 10:20:10: Done successfully. The CPU time used is 12.3 seconds;
";
        let views = parse_bhist(text, 55).expect("job present");
        assert_eq!(views, vec![JobView::new(55, 0, JobState::Completed)]);
    }

    #[test]
    fn bhist_splits_array_sections() {
        let text = "\
Job <55[1]>, Job Name <lavastorm[1]>, User <drivers>
  Mon Oct 10 10:20:10: Exited with exit code 1. The CPU time used is 2 seconds;

Job <55[2]>, Job Name <lavastorm[2]>, User <drivers>
  Mon Oct 10 10:21:10: Exited by signal 9;
";
        let views = parse_bhist(text, 55).expect("job present");
        assert_eq!(
            views,
            vec![
                JobView::new(55, 1, JobState::Failed),
                JobView::new(55, 2, JobState::Killed),
            ]
        );
    }

    #[test]
    fn bhist_without_terminal_marker_is_not_evidence() {
        let text = "Job <55>, Job Name <lavastorm>\n  Submitted from host <head01>;\n";
        assert_eq!(parse_bhist(text, 55), None);
        assert_eq!(parse_bhist("", 55), None);
    }

    #[test]
    fn not_found_markers_recognised() {
        assert!(output_says_not_found("Job <42> is not found\n"));
        assert!(output_says_not_found("No matching job found\n"));
        assert!(!output_says_not_found("bjobs: cannot connect to mbatchd"));
    }

    #[cfg(unix)]
    mod with_stub_tools {
        use super::*;
        use crate::error::SchedError;

        // `false` stands in for a bjobs that is broken (non-zero exit, no
        // "not found" marker); `echo` for tools that answer cleanly but
        // know nothing about the job.

        #[tokio::test]
        async fn broken_query_tool_is_transient_not_terminal() {
            let adapter = OpenLavaCli::new(OpenLavaCliConfig {
                bjobs_command: "false".to_string(),
                history_deadline: Duration::ZERO,
                ..Default::default()
            });
            let err = adapter.get_jobs(42).await.expect_err("query must fail");
            assert!(matches!(err, SchedError::TransientQueryFailure { .. }), "{err}");
        }

        #[tokio::test]
        async fn job_missing_everywhere_reports_lost_after_deadline() {
            let adapter = OpenLavaCli::new(OpenLavaCliConfig {
                bjobs_command: "echo".to_string(),
                bhist_command: "echo".to_string(),
                history_deadline: Duration::ZERO,
                ..Default::default()
            });
            assert_eq!(adapter.get_jobs(42).await.expect("query ok"), Vec::new());

            let view = adapter.get_job(42, 3).await.expect("query ok");
            assert!(view.was_killed() && view.is_failed());
            assert_eq!(view.handle(), JobHandle::new(42, 3));
        }

        #[tokio::test]
        async fn rejected_submission_reports_tool_output() {
            let adapter = OpenLavaCli::new(OpenLavaCliConfig {
                bsub_command: "false".to_string(),
                ..Default::default()
            });
            let spec = JobSpec::command("sleep 1; exit 0");
            let err = adapter.submit(&spec).await.expect_err("submit must fail");
            assert!(matches!(err, SchedError::SubmitRejected { .. }), "{err}");
        }
    }
}
