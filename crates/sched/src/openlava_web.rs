//! OpenLava web bridge (REST) adapter.
//!
//! Speaks JSON to an openlava-web service. One session is authenticated at
//! connect time and its bearer token reused for every call; there is no
//! per-request login.

use std::time::Duration;

use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SchedError;
use crate::job::{JobHandle, JobSpec, JobView};
use crate::states::openlava_state;

/// Configuration of the web bridge adapter.
#[derive(Debug, Clone)]
pub struct OpenLavaWebConfig {
    /// Base URL of the bridge (e.g. `http://head01:8080/olweb/`).
    pub url: String,
    /// Login user.
    pub username: String,
    /// Login password.
    pub password: String,
    /// Classify `UNKWN`/`ZOMBI` as failed instead of running.
    pub unknown_is_failed: bool,
}

/// Adapter driving an OpenLava cluster through the openlava-web REST
/// bridge.
#[derive(Debug)]
pub struct OpenLavaWeb {
    http: reqwest::Client,
    base: Url,
    token: String,
    unknown_is_failed: bool,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: String,
}

/// Prefer the bridge's structured error message when it sends one.
fn error_detail(status: StatusCode, body: &str) -> String {
    if let Ok(err) = serde_json::from_str::<ApiErrorBody>(body) {
        return format!("http {status}: {}", err.error);
    }
    format!("http {status}: {body}")
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    command: &'a str,
    num_processors: u32,
    num_tasks: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    project: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SubmittedJobDto {
    job_id: u64,
    #[serde(default)]
    array_index: u32,
}

#[derive(Debug, Deserialize)]
struct JobDto {
    job_id: u64,
    #[serde(default)]
    array_index: u32,
    state: String,
}

impl JobDto {
    fn view(&self, unknown_is_failed: bool) -> Option<JobView> {
        let state = openlava_state(&self.state, unknown_is_failed)?;
        Some(JobView::new(self.job_id, self.array_index, state))
    }
}

impl OpenLavaWeb {
    /// Build the adapter and authenticate the session.
    pub async fn connect(cfg: OpenLavaWebConfig) -> Result<Self, SchedError> {
        let mut raw = cfg.url.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw)
            .map_err(|err| SchedError::config(format!("invalid bridge url {raw:?}: {err}")))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| SchedError::config(format!("build http client: {err}")))?;

        let url = base
            .join("users/login")
            .map_err(|err| SchedError::config(format!("login url: {err}")))?;
        let res = http
            .post(url)
            .json(&LoginRequest { username: &cfg.username, password: &cfg.password })
            .send()
            .await
            .map_err(|err| SchedError::config(format!("login: {err}")))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(SchedError::config(format!("login rejected: http {status}: {body}")));
        }
        let login: LoginResponse = res
            .json()
            .await
            .map_err(|err| SchedError::config(format!("login response: {err}")))?;

        Ok(Self {
            http,
            base,
            token: login.token,
            unknown_is_failed: cfg.unknown_is_failed,
        })
    }

    /// Submit one job. The bridge returns one descriptor per task.
    pub async fn submit(&self, spec: &JobSpec) -> Result<Vec<JobHandle>, SchedError> {
        let url = self
            .base
            .join("jobs/submit")
            .map_err(|err| SchedError::submit(format!("submit url: {err}")))?;
        let res = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&SubmitRequest {
                command: &spec.command,
                num_processors: spec.num_processors,
                num_tasks: spec.num_tasks,
                project: spec.project.as_deref(),
                queue: spec.queue.as_deref(),
            })
            .send()
            .await
            .map_err(|err| SchedError::submit(err.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(SchedError::submit(error_detail(status, &body)));
        }
        let submitted: Vec<SubmittedJobDto> = res
            .json()
            .await
            .map_err(|err| SchedError::submit(format!("submit response: {err}")))?;
        Ok(submitted
            .into_iter()
            .map(|dto| JobHandle::new(dto.job_id, dto.array_index))
            .collect())
    }

    /// All task views under one job id; empty when the bridge no longer
    /// knows the job.
    pub async fn get_jobs(&self, job_id: u64) -> Result<Vec<JobView>, SchedError> {
        let url = self
            .base
            .join(&format!("jobs/{job_id}"))
            .map_err(|err| SchedError::transient(format!("query url: {err}")))?;
        let res = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| SchedError::transient(err.to_string()))?;
        if res.status() == StatusCode::NOT_FOUND {
            debug!(job_id, "bridge has no record of job");
            return Ok(Vec::new());
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(SchedError::transient(error_detail(status, &body)));
        }
        let jobs: Vec<JobDto> = res
            .json()
            .await
            .map_err(|err| SchedError::transient(format!("query response: {err}")))?;
        Ok(jobs
            .iter()
            .filter_map(|dto| dto.view(self.unknown_is_failed))
            .collect())
    }

    /// View of one task; lost when the bridge no longer knows it.
    pub async fn get_job(&self, job_id: u64, array_index: u32) -> Result<JobView, SchedError> {
        let url = self
            .base
            .join(&format!("jobs/{job_id}/{array_index}"))
            .map_err(|err| SchedError::transient(format!("query url: {err}")))?;
        let res = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| SchedError::transient(err.to_string()))?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(JobView::lost(job_id, array_index));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(SchedError::transient(error_detail(status, &body)));
        }
        let dto: JobDto = res
            .json()
            .await
            .map_err(|err| SchedError::transient(format!("query response: {err}")))?;
        dto.view(self.unknown_is_failed)
            .ok_or_else(|| SchedError::transient(format!("unknown state token {:?}", dto.state)))
    }

    /// Kill one task.
    pub async fn kill(&self, handle: JobHandle) -> Result<(), SchedError> {
        let url = self
            .base
            .join(&format!("jobs/{}/{}/kill", handle.job_id, handle.array_index))
            .map_err(|err| SchedError::kill(format!("kill url: {err}")))?;
        let res = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| SchedError::kill(err.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(SchedError::kill(error_detail(status, &body)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;

    #[test]
    fn submission_descriptors_deserialize() {
        let body = r#"[
            {"job_id": 42, "array_index": 1},
            {"job_id": 42, "array_index": 2}
        ]"#;
        let dtos: Vec<SubmittedJobDto> = serde_json::from_str(body).expect("valid json");
        assert_eq!(dtos.len(), 2);
        assert_eq!(dtos[0].job_id, 42);
        assert_eq!(dtos[1].array_index, 2);
    }

    #[test]
    fn job_descriptors_map_to_views() {
        let body = r#"{"job_id": 7, "array_index": 0, "state": "RUN"}"#;
        let dto: JobDto = serde_json::from_str(body).expect("valid json");
        assert_eq!(dto.view(false), Some(JobView::new(7, 0, JobState::Running)));

        let zombi: JobDto =
            serde_json::from_str(r#"{"job_id": 7, "state": "ZOMBI"}"#).expect("valid json");
        assert_eq!(zombi.view(false), Some(JobView::new(7, 0, JobState::Running)));
        assert_eq!(zombi.view(true), Some(JobView::new(7, 0, JobState::Failed)));

        let bogus: JobDto =
            serde_json::from_str(r#"{"job_id": 7, "state": "WAT"}"#).expect("valid json");
        assert_eq!(bogus.view(false), None);
    }
}
