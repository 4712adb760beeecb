//! Tagged scheduler variants and dispatch.

use crate::error::SchedError;
use crate::job::{JobHandle, JobSpec, JobView};
use crate::openlava_cli::OpenLavaCli;
use crate::openlava_web::OpenLavaWeb;
use crate::sge_cli::SgeCli;

#[cfg(feature = "fake")]
use crate::fake::FakeCluster;

/// A scheduler backend.
///
/// One tagged variant per backend; the capability set is `submit`,
/// `get_jobs`, `get_job`, `kill`. The driver holds exactly one of these
/// for the process lifetime.
#[derive(Debug)]
pub enum Scheduler {
    /// OpenLava through `bsub`/`bjobs`/`bhist`/`bkill`.
    OpenLavaCli(OpenLavaCli),
    /// Sun Grid Engine through `qsub`/`qstat`/`qacct`/`qdel`.
    SgeCli(SgeCli),
    /// OpenLava through the openlava-web REST bridge.
    OpenLavaWeb(OpenLavaWeb),
    /// Scripted in-memory cluster for tests.
    #[cfg(feature = "fake")]
    Fake(FakeCluster),
}

impl Scheduler {
    /// Submit one job, returning one handle per task.
    pub async fn submit(&self, spec: &JobSpec) -> Result<Vec<JobHandle>, SchedError> {
        match self {
            Scheduler::OpenLavaCli(backend) => backend.submit(spec).await,
            Scheduler::SgeCli(backend) => backend.submit(spec).await,
            Scheduler::OpenLavaWeb(backend) => backend.submit(spec).await,
            #[cfg(feature = "fake")]
            Scheduler::Fake(backend) => backend.submit(spec).await,
        }
    }

    /// All task views under one job id. An empty result means the backend
    /// has no record of the job left; callers classify those tasks as
    /// lost.
    pub async fn get_jobs(&self, job_id: u64) -> Result<Vec<JobView>, SchedError> {
        match self {
            Scheduler::OpenLavaCli(backend) => backend.get_jobs(job_id).await,
            Scheduler::SgeCli(backend) => backend.get_jobs(job_id).await,
            Scheduler::OpenLavaWeb(backend) => backend.get_jobs(job_id).await,
            #[cfg(feature = "fake")]
            Scheduler::Fake(backend) => backend.get_jobs(job_id).await,
        }
    }

    /// View of one task.
    pub async fn get_job(&self, job_id: u64, array_index: u32) -> Result<JobView, SchedError> {
        match self {
            Scheduler::OpenLavaCli(backend) => backend.get_job(job_id, array_index).await,
            Scheduler::SgeCli(backend) => backend.get_job(job_id, array_index).await,
            Scheduler::OpenLavaWeb(backend) => backend.get_job(job_id, array_index).await,
            #[cfg(feature = "fake")]
            Scheduler::Fake(backend) => backend.get_job(job_id, array_index).await,
        }
    }

    /// Fire-and-forget kill of one task.
    pub async fn kill(&self, handle: JobHandle) -> Result<(), SchedError> {
        match self {
            Scheduler::OpenLavaCli(backend) => backend.kill(handle).await,
            Scheduler::SgeCli(backend) => backend.kill(handle).await,
            Scheduler::OpenLavaWeb(backend) => backend.kill(handle).await,
            #[cfg(feature = "fake")]
            Scheduler::Fake(backend) => backend.kill(handle).await,
        }
    }
}

impl From<OpenLavaCli> for Scheduler {
    fn from(backend: OpenLavaCli) -> Self {
        Scheduler::OpenLavaCli(backend)
    }
}

impl From<SgeCli> for Scheduler {
    fn from(backend: SgeCli) -> Self {
        Scheduler::SgeCli(backend)
    }
}

impl From<OpenLavaWeb> for Scheduler {
    fn from(backend: OpenLavaWeb) -> Self {
        Scheduler::OpenLavaWeb(backend)
    }
}

#[cfg(feature = "fake")]
impl From<FakeCluster> for Scheduler {
    fn from(backend: FakeCluster) -> Self {
        Scheduler::Fake(backend)
    }
}
