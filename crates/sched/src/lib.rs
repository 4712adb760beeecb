#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Scheduler adapters for `lavastorm` (job submission, state queries, kills).
//!
//! Every backend — the OpenLava and SGE command-line tools and the
//! openlava-web REST bridge — is presented through the same small
//! capability set: submit a [`JobSpec`], query the [`JobView`]s under a
//! job id, kill a [`JobHandle`].

/// Job lifecycle model shared by every backend.
pub mod job;

/// Error taxonomy shared by every backend.
pub mod error;

/// Tagged scheduler variants and dispatch.
pub mod scheduler;

mod openlava_cli;
mod proc;
mod sge_cli;
mod states;

/// OpenLava web bridge (REST) adapter.
pub mod openlava_web;

#[cfg(feature = "fake")]
pub mod fake;

pub use error::SchedError;
pub use job::{JobHandle, JobSpec, JobState, JobView};
pub use openlava_cli::{OpenLavaCli, OpenLavaCliConfig};
pub use openlava_web::{OpenLavaWeb, OpenLavaWebConfig};
pub use scheduler::Scheduler;
pub use sge_cli::{SgeCli, SgeCliConfig};
