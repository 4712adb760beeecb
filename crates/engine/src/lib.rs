#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Workload driver for `lavastorm` (demand shaping, submission scheduling,
//! reconciliation against a scheduler backend).

/// Public API for the driver crate.
pub mod api;

mod engine;
mod profile;
mod queue;

pub use api::{
    start_driver, DriverConfig, DriverHandle, DriverStopper, OfficeHours, ProfileConfig,
    RunSummary, WorkloadConfig,
};
pub use queue::PendingSubmission;
