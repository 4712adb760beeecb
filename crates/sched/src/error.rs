//! Error taxonomy shared by every backend.

/// Classified failures of a scheduler backend.
///
/// Only configuration problems are fatal to the driver; everything else is
/// logged and folded into counters by the caller.
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    /// The submission command exited non-zero or its output could not be
    /// parsed. The submission is dropped, never retried.
    #[error("submission rejected: {detail}")]
    SubmitRejected {
        /// Backend output or parse failure description.
        detail: String,
    },

    /// A state query failed this tick; affected tasks keep their previous
    /// classification until the next poll.
    #[error("state query failed: {detail}")]
    TransientQueryFailure {
        /// Backend output or transport failure description.
        detail: String,
    },

    /// A kill request failed. Swallowed by callers; the job may have raced
    /// to completion.
    #[error("kill failed: {detail}")]
    KillFailed {
        /// Backend output or transport failure description.
        detail: String,
    },

    /// The backend cannot be constructed from the supplied configuration.
    #[error("scheduler configuration: {detail}")]
    Config {
        /// What was wrong with the configuration.
        detail: String,
    },
}

impl SchedError {
    pub(crate) fn submit(detail: impl Into<String>) -> Self {
        SchedError::SubmitRejected { detail: detail.into() }
    }

    pub(crate) fn transient(detail: impl Into<String>) -> Self {
        SchedError::TransientQueryFailure { detail: detail.into() }
    }

    pub(crate) fn kill(detail: impl Into<String>) -> Self {
        SchedError::KillFailed { detail: detail.into() }
    }

    /// Configuration-level failure; fatal to the driver.
    pub fn config(detail: impl Into<String>) -> Self {
        SchedError::Config { detail: detail.into() }
    }
}
