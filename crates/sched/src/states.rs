use crate::job::JobState;

/// OpenLava `bjobs` state tokens, normalised.
///
/// `UNKWN` and `ZOMBI` are optimistically treated as still running unless
/// `unknown_is_failed` is set; truly-lost jobs otherwise pin active-job
/// counters forever.
pub(crate) fn openlava_state(token: &str, unknown_is_failed: bool) -> Option<JobState> {
    let state = match token {
        "PEND" => JobState::Pending,
        "RUN" => JobState::Running,
        "PSUSP" | "USUSP" | "SSUSP" => JobState::Suspended,
        "DONE" => JobState::Completed,
        "EXIT" => JobState::Failed,
        "UNKWN" | "ZOMBI" => {
            if unknown_is_failed {
                JobState::Failed
            } else {
                JobState::Running
            }
        }
        _ => return None,
    };
    Some(state)
}

/// SGE `qstat` state strings (`qw`, `r`, `Eqw`, ...), normalised.
pub(crate) fn sge_state(token: &str) -> Option<JobState> {
    if token.is_empty() {
        return None;
    }
    if token.starts_with('E') {
        return Some(JobState::Failed);
    }
    if token.starts_with('d') {
        // Deletion in progress (dr, dt, ...).
        return Some(JobState::Killed);
    }
    if token.contains('s') || token.contains('S') || token.contains('T') {
        return Some(JobState::Suspended);
    }
    if token.contains('r') || token.contains('t') {
        return Some(JobState::Running);
    }
    if token.contains('w') || token.contains('h') {
        return Some(JobState::Pending);
    }
    None
}

/// SGE accounting records: `exit_status` and `failed` keys from `qacct`.
pub(crate) fn sge_accounting_state(exit_status: i64, failed: i64) -> JobState {
    if exit_status == 0 && failed == 0 {
        JobState::Completed
    } else {
        JobState::Failed
    }
}
