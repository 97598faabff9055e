//! Lifecycle rules of a job: how backend signals and cancellation requests move the
//! manifest state.
use chrono::TimeDelta;
use std::time::Duration;

use crate::backend::BackendSignal;
use crate::manifest::{JobState, Timestamp, parse_time};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollAction {
    /// Nothing has changed.
    Keep,
    /// The job keeps running, only its logs are refreshed.
    RefreshLogs,
    /// Move into a non-terminal state.
    Advance(JobState),
    /// The scheduler reported a terminal state.
    Finalize(JobState),
    /// The scheduler does not list the job anymore, its output is staged out and the job
    /// becomes DONE.
    StageOut,
}

/// Decides what happens with a submitted job based on its scheduler signal.
/// `None` means that the scheduler does not know the job.
pub fn poll_action(state: JobState, signal: Option<&BackendSignal>) -> PollAction {
    if !state.is_submitted() {
        return PollAction::Keep;
    }
    let Some(signal) = signal else {
        return PollAction::StageOut;
    };
    match signal {
        BackendSignal::Run => match state {
            JobState::Ready => PollAction::Advance(JobState::Run),
            _ => PollAction::RefreshLogs,
        },
        BackendSignal::Deleting => match state {
            JobState::Ready | JobState::Run | JobState::Completing => {
                PollAction::Advance(JobState::Deleting)
            }
            _ => PollAction::Keep,
        },
        BackendSignal::Completing => match state {
            JobState::Ready | JobState::Run | JobState::Deleting => {
                PollAction::Advance(JobState::Completing)
            }
            _ => PollAction::Keep,
        },
        BackendSignal::Error => PollAction::Finalize(JobState::Error),
        BackendSignal::Timeout => PollAction::Finalize(JobState::Timeout),
        BackendSignal::Deleted => PollAction::Finalize(JobState::Deleted),
        // A queued signal never moves a job backwards.
        BackendSignal::Ready | BackendSignal::Unrecognized(_) => PollAction::Keep,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAction {
    /// The job was never submitted, it is deleted right away.
    Delete,
    /// The scheduler does not know the job anymore, it is finished through the poll path.
    Skip,
    /// Send a graceful cancel. If `mark_time` is set, the request time has to be written
    /// into the marker.
    Graceful { mark_time: bool },
    /// A graceful cancel was already sent and the grace period has not passed yet.
    Wait,
    /// The grace period has passed, cancel forcibly.
    Force,
}

/// Decides how to handle a cancellation marker with the given content.
pub fn cancel_action(
    state: JobState,
    listed: bool,
    marker: &str,
    now: Timestamp,
    grace_period: Duration,
) -> CancelAction {
    if state == JobState::Init {
        return CancelAction::Delete;
    }
    if !listed {
        return CancelAction::Skip;
    }
    let Some(requested_at) = parse_time(marker) else {
        return CancelAction::Graceful { mark_time: true };
    };
    let grace_period = TimeDelta::from_std(grace_period).unwrap_or(TimeDelta::MAX);
    if now.signed_duration_since(requested_at) >= grace_period {
        CancelAction::Force
    } else if state != JobState::Deleting {
        CancelAction::Graceful { mark_time: false }
    } else {
        CancelAction::Wait
    }
}
