mod common;
pub mod sge;
pub mod slurm;

use itertools::Itertools;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::Map;
use crate::agent::AgentResult;
use crate::backend::sge::SgeDriver;
use crate::backend::slurm::SlurmDriver;
use crate::manifest::Manifest;
use crate::manifest::layout::{STDERR_FILE, STDOUT_FILE};

pub type BackendFuture<T> = Pin<Box<dyn Future<Output = AgentResult<T>> + Send>>;

/// State of a job as reported by the local scheduler, normalized across schedulers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendSignal {
    Ready,
    Run,
    Deleting,
    Completing,
    Error,
    Timeout,
    Deleted,
    /// The scheduler knows the job, but its status code has no meaning for the agent.
    Unrecognized(String),
}

impl BackendSignal {
    /// Rows of a single job (e.g. tasks of an array job) are folded into the signal with the
    /// highest precedence.
    fn precedence(&self) -> u8 {
        match self {
            BackendSignal::Error => 7,
            BackendSignal::Timeout => 6,
            BackendSignal::Deleted => 5,
            BackendSignal::Deleting => 4,
            BackendSignal::Run => 3,
            BackendSignal::Completing => 2,
            BackendSignal::Ready => 1,
            BackendSignal::Unrecognized(_) => 0,
        }
    }

    pub fn merge(self, other: BackendSignal) -> BackendSignal {
        if other.precedence() > self.precedence() {
            other
        } else {
            self
        }
    }
}

pub type JobStatusList = Vec<(String, BackendSignal)>;

/// Folds the scheduler listing into a single signal per backend job id.
pub fn fold_statuses(statuses: JobStatusList) -> Map<String, BackendSignal> {
    let mut result: Map<String, BackendSignal> = Map::with_capacity(statuses.len());
    for (job_id, signal) in statuses {
        let merged = match result.remove(&job_id) {
            Some(previous) => previous.merge(signal),
            None => signal,
        };
        result.insert(job_id, merged);
    }
    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    /// Name of the normalized log file in the working directory.
    pub fn file_name(&self) -> &'static str {
        match self {
            LogStream::Stdout => STDOUT_FILE,
            LogStream::Stderr => STDERR_FILE,
        }
    }
}

/// Adapter for a local batch scheduler.
///
/// Drivers do not keep any state between calls, so a single instance can be shared by
/// all workers of the agent.
pub trait BackendDriver: Send + Sync {
    fn name(&self) -> &str;

    /// Submits the script of the job from its working directory.
    ///
    /// Submission failures are not reported as errors: the returned manifest has
    /// `error_msg` filled in and no `local_job_id`.
    fn submit(&self, manifest: Manifest) -> Pin<Box<dyn Future<Output = Manifest> + Send>>;

    /// Lists all jobs known to the scheduler.
    /// Finished jobs may be missing from the result, their absence is interpreted by the caller.
    fn poll(&self) -> BackendFuture<JobStatusList>;

    /// Asks the scheduler to stop the job. A job that no longer exists is not an error.
    fn cancel(&self, manifest: Manifest, force: bool) -> BackendFuture<Manifest>;

    /// Copies the scheduler log files of the job into normalized `stdout`/`stderr` files
    /// (suffixed with `.<task-id>` for array jobs) in the job working directory.
    fn fetch_log(&self, manifest: &Manifest, stream: LogStream) -> BackendFuture<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sge,
    Slurm,
}

impl BackendKind {
    pub const ALL: [BackendKind; 2] = [BackendKind::Sge, BackendKind::Slurm];

    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Sge => "sge",
            BackendKind::Slurm => "slurm",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(name))
    }
}

/// Creates the driver registered under the given name.
pub fn create_backend(name: &str) -> crate::Result<Arc<dyn BackendDriver>> {
    match BackendKind::from_name(name) {
        Some(BackendKind::Sge) => Ok(Arc::new(SgeDriver)),
        Some(BackendKind::Slurm) => Ok(Arc::new(SlurmDriver)),
        None => Err(crate::Error::UnknownBackend(
            name.to_string(),
            BackendKind::ALL.iter().map(|kind| kind.name()).join(", "),
        )),
    }
}
