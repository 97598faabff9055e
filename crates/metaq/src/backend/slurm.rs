use std::future::Future;
use std::pin::Pin;

use crate::backend::common::{
    LogSource, LogTarget, cancel_job, copy_logs, run_command, split_options, submit_script,
};
use crate::backend::{
    BackendDriver, BackendFuture, BackendKind, BackendSignal, JobStatusList, LogStream,
};
use crate::manifest::Manifest;

/// Stderr file of a job, stdout uses the Slurm default `slurm-%j.out`.
const ERR_FILE_PATTERN: &str = "slurm-%j.err";
const ARRAY_ERR_FILE_PATTERN: &str = "slurm-%A_%a.err";

pub struct SlurmDriver;

impl BackendDriver for SlurmDriver {
    fn name(&self) -> &str {
        BackendKind::Slurm.name()
    }

    fn submit(&self, manifest: Manifest) -> Pin<Box<dyn Future<Output = Manifest> + Send>> {
        let arguments = build_sbatch_arguments(&manifest);
        Box::pin(submit_script(manifest, arguments, |output| {
            log::debug!("Sbatch output: {output}");
            output
                .lines()
                .map(|l| l.trim())
                .find(|l| l.to_lowercase().starts_with("submitted batch job"))
                .and_then(|l| l.split(' ').nth(3))
                .map(|l| l.to_string())
        }))
    }

    fn poll(&self) -> BackendFuture<JobStatusList> {
        Box::pin(async move {
            let arguments: Vec<String> = ["squeue", "-h", "-t", "all", "-o", "%i %t"]
                .into_iter()
                .map(|arg| arg.to_string())
                .collect();
            let output = run_command(&arguments, None).await?;
            Ok(parse_squeue_output(&output))
        })
    }

    fn cancel(&self, manifest: Manifest, force: bool) -> BackendFuture<Manifest> {
        Box::pin(async move {
            let Some(job_id) = manifest.local_job_id.clone() else {
                return Ok(manifest);
            };
            let mut arguments = vec!["scancel".to_string()];
            if force {
                arguments.push("--signal=KILL".to_string());
                arguments.push("--full".to_string());
            }
            arguments.push(job_id);
            cancel_job(manifest, arguments).await
        })
    }

    fn fetch_log(&self, manifest: &Manifest, stream: LogStream) -> BackendFuture<()> {
        let target = LogTarget::from_manifest(manifest);
        Box::pin(async move {
            let Some(target) = target else {
                return Ok(());
            };
            copy_logs(&target, stream, |name| {
                classify_log_file(name, &target.job_id, stream)
            })
            .await
        })
    }
}

fn build_sbatch_arguments(manifest: &Manifest) -> Vec<String> {
    let mut arguments = vec!["sbatch".to_string()];
    arguments.extend(split_options(&manifest.submit_opt));
    arguments.push("-e".to_string());
    if manifest.is_array_job() {
        arguments.push(ARRAY_ERR_FILE_PATTERN.to_string());
        arguments.push("-a".to_string());
        arguments.push(manifest.array_task_id.trim().to_string());
    } else {
        arguments.push(ERR_FILE_PATTERN.to_string());
    }
    arguments.extend(split_options(&manifest.submit_opt_local));
    arguments.push(manifest.submit_script().to_string());
    arguments
}

/// Parses `squeue -h -t all -o "%i %t"`. Array rows (`123_4`, `123_[5-10]`) are reported under
/// the id of the whole array job. Completed jobs are left out.
fn parse_squeue_output(output: &str) -> JobStatusList {
    output
        .lines()
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            let job_id = columns.next()?;
            let state = columns.next()?;
            let job_id = job_id.split('_').next()?;
            if job_id.is_empty() || !job_id.bytes().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let signal = match state {
                "R" => BackendSignal::Run,
                "PD" | "CF" | "S" => BackendSignal::Ready,
                "F" | "NF" => BackendSignal::Error,
                "CG" => BackendSignal::Completing,
                "TO" => BackendSignal::Timeout,
                "CA" => BackendSignal::Deleted,
                "CD" | "PR" => return None,
                _ => BackendSignal::Unrecognized(state.to_string()),
            };
            Some((job_id.to_string(), signal))
        })
        .collect()
}

/// `slurm-<job-id>.out` for whole jobs, `slurm-<job-id>_<task-id>.out` for array tasks.
fn classify_log_file(name: &str, job_id: &str, stream: LogStream) -> Option<LogSource> {
    let extension = match stream {
        LogStream::Stdout => ".out",
        LogStream::Stderr => ".err",
    };
    let rest = name
        .strip_prefix("slurm-")?
        .strip_suffix(extension)?
        .strip_prefix(job_id)?;
    if rest.is_empty() {
        return Some(LogSource::Job);
    }
    let task = rest.strip_prefix('_')?;
    if !task.is_empty() && task.bytes().all(|c| c.is_ascii_digit()) {
        Some(LogSource::Task(task.to_string()))
    } else {
        None
    }
}
