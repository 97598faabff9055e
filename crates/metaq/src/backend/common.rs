use anyhow::Context;
use bstr::ByteSlice;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;

use crate::agent::AgentResult;
use crate::backend::LogStream;
use crate::common::utils::fs::{file_name_str, list_files};
use crate::manifest::Manifest;

pub fn create_command(arguments: &[String], workdir: Option<&Path>) -> Command {
    let mut command = Command::new(&arguments[0]);
    command.args(&arguments[1..]);
    if let Some(workdir) = workdir {
        command.current_dir(workdir);
    }
    command
}

pub fn check_command_output(output: Output) -> AgentResult<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}

/// Runs a scheduler command and returns its trimmed stdout.
pub async fn run_command(arguments: &[String], workdir: Option<&Path>) -> AgentResult<String> {
    let program = &arguments[0];
    log::debug!("Running command `{}`", arguments.join(" "));
    let output = create_command(arguments, workdir)
        .output()
        .await
        .with_context(|| format!("{program} start failed"))?;
    let output =
        check_command_output(output).with_context(|| format!("{program} execution failed"))?;
    let stdout = output
        .stdout
        .to_str()
        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 {} output: {:?}", program, e))?;
    Ok(stdout.trim().to_string())
}

/// Splits user-provided scheduler options on whitespace.
pub fn split_options(options: &str) -> impl Iterator<Item = String> + '_ {
    options.split_whitespace().map(|option| option.to_string())
}

/// Returns the value that follows `option` in the argument list.
pub fn option_value<'a>(arguments: &'a [String], option: &str) -> Option<&'a str> {
    arguments
        .iter()
        .position(|argument| argument == option)
        .and_then(|index| arguments.get(index + 1))
        .map(|value| value.as_str())
}

/// Submits the job script from its working directory and records the outcome in the manifest.
pub async fn submit_script<F>(mut manifest: Manifest, arguments: Vec<String>, get_job_id: F) -> Manifest
where
    F: FnOnce(&str) -> Option<String>,
{
    manifest.submit_command = arguments.join(" ");
    if let Some(group) = option_value(&arguments, "-g") {
        manifest.local_group = group.to_string();
    }

    match run_submit(&manifest, &arguments, get_job_id).await {
        Ok(job_id) => {
            log::info!("[{}] Submitted as local job {job_id}", manifest.uuid);
            manifest.local_job_id = Some(job_id);
        }
        Err(error) => {
            log::warn!("[{}] Submission failed: {error:?}", manifest.uuid);
            manifest.local_job_id = None;
            manifest.error_msg = format!("{error:#}");
        }
    }
    manifest
}

async fn run_submit<F>(manifest: &Manifest, arguments: &[String], get_job_id: F) -> AgentResult<String>
where
    F: FnOnce(&str) -> Option<String>,
{
    let workdir = manifest
        .work_dir()
        .context("Working directory of the job is not set")?;
    let output = run_command(arguments, Some(workdir)).await?;
    get_job_id(&output)
        .ok_or_else(|| anyhow::anyhow!("Missing job id in {} output\n{output}", arguments[0]))
}

/// Runs a cancel command. A failing command is only logged, because the job has usually
/// finished in the meantime.
pub async fn cancel_job(manifest: Manifest, arguments: Vec<String>) -> AgentResult<Manifest> {
    let workdir = manifest.work_dir().filter(|dir| dir.is_dir());
    log::debug!(
        "[{}] Running command `{}`",
        manifest.uuid,
        arguments.join(" ")
    );
    let output = create_command(&arguments, workdir)
        .output()
        .await
        .with_context(|| format!("{} start failed", arguments[0]))?;
    if let Err(error) = check_command_output(output) {
        log::warn!(
            "[{}] {} failed, the job has probably finished already: {error:?}",
            manifest.uuid,
            arguments[0]
        );
    }
    Ok(manifest)
}

/// Origin of a raw scheduler log file.
#[derive(Debug, PartialEq, Eq)]
pub enum LogSource {
    Job,
    Task(String),
}

/// Job data needed to collect its logs.
pub struct LogTarget {
    pub uuid: String,
    pub workdir: PathBuf,
    pub job_id: String,
}

impl LogTarget {
    pub fn from_manifest(manifest: &Manifest) -> Option<Self> {
        Some(Self {
            uuid: manifest.uuid.clone(),
            workdir: manifest.work_dir()?.to_path_buf(),
            job_id: manifest.local_job_id.clone()?,
        })
    }
}

/// Copies raw log files recognized by `classify` to their normalized names.
pub async fn copy_logs<F>(target: &LogTarget, stream: LogStream, classify: F) -> AgentResult<()>
where
    F: Fn(&str) -> Option<LogSource>,
{
    if !target.workdir.is_dir() {
        return Ok(());
    }
    let files = list_files(&target.workdir)
        .with_context(|| format!("Cannot list {}", target.workdir.display()))?;
    for path in files {
        let Some(name) = file_name_str(&path) else {
            continue;
        };
        let dest = match classify(name) {
            Some(LogSource::Job) => stream.file_name().to_string(),
            Some(LogSource::Task(task)) => format!("{}.{task}", stream.file_name()),
            None => continue,
        };
        tokio::fs::copy(&path, target.workdir.join(&dest))
            .await
            .with_context(|| format!("Cannot copy log file {}", path.display()))?;
        log::debug!("[{}] Log file {dest} updated from {name}", target.uuid);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        LogSource, LogTarget, cancel_job, copy_logs, option_value, run_command, submit_script,
    };
    use crate::backend::LogStream;
    use crate::manifest::{Manifest, ScriptType};
    use tempfile::TempDir;

    fn args(args: &[&str]) -> Vec<String> {
        args.iter().map(|arg| arg.to_string()).collect()
    }

    fn manifest(workdir: &std::path::Path) -> Manifest {
        let mut manifest = Manifest::new("abc".into(), "job.sh".into(), ScriptType::Local);
        manifest.work_dir = workdir.display().to_string();
        manifest
    }

    #[test]
    fn find_option_value() {
        let arguments = args(&["qsub", "-g", "grp", "-l", "x", "-g"]);
        assert_eq!(option_value(&arguments, "-g"), Some("grp"));
        assert_eq!(option_value(&arguments, "-l"), Some("x"));
        assert_eq!(option_value(&arguments, "-t"), None);
    }

    #[tokio::test]
    async fn run_failing_command() {
        let error = run_command(&args(&["sh", "-c", "echo foo >&2; exit 3"]), None)
            .await
            .unwrap_err();
        let message = format!("{error:?}");
        assert!(message.contains("Exit code: 3"));
        assert!(message.contains("foo"));
    }

    #[tokio::test]
    async fn submit_records_job_id_and_command() {
        let dir = TempDir::with_prefix("metaq").unwrap();
        let manifest = submit_script(
            manifest(dir.path()),
            args(&["sh", "-c", "echo 'Job 42'", "-g", "grp"]),
            |output| output.strip_prefix("Job ").map(|id| id.to_string()),
        )
        .await;
        assert_eq!(manifest.local_job_id.as_deref(), Some("42"));
        assert_eq!(manifest.local_group, "grp");
        assert_eq!(manifest.submit_command, "sh -c echo 'Job 42' -g grp");
        assert!(manifest.error_msg.is_empty());
    }

    #[tokio::test]
    async fn submit_failure_sets_error() {
        let dir = TempDir::with_prefix("metaq").unwrap();
        let manifest = submit_script(
            manifest(dir.path()),
            args(&["sh", "-c", "echo 'invalid queue' >&2; exit 1"]),
            |output| Some(output.to_string()),
        )
        .await;
        assert_eq!(manifest.local_job_id, None);
        assert!(manifest.error_msg.contains("invalid queue"));
    }

    #[tokio::test]
    async fn submit_without_job_id_in_output() {
        let dir = TempDir::with_prefix("metaq").unwrap();
        let manifest = submit_script(
            manifest(dir.path()),
            args(&["sh", "-c", "echo hello"]),
            |_| None,
        )
        .await;
        assert_eq!(manifest.local_job_id, None);
        assert!(manifest.error_msg.contains("Missing job id"));
    }

    #[tokio::test]
    async fn cancel_ignores_failure() {
        let dir = TempDir::with_prefix("metaq").unwrap();
        let manifest = cancel_job(manifest(dir.path()), args(&["sh", "-c", "exit 1"]))
            .await
            .unwrap();
        assert_eq!(manifest.uuid, "abc");
    }

    #[tokio::test]
    async fn copy_job_and_task_logs() {
        let dir = TempDir::with_prefix("metaq").unwrap();
        std::fs::write(dir.path().join("raw-1.out"), "job").unwrap();
        std::fs::write(dir.path().join("raw-1_2.out"), "task").unwrap();
        std::fs::write(dir.path().join("unrelated"), "x").unwrap();
        let target = LogTarget {
            uuid: "abc".into(),
            workdir: dir.path().to_path_buf(),
            job_id: "1".into(),
        };
        copy_logs(&target, LogStream::Stdout, |name| match name {
            "raw-1.out" => Some(LogSource::Job),
            "raw-1_2.out" => Some(LogSource::Task("2".into())),
            _ => None,
        })
        .await
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("stdout")).unwrap(),
            "job"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("stdout.2")).unwrap(),
            "task"
        );
        assert!(!dir.path().join("stderr").exists());
    }

    #[tokio::test]
    async fn copy_logs_without_workdir() {
        let target = LogTarget {
            uuid: "abc".into(),
            workdir: "/nonexistent/metaq".into(),
            job_id: "1".into(),
        };
        copy_logs(&target, LogStream::Stderr, |_| Some(LogSource::Job))
            .await
            .unwrap();
    }
}
