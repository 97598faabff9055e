//! Driver for grid-engine style schedulers (`qsub`, `qstat`, `qdel`).
use std::future::Future;
use std::pin::Pin;

use crate::backend::common::{
    LogSource, LogTarget, cancel_job, copy_logs, run_command, split_options, submit_script,
};
use crate::backend::{
    BackendDriver, BackendFuture, BackendKind, BackendSignal, JobStatusList, LogStream,
};
use crate::manifest::Manifest;

pub struct SgeDriver;

impl BackendDriver for SgeDriver {
    fn name(&self) -> &str {
        BackendKind::Sge.name()
    }

    fn submit(&self, manifest: Manifest) -> Pin<Box<dyn Future<Output = Manifest> + Send>> {
        let arguments = build_qsub_arguments(&manifest);
        Box::pin(submit_script(manifest, arguments, parse_qsub_output))
    }

    fn poll(&self) -> BackendFuture<JobStatusList> {
        Box::pin(async move {
            let output = run_command(&["qstat".to_string()], None).await?;
            Ok(parse_qstat_output(&output))
        })
    }

    fn cancel(&self, manifest: Manifest, force: bool) -> BackendFuture<Manifest> {
        Box::pin(async move {
            let Some(job_id) = manifest.local_job_id.clone() else {
                return Ok(manifest);
            };
            let mut arguments = vec!["qdel".to_string()];
            if force {
                arguments.push("-f".to_string());
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

fn build_qsub_arguments(manifest: &Manifest) -> Vec<String> {
    let mut arguments = vec!["qsub".to_string(), "-cwd".to_string()];
    arguments.extend(split_options(&manifest.submit_opt));
    if manifest.is_array_job() {
        arguments.push("-t".to_string());
        arguments.push(manifest.array_task_id.trim().to_string());
    }
    arguments.extend(split_options(&manifest.submit_opt_local));
    arguments.push(manifest.submit_script().to_string());
    arguments
}

/// Extracts the job id from `Your job 123 ("job.sh") has been submitted`
/// or `Your job-array 123.1-4:1 ("job.sh") has been submitted`.
fn parse_qsub_output(output: &str) -> Option<String> {
    output
        .lines()
        .map(|line| line.trim())
        .find_map(|line| {
            if let Some(rest) = line.strip_prefix("Your job-array ") {
                rest.split_whitespace().next()?.split('.').next()
            } else {
                line.strip_prefix("Your job ")?.split_whitespace().next()
            }
        })
        .filter(|id| !id.is_empty() && id.bytes().all(|c| c.is_ascii_digit()))
        .map(|id| id.to_string())
}

/// Parses the default `qstat` table. The state is the fifth column.
fn parse_qstat_output(output: &str) -> JobStatusList {
    output
        .lines()
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            let job_id = columns.next()?;
            if !job_id.bytes().all(|c| c.is_ascii_digit()) {
                // Header or separator line
                return None;
            }
            let state = columns.nth(3)?;
            Some((job_id.to_string(), parse_sge_state(state)))
        })
        .collect()
}

fn parse_sge_state(state: &str) -> BackendSignal {
    if state.contains('E') {
        BackendSignal::Error
    } else if state.starts_with('d') {
        BackendSignal::Deleting
    } else if state.contains('r') || state.contains('t') {
        BackendSignal::Run
    } else if state.contains('q') {
        BackendSignal::Ready
    } else {
        BackendSignal::Unrecognized(state.to_string())
    }
}

/// Grid engine writes `<name>.o<job-id>` and `<name>.e<job-id>`, array tasks get
/// an additional `.<task-id>` suffix.
fn classify_log_file(name: &str, job_id: &str, stream: LogStream) -> Option<LogSource> {
    let kind = match stream {
        LogStream::Stdout => 'o',
        LogStream::Stderr => 'e',
    };
    let marker = format!(".{kind}{job_id}");
    let index = name.rfind(&marker)?;
    if index == 0 {
        return None;
    }
    let rest = &name[index + marker.len()..];
    if rest.is_empty() {
        return Some(LogSource::Job);
    }
    let task = rest.strip_prefix('.')?;
    if !task.is_empty() && task.bytes().all(|c| c.is_ascii_digit()) {
        Some(LogSource::Task(task.to_string()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{build_qsub_arguments, classify_log_file, parse_qstat_output, parse_qsub_output};
    use crate::backend::common::LogSource;
    use crate::backend::{BackendSignal, LogStream};
    use crate::manifest::{Manifest, ScriptType};

    #[test]
    fn qsub_arguments() {
        let mut manifest = Manifest::new("abc".into(), "job.sh".into(), ScriptType::Local);
        manifest.submit_opt = "-g grp  -l rt_F=1".into();
        assert_eq!(
            build_qsub_arguments(&manifest),
            vec!["qsub", "-cwd", "-g", "grp", "-l", "rt_F=1", "job.sh"]
        );

        manifest.array_task_id = "1-4:1".into();
        manifest.submit_opt_local = "-N foo".into();
        manifest.local_name = "job_local.sh".into();
        assert_eq!(
            build_qsub_arguments(&manifest),
            vec![
                "qsub",
                "-cwd",
                "-g",
                "grp",
                "-l",
                "rt_F=1",
                "-t",
                "1-4:1",
                "-N",
                "foo",
                "job_local.sh"
            ]
        );
    }

    #[test]
    fn qsub_output() {
        assert_eq!(
            parse_qsub_output("Your job 123 (\"job.sh\") has been submitted"),
            Some("123".to_string())
        );
        assert_eq!(
            parse_qsub_output("Warning\nYour job-array 456.1-4:1 (\"job.sh\") has been submitted"),
            Some("456".to_string())
        );
        assert_eq!(parse_qsub_output("Unable to run job"), None);
    }

    #[test]
    fn qstat_output() {
        let output = r#"job-ID     prior   name       user         state submit/start at     queue                          jclass                         slots ja-task-ID
------------------------------------------------------------------------------------------------------------------------------------------------
      101 0.28027 job.sh     user         r     05/01/2024 10:00:00 gpu@g0001                                                        80
      102 0.00000 job.sh     user         qw    05/01/2024 10:00:00                                                                  80
      103 0.00000 job.sh     user         Eqw   05/01/2024 10:00:00                                                                  80
      104 0.28027 job.sh     user         dr    05/01/2024 10:00:00 gpu@g0002                                                        80
      105 0.28027 job.sh     user         t     05/01/2024 10:00:00 gpu@g0002                                                        80
      106 0.28027 job.sh     user         s     05/01/2024 10:00:00 gpu@g0002                                                        80
      107 0.00000 job.sh     user         hqw   05/01/2024 10:00:00                                                                  80
"#;
        assert_eq!(
            parse_qstat_output(output),
            vec![
                ("101".to_string(), BackendSignal::Run),
                ("102".to_string(), BackendSignal::Ready),
                ("103".to_string(), BackendSignal::Error),
                ("104".to_string(), BackendSignal::Deleting),
                ("105".to_string(), BackendSignal::Run),
                ("106".to_string(), BackendSignal::Unrecognized("s".to_string())),
                ("107".to_string(), BackendSignal::Ready),
            ]
        );
        assert!(parse_qstat_output("").is_empty());
    }

    #[test]
    fn log_file_names() {
        assert_eq!(
            classify_log_file("job.sh.o123", "123", LogStream::Stdout),
            Some(LogSource::Job)
        );
        assert_eq!(
            classify_log_file("job.sh.e123", "123", LogStream::Stderr),
            Some(LogSource::Job)
        );
        assert_eq!(
            classify_log_file("job.sh.o123.7", "123", LogStream::Stdout),
            Some(LogSource::Task("7".to_string()))
        );
        assert_eq!(classify_log_file("job.sh.e123", "123", LogStream::Stdout), None);
        assert_eq!(classify_log_file("job.sh.o1234", "123", LogStream::Stdout), None);
        assert_eq!(classify_log_file("job.sh.o123.x", "123", LogStream::Stdout), None);
        assert_eq!(classify_log_file(".o123", "123", LogStream::Stdout), None);
    }
}
