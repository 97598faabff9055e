use anyhow::Context;
use object_store::UpdateVersion;
use std::path::Path;

use crate::agent::stageout::{refresh_logs, stage_out};
use crate::agent::transition::{CancelAction, PollAction, cancel_action, poll_action};
use crate::agent::{AgentContext, AgentResult};
use crate::backend::{BackendSignal, fold_statuses};
use crate::common::utils::fs::remove_dir_if_exists;
use crate::get_or_return;
use crate::manifest::store::{ClaimOutcome, VersionedManifest};
use crate::manifest::{JobState, Manifest, ScriptType, format_time, now, stamp};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job was examined and possibly updated.
    Processed,
    /// The job is not handled by this agent in this cycle.
    Skipped,
}

/// Runs one step of the lifecycle of a single job.
///
/// The manifest (and the cancellation marker) is always read again here, so that changes
/// made by clients since the last cycle are not overwritten.
pub async fn process_job(ctx: &AgentContext, uuid: &str) -> AgentResult<JobOutcome> {
    let VersionedManifest { manifest, version } = get_or_return!(
        ctx.store
            .read_manifest(uuid)
            .await
            .context("Cannot read manifest")?,
        {
            log::debug!("[{uuid}] No manifest found, skipping");
            Ok(JobOutcome::Skipped)
        }
    );
    if manifest.uuid != uuid {
        anyhow::bail!(
            "Manifest belongs to job `{}`, refusing to process it",
            manifest.uuid
        );
    }
    if manifest.is_terminal() {
        log::debug!("[{uuid}] Job has already finished");
        return Ok(JobOutcome::Skipped);
    }
    if manifest.is_owned_by_other(&ctx.name) {
        log::debug!(
            "[{uuid}] Job belongs to {}",
            if manifest.run_system.is_empty() {
                &manifest.submit_to
            } else {
                &manifest.run_system
            }
        );
        return Ok(JobOutcome::Skipped);
    }
    log::debug!("[{uuid}] Processing job in state {}", manifest.state);

    let marker = if manifest.state != JobState::Completing {
        ctx.store
            .read_cancel_marker(uuid)
            .await
            .context("Cannot read cancellation marker")?
    } else {
        None
    };

    if manifest.state == JobState::Init {
        return match marker {
            Some(_) => {
                delete_unsubmitted_job(ctx, manifest).await?;
                Ok(JobOutcome::Processed)
            }
            None => submit_job(ctx, manifest, version.as_ref()).await,
        };
    }

    let statuses = fold_statuses(
        ctx.backend
            .poll()
            .await
            .context("Cannot query the local scheduler")?,
    );
    let signal = manifest
        .local_job_id
        .as_deref()
        .and_then(|job_id| statuses.get(job_id))
        .cloned();

    let manifest = match marker {
        Some(marker) => get_or_return!(
            cancel_job(ctx, manifest, &marker, signal.is_some()).await?,
            Ok(JobOutcome::Processed)
        ),
        None => manifest,
    };
    update_job(ctx, manifest, signal.as_ref()).await?;
    Ok(JobOutcome::Processed)
}

async fn write_manifest(ctx: &AgentContext, manifest: &Manifest) -> AgentResult<()> {
    ctx.store
        .write_manifest(manifest)
        .await
        .context("Cannot write manifest")
}

fn remove_work_dir(manifest: &Manifest) {
    let Some(workdir) = manifest.work_dir() else {
        return;
    };
    match remove_dir_if_exists(workdir) {
        Ok(true) => log::debug!(
            "[{}] Working directory {} removed",
            manifest.uuid,
            workdir.display()
        ),
        Ok(false) => {}
        Err(error) => log::warn!(
            "[{}] Cannot remove working directory {}: {error}",
            manifest.uuid,
            workdir.display()
        ),
    }
}

/// Name of the current local user, recorded into claimed jobs.
fn local_account() -> String {
    let uid = nix::unistd::getuid();
    match nix::unistd::User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        _ => std::env::var("USER").unwrap_or_else(|_| uid.to_string()),
    }
}

/// Returns true if every job this job holds on has finished.
async fn holds_satisfied(ctx: &AgentContext, manifest: &Manifest) -> AgentResult<bool> {
    for hold_id in manifest.hold_ids() {
        let dependency = ctx
            .store
            .read_manifest(hold_id)
            .await
            .with_context(|| format!("Cannot read manifest of held job {hold_id}"))?;
        match dependency {
            Some(dependency) if dependency.manifest.is_terminal() => {}
            Some(dependency) => {
                log::debug!(
                    "[{}] Waiting for job {hold_id} ({})",
                    manifest.uuid,
                    dependency.manifest.state
                );
                return Ok(false);
            }
            None => {
                log::debug!(
                    "[{}] Held job {hold_id} was not found, waiting",
                    manifest.uuid
                );
                return Ok(false);
            }
        }
    }
    Ok(true)
}

async fn submit_job(
    ctx: &AgentContext,
    mut manifest: Manifest,
    version: Option<&UpdateVersion>,
) -> AgentResult<JobOutcome> {
    if !holds_satisfied(ctx, &manifest).await? {
        return Ok(JobOutcome::Skipped);
    }

    manifest.run_system = ctx.name.clone();
    stamp(&mut manifest.time_receive, now());
    manifest.local_account = local_account();
    let claim = ctx
        .store
        .claim_manifest(&manifest, version)
        .await
        .context("Cannot claim job")?;
    if claim == ClaimOutcome::Lost {
        log::info!("[{}] Job was modified concurrently, skipping", manifest.uuid);
        return Ok(JobOutcome::Skipped);
    }

    log::info!("[{}] Submitting job", manifest.uuid);
    let workdir = ctx.job_dir(&manifest.uuid);
    manifest.work_dir = workdir.display().to_string();
    let mut manifest = match stage_in(ctx, &mut manifest, &workdir).await {
        Ok(()) => ctx.backend.submit(manifest).await,
        Err(error) => {
            log::warn!("[{}] Cannot prepare job: {error:?}", manifest.uuid);
            manifest.error_msg = format!("{error:#}");
            manifest
        }
    };

    if manifest.local_job_id.is_some() {
        manifest.state = JobState::Ready;
        stamp(&mut manifest.time_ready, now());
        write_manifest(ctx, &manifest).await?;
    } else {
        manifest.finish(JobState::Error, now());
        write_manifest(ctx, &manifest).await?;
        remove_work_dir(&manifest);
        log::info!(
            "[{}] Job submission failed: {}",
            manifest.uuid,
            manifest.error_msg
        );
    }
    Ok(JobOutcome::Processed)
}

fn check_file_name(name: &str) -> AgentResult<()> {
    let path = Path::new(name);
    if name.is_empty() || path.file_name().and_then(|n| n.to_str()) != Some(name) {
        anyhow::bail!("invalid script name `{name}`");
    }
    Ok(())
}

/// Downloads the job script (and the converted local script of meta jobs) into the
/// working directory.
async fn stage_in(ctx: &AgentContext, manifest: &mut Manifest, workdir: &Path) -> AgentResult<()> {
    tokio::fs::create_dir_all(workdir)
        .await
        .with_context(|| format!("Cannot create working directory {}", workdir.display()))?;

    let mut names = vec![manifest.name.clone()];
    if manifest.script_type == ScriptType::Meta {
        if manifest.local_name.is_empty() {
            anyhow::bail!("local script of the meta job is not set");
        }
        names.push(manifest.local_name.clone());
    }

    let mut size_input = 0;
    for name in names {
        check_file_name(&name)?;
        let size = ctx
            .store
            .download_job_file(&manifest.uuid, &name, &workdir.join(&name))
            .await
            .with_context(|| format!("Cannot download {name}"))?
            .ok_or_else(|| anyhow::anyhow!("script file `{name}` is not found"))?;
        size_input += size;
    }
    manifest.size_input = size_input;
    Ok(())
}

async fn delete_unsubmitted_job(ctx: &AgentContext, mut manifest: Manifest) -> AgentResult<()> {
    manifest.finish(JobState::Deleted, now());
    write_manifest(ctx, &manifest).await?;
    remove_work_dir(&manifest);
    log::info!("[{}] Job was cancelled before submission", manifest.uuid);
    Ok(())
}

/// Handles a cancellation request of a submitted job.
/// Returns the manifest if the job should continue through the status update.
async fn cancel_job(
    ctx: &AgentContext,
    manifest: Manifest,
    marker: &str,
    listed: bool,
) -> AgentResult<Option<Manifest>> {
    let time = now();
    match cancel_action(
        manifest.state,
        listed,
        marker,
        time,
        ctx.cancel_grace_period,
    ) {
        CancelAction::Delete => {
            delete_unsubmitted_job(ctx, manifest).await?;
            Ok(None)
        }
        CancelAction::Skip => {
            log::debug!(
                "[{}] Cancelled job is not known by the scheduler anymore",
                manifest.uuid
            );
            Ok(Some(manifest))
        }
        CancelAction::Wait => {
            log::debug!("[{}] Waiting for the job to be deleted", manifest.uuid);
            Ok(Some(manifest))
        }
        CancelAction::Graceful { mark_time } => {
            let mut manifest = ctx
                .backend
                .cancel(manifest, false)
                .await
                .context("Cannot cancel job")?;
            manifest.state = JobState::Deleting;
            if mark_time {
                ctx.store
                    .write_cancel_marker(&manifest.uuid, &format_time(&time))
                    .await
                    .context("Cannot update cancellation marker")?;
            }
            write_manifest(ctx, &manifest).await?;
            log::info!("[{}] Job cancelled", manifest.uuid);
            Ok(Some(manifest))
        }
        CancelAction::Force => {
            let manifest = ctx
                .backend
                .cancel(manifest, true)
                .await
                .context("Cannot cancel job forcibly")?;
            log::info!("[{}] Job cancelled forcibly", manifest.uuid);
            finalize_job(ctx, manifest, JobState::Done).await?;
            Ok(None)
        }
    }
}

/// Applies the scheduler signal of a submitted job.
async fn update_job(
    ctx: &AgentContext,
    mut manifest: Manifest,
    signal: Option<&BackendSignal>,
) -> AgentResult<()> {
    match poll_action(manifest.state, signal) {
        PollAction::Keep => {
            if let Some(BackendSignal::Unrecognized(code)) = signal {
                log::debug!(
                    "[{}] Unrecognized scheduler state {code}, keeping {}",
                    manifest.uuid,
                    manifest.state
                );
            }
        }
        PollAction::RefreshLogs => refresh_logs(ctx, &manifest).await,
        PollAction::Advance(state) => {
            manifest.state = state;
            if state == JobState::Run {
                stamp(&mut manifest.time_start, now());
            }
            write_manifest(ctx, &manifest).await?;
            log::info!("[{}] Job state changed to {state}", manifest.uuid);
            if state == JobState::Run {
                refresh_logs(ctx, &manifest).await;
            }
        }
        PollAction::Finalize(state) => finalize_job(ctx, manifest, state).await?,
        PollAction::StageOut => complete_job(ctx, manifest).await?,
    }
    Ok(())
}

/// Stages out a job that has left the scheduler and marks it as DONE.
async fn complete_job(ctx: &AgentContext, mut manifest: Manifest) -> AgentResult<()> {
    if manifest.state != JobState::Completing {
        manifest.state = JobState::Completing;
        write_manifest(ctx, &manifest).await?;
        log::info!("[{}] Job state changed to {}", manifest.uuid, manifest.state);
    }
    finalize_job(ctx, manifest, JobState::Done).await
}

/// Moves a job into a terminal state: the output and logs are uploaded, the finish time is
/// recorded and the working directory is removed.
///
/// A failed stage-out of a DONE job is returned as an error and retried in the next cycle.
/// Terminal states reported by the scheduler are stored even if the stage-out fails, with the
/// failure recorded in `error_msg`.
async fn finalize_job(ctx: &AgentContext, mut manifest: Manifest, state: JobState) -> AgentResult<()> {
    if manifest.local_job_id.is_some() {
        stamp(&mut manifest.time_stageout_start, now());
        match stage_out(ctx, &mut manifest).await {
            Ok(()) => stamp(&mut manifest.time_stageout_finish, now()),
            Err(error) if state != JobState::Done => {
                log::warn!("[{}] Cannot stage out job output: {error:?}", manifest.uuid);
                manifest.error_msg = format!("Cannot stage out job output: {error:#}");
            }
            Err(error) => return Err(error),
        }
    }
    refresh_logs(ctx, &manifest).await;
    manifest.finish(state, now());
    write_manifest(ctx, &manifest).await?;
    remove_work_dir(&manifest);
    log::info!("[{}] Job finished with state {state}", manifest.uuid);
    Ok(())
}
