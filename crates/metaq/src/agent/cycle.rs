use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;

use crate::Set;
use crate::agent::AgentContext;
use crate::agent::process::{JobOutcome, process_job};
use crate::agent::stageout::upload_agent_log;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub discovered: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct AgentOptions {
    /// Maximum number of jobs processed concurrently.
    pub num_workers: usize,
    /// Repeat cycles until interrupted. Otherwise a single cycle is run.
    pub daemon: bool,
    pub daemon_interval: Duration,
    /// Agent log that is uploaded into the bucket after every cycle.
    pub log_file: Option<PathBuf>,
}

/// Processes every job folder found in the bucket once.
///
/// Each job runs in its own task, at most `num_workers` of them at the same time.
/// A failure of one job is logged and counted, it does not stop the others.
pub async fn run_cycle(ctx: &Arc<AgentContext>, num_workers: usize) -> crate::Result<CycleSummary> {
    let job_ids = ctx.store.list_job_ids().await?;
    log::debug!("Found {} job folder(s)", job_ids.len());

    let mut summary = CycleSummary::default();
    let mut seen = Set::new();
    let limit = Arc::new(Semaphore::new(num_workers.max(1)));
    let mut tasks = JoinSet::new();

    for uuid in job_ids {
        if !seen.insert(uuid.clone()) {
            continue;
        }
        summary.discovered += 1;
        let ctx = ctx.clone();
        let limit = limit.clone();
        tasks.spawn(async move {
            let result = match limit.acquire_owned().await {
                Ok(_permit) => process_job(&ctx, &uuid).await,
                Err(error) => Err(anyhow::anyhow!("Worker pool was closed: {error}")),
            };
            (uuid, result)
        });
    }

    while let Some(result) = tasks.join_next().await {
        match result {
            Ok((_, Ok(JobOutcome::Processed))) => summary.processed += 1,
            Ok((_, Ok(JobOutcome::Skipped))) => summary.skipped += 1,
            Ok((uuid, Err(error))) => {
                log::error!("[{uuid}] Job processing failed: {error:?}");
                summary.failed += 1;
            }
            Err(error) => {
                log::error!("Job task has crashed: {error}");
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

/// Runs processing cycles, either once or periodically until Ctrl-C is received.
pub async fn run_agent(ctx: Arc<AgentContext>, options: AgentOptions) -> crate::Result<()> {
    let stop = Arc::new(Notify::new());
    if options.daemon {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("Received interrupt, the agent will stop after the current cycle");
                stop.notify_one();
            }
        });
    }

    loop {
        let started = Instant::now();
        let result = run_cycle(&ctx, options.num_workers).await;
        match &result {
            Ok(summary) => log::info!(
                "Cycle finished in {}: {} job(s), {} processed, {} skipped, {} failed",
                humantime::format_duration(Duration::from_millis(
                    started.elapsed().as_millis() as u64
                )),
                summary.discovered,
                summary.processed,
                summary.skipped,
                summary.failed
            ),
            Err(error) => log::error!("Cycle failed: {error}"),
        }

        if let Some(log_file) = &options.log_file {
            if let Err(error) = upload_agent_log(&ctx, log_file).await {
                log::warn!("{error:?}");
            }
        }

        if !options.daemon {
            return result.map(|_| ());
        }
        tokio::select! {
            _ = tokio::time::sleep(options.daemon_interval) => {}
            _ = stop.notified() => {
                log::info!("Agent stopped");
                return Ok(());
            }
        }
    }
}
