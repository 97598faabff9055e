use anyhow::Context;
use std::fs::File;
use std::path::Path;
use zip::CompressionMethod;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::agent::{AgentContext, AgentResult};
use crate::backend::LogStream;
use crate::common::utils::fs::{file_name_str, list_files};
use crate::manifest::Manifest;
use crate::manifest::layout::{agent_log_path, is_log_file_name, job_object, stageout_path};

/// Files above this size need ZIP64 extensions.
const LARGE_FILE_SIZE: u64 = u32::MAX as u64;

/// Collects the scheduler logs of the job and uploads them into the job folder.
pub async fn upload_logs(ctx: &AgentContext, manifest: &Manifest) -> AgentResult<()> {
    let Some(workdir) = manifest.work_dir().filter(|dir| dir.is_dir()) else {
        return Ok(());
    };
    ctx.backend.fetch_log(manifest, LogStream::Stdout).await?;
    ctx.backend.fetch_log(manifest, LogStream::Stderr).await?;

    let files = list_files(workdir).with_context(|| format!("Cannot list {}", workdir.display()))?;
    for path in files {
        let Some(name) = file_name_str(&path).filter(|name| is_log_file_name(name)) else {
            continue;
        };
        ctx.store
            .upload_file(&job_object(&manifest.uuid, name), &path)
            .await
            .with_context(|| format!("Cannot upload log {name}"))?;
        log::debug!("[{}] Log {name} uploaded", manifest.uuid);
    }
    Ok(())
}

/// Log upload that does not interrupt a state transition when it fails.
pub async fn refresh_logs(ctx: &AgentContext, manifest: &Manifest) {
    if let Err(error) = upload_logs(ctx, manifest).await {
        log::warn!("[{}] Cannot upload logs: {error:?}", manifest.uuid);
    }
}

/// Archives the working directory of the job and uploads it as `output.zip`.
pub async fn stage_out(ctx: &AgentContext, manifest: &mut Manifest) -> AgentResult<()> {
    let Some(workdir) = manifest
        .work_dir()
        .filter(|dir| dir.is_dir())
        .map(|dir| dir.to_path_buf())
    else {
        log::debug!("[{}] No working directory, nothing to stage out", manifest.uuid);
        return Ok(());
    };
    let archive = ctx.cache_dir.join(format!("{}-output.zip", manifest.uuid));

    let size = {
        let archive = archive.clone();
        tokio::task::spawn_blocking(move || create_archive(&workdir, &archive))
            .await
            .context("Archiving task failed")?
            .context("Cannot archive the working directory")?
    };
    let result = ctx
        .store
        .upload_file(&stageout_path(&manifest.uuid), &archive)
        .await
        .context("Cannot upload job output");
    if let Err(error) = std::fs::remove_file(&archive) {
        log::warn!("[{}] Cannot remove {}: {error}", manifest.uuid, archive.display());
    }
    result?;

    manifest.size_output = size;
    log::debug!("[{}] Output uploaded ({size} bytes)", manifest.uuid);
    Ok(())
}

/// Writes the contents of `dir` into a ZIP archive, returns the archive size.
fn create_archive(dir: &Path, archive: &Path) -> crate::Result<u64> {
    let mut writer = ZipWriter::new(File::create(archive)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    add_directory(&mut writer, dir, dir, options)?;
    writer.finish()?;
    Ok(std::fs::metadata(archive)?.len())
}

fn add_directory(
    writer: &mut ZipWriter<File>,
    root: &Path,
    dir: &Path,
    options: SimpleFileOptions,
) -> crate::Result<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let name = path
            .strip_prefix(root)
            .map_err(|e| crate::Error::GenericError(e.to_string()))?
            .to_string_lossy()
            .into_owned();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            writer.add_directory(format!("{name}/"), options)?;
            add_directory(writer, root, &path, options)?;
        } else if file_type.is_file() {
            let large = entry.metadata()?.len() >= LARGE_FILE_SIZE;
            writer.start_file(name, options.large_file(large))?;
            let mut file = File::open(&path)?;
            std::io::copy(&mut file, writer)?;
        }
    }
    Ok(())
}

/// Uploads the log of this agent to `agent/<name>`.
pub async fn upload_agent_log(ctx: &AgentContext, log_file: &Path) -> AgentResult<()> {
    let data = tokio::fs::read(log_file)
        .await
        .with_context(|| format!("Cannot read {}", log_file.display()))?;
    ctx.store
        .put_bytes(&agent_log_path(&ctx.name), data)
        .await
        .context("Cannot upload agent log")?;
    Ok(())
}
