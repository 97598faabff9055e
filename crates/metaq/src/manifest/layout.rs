//! Names of the objects that make up a job folder in the bucket.
use object_store::path::Path as ObjectPath;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const CANCEL_FILE: &str = "cancel";
pub const STAGEOUT_FILE: &str = "output.zip";
pub const STDOUT_FILE: &str = "stdout";
pub const STDERR_FILE: &str = "stderr";

/// Prefix under which agents upload their own logs. It is not a job folder.
pub const AGENT_LOG_PREFIX: &str = "agent";

pub fn job_object(uuid: &str, name: &str) -> ObjectPath {
    ObjectPath::from(format!("{uuid}/{name}"))
}

pub fn manifest_path(uuid: &str) -> ObjectPath {
    job_object(uuid, MANIFEST_FILE)
}

pub fn cancel_path(uuid: &str) -> ObjectPath {
    job_object(uuid, CANCEL_FILE)
}

pub fn stageout_path(uuid: &str) -> ObjectPath {
    job_object(uuid, STAGEOUT_FILE)
}

pub fn agent_log_path(agent: &str) -> ObjectPath {
    ObjectPath::from(format!("{AGENT_LOG_PREFIX}/{agent}"))
}

/// Normalized log names: `stdout`, `stderr` and their `.<task-id>` variants.
pub fn is_log_file_name(name: &str) -> bool {
    [STDOUT_FILE, STDERR_FILE].iter().any(|prefix| {
        name == *prefix
            || name
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('.'))
                .is_some_and(|task| !task.is_empty())
    })
}
