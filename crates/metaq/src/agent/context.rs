use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::config::get_cancel_grace_period;
use crate::backend::BackendDriver;
use crate::manifest::store::JobStore;

/// Everything a job task needs, created once at startup and shared by all workers.
pub struct AgentContext {
    /// Agent instance name, stored into `run_system` of claimed jobs.
    pub name: String,
    pub store: JobStore,
    pub backend: Arc<dyn BackendDriver>,
    /// Parent directory of job working directories.
    pub cache_dir: PathBuf,
    pub cancel_grace_period: Duration,
}

impl AgentContext {
    pub fn new(
        name: String,
        store: JobStore,
        backend: Arc<dyn BackendDriver>,
        cache_dir: PathBuf,
    ) -> Self {
        Self {
            name,
            store,
            backend,
            cache_dir,
            cancel_grace_period: get_cancel_grace_period(),
        }
    }

    pub fn job_dir(&self, uuid: &str) -> PathBuf {
        self.cache_dir.join(uuid)
    }
}
