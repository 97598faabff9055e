use derive_builder::Builder;
use log::LevelFilter;
use object_store::memory::InMemory;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;

use crate::Map;
use crate::agent::process::{JobOutcome, process_job};
use crate::agent::{AgentContext, AgentResult, CycleSummary, run_cycle};
use crate::backend::{BackendDriver, BackendFuture, BackendSignal, JobStatusList, LogStream};
use crate::manifest::layout::job_object;
use crate::manifest::store::JobStore;
use crate::manifest::{JobState, Manifest, ScriptType};

pub const AGENT_NAME: &str = "test";
pub const SCRIPT_CONTENT: &str = "#!/bin/bash\necho hello\n";

pub fn memory_store() -> JobStore {
    JobStore::new(Arc::new(InMemory::new()), true)
}

/// What the fake scheduler knows and what was asked from it.
#[derive(Default)]
pub struct SchedulerState {
    /// Current scheduler listing
    pub jobs: Map<String, BackendSignal>,
    /// UUIDs of submitted jobs, in submission order
    pub submitted: Vec<String>,
    /// (local job id, force)
    pub cancelled: Vec<(String, bool)>,
    pub polls: usize,
    pub fetched_logs: usize,
    pub submit_will_fail: bool,
    pub poll_will_fail: bool,
    pub submit_delay: Option<Duration>,
    pub running_submits: usize,
    pub max_running_submits: usize,
    job_counter: u64,
}

pub type SharedState = Arc<Mutex<SchedulerState>>;

/// Backend driver assembled from closures.
pub struct Handler<SubmitFn, PollFn, CancelFn> {
    state: SharedState,
    submit_fn: Arc<SubmitFn>,
    poll_fn: Arc<PollFn>,
    cancel_fn: Arc<CancelFn>,
}

impl<SubmitFn, SubmitFut, PollFn, PollFut, CancelFn, CancelFut> Handler<SubmitFn, PollFn, CancelFn>
where
    SubmitFn: 'static + Send + Sync + Fn(SharedState, Manifest) -> SubmitFut,
    SubmitFut: 'static + Send + Future<Output = Manifest>,
    PollFn: 'static + Send + Sync + Fn(SharedState) -> PollFut,
    PollFut: 'static + Send + Future<Output = AgentResult<JobStatusList>>,
    CancelFn: 'static + Send + Sync + Fn(SharedState, Manifest, bool) -> CancelFut,
    CancelFut: 'static + Send + Future<Output = AgentResult<Manifest>>,
{
    pub fn new(
        state: SharedState,
        submit_fn: SubmitFn,
        poll_fn: PollFn,
        cancel_fn: CancelFn,
    ) -> Arc<dyn BackendDriver> {
        Arc::new(Self {
            state,
            submit_fn: Arc::new(submit_fn),
            poll_fn: Arc::new(poll_fn),
            cancel_fn: Arc::new(cancel_fn),
        })
    }
}

impl<SubmitFn, SubmitFut, PollFn, PollFut, CancelFn, CancelFut> BackendDriver
    for Handler<SubmitFn, PollFn, CancelFn>
where
    SubmitFn: 'static + Send + Sync + Fn(SharedState, Manifest) -> SubmitFut,
    SubmitFut: 'static + Send + Future<Output = Manifest>,
    PollFn: 'static + Send + Sync + Fn(SharedState) -> PollFut,
    PollFut: 'static + Send + Future<Output = AgentResult<JobStatusList>>,
    CancelFn: 'static + Send + Sync + Fn(SharedState, Manifest, bool) -> CancelFut,
    CancelFut: 'static + Send + Future<Output = AgentResult<Manifest>>,
{
    fn name(&self) -> &str {
        "fake"
    }

    fn submit(&self, manifest: Manifest) -> Pin<Box<dyn Future<Output = Manifest> + Send>> {
        Box::pin((self.submit_fn)(self.state.clone(), manifest))
    }

    fn poll(&self) -> BackendFuture<JobStatusList> {
        Box::pin((self.poll_fn)(self.state.clone()))
    }

    fn cancel(&self, manifest: Manifest, force: bool) -> BackendFuture<Manifest> {
        Box::pin((self.cancel_fn)(self.state.clone(), manifest, force))
    }

    fn fetch_log(&self, manifest: &Manifest, stream: LogStream) -> BackendFuture<()> {
        let state = self.state.clone();
        let target = manifest.work_dir().map(|dir| dir.join(stream.file_name()));
        let job_id = manifest.local_job_id.clone().unwrap_or_default();
        Box::pin(async move {
            state.lock().unwrap().fetched_logs += 1;
            if let Some(target) = target.filter(|t| t.parent().is_some_and(|p| p.is_dir())) {
                std::fs::write(target, format!("log of job {job_id}\n"))?;
            }
            Ok(())
        })
    }
}

/// Fake scheduler that keeps submitted jobs in its listing until a test changes them.
pub fn scheduler_backend(state: SharedState) -> Arc<dyn BackendDriver> {
    Handler::new(
        state,
        |state, mut manifest| async move {
            let delay = {
                let mut s = state.lock().unwrap();
                s.running_submits += 1;
                s.max_running_submits = s.max_running_submits.max(s.running_submits);
                s.submit_delay
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut s = state.lock().unwrap();
            s.running_submits -= 1;
            s.submitted.push(manifest.uuid.clone());
            manifest.submit_command = format!("fake-submit {}", manifest.submit_script());
            if s.submit_will_fail {
                manifest.error_msg = "queue is full".to_string();
            } else {
                s.job_counter += 1;
                let job_id = s.job_counter.to_string();
                s.jobs.insert(job_id.clone(), BackendSignal::Ready);
                manifest.local_job_id = Some(job_id);
            }
            manifest
        },
        |state| async move {
            let mut s = state.lock().unwrap();
            s.polls += 1;
            if s.poll_will_fail {
                anyhow::bail!("scheduler is not available");
            }
            Ok(s.jobs
                .iter()
                .map(|(id, signal)| (id.clone(), signal.clone()))
                .collect())
        },
        |state, manifest, force| async move {
            let mut s = state.lock().unwrap();
            if let Some(job_id) = manifest.local_job_id.clone() {
                s.cancelled.push((job_id.clone(), force));
                if force {
                    s.jobs.remove(&job_id);
                } else if let Some(signal) = s.jobs.get_mut(&job_id) {
                    *signal = BackendSignal::Deleting;
                }
            }
            Ok(manifest)
        },
    )
}

#[derive(Builder)]
#[builder(pattern = "owned", build_fn(name = "finish"))]
pub struct Job {
    #[builder(setter(into))]
    uuid: String,
    #[builder(default = "ScriptType::Local")]
    script_type: ScriptType,
    #[builder(default = "JobState::Init")]
    state: JobState,
    #[builder(default = "AGENT_NAME.to_string()", setter(into))]
    submit_to: String,
    #[builder(default, setter(into))]
    run_system: String,
    #[builder(default, setter(into))]
    hold_job_id: String,
    #[builder(default, setter(into))]
    local_name: String,
    #[builder(default, setter(strip_option, into))]
    local_job_id: Option<String>,
}

impl JobBuilder {
    pub fn build(self) -> Manifest {
        let Job {
            uuid,
            script_type,
            state,
            submit_to,
            run_system,
            hold_job_id,
            local_name,
            local_job_id,
        } = self.finish().unwrap();
        let mut manifest = Manifest::new(uuid, "job.sh".to_string(), script_type);
        manifest.state = state;
        manifest.submit_to = submit_to;
        manifest.run_system = run_system;
        manifest.hold_job_id = hold_job_id;
        manifest.local_name = local_name;
        manifest.local_job_id = local_job_id;
        manifest.time_submit = Some(crate::manifest::now());
        manifest
    }
}

/// Agent context with an in-memory bucket, a fake scheduler and a temporary cache directory.
pub struct TestEnv {
    pub ctx: Arc<AgentContext>,
    pub scheduler: SharedState,
    _cache_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_backend(scheduler_backend)
    }

    pub fn with_backend<F: FnOnce(SharedState) -> Arc<dyn BackendDriver>>(create: F) -> Self {
        let _ = env_logger::Builder::default()
            .filter(None, LevelFilter::Debug)
            .is_test(true)
            .try_init();

        let cache_dir = TempDir::with_prefix("metaq").unwrap();
        let scheduler: SharedState = Default::default();
        let backend = create(scheduler.clone());
        let mut ctx = AgentContext::new(
            AGENT_NAME.to_string(),
            memory_store(),
            backend,
            cache_dir.path().to_path_buf(),
        );
        ctx.cancel_grace_period = Duration::from_secs(60);
        Self {
            ctx: Arc::new(ctx),
            scheduler,
            _cache_dir: cache_dir,
        }
    }

    pub fn backend_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.scheduler.lock().unwrap()
    }

    pub fn set_signal(&self, job_id: &str, signal: Option<BackendSignal>) {
        let mut state = self.backend_state();
        match signal {
            Some(signal) => state.jobs.insert(job_id.to_string(), signal),
            None => state.jobs.remove(job_id),
        };
    }

    /// Uploads the manifest and the job script(s) into the bucket.
    pub async fn add_job(&self, manifest: &Manifest) {
        let store = &self.ctx.store;
        store.write_manifest(manifest).await.unwrap();
        store
            .put_bytes(&job_object(&manifest.uuid, &manifest.name), SCRIPT_CONTENT)
            .await
            .unwrap();
        if !manifest.local_name.is_empty() {
            store
                .put_bytes(
                    &job_object(&manifest.uuid, &manifest.local_name),
                    SCRIPT_CONTENT,
                )
                .await
                .unwrap();
        }
    }

    /// Stores a job that was already submitted by this agent and is listed by the scheduler.
    pub async fn add_submitted_job(&self, uuid: &str, job_id: &str, state: JobState) -> Manifest {
        let mut manifest = running_job(self, uuid, job_id);
        manifest.state = state;
        self.ctx.store.write_manifest(&manifest).await.unwrap();
        self.set_signal(
            job_id,
            Some(match state {
                JobState::Ready => BackendSignal::Ready,
                JobState::Deleting => BackendSignal::Deleting,
                JobState::Completing => BackendSignal::Completing,
                _ => BackendSignal::Run,
            }),
        );
        manifest
    }

    pub async fn manifest(&self, uuid: &str) -> Manifest {
        self.ctx
            .store
            .read_manifest(uuid)
            .await
            .unwrap()
            .unwrap()
            .manifest
    }

    pub async fn process(&self, uuid: &str) -> JobOutcome {
        process_job(&self.ctx, uuid).await.unwrap()
    }

    pub async fn cycle(&self, num_workers: usize) -> CycleSummary {
        run_cycle(&self.ctx, num_workers).await.unwrap()
    }
}

/// Manifest of a running job owned by the test agent, with an existing working directory.
pub fn running_job(env: &TestEnv, uuid: &str, job_id: &str) -> Manifest {
    let workdir = env.ctx.job_dir(uuid);
    std::fs::create_dir_all(&workdir).unwrap();
    std::fs::write(workdir.join("job.sh"), SCRIPT_CONTENT).unwrap();

    let mut manifest = JobBuilder::default()
        .uuid(uuid)
        .state(JobState::Run)
        .run_system(AGENT_NAME)
        .local_job_id(job_id)
        .build();
    manifest.work_dir = workdir.display().to_string();
    manifest.time_receive = Some(crate::manifest::now());
    manifest.time_ready = Some(crate::manifest::now());
    manifest.time_start = Some(crate::manifest::now());
    manifest
}
