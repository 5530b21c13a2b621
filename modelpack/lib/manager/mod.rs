//! The download manager: an ordered task list plus a single worker that runs
//! one pull at a time.
//!
//! User actions (enqueue, pause, resume, cancel) mutate the task list under a
//! mutex; the worker waits on a notifier for new queued work. Pause and
//! cancel share one mechanism (firing the task's cancellation handle) and
//! differ only in the state the manager records, which the worker inspects
//! after the pull returns so a user action always wins the race.

use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use getset::{Getters, Setters};
use serde::Serialize;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{default_platform, PullConfig, DEFAULT_CONCURRENCY, DEFAULT_REGISTRY, DEFAULT_RETRIES},
    pull::{Progress, ProgressSnapshot, PullEngine},
    session::{self, SessionState},
    utils::{sanitize_model_name, staging_dir_name, zip_file_name},
    ModelpackError, ModelpackResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle state of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting for the worker.
    Queued,

    /// The worker is running this task's pull.
    Downloading,

    /// Paused by the user; staging preserved for resume.
    Paused,

    /// Canceled by the user.
    Canceled,

    /// The pull failed; the task message carries the error.
    Error,

    /// The pull completed and the archive was written.
    Done,
}

/// A manager-owned download task.
#[derive(Debug)]
struct DownloadTask {
    id: String,
    model: String,
    sanitized: String,
    state: TaskState,
    message: String,
    zip_name: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    progress: Arc<Progress>,
    cancel: Option<CancellationToken>,
}

/// A read-only view of a task for listings and the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    /// The task id.
    pub id: String,

    /// The model reference being pulled.
    pub model: String,

    /// The current state.
    pub state: TaskState,

    /// A short human-readable status.
    pub message: String,

    /// The archive file name the pull produces.
    pub zip_name: String,

    /// The task's byte progress.
    pub progress: ProgressSnapshot,

    /// When the task was enqueued.
    pub created_at: DateTime<Utc>,

    /// When the task last changed state.
    pub updated_at: DateTime<Utc>,
}

/// Settings shared by every pull the manager runs.
#[derive(Debug, Clone, Getters, Setters)]
#[getset(get = "pub with_prefix", set = "pub with_prefix")]
pub struct ManagerConfig {
    /// The downloads directory holding archives and staging directories.
    output_dir: PathBuf,

    /// The registry base URL for fresh pulls.
    registry: String,

    /// The platform used to select manifests from indices.
    platform: String,

    /// Concurrent blob downloads per pull.
    concurrency: usize,

    /// Retry attempts beyond the first for transient errors.
    retries: u32,

    /// Overall per-request timeout; `None` leaves requests uncapped.
    timeout: Option<Duration>,

    /// Skip TLS certificate verification (discouraged).
    insecure: bool,

    /// Preserve staging directories after archives are written.
    keep_staging: bool,
}

/// The queue/worker façade the control plane talks to.
#[derive(Debug, Clone)]
pub struct DownloadManager {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    config: ManagerConfig,
    tasks: Mutex<Vec<DownloadTask>>,
    notify: Notify,
}

struct Job {
    id: String,
    model: String,
    sanitized: String,
    progress: Arc<Progress>,
    cancel: CancellationToken,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TaskState {
    /// Whether the state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Canceled | TaskState::Error | TaskState::Done)
    }

    /// The lowercase label used in listings and transition errors.
    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Downloading => "downloading",
            TaskState::Paused => "paused",
            TaskState::Canceled => "canceled",
            TaskState::Error => "error",
            TaskState::Done => "done",
        }
    }
}

impl ManagerConfig {
    /// Creates a config with the stock defaults for a downloads directory.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            registry: DEFAULT_REGISTRY.to_string(),
            platform: default_platform(),
            concurrency: DEFAULT_CONCURRENCY,
            retries: DEFAULT_RETRIES,
            timeout: None,
            insecure: false,
            keep_staging: false,
        }
    }
}

impl DownloadTask {
    fn view(&self) -> TaskView {
        TaskView {
            id: self.id.clone(),
            model: self.model.clone(),
            state: self.state,
            message: self.message.clone(),
            zip_name: self.zip_name.clone(),
            progress: self.progress.snapshot(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn set_state(&mut self, state: TaskState, message: impl Into<String>) {
        self.state = state;
        self.message = message.into();
        self.updated_at = Utc::now();
    }
}

impl DownloadManager {
    /// Creates a manager. Call [`DownloadManager::start`] to launch the
    /// worker.
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                tasks: Mutex::new(Vec::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Seeds the task list from partial sessions discovered on disk so that
    /// pulls interrupted by a previous process can be resumed from the UI.
    /// A session left in `downloading` by a crash surfaces as paused.
    pub async fn seed_from_disk(&self) {
        let sessions = session::discover_partials(self.shared.config.get_output_dir()).await;
        if sessions.is_empty() {
            return;
        }

        let mut tasks = self.shared.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for meta in sessions {
            let sanitized = if meta.session_id.is_empty() {
                sanitize_model_name(&meta.model)
            } else {
                meta.session_id.clone()
            };
            if tasks.iter().any(|task| task.sanitized == sanitized) {
                continue;
            }
            let state = match meta.state {
                SessionState::Error => TaskState::Error,
                _ => TaskState::Paused,
            };
            tracing::info!(model = %meta.model, state = state.label(), "recovered session");
            tasks.push(DownloadTask {
                id: generate_id(),
                model: meta.model.clone(),
                zip_name: zip_file_name(&sanitized),
                sanitized,
                state,
                message: meta.message.clone(),
                created_at: meta.started_at.unwrap_or_else(Utc::now),
                updated_at: meta.last_updated.unwrap_or_else(Utc::now),
                progress: Arc::new(Progress::new(0)),
                cancel: None,
            });
        }
    }

    /// Spawns the worker loop.
    pub fn start(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                let notified = shared.notify.notified();
                tokio::pin!(notified);

                match shared.take_next_queued() {
                    Some(job) => shared.run_job(job).await,
                    None => notified.await,
                }
            }
        })
    }

    /// Appends a new queued task for `model` and wakes the worker.
    pub fn enqueue(&self, model: &str) -> ModelpackResult<String> {
        let model = model.trim();
        if model.is_empty() {
            return Err(ModelpackError::InvalidReference(
                "model reference is empty".to_string(),
            ));
        }

        let sanitized = sanitize_model_name(model);
        let id = generate_id();
        let now = Utc::now();
        let task = DownloadTask {
            id: id.clone(),
            model: model.to_string(),
            zip_name: zip_file_name(&sanitized),
            sanitized,
            state: TaskState::Queued,
            message: "queued".to_string(),
            created_at: now,
            updated_at: now,
            progress: Arc::new(Progress::new(0)),
            cancel: None,
        };

        {
            let mut tasks = self.shared.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.push(task);
        }
        self.shared.notify.notify_one();
        Ok(id)
    }

    /// Pauses a queued or downloading task. The active pull, if any, is
    /// canceled; its staging directory and `.part` files stay intact.
    pub async fn pause(&self, id: &str) -> ModelpackResult<()> {
        let staging = {
            let mut tasks = self.shared.tasks.lock().unwrap_or_else(|e| e.into_inner());
            let task = find_task(&mut tasks, id)?;
            match task.state {
                TaskState::Downloading | TaskState::Queued => {
                    if let Some(cancel) = task.cancel.take() {
                        cancel.cancel();
                    }
                    task.set_state(TaskState::Paused, "paused");
                    self.staging_path(&task.sanitized)
                }
                state => {
                    return Err(ModelpackError::InvalidTaskTransition {
                        action: "pause",
                        state: state.label().to_string(),
                    })
                }
            }
        };

        let _ = session::set_status(&staging, SessionState::Paused, "paused").await;
        Ok(())
    }

    /// Re-queues a paused, errored, or canceled task. Progress is cleared;
    /// the next run re-accounts on-disk bytes from the staging directory.
    pub fn resume(&self, id: &str) -> ModelpackResult<()> {
        {
            let mut tasks = self.shared.tasks.lock().unwrap_or_else(|e| e.into_inner());
            let task = find_task(&mut tasks, id)?;
            match task.state {
                TaskState::Paused | TaskState::Error | TaskState::Canceled => {
                    task.progress.set_done(0);
                    task.progress.set_total(0);
                    task.set_state(TaskState::Queued, "queued");
                }
                state => {
                    return Err(ModelpackError::InvalidTaskTransition {
                        action: "resume",
                        state: state.label().to_string(),
                    })
                }
            }
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Cancels a queued, downloading, or paused task. The session keeps its
    /// staging directory and is marked paused on disk, so a cancel can still
    /// be resumed later.
    pub async fn cancel(&self, id: &str) -> ModelpackResult<()> {
        let staging = {
            let mut tasks = self.shared.tasks.lock().unwrap_or_else(|e| e.into_inner());
            let task = find_task(&mut tasks, id)?;
            match task.state {
                TaskState::Downloading | TaskState::Queued | TaskState::Paused => {
                    if let Some(cancel) = task.cancel.take() {
                        cancel.cancel();
                    }
                    task.set_state(TaskState::Canceled, "canceled");
                    self.staging_path(&task.sanitized)
                }
                state => {
                    return Err(ModelpackError::InvalidTaskTransition {
                        action: "cancel",
                        state: state.label().to_string(),
                    })
                }
            }
        };

        let _ = session::set_status(&staging, SessionState::Paused, "canceled").await;
        Ok(())
    }

    /// Lists every task in enqueue order.
    pub fn list(&self) -> Vec<TaskView> {
        let tasks = self.shared.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.iter().map(DownloadTask::view).collect()
    }

    /// Returns one task's view.
    pub fn get(&self, id: &str) -> ModelpackResult<TaskView> {
        let tasks = self.shared.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks
            .iter()
            .find(|task| task.id == id)
            .map(DownloadTask::view)
            .ok_or_else(|| ModelpackError::TaskNotFound(id.to_string()))
    }

    /// The progress snapshot of the currently downloading task, or zeros
    /// when nothing is active.
    pub fn active_progress(&self) -> ProgressSnapshot {
        let tasks = self.shared.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks
            .iter()
            .find(|task| task.state == TaskState::Downloading)
            .map(|task| task.progress.snapshot())
            .unwrap_or_default()
    }

    /// The manager's configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    fn staging_path(&self, sanitized: &str) -> PathBuf {
        self.shared
            .config
            .get_output_dir()
            .join(staging_dir_name(sanitized))
    }
}

impl Shared {
    /// Pops the oldest queued task, transitioning it to downloading and
    /// arming a fresh cancellation handle.
    fn take_next_queued(&self) -> Option<Job> {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let task = tasks.iter_mut().find(|task| task.state == TaskState::Queued)?;

        let cancel = CancellationToken::new();
        task.cancel = Some(cancel.clone());
        task.set_state(TaskState::Downloading, "downloading");

        Some(Job {
            id: task.id.clone(),
            model: task.model.clone(),
            sanitized: task.sanitized.clone(),
            progress: Arc::clone(&task.progress),
            cancel,
        })
    }

    /// Runs one pull and records the outcome, unless a pause/cancel action
    /// already moved the task out of `downloading`.
    async fn run_job(&self, job: Job) {
        tracing::info!(model = %job.model, id = %job.id, "starting pull");
        let config = self.pull_config(&job).await;

        let result = match PullEngine::new(&config) {
            Ok(engine) => engine.run(&job.progress, &job.cancel).await,
            Err(err) => Err(err),
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let Some(task) = tasks.iter_mut().find(|task| task.id == job.id) else {
            return;
        };
        task.cancel = None;

        if task.state != TaskState::Downloading {
            // The user paused or canceled while the pull was unwinding.
            return;
        }
        match result {
            Ok(()) => {
                tracing::info!(model = %job.model, "pull completed");
                task.set_state(TaskState::Done, "completed");
            }
            Err(err) if err.is_cancellation() => {
                task.set_state(TaskState::Canceled, "canceled");
            }
            Err(err) => {
                tracing::warn!(model = %job.model, error = %err, "pull failed");
                task.set_state(TaskState::Error, err.to_string());
            }
        }
    }

    /// Builds the pull config for a job: from the persisted session when the
    /// staging directory already has one (resume), from manager settings
    /// otherwise.
    async fn pull_config(&self, job: &Job) -> PullConfig {
        let output_dir = self.config.get_output_dir();
        let staging = output_dir.join(staging_dir_name(&job.sanitized));

        let mut config = match session::load(&staging).await {
            Ok(meta) if !meta.model.is_empty() => PullConfig::for_resume(&meta, output_dir),
            _ => {
                let mut config = PullConfig::new(&job.model, output_dir);
                config
                    .set_registry(self.config.get_registry().clone())
                    .set_platform(self.config.get_platform().clone())
                    .set_concurrency(*self.config.get_concurrency())
                    .set_retries(*self.config.get_retries());
                config
            }
        };
        config
            .set_timeout(*self.config.get_timeout())
            .set_insecure(*self.config.get_insecure())
            .set_keep_staging(*self.config.get_keep_staging());
        config
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn generate_id() -> String {
    format!("dl-{}", hex::encode(rand::random::<[u8; 8]>()))
}

fn find_task<'a>(
    tasks: &'a mut [DownloadTask],
    id: &str,
) -> ModelpackResult<&'a mut DownloadTask> {
    tasks
        .iter_mut()
        .find(|task| task.id == id)
        .ok_or_else(|| ModelpackError::TaskNotFound(id.to_string()))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> DownloadManager {
        let dir = tempfile::tempdir().unwrap();
        DownloadManager::new(ManagerConfig::new(dir.path()))
    }

    #[test]
    fn test_enqueue_creates_queued_task() {
        let manager = manager();
        let id = manager.enqueue("llama3:8b").unwrap();

        let view = manager.get(&id).unwrap();
        assert_eq!(view.state, TaskState::Queued);
        assert_eq!(view.model, "llama3:8b");
        assert_eq!(view.zip_name, "llama3-8b.zip");
        assert!(view.id.starts_with("dl-"));
    }

    #[test]
    fn test_enqueue_rejects_empty_model() {
        let manager = manager();
        assert!(manager.enqueue("   ").is_err());
    }

    #[tokio::test]
    async fn test_pause_queued_then_resume() {
        let manager = manager();
        let id = manager.enqueue("m").unwrap();

        manager.pause(&id).await.unwrap();
        assert_eq!(manager.get(&id).unwrap().state, TaskState::Paused);

        manager.resume(&id).unwrap();
        assert_eq!(manager.get(&id).unwrap().state, TaskState::Queued);
    }

    #[tokio::test]
    async fn test_cancel_paused_task() {
        let manager = manager();
        let id = manager.enqueue("m").unwrap();
        manager.pause(&id).await.unwrap();

        manager.cancel(&id).await.unwrap();
        assert_eq!(manager.get(&id).unwrap().state, TaskState::Canceled);
    }

    #[tokio::test]
    async fn test_resume_canceled_task() {
        let manager = manager();
        let id = manager.enqueue("m").unwrap();
        manager.cancel(&id).await.unwrap();

        manager.resume(&id).unwrap();
        assert_eq!(manager.get(&id).unwrap().state, TaskState::Queued);
    }

    #[tokio::test]
    async fn test_illegal_transitions_are_rejected() {
        let manager = manager();
        let id = manager.enqueue("m").unwrap();

        // queued -> resume is not legal
        assert!(matches!(
            manager.resume(&id),
            Err(ModelpackError::InvalidTaskTransition { .. })
        ));

        manager.cancel(&id).await.unwrap();
        // canceled -> pause is not legal
        assert!(matches!(
            manager.pause(&id).await,
            Err(ModelpackError::InvalidTaskTransition { .. })
        ));
        // canceled -> cancel again is not legal
        assert!(manager.cancel(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let manager = manager();
        assert!(matches!(
            manager.pause("dl-missing").await,
            Err(ModelpackError::TaskNotFound(_))
        ));
        assert!(manager.get("dl-missing").is_err());
    }

    #[test]
    fn test_active_progress_zero_when_idle() {
        let manager = manager();
        manager.enqueue("m").unwrap();
        assert_eq!(manager.active_progress(), ProgressSnapshot::default());
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Done.is_terminal());
        assert!(TaskState::Error.is_terminal());
        assert!(TaskState::Canceled.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Downloading.is_terminal());
        assert!(!TaskState::Paused.is_terminal());
    }

    #[tokio::test]
    async fn test_seed_from_disk_recovers_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("llama3.staging");
        tokio::fs::create_dir_all(&staging).await.unwrap();
        let mut meta = crate::session::SessionMeta {
            model: "llama3".to_string(),
            session_id: "llama3".to_string(),
            staging_root: staging.display().to_string(),
            state: SessionState::Downloading,
            ..Default::default()
        };
        session::save(&mut meta).await.unwrap();

        let manager = DownloadManager::new(ManagerConfig::new(dir.path()));
        manager.seed_from_disk().await;

        let tasks = manager.list();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].model, "llama3");
        // A crash mid-download surfaces as paused, ready to resume.
        assert_eq!(tasks[0].state, TaskState::Paused);

        // Seeding twice does not duplicate tasks.
        manager.seed_from_disk().await;
        assert_eq!(manager.list().len(), 1);
    }
}
