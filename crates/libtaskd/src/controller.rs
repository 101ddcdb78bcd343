//! Lifecycle controller: create, run, finish, cancel and purge tasks.
//!
//! Every status change goes through [`TaskRegistry::update`] and publishes its
//! event from inside the mutator, so subscribers see transitions in commit
//! order. Cancellation is committed before the kill signal is sent; the
//! finalizer commits `Done`/`Failed` only if the task is still working, which
//! leaves exactly one terminal status and one terminal event per task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashSet;
use taskd_protocol::{
    Event, MAX_NAME_CHARS, TaskId, TaskInfo, TaskKind, TaskParameters, TaskStatus, new_task_id,
};
use tokio::process::{ChildStderr, ChildStdout};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::artifacts::{
    AUDIO_EXTENSIONS, ArtifactCategory, MODEL_EXTENSIONS, TaskFiles, Upload,
};
use crate::broadcast::{EventBroadcaster, EventStream, Scope};
use crate::command::{CommandPolicy, CommandSet};
use crate::error::TaskError;
use crate::registry::TaskRegistry;
use crate::supervisor::{self, ChildProcess, ExitError, LineReader};
use crate::task::TaskRecord;

/// Bytes of stderr kept for `failure_reason`; older output is dropped.
pub const STDERR_LIMIT: usize = 64 * 1024;

/// How long the finalizer waits for output pipes after the child exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tasks_root: PathBuf,
    /// Time a terminal task stays readable before the purge sweep evicts it.
    pub retention: Duration,
    pub max_upload_size: u64,
    pub event_capacity: usize,
    pub commands: CommandSet,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tasks_root: taskd_protocol::paths::default_tasks_root(),
            retention: Duration::from_secs(60),
            max_upload_size: 2 * 1024 * 1024 * 1024,
            event_capacity: 256,
            commands: CommandSet::default(),
        }
    }
}

/// A decoded creation request.
#[derive(Debug)]
pub struct CreateTask {
    pub name: String,
    pub parameters: TaskParameters,
    /// Audio inputs for inference, the dataset for training.
    pub input: Vec<Upload>,
    /// Model files. Inference only.
    pub model: Vec<Upload>,
}

impl CreateTask {
    fn validate(&self) -> Result<(), TaskError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(TaskError::InvalidRequest("name is required".to_string()));
        }
        if name.chars().count() > MAX_NAME_CHARS {
            return Err(TaskError::InvalidRequest(format!(
                "name must be at most {MAX_NAME_CHARS} characters"
            )));
        }
        self.parameters.validate().map_err(TaskError::InvalidRequest)?;

        match self.parameters.kind() {
            TaskKind::Infer => {
                if self.model.is_empty() {
                    return Err(TaskError::InvalidRequest("model file is required".to_string()));
                }
                if self.input.is_empty() {
                    return Err(TaskError::InvalidRequest("input file is required".to_string()));
                }
            }
            TaskKind::Train => {
                if self.input.is_empty() {
                    return Err(TaskError::InvalidRequest("dataset is required".to_string()));
                }
                if !self.model.is_empty() {
                    return Err(TaskError::InvalidRequest(
                        "train tasks take no model files".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn validate_task_id(id: &str) -> Result<(), TaskError> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(TaskError::InvalidRequest(format!("invalid task id: {id:?}")))
    }
}

/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct TaskController {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<TaskRegistry>,
    /// Ids between the duplicate check and registration.
    reserved: DashSet<TaskId>,
    broadcaster: Arc<EventBroadcaster>,
    files: TaskFiles,
    commands: CommandPolicy,
    retention: Duration,
    shutdown: CancellationToken,
    finalizers: TaskTracker,
}

impl TaskController {
    pub fn new(config: EngineConfig) -> Result<Self, TaskError> {
        let commands = CommandPolicy::new(config.commands)?;
        Ok(Self {
            inner: Arc::new(Inner {
                registry: Arc::new(TaskRegistry::new()),
                reserved: DashSet::new(),
                broadcaster: Arc::new(EventBroadcaster::new(config.event_capacity)),
                files: TaskFiles::new(config.tasks_root, config.max_upload_size),
                commands,
                retention: config.retention,
                shutdown: CancellationToken::new(),
                finalizers: TaskTracker::new(),
            }),
        })
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.inner.registry
    }

    pub fn files(&self) -> &TaskFiles {
        &self.inner.files
    }

    pub fn retention(&self) -> Duration {
        self.inner.retention
    }

    /// Token cancelled when [`shutdown`](Self::shutdown) starts.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.child_token()
    }

    /// Validate, store uploads, launch the child and register the task as
    /// `Working`. Returns once the child is running.
    pub async fn create(&self, request: CreateTask) -> Result<TaskId, TaskError> {
        self.create_with_id(new_task_id(), request).await
    }

    pub async fn create_with_id(
        &self,
        id: TaskId,
        request: CreateTask,
    ) -> Result<TaskId, TaskError> {
        let inner = &self.inner;
        validate_task_id(&id)?;
        request.validate()?;
        if inner.shutdown.is_cancelled() {
            return Err(TaskError::InvalidRequest("engine is shutting down".to_string()));
        }
        let _reservation = inner.reserve(&id)?;
        // An existing directory belongs to someone else: fail without removing it.
        inner.files.prepare(&id).await?;

        let CreateTask {
            name,
            parameters,
            input,
            model,
        } = request;
        let kind = parameters.kind();
        let spec = match inner.stage(&id, &parameters, input, model).await {
            Ok(spec) => spec,
            Err(e) => {
                inner.files.purge(&id).await;
                return Err(e);
            }
        };
        let spawned = match supervisor::spawn(&spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                inner.files.purge(&id).await;
                return Err(e);
            }
        };

        let record = TaskRecord::new(
            id.clone(),
            name.trim().to_string(),
            parameters,
            spawned.handle.clone(),
            inner.broadcaster.task_channel(),
        );
        if let Err(e) = inner.registry.create(record) {
            spawned.handle.kill();
            drop(spawned);
            inner.files.purge(&id).await;
            return Err(e);
        }
        inner.registry.update(&id, |rec| {
            inner
                .broadcaster
                .publish(rec, Event::Status { task: rec.info() })
        })?;
        info!(task_id = %id, kind = %kind, pid = ?spawned.handle.pid(), "task created");

        let stdout = tokio::spawn(Arc::clone(inner).pump_stdout(id.clone(), spawned.stdout));
        let stderr = tokio::spawn(capture_stderr(spawned.stderr));
        inner
            .finalizers
            .spawn(Arc::clone(inner).finalize(id.clone(), spawned.child, stdout, stderr));

        // Shutdown may have listed working tasks before this one was registered.
        if inner.shutdown.is_cancelled() {
            if let Err(e) = self.cancel(&id) {
                debug!(task_id = %id, error = %e, "task finished during shutdown");
            }
            return Err(TaskError::InvalidRequest("engine is shutting down".to_string()));
        }
        Ok(id)
    }

    pub fn get(&self, id: &str) -> Result<TaskInfo, TaskError> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<TaskInfo> {
        self.inner.registry.list_all()
    }

    /// Stop a working task. The status is committed and published before the
    /// child is signalled; artifacts go once the finalizer observes the exit.
    pub fn cancel(&self, id: &str) -> Result<(), TaskError> {
        let inner = &self.inner;
        let handle = inner.registry.update(id, |rec| {
            let handle = rec
                .terminate(
                    TaskStatus::Cancelled,
                    SystemTime::now(),
                    inner.retention,
                    None,
                )
                .map_err(|_| TaskError::invalid_state(id, rec.status(), "cancel"))?;
            inner
                .broadcaster
                .publish(rec, Event::Status { task: rec.info() });
            Ok::<_, TaskError>(handle)
        })??;

        if let Some(handle) = handle {
            handle.kill();
        }
        info!(task_id = %id, "task cancelled");
        Ok(())
    }

    /// Purge a finished task before its retention window ends.
    pub async fn discard(&self, id: &str) -> Result<(), TaskError> {
        let info = self.get(id)?;
        if info.status != TaskStatus::Done {
            return Err(TaskError::invalid_state(id, info.status, "discard"));
        }
        self.purge(id).await;
        Ok(())
    }

    /// Archive of a `Done` task. Any other state is `NotFound`.
    pub async fn result_path(&self, id: &str) -> Result<PathBuf, TaskError> {
        let info = self.get(id)?;
        let path = self.inner.files.result_path(id);
        if info.status != TaskStatus::Done || !tokio::fs::try_exists(&path).await? {
            return Err(TaskError::NotFound(id.to_string()));
        }
        Ok(path)
    }

    pub fn subscribe(&self, scope: Scope) -> Result<EventStream, TaskError> {
        EventStream::open(
            Arc::clone(&self.inner.broadcaster),
            Arc::clone(&self.inner.registry),
            scope,
        )
    }

    /// Remove the registry entry and the task directory. Returns whether the
    /// entry existed; purging an unknown id is a no-op.
    pub async fn purge(&self, id: &str) -> bool {
        self.inner.purge(id).await
    }

    /// Cancel every working task and wait for their finalizers.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.cancel();
        inner.finalizers.close();

        for task in inner.registry.list_all() {
            if task.status == TaskStatus::Working {
                if let Err(e) = self.cancel(&task.id) {
                    debug!(task_id = %task.id, error = %e, "task finished during shutdown");
                }
            }
        }
        if tokio::time::timeout(DRAIN_TIMEOUT * 2, inner.finalizers.wait())
            .await
            .is_err()
        {
            warn!(pending = inner.finalizers.len(), "finalizers still running at shutdown");
        }
        info!("engine stopped");
    }
}

impl Inner {
    /// Claim `id` until the returned guard drops. Fails if another create holds
    /// it or the registry already has it.
    fn reserve(&self, id: &str) -> Result<Reservation<'_>, TaskError> {
        if !self.reserved.insert(id.to_string()) {
            return Err(TaskError::AlreadyExists(id.to_string()));
        }
        let reservation = Reservation {
            reserved: &self.reserved,
            id: id.to_string(),
        };
        if self.registry.contains(id) {
            return Err(TaskError::AlreadyExists(id.to_string()));
        }
        Ok(reservation)
    }

    /// Store uploads and resolve the command.
    async fn stage(
        &self,
        id: &str,
        parameters: &TaskParameters,
        input: Vec<Upload>,
        model: Vec<Upload>,
    ) -> Result<supervisor::CommandSpec, TaskError> {
        self.files
            .store(id, ArtifactCategory::Input, input, AUDIO_EXTENSIONS)
            .await?;
        if !model.is_empty() {
            self.files
                .store(id, ArtifactCategory::Model, model, MODEL_EXTENSIONS)
                .await?;
        }
        self.commands.build(id, parameters, &self.files)
    }

    /// Forward stdout lines as output events until the pipe closes. Lines read
    /// after the task turned terminal are dropped.
    async fn pump_stdout(self: Arc<Self>, id: TaskId, mut lines: LineReader<ChildStdout>) {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let _ = self.registry.update(&id, |rec| {
                        if rec.status().is_terminal() {
                            return;
                        }
                        let seq = rec.take_output_seq();
                        let event = Event::Output {
                            task_id: id.clone(),
                            seq,
                            line,
                        };
                        self.broadcaster.publish(rec, event);
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(task_id = %id, error = %e, "stdout read failed");
                    break;
                }
            }
        }
    }

    /// Wait for the child, commit its outcome, then clean up artifacts.
    async fn finalize(
        self: Arc<Self>,
        id: TaskId,
        child: ChildProcess,
        stdout: JoinHandle<()>,
        stderr: JoinHandle<String>,
    ) {
        let exit = child.wait().await;

        let stdout_abort = stdout.abort_handle();
        if tokio::time::timeout(DRAIN_TIMEOUT, stdout).await.is_err() {
            stdout_abort.abort();
        }
        let stderr_abort = stderr.abort_handle();
        let stderr_text = match tokio::time::timeout(DRAIN_TIMEOUT, stderr).await {
            Ok(Ok(text)) => text,
            Ok(Err(_)) => String::new(),
            Err(_) => {
                stderr_abort.abort();
                String::new()
            }
        };

        let (status, reason) = match exit {
            // Cancelled while exiting: the commit below is a no-op.
            Ok(()) if self.is_terminal(&id) => (TaskStatus::Done, None),
            Ok(()) => {
                match self
                    .files
                    .archive(&self.files.dir(&id, ArtifactCategory::Output))
                    .await
                {
                    Ok(_) => (TaskStatus::Done, None),
                    Err(e) => (TaskStatus::Failed, Some(e.to_string())),
                }
            }
            Err(e @ ExitError::Killed) => (TaskStatus::Failed, Some(e.to_string())),
            Err(e) => {
                let reason = if stderr_text.is_empty() {
                    e.to_string()
                } else {
                    stderr_text
                };
                (TaskStatus::Failed, Some(reason))
            }
        };

        let committed = self.registry.update(&id, |rec| {
            match rec.terminate(status, SystemTime::now(), self.retention, reason) {
                Ok(_) => {
                    self.broadcaster
                        .publish(rec, Event::Status { task: rec.info() });
                    status
                }
                Err(_) => rec.status(),
            }
        });

        let final_status = match committed {
            Ok(final_status) => final_status,
            Err(_) => {
                self.files.purge(&id).await;
                return;
            }
        };
        info!(task_id = %id, status = %final_status, "task finished");

        match final_status {
            TaskStatus::Done => {
                for category in [ArtifactCategory::Input, ArtifactCategory::Model] {
                    if let Err(e) = self.files.remove_dir(&self.files.dir(&id, category)).await {
                        warn!(task_id = %id, error = %e, "failed to remove task inputs");
                    }
                }
            }
            _ => {
                self.purge(&id).await;
            }
        }
    }

    fn is_terminal(&self, id: &str) -> bool {
        self.registry
            .get(id)
            .is_none_or(|task| task.status.is_terminal())
    }

    async fn purge(&self, id: &str) -> bool {
        let removed = match self.registry.delete(id) {
            Ok(record) => {
                if let Some(handle) = record.process() {
                    handle.kill();
                }
                self.broadcaster.publish(
                    &record,
                    Event::Removed {
                        task_id: id.to_string(),
                    },
                );
                true
            }
            Err(_) => false,
        };
        self.files.purge(id).await;
        if removed {
            info!(task_id = %id, "task purged");
        }
        removed
    }
}

struct Reservation<'a> {
    reserved: &'a DashSet<TaskId>,
    id: TaskId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.reserved.remove(&self.id);
    }
}

/// Collect stderr, keeping only the last [`STDERR_LIMIT`] bytes.
async fn capture_stderr(mut lines: LineReader<ChildStderr>) -> String {
    let mut buf = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        buf.push_str(&line);
        buf.push('\n');
        if buf.len() > STDERR_LIMIT {
            let mut cut = buf.len() - STDERR_LIMIT;
            while !buf.is_char_boundary(cut) {
                cut += 1;
            }
            buf.drain(..cut);
        }
    }
    buf.trim_end().to_string()
}
