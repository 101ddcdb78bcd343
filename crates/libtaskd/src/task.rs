use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use taskd_protocol::{Event, TaskId, TaskInfo, TaskKind, TaskParameters, TaskStatus};
use tokio::sync::broadcast;

use crate::broadcast::SubscriptionId;
use crate::error::TaskError;
use crate::supervisor::ProcessHandle;

/// `Working -> {Done, Failed, Cancelled}`. Only [`TaskRecord::terminate`]
/// clears the process handle and stamps `terminated_at`/`expires_at`.
pub struct TaskRecord {
    id: TaskId,
    name: String,
    parameters: TaskParameters,
    status: TaskStatus,
    created_at: SystemTime,
    terminated_at: Option<SystemTime>,
    expires_at: Option<SystemTime>,
    failure_reason: Option<String>,
    /// Present iff `status == Working`.
    process: Option<ProcessHandle>,
    subscribers: HashSet<SubscriptionId>,
    events: broadcast::Sender<Event>,
    next_output_seq: u64,
}

impl TaskRecord {
    /// A freshly launched task. Records are only ever created `Working`.
    pub fn new(
        id: TaskId,
        name: String,
        parameters: TaskParameters,
        process: ProcessHandle,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            id,
            name,
            parameters,
            status: TaskStatus::Working,
            created_at: SystemTime::now(),
            terminated_at: None,
            expires_at: None,
            failure_reason: None,
            process: Some(process),
            subscribers: HashSet::new(),
            events,
            next_output_seq: 1,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn kind(&self) -> TaskKind {
        self.parameters.kind()
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn process(&self) -> Option<&ProcessHandle> {
        self.process.as_ref()
    }

    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.status.is_terminal() && self.expires_at.is_some_and(|at| now >= at)
    }

    /// Commit a terminal status. Fails if the task is already terminal or if
    /// `status` is not terminal. Returns the process handle that was released.
    pub fn terminate(
        &mut self,
        status: TaskStatus,
        now: SystemTime,
        retention: Duration,
        failure_reason: Option<String>,
    ) -> Result<Option<ProcessHandle>, TaskError> {
        if self.status.is_terminal() {
            return Err(TaskError::invalid_state(&self.id, self.status, "terminate"));
        }
        if !status.is_terminal() {
            return Err(TaskError::invalid_state(&self.id, self.status, "restart"));
        }

        self.status = status;
        self.terminated_at = Some(now);
        self.expires_at = Some(now + retention);
        if status == TaskStatus::Failed {
            self.failure_reason = failure_reason;
        }
        Ok(self.process.take())
    }

    pub(crate) fn take_output_seq(&mut self) -> u64 {
        let seq = self.next_output_seq;
        self.next_output_seq = self.next_output_seq.saturating_add(1);
        seq
    }

    pub(crate) fn events(&self) -> &broadcast::Sender<Event> {
        &self.events
    }

    pub(crate) fn add_subscriber(&mut self, id: SubscriptionId) -> broadcast::Receiver<Event> {
        self.subscribers.insert(id);
        self.events.subscribe()
    }

    pub(crate) fn remove_subscriber(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind(),
            status: self.status,
            parameters: self.parameters.clone(),
            created_at_epoch_ms: epoch_ms(self.created_at),
            terminated_at_epoch_ms: self.terminated_at.map(epoch_ms),
            expires_at_epoch_ms: self.expires_at.map(epoch_ms),
            failure_reason: self.failure_reason.clone(),
            subscriber_count: self.subscribers.len(),
        }
    }
}

pub fn epoch_ms(at: SystemTime) -> u64 {
    at.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
