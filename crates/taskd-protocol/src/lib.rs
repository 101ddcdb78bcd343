pub mod paths;

use serde::{Deserialize, Serialize};

/// Unique identifier for a task.
pub type TaskId = String;

/// SSE event name used for snapshots and status changes.
pub const EVENT_CHANGE: &str = "onChange";

/// SSE event name used for output lines of a running task.
pub const EVENT_OUTPUT: &str = "onStatus";

/// Sample rates accepted by training tasks.
pub const TRAIN_SAMPLE_RATES: [u32; 3] = [32_000, 40_000, 48_000];

/// Longest accepted task name, in characters.
pub const MAX_NAME_CHARS: usize = 128;

/// Allocate a fresh task identifier.
pub fn new_task_id() -> TaskId {
    uuid::Uuid::new_v4().to_string()
}

/// Closed set of work kinds the engine knows how to launch.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Infer,
    Train,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Infer => "infer",
            TaskKind::Train => "train",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status. `Working` is the only non-terminal state.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Working,
    Done,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Working)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Working => "working",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific configuration captured at creation. Immutable afterwards.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskParameters {
    Infer {
        index_ratio: f32,
        pitch: i32,
    },
    Train {
        batch_size: u32,
        epochs: u32,
        sample_rate: u32,
    },
}

impl TaskParameters {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskParameters::Infer { .. } => TaskKind::Infer,
            TaskParameters::Train { .. } => TaskKind::Train,
        }
    }

    /// Check value ranges. Returns a human readable reason on rejection.
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            TaskParameters::Infer { index_ratio, pitch } => {
                if !(0.0..=1.0).contains(&index_ratio) {
                    return Err(format!("indexRatio must be within 0..=1, got {index_ratio}"));
                }
                if !(-24..=24).contains(&pitch) {
                    return Err(format!("pitch must be within -24..=24, got {pitch}"));
                }
            }
            TaskParameters::Train {
                batch_size,
                epochs,
                sample_rate,
            } => {
                if batch_size == 0 {
                    return Err("batchSize must be at least 1".to_string());
                }
                if epochs == 0 {
                    return Err("epochs must be at least 1".to_string());
                }
                if !TRAIN_SAMPLE_RATES.contains(&sample_rate) {
                    return Err(format!(
                        "sampleRate must be one of {TRAIN_SAMPLE_RATES:?}, got {sample_rate}"
                    ));
                }
            }
        }
        Ok(())
    }

    /// Named values that command templates may reference.
    pub fn template_values(&self) -> Vec<(&'static str, String)> {
        match *self {
            TaskParameters::Infer { index_ratio, pitch } => vec![
                ("index_ratio", index_ratio.to_string()),
                ("pitch", pitch.to_string()),
            ],
            TaskParameters::Train {
                batch_size,
                epochs,
                sample_rate,
            } => vec![
                ("batch_size", batch_size.to_string()),
                ("epochs", epochs.to_string()),
                ("sample_rate", sample_rate.to_string()),
            ],
        }
    }

    /// Placeholder names a template for `kind` may use.
    pub fn template_names(kind: TaskKind) -> &'static [&'static str] {
        match kind {
            TaskKind::Infer => &["index_ratio", "pitch"],
            TaskKind::Train => &["batch_size", "epochs", "sample_rate"],
        }
    }
}

/// Point-in-time view of a task, as returned by reads and carried in events.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub parameters: TaskParameters,
    pub created_at_epoch_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminated_at_epoch_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_epoch_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub subscriber_count: usize,
}

/// Events delivered to subscribers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    /// Registry contents at the moment a watch-all subscriber attached.
    Snapshot { tasks: Vec<TaskInfo> },
    /// A task changed status.
    Status { task: TaskInfo },
    /// One line read from a task's standard output.
    Output { task_id: TaskId, seq: u64, line: String },
    /// The task left the registry.
    Removed { task_id: TaskId },
}

impl Event {
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Event::Snapshot { .. } => None,
            Event::Status { task } => Some(&task.id),
            Event::Output { task_id, .. } | Event::Removed { task_id } => Some(task_id),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::Snapshot { .. } | Event::Status { .. } | Event::Removed { .. } => {
                EVENT_CHANGE
            }
            Event::Output { .. } => EVENT_OUTPUT,
        }
    }

    /// Payload keyed by task id, the shape browsers consume. A removed task
    /// maps to `null`.
    pub fn payload(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        match self {
            Event::Snapshot { tasks } => {
                for task in tasks {
                    map.insert(
                        task.id.clone(),
                        serde_json::to_value(task).unwrap_or_default(),
                    );
                }
            }
            Event::Status { task } => {
                map.insert(
                    task.id.clone(),
                    serde_json::to_value(task).unwrap_or_default(),
                );
            }
            Event::Output { task_id, line, .. } => {
                map.insert(task_id.clone(), serde_json::Value::String(line.clone()));
            }
            Event::Removed { task_id } => {
                map.insert(task_id.clone(), serde_json::Value::Null);
            }
        }
        serde_json::Value::Object(map)
    }
}

/// Error codes for structured error handling.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    InvalidState,
    AlreadyExists,
    ResourceExhausted,
    InvalidRequest,
    ServerError,
}

/// JSON body of every error reply.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ErrorBody {
    pub error: String,
    pub code: ErrorCode,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> TaskInfo {
        TaskInfo {
            id: "task-1".to_string(),
            name: "voice".to_string(),
            kind: TaskKind::Infer,
            status: TaskStatus::Working,
            parameters: TaskParameters::Infer {
                index_ratio: 0.5,
                pitch: 3,
            },
            created_at_epoch_ms: 1_700_000_000_000,
            terminated_at_epoch_ms: None,
            expires_at_epoch_ms: None,
            failure_reason: None,
            subscriber_count: 0,
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Working.is_terminal());
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn parameters_tag_format() {
        let params = TaskParameters::Train {
            batch_size: 8,
            epochs: 20,
            sample_rate: 40_000,
        };
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["kind"], "train");
        assert_eq!(json["batch_size"], 8);
        assert_eq!(params.kind(), TaskKind::Train);
    }

    #[test]
    fn parameter_validation() {
        assert!(
            TaskParameters::Infer {
                index_ratio: 0.75,
                pitch: -12
            }
            .validate()
            .is_ok()
        );
        assert!(
            TaskParameters::Infer {
                index_ratio: 1.5,
                pitch: 0
            }
            .validate()
            .is_err()
        );
        assert!(
            TaskParameters::Infer {
                index_ratio: 0.5,
                pitch: 30
            }
            .validate()
            .is_err()
        );
        assert!(
            TaskParameters::Train {
                batch_size: 0,
                epochs: 1,
                sample_rate: 40_000
            }
            .validate()
            .is_err()
        );
        let err = TaskParameters::Train {
            batch_size: 4,
            epochs: 1,
            sample_rate: 44_100,
        }
        .validate()
        .unwrap_err();
        assert!(err.contains("sampleRate"));
    }

    #[test]
    fn template_values_cover_declared_names() {
        let params = TaskParameters::Train {
            batch_size: 4,
            epochs: 10,
            sample_rate: 48_000,
        };
        let names: Vec<&str> = params.template_values().iter().map(|(k, _)| *k).collect();
        assert_eq!(names, TaskParameters::template_names(TaskKind::Train));
    }

    #[test]
    fn task_info_omits_unset_timestamps() {
        let json = serde_json::to_string(&sample_info()).unwrap();
        assert!(!json.contains("terminated_at_epoch_ms"));
        assert!(!json.contains("failure_reason"));
        assert!(json.contains("\"status\":\"working\""));
    }

    #[test]
    fn event_names_and_payloads() {
        let status = Event::Status {
            task: sample_info(),
        };
        assert_eq!(status.name(), EVENT_CHANGE);
        assert_eq!(status.task_id(), Some("task-1"));
        assert_eq!(status.payload()["task-1"]["name"], "voice");

        let output = Event::Output {
            task_id: "task-1".to_string(),
            seq: 1,
            line: "epoch 1".to_string(),
        };
        assert_eq!(output.name(), EVENT_OUTPUT);
        assert_eq!(output.payload()["task-1"], "epoch 1");

        let snapshot = Event::Snapshot {
            tasks: vec![sample_info()],
        };
        assert_eq!(snapshot.task_id(), None);
        assert!(snapshot.payload()["task-1"].is_object());

        let removed = Event::Removed {
            task_id: "task-1".to_string(),
        };
        assert_eq!(removed.name(), EVENT_CHANGE);
        assert_eq!(removed.task_id(), Some("task-1"));
        assert_eq!(removed.payload().to_string(), r#"{"task-1":null}"#);
    }

    #[test]
    fn event_tag_format() {
        let event = Event::Output {
            task_id: "t".to_string(),
            seq: 2,
            line: "x".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.starts_with(r#"{"event":"output""#));
    }

    #[test]
    fn error_code_format() {
        let body = ErrorBody {
            error: "task not found: x".to_string(),
            code: ErrorCode::NotFound,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("not_found"));
        assert_eq!(
            serde_json::from_str::<ErrorCode>("\"invalid_state\"").unwrap(),
            ErrorCode::InvalidState
        );
    }

    #[test]
    fn task_ids_are_unique() {
        assert_ne!(new_task_id(), new_task_id());
    }
}
