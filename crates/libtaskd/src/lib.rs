pub mod artifacts;
pub mod broadcast;
pub mod command;
pub mod controller;
pub mod error;
pub mod purge;
pub mod registry;
pub mod sse;
pub mod supervisor;
pub mod task;

pub use artifacts::{ArtifactCategory, RESULT_ARCHIVE, TaskFiles, Upload, UploadWriter};
pub use broadcast::{EventBroadcaster, EventStream, Scope, SubscriptionHandle, SubscriptionId};
pub use command::{CommandPolicy, CommandSet, CommandTemplate};
pub use controller::{CreateTask, EngineConfig, TaskController};
pub use error::TaskError;
pub use purge::PurgeScheduler;
pub use registry::TaskRegistry;
pub use sse::{SseEncoder, SseFrame};
pub use supervisor::{CommandSpec, ExitError, ProcessHandle};
pub use task::TaskRecord;
