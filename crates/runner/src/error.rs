// SPDX-License-Identifier: PolyForm-Shield-1.0

use model_runtime::ModelError;
use protocol::{ModelName, SessionMode, SessionType};
use thiserror::Error;

use crate::state::TransitionError;

/// Errors returned synchronously by scheduling and submission.
///
/// `EmptySession`, `UnknownModel` and `UnsupportedMode` are caller errors.
/// `InsufficientCapacity` and `RejectedBusy` are transient capacity signals;
/// the runner never retries them itself. `InstanceRetired` means the caller
/// should schedule again.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("session has no messages")]
    EmptySession,

    #[error("no {session_type} model registered as {model_name}")]
    UnknownModel {
        model_name: ModelName,
        session_type: SessionType,
    },

    #[error("{model_name} does not support {mode} sessions")]
    UnsupportedMode {
        model_name: ModelName,
        mode: SessionMode,
    },

    #[error("insufficient gpu memory: need {required} bytes, {available} of {budget} free")]
    InsufficientCapacity {
        required: u64,
        available: u64,
        budget: u64,
    },

    #[error("instance {instance_id} is not ready for a new task")]
    RejectedBusy { instance_id: String },

    #[error("instance {instance_id} is retiring and takes no new tasks")]
    InstanceRetired { instance_id: String },

    #[error("no running task with id {task_id}")]
    UnknownTask { task_id: String },

    #[error("failed to launch backend process: {0}")]
    Launch(#[from] ProcessError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl From<ModelError> for SchedulerError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::EmptySession => SchedulerError::EmptySession,
            ModelError::UnknownModel {
                model_name,
                session_type,
            } => SchedulerError::UnknownModel {
                model_name,
                session_type,
            },
            ModelError::UnsupportedMode { model_name, mode } => {
                SchedulerError::UnsupportedMode { model_name, mode }
            }
        }
    }
}

/// Which deadline a timed-out task missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    /// submitted but never pulled by the backend.
    Pull,
    /// pulled but never resolved.
    Resolve,
}

/// Why an accepted task failed. Delivered asynchronously through the task's
/// event stream, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("backend process for instance {instance_id} exited before the task finished")]
    WorkerCrashed { instance_id: String },

    #[error("task {task_id} exceeded its {stage:?} deadline")]
    SchedulerTimeout { task_id: String, stage: TimeoutStage },

    #[error("backend reported an error: {message}")]
    Backend { message: String },
}

/// Rejections of backend pull/push traffic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("unknown instance {0}")]
    UnknownInstance(String),

    #[error("unexpected task {got}; instance is running {expected:?}")]
    UnexpectedTask {
        expected: Option<String>,
        got: String,
    },

    #[error("task {0} has not been pulled yet")]
    NotPulled(String),
}

/// Errors managing backend processes.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("spawned process exited before reporting a pid")]
    NoPid,
}
