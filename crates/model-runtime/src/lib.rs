// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Model capability abstraction used by the runner.
//!
//! Every supported model variant implements [`Model`], which answers the
//! questions the scheduler needs before it can place a session: how much GPU
//! memory an instance needs, what session type it serves, how a session turns
//! into a [`WorkerTask`], how its output should be cleaned, and how its
//! backend process is launched.

use std::fmt;
use std::path::PathBuf;

use protocol::{ModelName, Session, SessionMode, SessionType, WorkerTask};
use thiserror::Error;

pub mod mistral;
pub mod registry;
pub mod sdxl;
pub mod text_stream;

pub use registry::ModelRegistry;
pub use text_stream::{SplitPolicy, StreamState, TextStream, TextStreamConfig};

pub const GB: u64 = 1024 * 1024 * 1024;

/// environment variable carrying the task-pull url for a backend process.
pub const TASK_URL_ENV: &str = "HELIX_GET_JOB_URL";
/// environment variable carrying the response-push url for a backend process.
pub const RESPONSE_URL_ENV: &str = "HELIX_RESPOND_JOB_URL";
/// environment variable carrying the adapter directory, when one is bound.
pub const LORA_DIR_ENV: &str = "HELIX_LORA_DIR";

/// Errors raised by model descriptors and the registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
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
}

/// Per-instance values a model needs to build its launch command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    /// url the backend polls for its next task.
    pub task_url: String,
    /// url the backend posts stream chunks and results to.
    pub response_url: String,
    /// directory containing the backend checkouts (axolotl, sd-scripts).
    pub backend_root: PathBuf,
    /// adapter the instance is bound to, if any.
    pub lora_dir: Option<String>,
}

impl ProcessConfig {
    /// Environment shared by every backend: the two task endpoints and the
    /// adapter, if bound.
    fn base_env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (TASK_URL_ENV.to_string(), self.task_url.clone()),
            (RESPONSE_URL_ENV.to_string(), self.response_url.clone()),
        ];
        if let Some(lora_dir) = &self.lora_dir {
            env.push((LORA_DIR_ENV.to_string(), lora_dir.clone()));
        }
        env
    }
}

/// Everything needed to start a backend process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: PathBuf,
    /// applied on top of the runner's inherited environment.
    pub env: Vec<(String, String)>,
}

impl LaunchCommand {
    /// A command run through `bash -c` after activating the checkout's
    /// virtualenv.
    fn venv_script(current_dir: PathBuf, script: &str, env: Vec<(String, String)>) -> Self {
        Self {
            program: "/bin/bash".to_string(),
            args: vec![
                "-c".to_string(),
                format!("source venv/bin/activate; {script}"),
            ],
            current_dir,
            env,
        }
    }
}

/// Capability interface implemented once per model variant.
///
/// Implementations are stateless; every method is a pure function of its
/// arguments.
pub trait Model: Send + Sync + fmt::Debug {
    fn name(&self) -> ModelName;

    /// GPU memory, in bytes, an instance running in `mode` reserves.
    fn memory_requirements(&self, mode: SessionMode) -> u64;

    fn session_type(&self) -> SessionType;

    /// Render the session's last interaction into a task for the backend.
    fn task(&self, session: &Session) -> Result<WorkerTask, ModelError>;

    /// Output cleanup policy, or `None` for modes that do not stream text.
    fn text_stream(&self, mode: SessionMode) -> Option<TextStreamConfig>;

    fn command(
        &self,
        mode: SessionMode,
        config: &ProcessConfig,
    ) -> Result<LaunchCommand, ModelError>;
}

/// Build a task for `session` with the given rendered prompt.
///
/// The task id is derived from the session and the interaction being
/// answered, which makes it stable for correlation and unique per unit of
/// work.
pub(crate) fn session_task(
    session: &Session,
    render: impl FnOnce(&str) -> String,
) -> Result<WorkerTask, ModelError> {
    let last = session
        .last_interaction()
        .map_err(|_| ModelError::EmptySession)?;
    Ok(WorkerTask {
        task_id: format!("{}-{}", session.id, last.id),
        session_id: session.id.clone(),
        mode: session.mode,
        session_type: session.session_type,
        lora_dir: session.lora_dir.clone(),
        prompt: render(&last.message),
        interaction_id: session.reply_interaction_id().ok().map(str::to_string),
    })
}
