// SPDX-License-Identifier: PolyForm-Shield-1.0

//! Boundary between the scheduler and backend processes.
//!
//! The runner only needs to start a process for an instance, learn when it
//! exits, and kill it. [`crate::process::ProcessManager`] does that with real
//! subprocesses; [`InMemoryLauncher`] does it with channels so scheduling can
//! be exercised without spawning anything.

use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use model_runtime::LaunchCommand;
use tokio::sync::oneshot;
use tracing::info;

use crate::error::ProcessError;

/// Exit code of a backend process; `None` when it was killed by a signal.
pub type ExitCode = Option<i32>;

/// Starts backend processes for model instances.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        instance_id: &str,
        command: &LaunchCommand,
    ) -> Result<Box<dyn WorkerProcess>, ProcessError>;
}

/// A running backend process, owned by the runner's supervisor task.
#[async_trait]
pub trait WorkerProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Resolve once the process has exited.
    async fn wait(&mut self) -> io::Result<ExitCode>;

    /// Ask the process to die. `wait` resolves afterwards.
    async fn kill(&mut self) -> io::Result<()>;
}

/// A launch recorded by [`InMemoryLauncher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub instance_id: String,
    pub command: LaunchCommand,
}

#[derive(Default)]
struct LauncherState {
    launches: Vec<LaunchRecord>,
    exits: HashMap<String, oneshot::Sender<ExitCode>>,
    fail_next: bool,
    next_pid: u32,
}

/// Launcher whose "processes" live until told to exit.
#[derive(Default)]
pub struct InMemoryLauncher {
    state: Mutex<LauncherState>,
}

impl InMemoryLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LauncherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every launch so far, in order.
    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.lock().launches.clone()
    }

    /// Make the next launch fail with a spawn error.
    pub fn fail_next_launch(&self) {
        self.lock().fail_next = true;
    }

    /// Simulate the process of `instance_id` exiting on its own. Returns
    /// `false` if no such process is alive.
    pub fn exit(&self, instance_id: &str, code: ExitCode) -> bool {
        match self.lock().exits.remove(instance_id) {
            Some(tx) => tx.send(code).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl WorkerLauncher for InMemoryLauncher {
    async fn launch(
        &self,
        instance_id: &str,
        command: &LaunchCommand,
    ) -> Result<Box<dyn WorkerProcess>, ProcessError> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next) {
            return Err(ProcessError::Spawn(io::Error::new(
                io::ErrorKind::NotFound,
                "simulated launch failure",
            )));
        }

        state.next_pid += 1;
        let pid = state.next_pid;
        let (tx, rx) = oneshot::channel();
        state.exits.insert(instance_id.to_string(), tx);
        state.launches.push(LaunchRecord {
            instance_id: instance_id.to_string(),
            command: command.clone(),
        });
        info!(instance_id, pid, "in-memory backend launched");

        Ok(Box::new(InMemoryProcess {
            pid,
            exit: rx,
            killed: false,
        }))
    }
}

struct InMemoryProcess {
    pid: u32,
    exit: oneshot::Receiver<ExitCode>,
    killed: bool,
}

#[async_trait]
impl WorkerProcess for InMemoryProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> io::Result<ExitCode> {
        if self.killed {
            return Ok(None);
        }
        match (&mut self.exit).await {
            Ok(code) => Ok(code),
            // the launcher is gone; nothing will ever stop this process
            Err(_) => std::future::pending().await,
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.killed = true;
        self.exit.close();
        Ok(())
    }
}
