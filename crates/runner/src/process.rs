// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use model_runtime::LaunchCommand;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::backend::{ExitCode, WorkerLauncher, WorkerProcess};
use crate::error::ProcessError;

/// Process manager for backend workers.
///
/// The manager is process-focused:
///
/// - It knows how to spawn a model's [`LaunchCommand`] as a subprocess.
/// - It tracks live workers by PID and by instance identifier.
/// - It forwards worker stdout/stderr into tracing so backend logs end up
///   next to the runner's own.
///
/// Deciding *when* to spawn or kill a worker is the runner's job; the
/// manager only carries it out.
#[derive(Debug, Default, Clone)]
pub struct ProcessManager {
    /// Map of worker PIDs to the instance they serve.
    workers: Arc<Mutex<HashMap<u32, String>>>,
}

impl ProcessManager {
    /// Create a new, empty process manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently tracked workers as `(pid, instance_id)` pairs.
    pub fn workers(&self) -> Vec<(u32, String)> {
        match self.workers.lock() {
            Ok(map) => map.iter().map(|(pid, id)| (*pid, id.clone())).collect(),
            Err(_) => {
                warn!("runner::process: workers map lock poisoned when listing workers");
                Vec::new()
            }
        }
    }

    fn track(&self, pid: u32, instance_id: &str) {
        if let Ok(mut map) = self.workers.lock() {
            map.insert(pid, instance_id.to_string());
        } else {
            warn!(
                "runner::process: workers map lock poisoned when tracking pid={}",
                pid
            );
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessManager {
    /// Spawn the worker process for `instance_id`.
    ///
    /// The command's `env` entries are applied on top of the inherited
    /// environment of the runner; entries with the same key override
    /// inherited values. Stdout and stderr are piped and forwarded line by
    /// line at DEBUG level. The child is killed if its handle is dropped.
    async fn launch(
        &self,
        instance_id: &str,
        command: &LaunchCommand,
    ) -> Result<Box<dyn WorkerProcess>, ProcessError> {
        info!(
            "runner::process: spawning worker for instance_id={} -> {} {:?} (cwd {})",
            instance_id,
            command.program,
            command.args,
            command.current_dir.display()
        );

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&command.current_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (k, v) in &command.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id().ok_or(ProcessError::NoPid)?;

        if let Some(stdout) = child.stdout.take() {
            forward_lines(instance_id.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(instance_id.to_string(), "stderr", stderr);
        }

        self.track(pid, instance_id);

        Ok(Box::new(ChildProcess {
            child,
            pid,
            workers: self.workers.clone(),
        }))
    }
}

fn forward_lines<R>(instance_id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(%instance_id, stream, "{line}"),
                Ok(None) => break,
                Err(e) => {
                    warn!(%instance_id, stream, "failed to read worker output: {e}");
                    break;
                }
            }
        }
    });
}

struct ChildProcess {
    child: Child,
    pid: u32,
    workers: Arc<Mutex<HashMap<u32, String>>>,
}

impl ChildProcess {
    fn untrack(&self) {
        if let Ok(mut map) = self.workers.lock() {
            map.remove(&self.pid);
        } else {
            warn!(
                "runner::process: workers map lock poisoned when cleaning up pid={}",
                self.pid
            );
        }
    }
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn wait(&mut self) -> io::Result<ExitCode> {
        let status = self.child.wait().await;
        self.untrack();
        Ok(status?.code())
    }

    async fn kill(&mut self) -> io::Result<()> {
        info!("runner::process: terminating worker pid={}", self.pid);
        if let Err(e) = self.child.start_kill() {
            warn!(
                "runner::process: failed to kill worker pid={}: {e}",
                self.pid
            );
            return Err(e);
        }
        Ok(())
    }
}
