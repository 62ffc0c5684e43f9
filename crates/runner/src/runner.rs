// SPDX-License-Identifier: PolyForm-Shield-1.0

//! The instance pool and its scheduler.
//!
//! A [`Runner`] owns every [`ModelInstance`] on the node together with the
//! GPU memory they reserve. All pool mutations (matching, reserving and
//! launching, reclaiming) happen under one async mutex, so concurrent
//! callers can neither over-commit the budget nor start a duplicate instance
//! for a filter that already has a ready one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use config::RunnerConfig;
use model_runtime::{ModelRegistry, ProcessConfig};
use protocol::{Filter, Session, WorkerTask, WorkerTaskResponse};
use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::backend::{WorkerLauncher, WorkerProcess};
use crate::endpoint::LocalEndpoint;
use crate::error::{PushError, SchedulerError};
use crate::instance::{DeadlineOutcome, InstanceSnapshot, ModelInstance, TaskHandle};
use crate::state::InstanceState;

/// route a backend polls for its next task, followed by `/{instance_id}`.
pub const TASK_PATH: &str = "/api/v1/worker/task";
/// route a backend posts responses to, followed by `/{instance_id}`.
pub const RESPONSE_PATH: &str = "/api/v1/worker/response";

/// Scheduling knobs, resolved from [`RunnerConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerSettings {
    pub memory_budget: u64,
    /// base url backends reach the task api on, without trailing slash.
    pub public_url: String,
    pub backend_root: PathBuf,
    pub idle_timeout: Duration,
    pub pull_timeout: Duration,
    pub resolve_timeout: Duration,
    pub sweep_interval: Duration,
    pub pull_wait: Duration,
}

impl RunnerSettings {
    pub fn from_config(config: &RunnerConfig) -> anyhow::Result<Self> {
        let public_url = config.public_url();
        let parsed = Url::parse(&public_url)
            .with_context(|| format!("invalid public url {public_url}"))?;
        if parsed.cannot_be_a_base() {
            bail!("public url {public_url} cannot be used as a base url");
        }

        Ok(Self {
            memory_budget: config.memory_budget_bytes(),
            public_url,
            backend_root: config.backend_root.clone(),
            idle_timeout: config.idle_timeout(),
            pull_timeout: config.pull_timeout(),
            resolve_timeout: config.resolve_timeout(),
            sweep_interval: config.sweep_interval(),
            pull_wait: config.pull_wait(),
        })
    }

    /// Endpoints and adapter handed to the backend of `instance_id`. Both
    /// urls are scoped to that instance alone.
    fn process_config(&self, instance_id: &str, filter: &Filter) -> ProcessConfig {
        ProcessConfig {
            task_url: format!("{}{TASK_PATH}/{instance_id}", self.public_url),
            response_url: format!("{}{RESPONSE_PATH}/{instance_id}", self.public_url),
            backend_root: self.backend_root.clone(),
            lora_dir: filter.adapter().map(str::to_string),
        }
    }
}

/// How [`Runner::cancel`] treats the instance running the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMode {
    /// let the task finish, then retire the instance.
    Graceful,
    /// kill the backend now; the task fails as if it had crashed.
    Immediate,
}

/// What one pass of [`Runner::sweep`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub pull_timeouts: usize,
    pub resolve_timeouts: usize,
    /// instances stopped because they sat idle or finished draining.
    pub reclaimed: usize,
}

impl SweepReport {
    fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerSnapshot {
    pub memory_budget: u64,
    pub memory_used: u64,
    pub instances: Vec<InstanceSnapshot>,
}

#[derive(Default)]
struct Pool {
    instances: HashMap<String, Arc<ModelInstance>>,
    memory_used: u64,
}

impl Pool {
    /// The most recently used ready instance able to serve `session`.
    fn warmest_ready(&self, session: &Session) -> Option<Arc<ModelInstance>> {
        self.instances
            .values()
            .filter(|instance| {
                instance.state() == InstanceState::Ready
                    && instance.filter().matches_session(session)
            })
            .max_by_key(|instance| instance.last_used_at())
            .cloned()
    }

    /// Drop `instance_id` from the pool and give its memory back. Memory is
    /// released here and nowhere else, so at most once per instance.
    fn remove(&mut self, instance_id: &str) -> Option<Arc<ModelInstance>> {
        let instance = self.instances.remove(instance_id)?;
        self.memory_used = self.memory_used.saturating_sub(instance.memory());
        debug!(
            %instance_id,
            released = instance.memory(),
            memory_used = self.memory_used,
            "released instance memory"
        );
        Some(instance)
    }

    /// Stop a drained instance and remove it.
    fn stop_drained(&mut self, instance: &ModelInstance) -> bool {
        match instance.stop() {
            Ok(()) => {
                info!(instance_id = %instance.id(), "instance retired");
                self.remove(instance.id());
                true
            }
            Err(e) => {
                debug!(instance_id = %instance.id(), "not retiring instance: {e}");
                false
            }
        }
    }

    fn find_task(&self, task_id: &str) -> Option<Arc<ModelInstance>> {
        self.instances
            .values()
            .find(|instance| instance.current_task_id().as_deref() == Some(task_id))
            .cloned()
    }
}

struct RunnerInner {
    settings: RunnerSettings,
    registry: ModelRegistry,
    launcher: Arc<dyn WorkerLauncher>,
    pool: Mutex<Pool>,
}

/// Cheaply cloneable handle to one runner's pool.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    pub fn new(
        settings: RunnerSettings,
        registry: ModelRegistry,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        info!(
            memory_budget = settings.memory_budget,
            public_url = %settings.public_url,
            "initialising runner"
        );
        Self {
            inner: Arc::new(RunnerInner {
                settings,
                registry,
                launcher,
                pool: Mutex::new(Pool::default()),
            }),
        }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.inner.settings
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.inner.registry
    }

    pub fn memory_budget(&self) -> u64 {
        self.inner.settings.memory_budget
    }

    pub async fn memory_used(&self) -> u64 {
        self.inner.pool.lock().await.memory_used
    }

    pub async fn instance(&self, instance_id: &str) -> Option<Arc<ModelInstance>> {
        self.inner.pool.lock().await.instances.get(instance_id).cloned()
    }

    /// Find or create an instance able to serve `session`.
    ///
    /// A ready instance with a matching filter is reused, preferring the one
    /// used most recently. Otherwise a new instance is created if its memory
    /// fits in what is left of the budget. Busy matches are never waited on;
    /// with no room left the caller gets `InsufficientCapacity` and decides
    /// whether to queue.
    pub async fn schedule(&self, session: &Session) -> Result<Arc<ModelInstance>, SchedulerError> {
        if session.interactions.is_empty() {
            return Err(SchedulerError::EmptySession);
        }
        let model = self
            .inner
            .registry
            .lookup(session.session_type, session.model_name)?;
        let filter = Filter::for_session(session);
        let required = model.memory_requirements(session.mode);

        // a mode the model cannot run is a caller error, whatever the budget
        let instance_id = Uuid::new_v4().to_string();
        let process_config = self.inner.settings.process_config(&instance_id, &filter);
        let command = model.command(session.mode, &process_config)?;

        let mut pool = self.inner.pool.lock().await;

        if let Some(instance) = pool.warmest_ready(session) {
            instance.touch();
            debug!(
                session_id = %session.id,
                instance_id = %instance.id(),
                %filter,
                "reusing ready instance"
            );
            return Ok(instance);
        }

        let budget = self.inner.settings.memory_budget;
        let available = budget.saturating_sub(pool.memory_used);
        if required > available {
            warn!(
                session_id = %session.id,
                %filter,
                required,
                available,
                "not enough memory for a new instance"
            );
            return Err(SchedulerError::InsufficientCapacity {
                required,
                available,
                budget,
            });
        }

        let instance = Arc::new(ModelInstance::new(
            instance_id.clone(),
            model,
            filter,
            required,
        ));
        pool.instances.insert(instance_id.clone(), instance.clone());
        pool.memory_used += required;
        info!(
            session_id = %session.id,
            %instance_id,
            filter = %instance.filter(),
            reserved = required,
            memory_used = pool.memory_used,
            "starting new instance"
        );

        let mut process = match self.inner.launcher.launch(&instance_id, &command).await {
            Ok(process) => process,
            Err(e) => {
                error!(%instance_id, "failed to launch backend: {e}");
                pool.remove(&instance_id);
                return Err(e.into());
            }
        };

        let (kill_tx, kill_rx) = oneshot::channel();
        if let Err(e) = instance.mark_launched(process.pid(), kill_tx) {
            pool.remove(&instance_id);
            drop(pool);
            let _ = process.kill().await;
            return Err(e.into());
        }
        drop(pool);

        self.supervise(instance.clone(), process, kill_rx);
        Ok(instance)
    }

    /// Schedule `session` and submit its task.
    pub async fn submit_session(&self, session: &Session) -> Result<TaskHandle, SchedulerError> {
        let instance = self.schedule(session).await?;
        let task = instance.model().task(session)?;
        instance.submit(task)
    }

    fn supervise(
        &self,
        instance: Arc<ModelInstance>,
        mut process: Box<dyn WorkerProcess>,
        kill_rx: oneshot::Receiver<()>,
    ) {
        let runner = self.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                exit = process.wait() => exit,
                _ = kill_rx => {
                    if let Err(e) = process.kill().await {
                        warn!(instance_id = %instance.id(), "failed to kill backend: {e}");
                    }
                    process.wait().await
                }
            };
            match exit {
                Ok(code) => info!(instance_id = %instance.id(), ?code, "backend exited"),
                Err(e) => warn!(instance_id = %instance.id(), "lost track of backend: {e}"),
            }
            runner.handle_exit(&instance).await;
        });
    }

    /// The backend of `instance` is gone: release its memory and fail
    /// whatever it was running.
    async fn handle_exit(&self, instance: &Arc<ModelInstance>) {
        let removed = self.inner.pool.lock().await.remove(instance.id());
        if removed.is_some() && !instance.state().is_stopped() {
            warn!(instance_id = %instance.id(), "backend exited unexpectedly");
        }
        instance.mark_exited(None);
    }

    /// Serve a backend's task poll, waiting up to `wait` for work.
    pub async fn pull_task(
        &self,
        instance_id: &str,
        wait: Duration,
    ) -> Result<Option<WorkerTask>, PushError> {
        let instance = self
            .instance(instance_id)
            .await
            .ok_or_else(|| PushError::UnknownInstance(instance_id.to_string()))?;
        Ok(instance.pull_wait(wait).await)
    }

    /// Apply a backend's response, retiring the instance if that was the
    /// last thing it was draining for.
    pub async fn push_response(
        &self,
        instance_id: &str,
        response: WorkerTaskResponse,
    ) -> Result<(), PushError> {
        let instance = self
            .instance(instance_id)
            .await
            .ok_or_else(|| PushError::UnknownInstance(instance_id.to_string()))?;
        instance.push(response)?;

        if instance.is_drained() {
            self.inner.pool.lock().await.stop_drained(&instance);
        }
        Ok(())
    }

    /// Cancel the task `task_id` wherever it is running.
    pub async fn cancel(&self, task_id: &str, mode: CancelMode) -> Result<(), SchedulerError> {
        let mut pool = self.inner.pool.lock().await;
        let instance = pool
            .find_task(task_id)
            .ok_or_else(|| SchedulerError::UnknownTask {
                task_id: task_id.to_string(),
            })?;
        info!(%task_id, instance_id = %instance.id(), ?mode, "cancelling task");

        match mode {
            CancelMode::Graceful => {
                if instance.drain()? {
                    pool.stop_drained(&instance);
                }
            }
            CancelMode::Immediate => {
                pool.remove(instance.id());
                drop(pool);
                instance.mark_exited(None);
            }
        }
        Ok(())
    }

    /// One maintenance pass: enforce task deadlines, retire idle instances
    /// and finish drains.
    pub async fn sweep(&self) -> SweepReport {
        let settings = &self.inner.settings;
        let now = Instant::now();
        let mut report = SweepReport::default();

        let mut pool = self.inner.pool.lock().await;
        let instances: Vec<_> = pool.instances.values().cloned().collect();

        for instance in instances {
            match instance.check_deadlines(now, settings.pull_timeout, settings.resolve_timeout) {
                Some(DeadlineOutcome::PullExpired) => report.pull_timeouts += 1,
                Some(DeadlineOutcome::ResolveExpired) => {
                    report.resolve_timeouts += 1;
                    pool.remove(instance.id());
                    instance.mark_exited(None);
                    continue;
                }
                None => {}
            }

            let idle = instance.state() == InstanceState::Ready
                && now.duration_since(instance.last_used_at()) > settings.idle_timeout;
            if idle {
                info!(instance_id = %instance.id(), "retiring idle instance");
                if let Err(e) = instance.drain() {
                    warn!(instance_id = %instance.id(), "{e}");
                }
            }

            if instance.is_drained() && pool.stop_drained(&instance) {
                report.reclaimed += 1;
            }
        }

        report
    }

    /// Run [`Runner::sweep`] every `sweep_interval` until `shutdown` flips to
    /// true or its sender goes away.
    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let runner = self.clone();
        let period = self.inner.settings.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = runner.sweep().await;
                        if !report.is_empty() {
                            info!(?report, "sweep finished");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("sweeper stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    pub async fn snapshot(&self) -> RunnerSnapshot {
        let pool = self.inner.pool.lock().await;
        let mut instances: Vec<_> = pool.instances.values().map(|i| i.snapshot()).collect();
        instances.sort_by(|a, b| b.age_secs.cmp(&a.age_secs).then_with(|| a.id.cmp(&b.id)));
        RunnerSnapshot {
            memory_budget: self.inner.settings.memory_budget,
            memory_used: pool.memory_used,
            instances,
        }
    }

    /// Kill every instance and release all memory. In-flight tasks fail with
    /// `WorkerCrashed`.
    pub async fn shutdown(&self) {
        let mut pool = self.inner.pool.lock().await;
        let ids: Vec<String> = pool.instances.keys().cloned().collect();
        info!(instances = ids.len(), "shutting down runner");
        let removed: Vec<_> = ids.iter().filter_map(|id| pool.remove(id)).collect();
        drop(pool);
        for instance in removed {
            instance.mark_exited(None);
        }
    }

    /// In-process task endpoint for `instance_id`.
    pub fn local_endpoint(&self, instance_id: impl Into<String>) -> LocalEndpoint {
        LocalEndpoint::new(self.clone(), instance_id)
    }
}
