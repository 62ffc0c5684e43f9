// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use model_runtime::{Model, TextStream};
use protocol::{Filter, ModelName, WorkerTask, WorkerTaskResponse};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{PushError, SchedulerError, TaskError, TimeoutStage};
use crate::state::{InstanceEvent, InstanceState, TransitionError};

/// Progress of one submitted task, in order: any number of `Chunk`s followed
/// by exactly one `Finished` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    /// one clean increment of output.
    Chunk(String),
    Finished(TaskOutput),
    Failed(TaskFailure),
}

impl TaskEvent {
    fn is_terminal(&self) -> bool {
        !matches!(self, TaskEvent::Chunk(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutput {
    pub task_id: String,
    /// final message reported by the backend.
    pub message: String,
    pub files: Vec<String>,
    /// every increment streamed for this task.
    pub increments: Vec<String>,
}

/// A task that did not complete.
///
/// `partial` holds whatever was streamed before the failure; it is always
/// incomplete output and must be presented as such.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task_id: String,
    pub error: TaskError,
    pub partial: Vec<String>,
}

/// Consumer side of a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    task_id: String,
    instance_id: String,
    events: mpsc::UnboundedReceiver<TaskEvent>,
    done: bool,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Next event, or `None` once the terminal event has been returned.
    ///
    /// If the instance goes away without reporting an outcome, a
    /// `WorkerCrashed` failure is synthesized so consumers always see a
    /// terminal event.
    pub async fn next(&mut self) -> Option<TaskEvent> {
        if self.done {
            return None;
        }
        let event = self.events.recv().await.unwrap_or_else(|| {
            TaskEvent::Failed(TaskFailure {
                task_id: self.task_id.clone(),
                error: TaskError::WorkerCrashed {
                    instance_id: self.instance_id.clone(),
                },
                partial: Vec::new(),
            })
        });
        self.done = event.is_terminal();
        Some(event)
    }

    /// Drain the stream and return the outcome.
    pub async fn wait(mut self) -> Result<TaskOutput, TaskFailure> {
        let mut seen = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                TaskEvent::Chunk(chunk) => seen.push(chunk),
                TaskEvent::Finished(output) => return Ok(output),
                TaskEvent::Failed(mut failure) => {
                    if failure.partial.is_empty() {
                        failure.partial = seen;
                    }
                    return Err(failure);
                }
            }
        }
        Err(TaskFailure {
            task_id: self.task_id.clone(),
            error: TaskError::WorkerCrashed {
                instance_id: self.instance_id.clone(),
            },
            partial: seen,
        })
    }
}

/// What a deadline check did to the in-flight task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineOutcome {
    /// the task was never pulled; it failed and the instance is free again.
    PullExpired,
    /// the task was pulled but never resolved; the instance must be torn
    /// down like a crashed one.
    ResolveExpired,
}

struct TaskSlot {
    task: WorkerTask,
    submitted_at: Instant,
    pulled_at: Option<Instant>,
    stream: Option<TextStream>,
    emitted: Vec<String>,
    events: mpsc::UnboundedSender<TaskEvent>,
}

impl TaskSlot {
    fn emit(&mut self, increments: Vec<String>) {
        for increment in increments {
            // the consumer may have dropped its handle; output is still
            // recorded for the final result.
            let _ = self.events.send(TaskEvent::Chunk(increment.clone()));
            self.emitted.push(increment);
        }
    }

    fn fail(self, error: TaskError) {
        let _ = self.events.send(TaskEvent::Failed(TaskFailure {
            task_id: self.task.task_id,
            error,
            partial: self.emitted,
        }));
    }
}

struct InstanceInner {
    state: InstanceState,
    last_used_at: Instant,
    pid: Option<u32>,
    /// fires the supervisor's kill path; dropping it has the same effect.
    kill: Option<oneshot::Sender<()>>,
    slot: Option<TaskSlot>,
}

/// Serializable view of an instance for the state endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub model_name: ModelName,
    pub filter: Filter,
    pub state: InstanceState,
    pub memory: u64,
    pub pid: Option<u32>,
    pub current_task: Option<String>,
    pub age_secs: u64,
    pub idle_secs: u64,
}

/// One backend process bound to one model and one filter.
///
/// The instance owns its memory reservation for its whole life and serializes
/// tasks: at most one task is queued or running at a time.
pub struct ModelInstance {
    id: String,
    model: Arc<dyn Model>,
    filter: Filter,
    memory: u64,
    created_at: Instant,
    inner: Mutex<InstanceInner>,
    task_queued: Notify,
}

impl std::fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelInstance")
            .field("id", &self.id)
            .field("model", &self.model.name())
            .field("filter", &self.filter)
            .field("memory", &self.memory)
            .field("state", &self.state())
            .finish()
    }
}

impl ModelInstance {
    pub fn new(id: String, model: Arc<dyn Model>, filter: Filter, memory: u64) -> Self {
        let now = Instant::now();
        Self {
            id,
            model,
            filter,
            memory,
            created_at: now,
            inner: Mutex::new(InstanceInner {
                state: InstanceState::Starting,
                last_used_at: now,
                pid: None,
                kill: None,
                slot: None,
            }),
            task_queued: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InstanceInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &Arc<dyn Model> {
        &self.model
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Bytes reserved against the runner's budget.
    pub fn memory(&self) -> u64 {
        self.memory
    }

    pub fn state(&self) -> InstanceState {
        self.lock().state
    }

    pub fn last_used_at(&self) -> Instant {
        self.lock().last_used_at
    }

    pub fn current_task_id(&self) -> Option<String> {
        self.lock().slot.as_ref().map(|slot| slot.task.task_id.clone())
    }

    /// Record the launched process and move `Starting -> Ready`.
    pub fn mark_launched(
        &self,
        pid: Option<u32>,
        kill: oneshot::Sender<()>,
    ) -> Result<(), TransitionError> {
        let mut inner = self.lock();
        inner.state = inner.state.on(InstanceEvent::Launched)?;
        inner.pid = pid;
        inner.kill = Some(kill);
        Ok(())
    }

    /// Mark the instance as just used, e.g. when it is handed out for reuse.
    pub fn touch(&self) {
        self.lock().last_used_at = Instant::now();
    }

    /// Accept `task` if the instance is idle.
    pub fn submit(&self, task: WorkerTask) -> Result<TaskHandle, SchedulerError> {
        let mut inner = self.lock();
        match inner.state {
            InstanceState::Ready => {}
            InstanceState::Draining | InstanceState::Stopped => {
                return Err(SchedulerError::InstanceRetired {
                    instance_id: self.id.clone(),
                })
            }
            InstanceState::Starting | InstanceState::Busy => {
                return Err(SchedulerError::RejectedBusy {
                    instance_id: self.id.clone(),
                })
            }
        }
        inner.state = inner.state.on(InstanceEvent::Submitted)?;

        let now = Instant::now();
        let (tx, rx) = mpsc::unbounded_channel();
        let task_id = task.task_id.clone();
        inner.last_used_at = now;
        inner.slot = Some(TaskSlot {
            task,
            submitted_at: now,
            pulled_at: None,
            stream: self.model.text_stream(self.filter.mode).map(TextStream::new),
            emitted: Vec::new(),
            events: tx,
        });
        drop(inner);

        debug!(instance_id = %self.id, %task_id, "task queued");
        self.task_queued.notify_one();

        Ok(TaskHandle {
            task_id,
            instance_id: self.id.clone(),
            events: rx,
            done: false,
        })
    }

    /// Hand the queued task to the backend. Each task is returned once.
    pub fn pull(&self) -> Option<WorkerTask> {
        let mut inner = self.lock();
        if inner.state.is_stopped() {
            return None;
        }
        let slot = inner.slot.as_mut()?;
        if slot.pulled_at.is_some() {
            return None;
        }
        slot.pulled_at = Some(Instant::now());
        debug!(instance_id = %self.id, task_id = %slot.task.task_id, "task pulled");
        Some(slot.task.clone())
    }

    /// Like [`ModelInstance::pull`], but waits up to `wait` for a task to be
    /// submitted. Returns early with `None` once the instance will never
    /// hand out another task.
    pub async fn pull_wait(&self, wait: Duration) -> Option<WorkerTask> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.task_queued.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.pull() {
                return Some(task);
            }
            if !self.accepts_pulls() {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    fn accepts_pulls(&self) -> bool {
        let inner = self.lock();
        match inner.state {
            InstanceState::Stopped => false,
            InstanceState::Draining => inner.slot.is_some(),
            _ => true,
        }
    }

    /// Apply one response pushed by the backend.
    pub fn push(&self, response: WorkerTaskResponse) -> Result<(), PushError> {
        let mut inner = self.lock();
        let slot = match inner.slot.as_mut() {
            Some(slot) if slot.task.task_id == response.task_id() => slot,
            other => {
                return Err(PushError::UnexpectedTask {
                    expected: other.map(|slot| slot.task.task_id.clone()),
                    got: response.task_id().to_string(),
                })
            }
        };
        if slot.pulled_at.is_none() {
            return Err(PushError::NotPulled(slot.task.task_id.clone()));
        }

        match response {
            WorkerTaskResponse::Stream { message, .. } => {
                let increments = match slot.stream.as_mut() {
                    Some(stream) => stream.feed(&message),
                    None if message.is_empty() => Vec::new(),
                    None => vec![message],
                };
                slot.emit(increments);
                return Ok(());
            }
            WorkerTaskResponse::Result { message, files, .. } => {
                let Some(mut slot) = inner.slot.take() else {
                    return Ok(());
                };
                if let Some(stream) = slot.stream.as_mut() {
                    let rest = stream.close();
                    slot.emit(rest);
                }
                info!(instance_id = %self.id, task_id = %slot.task.task_id, "task finished");
                let _ = slot.events.send(TaskEvent::Finished(TaskOutput {
                    task_id: slot.task.task_id,
                    message,
                    files,
                    increments: slot.emitted,
                }));
            }
            WorkerTaskResponse::Error { error, .. } => {
                let Some(slot) = inner.slot.take() else {
                    return Ok(());
                };
                warn!(
                    instance_id = %self.id,
                    task_id = %slot.task.task_id,
                    "backend reported task error: {error}"
                );
                slot.fail(TaskError::Backend { message: error });
            }
        }

        self.resolve(&mut inner);
        Ok(())
    }

    fn resolve(&self, inner: &mut InstanceInner) {
        inner.last_used_at = Instant::now();
        match inner.state.on(InstanceEvent::Resolved) {
            Ok(next) => inner.state = next,
            Err(e) => warn!(instance_id = %self.id, "{e}"),
        }
    }

    /// Fail the in-flight task if it missed a deadline.
    pub fn check_deadlines(
        &self,
        now: Instant,
        pull_timeout: Duration,
        resolve_timeout: Duration,
    ) -> Option<DeadlineOutcome> {
        let mut inner = self.lock();
        let slot = inner.slot.as_ref()?;
        let outcome = match slot.pulled_at {
            None if now.duration_since(slot.submitted_at) > pull_timeout => {
                DeadlineOutcome::PullExpired
            }
            Some(pulled_at) if now.duration_since(pulled_at) > resolve_timeout => {
                DeadlineOutcome::ResolveExpired
            }
            _ => return None,
        };

        let slot = inner.slot.take()?;
        let stage = match outcome {
            DeadlineOutcome::PullExpired => TimeoutStage::Pull,
            DeadlineOutcome::ResolveExpired => TimeoutStage::Resolve,
        };
        warn!(
            instance_id = %self.id,
            task_id = %slot.task.task_id,
            ?stage,
            "task timed out"
        );
        let task_id = slot.task.task_id.clone();
        slot.fail(TaskError::SchedulerTimeout { task_id, stage });

        if outcome == DeadlineOutcome::PullExpired {
            self.resolve(&mut inner);
        }
        Some(outcome)
    }

    /// Stop accepting work. Returns `true` when nothing is in flight, i.e.
    /// the instance can be stopped right away.
    pub fn drain(&self) -> Result<bool, TransitionError> {
        let mut inner = self.lock();
        inner.state = inner.state.on(InstanceEvent::Drain)?;
        let idle = inner.slot.is_none();
        drop(inner);
        self.task_queued.notify_waiters();
        Ok(idle)
    }

    /// Whether the instance is draining with nothing left in flight.
    pub fn is_drained(&self) -> bool {
        let inner = self.lock();
        inner.state == InstanceState::Draining && inner.slot.is_none()
    }

    /// Finish a drain: `Draining -> Stopped`, killing the process.
    pub fn stop(&self) -> Result<(), TransitionError> {
        let mut inner = self.lock();
        inner.state = inner.state.on(InstanceEvent::Stop)?;
        if let Some(kill) = inner.kill.take() {
            let _ = kill.send(());
        }
        drop(inner);
        self.task_queued.notify_waiters();
        Ok(())
    }

    /// The process is gone, or is being killed on the crash path. Any
    /// in-flight task fails with `error` (or `WorkerCrashed`); idempotent.
    pub fn mark_exited(&self, error: Option<TaskError>) {
        let mut inner = self.lock();
        let Ok(next) = inner.state.on(InstanceEvent::Exited) else {
            return;
        };
        inner.state = next;
        if let Some(slot) = inner.slot.take() {
            let error = error.unwrap_or_else(|| TaskError::WorkerCrashed {
                instance_id: self.id.clone(),
            });
            warn!(
                instance_id = %self.id,
                task_id = %slot.task.task_id,
                "failing in-flight task: {error}"
            );
            slot.fail(error);
        }
        if let Some(kill) = inner.kill.take() {
            let _ = kill.send(());
        }
        drop(inner);
        self.task_queued.notify_waiters();
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let now = Instant::now();
        let inner = self.lock();
        InstanceSnapshot {
            id: self.id.clone(),
            model_name: self.model.name(),
            filter: self.filter.clone(),
            state: inner.state,
            memory: self.memory,
            pid: inner.pid,
            current_task: inner.slot.as_ref().map(|slot| slot.task.task_id.clone()),
            age_secs: now.duration_since(self.created_at).as_secs(),
            idle_secs: now.duration_since(inner.last_used_at).as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use model_runtime::mistral::Mistral7bInstruct01;
    use model_runtime::sdxl::Sdxl;
    use protocol::{SessionMode, SessionType};

    use super::*;

    fn ready_instance(model: Arc<dyn Model>, session_type: SessionType) -> ModelInstance {
        let filter = Filter {
            mode: SessionMode::Inference,
            session_type,
            lora_dir: protocol::LORA_DIR_NONE.to_string(),
        };
        let instance = ModelInstance::new("inst".into(), model, filter, 1);
        let (kill, _rx) = oneshot::channel();
        instance.mark_launched(Some(42), kill).unwrap();
        instance
    }

    fn mistral() -> ModelInstance {
        ready_instance(Arc::new(Mistral7bInstruct01), SessionType::Text)
    }

    fn task(id: &str) -> WorkerTask {
        WorkerTask {
            task_id: id.into(),
            session_id: "s".into(),
            mode: SessionMode::Inference,
            session_type: SessionType::Text,
            lora_dir: String::new(),
            prompt: "[INST]hi[/INST]".into(),
            interaction_id: None,
        }
    }

    fn stream(id: &str, message: &str) -> WorkerTaskResponse {
        WorkerTaskResponse::Stream {
            task_id: id.into(),
            message: message.into(),
        }
    }

    fn result(id: &str, message: &str) -> WorkerTaskResponse {
        WorkerTaskResponse::Result {
            task_id: id.into(),
            message: message.into(),
            files: vec![],
        }
    }

    #[tokio::test]
    async fn submit_pull_stream_and_finish() {
        let instance = mistral();
        let mut handle = instance.submit(task("t1")).unwrap();
        assert_eq!(instance.state(), InstanceState::Busy);

        assert_eq!(instance.pull().unwrap().task_id, "t1");
        assert!(instance.pull().is_none(), "a task is handed out once");

        instance.push(stream("t1", "hel")).unwrap();
        instance.push(stream("t1", "lo wor")).unwrap();
        instance.push(stream("t1", "ld[/INST]tra")).unwrap();
        instance.push(stream("t1", "iling")).unwrap();
        instance.push(result("t1", "hello world")).unwrap();
        assert_eq!(instance.state(), InstanceState::Ready);

        assert_eq!(handle.next().await, Some(TaskEvent::Chunk("hello".into())));
        assert_eq!(handle.next().await, Some(TaskEvent::Chunk("world".into())));
        match handle.next().await {
            Some(TaskEvent::Finished(output)) => {
                assert_eq!(output.increments, vec!["hello", "world"]);
                assert_eq!(output.message, "hello world");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(handle.next().await, None);
    }

    #[tokio::test]
    async fn close_flushes_trailing_token_on_result() {
        let instance = mistral();
        let handle = instance.submit(task("t1")).unwrap();
        instance.pull().unwrap();
        instance.push(stream("t1", "one tw")).unwrap();
        instance.push(result("t1", "")).unwrap();
        let output = handle.wait().await.unwrap();
        assert_eq!(output.increments, vec!["one", "tw"]);
    }

    #[test]
    fn second_submit_is_rejected_while_busy() {
        let instance = mistral();
        let _handle = instance.submit(task("t1")).unwrap();
        match instance.submit(task("t2")) {
            Err(SchedulerError::RejectedBusy { instance_id }) => {
                assert_eq!(instance_id, "inst")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn submit_before_launch_is_rejected() {
        let filter = Filter {
            mode: SessionMode::Inference,
            session_type: SessionType::Text,
            lora_dir: protocol::LORA_DIR_NONE.to_string(),
        };
        let instance = ModelInstance::new("i".into(), Arc::new(Mistral7bInstruct01), filter, 1);
        assert!(matches!(
            instance.submit(task("t1")),
            Err(SchedulerError::RejectedBusy { .. })
        ));
    }

    #[test]
    fn pushes_are_correlated_by_task() {
        let instance = mistral();
        assert_eq!(
            instance.push(stream("t1", "x")),
            Err(PushError::UnexpectedTask {
                expected: None,
                got: "t1".into()
            })
        );

        let _handle = instance.submit(task("t1")).unwrap();
        assert_eq!(
            instance.push(stream("t1", "x")),
            Err(PushError::NotPulled("t1".into()))
        );
        instance.pull().unwrap();
        assert!(matches!(
            instance.push(result("other", "")),
            Err(PushError::UnexpectedTask { .. })
        ));
    }

    #[tokio::test]
    async fn backend_error_fails_task_with_partial_output() {
        let instance = mistral();
        let handle = instance.submit(task("t1")).unwrap();
        instance.pull().unwrap();
        instance.push(stream("t1", "partial answer ")).unwrap();
        instance
            .push(WorkerTaskResponse::Error {
                task_id: "t1".into(),
                error: "cuda oom".into(),
            })
            .unwrap();
        assert_eq!(instance.state(), InstanceState::Ready);

        let failure = handle.wait().await.unwrap_err();
        assert_eq!(
            failure.error,
            TaskError::Backend {
                message: "cuda oom".into()
            }
        );
        assert_eq!(failure.partial, vec!["partial", "answer"]);
    }

    #[tokio::test]
    async fn exit_mid_task_reports_crash() {
        let instance = mistral();
        let handle = instance.submit(task("t1")).unwrap();
        instance.pull().unwrap();
        instance.push(stream("t1", "so far ")).unwrap();
        instance.mark_exited(None);

        assert_eq!(instance.state(), InstanceState::Stopped);
        let failure = handle.wait().await.unwrap_err();
        assert_eq!(
            failure.error,
            TaskError::WorkerCrashed {
                instance_id: "inst".into()
            }
        );
        assert_eq!(failure.partial, vec!["so", "far"]);
        assert!(matches!(
            instance.submit(task("t2")),
            Err(SchedulerError::InstanceRetired { .. })
        ));
    }

    #[test]
    fn draining_instance_reports_retired_not_busy() {
        let instance = mistral();
        assert!(instance.drain().unwrap());
        match instance.submit(task("t1")) {
            Err(SchedulerError::InstanceRetired { instance_id }) => {
                assert_eq!(instance_id, "inst")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn touch_refreshes_last_used() {
        let instance = mistral();
        let before = instance.last_used_at();
        tokio::time::advance(Duration::from_secs(10)).await;
        instance.touch();
        assert_eq!(instance.last_used_at(), before + Duration::from_secs(10));
    }

    #[tokio::test]
    async fn non_streaming_models_forward_raw_chunks() {
        let instance = ready_instance(Arc::new(Sdxl), SessionType::Image);
        let handle = instance.submit(task("t1")).unwrap();
        instance.pull().unwrap();
        instance.push(stream("t1", "step 1/30")).unwrap();
        instance
            .push(WorkerTaskResponse::Result {
                task_id: "t1".into(),
                message: String::new(),
                files: vec!["/tmp/out.png".into()],
            })
            .unwrap();
        let output = handle.wait().await.unwrap();
        assert_eq!(output.increments, vec!["step 1/30"]);
        assert_eq!(output.files, vec!["/tmp/out.png"]);
    }

    #[tokio::test(start_paused = true)]
    async fn unpulled_task_times_out_and_frees_instance() {
        let instance = mistral();
        let handle = instance.submit(task("t1")).unwrap();
        let timeout = Duration::from_secs(30);

        assert_eq!(
            instance.check_deadlines(Instant::now(), timeout, timeout),
            None
        );
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            instance.check_deadlines(Instant::now(), timeout, timeout),
            Some(DeadlineOutcome::PullExpired)
        );
        assert_eq!(instance.state(), InstanceState::Ready);
        assert!(matches!(
            handle.wait().await.unwrap_err().error,
            TaskError::SchedulerTimeout {
                stage: TimeoutStage::Pull,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pulled_task_past_resolve_deadline_is_reported() {
        let instance = mistral();
        let handle = instance.submit(task("t1")).unwrap();
        instance.pull().unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            instance.check_deadlines(
                Instant::now(),
                Duration::from_secs(10),
                Duration::from_secs(60)
            ),
            Some(DeadlineOutcome::ResolveExpired)
        );
        assert!(matches!(
            handle.wait().await.unwrap_err().error,
            TaskError::SchedulerTimeout {
                stage: TimeoutStage::Resolve,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn pull_wait_wakes_on_submit() {
        let instance = Arc::new(mistral());
        let waiter = {
            let instance = instance.clone();
            tokio::spawn(async move { instance.pull_wait(Duration::from_secs(10)).await })
        };
        tokio::task::yield_now().await;
        let _handle = instance.submit(task("t1")).unwrap();
        let pulled = waiter.await.unwrap();
        assert_eq!(pulled.map(|t| t.task_id), Some("t1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn pull_wait_times_out_without_task() {
        let instance = mistral();
        assert!(instance.pull_wait(Duration::from_secs(5)).await.is_none());
    }

    #[tokio::test]
    async fn draining_busy_instance_finishes_task_first() {
        let instance = mistral();
        let handle = instance.submit(task("t1")).unwrap();
        instance.pull().unwrap();

        assert!(!instance.drain().unwrap());
        assert!(!instance.is_drained());
        instance.push(result("t1", "done")).unwrap();
        assert!(instance.is_drained());
        instance.stop().unwrap();
        assert_eq!(instance.state(), InstanceState::Stopped);
        assert!(handle.wait().await.is_ok());
    }
}
