// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::sync::Arc;
use std::time::Duration;

use config::RunnerConfig;
use model_runtime::{ModelRegistry, RESPONSE_URL_ENV, TASK_URL_ENV};
use protocol::{
    CreatorType, Interaction, ModelName, Session, SessionMode, SessionType, WorkerTaskResponse,
};
use runner::backend::InMemoryLauncher;
use runner::endpoint::EndpointError;
use runner::{HttpTaskClient, Runner, RunnerSettings, TaskEndpoint, TaskEvent};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct Harness {
    runner: Runner,
    launcher: Arc<InMemoryLauncher>,
    base: String,
    stop: Option<oneshot::Sender<()>>,
}

impl Harness {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let config = RunnerConfig {
            memory_budget_gb: 24,
            api_socket: addr,
            pull_wait_secs: 1,
            ..RunnerConfig::default()
        };
        let launcher = Arc::new(InMemoryLauncher::new());
        let runner = Runner::new(
            RunnerSettings::from_config(&config).unwrap(),
            ModelRegistry::builtin(),
            launcher.clone(),
        );

        let (stop, stopped) = oneshot::channel::<()>();
        tokio::spawn(runner::server::serve_on(listener, runner.clone(), async move {
            let _ = stopped.await;
        }));

        Self {
            runner,
            launcher,
            base: format!("http://{addr}"),
            stop: Some(stop),
        }
    }

    /// Client built from the environment the instance was launched with.
    fn client_for(&self, instance_id: &str) -> HttpTaskClient {
        let launch = self
            .launcher
            .launches()
            .into_iter()
            .find(|l| l.instance_id == instance_id)
            .unwrap();
        let env = |key: &str| {
            launch
                .command
                .env
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        HttpTaskClient::new(env(TASK_URL_ENV), env(RESPONSE_URL_ENV))
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

fn session(id: &str, message: &str) -> Session {
    Session {
        id: id.into(),
        mode: SessionMode::Inference,
        session_type: SessionType::Text,
        model_name: ModelName::Mistral7bInstruct01,
        lora_dir: String::new(),
        interactions: vec![
            Interaction {
                id: "u1".into(),
                creator: CreatorType::User,
                message: message.into(),
            },
            Interaction {
                id: "a1".into(),
                creator: CreatorType::System,
                message: String::new(),
            },
        ],
    }
}

#[tokio::test]
async fn backend_streams_a_task_over_http() {
    let harness = Harness::start().await;
    let mut handle = harness
        .runner
        .submit_session(&session("s1", "why is the sky blue"))
        .await
        .unwrap();
    let client = harness.client_for(handle.instance_id());

    let task = client.pull().await.unwrap().unwrap();
    assert_eq!(task.task_id, handle.task_id());
    assert_eq!(task.interaction_id.as_deref(), Some("a1"));

    for fragment in ["Ray", "leigh scat", "tering[/INST] junk"] {
        client
            .push(WorkerTaskResponse::Stream {
                task_id: task.task_id.clone(),
                message: fragment.into(),
            })
            .await
            .unwrap();
    }
    client
        .push(WorkerTaskResponse::Result {
            task_id: task.task_id.clone(),
            message: "Rayleigh scattering".into(),
            files: vec![],
        })
        .await
        .unwrap();

    assert_eq!(handle.next().await, Some(TaskEvent::Chunk("Rayleigh".into())));
    assert_eq!(
        handle.next().await,
        Some(TaskEvent::Chunk("scattering".into()))
    );
    match handle.next().await {
        Some(TaskEvent::Finished(output)) => assert_eq!(output.message, "Rayleigh scattering"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn idle_pull_answers_no_content() {
    let harness = Harness::start().await;
    let instance = harness
        .runner
        .schedule(&session("s1", "hi"))
        .await
        .unwrap();
    let client = harness.client_for(instance.id());

    let pulled = tokio::time::timeout(Duration::from_secs(5), client.pull())
        .await
        .unwrap()
        .unwrap();
    assert!(pulled.is_none());
}

#[tokio::test]
async fn protocol_errors_map_to_status_codes() {
    let harness = Harness::start().await;
    let instance = harness
        .runner
        .schedule(&session("s1", "hi"))
        .await
        .unwrap();
    let client = harness.client_for(instance.id());

    let stray = client
        .push(WorkerTaskResponse::Result {
            task_id: "nobody-asked".into(),
            message: String::new(),
            files: vec![],
        })
        .await;
    assert!(matches!(stray, Err(EndpointError::Status(409))));

    let unknown = HttpTaskClient::new(
        format!("{}/api/v1/worker/task/missing", harness.base),
        format!("{}/api/v1/worker/response/missing", harness.base),
    );
    assert!(matches!(unknown.pull().await, Err(EndpointError::Status(404))));
}

#[tokio::test]
async fn state_endpoint_reports_the_pool() {
    let harness = Harness::start().await;
    let instance = harness
        .runner
        .schedule(&session("s1", "hi"))
        .await
        .unwrap();

    let state: serde_json::Value = reqwest::get(format!("{}/api/v1/state", harness.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(state["memory_used"], serde_json::json!(6u64 * model_runtime::GB));
    assert_eq!(state["instances"][0]["id"], instance.id());
    assert_eq!(state["instances"][0]["state"], "ready");
    assert_eq!(state["instances"][0]["filter"]["lora_dir"], "none");
}
