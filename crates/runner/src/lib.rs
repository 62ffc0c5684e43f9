// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::sync::Arc;

use anyhow::Result;
use config::RunnerConfig;
use model_runtime::ModelRegistry;
use tokio::sync::watch;
use tracing::info;

pub mod backend;
pub mod endpoint;
pub mod error;
pub mod instance;
pub mod process;
pub mod runner;
pub mod server;
pub mod shutdown;
pub mod state;

pub use endpoint::{HttpTaskClient, LocalEndpoint, TaskEndpoint};
pub use error::{ProcessError, PushError, SchedulerError, TaskError, TimeoutStage};
pub use instance::{ModelInstance, TaskEvent, TaskFailure, TaskHandle, TaskOutput};
pub use runner::{CancelMode, Runner, RunnerSettings, RunnerSnapshot, SweepReport};
pub use state::InstanceState;

/// Run a runner node until ctrl-c: worker api, sweeper and real backend
/// processes.
pub async fn run(config: RunnerConfig) -> Result<()> {
    info!(
        "starting runner node: budget {} GB, api on {}",
        config.memory_budget_gb, config.api_socket
    );

    let settings = RunnerSettings::from_config(&config)?;
    let launcher = Arc::new(process::ProcessManager::new());
    let runner = Runner::new(settings, ModelRegistry::builtin(), launcher);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = runner.spawn_sweeper(shutdown_rx);

    server::serve(config.api_socket, runner.clone(), shutdown::wait_for_signal()).await?;

    info!("shutting down runner node");
    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;
    runner.shutdown().await;

    Ok(())
}
