// SPDX-License-Identifier: PolyForm-Shield-1.0

use protocol::{ModelName, Session, SessionMode, SessionType, WorkerTask};

use crate::{session_task, LaunchCommand, Model, ModelError, ProcessConfig, TextStreamConfig, GB};

/// Stable Diffusion XL base 1.0, served by an sd-scripts checkout.
///
/// Image sessions produce files rather than text, so no mode streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sdxl;

impl Model for Sdxl {
    fn name(&self) -> ModelName {
        ModelName::Sdxl
    }

    fn memory_requirements(&self, mode: SessionMode) -> u64 {
        match mode {
            SessionMode::Finetune => GB * 24,
            SessionMode::Inference => GB * 12,
        }
    }

    fn session_type(&self) -> SessionType {
        SessionType::Image
    }

    fn task(&self, session: &Session) -> Result<WorkerTask, ModelError> {
        session_task(session, str::to_string)
    }

    fn text_stream(&self, _mode: SessionMode) -> Option<TextStreamConfig> {
        None
    }

    fn command(
        &self,
        mode: SessionMode,
        config: &ProcessConfig,
    ) -> Result<LaunchCommand, ModelError> {
        let script = match mode {
            SessionMode::Inference => "python -u sdxl_inference_worker.py",
            SessionMode::Finetune => {
                "accelerate launch --num_cpu_threads_per_process 1 sdxl_train_worker.py \
                 --network_module=networks.lora"
            }
        };
        Ok(LaunchCommand::venv_script(
            config.backend_root.join("sd-scripts"),
            script,
            config.base_env(),
        ))
    }
}
