// SPDX-License-Identifier: PolyForm-Shield-1.0

use protocol::{ModelName, Session, SessionMode, SessionType, WorkerTask};

use crate::{
    session_task, LaunchCommand, Model, ModelError, ProcessConfig, SplitPolicy, TextStreamConfig,
    GB,
};

/// Mistral 7B instruct v0.1, served by an axolotl checkout.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mistral7bInstruct01;

impl Model for Mistral7bInstruct01 {
    fn name(&self) -> ModelName {
        ModelName::Mistral7bInstruct01
    }

    fn memory_requirements(&self, mode: SessionMode) -> u64 {
        match mode {
            SessionMode::Finetune => GB * 12,
            SessionMode::Inference => GB * 6,
        }
    }

    fn session_type(&self) -> SessionType {
        SessionType::Text
    }

    fn task(&self, session: &Session) -> Result<WorkerTask, ModelError> {
        session_task(session, |message| format!("[INST]{message}[/INST]"))
    }

    fn text_stream(&self, mode: SessionMode) -> Option<TextStreamConfig> {
        match mode {
            SessionMode::Inference => Some(TextStreamConfig::new(
                SplitPolicy::Whitespace,
                ["[/INST]", "</s>"],
            )),
            SessionMode::Finetune => None,
        }
    }

    fn command(
        &self,
        mode: SessionMode,
        config: &ProcessConfig,
    ) -> Result<LaunchCommand, ModelError> {
        match mode {
            SessionMode::Inference => Ok(LaunchCommand::venv_script(
                config.backend_root.join("axolotl"),
                "python -u -m axolotl.cli.inference examples/mistral/qlora-instruct.yml",
                config.base_env(),
            )),
            SessionMode::Finetune => Err(ModelError::UnsupportedMode {
                model_name: self.name(),
                mode,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use protocol::{CreatorType, Interaction};

    use super::*;
    use crate::{LORA_DIR_ENV, RESPONSE_URL_ENV, TASK_URL_ENV};

    fn session(messages: &[&str]) -> Session {
        Session {
            id: "ses".into(),
            mode: SessionMode::Inference,
            session_type: SessionType::Text,
            model_name: ModelName::Mistral7bInstruct01,
            lora_dir: String::new(),
            interactions: messages
                .iter()
                .enumerate()
                .map(|(i, m)| Interaction {
                    id: format!("i{i}"),
                    creator: CreatorType::User,
                    message: m.to_string(),
                })
                .collect(),
        }
    }

    fn process_config(lora_dir: Option<&str>) -> ProcessConfig {
        ProcessConfig {
            task_url: "http://127.0.0.1:8060/api/v1/worker/task/abc".into(),
            response_url: "http://127.0.0.1:8060/api/v1/worker/response/abc".into(),
            backend_root: PathBuf::from(".."),
            lora_dir: lora_dir.map(str::to_string),
        }
    }

    #[test]
    fn memory_tiers() {
        let model = Mistral7bInstruct01;
        assert_eq!(model.memory_requirements(SessionMode::Inference), 6 * GB);
        assert_eq!(model.memory_requirements(SessionMode::Finetune), 12 * GB);
    }

    #[test]
    fn task_wraps_last_message_in_instruction_tokens() {
        let task = Mistral7bInstruct01
            .task(&session(&["first", "what is rust?"]))
            .unwrap();
        assert_eq!(task.prompt, "[INST]what is rust?[/INST]");
        assert_eq!(task.task_id, "ses-i1");
        assert_eq!(task.session_id, "ses");
        assert_eq!(task.interaction_id, None);
    }

    #[test]
    fn task_on_empty_session_fails() {
        assert_eq!(
            Mistral7bInstruct01.task(&session(&[])),
            Err(ModelError::EmptySession)
        );
    }

    #[test]
    fn only_inference_streams() {
        let config = Mistral7bInstruct01
            .text_stream(SessionMode::Inference)
            .unwrap();
        assert_eq!(config.split, SplitPolicy::Whitespace);
        assert_eq!(config.stop_markers, vec!["[/INST]", "</s>"]);
        assert!(Mistral7bInstruct01
            .text_stream(SessionMode::Finetune)
            .is_none());
    }

    #[test]
    fn inference_command_passes_endpoints() {
        let cmd = Mistral7bInstruct01
            .command(SessionMode::Inference, &process_config(Some("adapters/foo")))
            .unwrap();
        assert_eq!(cmd.program, "/bin/bash");
        assert_eq!(cmd.args[0], "-c");
        assert!(cmd.args[1].contains("axolotl.cli.inference"));
        assert_eq!(cmd.current_dir, PathBuf::from("../axolotl"));
        assert!(cmd.env.contains(&(
            TASK_URL_ENV.to_string(),
            "http://127.0.0.1:8060/api/v1/worker/task/abc".to_string()
        )));
        assert!(cmd.env.contains(&(
            RESPONSE_URL_ENV.to_string(),
            "http://127.0.0.1:8060/api/v1/worker/response/abc".to_string()
        )));
        assert!(cmd
            .env
            .contains(&(LORA_DIR_ENV.to_string(), "adapters/foo".to_string())));
    }

    #[test]
    fn finetune_command_is_unsupported() {
        assert_eq!(
            Mistral7bInstruct01.command(SessionMode::Finetune, &process_config(None)),
            Err(ModelError::UnsupportedMode {
                model_name: ModelName::Mistral7bInstruct01,
                mode: SessionMode::Finetune,
            })
        );
    }
}
