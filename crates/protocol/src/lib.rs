// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// adapter slot value meaning "this instance has no lora adapter loaded".
///
/// sessions express "no adapter" as an empty `lora_dir`; instances record the
/// sentinel instead so that an unset adapter can never be confused with a
/// path.
pub const LORA_DIR_NONE: &str = "none";

/// whether a session runs the model for generation or trains an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Inference,
    Finetune,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Inference => f.write_str("inference"),
            SessionMode::Finetune => f.write_str("finetune"),
        }
    }
}

/// the kind of output a session produces. a model serves exactly one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Text,
    Image,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionType::Text => f.write_str("text"),
            SessionType::Image => f.write_str("image"),
        }
    }
}

/// logical identifier for one of the built-in model variants.
///
/// the serialized form is the upstream model slug so that sessions created by
/// the api layer can name models the way operators know them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelName {
    #[serde(rename = "mistralai/Mistral-7B-Instruct-v0.1")]
    Mistral7bInstruct01,
    #[serde(rename = "stabilityai/stable-diffusion-xl-base-1.0")]
    Sdxl,
}

impl ModelName {
    pub const ALL: [ModelName; 2] = [ModelName::Mistral7bInstruct01, ModelName::Sdxl];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelName::Mistral7bInstruct01 => "mistralai/Mistral-7B-Instruct-v0.1",
            ModelName::Sdxl => "stabilityai/stable-diffusion-xl-base-1.0",
        }
    }
}

impl fmt::Display for ModelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown model name: {0}")]
pub struct UnknownModelName(pub String);

impl FromStr for ModelName {
    type Err = UnknownModelName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownModelName(s.to_string()))
    }
}

/// who authored an interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreatorType {
    User,
    System,
}

/// one turn of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub creator: CreatorType,
    pub message: String,
}

/// errors raised when reading interactions off a session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session has no messages")]
    NoInteractions,
    #[error("session does not have a system interaction as last message")]
    LastNotSystem,
}

/// a validated unit of user work handed to the runner by the api layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub mode: SessionMode,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    pub model_name: ModelName,
    /// adapter directory; empty means "no adapter".
    #[serde(default)]
    pub lora_dir: String,
    pub interactions: Vec<Interaction>,
}

impl Session {
    /// The most recent interaction, if any.
    pub fn last_interaction(&self) -> Result<&Interaction, SessionError> {
        self.interactions.last().ok_or(SessionError::NoInteractions)
    }

    /// Id of the interaction a reply should be written into.
    ///
    /// The api layer appends an empty system interaction before scheduling;
    /// anything else as the last message means there is nowhere to put the
    /// reply.
    pub fn reply_interaction_id(&self) -> Result<&str, SessionError> {
        let interaction = self.last_interaction()?;
        if interaction.creator != CreatorType::System {
            return Err(SessionError::LastNotSystem);
        }
        Ok(&interaction.id)
    }
}

/// key used to match a session to a running model instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Filter {
    pub mode: SessionMode,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    /// adapter directory, or [`LORA_DIR_NONE`].
    pub lora_dir: String,
}

impl Filter {
    /// Derive the instance filter a session requires.
    pub fn for_session(session: &Session) -> Self {
        let lora_dir = if session.lora_dir.is_empty() {
            LORA_DIR_NONE.to_string()
        } else {
            session.lora_dir.clone()
        };
        Self {
            mode: session.mode,
            session_type: session.session_type,
            lora_dir,
        }
    }

    /// Whether an instance bound to this filter may serve `session`.
    ///
    /// Adapter identity is part of output correctness: an instance with one
    /// adapter never serves a session asking for another one, or for none.
    pub fn matches_session(&self, session: &Session) -> bool {
        self.mode == session.mode
            && self.session_type == session.session_type
            && (self.lora_dir == session.lora_dir
                || (self.lora_dir == LORA_DIR_NONE && session.lora_dir.is_empty()))
    }

    /// The adapter path, or `None` for the sentinel.
    pub fn adapter(&self) -> Option<&str> {
        if self.lora_dir == LORA_DIR_NONE || self.lora_dir.is_empty() {
            None
        } else {
            Some(&self.lora_dir)
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.mode, self.session_type, self.lora_dir)
    }
}

/// unit of work handed to a backend process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTask {
    pub task_id: String,
    pub session_id: String,
    pub mode: SessionMode,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    #[serde(default)]
    pub lora_dir: String,
    pub prompt: String,
    /// interaction the reply belongs to, when the session names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
}

/// payload a backend process pushes back for the task it pulled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerTaskResponse {
    /// raw partial output; cleaned by the instance's text stream.
    Stream { task_id: String, message: String },
    /// final output of the task.
    Result {
        task_id: String,
        #[serde(default)]
        message: String,
        #[serde(default)]
        files: Vec<String>,
    },
    /// the backend gave up on the task.
    Error { task_id: String, error: String },
}

impl WorkerTaskResponse {
    pub fn task_id(&self) -> &str {
        match self {
            WorkerTaskResponse::Stream { task_id, .. }
            | WorkerTaskResponse::Result { task_id, .. }
            | WorkerTaskResponse::Error { task_id, .. } => task_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(mode: SessionMode, lora_dir: &str) -> Session {
        Session {
            id: "s1".into(),
            mode,
            session_type: SessionType::Text,
            model_name: ModelName::Mistral7bInstruct01,
            lora_dir: lora_dir.into(),
            interactions: vec![Interaction {
                id: "i1".into(),
                creator: CreatorType::User,
                message: "hi".into(),
            }],
        }
    }

    #[test]
    fn empty_lora_dir_maps_to_sentinel() {
        let filter = Filter::for_session(&session(SessionMode::Inference, ""));
        assert_eq!(filter.lora_dir, LORA_DIR_NONE);
        assert_eq!(filter.adapter(), None);
        assert!(filter.matches_session(&session(SessionMode::Inference, "")));
    }

    #[test]
    fn adapter_filters_do_not_cross_match() {
        let with_adapter = Filter::for_session(&session(SessionMode::Inference, "adapters/foo"));
        assert_eq!(with_adapter.adapter(), Some("adapters/foo"));
        assert!(!with_adapter.matches_session(&session(SessionMode::Inference, "")));
        assert!(!with_adapter.matches_session(&session(SessionMode::Inference, "adapters/bar")));

        let without = Filter::for_session(&session(SessionMode::Inference, ""));
        assert!(!without.matches_session(&session(SessionMode::Inference, "adapters/foo")));
    }

    #[test]
    fn mode_mismatch_does_not_match() {
        let filter = Filter::for_session(&session(SessionMode::Inference, ""));
        assert!(!filter.matches_session(&session(SessionMode::Finetune, "")));
    }

    #[test]
    fn reply_interaction_requires_system_creator() {
        let mut s = session(SessionMode::Inference, "");
        assert_eq!(s.reply_interaction_id(), Err(SessionError::LastNotSystem));

        s.interactions.push(Interaction {
            id: "i2".into(),
            creator: CreatorType::System,
            message: String::new(),
        });
        assert_eq!(s.reply_interaction_id(), Ok("i2"));

        s.interactions.clear();
        assert_eq!(s.reply_interaction_id(), Err(SessionError::NoInteractions));
    }

    #[test]
    fn model_name_parses_slug() {
        let name: ModelName = "mistralai/Mistral-7B-Instruct-v0.1".parse().unwrap();
        assert_eq!(name, ModelName::Mistral7bInstruct01);
        assert!("gpt-2".parse::<ModelName>().is_err());
    }

    #[test]
    fn worker_response_uses_type_tag() {
        let json = r#"{"type":"stream","task_id":"t1","message":"hello"}"#;
        let parsed: WorkerTaskResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            parsed,
            WorkerTaskResponse::Stream {
                task_id: "t1".into(),
                message: "hello".into()
            }
        );

        let json = r#"{"type":"result","task_id":"t1"}"#;
        let parsed: WorkerTaskResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.task_id(), "t1");
    }
}
