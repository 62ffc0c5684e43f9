// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::collections::HashMap;
use std::sync::Arc;

use protocol::{ModelName, SessionType};

use crate::mistral::Mistral7bInstruct01;
use crate::sdxl::Sdxl;
use crate::{Model, ModelError};

/// Lookup table from model name to its capability object.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<ModelName, Arc<dyn Model>>,
}

impl ModelRegistry {
    /// An empty registry; mostly useful for tests registering their own
    /// descriptors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in model.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Mistral7bInstruct01));
        registry.register(Arc::new(Sdxl));
        registry
    }

    /// Register `model` under its own name, replacing any previous entry.
    pub fn register(&mut self, model: Arc<dyn Model>) {
        self.models.insert(model.name(), model);
    }

    /// Resolve the descriptor for a session's type and model name.
    ///
    /// A model registered under `name` but serving another session type is
    /// treated as unknown.
    pub fn lookup(
        &self,
        session_type: SessionType,
        name: ModelName,
    ) -> Result<Arc<dyn Model>, ModelError> {
        self.models
            .get(&name)
            .filter(|model| model.session_type() == session_type)
            .cloned()
            .ok_or(ModelError::UnknownModel {
                model_name: name,
                session_type,
            })
    }

    /// Registered models, ordered by name.
    pub fn models(&self) -> Vec<Arc<dyn Model>> {
        let mut models: Vec<_> = self.models.values().cloned().collect();
        models.sort_by_key(|model| model.name().as_str());
        models
    }
}
