//! Model gateway with a bounded client cache.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use grav_core::{ChatModel, CoreResult, ModelProvider, ModelSettings};

use crate::error::LlmResult;
use crate::openai::OpenAiChatModel;

type ModelFactory = dyn Fn(&str) -> LlmResult<Arc<dyn ChatModel>> + Send + Sync;

/// Resolves model names to configured clients.
///
/// Clients are kept in a least-recently-used cache keyed by model name.
pub struct ModelGateway {
    default_model: String,
    capacity: usize,
    factory: Box<ModelFactory>,
    cache: Mutex<VecDeque<(String, Arc<dyn ChatModel>)>>,
}

impl ModelGateway {
    /// Gateway creating OpenAI-compatible clients from the model settings.
    pub fn from_settings(settings: &ModelSettings) -> Self {
        let settings_for_factory = settings.clone();
        Self::with_factory(&settings.name, settings.cache_size, move |name| {
            let model = OpenAiChatModel::from_settings(&settings_for_factory, name)?;
            Ok(Arc::new(model) as Arc<dyn ChatModel>)
        })
    }

    pub fn with_factory<F>(default_model: &str, capacity: usize, factory: F) -> Self
    where
        F: Fn(&str) -> LlmResult<Arc<dyn ChatModel>> + Send + Sync + 'static,
    {
        Self {
            default_model: default_model.to_string(),
            capacity: capacity.max(1),
            factory: Box::new(factory),
            cache: Mutex::new(VecDeque::new()),
        }
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Names of cached clients, most recently used first.
    pub fn cached(&self) -> Vec<String> {
        self.cache.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    fn resolve(&self, name: &str) -> LlmResult<Arc<dyn ChatModel>> {
        let mut cache = self.cache.lock();
        if let Some(pos) = cache.iter().position(|(cached, _)| cached == name) {
            if let Some(entry) = cache.remove(pos) {
                let model = entry.1.clone();
                cache.push_front(entry);
                return Ok(model);
            }
        }

        debug!("Creating model client for {}", name);
        let model = (self.factory)(name)?;
        cache.push_front((name.to_string(), model.clone()));
        if cache.len() > self.capacity {
            if let Some((evicted, _)) = cache.pop_back() {
                debug!("Evicted model client {}", evicted);
            }
        }
        Ok(model)
    }
}

impl ModelProvider for ModelGateway {
    fn model(&self, name: Option<&str>) -> CoreResult<Arc<dyn ChatModel>> {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(self.default_model.as_str());
        Ok(self.resolve(name)?)
    }
}

impl std::fmt::Debug for ModelGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelGateway")
            .field("default_model", &self.default_model)
            .field("capacity", &self.capacity)
            .field("cached", &self.cached())
            .finish()
    }
}
