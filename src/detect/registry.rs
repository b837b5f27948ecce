use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::config::ModelSettings;

use super::backend::{DetectionAdapter, DetectorProvider};

type Factory = Box<dyn Fn(&ModelSettings) -> Result<Box<dyn DetectionAdapter>> + Send + Sync>;

/// Registry of detection adapter factories, keyed by model name.
///
/// The first registered model becomes the fallback for names that are not
/// registered, unless `strict` is set.
pub struct DetectorRegistry {
    factories: HashMap<String, Factory>,
    default_name: Option<String>,
    strict: bool,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            default_name: None,
            strict: false,
        }
    }

    /// Refuse to fall back to the default factory for unknown model names.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Register a factory for `model`. The first registered model becomes the default.
    pub fn register<A, F>(&mut self, model: &str, factory: F)
    where
        A: DetectionAdapter + 'static,
        F: Fn(&ModelSettings) -> Result<A> + Send + Sync + 'static,
    {
        if self.default_name.is_none() {
            self.default_name = Some(model.to_string());
        }
        let boxed: Factory = Box::new(move |settings: &ModelSettings| {
            let adapter: Box<dyn DetectionAdapter> = Box::new(factory(settings)?);
            Ok(adapter)
        });
        self.factories.insert(model.to_string(), boxed);
    }

    /// Set default model by name.
    pub fn set_default(&mut self, model: &str) -> Result<()> {
        if !self.factories.contains_key(model) {
            return Err(anyhow!("model '{}' not registered", model));
        }
        self.default_name = Some(model.to_string());
        Ok(())
    }

    /// List registered model names.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    fn factory_for(&self, model: &str) -> Result<&Factory> {
        if let Some(factory) = self.factories.get(model) {
            return Ok(factory);
        }
        if self.strict {
            return Err(anyhow!("model '{}' not registered", model));
        }
        self.default_name
            .as_ref()
            .and_then(|name| self.factories.get(name))
            .ok_or_else(|| anyhow!("no detector registered (requested '{}')", model))
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorProvider for DetectorRegistry {
    fn load(&self, model: &ModelSettings) -> Result<Box<dyn DetectionAdapter>> {
        let factory = self.factory_for(&model.model)?;
        let mut adapter = factory(model)?;
        adapter.warm_up()?;
        log::info!(
            "detector '{}' loaded for model {} on {}",
            adapter.name(),
            model.model,
            model.device
        );
        Ok(adapter)
    }
}
