use super::registry::{ModelRegistry, ModelSpec, ModelTier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// Picks the model the active provider should be called with.
    ///
    /// Prefers the configured tier; any tier of the same provider is the
    /// next choice, and the reason is recorded so callers can surface it.
    pub fn resolve(
        &self,
        provider: &str,
        capability: &str,
        tier: ModelTier,
    ) -> Result<ModelSelection, String> {
        let candidates = self.registry.for_provider(provider, capability);
        if let Some(model) = candidates.iter().find(|model| model.tier == tier) {
            return Ok(ModelSelection {
                model: model.clone(),
                requested: Some(format!("{provider}/{tier}")),
                fallback_reason: None,
            });
        }
        let Some(model) = candidates.first().cloned() else {
            return Err(format!(
                "Provider '{provider}' has no model for capability '{capability}'."
            ));
        };
        Ok(ModelSelection {
            fallback_reason: Some(format!(
                "No {tier} model for '{capability}' on '{provider}'; using '{}'.",
                model.name
            )),
            model,
            requested: Some(format!("{provider}/{tier}")),
        })
    }
}
