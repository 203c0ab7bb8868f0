use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    #[default]
    Standard,
    Pro,
}

impl ModelTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelTier::Standard => "standard",
            ModelTier::Pro => "pro",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelTier {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "standard" | "flash" | "fast" => Ok(ModelTier::Standard),
            "pro" | "high" | "quality" => Ok(ModelTier::Pro),
            other => Err(format!("Unknown model tier '{other}'.")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    pub tier: ModelTier,
    /// Lower-tier model to retry once against when this one is out of quota.
    pub fallback: Option<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn for_provider(&self, provider: &str, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.provider == provider && model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }

    /// Degradation target for `name`, only if it still serves `capability`.
    pub fn fallback_for(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let fallback = self.get(name)?.fallback.as_deref()?;
        self.ensure(fallback, capability)
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str,
                      provider: &str,
                      capabilities: &[&str],
                      tier: ModelTier,
                      fallback: Option<&str>| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
                tier,
                fallback: fallback.map(str::to_string),
            },
        );
    };

    insert(
        "dryrun-text-1",
        "dryrun",
        &["text", "vision"],
        ModelTier::Standard,
        None,
    );
    insert(
        "dryrun-image-1",
        "dryrun",
        &["image", "edit", "blend", "vector"],
        ModelTier::Standard,
        None,
    );
    insert(
        "dryrun-image-pro",
        "dryrun",
        &["image", "edit", "blend"],
        ModelTier::Pro,
        Some("dryrun-image-1"),
    );
    insert(
        "dryrun-video-1",
        "dryrun",
        &["video"],
        ModelTier::Standard,
        None,
    );
    insert(
        "gemini-3-pro-image-preview",
        "gemini",
        &["image", "edit", "blend"],
        ModelTier::Pro,
        Some("gemini-2.5-flash-image"),
    );
    insert(
        "gemini-2.5-flash-image",
        "gemini",
        &["image", "edit", "blend"],
        ModelTier::Standard,
        None,
    );
    insert(
        "gemini-3-pro-preview",
        "gemini",
        &["text", "vision"],
        ModelTier::Pro,
        None,
    );
    insert(
        "gemini-2.5-flash",
        "gemini",
        &["text", "vision", "vector"],
        ModelTier::Standard,
        None,
    );
    insert(
        "veo-3.1-generate-preview",
        "gemini",
        &["video"],
        ModelTier::Standard,
        None,
    );
    insert(
        "gpt-image-1",
        "openai",
        &["image", "edit", "blend"],
        ModelTier::Pro,
        Some("gpt-image-1-mini"),
    );
    insert(
        "gpt-image-1-mini",
        "openai",
        &["image", "edit", "blend"],
        ModelTier::Standard,
        None,
    );
    insert(
        "gpt-4o-mini",
        "openai",
        &["text", "vision"],
        ModelTier::Standard,
        None,
    );
    insert(
        "flux-2-pro",
        "flux",
        &["image", "edit"],
        ModelTier::Pro,
        Some("flux-2-flex"),
    );
    insert(
        "flux-2-flex",
        "flux",
        &["image", "edit"],
        ModelTier::Standard,
        None,
    );
    insert(
        "recraft-v3-svg",
        "recraft",
        &["vector", "image"],
        ModelTier::Standard,
        None,
    );

    map
}
