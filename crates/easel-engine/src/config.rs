use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use easel_contracts::models::ModelTier;
use easel_contracts::providers::QuotaRules;
use serde::{Deserialize, Serialize};

pub const ALLOWED_MULTIPLIERS: [u32; 4] = [1, 2, 4, 8];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub provider: String,
    pub model_tier: ModelTier,
    pub aspect_ratio: String,
    pub multiplier: u32,
    pub auto_download: bool,
    pub web_search: bool,
    pub timing: TimingConfig,
    pub layout: LayoutConfig,
    pub assets: AssetConfig,
    pub quota: QuotaRules,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provider: "dryrun".to_string(),
            model_tier: ModelTier::Standard,
            aspect_ratio: "1:1".to_string(),
            multiplier: 1,
            auto_download: false,
            web_search: false,
            timing: TimingConfig::default(),
            layout: LayoutConfig::default(),
            assets: AssetConfig::default(),
            quota: QuotaRules::default(),
        }
    }
}

/// Millisecond knobs for every timer the engine runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub progress_tick_ms: u64,
    pub progress_duration_ms: u64,
    pub progress_start: u8,
    pub progress_ceiling: u8,
    pub persist_debounce_ms: u64,
    pub stagger_ms: u64,
    pub empty_result_retries: u32,
    pub empty_result_delay_ms: u64,
    pub demote_grace_ms: u64,
    pub migration_backoff_ms: u64,
    pub migration_backoff_attempts: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            progress_tick_ms: 1_000,
            progress_duration_ms: 120_000,
            progress_start: 15,
            progress_ceiling: 95,
            persist_debounce_ms: 300,
            stagger_ms: 150,
            empty_result_retries: 2,
            empty_result_delay_ms: 1_500,
            demote_grace_ms: 5_000,
            migration_backoff_ms: 500,
            migration_backoff_attempts: 20,
        }
    }
}

impl TimingConfig {
    pub fn progress_tick(&self) -> Duration {
        Duration::from_millis(self.progress_tick_ms.max(1))
    }

    pub fn progress_duration(&self) -> Duration {
        Duration::from_millis(self.progress_duration_ms.max(1))
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    pub fn stagger(&self, index: u32) -> Duration {
        Duration::from_millis(self.stagger_ms.saturating_mul(u64::from(index)))
    }

    pub fn empty_result_delay(&self) -> Duration {
        Duration::from_millis(self.empty_result_delay_ms)
    }

    pub fn demote_grace(&self) -> Duration {
        Duration::from_millis(self.demote_grace_ms)
    }

    pub fn migration_backoff(&self) -> Duration {
        Duration::from_millis(self.migration_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub placeholder_width: f64,
    pub placeholder_height: f64,
    pub spacing: f64,
    pub group_spacing: f64,
    pub max_collision_attempts: u32,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            placeholder_width: 512.0,
            placeholder_height: 512.0,
            spacing: 40.0,
            group_spacing: 40.0,
            max_collision_attempts: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    /// Inline payloads above this size without a remote URL are migrated.
    pub migration_threshold_bytes: usize,
    /// Inline payloads above this size are left out of the durable form.
    pub durable_inline_cap_bytes: usize,
    pub thumbnail_max_dim: u32,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            migration_threshold_bytes: 64 * 1024,
            durable_inline_cap_bytes: 1024 * 1024,
            thumbnail_max_dim: 256,
        }
    }
}

impl EngineConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed reading {}", path.display()))?;
                serde_json::from_str::<EngineConfig>(&raw)
                    .with_context(|| format!("invalid config JSON in {}", path.display()))?
            }
            _ => EngineConfig::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(provider) = non_empty_env("EASEL_PROVIDER") {
            self.provider = provider;
        }
        if let Some(tier) = non_empty_env("EASEL_MODEL_TIER") {
            self.model_tier = tier.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(ratio) = non_empty_env("EASEL_ASPECT_RATIO") {
            self.aspect_ratio = ratio;
        }
        if let Some(raw) = non_empty_env("EASEL_MULTIPLIER") {
            self.multiplier = raw
                .parse()
                .with_context(|| format!("EASEL_MULTIPLIER is not a number: {raw}"))?;
        }
        if let Some(raw) = non_empty_env("EASEL_AUTO_DOWNLOAD") {
            self.auto_download = parse_flag(&raw)?;
        }
        if let Some(raw) = non_empty_env("EASEL_WEB_SEARCH") {
            self.web_search = parse_flag(&raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        validate_multiplier(self.multiplier)?;
        if self.timing.progress_start > self.timing.progress_ceiling {
            bail!(
                "progress_start ({}) must not exceed progress_ceiling ({})",
                self.timing.progress_start,
                self.timing.progress_ceiling
            );
        }
        if parse_aspect_ratio(&self.aspect_ratio).is_none() {
            bail!("aspect_ratio must look like W:H, got '{}'", self.aspect_ratio);
        }
        Ok(())
    }

    /// Placeholder footprint for the configured aspect ratio; the longer
    /// side keeps the configured placeholder size.
    pub fn placeholder_size(&self) -> (f64, f64) {
        let (w, h) = parse_aspect_ratio(&self.aspect_ratio).unwrap_or((1.0, 1.0));
        let base_w = self.layout.placeholder_width;
        let base_h = self.layout.placeholder_height;
        if w >= h {
            (base_w, base_h * h / w)
        } else {
            (base_w * w / h, base_h)
        }
    }
}

pub fn validate_multiplier(value: u32) -> Result<()> {
    if !ALLOWED_MULTIPLIERS.contains(&value) {
        bail!("multiplier must be one of 1, 2, 4, 8 (got {value})");
    }
    Ok(())
}

pub fn parse_aspect_ratio(raw: &str) -> Option<(f64, f64)> {
    let (w, h) = raw.trim().split_once(':')?;
    let w = w.trim().parse::<f64>().ok()?;
    let h = h.trim().parse::<f64>().ok()?;
    if w <= 0.0 || h <= 0.0 {
        return None;
    }
    Some((w, h))
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean flag, got '{other}'"),
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
