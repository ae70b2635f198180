use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_auth_required() -> bool {
    true
}

fn default_topic_capacity() -> usize {
    256
}

fn default_sweep_interval_seconds() -> u64 {
    10
}

fn default_sweep_grace_seconds() -> u64 {
    30
}

/// Top-level configuration for the broker registry core.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Require a bearer token on setup. Disabled deployments admit every
    /// connection under a synthesized mock principal.
    #[serde(default = "default_auth_required")]
    pub auth_required: bool,
    #[serde(default)]
    pub events: EventBusConfig,
    #[serde(default)]
    pub sweep: StaleSweepConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            auth_required: true,
            events: EventBusConfig::default(),
            sweep: StaleSweepConfig::default(),
        }
    }
}

/// Bounded-buffer sizing for the two multicast topics.
#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    /// Per-subscriber buffer for lifecycle envelopes; lagging
    /// subscribers lose the oldest entries, never block publication.
    #[serde(default = "default_topic_capacity")]
    pub lifecycle_capacity: usize,
    /// Per-subscriber buffer for operator notification strings.
    #[serde(default = "default_topic_capacity")]
    pub notification_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            lifecycle_capacity: default_topic_capacity(),
            notification_capacity: default_topic_capacity(),
        }
    }
}

/// Tuning for the stale-handler sweep: handlers whose transport reports
/// closed but whose disposal callback never fired are reaped after the
/// grace window.
#[derive(Debug, Clone, Deserialize)]
pub struct StaleSweepConfig {
    #[serde(default = "default_sweep_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_sweep_grace_seconds")]
    pub grace_seconds: u64,
}

impl Default for StaleSweepConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_sweep_interval_seconds(),
            grace_seconds: default_sweep_grace_seconds(),
        }
    }
}

impl StaleSweepConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }
}

impl BrokerConfig {
    /// Load configuration from a path resolved via PHOTON_CONFIG or the
    /// default `config/photon.toml`.
    pub fn load_from_env() -> Result<Self> {
        let path = env_config_path();
        Self::load(&path)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        let cfg: Self = if is_json(path_ref) {
            serde_json::from_str(&data)
                .with_context(|| format!("invalid JSON config {}", path_ref.display()))?
        } else {
            toml::from_str(&data)
                .with_context(|| format!("invalid TOML config {}", path_ref.display()))?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.events.lifecycle_capacity == 0 {
            anyhow::bail!("events.lifecycle_capacity must be non-zero");
        }
        if self.events.notification_capacity == 0 {
            anyhow::bail!("events.notification_capacity must be non-zero");
        }
        if self.sweep.interval_seconds == 0 {
            anyhow::bail!("sweep.interval_seconds must be non-zero");
        }
        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

fn env_config_path() -> PathBuf {
    std::env::var_os("PHOTON_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config/photon.toml"))
}
