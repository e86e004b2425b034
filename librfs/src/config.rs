use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Engine configuration. Every field has a default, so a config file only
/// needs to name what it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RfsConfig {
    // TTL given to an entry on creation and on every successful access,
    // counted in sweeper ticks
    pub default_ttl: i64,
    // time between two sweeper ticks
    pub sweep_interval_ms: u64,
    // upper bound for a single fetch/store call, None waits forever
    pub fetch_timeout_secs: Option<u64>,
    // largest buffer a single open handle may grow to by writes or truncation
    pub max_buffer_bytes: u64,
    // name reported by the mount
    pub fs_name: String,
    pub allow_other: bool,
}

impl Default for RfsConfig {
    fn default() -> Self {
        Self {
            // 5 minutes at one tick per second
            default_ttl: 300,
            sweep_interval_ms: 1000,
            fetch_timeout_secs: Some(60),
            max_buffer_bytes: 64 * 1024 * 1024,
            fs_name: "rfs".to_string(),
            allow_other: false,
        }
    }
}

impl RfsConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_ttl <= 0 {
            bail!("default_ttl must be positive, got {}", self.default_ttl);
        }
        if self.sweep_interval_ms == 0 {
            bail!("sweep_interval_ms must be positive");
        }
        if self.fetch_timeout_secs == Some(0) {
            bail!("fetch_timeout_secs must be positive when set");
        }
        if self.max_buffer_bytes == 0 {
            bail!("max_buffer_bytes must be positive");
        }
        Ok(())
    }

    pub fn max_buffer(&self) -> usize {
        usize::try_from(self.max_buffer_bytes).unwrap_or(usize::MAX)
    }
}

pub fn load_config(path: &str) -> Result<RfsConfig> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    let cfg: RfsConfig = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    cfg.validate()
        .with_context(|| format!("Invalid config in {path}"))?;
    Ok(cfg)
}
