//! Configuration
//!
//! Loads configuration from a TOML file at `~/.config/gable/config.toml`.
//! Auto-generates a default config file on first run if missing. SIGHUP
//! reloads the limits at the next cycle boundary.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub limits: LimitsConfig,
    pub memory: MemoryConfig,
    pub frame: FrameConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            limits: LimitsConfig::default(),
            memory: MemoryConfig::default(),
            frame: FrameConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&content)
            .context("Failed to parse config file")?;

        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("gable");

        Ok(config_dir.join("config.toml"))
    }

    fn save_default(path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let default_config = Self::default();
        let toml_string = toml::to_string_pretty(&default_config)
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string)
            .context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }

    pub fn cookie_timeout(&self) -> Duration {
        Duration::from_millis(self.limits.cookie_timeout_ms)
    }
}

/// Per-cycle work bounds. These cap tail latency under event storms;
/// excess work carries over to the next cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum raw events ingested per cycle
    pub max_events_per_cycle: u32,
    /// Maximum query replies dispatched per cycle
    pub max_replies_per_cycle: u32,
    /// How long a pending reply may go unanswered before it is dropped
    pub cookie_timeout_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_events_per_cycle: 512,
            max_replies_per_cycle: 64,
            cookie_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Block size of the per-cycle bump arena, in bytes
    pub arena_block_size: usize,
    /// Initial capacity of the client slot map (grows on demand)
    pub entity_capacity: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            arena_block_size: 64 * 1024,
            entity_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameConfig {
    /// Border width of created frames, in pixels
    pub border_width: u16,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self { border_width: 2 }
    }
}
