use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the vmkeeper daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
    pub limits: Limits,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            session: SessionConfig::default(),
            storage: StorageConfig::default(),
            limits: Limits::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.limits.min_cpus >= 1, "limits.min_cpus must be >= 1");
        anyhow::ensure!(
            self.limits.min_cpus <= self.limits.max_cpus,
            "limits.min_cpus must be <= limits.max_cpus"
        );
        anyhow::ensure!(
            self.limits.min_memory_mb >= 4,
            "limits.min_memory_mb must be >= 4"
        );
        anyhow::ensure!(
            self.limits.min_memory_mb <= self.limits.max_memory_mb,
            "limits.min_memory_mb must be <= limits.max_memory_mb"
        );
        anyhow::ensure!(
            self.limits.max_network_adapters >= 1 && self.limits.max_network_adapters <= 36,
            "limits.max_network_adapters must be between 1 and 36"
        );
        anyhow::ensure!(
            self.session.spawn_timeout_secs >= 1,
            "session.spawn_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.server.death_check_interval_ms >= 10,
            "server.death_check_interval_ms must be >= 10"
        );
        anyhow::ensure!(
            !self.storage.default_diff_format.is_empty(),
            "storage.default_diff_format must not be empty"
        );
        Ok(())
    }
}

/// Daemon-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// JSON file listing the settings files of registered machines and the
    /// global media registry.
    pub registry_file: PathBuf,
    /// Default base folder for newly created machines.
    pub machines_dir: PathBuf,
    /// How often the watcher checks session clients and pending spawns.
    pub death_check_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            registry_file: PathBuf::from("/var/lib/vmkeeper/registry.json"),
            machines_dir: PathBuf::from("/var/lib/vmkeeper/machines"),
            death_check_interval_ms: 1000,
        }
    }
}

/// Session / front-end process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds a launched front-end has to claim its session.
    pub spawn_timeout_secs: u64,
    /// Front-end binary started by `launch_vm_process`.
    pub frontend_binary: PathBuf,
    /// Front-end name used when the caller does not ask for one.
    pub default_frontend: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            spawn_timeout_secs: 60,
            frontend_binary: PathBuf::from("/usr/lib/vmkeeper/vm-frontend"),
            default_frontend: "headless".into(),
        }
    }
}

/// Disk image configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Format of implicitly created differencing images.
    pub default_diff_format: String,
    /// Default folder for base images created through the CLI.
    pub images_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            default_diff_format: "vdi".into(),
            images_dir: PathBuf::from("/var/lib/vmkeeper/images"),
        }
    }
}

/// Bounds enforced by hardware setters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub min_cpus: u32,
    pub max_cpus: u32,
    pub min_memory_mb: u32,
    pub max_memory_mb: u32,
    pub max_vram_mb: u32,
    pub max_network_adapters: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            min_cpus: 1,
            max_cpus: 64,
            min_memory_mb: 4,
            max_memory_mb: 2 * 1024 * 1024,
            max_vram_mb: 256,
            max_network_adapters: 8,
        }
    }
}
