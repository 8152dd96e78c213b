use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HearthConfig {
    /// Name the assistant signs outbound messages with.
    pub assistant_name: String,
    /// Folder (and group id) of the privileged main group.
    pub main_group_folder: String,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub container: ContainerConfig,
    pub ipc: IpcConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for HearthConfig {
    fn default() -> Self {
        Self {
            assistant_name: "Hearth".to_string(),
            main_group_folder: "main".to_string(),
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            container: ContainerConfig::default(),
            ipc: IpcConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Bearer token required on every endpoint except /api/health.
    /// Empty or absent means the API is open.
    pub auth_token: Option<String>,
    pub max_body_bytes: usize,
    /// How long shutdown waits for live containers to drain.
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            auth_token: None,
            max_body_bytes: 2_097_152,
            shutdown_grace_ms: 15_000,
        }
    }
}

impl ServerConfig {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Holds ipc/ and snapshots/ trees.
    pub data_dir: String,
    /// Holds messages.db.
    pub store_dir: String,
    /// Holds per-group working folders.
    pub groups_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            store_dir: "store".to_string(),
            groups_dir: "groups".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container runtime binary (docker-compatible CLI).
    pub runtime_bin: String,
    /// Default agent image; a group's containerConfig may override it.
    pub image: String,
    /// Prefix for container names; also drives orphan reaping.
    pub name_prefix: String,
    /// Idle time after the last output before stdin is closed.
    pub idle_timeout_ms: u64,
    /// Grace between stdin close, terminate, and kill.
    pub exit_grace_ms: u64,
    /// Skip the startup `docker info` probe. Test harness only.
    pub skip_runtime_check: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime_bin: "docker".to_string(),
            image: "hearth-agent:latest".to_string(),
            name_prefix: "hearth-".to_string(),
            idle_timeout_ms: 30_000,
            exit_grace_ms: 10_000,
            skip_runtime_check: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub poll_interval_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    /// IANA timezone for cron expressions and naive `once` timestamps.
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            timezone: "UTC".to_string(),
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> anyhow::Result<HearthConfig> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(HearthConfig::default().with_env_overrides());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let parsed: HearthConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    Ok(parsed.with_env_overrides())
}

impl HearthConfig {
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(host) = env_nonempty("HTTP_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_nonempty("HTTP_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = port;
        }
        if let Some(token) = env_nonempty("HEARTH_API_TOKEN") {
            self.server.auth_token = Some(token);
        }
        if let Some(dir) = env_nonempty("HEARTH_DATA_DIR") {
            self.storage.data_dir = dir;
        }
        if let Some(dir) = env_nonempty("HEARTH_STORE_DIR") {
            self.storage.store_dir = dir;
        }
        if let Some(dir) = env_nonempty("HEARTH_GROUPS_DIR") {
            self.storage.groups_dir = dir;
        }
        if let Some(name) = env_nonempty("ASSISTANT_NAME") {
            self.assistant_name = name;
        }
        if let Some(tz) = env_nonempty("HEARTH_TIMEZONE") {
            self.scheduler.timezone = tz;
        }
        self
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let cfg = HearthConfig::default();
        assert_eq!(cfg.main_group_folder, "main");
        assert_eq!(cfg.server.bind(), "127.0.0.1:3000");
        assert_eq!(cfg.ipc.poll_interval_ms, 250);
        assert!(!cfg.container.skip_runtime_check);
    }

    #[test]
    fn parse_toml_uses_defaults_for_missing_fields() {
        let parsed: HearthConfig = toml::from_str(
            r#"
            assistant_name = "Andy"

            [server]
            port = 9999
            "#,
        )
        .expect("parse toml");

        assert_eq!(parsed.assistant_name, "Andy");
        assert_eq!(parsed.server.port, 9999);
        assert_eq!(parsed.server.host, "127.0.0.1");
        assert_eq!(parsed.scheduler.timezone, "UTC");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = load_config("/nonexistent/hearth.toml").expect("load");
        assert_eq!(cfg.container.runtime_bin, "docker");
    }
}
