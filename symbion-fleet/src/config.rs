use crate::error::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::warn;

pub const CONFIG_ENV: &str = "SYMBION_FLEET_CONFIG";

pub const GPU_QUERY: &str = "nvidia-smi --query-gpu=index,name,memory.total,memory.used,temperature.gpu,utilization.gpu,power.draw --format=csv,noheader,nounits";
pub const LOAD_QUERY: &str = "cat /proc/loadavg";
pub const MEMORY_QUERY: &str = "free -m";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct FleetConfig {
    pub fleet: LayoutConf,
    pub profile: ProfileConf,
    pub ssh: SshConf,
    pub dispatch: DispatchConf,
    pub telemetry: TelemetryConf,
    pub monitor: MonitorConf,
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LayoutConf {
    pub size: usize,
    pub id_template: String,
    pub address_template: String,
}

/// Nominal hardware of a fleet member, seeded before any poll
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProfileConf {
    pub cpu_cores: u32,
    pub cpu_threads: u32,
    pub memory_gb: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SshConf {
    pub user: String,
    pub port: u16,
    pub private_key: Option<String>,
    pub keys: HashMap<String, KeyConf>,
    pub control_dir: Option<PathBuf>,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KeyConf {
    pub user: Option<String>,
    pub private_key: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DispatchConf {
    pub command_timeout_secs: u64,
    pub max_concurrency: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryConf {
    pub gpu_query: String,
    pub load_query: String,
    pub memory_query: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MonitorConf {
    pub interval_secs: u64,
}

impl Default for LayoutConf {
    fn default() -> Self {
        Self {
            size: 28,
            id_template: "gpu-node-{n:02}".into(),
            address_template: "192.168.1.{n+100}".into(),
        }
    }
}

impl Default for ProfileConf {
    fn default() -> Self {
        Self { cpu_cores: 24, cpu_threads: 32, memory_gb: 64.0 }
    }
}

impl Default for SshConf {
    fn default() -> Self {
        Self {
            user: "minechain".into(),
            port: 22,
            private_key: Some("~/.ssh/minechain_fleet_key".into()),
            keys: HashMap::new(),
            control_dir: None,
            connect_timeout_secs: 10,
        }
    }
}

impl Default for DispatchConf {
    fn default() -> Self {
        Self { command_timeout_secs: 120, max_concurrency: 32 }
    }
}

impl Default for TelemetryConf {
    fn default() -> Self {
        Self {
            gpu_query: GPU_QUERY.into(),
            load_query: LOAD_QUERY.into(),
            memory_query: MEMORY_QUERY.into(),
        }
    }
}

impl Default for MonitorConf {
    fn default() -> Self {
        Self { interval_secs: 5 }
    }
}

impl SshConf {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Répertoire des sockets ControlMaster (un par nœud)
    pub fn control_dir(&self) -> PathBuf {
        self.control_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("symbion-fleet"))
    }
}

impl DispatchConf {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl FleetConfig {
    pub fn from_yaml(txt: &str) -> Result<Self> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: FleetConfig = serde_yaml::from_str(txt)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.dispatch.max_concurrency == 0 {
            return Err(FleetError::Config("dispatch.max_concurrency must be at least 1".into()));
        }
        if self.dispatch.command_timeout_secs == 0 {
            return Err(FleetError::Config("dispatch.command_timeout_secs must be positive".into()));
        }
        if self.ssh.connect_timeout_secs == 0 {
            return Err(FleetError::Config("ssh.connect_timeout_secs must be positive".into()));
        }
        if self.profile.cpu_threads == 0 {
            return Err(FleetError::Config("profile.cpu_threads must be at least 1".into()));
        }
        if self.monitor.interval_secs == 0 {
            return Err(FleetError::Config("monitor.interval_secs must be positive".into()));
        }
        Ok(())
    }
}

/// Charge la config depuis `SYMBION_FLEET_CONFIG` (défaut `fleet.yaml`)
pub async fn load_config() -> Result<FleetConfig> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "fleet.yaml".into());
    load_config_from(&path).await
}

pub async fn load_config_from<P: AsRef<Path>>(path: P) -> Result<FleetConfig> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "no fleet config file, using defaults");
        return Ok(FleetConfig::default());
    }
    let txt = fs::read_to_string(path).await?;
    FleetConfig::from_yaml(&txt)
        .map_err(|e| FleetError::Config(format!("{}: {e}", path.display())))
}

/// Expands a leading `~/` against the home directory
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_fleet() {
        let cfg = FleetConfig::default();
        assert_eq!(cfg.fleet.size, 28);
        assert_eq!(cfg.profile.cpu_threads, 32);
        assert_eq!(cfg.ssh.user, "minechain");
        assert_eq!(cfg.telemetry.load_query, "cat /proc/loadavg");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = FleetConfig::from_yaml(
            "fleet:\n  size: 3\nssh:\n  keys:\n    gpu-node-02:\n      private_key: /keys/n2\n",
        )
        .unwrap();
        assert_eq!(cfg.fleet.size, 3);
        assert_eq!(cfg.fleet.id_template, "gpu-node-{n:02}");
        assert_eq!(cfg.ssh.port, 22);
        assert_eq!(cfg.ssh.keys["gpu-node-02"].private_key, "/keys/n2");
        assert_eq!(cfg.dispatch.max_concurrency, 32);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let cfg = FleetConfig::from_yaml("  \n").unwrap();
        assert_eq!(cfg.fleet.size, 28);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = FleetConfig::from_yaml("dispatch:\n  max_concurrency: 0\n").unwrap_err();
        assert!(matches!(err, FleetError::Config(_)));
    }

    #[test]
    fn test_zero_cpu_threads_rejected() {
        let err = FleetConfig::from_yaml("profile:\n  cpu_threads: 0\n").unwrap_err();
        assert!(err.to_string().contains("profile.cpu_threads"));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/abs/key"), PathBuf::from("/abs/key"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home("~/.ssh/k"), home.join(".ssh/k"));
        }
    }

    #[tokio::test]
    async fn test_missing_file_falls_back_to_defaults() {
        let cfg = load_config_from("/nonexistent/fleet.yaml").await.unwrap();
        assert_eq!(cfg.fleet.size, 28);
    }
}
