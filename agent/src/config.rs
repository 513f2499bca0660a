//! Agent configuration: YAML file with `GHOST_`-prefixed environment
//! overrides. Validation failure at startup is fatal.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::AgentError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/ghost/agent.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentSection,
    pub libvirt: LibvirtSection,
    pub resources: ResourcesSection,
    pub rpc: RpcSection,
    pub health: HealthSection,
    pub logging: LoggingSection,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub name: String,
    pub orchestrator_addr: String,
    pub heartbeat_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LibvirtSection {
    pub uri: String,
    pub image_cache: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResourcesSection {
    pub reserved_cpu: u32,
    pub reserved_ram_gib: u32,
    pub reserved_disk_gib: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcSection {
    pub listen_addr: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub listen_addr: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: AgentSection::default(),
            libvirt: LibvirtSection::default(),
            resources: ResourcesSection::default(),
            rpc: RpcSection::default(),
            health: HealthSection::default(),
            logging: LoggingSection::default(),
            data_dir: PathBuf::from("/var/lib/ghost/data"),
        }
    }
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            name: String::from("ghost-agent"),
            orchestrator_addr: String::from("127.0.0.1:5000"),
            heartbeat_interval_secs: 15,
        }
    }
}

impl Default for LibvirtSection {
    fn default() -> Self {
        Self {
            uri: String::from("qemu:///system"),
            image_cache: PathBuf::from("/var/lib/ghost/images"),
        }
    }
}

impl Default for ResourcesSection {
    fn default() -> Self {
        Self {
            reserved_cpu: 0,
            reserved_ram_gib: 0,
            reserved_disk_gib: 0,
        }
    }
}

impl Default for RpcSection {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9090".parse().unwrap(),
        }
    }
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".parse().unwrap(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: String::from("info"),
        }
    }
}

impl Config {
    /// Load from a YAML file, then apply `GHOST_*` environment overrides,
    /// then validate. A missing file yields the defaults (overrides still
    /// apply); an unreadable or invalid file is an error.
    pub fn load(path: &std::path::Path) -> Result<Self, AgentError> {
        let mut cfg = match std::fs::read_to_string(path) {
            Ok(raw) => serde_yaml::from_str(&raw).map_err(|e| {
                AgentError::Validation(format!("config {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => {
                return Err(AgentError::Storage(format!(
                    "config {}: {e}",
                    path.display()
                )))
            }
        };

        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<(), AgentError> {
        if let Ok(v) = std::env::var("GHOST_AGENT_NAME") {
            self.agent.name = v;
        }
        if let Ok(v) = std::env::var("GHOST_ORCHESTRATOR_ADDR") {
            self.agent.orchestrator_addr = v;
        }
        if let Ok(v) = std::env::var("GHOST_HEARTBEAT_INTERVAL_SECS") {
            self.agent.heartbeat_interval_secs = parse_env("GHOST_HEARTBEAT_INTERVAL_SECS", &v)?;
        }
        if let Ok(v) = std::env::var("GHOST_LIBVIRT_URI") {
            self.libvirt.uri = v;
        }
        if let Ok(v) = std::env::var("GHOST_IMAGE_CACHE") {
            self.libvirt.image_cache = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GHOST_RESERVED_CPU") {
            self.resources.reserved_cpu = parse_env("GHOST_RESERVED_CPU", &v)?;
        }
        if let Ok(v) = std::env::var("GHOST_RESERVED_RAM_GIB") {
            self.resources.reserved_ram_gib = parse_env("GHOST_RESERVED_RAM_GIB", &v)?;
        }
        if let Ok(v) = std::env::var("GHOST_RESERVED_DISK_GIB") {
            self.resources.reserved_disk_gib = parse_env("GHOST_RESERVED_DISK_GIB", &v)?;
        }
        if let Ok(v) = std::env::var("GHOST_RPC_LISTEN_ADDR") {
            self.rpc.listen_addr = parse_env("GHOST_RPC_LISTEN_ADDR", &v)?;
        }
        if let Ok(v) = std::env::var("GHOST_HEALTH_LISTEN_ADDR") {
            self.health.listen_addr = parse_env("GHOST_HEALTH_LISTEN_ADDR", &v)?;
        }
        if let Ok(v) = std::env::var("GHOST_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("GHOST_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), AgentError> {
        if self.agent.name.is_empty() {
            return Err(AgentError::Validation("agent.name must not be empty".into()));
        }
        if self.agent.heartbeat_interval_secs == 0 {
            return Err(AgentError::Validation(
                "agent.heartbeat_interval_secs must be positive".into(),
            ));
        }
        if self.libvirt.uri.is_empty() {
            return Err(AgentError::Validation("libvirt.uri must not be empty".into()));
        }
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(AgentError::Validation(format!(
                    "logging.level {other:?} is not one of trace/debug/info/warn/error"
                )))
            }
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, AgentError>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| AgentError::Validation(format!("{key}={raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.agent.heartbeat_interval_secs, 15);
    }

    #[test]
    fn parses_yaml_sections() {
        let raw = r#"
agent:
  name: node-7
  orchestrator_addr: "10.0.0.2:5000"
  heartbeat_interval_secs: 30
libvirt:
  uri: "qemu:///session"
  image_cache: /tmp/images
resources:
  reserved_cpu: 2
  reserved_ram_gib: 4
  reserved_disk_gib: 50
rpc:
  listen_addr: "0.0.0.0:9191"
"#;
        let cfg: Config = serde_yaml::from_str(raw).expect("config should parse");
        assert_eq!(cfg.agent.name, "node-7");
        assert_eq!(cfg.agent.heartbeat_interval_secs, 30);
        assert_eq!(cfg.libvirt.uri, "qemu:///session");
        assert_eq!(cfg.resources.reserved_cpu, 2);
        assert_eq!(cfg.rpc.listen_addr, "0.0.0.0:9191".parse().unwrap());
        // Unspecified sections keep their defaults
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn rejects_bad_log_level() {
        let mut cfg = Config::default();
        cfg.logging.level = "loud".into();
        assert!(matches!(cfg.validate(), Err(AgentError::Validation(_))));
    }

    #[test]
    fn rejects_zero_heartbeat_interval() {
        let mut cfg = Config::default();
        cfg.agent.heartbeat_interval_secs = 0;
        assert!(matches!(cfg.validate(), Err(AgentError::Validation(_))));
    }
}
