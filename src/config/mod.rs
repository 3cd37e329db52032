use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub mod templates;
pub mod validation;

use crate::handlers::permissions::PermissionLevel;
use crate::vm::instance::BackendKind;

pub const CONFIG_DIR: &str = ".vmhub";
pub const CONFIG_FILE: &str = "config.json";

/// Which driver(s) the manager may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    #[default]
    Auto,
    Libvirt,
    Qemu,
    #[serde(alias = "vbox")]
    VirtualBox,
}

impl BackendChoice {
    pub fn pinned(self) -> Option<BackendKind> {
        match self {
            BackendChoice::Auto => None,
            BackendChoice::Libvirt => Some(BackendKind::Libvirt),
            BackendChoice::Qemu => Some(BackendKind::Qemu),
            BackendChoice::VirtualBox => Some(BackendKind::VirtualBox),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmDefaults {
    pub ram: String,
    pub cpus: u32,
    pub disk: String,
    pub os_type: String,
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            ram: "2G".to_string(),
            cpus: 2,
            disk: "20G".to_string(),
            os_type: "ubuntu".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub user: String,
    pub port: u16,
    pub wait_timeout_secs: u64,
    pub probe_interval_ms: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: std::env::var("USER").unwrap_or_else(|_| "ubuntu".to_string()),
            port: 22,
            wait_timeout_secs: 300,
            probe_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmHubConfig {
    pub backend: BackendChoice,
    pub vm_dir: Option<PathBuf>,
    pub iso_dir: Option<PathBuf>,
    pub defaults: VmDefaults,
    pub ssh: SshSettings,
    pub stop_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub permissions: PermissionLevel,
    pub libvirt_uri: Option<String>,
}

impl Default for VmHubConfig {
    fn default() -> Self {
        Self {
            backend: BackendChoice::Auto,
            vm_dir: None,
            iso_dir: None,
            defaults: VmDefaults::default(),
            ssh: SshSettings::default(),
            stop_timeout_secs: 60,
            command_timeout_secs: 60,
            permissions: PermissionLevel::Full,
            libvirt_uri: None,
        }
    }
}

impl VmHubConfig {
    /// `~/VMs` unless configured.
    pub fn vm_root(&self) -> Result<PathBuf> {
        match &self.vm_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(home_dir()?.join("VMs")),
        }
    }

    pub fn iso_root(&self) -> Result<PathBuf> {
        match &self.iso_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(home_dir()?.join(CONFIG_DIR).join("iso")),
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn ssh_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh.wait_timeout_secs)
    }
}

fn home_dir() -> Result<PathBuf> {
    home::home_dir().ok_or_else(|| anyhow!("Failed to determine home directory"))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(home_dir()?.join(CONFIG_DIR).join(CONFIG_FILE))
}

/// Load the configuration at `path`, or the default location when `None`.
/// A missing file yields defaults; an unreadable or invalid one is an error.
pub fn load_config(path: Option<&Path>) -> Result<VmHubConfig> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => match default_config_path() {
            Ok(p) => p,
            Err(e) => {
                debug!("No home directory, using default configuration: {}", e);
                return Ok(VmHubConfig::default());
            }
        },
    };

    if !path.exists() {
        debug!("No configuration at {}, using defaults", path.display());
        return Ok(VmHubConfig::default());
    }

    info!("Loading configuration from {}", path.display());
    let contents = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: VmHubConfig = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse JSON in config file: {}", path.display()))?;

    validation::validate_settings(&config)
        .with_context(|| format!("Invalid configuration in file: {}", path.display()))?;

    debug!("Successfully loaded config: {:#?}", config);
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(config.backend, BackendChoice::Auto);
        assert_eq!(config.defaults.cpus, 2);
        assert_eq!(config.permissions, PermissionLevel::Full);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"backend":"qemu","vm_dir":"/srv/vms","ssh":{"user":"dev"},"permissions":"standard"}"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.backend.pinned(), Some(BackendKind::Qemu));
        assert_eq!(config.vm_root().unwrap(), PathBuf::from("/srv/vms"));
        assert_eq!(config.ssh.user, "dev");
        assert_eq!(config.ssh.wait_timeout_secs, 300);
        assert_eq!(config.permissions, PermissionLevel::Standard);
        assert_eq!(config.stop_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn malformed_file_is_an_error_with_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ backend: ").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse JSON"));
    }

    #[test]
    fn invalid_defaults_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"defaults":{"ram":"huge"}}"#).unwrap();
        assert!(load_config(Some(&path)).is_err());
    }
}
