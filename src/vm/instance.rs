use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which driver family owns a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Libvirt,
    Qemu,
    VirtualBox,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [BackendKind::Libvirt, BackendKind::Qemu, BackendKind::VirtualBox];

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Libvirt => "libvirt",
            BackendKind::Qemu => "qemu",
            BackendKind::VirtualBox => "virtualbox",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "libvirt" | "virsh" | "kvm" => Ok(BackendKind::Libvirt),
            "qemu" => Ok(BackendKind::Qemu),
            "virtualbox" | "vbox" => Ok(BackendKind::VirtualBox),
            other => Err(format!("unsupported backend: {other}")),
        }
    }
}

/// Driver-reported VM state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmState {
    NotFound,
    Starting,
    Running,
    Stopping,
    Stopped,
    Suspended,
    Error,
    Unknown,
}

impl VmState {
    /// States in which the guest holds its disk open.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            VmState::Running | VmState::Starting | VmState::Stopping | VmState::Suspended
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VmState::NotFound => "not-found",
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Stopping => "stopping",
            VmState::Stopped => "stopped",
            VmState::Suspended => "suspended",
            VmState::Error => "error",
            VmState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything known about one VM at query time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub state: VmState,
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ram: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vnc_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_started: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl VmInfo {
    pub fn new(name: impl Into<String>, backend: impl Into<String>, state: VmState) -> Self {
        Self {
            name: name.into(),
            state,
            backend: backend.into(),
            ram: None,
            cpus: None,
            disk_size: None,
            os_type: None,
            ip: None,
            vnc_port: None,
            created_at: None,
            last_started: None,
            path: None,
            error_detail: None,
        }
    }
}

/// Immutable creation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iso: Option<PathBuf>,
    pub ram: String,
    pub cpus: u32,
    pub disk_size: String,
    pub os_type: String,
    #[serde(default = "default_true")]
    pub enable_ssh: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<PathBuf>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub features: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub post_create: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl VmConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: None,
            iso: None,
            ram: "2G".to_string(),
            cpus: 2,
            disk_size: "20G".to_string(),
            os_type: "generic".to_string(),
            enable_ssh: true,
            ssh_key: None,
            network: NetworkConfig::default(),
            features: BTreeMap::new(),
            post_create: Vec::new(),
        }
    }

    pub fn is_windows(&self) -> bool {
        self.os_type.to_lowercase().starts_with("windows")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    #[default]
    Nat,
    Bridge,
    Host,
}

impl FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nat" | "user" => Ok(NetworkMode::Nat),
            "bridge" | "bridged" => Ok(NetworkMode::Bridge),
            "host" | "hostonly" => Ok(NetworkMode::Host),
            other => Err(format!("unsupported network mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub mode: NetworkMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forwards: Vec<PortForward>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub host: u16,
    pub guest: u16,
    #[serde(default)]
    pub proto: Protocol,
}

impl FromStr for PortForward {
    type Err = String;

    /// Parses `host:guest[/proto]`, e.g. `8080:80/tcp`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ports, proto) = match s.split_once('/') {
            Some((ports, proto)) => (ports, proto),
            None => (s, "tcp"),
        };
        let proto = match proto.to_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => return Err(format!("unsupported protocol '{other}' in forward '{s}'")),
        };
        let (host, guest) = ports
            .split_once(':')
            .ok_or_else(|| format!("forward '{s}' must look like host:guest[/proto]"))?;
        let host = host.parse().map_err(|_| format!("invalid host port in '{s}'"))?;
        let guest = guest.parse().map_err(|_| format!("invalid guest port in '{s}'"))?;
        Ok(PortForward { host, guest, proto })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub vm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Bytes, when the tool reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

/// Per-call SSH behaviour. Never persisted.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub command: Option<String>,
    pub wait_timeout: Duration,
    pub no_wait: bool,
    pub auto_start: bool,
    pub check_only: bool,
    pub user: Option<String>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            command: None,
            wait_timeout: Duration::from_secs(300),
            no_wait: false,
            auto_start: false,
            check_only: false,
            user: None,
        }
    }
}

/// Where a VM's SSH daemon can be reached from the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<PathBuf>,
}

impl SshEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            identity: None,
        }
    }
}

impl fmt::Display for SshEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_kebab_case() {
        let json = serde_json::to_string(&VmState::NotFound).unwrap();
        assert_eq!(json, "\"not-found\"");
        assert_eq!(VmState::Suspended.to_string(), "suspended");
    }

    #[test]
    fn active_states_hold_the_disk() {
        assert!(VmState::Running.is_active());
        assert!(VmState::Suspended.is_active());
        assert!(!VmState::Stopped.is_active());
        assert!(!VmState::Unknown.is_active());
    }

    #[test]
    fn parses_port_forwards() {
        let fwd: PortForward = "8080:80".parse().unwrap();
        assert_eq!(fwd, PortForward { host: 8080, guest: 80, proto: Protocol::Tcp });

        let fwd: PortForward = "5353:53/udp".parse().unwrap();
        assert_eq!(fwd.proto, Protocol::Udp);

        assert!("8080:80/sctp".parse::<PortForward>().is_err());
        assert!("8080".parse::<PortForward>().is_err());
    }

    #[test]
    fn config_round_trips_through_json_with_defaults() {
        let cfg: VmConfig = serde_json::from_str(
            r#"{"name":"web","ram":"4G","cpus":4,"disk_size":"40G","os_type":"ubuntu"}"#,
        )
        .unwrap();
        assert!(cfg.enable_ssh);
        assert_eq!(cfg.network.mode, NetworkMode::Nat);
        assert!(cfg.post_create.is_empty());
    }
}
