//! Command handlers shared by the CLI and the MCP server.
//!
//! Every entry point checks the caller's permission tier before anything
//! reaches the manager.

pub mod permissions;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::templates::{self, IsoEntry, VmTemplate};
use crate::config::{VmDefaults, VmHubConfig};
use crate::utils::checksum::{self, Verification};
use crate::vm::error::{Result, VmError};
use crate::vm::host::HostReport;
use crate::vm::instance::{
    BackendKind, NetworkMode, PortForward, SnapshotInfo, SshOptions, VmConfig, VmInfo, VmState,
};
use crate::vm::manager::{BackendStatus, ManagerSettings, SshOutcome, VmManager};
use crate::vm::process::CommandRunner;
use crate::vm::providers::DriverContext;
use crate::vm::registry::Owner;
use permissions::{check, Action, PermissionLevel};

/// Fields of a `create` request. Anything left out comes from the template
/// recommendation, then from the configured defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CreateRequest {
    pub name: String,
    pub os_type: Option<String>,
    pub template: Option<String>,
    pub iso: Option<PathBuf>,
    pub ram: Option<String>,
    pub cpus: Option<u32>,
    pub disk_size: Option<String>,
    pub network: Option<NetworkMode>,
    pub bridge: Option<String>,
    pub forwards: Vec<PortForward>,
    pub ssh_key: Option<PathBuf>,
    pub no_ssh: bool,
    pub post_create: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotAction {
    Create,
    #[serde(alias = "revert")]
    Restore,
    List,
    Delete,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SnapshotResult {
    Created { vm: String, snapshot: String, backend: BackendKind },
    Restored { vm: String, snapshot: String, backend: BackendKind },
    Deleted { vm: String, snapshot: String, backend: BackendKind },
    Listed { vm: String, snapshots: Vec<SnapshotInfo> },
}

pub struct CommandHandler {
    manager: Arc<VmManager>,
    level: PermissionLevel,
    defaults: VmDefaults,
}

impl CommandHandler {
    pub fn new(manager: Arc<VmManager>, level: PermissionLevel, defaults: VmDefaults) -> Self {
        Self {
            manager,
            level,
            defaults,
        }
    }

    /// Wire drivers, registry and prober from the loaded configuration.
    pub fn from_config(
        config: &VmHubConfig,
        vm_dir: Option<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> anyhow::Result<Self> {
        let vm_root = match vm_dir {
            Some(dir) => dir,
            None => config.vm_root().context("Failed to resolve the VM directory")?,
        };
        let iso_dir = config.iso_root().context("Failed to resolve the ISO directory")?;

        let mut ctx = DriverContext::new(vm_root, runner);
        ctx.command_timeout = config.command_timeout();
        ctx.stop_timeout = config.stop_timeout();
        ctx.libvirt_uri = config.libvirt_uri.clone();

        let mut settings = ManagerSettings::new(iso_dir, config.ssh.user.clone());
        settings.ssh_wait = config.ssh_wait_timeout();
        settings.probe_interval = Duration::from_millis(config.ssh.probe_interval_ms);

        let manager = VmManager::new(ctx, config.backend.pinned(), settings);
        Ok(Self::new(Arc::new(manager), config.permissions, config.defaults.clone()))
    }

    pub fn manager(&self) -> &VmManager {
        &self.manager
    }

    pub fn level(&self) -> PermissionLevel {
        self.level
    }

    pub async fn list(&self) -> Result<Vec<VmInfo>> {
        check(self.level, Action::List)?;
        self.manager.list().await
    }

    pub async fn info(&self, name: &str) -> Result<VmInfo> {
        check(self.level, Action::Info)?;
        self.manager.info(name).await
    }

    pub async fn state(&self, name: &str) -> Result<VmState> {
        check(self.level, Action::State)?;
        self.manager.state(name).await
    }

    pub async fn create(&self, request: CreateRequest) -> Result<BackendKind> {
        check(self.level, Action::Create)?;
        let config = build_config(request, &self.defaults);
        self.manager.create(config).await
    }

    pub async fn start(&self, name: &str, wait_ssh: bool) -> Result<BackendKind> {
        check(self.level, Action::Start)?;
        self.manager.start(name, wait_ssh).await
    }

    pub async fn stop(&self, name: &str, force: bool) -> Result<BackendKind> {
        check(self.level, Action::Stop)?;
        self.manager.stop(name, force).await
    }

    pub async fn restart(&self, name: &str) -> Result<BackendKind> {
        check(self.level, Action::Restart)?;
        self.manager.restart(name).await
    }

    pub async fn suspend(&self, name: &str) -> Result<BackendKind> {
        check(self.level, Action::Suspend)?;
        self.manager.suspend(name).await
    }

    pub async fn resume(&self, name: &str) -> Result<BackendKind> {
        check(self.level, Action::Resume)?;
        self.manager.resume(name).await
    }

    pub async fn delete(&self, name: &str, keep_disk: bool) -> Result<Owner> {
        check(self.level, Action::Delete)?;
        self.manager.delete(name, keep_disk).await
    }

    pub async fn snapshot(
        &self,
        vm: &str,
        action: SnapshotAction,
        snapshot: Option<&str>,
        description: Option<String>,
    ) -> Result<SnapshotResult> {
        let vm = vm.to_string();
        let required = || {
            snapshot
                .map(str::to_string)
                .ok_or_else(|| VmError::InvalidInput("a snapshot name is required for this action".to_string()))
        };
        match action {
            SnapshotAction::List => {
                check(self.level, Action::Info)?;
                let snapshots = self.manager.list_snapshots(&vm).await?;
                Ok(SnapshotResult::Listed { vm, snapshots })
            }
            SnapshotAction::Create => {
                check(self.level, Action::Snapshot)?;
                let snapshot = required()?;
                let backend = self.manager.create_snapshot(&vm, &snapshot, description).await?;
                Ok(SnapshotResult::Created { vm, snapshot, backend })
            }
            SnapshotAction::Restore => {
                check(self.level, Action::Snapshot)?;
                let snapshot = required()?;
                let backend = self.manager.revert_snapshot(&vm, &snapshot).await?;
                Ok(SnapshotResult::Restored { vm, snapshot, backend })
            }
            SnapshotAction::Delete => {
                check(self.level, Action::Snapshot)?;
                let snapshot = required()?;
                let backend = self.manager.delete_snapshot(&vm, &snapshot).await?;
                Ok(SnapshotResult::Deleted { vm, snapshot, backend })
            }
        }
    }

    pub async fn ssh(&self, name: &str, opts: &SshOptions) -> Result<SshOutcome> {
        let action = if opts.check_only && !opts.auto_start {
            Action::SshCheck
        } else {
            Action::Ssh
        };
        check(self.level, action)?;
        self.manager.ssh(name, opts).await
    }

    pub async fn ssh_check(&self, name: &str) -> Result<bool> {
        check(self.level, Action::SshCheck)?;
        self.manager.ssh_ready(name).await
    }

    pub async fn copy(&self, name: &str, src: &str, dst: &str, from_vm: bool, user: Option<&str>) -> Result<()> {
        check(self.level, Action::Copy)?;
        self.manager.copy(name, src, dst, from_vm, user).await
    }

    pub async fn backends(&self, probe_versions: bool) -> Result<Vec<BackendStatus>> {
        check(self.level, Action::Backends)?;
        Ok(self.manager.backends(probe_versions).await)
    }

    pub fn templates(&self) -> Result<&'static [VmTemplate]> {
        check(self.level, Action::Templates)?;
        Ok(templates::TEMPLATES)
    }

    pub async fn check_host(&self, versions: bool) -> Result<HostReport> {
        check(self.level, Action::Check)?;
        Ok(self.manager.host_check(versions).await)
    }

    pub fn iso_list(&self) -> Result<Vec<IsoEntry>> {
        check(self.level, Action::Iso)?;
        Ok(templates::iso_catalogue(&self.manager.settings().iso_dir))
    }

    /// Hash a catalogue ISO (by template name) or any file. A digest that
    /// does not match is an error; no digest to compare against is not.
    pub async fn iso_verify(&self, target: &str, sha: Option<&str>) -> Result<Verification> {
        check(self.level, Action::Iso)?;
        let path = templates::iso_path(target, &self.manager.settings().iso_dir);
        if !path.is_file() {
            return Err(VmError::PreconditionFailed(format!(
                "ISO not found: {}",
                path.display()
            )));
        }
        let expected = sha
            .map(|raw| checksum::parse_digest(raw, "command line"))
            .transpose()
            .map_err(|e| VmError::InvalidInput(format!("{:#}", e)))?;

        let hashed = path.clone();
        let verification = tokio::task::spawn_blocking(move || checksum::verify_file(&hashed, expected))
            .await
            .map_err(|e| VmError::failed("iso", "verify", None, e.to_string()))?
            .map_err(|e| VmError::failed("iso", "verify", None, format!("{:#}", e)))?;

        if verification.matched == Some(false) {
            return Err(VmError::PreconditionFailed(format!(
                "checksum mismatch for {}: expected {}, calculated {}",
                path.display(),
                verification.expected.as_deref().unwrap_or_default(),
                verification.digest
            )));
        }
        Ok(verification)
    }
}

fn build_config(request: CreateRequest, defaults: &VmDefaults) -> VmConfig {
    let os_hint = request.os_type.clone().unwrap_or_else(|| defaults.os_type.clone());
    let recommended = match &request.template {
        Some(name) => templates::find(name),
        None => templates::default_for_os(&os_hint),
    };

    let mut config = VmConfig::new(request.name);
    config.template = request.template;
    config.iso = request.iso;
    config.os_type = request
        .os_type
        .or_else(|| recommended.map(|t| t.os_type.to_string()))
        .unwrap_or_else(|| defaults.os_type.clone());
    config.ram = request
        .ram
        .or_else(|| recommended.map(|t| t.ram.to_string()))
        .unwrap_or_else(|| defaults.ram.clone());
    config.disk_size = request
        .disk_size
        .or_else(|| recommended.map(|t| t.disk_size.to_string()))
        .unwrap_or_else(|| defaults.disk.clone());
    config.cpus = request
        .cpus
        .or_else(|| recommended.map(|t| t.cpus))
        .unwrap_or(defaults.cpus);
    config.enable_ssh = !request.no_ssh;
    config.ssh_key = request.ssh_key;
    config.network.mode = request.network.unwrap_or_default();
    config.network.bridge = request.bridge;
    config.network.forwards = request.forwards;
    config.post_create = request.post_create;
    if let Some(tpl) = recommended {
        for feature in tpl.features {
            config.features.insert(feature.to_string(), "on".to_string());
        }
    }
    config
}

/// Structured form of an error: kind, message, exit code and, for
/// aggregates, what each driver said.
pub fn error_json(error: &VmError) -> Value {
    json!({
        "kind": error.kind(),
        "message": error.to_string(),
        "exit_code": error.kind().exit_code(),
        "attempts": error.attempts(),
    })
}
