pub mod libvirt;
pub mod qemu;
pub mod virtualbox;

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::error::Result;
use super::instance::{BackendKind, SnapshotInfo, SshEndpoint, VmConfig, VmInfo, VmState};
use super::process::{self, CommandRunner, ToolOutput};

/// One hypervisor-specific implementation of the VM lifecycle.
///
/// Drivers report `NotFound` for VMs they do not own and `Unavailable` when
/// their tooling is missing; the selector relies on exactly those two to
/// decide whether another driver may be asked.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> BackendKind;

    /// Cheap, side-effect free: checks that the tools exist, runs nothing.
    fn is_available(&self) -> bool;

    async fn version(&self) -> Result<String>;

    async fn create(&self, config: &VmConfig) -> Result<()>;
    async fn start(&self, name: &str) -> Result<()>;
    async fn stop(&self, name: &str, force: bool) -> Result<()>;
    async fn restart(&self, name: &str) -> Result<()>;
    async fn suspend(&self, name: &str) -> Result<()>;
    async fn resume(&self, name: &str) -> Result<()>;
    async fn delete(&self, name: &str, keep_disk: bool) -> Result<()>;

    async fn list(&self) -> Result<Vec<VmInfo>>;
    async fn info(&self, name: &str) -> Result<VmInfo>;
    async fn state(&self, name: &str) -> Result<VmState>;
    async fn ip(&self, name: &str) -> Result<Option<String>>;
    async fn ssh_endpoint(&self, name: &str) -> Result<SshEndpoint>;

    async fn create_snapshot(&self, vm: &str, snapshot: &str, description: Option<String>) -> Result<()>;
    async fn list_snapshots(&self, vm: &str) -> Result<Vec<SnapshotInfo>>;
    async fn revert_snapshot(&self, vm: &str, snapshot: &str) -> Result<()>;
    async fn delete_snapshot(&self, vm: &str, snapshot: &str) -> Result<()>;
}

/// What every driver is constructed with.
#[derive(Clone)]
pub struct DriverContext {
    pub vm_root: PathBuf,
    pub runner: Arc<dyn CommandRunner>,
    pub command_timeout: Duration,
    /// Budget for disk provisioning and other long tool runs.
    pub provision_timeout: Duration,
    pub stop_timeout: Duration,
    pub libvirt_uri: Option<String>,
}

impl DriverContext {
    pub fn new(vm_root: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            vm_root: vm_root.into(),
            runner,
            command_timeout: Duration::from_secs(60),
            provision_timeout: Duration::from_secs(600),
            stop_timeout: Duration::from_secs(60),
            libvirt_uri: None,
        }
    }

    pub(crate) async fn exec(&self, backend: &str, program: &str, args: &[String]) -> Result<ToolOutput> {
        process::invoke(self.runner.as_ref(), backend, program, args, self.command_timeout).await
    }

    pub(crate) async fn exec_long(&self, backend: &str, program: &str, args: &[String]) -> Result<ToolOutput> {
        process::invoke(self.runner.as_ref(), backend, program, args, self.provision_timeout).await
    }
}

pub fn create_backend(kind: BackendKind, ctx: DriverContext) -> Arc<dyn Backend> {
    match kind {
        BackendKind::Libvirt => Arc::new(libvirt::LibvirtBackend::new(ctx)),
        BackendKind::Qemu => Arc::new(qemu::QemuBackend::new(ctx)),
        BackendKind::VirtualBox => Arc::new(virtualbox::VirtualBoxBackend::new(ctx)),
    }
}

/// Drivers in fallback order. A pinned backend yields just that driver.
pub fn create_backends(pinned: Option<BackendKind>, ctx: &DriverContext) -> Vec<Arc<dyn Backend>> {
    match pinned {
        Some(kind) => vec![create_backend(kind, ctx.clone())],
        None => BackendKind::ALL
            .iter()
            .map(|kind| create_backend(*kind, ctx.clone()))
            .collect(),
    }
}
