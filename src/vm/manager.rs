use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::connect::{ConnectivityProber, ProbeOutcome};
use super::error::{ErrorKind, Result, VmError};
use super::host::{self, HostReport};
use super::instance::{BackendKind, SnapshotInfo, SshEndpoint, SshOptions, VmConfig, VmInfo, VmState};
use super::layout::VmPaths;
use super::locks::VmLocks;
use super::process::CommandRunner;
use super::providers::{create_backends, Backend, DriverContext};
use super::registry::{Owner, VmRegistry};
use super::selector::BackendSelector;
use super::snapshot::SnapshotManager;
use crate::config::templates::{self, Source};
use crate::config::validation;
use crate::utils::vm_metadata::VmMetadata;

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub iso_dir: PathBuf,
    pub ssh_user: String,
    pub ssh_wait: Duration,
    pub probe_interval: Duration,
}

impl ManagerSettings {
    pub fn new(iso_dir: impl Into<PathBuf>, ssh_user: impl Into<String>) -> Self {
        Self {
            iso_dir: iso_dir.into(),
            ssh_user: ssh_user.into(),
            ssh_wait: Duration::from_secs(300),
            probe_interval: Duration::from_secs(2),
        }
    }
}

/// Result of `ssh`, shaped for structured output.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SshOutcome {
    Check {
        ready: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },
    Command {
        endpoint: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    Session {
        endpoint: String,
        exit_code: Option<i32>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendStatus {
    pub name: &'static str,
    pub available: bool,
    pub preferred: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_error: Option<String>,
}

/// Entry point for every VM operation.
///
/// Mutating calls hold the per-name lock for their whole duration and go
/// through the selector. Reads go through the registry so that a name
/// claimed by two drivers surfaces as a conflict.
pub struct VmManager {
    registry: Arc<VmRegistry>,
    snapshots: SnapshotManager,
    locks: VmLocks,
    prober: ConnectivityProber,
    settings: ManagerSettings,
}

impl VmManager {
    pub fn new(ctx: DriverContext, pinned: Option<BackendKind>, settings: ManagerSettings) -> Self {
        let backends = create_backends(pinned, &ctx);
        Self::with_backends(backends, ctx.vm_root.clone(), ctx.runner.clone(), settings)
    }

    pub fn with_backends(
        backends: Vec<Arc<dyn Backend>>,
        vm_root: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
        settings: ManagerSettings,
    ) -> Self {
        let registry = Arc::new(VmRegistry::new(BackendSelector::new(backends), vm_root));
        let mut prober = ConnectivityProber::new(runner);
        prober.probe_interval = settings.probe_interval;
        Self {
            snapshots: SnapshotManager::new(registry.clone()),
            registry,
            locks: VmLocks::new(),
            prober,
            settings,
        }
    }

    pub fn vm_root(&self) -> &Path {
        self.registry.vm_root()
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub async fn list(&self) -> Result<Vec<VmInfo>> {
        self.registry.list().await
    }

    pub async fn info(&self, name: &str) -> Result<VmInfo> {
        check_name(name)?;
        self.registry.info(name).await
    }

    pub async fn state(&self, name: &str) -> Result<VmState> {
        check_name(name)?;
        self.registry.state(name).await
    }

    /// Create a VM on the first driver that accepts it.
    ///
    /// A directory holding only a disk kept by an earlier delete is adopted
    /// instead of provisioning a new disk; no installation source is needed
    /// then.
    pub async fn create(&self, mut config: VmConfig) -> Result<BackendKind> {
        validation::validate_vm_config(&config).map_err(|e| VmError::InvalidInput(e.to_string()))?;
        let name = config.name.clone();
        let _guard = self.locks.acquire(&name).await;

        self.registry.ensure_absent(&name).await?;

        let paths = VmPaths::new(self.vm_root(), &name);
        if paths.is_orphan_disk() {
            info!("re-registering kept disk for {}", name);
        } else {
            let source = templates::resolve_source(
                config.iso.as_deref(),
                config.template.as_deref(),
                &config.os_type,
                &self.settings.iso_dir,
            )
            .map_err(|e| VmError::InvalidInput(e.to_string()))?;
            config.iso = match source {
                Source::Iso(path) => Some(path),
                Source::DiskOnly { .. } => None,
            };
        }

        let cfg = &config;
        let (_, kind) = self
            .registry
            .selector()
            .run("create", &name, |b| async move { b.create(cfg).await })
            .await?;
        info!("created {} on {}", name, kind);
        Ok(kind)
    }

    /// Start `name`; with `wait_ssh`, also wait for SSH and run the
    /// `post_create` commands once.
    pub async fn start(&self, name: &str, wait_ssh: bool) -> Result<BackendKind> {
        check_name(name)?;
        let kind = {
            let _guard = self.locks.acquire(name).await;
            let (_, kind) = self
                .registry
                .selector()
                .run("start", name, |b| async move { b.start(name).await })
                .await?;
            kind
        };
        info!("started {} on {}", name, kind);

        if wait_ssh {
            let endpoint = self.wait_for_ssh(name, self.settings.ssh_wait).await?;
            self.provision(name, &endpoint).await?;
        }
        Ok(kind)
    }

    pub async fn stop(&self, name: &str, force: bool) -> Result<BackendKind> {
        self.mutate("stop", name, |b| async move { b.stop(name, force).await })
            .await
    }

    pub async fn restart(&self, name: &str) -> Result<BackendKind> {
        self.mutate("restart", name, |b| async move { b.restart(name).await })
            .await
    }

    pub async fn suspend(&self, name: &str) -> Result<BackendKind> {
        self.mutate("suspend", name, |b| async move { b.suspend(name).await })
            .await
    }

    pub async fn resume(&self, name: &str) -> Result<BackendKind> {
        self.mutate("resume", name, |b| async move { b.resume(name).await })
            .await
    }

    /// Delete `name`. A directory left with only a kept disk is removed by
    /// a later `keep_disk = false` delete; anything else no driver owns is
    /// `NotFound`.
    pub async fn delete(&self, name: &str, keep_disk: bool) -> Result<Owner> {
        check_name(name)?;
        let _guard = self.locks.acquire(name).await;

        let result = self
            .registry
            .selector()
            .run("delete", name, |b| async move { b.delete(name, keep_disk).await })
            .await;
        match result {
            Ok((_, kind)) => {
                info!("deleted {} from {}", name, kind);
                Ok(Owner::Backend(kind))
            }
            Err(e) if e.kind() == ErrorKind::NotFound && !keep_disk => {
                let paths = VmPaths::new(self.vm_root(), name);
                if !paths.is_orphan_disk() {
                    return Err(e);
                }
                std::fs::remove_dir_all(&paths.dir)?;
                info!("removed kept disk of {} at {}", name, paths.dir.display());
                Ok(Owner::Filesystem)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn create_snapshot(&self, vm: &str, snapshot: &str, description: Option<String>) -> Result<BackendKind> {
        check_name(vm)?;
        let _guard = self.locks.acquire(vm).await;
        self.snapshots.create(vm, snapshot, description).await
    }

    pub async fn list_snapshots(&self, vm: &str) -> Result<Vec<SnapshotInfo>> {
        check_name(vm)?;
        self.snapshots.list(vm).await
    }

    pub async fn revert_snapshot(&self, vm: &str, snapshot: &str) -> Result<BackendKind> {
        check_name(vm)?;
        let _guard = self.locks.acquire(vm).await;
        self.snapshots.revert(vm, snapshot).await
    }

    pub async fn delete_snapshot(&self, vm: &str, snapshot: &str) -> Result<BackendKind> {
        check_name(vm)?;
        let _guard = self.locks.acquire(vm).await;
        self.snapshots.delete(vm, snapshot).await
    }

    /// Single non-blocking readiness check; never authenticates.
    pub async fn ssh_ready(&self, name: &str) -> Result<bool> {
        check_name(name)?;
        match self.endpoint(name).await {
            Ok(endpoint) => Ok(self.prober.probe(&endpoint).await.is_ready()),
            Err(e) if e.kind() == ErrorKind::PreconditionFailed => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn ssh(&self, name: &str, opts: &SshOptions) -> Result<SshOutcome> {
        check_name(name)?;
        let state = self.registry.state(name).await?;
        if !matches!(state, VmState::Running | VmState::Starting) {
            if opts.auto_start {
                info!("{} is {}, starting it first", name, state);
                self.start(name, false).await?;
            } else if opts.check_only {
                return Ok(SshOutcome::Check {
                    ready: false,
                    endpoint: None,
                });
            } else {
                return Err(VmError::VmNotRunning(name.to_string()));
            }
        }

        if opts.check_only {
            let endpoint = self.endpoint(name).await.ok();
            let ready = match &endpoint {
                Some(ep) => self.prober.probe(ep).await.is_ready(),
                None => false,
            };
            return Ok(SshOutcome::Check {
                ready,
                endpoint: endpoint.map(|e| e.to_string()),
            });
        }

        let endpoint = if opts.no_wait {
            let endpoint = self.endpoint(name).await?;
            match self.prober.probe(&endpoint).await {
                ProbeOutcome::Ready { .. } => endpoint,
                ProbeOutcome::Refused => {
                    return Err(VmError::ConnectionRefused {
                        endpoint: endpoint.to_string(),
                    })
                }
                other => {
                    warn!("ssh on {} is not ready: {:?}", name, other);
                    return Err(VmError::Timeout {
                        what: format!("ssh on '{name}'"),
                        after: self.prober.probe_timeout,
                    });
                }
            }
        } else {
            self.wait_for_ssh(name, opts.wait_timeout).await?
        };

        let user = opts.user.as_deref().unwrap_or(&self.settings.ssh_user);
        match &opts.command {
            Some(command) => {
                let out = self.prober.run_command(&endpoint, user, command).await?;
                Ok(SshOutcome::Command {
                    endpoint: endpoint.to_string(),
                    exit_code: out.exit_code,
                    stdout: out.stdout,
                    stderr: out.stderr,
                })
            }
            None => {
                let exit_code = self.prober.interactive(&endpoint, user).await?;
                Ok(SshOutcome::Session {
                    endpoint: endpoint.to_string(),
                    exit_code,
                })
            }
        }
    }

    pub async fn copy(&self, name: &str, src: &str, dst: &str, from_vm: bool, user: Option<&str>) -> Result<()> {
        check_name(name)?;
        let state = self.registry.state(name).await?;
        if state != VmState::Running {
            return Err(VmError::VmNotRunning(name.to_string()));
        }
        let endpoint = self.endpoint(name).await?;
        let user = user.unwrap_or(&self.settings.ssh_user);
        self.prober.copy(&endpoint, user, src, dst, from_vm).await?;
        info!("copied {} -> {} ({})", src, dst, if from_vm { "from vm" } else { "to vm" });
        Ok(())
    }

    /// Availability of every configured driver. Versions are only probed
    /// when asked for.
    pub async fn backends(&self, probe_versions: bool) -> Vec<BackendStatus> {
        let preferred = self.registry.selector().preferred();
        let mut report = Vec::new();
        for backend in self.registry.selector().backends() {
            let available = backend.is_available();
            let (version, version_error) = if probe_versions && available {
                match backend.version().await {
                    Ok(v) => (Some(v), None),
                    Err(e) => (None, Some(e.to_string())),
                }
            } else {
                (None, None)
            };
            report.push(BackendStatus {
                name: backend.name(),
                available,
                preferred: preferred == Some(backend.kind()),
                version,
                version_error,
            });
        }
        report
    }

    /// Hardware acceleration and driver availability in one report.
    pub async fn host_check(&self, versions: bool) -> HostReport {
        let kvm = host::kvm_status();
        HostReport::new(kvm, self.backends(versions).await)
    }

    async fn mutate<F, Fut>(&self, operation: &str, name: &str, call: F) -> Result<BackendKind>
    where
        F: FnMut(Arc<dyn Backend>) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        check_name(name)?;
        let _guard = self.locks.acquire(name).await;
        let (_, kind) = self.registry.selector().run(operation, name, call).await?;
        info!("{} {} on {}", operation, name, kind);
        Ok(kind)
    }

    async fn endpoint(&self, name: &str) -> Result<SshEndpoint> {
        self.registry
            .selector()
            .run("ssh endpoint", name, |b| async move { b.ssh_endpoint(name).await })
            .await
            .map(|(endpoint, _)| endpoint)
    }

    async fn wait_for_ssh(&self, name: &str, budget: Duration) -> Result<SshEndpoint> {
        self.prober
            .wait_ready(name, budget, || self.endpoint(name))
            .await
    }

    async fn provision(&self, name: &str, endpoint: &SshEndpoint) -> Result<()> {
        let _guard = self.locks.acquire(name).await;
        let dir = VmPaths::new(self.vm_root(), name).dir;
        let Some(mut meta) = VmMetadata::load(&dir)? else {
            return Ok(());
        };
        if meta.provisioned || meta.config.post_create.is_empty() {
            return Ok(());
        }

        info!("running {} post-create command(s) on {}", meta.config.post_create.len(), name);
        for command in &meta.config.post_create {
            let out = self
                .prober
                .run_command(endpoint, &self.settings.ssh_user, command)
                .await?;
            if !out.success() {
                return Err(VmError::failed(
                    "ssh",
                    &format!("post-create `{command}`"),
                    out.exit_code,
                    out.diagnostic(),
                ));
            }
        }
        meta.provisioned = true;
        meta.save(&dir)?;
        Ok(())
    }
}

fn check_name(name: &str) -> Result<()> {
    validation::validate_vm_name(name).map_err(|e| VmError::InvalidInput(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::process::testing::ScriptedRunner;
    use crate::vm::providers::MockBackend;

    fn qemu() -> MockBackend {
        let mut m = MockBackend::new();
        m.expect_name().return_const("qemu");
        m.expect_kind().return_const(BackendKind::Qemu);
        m.expect_is_available().return_const(true);
        m
    }

    fn manager(root: &Path, backend: MockBackend) -> VmManager {
        VmManager::with_backends(
            vec![Arc::new(backend)],
            root,
            Arc::new(ScriptedRunner::new(&[])),
            ManagerSettings::new(root.join("iso"), "dev"),
        )
    }

    #[tokio::test]
    async fn invalid_names_never_reach_a_driver() {
        let root = tempfile::tempdir().unwrap();
        let mut b = qemu();
        b.expect_start().never();
        let err = manager(root.path(), b).start("../etc", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn create_refuses_an_existing_name() {
        let root = tempfile::tempdir().unwrap();
        let mut b = qemu();
        b.expect_state().returning(|_| Ok(VmState::Stopped));
        b.expect_create().never();

        let mut config = VmConfig::new("web");
        config.os_type = "ubuntu".into();
        let err = manager(root.path(), b).create(config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn create_without_any_source_is_invalid() {
        let root = tempfile::tempdir().unwrap();
        let mut b = qemu();
        b.expect_state().returning(|n| Err(VmError::not_found("qemu", n)));
        b.expect_create().never();

        let err = manager(root.path(), b)
            .create(VmConfig::new("web"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn create_with_missing_template_iso_boots_from_disk() {
        let root = tempfile::tempdir().unwrap();
        let mut b = qemu();
        b.expect_state().returning(|n| Err(VmError::not_found("qemu", n)));
        b.expect_create()
            .withf(|cfg: &VmConfig| cfg.name == "web" && cfg.iso.is_none())
            .times(1)
            .returning(|_| Ok(()));

        let mut config = VmConfig::new("web");
        config.os_type = "ubuntu".into();
        let kind = manager(root.path(), b).create(config).await.unwrap();
        assert_eq!(kind, BackendKind::Qemu);
    }

    #[tokio::test]
    async fn second_delete_removes_a_kept_disk() {
        let root = tempfile::tempdir().unwrap();
        let paths = VmPaths::new(root.path(), "web");
        std::fs::create_dir_all(&paths.dir).unwrap();
        std::fs::write(paths.disk(), b"qcow").unwrap();

        let mut b = qemu();
        b.expect_delete().returning(|n, _| Err(VmError::not_found("qemu", n)));
        let mgr = manager(root.path(), b);

        let err = mgr.delete("web", true).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(paths.disk().exists());

        assert_eq!(mgr.delete("web", false).await.unwrap(), Owner::Filesystem);
        assert!(!paths.dir.exists());

        let err = mgr.delete("web", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn ssh_to_stopped_vm_is_refused_unless_checking() {
        let root = tempfile::tempdir().unwrap();
        let mut b = qemu();
        b.expect_state().returning(|_| Ok(VmState::Stopped));
        b.expect_ssh_endpoint().never();
        let mgr = manager(root.path(), b);

        let err = mgr.ssh("web", &SshOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VmNotRunning);

        let opts = SshOptions {
            check_only: true,
            ..SshOptions::default()
        };
        match mgr.ssh("web", &opts).await.unwrap() {
            SshOutcome::Check { ready, .. } => assert!(!ready),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn backend_report_marks_the_preferred_driver() {
        let root = tempfile::tempdir().unwrap();
        let mut b = qemu();
        b.expect_version().never();
        let report = manager(root.path(), b).backends(false).await;
        assert_eq!(report.len(), 1);
        assert!(report[0].available && report[0].preferred);
        assert!(report[0].version.is_none());
    }
}
