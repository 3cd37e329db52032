//! libvirt driver. Every call shells out to `virsh`; disks for domains we
//! define live in the conventional VM directory so that filesystem
//! discovery finds them when libvirt is gone.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::json;
use std::path::Path;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::{Backend, DriverContext};
use crate::argv;
use crate::utils::size::parse_size_mb;
use crate::utils::template::{TemplateEngine, DOMAIN_XML};
use crate::utils::vm_metadata::{SnapshotNote, SnapshotNotes, VmMetadata};
use crate::vm::error::{Result, VmError};
use crate::vm::instance::{
    BackendKind, NetworkMode, SnapshotInfo, SshEndpoint, VmConfig, VmInfo, VmState,
};
use crate::vm::layout::VmPaths;
use crate::vm::process::ToolOutput;

const BACKEND: &str = "libvirt";
const VIRSH: &str = "virsh";
const QEMU_IMG: &str = "qemu-img";

pub struct LibvirtBackend {
    ctx: DriverContext,
}

impl LibvirtBackend {
    pub fn new(ctx: DriverContext) -> Self {
        Self { ctx }
    }

    async fn virsh(&self, args: Vec<String>) -> Result<ToolOutput> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(uri) = &self.ctx.libvirt_uri {
            full.extend(argv!["-c", uri]);
        }
        full.extend(args);
        let out = self.ctx.exec(BACKEND, VIRSH, &full).await?;
        // virsh without a reachable libvirtd is no control plane at all.
        if !out.success() && is_daemon_unreachable(out.diagnostic()) {
            return Err(VmError::unavailable(BACKEND, out.diagnostic().to_string()));
        }
        Ok(out)
    }

    /// Run a per-domain command, mapping "no such domain" onto `NotFound`.
    async fn virsh_domain(&self, operation: &str, name: &str, args: Vec<String>) -> Result<ToolOutput> {
        let out = self.virsh(args).await?;
        if out.success() {
            Ok(out)
        } else if is_missing_domain(out.diagnostic()) {
            Err(VmError::not_found(BACKEND, name))
        } else {
            Err(VmError::failed(BACKEND, &format!("virsh {operation}"), out.exit_code, out.diagnostic()))
        }
    }

    async fn domstate(&self, name: &str) -> Result<VmState> {
        let out = self.virsh_domain("domstate", name, argv!["domstate", name]).await?;
        Ok(map_domstate(out.stdout.trim()))
    }

    async fn wait_for_state(&self, name: &str, target: VmState) -> Result<()> {
        let deadline = Instant::now() + self.ctx.stop_timeout;
        loop {
            if self.domstate(name).await? == target {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(VmError::Timeout {
                    what: format!("'{name}' to reach {target}"),
                    after: self.ctx.stop_timeout,
                });
            }
            sleep(std::time::Duration::from_millis(500)).await;
        }
    }

    async fn snapshot_names(&self, vm: &str, extra: Vec<String>) -> Result<Vec<String>> {
        let mut args = argv!["snapshot-list", vm, "--name"];
        args.extend(extra);
        let out = self.virsh_domain("snapshot-list", vm, args).await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn require_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        if self.snapshot_names(vm, Vec::new()).await?.iter().any(|s| s == snapshot) {
            Ok(())
        } else {
            Err(VmError::snapshot_not_found(BACKEND, vm, snapshot))
        }
    }

    fn paths(&self, name: &str) -> VmPaths {
        VmPaths::new(&self.ctx.vm_root, name)
    }

    fn metadata(&self, name: &str) -> Option<VmMetadata> {
        VmMetadata::load(&self.paths(name).dir)
            .ok()
            .flatten()
            .filter(|m| m.backend == BackendKind::Libvirt)
    }

    fn render_domain(&self, config: &VmConfig, paths: &VmPaths, ram_mb: u64) -> Result<String> {
        let interface = match config.network.mode {
            NetworkMode::Bridge => json!({
                "kind": "bridge",
                "source_attr": "bridge",
                "source": config.network.bridge.as_deref().unwrap_or("br0"),
                "model": "virtio",
            }),
            NetworkMode::Nat | NetworkMode::Host => json!({
                "kind": "network",
                "source_attr": "network",
                "source": "default",
                "model": "virtio",
            }),
        };
        let windows = config.is_windows();
        let context = json!({
            "domain_type": if Path::new("/dev/kvm").exists() { "kvm" } else { "qemu" },
            "name": config.name,
            "uuid": uuid::Uuid::new_v4().to_string(),
            "memory_mb": ram_mb,
            "cpus": config.cpus,
            "iso": config.iso.as_ref().map(|p| p.display().to_string()),
            "windows": windows,
            "disk": paths.disk().display().to_string(),
            "disk_bus": if windows { "sata" } else { "virtio" },
            "disk_bus_dev": if windows { "sdb" } else { "vda" },
            "interfaces": [interface],
        });

        let engine = TemplateEngine::new()
            .map_err(|e| VmError::failed(BACKEND, "render domain", None, e.to_string()))?;
        engine
            .render(DOMAIN_XML, &context)
            .map_err(|e| VmError::failed(BACKEND, "render domain", None, e.to_string()))
    }
}

#[async_trait]
impl Backend for LibvirtBackend {
    fn name(&self) -> &'static str {
        BACKEND
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Libvirt
    }

    fn is_available(&self) -> bool {
        self.ctx.runner.has_binary(VIRSH)
    }

    async fn version(&self) -> Result<String> {
        let out = self.virsh(argv!["--version"]).await?;
        if !out.success() {
            return Err(VmError::failed(BACKEND, "virsh --version", out.exit_code, out.diagnostic()));
        }
        Ok(format!("libvirt {}", out.stdout.trim()))
    }

    async fn create(&self, config: &VmConfig) -> Result<()> {
        let name = &config.name;
        if self.virsh(argv!["dominfo", name]).await?.success() {
            return Err(VmError::Conflict(format!("libvirt domain '{name}' already exists")));
        }
        let paths = self.paths(name);
        if paths.metadata().exists() || paths.script().exists() {
            return Err(VmError::Conflict(format!(
                "vm '{name}' already exists in {}",
                paths.dir.display()
            )));
        }
        let ram_mb = parse_size_mb(&config.ram)
            .ok_or_else(|| VmError::InvalidInput(format!("invalid RAM size '{}'", config.ram)))?;
        let disk_mb = parse_size_mb(&config.disk_size)
            .ok_or_else(|| VmError::InvalidInput(format!("invalid disk size '{}'", config.disk_size)))?;
        if !config.network.forwards.is_empty() {
            warn!("port forwards are not applied to libvirt domains; use the guest address instead");
        }

        info!("Creating libvirt domain: {}", name);
        let created_dir = !paths.exists();
        std::fs::create_dir_all(&paths.dir)?;
        let cleanup = |paths: &VmPaths| {
            if created_dir {
                let _ = std::fs::remove_dir_all(&paths.dir);
            }
        };

        let disk = paths.disk();
        if disk.is_file() {
            info!("re-registering existing disk {}", disk.display());
        } else {
            let out = match self
                .ctx
                .exec_long(BACKEND, QEMU_IMG, &argv!["create", "-f", "qcow2", disk.display(), format!("{disk_mb}M")])
                .await
            {
                Ok(out) => out,
                Err(e) => {
                    cleanup(&paths);
                    return Err(e);
                }
            };
            if !out.success() {
                cleanup(&paths);
                return Err(VmError::failed(BACKEND, "qemu-img create", out.exit_code, out.diagnostic()));
            }
        }

        let xml = match self.render_domain(config, &paths, ram_mb) {
            Ok(xml) => xml,
            Err(e) => {
                cleanup(&paths);
                return Err(e);
            }
        };
        let xml_path = paths.dir.join(format!("{name}.xml"));
        std::fs::write(&xml_path, xml)?;

        let defined = self.virsh(argv!["define", xml_path.display()]).await;
        match defined {
            Ok(out) if out.success() => {}
            Ok(out) => {
                cleanup(&paths);
                return Err(VmError::failed(BACKEND, "virsh define", out.exit_code, out.diagnostic()));
            }
            Err(e) => {
                cleanup(&paths);
                return Err(e);
            }
        }

        let mut meta = VmMetadata::new(BackendKind::Libvirt, config.clone());
        meta.boot_iso = config.iso.clone();
        meta.save(&paths.dir)?;
        info!("libvirt domain defined: {}", name);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        match self.domstate(name).await? {
            VmState::Running | VmState::Starting => {
                info!("{} is already running", name);
                return Ok(());
            }
            VmState::Suspended => return self.resume(name).await,
            _ => {}
        }

        info!("Starting libvirt domain: {}", name);
        let out = self.virsh(argv!["start", name]).await?;
        if !out.success() {
            let diag = out.diagnostic();
            if is_missing_domain(diag) {
                return Err(VmError::not_found(BACKEND, name));
            }
            if !diag.contains("already active") {
                return Err(VmError::failed(BACKEND, "virsh start", out.exit_code, diag));
            }
        }
        if self.paths(name).metadata().exists() {
            VmMetadata::touch_started(&self.paths(name).dir)?;
        }
        Ok(())
    }

    async fn stop(&self, name: &str, force: bool) -> Result<()> {
        if self.domstate(name).await? == VmState::Stopped {
            info!("{} is already stopped", name);
            return Ok(());
        }

        if force {
            info!("Destroying libvirt domain: {}", name);
            let out = self.virsh(argv!["destroy", name]).await?;
            if !out.success() && !out.diagnostic().contains("not running") {
                return Err(VmError::failed(BACKEND, "virsh destroy", out.exit_code, out.diagnostic()));
            }
        } else {
            info!("Shutting down libvirt domain: {}", name);
            let out = self.virsh(argv!["shutdown", name]).await?;
            if !out.success() && !out.diagnostic().contains("not running") {
                warn!("virsh shutdown failed ({}), retrying with ACPI", out.diagnostic());
                let acpi = self.virsh(argv!["shutdown", name, "--mode", "acpi"]).await?;
                if !acpi.success() {
                    return Err(VmError::failed(
                        BACKEND,
                        "virsh shutdown --mode acpi",
                        acpi.exit_code,
                        acpi.diagnostic(),
                    ));
                }
            }
        }
        self.wait_for_state(name, VmState::Stopped).await
    }

    async fn restart(&self, name: &str) -> Result<()> {
        if self.domstate(name).await? == VmState::Running {
            info!("Rebooting libvirt domain: {}", name);
            self.virsh_domain("reboot", name, argv!["reboot", name]).await?;
            Ok(())
        } else {
            self.start(name).await
        }
    }

    async fn suspend(&self, name: &str) -> Result<()> {
        match self.domstate(name).await? {
            VmState::Suspended => Ok(()),
            VmState::Running => {
                self.virsh_domain("suspend", name, argv!["suspend", name]).await?;
                Ok(())
            }
            _ => Err(VmError::VmNotRunning(name.to_string())),
        }
    }

    async fn resume(&self, name: &str) -> Result<()> {
        match self.domstate(name).await? {
            VmState::Running => Ok(()),
            VmState::Suspended => {
                self.virsh_domain("resume", name, argv!["resume", name]).await?;
                Ok(())
            }
            _ => Err(VmError::VmNotRunning(name.to_string())),
        }
    }

    async fn delete(&self, name: &str, keep_disk: bool) -> Result<()> {
        if self.domstate(name).await?.is_active() {
            self.virsh_domain("destroy", name, argv!["destroy", name]).await?;
        }

        info!("Undefining libvirt domain: {}{}", name, if keep_disk { " (keeping disk)" } else { "" });
        self.virsh_domain(
            "undefine",
            name,
            argv!["undefine", name, "--managed-save", "--snapshots-metadata"],
        )
        .await?;

        // Only the disk in the conventional directory is ours to remove;
        // attached ISOs and foreign volumes are left alone.
        let paths = self.paths(name);
        if paths.exists() {
            if keep_disk {
                paths.remove_all_but_disks()?;
            } else {
                std::fs::remove_dir_all(&paths.dir)?;
            }
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<VmInfo>> {
        let out = self.virsh(argv!["list", "--all"]).await?;
        if !out.success() {
            return Err(VmError::failed(BACKEND, "virsh list", out.exit_code, out.diagnostic()));
        }
        Ok(parse_domain_list(&out.stdout)
            .into_iter()
            .map(|(name, state)| {
                let mut info = VmInfo::new(&name, BACKEND, state);
                if let Some(meta) = self.metadata(&name) {
                    apply_metadata(&mut info, &meta);
                    info.path = Some(self.paths(&name).dir);
                }
                info
            })
            .collect())
    }

    async fn info(&self, name: &str) -> Result<VmInfo> {
        let out = self.virsh_domain("dominfo", name, argv!["dominfo", name]).await?;
        let fields = parse_key_values(&out.stdout);
        let state = fields.iter().find(|(k, _)| k == "State").map(|(_, v)| map_domstate(v));
        let mut info = VmInfo::new(name, BACKEND, state.unwrap_or(VmState::Unknown));

        if let Some(meta) = self.metadata(name) {
            apply_metadata(&mut info, &meta);
            info.path = Some(self.paths(name).dir);
        }
        for (key, value) in &fields {
            match key.as_str() {
                "CPU(s)" => info.cpus = value.parse().ok().or(info.cpus),
                "Max memory" => {
                    if let Some(kib) = value.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) {
                        info.ram = Some(format_kib(kib));
                    }
                }
                _ => {}
            }
        }

        if info.state == VmState::Running {
            info.ip = self.ip(name).await.ok().flatten();
            if let Ok(out) = self.virsh(argv!["vncdisplay", name]).await {
                info.vnc_port = parse_vnc_display(&out.stdout);
            }
        }
        Ok(info)
    }

    async fn state(&self, name: &str) -> Result<VmState> {
        self.domstate(name).await
    }

    async fn ip(&self, name: &str) -> Result<Option<String>> {
        let out = self.virsh_domain("domifaddr", name, argv!["domifaddr", name]).await?;
        if let Some(ip) = parse_domifaddr(&out.stdout) {
            return Ok(Some(ip));
        }
        // Bridged guests only show up in the ARP table.
        let arp = self.virsh(argv!["domifaddr", name, "--source", "arp"]).await?;
        Ok(arp.success().then(|| parse_domifaddr(&arp.stdout)).flatten())
    }

    async fn ssh_endpoint(&self, name: &str) -> Result<SshEndpoint> {
        match self.ip(name).await? {
            Some(ip) => {
                let mut endpoint = SshEndpoint::new(ip, 22);
                endpoint.identity = self.metadata(name).and_then(|m| m.config.ssh_key);
                Ok(endpoint)
            }
            None => Err(VmError::PreconditionFailed(format!(
                "libvirt reports no address for '{name}' yet"
            ))),
        }
    }

    async fn create_snapshot(&self, vm: &str, snapshot: &str, description: Option<String>) -> Result<()> {
        if self.snapshot_names(vm, Vec::new()).await?.iter().any(|s| s == snapshot) {
            return Err(VmError::Conflict(format!(
                "snapshot '{snapshot}' already exists on vm '{vm}'"
            )));
        }

        let mut args = argv!["snapshot-create-as", vm, snapshot];
        if let Some(desc) = &description {
            args.extend(argv!["--description", desc]);
        }
        args.push("--atomic".to_string());

        let out = self.virsh(args).await?;
        if !out.success() {
            let diag = out.diagnostic();
            if diag.contains("already exists") {
                return Err(VmError::Conflict(format!(
                    "snapshot '{snapshot}' already exists on vm '{vm}'"
                )));
            }
            return Err(VmError::failed(BACKEND, "virsh snapshot-create-as", out.exit_code, diag));
        }

        let paths = self.paths(vm);
        if paths.exists() {
            let mut notes = SnapshotNotes::load(&paths.dir);
            notes.notes.insert(
                snapshot.to_string(),
                SnapshotNote {
                    description,
                    created_at: Utc::now(),
                },
            );
            notes.save(&paths.dir)?;
        }
        info!("Created snapshot {} of {}", snapshot, vm);
        Ok(())
    }

    async fn list_snapshots(&self, vm: &str) -> Result<Vec<SnapshotInfo>> {
        let out = self
            .virsh_domain("snapshot-list", vm, argv!["snapshot-list", vm, "--parent"])
            .await?;
        let notes = SnapshotNotes::load(&self.paths(vm).dir);
        Ok(parse_snapshot_table(&out.stdout)
            .into_iter()
            .map(|row| SnapshotInfo {
                vm: vm.to_string(),
                description: notes.notes.get(&row.name).and_then(|n| n.description.clone()),
                created_at: row.created_at,
                size: None,
                parent: row.parent,
                name: row.name,
            })
            .collect())
    }

    async fn revert_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        let state = self.domstate(vm).await?;
        if state.is_active() {
            return Err(VmError::PreconditionFailed(format!(
                "vm '{vm}' is {state}; stop it before reverting to '{snapshot}'"
            )));
        }
        self.require_snapshot(vm, snapshot).await?;
        self.virsh_domain("snapshot-revert", vm, argv!["snapshot-revert", vm, snapshot])
            .await?;
        info!("Reverted {} to snapshot {}", vm, snapshot);
        Ok(())
    }

    async fn delete_snapshot(&self, vm: &str, snapshot: &str) -> Result<()> {
        self.require_snapshot(vm, snapshot).await?;
        let children: Vec<String> = self
            .snapshot_names(vm, argv!["--from", snapshot])
            .await?
            .into_iter()
            .filter(|s| s != snapshot)
            .collect();
        if !children.is_empty() {
            return Err(VmError::Dependency {
                vm: vm.to_string(),
                snapshot: snapshot.to_string(),
                children,
            });
        }

        self.virsh_domain("snapshot-delete", vm, argv!["snapshot-delete", vm, snapshot])
            .await?;
        let paths = self.paths(vm);
        let mut notes = SnapshotNotes::load(&paths.dir);
        if notes.notes.remove(snapshot).is_some() {
            notes.save(&paths.dir)?;
        }
        info!("Deleted snapshot {} of {}", snapshot, vm);
        Ok(())
    }
}

fn is_daemon_unreachable(stderr: &str) -> bool {
    stderr.contains("failed to connect to the hypervisor")
        || stderr.contains("Failed to connect socket")
}

fn is_missing_domain(stderr: &str) -> bool {
    stderr.contains("failed to get domain")
        || stderr.contains("Domain not found")
        || stderr.contains("no domain with matching name")
}

fn map_domstate(state: &str) -> VmState {
    match state.trim().to_lowercase().as_str() {
        "running" | "idle" | "blocked" | "no state" => VmState::Running,
        "paused" | "pmsuspended" => VmState::Suspended,
        "shut off" => VmState::Stopped,
        "in shutdown" | "shutting down" => VmState::Stopping,
        "crashed" => VmState::Error,
        other => {
            debug!("unrecognised domain state '{}'", other);
            VmState::Unknown
        }
    }
}

/// Rows of `virsh list --all`. A row missing its state column reports
/// `Unknown` instead of being dropped.
fn parse_domain_list(output: &str) -> Vec<(String, VmState)> {
    output
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            match cols.len() {
                0 | 1 => None,
                2 => Some((cols[1].to_string(), VmState::Unknown)),
                _ => Some((cols[1].to_string(), map_domstate(&cols[2..].join(" ")))),
            }
        })
        .collect()
}

fn parse_key_values(output: &str) -> Vec<(String, String)> {
    output
        .lines()
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn parse_domifaddr(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|l| l.contains("ipv4"))
        .filter_map(|l| l.split_whitespace().last())
        .filter_map(|addr| addr.split('/').next())
        .find(|ip| !ip.is_empty())
        .map(String::from)
}

fn parse_vnc_display(output: &str) -> Option<u16> {
    let display = output.trim().rsplit(':').next()?;
    display.parse::<u16>().ok().map(|d| 5900 + d)
}

fn format_kib(kib: u64) -> String {
    let mib = kib / 1024;
    if mib >= 1024 && mib % 1024 == 0 {
        format!("{}G", mib / 1024)
    } else {
        format!("{mib}M")
    }
}

fn apply_metadata(info: &mut VmInfo, meta: &VmMetadata) {
    info.ram = Some(meta.config.ram.clone());
    info.cpus = Some(meta.config.cpus);
    info.disk_size = Some(meta.config.disk_size.clone());
    info.os_type = Some(meta.config.os_type.clone());
    info.created_at = Some(meta.created_at);
    info.last_started = meta.last_started;
}

struct SnapshotRow {
    name: String,
    created_at: Option<DateTime<Utc>>,
    parent: Option<String>,
}

/// Rows of `virsh snapshot-list <dom> --parent`:
/// `name  YYYY-MM-DD HH:MM:SS +ZZZZ  state  [parent]`.
fn parse_snapshot_table(output: &str) -> Vec<SnapshotRow> {
    output
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let name = cols.first()?.to_string();
            let created_at = (cols.len() >= 4)
                .then(|| format!("{} {} {}", cols[1], cols[2], cols[3]))
                .and_then(|ts| DateTime::parse_from_str(&ts, "%Y-%m-%d %H:%M:%S %z").ok())
                .map(|dt| dt.with_timezone(&Utc))
                .or_else(|| {
                    (cols.len() >= 3)
                        .then(|| format!("{} {}", cols[1], cols[2]))
                        .and_then(|ts| NaiveDateTime::parse_from_str(&ts, "%Y-%m-%d %H:%M:%S").ok())
                        .map(|naive| naive.and_utc())
                });
            let parent = cols.get(5).map(|p| p.to_string());
            Some(SnapshotRow {
                name,
                created_at,
                parent,
            })
        })
        .collect()
}
